use crate::{index::InstId, ops::Operation, rewriter::ProgramRewriter, shape::ShapeError};

/// Predicate used to restrict which operations a pattern should consider.
pub type OperationMatcher = fn(&Operation) -> bool;

/// Outcome of a rewrite attempt.
///
/// `Ok(false)` is an ordinary declination. `Err` means a shape rule rejected
/// an intermediate instruction; the driver treats it as a declination and
/// rolls back.
pub type RewriteResult = Result<bool, ShapeError>;

pub trait OperationView: Clone {
    const MATCHER: OperationMatcher;
    fn extract(root: InstId, rewriter: &ProgramRewriter) -> Option<Self>;
}

mod views;
pub use views::*;

pub mod matchers;

/// Base trait for rewrite patterns.
pub trait Pattern: Send + Sync {
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
    fn matches_operation(&self, op: &Operation) -> bool {
        let _ = op;
        true
    }
    fn benefit(&self) -> u16 {
        1
    }
    fn match_and_rewrite(&self, root: InstId, rewriter: &mut ProgramRewriter) -> RewriteResult;
}

/// Pattern over a typed view of the matched instruction.
pub trait OpRewritePattern<T> {
    fn benefit(&self) -> u16 {
        1
    }
    fn may_match(&self, _op: &T, _rewriter: &ProgramRewriter) -> bool {
        true
    }
    fn match_and_rewrite(&self, op: T, rewriter: &mut ProgramRewriter) -> RewriteResult;
}

/// Adapter converting a typed pattern into a `Pattern`.
pub struct TypedPattern<P, T> {
    pattern: P,
    matcher: OperationMatcher,
    extractor: fn(InstId, &ProgramRewriter) -> Option<T>,
}

impl<P, T> TypedPattern<P, T> {
    pub fn with_operation_matcher(
        pattern: P,
        matcher: OperationMatcher,
        extractor: fn(InstId, &ProgramRewriter) -> Option<T>,
    ) -> Self {
        Self {
            pattern,
            matcher,
            extractor,
        }
    }
}

impl<P, V> TypedPattern<P, V>
where
    V: OperationView,
{
    pub fn from_view(pattern: P) -> Self {
        Self::with_operation_matcher(pattern, V::MATCHER, V::extract)
    }
}

impl<P, T> Pattern for TypedPattern<P, T>
where
    P: OpRewritePattern<T> + Send + Sync,
    T: Send,
{
    fn name(&self) -> &'static str {
        std::any::type_name::<P>()
    }

    fn matches_operation(&self, op: &Operation) -> bool {
        (self.matcher)(op)
    }

    fn benefit(&self) -> u16 {
        self.pattern.benefit()
    }

    fn match_and_rewrite(&self, root: InstId, rewriter: &mut ProgramRewriter) -> RewriteResult {
        let Some(view) = (self.extractor)(root, rewriter) else {
            return Ok(false);
        };
        if !self.pattern.may_match(&view, rewriter) {
            return Ok(false);
        }
        self.pattern.match_and_rewrite(view, rewriter)
    }
}

/// Mutable set that collects rewrite patterns prior to freezing.
pub struct PatternSet {
    patterns: Vec<Box<dyn Pattern>>,
}

impl PatternSet {
    pub fn new() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    pub fn add<P>(&mut self, pattern: P) -> &mut Self
    where
        P: Pattern + 'static,
    {
        self.patterns.push(Box::new(pattern));
        self
    }

    pub fn insert_view<V, P>(&mut self, pattern: P) -> &mut Self
    where
        V: OperationView + Send + 'static,
        P: OpRewritePattern<V> + Send + Sync + 'static,
    {
        self.add(TypedPattern::<P, V>::from_view(pattern))
    }

    /// Freezes the set; patterns are ordered by descending benefit and keep
    /// their insertion order among equal benefits.
    pub fn freeze(mut self) -> FrozenPatternSet {
        self.patterns
            .sort_by_key(|pattern| std::cmp::Reverse(pattern.benefit()));
        FrozenPatternSet {
            patterns: self.patterns,
        }
    }
}

impl Default for PatternSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable collection of rewrite patterns ready for use by the driver.
pub struct FrozenPatternSet {
    patterns: Vec<Box<dyn Pattern>>,
}

impl FrozenPatternSet {
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn matching<'a>(
        &'a self,
        op: &'a Operation,
    ) -> impl Iterator<Item = (usize, &'a dyn Pattern)> + 'a {
        self.patterns
            .iter()
            .enumerate()
            .filter(move |(_, pattern)| pattern.matches_operation(op))
            .map(|(idx, pattern)| (idx, &**pattern))
    }
}

/// Common operation matchers.
pub mod filters {
    use crate::ops::{ElementwiseBinaryOp, ElementwiseUnaryOp, Operation};

    pub const fn any(op: &Operation) -> bool {
        let _ = op;
        true
    }

    pub fn add(op: &Operation) -> bool {
        matches!(op, Operation::ElementwiseBinary(ElementwiseBinaryOp::Add))
    }

    pub fn sub(op: &Operation) -> bool {
        matches!(op, Operation::ElementwiseBinary(ElementwiseBinaryOp::Sub))
    }

    pub fn mul(op: &Operation) -> bool {
        matches!(op, Operation::ElementwiseBinary(ElementwiseBinaryOp::Mul))
    }

    pub fn div(op: &Operation) -> bool {
        matches!(op, Operation::ElementwiseBinary(ElementwiseBinaryOp::Div))
    }

    pub fn recip(op: &Operation) -> bool {
        matches!(op, Operation::ElementwiseUnary(ElementwiseUnaryOp::Recip))
    }

    pub fn sqrt(op: &Operation) -> bool {
        matches!(op, Operation::ElementwiseUnary(ElementwiseUnaryOp::Sqrt))
    }

    pub fn concat(op: &Operation) -> bool {
        matches!(op, Operation::Concat(_))
    }
}

#[macro_export]
macro_rules! register_patterns_for_view {
    ($set:expr, $view:ty, $($pattern:expr),+ $(,)?) => {{
        $( $set.insert_view::<$view, _>($pattern); )+
    }};
}
