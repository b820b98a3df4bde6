use super::{filters, OperationMatcher, OperationView};
use crate::{
    index::InstId,
    ops::{ConcatSpec, Operation},
    rewriter::ProgramRewriter,
};

macro_rules! binary_view {
    ($(#[$meta:meta])* $view:ident, $matcher:path) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $view {
            pub root: InstId,
            pub lhs: InstId,
            pub rhs: InstId,
        }

        impl $view {
            pub fn new(root: InstId, rewriter: &ProgramRewriter) -> Option<Self> {
                if !$matcher(rewriter.op(root)) {
                    return None;
                }
                let [lhs, rhs] = rewriter.inputs(root) else {
                    return None;
                };
                Some(Self {
                    root,
                    lhs: *lhs,
                    rhs: *rhs,
                })
            }
        }

        impl OperationView for $view {
            const MATCHER: OperationMatcher = $matcher;

            fn extract(root: InstId, rewriter: &ProgramRewriter) -> Option<Self> {
                Self::new(root, rewriter)
            }
        }
    };
}

binary_view!(AddOpView, filters::add);
binary_view!(SubOpView, filters::sub);
binary_view!(MulOpView, filters::mul);
binary_view!(DivOpView, filters::div);

#[derive(Clone)]
pub struct RecipOpView {
    pub root: InstId,
    pub input: InstId,
}

impl RecipOpView {
    pub fn new(root: InstId, rewriter: &ProgramRewriter) -> Option<Self> {
        if !filters::recip(rewriter.op(root)) {
            return None;
        }
        let [input] = rewriter.inputs(root) else {
            return None;
        };
        Some(Self {
            root,
            input: *input,
        })
    }
}

impl OperationView for RecipOpView {
    const MATCHER: OperationMatcher = filters::recip;

    fn extract(root: InstId, rewriter: &ProgramRewriter) -> Option<Self> {
        Self::new(root, rewriter)
    }
}

#[derive(Clone)]
pub struct ConcatOpView {
    pub root: InstId,
    pub inputs: Vec<InstId>,
    pub spec: ConcatSpec,
}

impl ConcatOpView {
    pub fn new(root: InstId, rewriter: &ProgramRewriter) -> Option<Self> {
        match rewriter.op(root) {
            Operation::Concat(spec) => Some(Self {
                root,
                inputs: rewriter.inputs(root).to_vec(),
                spec: spec.clone(),
            }),
            _ => None,
        }
    }
}

impl OperationView for ConcatOpView {
    const MATCHER: OperationMatcher = filters::concat;

    fn extract(root: InstId, rewriter: &ProgramRewriter) -> Option<Self> {
        Self::new(root, rewriter)
    }
}

/// Any instruction; used by patterns anchored on a value shared by
/// several consumers.
#[derive(Clone)]
pub struct InstView {
    pub root: InstId,
}

impl OperationView for InstView {
    const MATCHER: OperationMatcher = filters::any;

    fn extract(root: InstId, _rewriter: &ProgramRewriter) -> Option<Self> {
        Some(Self { root })
    }
}
