//! Algebraic simplification.
//!
//! Patterns are registered in priority order; at every instruction the
//! driver applies the first one that succeeds.

mod concat;
mod conv;
mod horizontal;
mod inverse;
mod reassociate;
mod reorder;
mod split;

pub use concat::{ConcatOp, SliceConcat};
pub use conv::{AddConvs, MulConv, MulSliceConv};
pub use horizontal::HorizontalFusion;
pub use inverse::{DivConst, Rsqrt, SubConst};
pub use reassociate::{
    AddLitBroadcast, DoubleAddLitBroadcast, EliminateIdentity, InnerBroadcast, MulAdd,
};
pub use reorder::{ReorderReshapeSlice, ReorderSliceTranspose};
pub use split::SplitOps;

use crate::driver::{apply_patterns_greedily, GreedyConfig};
use crate::passes::{PassResult, ProgramPass};
use crate::pattern::{
    AddOpView, ConcatOpView, DivOpView, FrozenPatternSet, InstView, MulOpView, PatternSet,
    RecipOpView, SubOpView,
};
use crate::program::Program;
use crate::register_patterns_for_view;

pub struct SimplifyAlgebraPass {
    config: GreedyConfig,
}

impl SimplifyAlgebraPass {
    const NAME: &'static str = "simplify-algebra";

    pub fn new(config: GreedyConfig) -> Self {
        Self { config }
    }

    /// The rule catalogue in priority order.
    pub fn patterns() -> FrozenPatternSet {
        let mut patterns = PatternSet::new();
        patterns.insert_view::<AddOpView, _>(InnerBroadcast);
        patterns.insert_view::<MulOpView, _>(InnerBroadcast);
        register_patterns_for_view!(
            patterns,
            AddOpView,
            DoubleAddLitBroadcast,
            AddLitBroadcast,
            AddConvs,
        );
        patterns.insert_view::<InstView, _>(HorizontalFusion);
        register_patterns_for_view!(patterns, MulOpView, MulConv, MulSliceConv, MulAdd);
        patterns.insert_view::<DivOpView, _>(DivConst);
        patterns.insert_view::<SubOpView, _>(SubConst);
        patterns.insert_view::<RecipOpView, _>(Rsqrt);
        patterns.insert_view::<ConcatOpView, _>(ConcatOp);
        register_patterns_for_view!(
            patterns,
            InstView,
            SliceConcat,
            SplitOps,
            ReorderReshapeSlice,
            ReorderSliceTranspose,
        );
        patterns.insert_view::<AddOpView, _>(EliminateIdentity);
        patterns.insert_view::<MulOpView, _>(EliminateIdentity);
        patterns.freeze()
    }
}

impl Default for SimplifyAlgebraPass {
    fn default() -> Self {
        Self::new(GreedyConfig::default())
    }
}

impl ProgramPass for SimplifyAlgebraPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, program: &mut Program) -> PassResult {
        let patterns = Self::patterns();
        let stats = apply_patterns_greedily(program, &patterns, &self.config);
        PassResult {
            changed: stats.applied > 0 || stats.dce_removed > 0,
            iterations: stats.iterations,
            rewrites_applied: stats.applied,
            erased_insts: stats.dce_removed,
        }
    }
}
