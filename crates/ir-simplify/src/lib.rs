//! Algebraic simplification for a dataflow tensor IR.
//!
//! A [`Program`] is an ordered arena of instructions; passes rewrite it in
//! place through [`ProgramRewriter`] and the greedy pattern driver.

pub mod driver;
pub mod index;
pub mod literal;
pub mod ops;
pub mod optimizer;
pub mod passes;
pub mod pattern;
pub mod pipeline;
pub mod program;
pub mod rewriter;
pub mod shape;

pub use driver::{apply_patterns_greedily, GreedyConfig, GreedyRewriteStats};
pub use index::InstId;
pub use literal::{generate_literal, Element, Literal};
pub use ops::{EvalError, Operation};
pub use optimizer::{optimize, run_passes, simplify_algebra, OptimizeConfig};
pub use passes::{
    ConstantPropagationPass, DeadCodeEliminationPass, PassResult, ProgramPass,
    SimplifyAlgebraPass,
};
pub use program::{Instruction, Program, ProgramError};
pub use rewriter::ProgramRewriter;
pub use shape::{DType, Shape, ShapeError};
