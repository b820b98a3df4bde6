//! Program-level passes.

pub mod constant_propagation;
pub mod dce;
pub mod simplify_algebra;

pub use constant_propagation::ConstantPropagationPass;
pub use dce::DeadCodeEliminationPass;
pub use simplify_algebra::SimplifyAlgebraPass;

use crate::program::Program;

/// Result returned by a [`ProgramPass`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the program.
    pub changed: bool,
    /// Number of sweeps executed while applying the pass.
    pub iterations: usize,
    /// Total number of patterns applied by the pass.
    pub rewrites_applied: usize,
    /// Instructions removed by the pass.
    pub erased_insts: usize,
}

impl PassResult {
    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            iterations: self.iterations + other.iterations,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            erased_insts: self.erased_insts + other.erased_insts,
        }
    }
}

/// Transformation over a whole program.
pub trait ProgramPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, program: &mut Program) -> PassResult;
}
