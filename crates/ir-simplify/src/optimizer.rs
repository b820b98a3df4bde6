//! Entry points that run passes over a program.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::driver::GreedyConfig;
use crate::passes::{ConstantPropagationPass, DeadCodeEliminationPass, SimplifyAlgebraPass};
use crate::pipeline::{Pipeline, PipelineBuilder};
use crate::program::Program;

pub use crate::passes::{PassResult, ProgramPass};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizeConfig {
    /// Settings of the greedy driver behind algebraic simplification.
    pub greedy: GreedyConfig,
    /// Evaluate instructions whose inputs are all literals.
    pub fold_constants: bool,
    /// Rounds of the simplify/fold/DCE fixed point.
    pub pipeline_max_iters: usize,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            greedy: GreedyConfig::default(),
            fold_constants: true,
            pipeline_max_iters: 4,
        }
    }
}

/// Runs `passes` once each, in order.
pub fn run_passes(program: &mut Program, passes: &[&dyn ProgramPass]) -> PassResult {
    let mut result = PassResult::default();
    for pass in passes {
        let stats = pass.run(program);
        log::debug!(
            "{}: changed={} rewrites={} erased={}",
            pass.name(),
            stats.changed,
            stats.rewrites_applied,
            stats.erased_insts
        );
        result = result.merge(stats);
    }
    result
}

/// Algebraic simplification followed by dead code elimination.
pub fn simplify_algebra(program: &mut Program) -> PassResult {
    run_passes(
        program,
        &[&SimplifyAlgebraPass::default(), &DeadCodeEliminationPass],
    )
}

pub fn default_pipeline(cfg: &OptimizeConfig) -> Pipeline {
    let mut builder = PipelineBuilder::new();
    builder.fixed_point(cfg.pipeline_max_iters, |p| {
        p.pass(Arc::new(SimplifyAlgebraPass::new(cfg.greedy.clone())));
        if cfg.fold_constants {
            p.pass(Arc::new(ConstantPropagationPass));
        }
        p.pass(Arc::new(DeadCodeEliminationPass));
    });
    builder.finish()
}

pub fn optimize(program: &mut Program, cfg: &OptimizeConfig) -> PassResult {
    default_pipeline(cfg).run(program)
}
