use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::{
    index::InstId, passes::dce::eliminate_dead_code, pattern::FrozenPatternSet, program::Program,
    rewriter::ProgramRewriter,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GreedyConfig {
    /// Upper bound on full sweeps over the program. Reaching it stops the
    /// driver silently.
    pub max_iterations: usize,
    /// Remove dead instructions after every sweep.
    pub enable_dce: bool,
}

impl Default for GreedyConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            enable_dce: true,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GreedyRewriteStats {
    /// Sweeps executed, including the final one that found nothing to do.
    pub iterations: usize,
    pub applied: usize,
    pub dce_removed: usize,
    /// A sweep finished without applying any pattern or removing any dead
    /// instruction.
    pub converged: bool,
}

/// Sweeps the program in order, applying the first matching pattern at each
/// instruction, until a sweep leaves the program untouched or
/// `max_iterations` is reached.
///
/// Instructions created or rewired during a sweep are revisited by the next
/// one. Dead code is dropped between sweeps so that use counts seen by the
/// patterns are exact, and a sweep whose cleanup removed anything is followed
/// by another, since fewer consumers can unblock a match.
pub fn apply_patterns_greedily(
    program: &mut Program,
    patterns: &FrozenPatternSet,
    cfg: &GreedyConfig,
) -> GreedyRewriteStats {
    let mut stats = GreedyRewriteStats::default();
    if patterns.is_empty() {
        stats.converged = true;
        return stats;
    }

    let mut worklist = VecDeque::new();
    while stats.iterations < cfg.max_iterations {
        stats.iterations += 1;
        seed_worklist(program, &mut worklist);

        let mut applied = 0usize;
        while let Some(inst) = worklist.pop_front() {
            if !program.contains(inst) {
                continue;
            }
            if apply_first_match(program, patterns, inst) {
                applied += 1;
            }
        }
        stats.applied += applied;

        let removed = if cfg.enable_dce {
            eliminate_dead_code(program)
        } else {
            0
        };
        stats.dce_removed += removed;
        log::debug!(
            "sweep {}: {} rewrites, {} dead instructions removed, {} remain",
            stats.iterations,
            applied,
            removed,
            program.len()
        );

        if applied == 0 && removed == 0 {
            stats.converged = true;
            break;
        }
    }

    if !stats.converged {
        log::debug!(
            "stopped after {} sweeps without reaching a fixpoint",
            stats.iterations
        );
    }
    stats
}

fn seed_worklist(program: &Program, worklist: &mut VecDeque<InstId>) {
    worklist.clear();
    worklist.extend(program.ids());
}

fn apply_first_match(program: &mut Program, patterns: &FrozenPatternSet, inst: InstId) -> bool {
    let op = program.op(inst).clone();
    for (_, pattern) in patterns.matching(&op) {
        let mut rewriter = ProgramRewriter::new(program);
        match pattern.match_and_rewrite(inst, &mut rewriter) {
            Ok(true) => {
                debug_assert!(rewriter.verify(), "{} broke the program", pattern.name());
                let touched = rewriter.commit();
                log::trace!("{} rewrote {inst}, touching {touched:?}", pattern.name());
                return true;
            }
            Ok(false) => rewriter.rollback(),
            Err(err) => {
                log::trace!("{} declined at {inst}: {err}", pattern.name());
                rewriter.rollback();
            }
        }
    }
    false
}
