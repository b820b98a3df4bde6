use std::sync::Arc;

use crate::passes::{PassResult, ProgramPass};
use crate::program::Program;

pub enum Step {
    Pass(Arc<dyn ProgramPass>),
    FixedPoint { max_iters: usize, steps: Vec<Step> },
}

pub struct PipelineBuilder {
    steps: Vec<Step>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn pass(&mut self, pass: Arc<dyn ProgramPass>) {
        self.steps.push(Step::Pass(pass));
    }

    /// Appends a group of steps that is rerun until none of them changes the
    /// program, at most `max_iters` times.
    pub fn fixed_point<F>(&mut self, max_iters: usize, build: F)
    where
        F: FnOnce(&mut PipelineBuilder),
    {
        let mut inner = PipelineBuilder::new();
        build(&mut inner);
        self.steps.push(Step::FixedPoint {
            max_iters: max_iters.max(1),
            steps: inner.steps,
        });
    }

    pub fn finish(self) -> Pipeline {
        Pipeline { steps: self.steps }
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An ordered list of passes and bounded fixed points.
pub struct Pipeline {
    steps: Vec<Step>,
}

impl Pipeline {
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn run(&self, program: &mut Program) -> PassResult {
        let mut result = PassResult::default();
        run_steps(&self.steps, program, &mut result);
        result
    }
}

fn run_steps(steps: &[Step], program: &mut Program, totals: &mut PassResult) -> bool {
    let mut changed_any = false;
    for step in steps {
        match step {
            Step::Pass(pass) => {
                let stats = pass.run(program);
                log::debug!(
                    "{}: changed={} iterations={} rewrites={} erased={} len={}",
                    pass.name(),
                    stats.changed,
                    stats.iterations,
                    stats.rewrites_applied,
                    stats.erased_insts,
                    program.len()
                );
                changed_any |= stats.changed;
                *totals = totals.merge(stats);
            }
            Step::FixedPoint { max_iters, steps } => {
                let mut iter = 0usize;
                loop {
                    if iter >= *max_iters {
                        log::debug!("fixed point not reached after {iter} rounds");
                        break;
                    }
                    iter += 1;
                    let mut local = PassResult::default();
                    let changed = run_steps(steps, program, &mut local);
                    *totals = totals.merge(local);
                    changed_any |= changed;
                    if !changed {
                        break;
                    }
                }
            }
        }
    }
    changed_any
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Reports a change on its first `budget` runs.
    struct Countdown {
        budget: usize,
        runs: AtomicUsize,
    }

    impl ProgramPass for Countdown {
        fn name(&self) -> &'static str {
            "countdown"
        }

        fn run(&self, _program: &mut Program) -> PassResult {
            let run = self.runs.fetch_add(1, Ordering::Relaxed);
            PassResult {
                changed: run < self.budget,
                iterations: 1,
                ..PassResult::default()
            }
        }
    }

    fn countdown(budget: usize) -> Arc<Countdown> {
        Arc::new(Countdown {
            budget,
            runs: AtomicUsize::new(0),
        })
    }

    #[test]
    fn fixed_point_stops_once_nothing_changes() {
        let pass = countdown(2);
        let mut builder = PipelineBuilder::new();
        let step = pass.clone();
        builder.fixed_point(10, move |p| p.pass(step));
        let result = builder.finish().run(&mut Program::new());
        assert_eq!(pass.runs.load(Ordering::Relaxed), 3);
        assert!(result.changed);
        assert_eq!(result.iterations, 3);
    }

    #[test]
    fn fixed_point_respects_round_cap() {
        let pass = countdown(usize::MAX);
        let mut builder = PipelineBuilder::new();
        let step = pass.clone();
        builder.fixed_point(4, move |p| p.pass(step));
        builder.finish().run(&mut Program::new());
        assert_eq!(pass.runs.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn zero_round_cap_still_runs_once() {
        let pass = countdown(0);
        let mut builder = PipelineBuilder::new();
        let step = pass.clone();
        builder.fixed_point(0, move |p| p.pass(step));
        let pipeline = builder.finish();
        assert_eq!(pipeline.steps().len(), 1);
        let result = pipeline.run(&mut Program::new());
        assert_eq!(pass.runs.load(Ordering::Relaxed), 1);
        assert!(!result.changed);
    }
}
