//! Rules centred on `concat`.

use crate::index::InstId;
use crate::ops::Operation;
use crate::pattern::matchers::{single_split_axis, splits, used_once};
use crate::pattern::{ConcatOpView, InstView, OpRewritePattern, RewriteResult};
use crate::program::Program;
use crate::rewriter::ProgramRewriter;
use crate::shape::ShapeError;

/// Moves a pointwise or broadcast operator applied to consecutive
/// concatenation operands after the concatenation:
/// `concat(relu(a), relu(b))` becomes `relu(concat(a, b))`.
///
/// Broadcasts are only hoisted when they expand along the concatenation
/// axis; their inputs are then joined on axis 0.
pub struct ConcatOp;

fn hoistable(program: &Program, inst: InstId, axis: usize) -> bool {
    let op = program.op(inst);
    let pointwise = match op {
        Operation::Broadcast(spec) => spec.axis == axis,
        op => op.is_elementwise(),
    };
    pointwise && matches!(op.arity(), Some(1 | 2)) && used_once(program, inst)
}

fn joins(program: &Program, head: InstId, inst: InstId, axis: usize) -> bool {
    hoistable(program, head, axis)
        && hoistable(program, inst, axis)
        && program.op(head) == program.op(inst)
}

enum Operand {
    Keep(InstId),
    Hoist(Vec<InstId>),
}

/// Splits the concatenation operands into runs of hoistable instructions
/// sharing an operator.
fn plan(program: &Program, inputs: &[InstId], axis: usize) -> Vec<Operand> {
    let mut runs: Vec<Vec<InstId>> = Vec::new();
    for &input in inputs {
        match runs.last_mut() {
            Some(run) if joins(program, run[0], input, axis) => run.push(input),
            _ => runs.push(vec![input]),
        }
    }
    runs.into_iter()
        .map(|run| match run.as_slice() {
            [single] => Operand::Keep(*single),
            _ => Operand::Hoist(run),
        })
        .collect()
}

impl ConcatOp {
    /// Emits `op(concat(..))` for one run and returns it.
    fn hoist(
        root: InstId,
        axis: usize,
        run: &[InstId],
        rewriter: &mut ProgramRewriter,
    ) -> Result<InstId, ShapeError> {
        let op = rewriter.op(run[0]).clone();
        let arity = rewriter.inputs(run[0]).len();
        let (inner_axis, op) = match op {
            Operation::Broadcast(mut spec) => {
                spec.out_lens[axis] = run
                    .iter()
                    .map(|&member| rewriter.shape(member).lens()[axis])
                    .sum();
                (0, Operation::Broadcast(spec))
            }
            op => (axis, op),
        };

        let mut args = Vec::with_capacity(arity);
        for operand in 0..arity {
            let parts: Vec<InstId> = run
                .iter()
                .map(|&member| rewriter.inputs(member)[operand])
                .collect();
            args.push(rewriter.insert_before(root, Operation::concat(inner_axis), &parts)?);
        }
        rewriter.insert_before(root, op, &args)
    }
}

impl OpRewritePattern<ConcatOpView> for ConcatOp {
    fn match_and_rewrite(&self, view: ConcatOpView, rewriter: &mut ProgramRewriter) -> RewriteResult {
        let axis = view.spec.axis;
        let operands = plan(rewriter.program(), &view.inputs, axis);
        if operands
            .iter()
            .all(|operand| matches!(operand, Operand::Keep(_)))
        {
            return Ok(false);
        }

        let mut args = Vec::with_capacity(operands.len());
        for operand in operands {
            match operand {
                Operand::Keep(inst) => args.push(inst),
                Operand::Hoist(run) => args.push(Self::hoist(view.root, axis, &run, rewriter)?),
            }
        }
        if let [single] = args.as_slice() {
            rewriter.replace_all_uses(view.root, *single)?;
        } else {
            rewriter.replace_with(view.root, Operation::concat(axis), &args)?;
        }
        Ok(true)
    }
}

/// A value that is split and immediately concatenated back in order along
/// the same axis: the slices are replaced by the value itself.
pub struct SliceConcat;

impl OpRewritePattern<InstView> for SliceConcat {
    fn match_and_rewrite(&self, view: InstView, rewriter: &mut ProgramRewriter) -> RewriteResult {
        let program = rewriter.program();
        let Some(splits) = splits(program, view.root) else {
            return Ok(false);
        };
        let Some(axis) = single_split_axis(program, &splits) else {
            return Ok(false);
        };
        let [concat] = program.consumers(splits[0]) else {
            return Ok(false);
        };
        let concat = *concat;
        match program.op(concat) {
            Operation::Concat(spec) if spec.axis == axis => {}
            _ => return Ok(false),
        }
        if splits
            .iter()
            .any(|&split| program.consumers(split) != [concat] || program.is_output(split))
        {
            return Ok(false);
        }

        let inputs = program.inputs(concat);
        let Some(start) = inputs.iter().position(|&input| input == splits[0]) else {
            return Ok(false);
        };
        let end = start + splits.len();
        if inputs.get(start..end) != Some(splits.as_slice()) {
            return Ok(false);
        }
        let mut args = inputs[..start].to_vec();
        args.push(view.root);
        args.extend_from_slice(&inputs[end..]);

        if args.len() == 1 {
            rewriter.replace_all_uses(concat, view.root)?;
        } else {
            rewriter.replace_with(concat, Operation::concat(axis), &args)?;
        }
        Ok(true)
    }
}
