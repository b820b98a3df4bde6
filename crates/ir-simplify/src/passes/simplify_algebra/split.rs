//! Hoists pointwise work above a split.

use std::collections::HashSet;

use crate::index::InstId;
use crate::ops::Operation;
use crate::pattern::matchers::{is_constant, single_split_axis, splits};
use crate::pattern::{InstView, OpRewritePattern, RewriteResult};
use crate::program::Program;
use crate::rewriter::ProgramRewriter;

/// When every slice of a split feeds the same pointwise operator, the
/// operator runs once on the unsplit value and the slices are taken from
/// its result.
///
/// Binary operators need a constant second operand per slice; those are
/// concatenated along the split axis.
pub struct SplitOps;

struct Group {
    members: Vec<InstId>,
    /// Operand position the slices occupy in each member.
    operand: usize,
}

/// First consumer of the leading slice that has a counterpart of the same
/// operator, reading its slice at the same operand position, on every other
/// slice.
fn find_group(program: &Program, splits: &[InstId]) -> Option<Group> {
    let leading = splits[0];
    for &candidate in program.consumers(leading) {
        let op = program.op(candidate);
        if !op.is_elementwise() {
            continue;
        }
        let Some(operand) = program
            .inputs(candidate)
            .iter()
            .position(|&input| input == leading)
        else {
            continue;
        };
        let mut members = vec![candidate];
        for &split in &splits[1..] {
            let counterpart = program.consumers(split).iter().copied().find(|&consumer| {
                program.op(consumer) == op && program.inputs(consumer).get(operand) == Some(&split)
            });
            match counterpart {
                Some(member) => members.push(member),
                None => break,
            }
        }
        if members.len() != splits.len() {
            continue;
        }
        let mut seen = HashSet::new();
        if !members.iter().all(|member| seen.insert(*member)) {
            continue;
        }
        if op.arity() == Some(2) && !constant_operands(program, &members, operand) {
            continue;
        }
        return Some(Group { members, operand });
    }
    None
}

fn constant_operands(program: &Program, members: &[InstId], operand: usize) -> bool {
    members
        .iter()
        .all(|&member| is_constant(program, program.inputs(member)[1 - operand]))
}

impl OpRewritePattern<InstView> for SplitOps {
    fn match_and_rewrite(&self, view: InstView, rewriter: &mut ProgramRewriter) -> RewriteResult {
        let program = rewriter.program();
        let Some(splits) = splits(program, view.root) else {
            return Ok(false);
        };
        let Some(Group { members, operand }) = find_group(program, &splits) else {
            return Ok(false);
        };
        let op = program.op(members[0]).clone();
        let slices: Vec<Operation> = splits
            .iter()
            .map(|&split| program.op(split).clone())
            .collect();

        let input = view.root;
        let fused = if op.arity() == Some(1) {
            rewriter.insert_after(input, op, &[input])?
        } else {
            let Some(axis) = single_split_axis(program, &splits) else {
                return Ok(false);
            };
            let data: Vec<InstId> = members
                .iter()
                .map(|&member| program.inputs(member)[1 - operand])
                .collect();
            for &value in &data {
                if !rewriter.hoist_before(value, input) {
                    return Ok(false);
                }
            }
            let joined = rewriter.insert_before(input, Operation::concat(axis), &data)?;
            let mut args = [joined; 2];
            args[operand] = input;
            rewriter.insert_after(input, op, &args)?
        };

        for (member, slice) in members.into_iter().zip(slices) {
            let reshapes: Vec<InstId> = rewriter
                .consumers(member)
                .iter()
                .copied()
                .filter(|&consumer| matches!(rewriter.op(consumer), Operation::Reshape(_)))
                .collect();
            for reshape in reshapes {
                let packed = rewriter.insert_before(reshape, Operation::Contiguous, &[member])?;
                rewriter.replace_argument(reshape, member, packed)?;
            }
            rewriter.replace_with(member, slice, &[fused])?;
        }
        Ok(true)
    }
}
