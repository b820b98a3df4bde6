//! Horizontal fusion of sibling `dot`/`convolution` instructions.

use crate::index::InstId;
use crate::ops::Operation;
use crate::pattern::{InstView, OpRewritePattern, RewriteResult};
use crate::program::Program;
use crate::rewriter::ProgramRewriter;

/// Instructions reading the same input through their first operand with
/// weights that only differ along the output axis are merged into one over
/// the concatenated weights; each original becomes a slice of the result.
pub struct HorizontalFusion;

/// Axis the weights are concatenated on and the output axis the fused
/// result is split on.
fn fusion_axes(program: &Program, inst: InstId) -> Option<(usize, usize)> {
    match program.op(inst) {
        Operation::Convolution(spec) if spec.group == 1 => Some((0, 1)),
        Operation::Dot => {
            let rank = program.shape(inst).rank();
            Some((rank - 1, rank - 1))
        }
        _ => None,
    }
}

fn compatible(program: &Program, lhs: InstId, rhs: InstId, axis: usize) -> bool {
    if program.op(lhs) != program.op(rhs) {
        return false;
    }
    let lhs_lens = program.shape(program.inputs(lhs)[1]).lens();
    let rhs_lens = program.shape(program.inputs(rhs)[1]).lens();
    lhs_lens.len() == rhs_lens.len()
        && lhs_lens
            .iter()
            .zip(rhs_lens)
            .enumerate()
            .all(|(idx, (a, b))| idx == axis || a == b)
}

/// Fusable consumers of `anchor`, grouped in first-use order.
fn fusion_groups(program: &Program, anchor: InstId) -> Vec<Vec<InstId>> {
    let mut groups: Vec<Vec<InstId>> = Vec::new();
    for &consumer in program.consumers(anchor) {
        let inputs = program.inputs(consumer);
        if inputs.len() != 2 || inputs[0] != anchor || inputs[1] == anchor {
            continue;
        }
        let Some((axis, _)) = fusion_axes(program, consumer) else {
            continue;
        };
        match groups
            .iter_mut()
            .find(|group| compatible(program, group[0], consumer, axis))
        {
            Some(group) => group.push(consumer),
            None => groups.push(vec![consumer]),
        }
    }
    groups.retain(|group| group.len() > 1);
    groups
}

impl HorizontalFusion {
    fn fuse(anchor: InstId, members: &[InstId], rewriter: &mut ProgramRewriter) -> RewriteResult {
        let program = rewriter.program();
        let Some((weight_axis, output_axis)) = fusion_axes(program, members[0]) else {
            return Ok(false);
        };
        let op = program.op(members[0]).clone();
        let weights: Vec<InstId> = members
            .iter()
            .map(|&member| program.inputs(member)[1])
            .collect();

        for &weight in &weights {
            if !rewriter.hoist_before(weight, anchor) {
                return Ok(false);
            }
        }
        let concat = rewriter.insert_before(anchor, Operation::concat(weight_axis), &weights)?;
        let fused = rewriter.insert_after(anchor, op, &[anchor, concat])?;

        let mut offset = 0;
        for &member in members {
            let len = rewriter.shape(member).lens()[output_axis];
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
            let slice = Operation::slice(vec![output_axis], vec![offset], vec![offset + len]);
            rewriter.replace_with(member, slice, &[fused])?;
            offset += len;
        }
        Ok(true)
    }
}

impl OpRewritePattern<InstView> for HorizontalFusion {
    fn match_and_rewrite(&self, view: InstView, rewriter: &mut ProgramRewriter) -> RewriteResult {
        let groups = fusion_groups(rewriter.program(), view.root);
        if groups.is_empty() {
            return Ok(false);
        }
        for members in &groups {
            if !Self::fuse(view.root, members, rewriter)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
