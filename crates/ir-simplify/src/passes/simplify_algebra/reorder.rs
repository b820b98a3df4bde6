//! Moves layout operators applied to every slice of a split above the split.

use crate::index::InstId;
use crate::ops::Operation;
use crate::pattern::matchers::{single_split_axis, slice_spec, splits, used_once};
use crate::pattern::{InstView, OpRewritePattern, RewriteResult};
use crate::program::Program;
use crate::rewriter::ProgramRewriter;

/// The only consumer of `inst` when it has exactly one.
fn sole_consumer(program: &Program, inst: InstId) -> Option<InstId> {
    used_once(program, inst).then(|| program.consumers(inst)[0])
}

/// `reshape(contiguous(slice_i(x)))` with the same target dimensions for
/// every slice becomes `slice_i(reshape(x))` on the axis of the reshaped
/// value that spans exactly one slice.
pub struct ReorderReshapeSlice;

impl ReorderReshapeSlice {
    fn reshapes(program: &Program, splits: &[InstId]) -> Option<Vec<InstId>> {
        splits
            .iter()
            .map(|&split| {
                let packed = sole_consumer(program, split)?;
                if !matches!(program.op(packed), Operation::Contiguous) {
                    return None;
                }
                let reshape = sole_consumer(program, packed)?;
                matches!(program.op(reshape), Operation::Reshape(_)).then_some(reshape)
            })
            .collect()
    }
}

impl OpRewritePattern<InstView> for ReorderReshapeSlice {
    fn match_and_rewrite(&self, view: InstView, rewriter: &mut ProgramRewriter) -> RewriteResult {
        let program = rewriter.program();
        let Some(splits) = splits(program, view.root) else {
            return Ok(false);
        };
        let Some(axis) = single_split_axis(program, &splits) else {
            return Ok(false);
        };
        let Some(reshapes) = Self::reshapes(program, &splits) else {
            return Ok(false);
        };
        let dims = program.shape(reshapes[0]).lens().to_vec();
        if reshapes
            .iter()
            .any(|&reshape| program.shape(reshape).lens() != dims.as_slice())
        {
            return Ok(false);
        }

        let block =
            |split: InstId| -> usize { program.shape(split).lens()[axis..].iter().product() };
        let chunk = block(splits[0]);
        if splits.iter().any(|&split| block(split) != chunk) {
            return Ok(false);
        }
        let Some(new_axis) = (0..dims.len()).find(|&k| dims[k..].iter().product::<usize>() == chunk)
        else {
            return Ok(false);
        };
        let width = dims[new_axis];
        let mut joined = dims.clone();
        joined[new_axis] = width * splits.len();
        let standard = program.shape(view.root).is_standard();

        let mut source = view.root;
        if !standard {
            source = rewriter.insert_after(source, Operation::Contiguous, &[source])?;
        }
        let dims: Vec<i64> = joined.iter().map(|&len| len as i64).collect();
        let reshaped = rewriter.insert_after(source, Operation::reshape(dims), &[source])?;
        for (idx, reshape) in reshapes.into_iter().enumerate() {
            let (start, end) = (idx * width, (idx + 1) * width);
            let slice = Operation::slice(vec![new_axis], vec![start], vec![end]);
            rewriter.replace_with(reshape, slice, &[reshaped])?;
        }
        Ok(true)
    }
}

/// `transpose(slice_i(x))` with one permutation for every slice becomes
/// `slice_i(transpose(x))` on the permuted axis.
pub struct ReorderSliceTranspose;

impl OpRewritePattern<InstView> for ReorderSliceTranspose {
    fn match_and_rewrite(&self, view: InstView, rewriter: &mut ProgramRewriter) -> RewriteResult {
        let program = rewriter.program();
        let Some(splits) = splits(program, view.root) else {
            return Ok(false);
        };
        let Some(axis) = single_split_axis(program, &splits) else {
            return Ok(false);
        };
        let mut perm: Option<&[usize]> = None;
        let mut plan = Vec::with_capacity(splits.len());
        for &split in &splits {
            let Some(transpose) = sole_consumer(program, split) else {
                return Ok(false);
            };
            let Operation::Transpose(spec) = program.op(transpose) else {
                return Ok(false);
            };
            if *perm.get_or_insert(&spec.perm) != spec.perm.as_slice() {
                return Ok(false);
            }
            let Some((start, end)) = slice_spec(program, split).and_then(|spec| spec.range_on(axis))
            else {
                return Ok(false);
            };
            plan.push((transpose, start, end));
        }
        let Some(perm) = perm.map(<[usize]>::to_vec) else {
            return Ok(false);
        };
        let Some(new_axis) = perm.iter().position(|&source| source == axis) else {
            return Ok(false);
        };

        let transposed = rewriter.insert_after(view.root, Operation::transpose(perm), &[view.root])?;
        for (transpose, start, end) in plan {
            let slice = Operation::slice(vec![new_axis], vec![start], vec![end]);
            rewriter.replace_with(transpose, slice, &[transposed])?;
        }
        Ok(true)
    }
}
