//! Rules that fold arithmetic on convolution outputs into the weights.

use crate::index::InstId;
use crate::ops::{ConvolutionSpec, Operation};
use crate::pattern::matchers::{
    broadcast_spec, conv_with_constant_weights, convolution_spec, either_arg, is_constant,
    slice_spec, used_once,
};
use crate::pattern::{AddOpView, MulOpView, OpRewritePattern, RewriteResult};
use crate::program::Program;
use crate::rewriter::ProgramRewriter;
use crate::shape::Shape;

/// The rank-1 constant scaled over the channel axis by a
/// `broadcast[axis=1]`.
fn channel_scale(program: &Program, inst: InstId) -> Option<InstId> {
    let spec = broadcast_spec(program, inst)?;
    let input = program.inputs(inst)[0];
    (spec.axis == 1 && program.shape(input).rank() == 1 && is_constant(program, input))
        .then_some(input)
}

/// `mul(conv(x, w), broadcast[axis=1](a))` becomes
/// `conv(x, mul(broadcast[axis=0](a), w))`.
pub struct MulConv;

impl OpRewritePattern<MulOpView> for MulConv {
    fn match_and_rewrite(&self, view: MulOpView, rewriter: &mut ProgramRewriter) -> RewriteResult {
        let program = rewriter.program();
        let Some((conv, scale)) = either_arg(
            program,
            view.root,
            |inst| conv_with_constant_weights(program, inst),
            |inst| channel_scale(program, inst).is_some(),
        ) else {
            return Ok(false);
        };
        let Some(a) = channel_scale(program, scale) else {
            return Ok(false);
        };
        let op = program.op(conv).clone();
        let [x, w] = [program.inputs(conv)[0], program.inputs(conv)[1]];
        let w_lens = program.shape(w).lens().to_vec();

        let new_a = rewriter.insert_before(view.root, Operation::broadcast(0, w_lens), &[a])?;
        let new_w = rewriter.insert_before(view.root, Operation::mul(), &[new_a, w])?;
        let new_conv = rewriter.insert_before(view.root, op, &[x, new_w])?;
        rewriter.replace_all_uses(view.root, new_conv)?;
        Ok(true)
    }
}

/// Scales one output-channel slice of a convolution through its weights:
/// `mul(slice[axis=1](conv(x, w)), broadcast[axis=1](a))` scales the matching
/// rows of `w` instead, and every other slice of the convolution reads the
/// rebuilt one.
pub struct MulSliceConv;

impl MulSliceConv {
    /// The sliced convolution if it only feeds disjoint channel slices.
    fn sliced_conv(program: &Program, slice: InstId) -> Option<InstId> {
        let spec = slice_spec(program, slice)?;
        if spec.axes != [1] || !used_once(program, slice) {
            return None;
        }
        let conv = program.inputs(slice)[0];
        let conv_spec = convolution_spec(program, conv)?;
        if conv_spec.group != 1 || !is_constant(program, program.inputs(conv)[1]) {
            return None;
        }
        let mut ranges = Vec::new();
        for &consumer in program.consumers(conv) {
            let spec = slice_spec(program, consumer)?;
            if spec.axes != [1] {
                return None;
            }
            ranges.push((spec.starts[0], spec.ends[0]));
        }
        ranges.sort_unstable();
        if ranges.windows(2).any(|pair| pair[0].1 > pair[1].0) {
            return None;
        }
        Some(conv)
    }
}

impl OpRewritePattern<MulOpView> for MulSliceConv {
    fn match_and_rewrite(&self, view: MulOpView, rewriter: &mut ProgramRewriter) -> RewriteResult {
        let program = rewriter.program();
        let Some((slice, scale)) = either_arg(
            program,
            view.root,
            |inst| Self::sliced_conv(program, inst).is_some(),
            |inst| channel_scale(program, inst).is_some(),
        ) else {
            return Ok(false);
        };
        let (Some(conv), Some(a)) = (
            Self::sliced_conv(program, slice),
            channel_scale(program, scale),
        ) else {
            return Ok(false);
        };
        let slice_op = program.op(slice).clone();
        let Some((start, end)) = slice_spec(program, slice).and_then(|spec| spec.range_on(1))
        else {
            return Ok(false);
        };
        let conv_op = program.op(conv).clone();
        let [x, w] = [program.inputs(conv)[0], program.inputs(conv)[1]];
        let channels = program.shape(w).lens()[0];
        let siblings: Vec<InstId> = program
            .consumers(conv)
            .iter()
            .copied()
            .filter(|&consumer| consumer != slice)
            .collect();

        let root = view.root;
        let w_slice =
            rewriter.insert_before(root, Operation::slice(vec![0], vec![start], vec![end]), &[w])?;
        let w_slice_lens = rewriter.shape(w_slice).lens().to_vec();
        let new_a = rewriter.insert_before(root, Operation::broadcast(0, w_slice_lens), &[a])?;
        let scaled = rewriter.insert_before(root, Operation::mul(), &[new_a, w_slice])?;

        let mut parts = Vec::with_capacity(3);
        if start != 0 {
            parts.push(rewriter.insert_before(
                root,
                Operation::slice(vec![0], vec![0], vec![start]),
                &[w],
            )?);
        }
        parts.push(scaled);
        if end != channels {
            parts.push(rewriter.insert_before(
                root,
                Operation::slice(vec![0], vec![end], vec![channels]),
                &[w],
            )?);
        }
        let new_w = rewriter.insert_before(root, Operation::concat(0), &parts)?;
        let new_conv = rewriter.insert_before(root, conv_op, &[x, new_w])?;
        let new_slice = rewriter.insert_before(root, slice_op, &[new_conv])?;
        rewriter.replace_all_uses(root, new_slice)?;

        for sibling in siblings {
            if !rewriter.hoist_before(new_conv, sibling) {
                return Ok(false);
            }
            rewriter.replace_argument(sibling, conv, new_conv)?;
        }
        Ok(true)
    }
}

/// `add(conv(x, w), conv(y, v))` becomes one convolution over the channel
/// concatenation of the inputs and of the weights.
///
/// Convolutions whose only difference is a 1x1 stride are merged by
/// subsampling the input of the larger stride with an `as_shape` view.
pub struct AddConvs;

impl AddConvs {
    /// Spec of the merged convolution and, when the strides differ, the
    /// subsampled view of the wider-strided input (`true` for the left one).
    fn merge_specs(
        program: &Program,
        lhs: InstId,
        rhs: InstId,
    ) -> Option<(ConvolutionSpec, Option<(bool, Shape)>)> {
        let lhs_spec = convolution_spec(program, lhs)?;
        let rhs_spec = convolution_spec(program, rhs)?;
        if lhs_spec.group != 1 || rhs_spec.group != 1 {
            return None;
        }
        if lhs_spec == rhs_spec {
            return Some((lhs_spec.clone(), None));
        }
        if lhs_spec.padding != [0, 0]
            || rhs_spec.padding != [0, 0]
            || lhs_spec.dilation != rhs_spec.dilation
        {
            return None;
        }
        let kernel = &program.shape(program.inputs(lhs)[1]).lens()[2..];
        if kernel != [1, 1] {
            return None;
        }
        let [lhs_stride, lhs_stride_w] = lhs_spec.stride;
        let [rhs_stride, rhs_stride_w] = rhs_spec.stride;
        if lhs_stride != lhs_stride_w || rhs_stride != rhs_stride_w {
            return None;
        }
        if lhs_stride.max(rhs_stride) % lhs_stride.min(rhs_stride) != 0 {
            return None;
        }
        let (wide_is_lhs, narrow_spec, factor) = if lhs_stride > rhs_stride {
            (true, rhs_spec, lhs_stride / rhs_stride)
        } else {
            (false, lhs_spec, rhs_stride / lhs_stride)
        };
        let wide = if wide_is_lhs { lhs } else { rhs };
        let view = subsample(program.shape(program.inputs(wide)[0]), factor)?;
        Some((narrow_spec.clone(), Some((wide_is_lhs, view))))
    }
}

/// Every `factor`-th pixel of a standard NCHW shape.
fn subsample(shape: &Shape, factor: usize) -> Option<Shape> {
    if !shape.is_standard() || shape.rank() != 4 {
        return None;
    }
    let lens = shape.lens();
    let strides = shape.strides();
    Shape::with_strides(
        shape.dtype(),
        vec![
            lens[0],
            lens[1],
            (lens[2] - 1) / factor + 1,
            (lens[3] - 1) / factor + 1,
        ],
        vec![strides[0], strides[1], strides[2] * factor, strides[3] * factor],
    )
    .ok()
}

impl OpRewritePattern<AddOpView> for AddConvs {
    fn match_and_rewrite(&self, view: AddOpView, rewriter: &mut ProgramRewriter) -> RewriteResult {
        let program = rewriter.program();
        if !conv_with_constant_weights(program, view.lhs)
            || !conv_with_constant_weights(program, view.rhs)
        {
            return Ok(false);
        }
        let [x, w] = [program.inputs(view.lhs)[0], program.inputs(view.lhs)[1]];
        let [y, v] = [program.inputs(view.rhs)[0], program.inputs(view.rhs)[1]];
        if program.shape(w).lens() != program.shape(v).lens() {
            return Ok(false);
        }
        let Some((spec, subsampled)) = Self::merge_specs(program, view.lhs, view.rhs) else {
            return Ok(false);
        };

        let (mut x, mut y) = (x, y);
        if let Some((wide_is_lhs, shape)) = subsampled {
            let wide = if wide_is_lhs { &mut x } else { &mut y };
            *wide = rewriter.insert_before(view.root, Operation::as_shape(shape), &[*wide])?;
        }
        let inputs = rewriter.insert_before(view.root, Operation::concat(1), &[x, y])?;
        let weights = rewriter.insert_before(view.root, Operation::concat(1), &[w, v])?;
        rewriter.replace_with(view.root, Operation::convolution(spec), &[inputs, weights])?;
        Ok(true)
    }
}
