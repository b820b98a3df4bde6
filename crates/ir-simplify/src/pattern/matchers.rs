//! Neighbourhood predicates shared by the rewrite rules.
//!
//! All helpers read the program without mutating it, so rules can probe a
//! candidate fully before touching the rewriter.

use std::collections::HashSet;

use super::filters;
use crate::index::InstId;
use crate::ops::{BroadcastSpec, ConvolutionSpec, Operation, SliceSpec};
use crate::program::Program;

/// Whether the value is computable at compile time: every leaf of its input
/// tree is a literal.
pub fn is_constant(program: &Program, inst: InstId) -> bool {
    let mut stack = vec![inst];
    let mut seen = HashSet::new();
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        match program.op(current) {
            Operation::Literal(_) => {}
            Operation::Parameter(_) => return false,
            _ => {
                let inputs = program.inputs(current);
                if inputs.is_empty() {
                    return false;
                }
                stack.extend_from_slice(inputs);
            }
        }
    }
    true
}

/// Exactly one consumer and not observable as a program output.
pub fn used_once(program: &Program, inst: InstId) -> bool {
    program.consumers(inst).len() == 1 && !program.is_output(inst)
}

pub fn is_broadcast(program: &Program, inst: InstId) -> bool {
    matches!(program.op(inst), Operation::Broadcast(_))
}

pub fn is_constant_or_broadcast(program: &Program, inst: InstId) -> bool {
    is_constant(program, inst) || is_broadcast(program, inst)
}

pub fn broadcast_spec(program: &Program, inst: InstId) -> Option<&BroadcastSpec> {
    match program.op(inst) {
        Operation::Broadcast(spec) => Some(spec),
        _ => None,
    }
}

pub fn slice_spec(program: &Program, inst: InstId) -> Option<&SliceSpec> {
    match program.op(inst) {
        Operation::Slice(spec) => Some(spec),
        _ => None,
    }
}

pub fn convolution_spec(program: &Program, inst: InstId) -> Option<&ConvolutionSpec> {
    match program.op(inst) {
        Operation::Convolution(spec) => Some(spec),
        _ => None,
    }
}

/// Matches a binary instruction whose operands satisfy `first` and `second`
/// in either order; the returned pair follows the predicate order.
///
/// The operand order as written is tried first.
pub fn either_arg<F, G>(
    program: &Program,
    inst: InstId,
    first: F,
    second: G,
) -> Option<(InstId, InstId)>
where
    F: Fn(InstId) -> bool,
    G: Fn(InstId) -> bool,
{
    let [lhs, rhs] = program.inputs(inst) else {
        return None;
    };
    if first(*lhs) && second(*rhs) {
        Some((*lhs, *rhs))
    } else if first(*rhs) && second(*lhs) {
        Some((*rhs, *lhs))
    } else {
        None
    }
}

/// A convolution used once whose weights are constant.
pub fn conv_with_constant_weights(program: &Program, inst: InstId) -> bool {
    convolution_spec(program, inst).is_some()
        && used_once(program, inst)
        && is_constant(program, program.inputs(inst)[1])
}

/// `add` with one constant-or-broadcast operand and one that is neither.
pub fn add_of_constant_or_broadcast(program: &Program, inst: InstId) -> Option<(InstId, InstId)> {
    if !filters::add(program.op(inst)) {
        return None;
    }
    either_arg(
        program,
        inst,
        |a| is_constant_or_broadcast(program, a),
        |x| !is_constant_or_broadcast(program, x),
    )
}

/// Slice consumers of `inst` that partition it: at least two slices over the
/// same axes, sorted by start, starting at zero, gap free and reaching the
/// end of every sliced axis.
pub fn splits(program: &Program, inst: InstId) -> Option<Vec<InstId>> {
    let mut slices: Vec<(InstId, &SliceSpec)> = program
        .consumers(inst)
        .iter()
        .filter_map(|&consumer| slice_spec(program, consumer).map(|spec| (consumer, spec)))
        .collect();
    if slices.len() < 2 {
        return None;
    }
    let axes = &slices[0].1.axes;
    if slices.iter().any(|(_, spec)| spec.axes != *axes) {
        return None;
    }
    slices.sort_by(|(_, lhs), (_, rhs)| lhs.starts.cmp(&rhs.starts));

    if slices[0].1.starts.iter().any(|&start| start != 0) {
        return None;
    }
    if slices
        .windows(2)
        .any(|pair| pair[0].1.ends != pair[1].1.starts)
    {
        return None;
    }
    let lens = program.shape(inst).lens();
    let last = slices[slices.len() - 1].1;
    if last
        .axes
        .iter()
        .zip(&last.ends)
        .any(|(&axis, &end)| lens[axis] != end)
    {
        return None;
    }
    Some(slices.into_iter().map(|(id, _)| id).collect())
}

/// The single sliced axis shared by every split, if there is one.
pub fn single_split_axis(program: &Program, splits: &[InstId]) -> Option<usize> {
    let spec = slice_spec(program, *splits.first()?)?;
    match spec.axes.as_slice() {
        [axis] => Some(*axis),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::literal::Literal;
    use crate::shape::{DType, Shape};

    #[test]
    fn constant_subtrees_stop_at_parameters() {
        let mut program = Program::new();
        let x = program
            .add_parameter("x", Shape::new(DType::Si32, [2]))
            .expect("parameter");
        let one = program.add_literal(Literal::new([2], &[1i32, 1]).expect("literal"));
        let two = program.add_literal(Literal::new([2], &[2i32, 2]).expect("literal"));
        let folded = program
            .add_instruction(Operation::add(), &[one, two])
            .expect("add");
        let mixed = program
            .add_instruction(Operation::add(), &[folded, x])
            .expect("add");

        assert!(is_constant(&program, folded));
        assert!(!is_constant(&program, mixed));
        assert!(!is_constant(&program, x));
        assert_eq!(either_arg(&program, mixed, |i| i == x, |_| true), Some((x, folded)));
    }

    #[test]
    fn splits_require_full_ordered_coverage() {
        let mut program = Program::new();
        let x = program
            .add_parameter("x", Shape::new(DType::F32, [6]))
            .expect("parameter");
        let tail = program
            .add_instruction(Operation::slice(vec![0], vec![4], vec![6]), &[x])
            .expect("slice");
        let head = program
            .add_instruction(Operation::slice(vec![0], vec![0], vec![4]), &[x])
            .expect("slice");
        assert_eq!(splits(&program, x), Some(vec![head, tail]));
        assert_eq!(single_split_axis(&program, &[head, tail]), Some(0));

        let mut gapped = Program::new();
        let y = gapped
            .add_parameter("y", Shape::new(DType::F32, [6]))
            .expect("parameter");
        gapped
            .add_instruction(Operation::slice(vec![0], vec![0], vec![2]), &[y])
            .expect("slice");
        gapped
            .add_instruction(Operation::slice(vec![0], vec![3], vec![6]), &[y])
            .expect("slice");
        assert_eq!(splits(&gapped, y), None);
    }
}
