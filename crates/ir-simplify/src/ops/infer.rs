use crate::ops::{
    AsShapeSpec, BroadcastSpec, ConcatSpec, ConvolutionSpec, Operation, ReshapeSpec, SliceSpec,
    TransposeSpec,
};
use crate::shape::{Shape, ShapeError};

impl Operation {
    /// Output shape for the given input shapes, or the reason they are rejected.
    pub fn compute_shape(&self, inputs: &[&Shape]) -> Result<Shape, ShapeError> {
        let name = self.name();
        if let Some(expected) = self.arity() {
            if inputs.len() != expected {
                return Err(ShapeError::new(
                    name,
                    format!("expects {expected} inputs, got {}", inputs.len()),
                ));
            }
        }

        match self {
            Operation::Parameter(spec) => Ok(spec.shape.clone()),
            Operation::Literal(literal) => Ok(literal.shape().clone()),
            Operation::ElementwiseBinary(_) => {
                let (lhs, rhs) = (inputs[0], inputs[1]);
                if lhs.dtype() != rhs.dtype() {
                    return Err(ShapeError::new(
                        name,
                        format!("element types differ: {} vs {}", lhs.dtype(), rhs.dtype()),
                    ));
                }
                if lhs.lens() != rhs.lens() {
                    return Err(ShapeError::new(
                        name,
                        format!("lengths differ: {lhs} vs {rhs}"),
                    ));
                }
                Ok(lhs.standard())
            }
            Operation::ElementwiseUnary(_) | Operation::Contiguous => Ok(inputs[0].standard()),
            Operation::Broadcast(spec) => broadcast_shape(name, spec, inputs[0]),
            Operation::Slice(spec) => slice_shape(name, spec, inputs[0]),
            Operation::Concat(spec) => concat_shape(name, spec, inputs),
            Operation::Reshape(spec) => reshape_shape(name, spec, inputs[0]),
            Operation::Transpose(spec) => transpose_shape(name, spec, inputs[0]),
            Operation::AsShape(spec) => as_shape_shape(name, spec, inputs[0]),
            Operation::Convolution(spec) => convolution_shape(name, spec, inputs[0], inputs[1]),
            Operation::Dot => dot_shape(name, inputs[0], inputs[1]),
        }
    }
}

fn broadcast_shape(name: &str, spec: &BroadcastSpec, input: &Shape) -> Result<Shape, ShapeError> {
    if !input.broadcastable_to(spec.axis, &spec.out_lens) {
        return Err(ShapeError::new(
            name,
            format!(
                "input {input} does not match {:?} at axis {}",
                spec.out_lens, spec.axis
            ),
        ));
    }
    let mut strides = vec![0; spec.out_lens.len()];
    strides[spec.axis..spec.axis + input.rank()].copy_from_slice(input.strides());
    Shape::with_strides(input.dtype(), spec.out_lens.clone(), strides)
}

fn slice_shape(name: &str, spec: &SliceSpec, input: &Shape) -> Result<Shape, ShapeError> {
    if spec.axes.len() != spec.starts.len() || spec.axes.len() != spec.ends.len() {
        return Err(ShapeError::new(
            name,
            "axes, starts and ends must have the same length",
        ));
    }
    let mut lens = input.lens().to_vec();
    let mut seen = vec![false; lens.len()];
    for ((&axis, &start), &end) in spec.axes.iter().zip(&spec.starts).zip(&spec.ends) {
        if axis >= lens.len() {
            return Err(ShapeError::new(
                name,
                format!("axis {axis} out of range for rank {}", lens.len()),
            ));
        }
        if seen[axis] {
            return Err(ShapeError::new(name, format!("axis {axis} sliced twice")));
        }
        seen[axis] = true;
        if start >= end || end > lens[axis] {
            return Err(ShapeError::new(
                name,
                format!(
                    "range [{start}, {end}) out of bounds for axis {axis} of length {}",
                    lens[axis]
                ),
            ));
        }
        lens[axis] = end - start;
    }
    Shape::with_strides(input.dtype(), lens, input.strides().to_vec())
}

fn concat_shape(name: &str, spec: &ConcatSpec, inputs: &[&Shape]) -> Result<Shape, ShapeError> {
    let Some(first) = inputs.first() else {
        return Err(ShapeError::new(name, "expects at least one input"));
    };
    if spec.axis >= first.rank() {
        return Err(ShapeError::new(
            name,
            format!("axis {} out of range for rank {}", spec.axis, first.rank()),
        ));
    }
    let mut lens = first.lens().to_vec();
    lens[spec.axis] = 0;
    for input in inputs {
        if input.dtype() != first.dtype() || input.rank() != first.rank() {
            return Err(ShapeError::new(
                name,
                format!("input {input} is incompatible with {first}"),
            ));
        }
        for (axis, (&len, &expected)) in input.lens().iter().zip(first.lens()).enumerate() {
            if axis != spec.axis && len != expected {
                return Err(ShapeError::new(
                    name,
                    format!("input {input} differs from {first} outside axis {}", spec.axis),
                ));
            }
        }
        lens[spec.axis] = lens[spec.axis]
            .checked_add(input.lens()[spec.axis])
            .ok_or_else(|| overflow(name))?;
    }
    Ok(Shape::new(first.dtype(), lens))
}

fn reshape_shape(name: &str, spec: &ReshapeSpec, input: &Shape) -> Result<Shape, ShapeError> {
    if !input.is_standard() {
        return Err(ShapeError::new(
            name,
            format!("input {input} is not standard"),
        ));
    }
    let mut lens = Vec::with_capacity(spec.dims.len());
    let mut inferred = None;
    for (idx, &dim) in spec.dims.iter().enumerate() {
        match dim {
            0 => match input.lens().get(idx) {
                Some(&len) => lens.push(len),
                None => {
                    return Err(ShapeError::new(
                        name,
                        format!("dimension {idx} copies a missing input axis"),
                    ))
                }
            },
            -1 => {
                if inferred.replace(idx).is_some() {
                    return Err(ShapeError::new(name, "more than one dimension is -1"));
                }
                lens.push(1);
            }
            dim if dim > 0 => lens.push(dim as usize),
            dim => {
                return Err(ShapeError::new(
                    name,
                    format!("invalid dimension {dim}"),
                ))
            }
        }
    }
    let elements = product(input.lens()).ok_or_else(|| overflow(name))?;
    let known = product(&lens).ok_or_else(|| overflow(name))?;
    if let Some(idx) = inferred {
        if known == 0 || elements % known != 0 {
            return Err(ShapeError::new(
                name,
                format!("cannot infer dimension {idx} for {elements} elements"),
            ));
        }
        lens[idx] = elements / known;
    }
    if product(&lens) != Some(elements) {
        return Err(ShapeError::new(
            name,
            format!("{lens:?} does not hold {elements} elements"),
        ));
    }
    Ok(Shape::new(input.dtype(), lens))
}

fn transpose_shape(name: &str, spec: &TransposeSpec, input: &Shape) -> Result<Shape, ShapeError> {
    let rank = input.rank();
    let mut seen = vec![false; rank];
    for &axis in &spec.perm {
        if axis >= rank || std::mem::replace(&mut seen[axis], true) {
            return Err(ShapeError::new(
                name,
                format!("{:?} is not a permutation of rank {rank}", spec.perm),
            ));
        }
    }
    if spec.perm.len() != rank {
        return Err(ShapeError::new(
            name,
            format!("{:?} is not a permutation of rank {rank}", spec.perm),
        ));
    }
    let lens: Vec<usize> = spec.perm.iter().map(|&axis| input.lens()[axis]).collect();
    let strides: Vec<usize> = spec.perm.iter().map(|&axis| input.strides()[axis]).collect();
    Shape::with_strides(input.dtype(), lens, strides)
}

fn as_shape_shape(name: &str, spec: &AsShapeSpec, input: &Shape) -> Result<Shape, ShapeError> {
    if spec.shape.dtype() != input.dtype() {
        return Err(ShapeError::new(
            name,
            format!("element types differ: {} vs {}", spec.shape.dtype(), input.dtype()),
        ));
    }
    if spec.shape.element_space() > input.element_space() {
        return Err(ShapeError::new(
            name,
            format!("{} reads past the end of {input}", spec.shape),
        ));
    }
    Ok(spec.shape.clone())
}

fn convolution_shape(
    name: &str,
    spec: &ConvolutionSpec,
    input: &Shape,
    weights: &Shape,
) -> Result<Shape, ShapeError> {
    if input.rank() != 4 || weights.rank() != 4 {
        return Err(ShapeError::new(
            name,
            format!("expects rank-4 input and weights, got {input} and {weights}"),
        ));
    }
    if input.dtype() != weights.dtype() {
        return Err(ShapeError::new(
            name,
            format!("element types differ: {} vs {}", input.dtype(), weights.dtype()),
        ));
    }
    if spec.group == 0 || spec.stride.contains(&0) || spec.dilation.contains(&0) {
        return Err(ShapeError::new(
            name,
            "group, stride and dilation must be positive",
        ));
    }
    let (x, w) = (input.lens(), weights.lens());
    if w[1].checked_mul(spec.group) != Some(x[1]) || w[0] % spec.group != 0 {
        return Err(ShapeError::new(
            name,
            format!(
                "{} input channels do not match weights {weights} with group {}",
                x[1], spec.group
            ),
        ));
    }
    let mut lens = vec![x[0], w[0], 0, 0];
    for axis in 0..2 {
        let padded = spec.padding[axis]
            .checked_mul(2)
            .and_then(|pad| x[axis + 2].checked_add(pad))
            .ok_or_else(|| overflow(name))?;
        let window = spec.dilation[axis]
            .checked_mul(w[axis + 2].saturating_sub(1))
            .and_then(|span| span.checked_add(1))
            .ok_or_else(|| overflow(name))?;
        if w[axis + 2] == 0 || padded < window {
            return Err(ShapeError::new(
                name,
                format!("kernel {weights} does not fit input {input}"),
            ));
        }
        lens[axis + 2] = (padded - window) / spec.stride[axis] + 1;
    }
    Ok(Shape::new(input.dtype(), lens))
}

fn product(lens: &[usize]) -> Option<usize> {
    lens.iter().try_fold(1usize, |acc, &len| acc.checked_mul(len))
}

fn overflow(name: &str) -> ShapeError {
    ShapeError::new(name, "dimension arithmetic overflows")
}

fn dot_shape(name: &str, lhs: &Shape, rhs: &Shape) -> Result<Shape, ShapeError> {
    let rank = lhs.rank();
    if rank < 2 || rhs.rank() != rank {
        return Err(ShapeError::new(
            name,
            format!("expects matching ranks of at least 2, got {lhs} and {rhs}"),
        ));
    }
    if lhs.dtype() != rhs.dtype() {
        return Err(ShapeError::new(
            name,
            format!("element types differ: {} vs {}", lhs.dtype(), rhs.dtype()),
        ));
    }
    let (a, b) = (lhs.lens(), rhs.lens());
    if a[..rank - 2] != b[..rank - 2] || a[rank - 1] != b[rank - 2] {
        return Err(ShapeError::new(
            name,
            format!("{lhs} and {rhs} are not conformable"),
        ));
    }
    let mut lens = a[..rank - 1].to_vec();
    lens.push(b[rank - 1]);
    Ok(Shape::new(lhs.dtype(), lens))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::DType;

    #[test]
    fn slice_keeps_input_strides() {
        let input = Shape::new(DType::F32, vec![2, 6]);
        let out = Operation::slice(vec![1], vec![2], vec![5])
            .compute_shape(&[&input])
            .expect("valid slice");
        assert_eq!(out.lens(), &[2, 3]);
        assert_eq!(out.strides(), &[6, 1]);
        assert!(!out.is_standard());
    }

    #[test]
    fn reshape_infers_wildcard_dimension() {
        let input = Shape::new(DType::F32, vec![2, 3, 4]);
        let out = Operation::reshape(vec![0, -1])
            .compute_shape(&[&input])
            .expect("valid reshape");
        assert_eq!(out.lens(), &[2, 12]);
    }

    #[test]
    fn convolution_applies_stride_and_padding() {
        let input = Shape::new(DType::F32, vec![1, 3, 8, 8]);
        let weights = Shape::new(DType::F32, vec![4, 3, 3, 3]);
        let spec = ConvolutionSpec {
            padding: [1, 1],
            stride: [2, 2],
            ..ConvolutionSpec::default()
        };
        let out = Operation::convolution(spec)
            .compute_shape(&[&input, &weights])
            .expect("valid convolution");
        assert_eq!(out.lens(), &[1, 4, 4, 4]);
    }

    #[test]
    fn oversized_reshape_is_rejected() {
        let input = Shape::new(DType::F32, vec![2, 3, 4]);
        let err = Operation::reshape(vec![i64::MAX, 4, -1])
            .compute_shape(&[&input])
            .expect_err("overflowing dims");
        assert_eq!(err.op, "reshape");
        assert!(err.message.contains("overflows"), "{err}");
    }

    #[test]
    fn oversized_convolution_attributes_are_rejected() {
        let input = Shape::new(DType::F32, vec![1, 3, 8, 8]);
        let weights = Shape::new(DType::F32, vec![4, 3, 3, 3]);
        let huge = usize::MAX / 2 + 1;

        let padded = ConvolutionSpec {
            padding: [huge, 0],
            ..ConvolutionSpec::default()
        };
        let err = Operation::convolution(padded)
            .compute_shape(&[&input, &weights])
            .expect_err("overflowing padding");
        assert!(err.message.contains("overflows"), "{err}");

        let grouped = ConvolutionSpec {
            group: huge,
            ..ConvolutionSpec::default()
        };
        let err = Operation::convolution(grouped)
            .compute_shape(&[&input, &weights])
            .expect_err("overflowing group");
        assert!(err.message.contains("group"), "{err}");

        let dilated = ConvolutionSpec {
            dilation: [huge, 1],
            ..ConvolutionSpec::default()
        };
        let err = Operation::convolution(dilated)
            .compute_shape(&[&input, &weights])
            .expect_err("overflowing dilation");
        assert!(err.message.contains("overflows"), "{err}");
    }

    #[test]
    fn broadcast_axis_past_the_output_is_rejected() {
        let input = Shape::new(DType::F32, vec![3]);
        let err = Operation::broadcast(usize::MAX, vec![2, 3])
            .compute_shape(&[&input])
            .expect_err("axis out of range");
        assert_eq!(err.op, "broadcast");
    }
}
