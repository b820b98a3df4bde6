use thiserror::Error;

use crate::literal::Literal;
use crate::ops::{ConvolutionSpec, Operation};
use crate::shape::{Shape, ShapeError};

/// Errors raised while evaluating operators over literal buffers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("missing value for parameter `{name}`")]
    MissingParameter { name: String },
    #[error("parameter `{name}` expects {expected}, got {found}")]
    ParameterMismatch {
        name: String,
        expected: Shape,
        found: Shape,
    },
    #[error("{op} cannot be evaluated: {reason}")]
    Unsupported { op: &'static str, reason: String },
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

impl Operation {
    /// Evaluates the operator over literal inputs.
    ///
    /// Arithmetic runs in `f64` and is cast back to the output element type
    /// (integers truncate). The result is always a standard literal; a
    /// strided `output` only contributes its lengths and element type.
    pub fn evaluate(&self, output: &Shape, inputs: &[&Literal]) -> Result<Literal, EvalError> {
        let shapes: Vec<&Shape> = inputs.iter().map(|literal| literal.shape()).collect();
        let inferred = self.compute_shape(&shapes)?;
        if inferred.lens() != output.lens() || inferred.dtype() != output.dtype() {
            return Err(ShapeError::new(
                self.name(),
                format!("evaluates to {inferred}, expected {output}"),
            )
            .into());
        }

        let values: Vec<Vec<f64>> = inputs.iter().map(|literal| literal.to_f64_vec()).collect();
        let result = match self {
            Operation::Parameter(spec) => {
                return Err(EvalError::Unsupported {
                    op: "@param",
                    reason: format!("parameter `{}` has no bound value", spec.name),
                })
            }
            Operation::Literal(literal) => return Ok(literal.clone()),
            Operation::ElementwiseBinary(op) => values[0]
                .iter()
                .zip(&values[1])
                .map(|(&lhs, &rhs)| op.apply(lhs, rhs))
                .collect(),
            Operation::ElementwiseUnary(op) => values[0].iter().map(|&v| op.apply(v)).collect(),
            Operation::Contiguous | Operation::Reshape(_) => values[0].clone(),
            Operation::Broadcast(spec) => {
                let rank = shapes[0].rank();
                gather(output, shapes[0], &values[0], |idx| {
                    idx[spec.axis..spec.axis + rank].to_vec()
                })
            }
            Operation::Slice(spec) => gather(output, shapes[0], &values[0], |idx| {
                let mut src = idx.to_vec();
                for (&axis, &start) in spec.axes.iter().zip(&spec.starts) {
                    src[axis] += start;
                }
                src
            }),
            Operation::Transpose(spec) => gather(output, shapes[0], &values[0], |idx| {
                let mut src = vec![0; idx.len()];
                for (out_axis, &in_axis) in spec.perm.iter().enumerate() {
                    src[in_axis] = idx[out_axis];
                }
                src
            }),
            Operation::Concat(spec) => concat(output, spec.axis, &shapes, &values),
            Operation::AsShape(spec) => return reinterpret(&spec.shape, shapes[0], inputs[0]),
            Operation::Convolution(spec) => {
                convolution(output, spec, shapes[0], &values[0], shapes[1], &values[1])
            }
            Operation::Dot => dot(output, shapes[0], &values[0], shapes[1], &values[1]),
        };

        Ok(Literal::from_f64_values(output, &result)?)
    }
}

/// Reads `view` out of the memory that `layout` assigns to the logical
/// elements of `value`.
///
/// `layout` is the shape the producer declared, which may be strided. Reading
/// a slot that no element of `value` occupies is an error.
pub fn reinterpret(view: &Shape, layout: &Shape, value: &Literal) -> Result<Literal, EvalError> {
    let mut memory = vec![None; layout.element_space()];
    for (linear, element) in value.to_f64_vec().into_iter().enumerate() {
        memory[layout.offset(&layout.multi_index(linear))] = Some(element);
    }
    let values = (0..view.elements())
        .map(|linear| {
            memory
                .get(view.offset(&view.multi_index(linear)))
                .copied()
                .flatten()
                .ok_or_else(|| EvalError::Unsupported {
                    op: "as_shape",
                    reason: format!("{view} reads memory outside the elements of {layout}"),
                })
        })
        .collect::<Result<Vec<f64>, _>>()?;
    Ok(Literal::from_f64_values(view, &values)?)
}

/// Reads each output element from the source element `map(index)`.
fn gather<F>(output: &Shape, source: &Shape, values: &[f64], map: F) -> Vec<f64>
where
    F: Fn(&[usize]) -> Vec<usize>,
{
    let layout = source.standard();
    (0..output.elements())
        .map(|linear| values[layout.offset(&map(&output.multi_index(linear)))])
        .collect()
}

fn concat(output: &Shape, axis: usize, shapes: &[&Shape], values: &[Vec<f64>]) -> Vec<f64> {
    let layouts: Vec<Shape> = shapes.iter().map(|shape| shape.standard()).collect();
    (0..output.elements())
        .map(|linear| {
            let mut idx = output.multi_index(linear);
            let mut input = 0;
            while idx[axis] >= layouts[input].lens()[axis] {
                idx[axis] -= layouts[input].lens()[axis];
                input += 1;
            }
            values[input][layouts[input].offset(&idx)]
        })
        .collect()
}

fn convolution(
    output: &Shape,
    spec: &ConvolutionSpec,
    input: &Shape,
    x: &[f64],
    weights: &Shape,
    w: &[f64],
) -> Vec<f64> {
    let x_layout = input.standard();
    let w_layout = weights.standard();
    let (channels, height, width) = (weights.lens()[1], input.lens()[2], input.lens()[3]);
    let (kernel_h, kernel_w) = (weights.lens()[2], weights.lens()[3]);
    let out_per_group = weights.lens()[0] / spec.group;

    let mut result = Vec::with_capacity(output.elements());
    for linear in 0..output.elements() {
        let idx = output.multi_index(linear);
        let (n, o, oh, ow) = (idx[0], idx[1], idx[2], idx[3]);
        let group = o / out_per_group;
        let mut acc = 0.0;
        for c in 0..channels {
            for kh in 0..kernel_h {
                let ih = (oh * spec.stride[0] + kh * spec.dilation[0]) as isize
                    - spec.padding[0] as isize;
                if ih < 0 || ih as usize >= height {
                    continue;
                }
                for kw in 0..kernel_w {
                    let iw = (ow * spec.stride[1] + kw * spec.dilation[1]) as isize
                        - spec.padding[1] as isize;
                    if iw < 0 || iw as usize >= width {
                        continue;
                    }
                    let xv = x[x_layout.offset(&[
                        n,
                        group * channels + c,
                        ih as usize,
                        iw as usize,
                    ])];
                    let wv = w[w_layout.offset(&[o, c, kh, kw])];
                    acc += xv * wv;
                }
            }
        }
        result.push(acc);
    }
    result
}

fn dot(output: &Shape, lhs: &Shape, a: &[f64], rhs: &Shape, b: &[f64]) -> Vec<f64> {
    let rank = output.rank();
    let depth = lhs.lens()[rank - 1];
    let (a_layout, b_layout) = (lhs.standard(), rhs.standard());
    (0..output.elements())
        .map(|linear| {
            let idx = output.multi_index(linear);
            let mut a_idx = idx.clone();
            let mut b_idx = idx;
            (0..depth)
                .map(|k| {
                    a_idx[rank - 1] = k;
                    b_idx[rank - 2] = k;
                    a[a_layout.offset(&a_idx)] * b[b_layout.offset(&b_idx)]
                })
                .sum()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::DType;

    #[test]
    fn dot_multiplies_matrices() {
        let a = Literal::new(vec![2, 2], &[1.0f32, 2.0, 3.0, 4.0]).expect("literal");
        let b = Literal::new(vec![2, 1], &[5.0f32, 6.0]).expect("literal");
        let out = Operation::Dot
            .evaluate(&Shape::new(DType::F32, vec![2, 1]), &[&a, &b])
            .expect("dot evaluates");
        assert_eq!(out.to_vec::<f32>(), Some(vec![17.0, 39.0]));
    }

    #[test]
    fn transpose_reads_permuted_elements() {
        let a = Literal::new(vec![2, 3], &[0i32, 1, 2, 3, 4, 5]).expect("literal");
        let op = Operation::transpose(vec![1, 0]);
        let shape = op.compute_shape(&[a.shape()]).expect("shape");
        let out = op.evaluate(&shape, &[&a]).expect("transpose evaluates");
        assert_eq!(out.to_vec::<i32>(), Some(vec![0, 3, 1, 4, 2, 5]));
    }

    #[test]
    fn parameters_cannot_be_evaluated() {
        let op = Operation::Parameter(crate::ops::ParameterSpec {
            name: "x".into(),
            shape: Shape::scalar(DType::F32),
        });
        let err = op
            .evaluate(&Shape::scalar(DType::F32), &[])
            .expect_err("no bound value");
        assert!(matches!(err, EvalError::Unsupported { .. }));
    }

    #[test]
    fn reinterpret_follows_the_declared_layout() {
        let value = Literal::new(vec![3, 2], &[0i32, 3, 1, 4, 2, 5]).expect("literal");
        let transposed = Shape::with_strides(DType::Si32, vec![3, 2], vec![1, 3]).expect("shape");
        let flat = reinterpret(&Shape::new(DType::Si32, vec![6]), &transposed, &value)
            .expect("every slot is covered");
        assert_eq!(flat.to_vec::<i32>(), Some(vec![0, 1, 2, 3, 4, 5]));

        let sliced = Shape::with_strides(DType::Si32, vec![2, 1], vec![2, 1]).expect("shape");
        let value = Literal::new(vec![2, 1], &[7i32, 8]).expect("literal");
        let err = reinterpret(&Shape::new(DType::Si32, vec![3]), &sliced, &value)
            .expect_err("slot 1 is a hole");
        assert!(matches!(err, EvalError::Unsupported { op: "as_shape", .. }));
    }
}
