//! Closed operator catalogue.
//!
//! Every instruction carries one [`Operation`]. Shape inference lives in
//! [`infer`], literal evaluation in [`eval`]; this module holds the operator
//! parameters and the algebraic metadata the rewrite rules query.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::literal::Literal;
use crate::shape::Shape;

pub mod eval;
pub mod infer;

pub use eval::{reinterpret, EvalError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    /// Squared difference, `(a - b)^2`.
    Sqdiff,
}

impl ElementwiseBinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            ElementwiseBinaryOp::Add => "add",
            ElementwiseBinaryOp::Sub => "sub",
            ElementwiseBinaryOp::Mul => "mul",
            ElementwiseBinaryOp::Div => "div",
            ElementwiseBinaryOp::Sqdiff => "sqdiff",
        }
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            ElementwiseBinaryOp::Add | ElementwiseBinaryOp::Mul | ElementwiseBinaryOp::Sqdiff
        )
    }

    pub fn is_associative(self) -> bool {
        matches!(self, ElementwiseBinaryOp::Add | ElementwiseBinaryOp::Mul)
    }

    /// Neutral element of an associative operator.
    pub fn identity(self) -> Option<f64> {
        match self {
            ElementwiseBinaryOp::Add => Some(0.0),
            ElementwiseBinaryOp::Mul => Some(1.0),
            _ => None,
        }
    }

    /// Associative operator and unary inverse that together express `self`.
    ///
    /// `a - b == add(a, neg(b))` and `a / b == mul(a, recip(b))`.
    pub fn canonical_inverse(self) -> Option<(ElementwiseBinaryOp, ElementwiseUnaryOp)> {
        match self {
            ElementwiseBinaryOp::Sub => Some((ElementwiseBinaryOp::Add, ElementwiseUnaryOp::Neg)),
            ElementwiseBinaryOp::Div => {
                Some((ElementwiseBinaryOp::Mul, ElementwiseUnaryOp::Recip))
            }
            _ => None,
        }
    }

    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            ElementwiseBinaryOp::Add => lhs + rhs,
            ElementwiseBinaryOp::Sub => lhs - rhs,
            ElementwiseBinaryOp::Mul => lhs * rhs,
            ElementwiseBinaryOp::Div => lhs / rhs,
            ElementwiseBinaryOp::Sqdiff => (lhs - rhs) * (lhs - rhs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseUnaryOp {
    Neg,
    Recip,
    Sqrt,
    Rsqrt,
    Relu,
    Log,
}

impl ElementwiseUnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            ElementwiseUnaryOp::Neg => "neg",
            ElementwiseUnaryOp::Recip => "recip",
            ElementwiseUnaryOp::Sqrt => "sqrt",
            ElementwiseUnaryOp::Rsqrt => "rsqrt",
            ElementwiseUnaryOp::Relu => "relu",
            ElementwiseUnaryOp::Log => "log",
        }
    }

    pub fn apply(self, value: f64) -> f64 {
        match self {
            ElementwiseUnaryOp::Neg => -value,
            ElementwiseUnaryOp::Recip => 1.0 / value,
            ElementwiseUnaryOp::Sqrt => value.sqrt(),
            ElementwiseUnaryOp::Rsqrt => 1.0 / value.sqrt(),
            ElementwiseUnaryOp::Relu => value.max(0.0),
            ElementwiseUnaryOp::Log => value.ln(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub shape: Shape,
}

/// Half-open ranges `[starts[i], ends[i])` taken on `axes[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SliceSpec {
    pub axes: Vec<usize>,
    pub starts: Vec<usize>,
    pub ends: Vec<usize>,
}

impl SliceSpec {
    pub fn new(axes: Vec<usize>, starts: Vec<usize>, ends: Vec<usize>) -> Self {
        Self { axes, starts, ends }
    }

    /// Single-axis slice.
    pub fn along(axis: usize, start: usize, end: usize) -> Self {
        Self::new(vec![axis], vec![start], vec![end])
    }

    /// The range taken on `axis`, if the slice restricts it.
    pub fn range_on(&self, axis: usize) -> Option<(usize, usize)> {
        self.axes
            .iter()
            .position(|&candidate| candidate == axis)
            .map(|idx| (self.starts[idx], self.ends[idx]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcatSpec {
    pub axis: usize,
}

/// Maps the input axes onto `out_lens[axis..axis + rank]`; every other
/// output axis gets stride 0.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BroadcastSpec {
    pub axis: usize,
    pub out_lens: Vec<usize>,
}

/// Target dimensions; `0` copies the input length and one `-1` is inferred.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReshapeSpec {
    pub dims: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransposeSpec {
    pub perm: Vec<usize>,
}

/// Reinterprets the input buffer with an explicit shape and strides.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AsShapeSpec {
    pub shape: Shape,
}

/// 2-D NCHW convolution against OIHW weights.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvolutionSpec {
    pub padding: [usize; 2],
    pub stride: [usize; 2],
    pub dilation: [usize; 2],
    pub group: usize,
}

impl ConvolutionSpec {
    pub fn with_stride(stride: [usize; 2]) -> Self {
        Self {
            stride,
            ..Self::default()
        }
    }

    pub fn with_padding(padding: [usize; 2]) -> Self {
        Self {
            padding,
            ..Self::default()
        }
    }
}

impl Default for ConvolutionSpec {
    fn default() -> Self {
        Self {
            padding: [0, 0],
            stride: [1, 1],
            dilation: [1, 1],
            group: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Parameter(ParameterSpec),
    Literal(Literal),
    ElementwiseBinary(ElementwiseBinaryOp),
    ElementwiseUnary(ElementwiseUnaryOp),
    Broadcast(BroadcastSpec),
    Slice(SliceSpec),
    Concat(ConcatSpec),
    Reshape(ReshapeSpec),
    Transpose(TransposeSpec),
    Contiguous,
    AsShape(AsShapeSpec),
    Convolution(ConvolutionSpec),
    /// Batched matrix multiply over the two trailing axes.
    Dot,
}

impl Operation {
    pub fn add() -> Self {
        Operation::ElementwiseBinary(ElementwiseBinaryOp::Add)
    }

    pub fn sub() -> Self {
        Operation::ElementwiseBinary(ElementwiseBinaryOp::Sub)
    }

    pub fn mul() -> Self {
        Operation::ElementwiseBinary(ElementwiseBinaryOp::Mul)
    }

    pub fn div() -> Self {
        Operation::ElementwiseBinary(ElementwiseBinaryOp::Div)
    }

    pub fn sqdiff() -> Self {
        Operation::ElementwiseBinary(ElementwiseBinaryOp::Sqdiff)
    }

    pub fn neg() -> Self {
        Operation::ElementwiseUnary(ElementwiseUnaryOp::Neg)
    }

    pub fn recip() -> Self {
        Operation::ElementwiseUnary(ElementwiseUnaryOp::Recip)
    }

    pub fn sqrt() -> Self {
        Operation::ElementwiseUnary(ElementwiseUnaryOp::Sqrt)
    }

    pub fn rsqrt() -> Self {
        Operation::ElementwiseUnary(ElementwiseUnaryOp::Rsqrt)
    }

    pub fn relu() -> Self {
        Operation::ElementwiseUnary(ElementwiseUnaryOp::Relu)
    }

    pub fn log() -> Self {
        Operation::ElementwiseUnary(ElementwiseUnaryOp::Log)
    }

    pub fn slice(axes: Vec<usize>, starts: Vec<usize>, ends: Vec<usize>) -> Self {
        Operation::Slice(SliceSpec::new(axes, starts, ends))
    }

    pub fn concat(axis: usize) -> Self {
        Operation::Concat(ConcatSpec { axis })
    }

    pub fn broadcast(axis: usize, out_lens: Vec<usize>) -> Self {
        Operation::Broadcast(BroadcastSpec { axis, out_lens })
    }

    pub fn reshape(dims: Vec<i64>) -> Self {
        Operation::Reshape(ReshapeSpec { dims })
    }

    pub fn transpose(perm: Vec<usize>) -> Self {
        Operation::Transpose(TransposeSpec { perm })
    }

    pub fn as_shape(shape: Shape) -> Self {
        Operation::AsShape(AsShapeSpec { shape })
    }

    pub fn convolution(spec: ConvolutionSpec) -> Self {
        Operation::Convolution(spec)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Parameter(_) => "@param",
            Operation::Literal(_) => "@literal",
            Operation::ElementwiseBinary(op) => op.name(),
            Operation::ElementwiseUnary(op) => op.name(),
            Operation::Broadcast(_) => "broadcast",
            Operation::Slice(_) => "slice",
            Operation::Concat(_) => "concat",
            Operation::Reshape(_) => "reshape",
            Operation::Transpose(_) => "transpose",
            Operation::Contiguous => "contiguous",
            Operation::AsShape(_) => "as_shape",
            Operation::Convolution(_) => "convolution",
            Operation::Dot => "dot",
        }
    }

    /// Pointwise operators: each output element depends only on the input
    /// elements at the same index. Layout operators are excluded.
    pub fn is_elementwise(&self) -> bool {
        matches!(
            self,
            Operation::ElementwiseBinary(_) | Operation::ElementwiseUnary(_)
        )
    }

    pub fn is_commutative(&self) -> bool {
        matches!(self, Operation::ElementwiseBinary(op) if op.is_commutative())
    }

    pub fn is_associative(&self) -> bool {
        matches!(self, Operation::ElementwiseBinary(op) if op.is_associative())
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Operation::Literal(_))
    }

    /// Expected input count, `None` for variadic operators.
    pub fn arity(&self) -> Option<usize> {
        match self {
            Operation::Parameter(_) | Operation::Literal(_) => Some(0),
            Operation::ElementwiseBinary(_) | Operation::Convolution(_) | Operation::Dot => {
                Some(2)
            }
            Operation::Concat(_) => None,
            _ => Some(1),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Parameter(spec) => write!(f, "@param:{}", spec.name),
            Operation::Literal(literal) => write!(f, "@literal{literal}"),
            Operation::Broadcast(spec) => write!(
                f,
                "broadcast[axis={}, out_lens={{{}}}]",
                spec.axis,
                join(&spec.out_lens)
            ),
            Operation::Slice(spec) => write!(
                f,
                "slice[axes={{{}}}, starts={{{}}}, ends={{{}}}]",
                join(&spec.axes),
                join(&spec.starts),
                join(&spec.ends)
            ),
            Operation::Concat(spec) => write!(f, "concat[axis={}]", spec.axis),
            Operation::Reshape(spec) => write!(f, "reshape[dims={{{}}}]", join(&spec.dims)),
            Operation::Transpose(spec) => write!(f, "transpose[perm={{{}}}]", join(&spec.perm)),
            Operation::AsShape(spec) => write!(f, "as_shape[{}]", spec.shape),
            Operation::Convolution(spec) => write!(
                f,
                "convolution[padding={{{}}}, stride={{{}}}, dilation={{{}}}, group={}]",
                join(&spec.padding),
                join(&spec.stride),
                join(&spec.dilation),
                spec.group
            ),
            other => f.write_str(other.name()),
        }
    }
}

fn join<T: fmt::Display>(values: &[T]) -> String {
    values
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
