use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Element type carried by every tensor in a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Si32,
    Si64,
    F32,
    F64,
}

impl DType {
    /// Returns `true` for the signed integer element types.
    pub fn is_integer(self) -> bool {
        matches!(self, DType::Si32 | DType::Si64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Width of a single element in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::Si32 | DType::F32 => 4,
            DType::Si64 | DType::F64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::Si32 => "i32",
            DType::Si64 => "i64",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error raised when an operator rejects the shapes of its inputs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{op}: {message}")]
pub struct ShapeError {
    pub op: String,
    pub message: String,
}

impl ShapeError {
    pub fn new(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            message: message.into(),
        }
    }
}

/// Element type, dimension lengths and strides of a tensor.
///
/// Strides are counted in elements. A standard shape has the row-major
/// strides derived from its lengths; broadcast shapes carry stride 0 on the
/// expanded axes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Shape {
    dtype: DType,
    lens: Vec<usize>,
    strides: Vec<usize>,
}

impl Shape {
    /// Creates a standard (row-major, packed) shape.
    pub fn new(dtype: DType, lens: impl Into<Vec<usize>>) -> Self {
        let lens = lens.into();
        let strides = standard_strides(&lens);
        Self {
            dtype,
            lens,
            strides,
        }
    }

    /// Creates a shape with explicit strides.
    pub fn with_strides(
        dtype: DType,
        lens: impl Into<Vec<usize>>,
        strides: impl Into<Vec<usize>>,
    ) -> Result<Self, ShapeError> {
        let lens = lens.into();
        let strides = strides.into();
        if lens.len() != strides.len() {
            return Err(ShapeError::new(
                "shape",
                format!(
                    "{} lengths but {} strides",
                    lens.len(),
                    strides.len()
                ),
            ));
        }
        Ok(Self {
            dtype,
            lens,
            strides,
        })
    }

    /// Shape of a single-element tensor, `{1}`.
    pub fn scalar(dtype: DType) -> Self {
        Self::new(dtype, vec![1])
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn lens(&self) -> &[usize] {
        &self.lens
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.lens.len()
    }

    /// Number of logical elements.
    pub fn elements(&self) -> usize {
        self.lens.iter().product()
    }

    /// Number of elements spanned in memory, `1 + max offset`.
    pub fn element_space(&self) -> usize {
        if self.lens.iter().any(|&len| len == 0) {
            return 0;
        }
        1 + self
            .lens
            .iter()
            .zip(&self.strides)
            .map(|(len, stride)| (len - 1) * stride)
            .sum::<usize>()
    }

    /// Returns `true` when the strides are the row-major strides of the lengths.
    ///
    /// Axes of length 1 are never stepped over, so their stride is ignored.
    pub fn is_standard(&self) -> bool {
        let expected = standard_strides(&self.lens);
        self.lens
            .iter()
            .zip(self.strides.iter().zip(&expected))
            .all(|(&len, (stride, expected))| len == 1 || stride == expected)
    }

    /// Every element occupies a distinct slot and there are no holes.
    pub fn is_packed(&self) -> bool {
        !self.is_broadcasted() && self.elements() == self.element_space()
    }

    pub fn is_broadcasted(&self) -> bool {
        self.lens
            .iter()
            .zip(&self.strides)
            .any(|(&len, &stride)| len > 1 && stride == 0)
    }

    pub fn is_transposed(&self) -> bool {
        if self.is_broadcasted() {
            return false;
        }
        let strides: Vec<usize> = self
            .lens
            .iter()
            .zip(&self.strides)
            .filter(|(&len, _)| len > 1)
            .map(|(_, &stride)| stride)
            .collect();
        strides.windows(2).any(|pair| pair[0] < pair[1])
    }

    /// Same element type and lengths with standard strides.
    pub fn standard(&self) -> Shape {
        Shape::new(self.dtype, self.lens.clone())
    }

    /// Same strides layout, different element type.
    pub fn with_dtype(&self, dtype: DType) -> Shape {
        Shape {
            dtype,
            lens: self.lens.clone(),
            strides: self.strides.clone(),
        }
    }

    /// Returns `true` when this shape can be expanded to `out_lens` with its
    /// axes mapped starting at `axis`.
    pub fn broadcastable_to(&self, axis: usize, out_lens: &[usize]) -> bool {
        axis
            .checked_add(self.rank())
            .and_then(|end| out_lens.get(axis..end))
            .is_some_and(|window| window == self.lens.as_slice())
    }

    /// Memory offset of the element at `index`.
    pub fn offset(&self, index: &[usize]) -> usize {
        index
            .iter()
            .zip(&self.strides)
            .map(|(idx, stride)| idx * stride)
            .sum()
    }

    /// Multi-index of the `linear`-th element in row-major order.
    pub fn multi_index(&self, mut linear: usize) -> Vec<usize> {
        let mut index = vec![0; self.rank()];
        for axis in (0..self.rank()).rev() {
            let len = self.lens[axis].max(1);
            index[axis] = linear % len;
            linear /= len;
        }
        index
    }
}

impl<'de> Deserialize<'de> for Shape {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct ShapeHelper {
            dtype: DType,
            lens: Vec<usize>,
            strides: Vec<usize>,
        }

        let helper = ShapeHelper::deserialize(deserializer)?;
        Shape::with_strides(helper.dtype, helper.lens, helper.strides)
            .map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{{}}}", self.dtype, join(&self.lens))?;
        if !self.is_standard() {
            write!(f, ":{{{}}}", join(&self.strides))?;
        }
        Ok(())
    }
}

fn join(values: &[usize]) -> String {
    values
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Row-major strides for the provided lengths.
pub fn standard_strides(lens: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; lens.len()];
    let mut acc = 1usize;
    for (stride, len) in strides.iter_mut().zip(lens).rev() {
        *stride = acc;
        acc = acc.saturating_mul((*len).max(1));
    }
    strides
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_strides_follow_row_major_order() {
        assert_eq!(standard_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(standard_strides(&[]), Vec::<usize>::new());
    }

    #[test]
    fn transposed_strides_are_not_standard() {
        let shape = Shape::with_strides(DType::F32, vec![3, 2], vec![1, 3]).expect("valid shape");
        assert!(!shape.is_standard());
        assert!(shape.is_transposed());
        assert!(shape.is_packed());
    }

    #[test]
    fn unit_axes_ignore_stride() {
        let shape = Shape::with_strides(DType::F32, vec![1, 4], vec![0, 1]).expect("valid shape");
        assert!(shape.is_standard());
        assert!(!shape.is_broadcasted());
    }

    #[test]
    fn deserialized_shapes_are_validated() {
        let shape: Shape =
            serde_json::from_str(r#"{"dtype":"F32","lens":[2,3],"strides":[1,2]}"#)
                .expect("matching lengths and strides");
        assert_eq!(shape.lens(), &[2, 3]);
        assert!(!shape.is_standard());

        let err = serde_json::from_str::<Shape>(r#"{"dtype":"F32","lens":[2,3],"strides":[1]}"#)
            .expect_err("stride count mismatch");
        assert!(err.to_string().contains("2 lengths but 1 strides"), "{err}");
    }
}
