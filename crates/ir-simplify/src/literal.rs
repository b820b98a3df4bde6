use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize};

use crate::shape::{DType, Shape, ShapeError};

/// Scalar types that can be stored inside a [`Literal`].
pub trait Element: Copy + fmt::Debug {
    const DTYPE: DType;

    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64(value: f64) -> Self {
                value as $ty
            }
        }
    };
}

impl_element!(i32, DType::Si32);
impl_element!(i64, DType::Si64);
impl_element!(f32, DType::F32);
impl_element!(f64, DType::F64);

/// Immutable tensor constant embedded in a program.
///
/// The payload is little-endian and always laid out in the standard
/// (row-major) order of `shape`; two literals compare equal when both the
/// shape and the bytes match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Literal {
    shape: Shape,
    bytes: Arc<[u8]>,
}

impl Literal {
    /// Builds a literal from typed values.
    pub fn new<T: Element>(lens: impl Into<Vec<usize>>, values: &[T]) -> Result<Self, ShapeError> {
        let shape = Shape::new(T::DTYPE, lens);
        if shape.elements() != values.len() {
            return Err(ShapeError::new(
                "literal",
                format!(
                    "shape {} holds {} elements but {} values were given",
                    shape,
                    shape.elements(),
                    values.len()
                ),
            ));
        }
        let mut bytes = Vec::with_capacity(values.len() * T::DTYPE.size_in_bytes());
        for value in values {
            value.write_le(&mut bytes);
        }
        Ok(Self {
            shape,
            bytes: Arc::from(bytes),
        })
    }

    /// Single-element literal of shape `{1}`.
    pub fn scalar<T: Element>(value: T) -> Self {
        let mut bytes = Vec::with_capacity(T::DTYPE.size_in_bytes());
        value.write_le(&mut bytes);
        Self {
            shape: Shape::scalar(T::DTYPE),
            bytes: Arc::from(bytes),
        }
    }

    /// Builds a literal of the given shape's element type by casting `values`.
    ///
    /// Only the lengths of `shape` are used; the result is always standard.
    pub fn from_f64_values(shape: &Shape, values: &[f64]) -> Result<Self, ShapeError> {
        let lens = shape.lens().to_vec();
        match shape.dtype() {
            DType::Si32 => Self::new(lens, &cast_values::<i32>(values)),
            DType::Si64 => Self::new(lens, &cast_values::<i64>(values)),
            DType::F32 => Self::new(lens, &cast_values::<f32>(values)),
            DType::F64 => Self::new(lens, values),
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.shape.dtype()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decodes the payload as `T`, or `None` when the element type differs.
    pub fn to_vec<T: Element>(&self) -> Option<Vec<T>> {
        if T::DTYPE != self.dtype() {
            return None;
        }
        Some(
            self.bytes
                .chunks_exact(T::DTYPE.size_in_bytes())
                .map(T::read_le)
                .collect(),
        )
    }

    /// Decodes the payload widened to `f64`.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        let width = self.dtype().size_in_bytes();
        let chunks = self.bytes.chunks_exact(width);
        match self.dtype() {
            DType::Si32 => chunks.map(|c| i32::read_le(c).to_f64()).collect(),
            DType::Si64 => chunks.map(|c| i64::read_le(c).to_f64()).collect(),
            DType::F32 => chunks.map(|c| f32::read_le(c).to_f64()).collect(),
            DType::F64 => chunks.map(f64::read_le).collect(),
        }
    }
}

fn cast_values<T: Element>(values: &[f64]) -> Vec<T> {
    values.iter().map(|&value| T::from_f64(value)).collect()
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = self.to_f64_vec();
        const PREVIEW: usize = 6;
        let shown: Vec<String> = values
            .iter()
            .take(PREVIEW)
            .map(|value| value.to_string())
            .collect();
        write!(f, "{{{}", shown.join(", "))?;
        if values.len() > PREVIEW {
            write!(f, ", ...")?;
        }
        write!(f, "}}")
    }
}

impl Serialize for Literal {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("Literal", 2)?;
        state.serialize_field("shape", &self.shape)?;
        state.serialize_field("bytes", self.bytes.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for Literal {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct LiteralHelper {
            shape: Shape,
            bytes: Vec<u8>,
        }

        let helper = LiteralHelper::deserialize(deserializer)?;
        let expected = helper
            .shape
            .lens()
            .iter()
            .try_fold(helper.shape.dtype().size_in_bytes(), |acc, &len| acc.checked_mul(len));
        match expected {
            Some(expected) if expected == helper.bytes.len() => {}
            Some(expected) => {
                return Err(serde::de::Error::custom(format!(
                    "literal payload has {} bytes, shape {} needs {}",
                    helper.bytes.len(),
                    helper.shape,
                    expected
                )))
            }
            None => {
                return Err(serde::de::Error::custom(format!(
                    "shape {} is too large for a literal",
                    helper.shape
                )))
            }
        }
        Ok(Literal {
            shape: helper.shape.standard(),
            bytes: Arc::from(helper.bytes),
        })
    }
}

/// Deterministic pseudo-random literal for the given shape.
///
/// Integers are drawn from `[-8, 8]`, floats from `[-1, 1)`.
pub fn generate_literal(shape: &Shape, seed: u64) -> Literal {
    let mut rng = StdRng::seed_from_u64(seed);
    let values: Vec<f64> = (0..shape.elements())
        .map(|_| {
            if shape.dtype().is_integer() {
                f64::from(rng.gen_range(-8i32..=8))
            } else {
                rng.gen_range(-1.0..1.0)
            }
        })
        .collect();
    match Literal::from_f64_values(shape, &values) {
        Ok(literal) => literal,
        Err(err) => unreachable!("generated value count always matches: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_roundtrips_typed_values() {
        let literal = Literal::new(vec![2, 2], &[1.0f32, 2.0, 3.0, 4.0]).expect("literal");
        assert_eq!(literal.to_vec::<f32>(), Some(vec![1.0, 2.0, 3.0, 4.0]));
        assert_eq!(literal.to_vec::<i32>(), None);
    }

    #[test]
    fn literal_rejects_wrong_value_count() {
        let err = Literal::new(vec![3], &[1i32, 2]).expect_err("count mismatch");
        assert_eq!(err.op, "literal");
    }

    #[test]
    fn generated_literals_are_deterministic() {
        let shape = Shape::new(DType::F32, vec![4, 3]);
        assert_eq!(generate_literal(&shape, 7), generate_literal(&shape, 7));
        assert_ne!(generate_literal(&shape, 7), generate_literal(&shape, 8));
    }
}
