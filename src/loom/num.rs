use std::sync::Arc;

use derive_more::{Display, From};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Sentinel stored in an `i32` buffer in place of NaN.
pub const NAN_I32: i32 = i32::MIN;
/// Sentinel stored in a boolean (byte) buffer in place of NaN.
pub const NAN_BOOL: u8 = 255;

/// Logical element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    #[display("float32")]
    F32,
    #[display("int32")]
    I32,
    #[display("bool")]
    Bool,
}

impl DataType {
    /// Size in bytes of one element in host memory.
    pub const fn size(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::I32 => 4,
            DataType::Bool => 1,
        }
    }
}

/// A host element type that maps onto a [`DataType`].
pub trait Scalar: Copy + Send + Sync + 'static {
    const DATA_TYPE: DataType;

    /// Borrows the elements of a buffer of this type.
    fn slice(buffer: &DataBuffer) -> Option<&[Self]>;
}

impl Scalar for f32 {
    const DATA_TYPE: DataType = DataType::F32;

    fn slice(buffer: &DataBuffer) -> Option<&[Self]> {
        match buffer {
            DataBuffer::F32(data) => Some(data),
            _ => None,
        }
    }
}

impl Scalar for i32 {
    const DATA_TYPE: DataType = DataType::I32;

    fn slice(buffer: &DataBuffer) -> Option<&[Self]> {
        match buffer {
            DataBuffer::I32(data) => Some(data),
            _ => None,
        }
    }
}

impl Scalar for u8 {
    const DATA_TYPE: DataType = DataType::Bool;

    fn slice(buffer: &DataBuffer) -> Option<&[Self]> {
        match buffer {
            DataBuffer::Bool(data) => Some(data),
            _ => None,
        }
    }
}

/// A host-resident typed buffer. Cheap to clone.
#[derive(Debug, Clone, PartialEq, From)]
pub enum DataBuffer {
    F32(Arc<[f32]>),
    I32(Arc<[i32]>),
    Bool(Arc<[u8]>),
}

impl From<Vec<f32>> for DataBuffer {
    fn from(value: Vec<f32>) -> Self {
        Self::F32(value.into())
    }
}

impl From<Vec<i32>> for DataBuffer {
    fn from(value: Vec<i32>) -> Self {
        Self::I32(value.into())
    }
}

impl From<Vec<bool>> for DataBuffer {
    fn from(value: Vec<bool>) -> Self {
        Self::Bool(value.into_iter().map(u8::from).collect())
    }
}

impl<const N: usize> From<[f32; N]> for DataBuffer {
    fn from(value: [f32; N]) -> Self {
        Self::F32(value.into())
    }
}

impl<const N: usize> From<[i32; N]> for DataBuffer {
    fn from(value: [i32; N]) -> Self {
        Self::I32(value.into())
    }
}

impl<const N: usize> From<[bool; N]> for DataBuffer {
    fn from(value: [bool; N]) -> Self {
        Self::Bool(value.into_iter().map(u8::from).collect())
    }
}

impl DataBuffer {
    /// A zero-filled buffer.
    pub fn zeros(r#type: DataType, len: usize) -> Self {
        match r#type {
            DataType::F32 => Self::F32(vec![0.0; len].into()),
            DataType::I32 => Self::I32(vec![0; len].into()),
            DataType::Bool => Self::Bool(vec![0; len].into()),
        }
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        match self {
            DataBuffer::F32(_) => DataType::F32,
            DataBuffer::I32(_) => DataType::I32,
            DataBuffer::Bool(_) => DataType::Bool,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        match self {
            DataBuffer::F32(data) => data.len(),
            DataBuffer::I32(data) => data.len(),
            DataBuffer::Bool(data) => data.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrows the elements as `T`, or `None` if the type differs.
    #[inline]
    pub fn as_slice<T: Scalar>(&self) -> Option<&[T]> {
        T::slice(self)
    }

    /// Widens every element to `f64`, mapping the dtype's NaN sentinel to NaN.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            DataBuffer::F32(data) => data.iter().map(|&x| x as f64).collect(),
            DataBuffer::I32(data) => data
                .iter()
                .map(|&x| if x == NAN_I32 { f64::NAN } else { x as f64 })
                .collect(),
            DataBuffer::Bool(data) => data
                .iter()
                .map(|&x| if x == NAN_BOOL { f64::NAN } else { x as f64 })
                .collect(),
        }
    }

    /// Converts to the `f32` representation used by device textures.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            DataBuffer::F32(data) => data.to_vec(),
            _ => self.to_f64_vec().into_iter().map(|x| x as f32).collect(),
        }
    }

    /// Builds a buffer of `r#type` from wide values. Integer types are rounded,
    /// booleans are `1` for any non-zero value, and NaN becomes the dtype's sentinel.
    pub fn from_f64(values: impl IntoIterator<Item = f64>, r#type: DataType) -> Self {
        let values = values.into_iter();
        match r#type {
            DataType::F32 => Self::F32(values.map(|x| x as f32).collect()),
            DataType::I32 => Self::I32(
                values
                    .map(|x| if x.is_nan() { NAN_I32 } else { x.round() as i32 })
                    .collect(),
            ),
            DataType::Bool => Self::Bool(
                values
                    .map(|x| match x {
                        x if x.is_nan() => NAN_BOOL,
                        x if x != 0.0 => 1,
                        _ => 0,
                    })
                    .collect(),
            ),
        }
    }

    /// Reinterprets values downloaded from a device texture as `r#type`.
    pub fn from_f32(values: &[f32], r#type: DataType) -> Self {
        match r#type {
            DataType::F32 => Self::F32(values.into()),
            _ => Self::from_f64(values.iter().map(|&x| x as f64), r#type),
        }
    }

    /// Returns `true` if any element is NaN (or the dtype's NaN sentinel).
    pub fn has_nan(&self) -> bool {
        match self {
            DataBuffer::F32(data) => data.iter().any(|x| x.is_nan()),
            DataBuffer::I32(data) => data.contains(&NAN_I32),
            DataBuffer::Bool(data) => data.contains(&NAN_BOOL),
        }
    }
}

impl std::fmt::Display for DataBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataBuffer::F32(data) => write!(f, "[{}]", data.iter().format(", ")),
            DataBuffer::I32(data) => write!(f, "[{}]", data.iter().format(", ")),
            DataBuffer::Bool(data) => write!(f, "[{}]", data.iter().format(", ")),
        }
    }
}
