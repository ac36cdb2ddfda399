use std::sync::Arc;

use derive_more::{Deref, Display};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The logical shape of a tensor. Rank 0 is a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deref, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("[{}]", _0.iter().format(", "))]
pub struct Shape(Arc<[usize]>);

impl Default for Shape {
    fn default() -> Self {
        Self::scalar()
    }
}

impl Shape {
    #[inline]
    pub fn new(dims: impl Into<Arc<[usize]>>) -> Self {
        Self(dims.into())
    }

    #[inline]
    pub fn scalar() -> Self {
        Self(Arc::new([]))
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Number of elements. A scalar has one element.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.iter().product()
    }

    /// Row-major strides, in elements.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.rank()];
        for index in (0..self.rank().saturating_sub(1)).rev() {
            strides[index] = strides[index + 1] * self.0[index + 1];
        }
        strides
    }

    /// Expands a flat row-major index into coordinates.
    pub fn coords(&self, mut index: usize) -> Vec<usize> {
        let mut coords = vec![0; self.rank()];
        for (coord, stride) in coords.iter_mut().zip_eq(self.strides()) {
            *coord = index / stride;
            index -= *coord * stride;
        }
        coords
    }

    /// The shape both operands broadcast to, aligning dimensions from the right.
    /// Returns `None` if some pair of dimensions differs and neither is `1`.
    pub fn broadcast(&self, other: &Shape) -> Option<Shape> {
        let rank = self.rank().max(other.rank());
        let dim = |shape: &Shape, index: usize| match (index + shape.rank()).checked_sub(rank) {
            Some(index) => shape[index],
            None => 1,
        };
        (0..rank)
            .map(|index| match (dim(self, index), dim(other, index)) {
                (x, y) if x == y => Some(x),
                (1, y) => Some(y),
                (x, 1) => Some(x),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(Shape::from)
    }

    /// Maps coordinates in a broadcast output onto a flat index into `self`.
    /// Axes of size `1` are pinned at `0`; leading output axes that `self` lacks are ignored.
    pub fn broadcast_index(&self, out_coords: &[usize]) -> usize {
        let offset = out_coords.len() - self.rank();
        self.strides()
            .iter()
            .enumerate()
            .map(|(axis, stride)| match self[axis] {
                1 => 0,
                _ => out_coords[offset + axis] * stride,
            })
            .sum()
    }

    /// The same shape with the last axis removed.
    pub fn without_last(&self) -> Shape {
        match self.split_last() {
            Some((_, rest)) => Shape::from(rest),
            None => Shape::scalar(),
        }
    }
}

impl From<Vec<usize>> for Shape {
    fn from(value: Vec<usize>) -> Self {
        Self(value.into())
    }
}

impl From<&[usize]> for Shape {
    fn from(value: &[usize]) -> Self {
        Self(value.into())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(value: [usize; N]) -> Self {
        Self(value.into())
    }
}

impl From<&Shape> for Shape {
    fn from(value: &Shape) -> Self {
        value.clone()
    }
}

/// Rows and columns of the 2-D device resource holding a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("[{}, {}]", _0[0], _0[1])]
pub struct TexShape(pub [usize; 2]);

impl TexShape {
    /// Packs a logical shape into 2-D, keeping row-major element order.
    ///
    /// Low ranks fold their leading axes into rows; anything that would exceed
    /// `max` on either side falls back to the most square factorization of the size.
    pub fn from_shape(shape: &Shape, max: usize) -> Self {
        let size = shape.size();
        let fits = |rows: usize, cols: usize| rows <= max && cols <= max;
        match shape.rank() {
            0 | 1 if size <= max => Self([size, 1]),
            2 if fits(shape[0], shape[1]) => Self([shape[0], shape[1]]),
            3 if fits(shape[0] * shape[1], shape[2]) => Self([shape[0] * shape[1], shape[2]]),
            4 if fits(shape[0] * shape[1] * shape[2], shape[3]) => {
                Self([shape[0] * shape[1] * shape[2], shape[3]])
            }
            _ => Self::squarish(size),
        }
    }

    /// The factorization `[rows, cols]` of `size` with `rows <= cols` closest to a square.
    pub fn squarish(size: usize) -> Self {
        let root = (size as f64).sqrt().floor() as usize;
        let rows = (1..=root.max(1))
            .rev()
            .find(|rows| size % rows == 0)
            .unwrap_or(1);
        Self([rows, size / rows])
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.0[0]
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.0[1]
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.0[0] * self.0[1]
    }
}
