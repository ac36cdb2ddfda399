use derive_more::Display;

use super::{num::DataType, shape::Shape};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorMarker;

/// Process-unique identifier of a tensor's backend storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("#{}", _0.get())]
pub struct TensorId(uid::Id<TensorMarker>);

impl TensorId {
    #[inline]
    pub fn new() -> Self {
        Self(uid::Id::new())
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.get()
    }
}

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

/// Shape and type of a tensor that is about to be created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorInfo {
    pub shape: Shape,
    pub r#type: DataType,
}

impl std::fmt::Display for TensorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.r#type, self.shape)
    }
}

impl TensorInfo {
    #[inline]
    pub fn new(shape: impl Into<Shape>, r#type: DataType) -> Self {
        let shape = shape.into();
        Self { shape, r#type }
    }
}

/// A handle to backend-resident tensor storage.
///
/// The handle itself is plain metadata and cheap to clone. The storage it names
/// is owned by the backend and lives until the tensor is disposed, either
/// explicitly or by the scope that tracks it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[display("Tensor({id}, {info})")]
pub struct Tensor {
    id: TensorId,
    info: TensorInfo,
}

impl Tensor {
    /// Creates a handle with a fresh id. Storage is not registered.
    #[inline]
    pub(crate) fn new(info: TensorInfo) -> Self {
        let id = TensorId::new();
        Self { id, info }
    }

    #[inline]
    pub fn id(&self) -> TensorId {
        self.id
    }

    #[inline]
    pub fn info(&self) -> &TensorInfo {
        &self.info
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.info.shape
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.info.r#type
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.info.shape.rank()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.info.shape.size()
    }
}

#[cfg(test)]
mod tests {
    use super::{Tensor, TensorInfo};
    use crate::loom::num::DataType;

    #[test]
    fn test_unique_ids() {
        let info = TensorInfo::new([2, 3], DataType::F32);
        let a = Tensor::new(info.clone());
        let b = Tensor::new(info);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.shape(), b.shape());
        assert_eq!(a.size(), 6);
        assert_eq!(format!("{}", a.info()), "float32 [2, 3]");
    }
}
