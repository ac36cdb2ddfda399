use std::fmt::Display;

use thiserror::Error;

use super::{device::BackendError, num::DataType, scope::ScopeId, tensor::TensorId};

/// Operand shapes are incompatible with an op's contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("shape mismatch for `{operand}`: expected {expected}, found {actual}")]
pub struct ShapeMismatchError {
    pub operand: String,
    pub expected: String,
    pub actual: String,
}

impl ShapeMismatchError {
    pub fn new(operand: impl Into<String>, expected: impl Display, actual: impl Display) -> Self {
        Self {
            operand: operand.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

/// An operand has a data type the op does not accept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("data type mismatch for `{operand}`: expected {expected}, found {actual}")]
pub struct DTypeMismatchError {
    pub operand: String,
    pub expected: String,
    pub actual: DataType,
}

impl DTypeMismatchError {
    pub fn new(operand: impl Into<String>, expected: impl Display, actual: DataType) -> Self {
        Self {
            operand: operand.into(),
            expected: expected.to_string(),
            actual,
        }
    }
}

/// Misuse of the engine API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("safe mode requires tensors to be created inside an explicit scope")]
    NoScope,
    #[error("tensor {0} is already tracked by a scope")]
    AlreadyTracked(TensorId),
    #[error("tensor {0} has been disposed")]
    Disposed(TensorId),
    #[error("the root scope cannot be ended")]
    EndRootScope,
    #[error("scope {0} is not open")]
    ScopeClosed(ScopeId),
}

/// An op or device capability that is not available.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnsupportedFeatureError {
    #[error("`{op}` does not support rank {rank} (max {max})")]
    Rank { op: String, rank: usize, max: usize },
    #[error("`{op}` does not support axis {axis} of a rank {rank} tensor")]
    Axis { op: String, axis: usize, rank: usize },
    #[error("required device feature `{0}` is not available")]
    Feature(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Shape(#[from] ShapeMismatchError),
    #[error(transparent)]
    DType(#[from] DTypeMismatchError),
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error(transparent)]
    Unsupported(#[from] UnsupportedFeatureError),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("NaN detected in the output of `{0}`")]
    NotANumber(String),
}

impl EngineError {
    /// Fatal errors come from the device or the backend, not from the caller's inputs.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Backend(_))
    }
}
