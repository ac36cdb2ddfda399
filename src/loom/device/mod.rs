use std::borrow::Cow;

use thiserror::Error;

use super::{
    error::EngineError,
    num::{DataBuffer, DataType},
    ops::{KernelIo, OpVTable, TensorOp},
    platform::BoxFuture,
    shape::Shape,
    tensor::TensorId,
};

pub use cpu::{Cpu, CpuBuilder};
pub use gpu::{Gpu, GpuBuildError, GpuBuilder, GpuError};

pub mod cpu;
pub mod gpu;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("op `{0}` is not registered on this backend")]
    UnknownOp(Cow<'static, str>),
    #[error("tensor {0} is not registered")]
    Unregistered(TensorId),
    #[error("tensor {0} is already registered")]
    Registered(TensorId),
    #[error("tensor {0} has no data")]
    Uninitialized(TensorId),
    #[error("cannot write {len} {actual} values into tensor {id} of {size} {expected} values")]
    Write {
        id: TensorId,
        expected: DataType,
        size: usize,
        actual: DataType,
        len: usize,
    },
    #[error(transparent)]
    Gpu(#[from] GpuError),
}

/// Storage and kernel execution for tensors, keyed by [`TensorId`].
///
/// Every live tensor has exactly one storage record, created by [`Backend::register`]
/// and removed by [`Backend::dispose_data`].
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Declares storage for a tensor without data.
    fn register(&self, id: TensorId, shape: &Shape, r#type: DataType) -> Result<(), BackendError>;

    /// Replaces the contents of a registered tensor.
    fn write(&self, id: TensorId, data: DataBuffer) -> Result<(), BackendError>;

    /// Fetches the contents of a tensor, blocking on the device if needed.
    fn read(&self, id: TensorId) -> Result<DataBuffer, BackendError>;

    /// Fetches the contents of a tensor without blocking the caller.
    fn read_async(&self, id: TensorId) -> BoxFuture<'static, Result<DataBuffer, BackendError>>;

    /// Runs the kernel registered for the concrete type of `op`.
    fn execute(&self, op: &dyn TensorOp, io: &KernelIo) -> Result<(), EngineError>;

    fn contains(&self, id: TensorId) -> bool;

    /// Frees a tensor's storage. Returns `false` if it was already gone.
    fn dispose_data(&self, id: TensorId) -> bool;

    /// Frees all storage and device resources.
    fn dispose(&self);

    /// Number of live storage records.
    fn num_tensors(&self) -> usize;

    /// Number of device resources currently held. Always `0` on the host.
    fn num_resources(&self) -> usize {
        0
    }
}

/// Looks up and runs the kernel for `op`.
pub(crate) fn execute_op<B>(
    backend: &B,
    ops: &OpVTable<B>,
    op: &dyn TensorOp,
    io: &KernelIo,
) -> Result<(), EngineError> {
    match ops.get(&op.op_type()) {
        Some(f) => f(backend, op, io),
        #[cfg(feature = "strict")]
        None => panic!("unable to execute op `{}`", op.name()),
        #[cfg(not(feature = "strict"))]
        None => {
            log::error!("unable to execute op `{}`", op.name());
            Err(BackendError::UnknownOp(op.name()).into())
        }
    }
}
