use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap as HashMap;

use super::{Backend, BackendError, execute_op};
use crate::loom::{
    error::EngineError,
    num::{DataBuffer, DataType},
    ops::{BackendOp, KernelIo, OpVTable, TensorOp, register_op},
    platform::BoxFuture,
    shape::Shape,
    tensor::TensorId,
};

#[derive(Debug, Clone)]
struct Record {
    shape: Shape,
    r#type: DataType,
    data: Option<DataBuffer>,
}

/// The host backend. Storage is a typed buffer per tensor; kernels are plain loops.
#[derive(Debug, Clone)]
pub struct Cpu {
    /// Operators that the backend is able to execute.
    ops: Arc<OpVTable<Self>>,
    /// Host buffers of all live tensors.
    buffers: Arc<RwLock<HashMap<TensorId, Record>>>,
}

impl Cpu {
    /// Fetches the contents of a tensor for a kernel.
    #[inline]
    pub fn fetch(&self, id: TensorId) -> Result<DataBuffer, BackendError> {
        let buffers = self.buffers.read().expect("failed to lock");
        let record = buffers.get(&id).ok_or(BackendError::Unregistered(id))?;
        record.data.clone().ok_or(BackendError::Uninitialized(id))
    }
}

impl Backend for Cpu {
    #[inline]
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn register(&self, id: TensorId, shape: &Shape, r#type: DataType) -> Result<(), BackendError> {
        let mut buffers = self.buffers.write().expect("failed to lock");
        if buffers.contains_key(&id) {
            return Err(BackendError::Registered(id));
        }
        let shape = shape.clone();
        let data = None;
        buffers.insert(
            id,
            Record {
                shape,
                r#type,
                data,
            },
        );
        Ok(())
    }

    fn write(&self, id: TensorId, data: DataBuffer) -> Result<(), BackendError> {
        let mut buffers = self.buffers.write().expect("failed to lock");
        let record = buffers.get_mut(&id).ok_or(BackendError::Unregistered(id))?;
        if data.data_type() != record.r#type || data.len() != record.shape.size() {
            return Err(BackendError::Write {
                id,
                expected: record.r#type,
                size: record.shape.size(),
                actual: data.data_type(),
                len: data.len(),
            });
        }
        record.data = Some(data);
        Ok(())
    }

    #[inline]
    fn read(&self, id: TensorId) -> Result<DataBuffer, BackendError> {
        self.fetch(id)
    }

    #[inline]
    fn read_async(&self, id: TensorId) -> BoxFuture<'static, Result<DataBuffer, BackendError>> {
        Box::pin(futures::future::ready(self.fetch(id)))
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(op = %op.name())))]
    fn execute(&self, op: &dyn TensorOp, io: &KernelIo) -> Result<(), EngineError> {
        execute_op(self, &self.ops, op, io)
    }

    #[inline]
    fn contains(&self, id: TensorId) -> bool {
        self.buffers.read().expect("failed to lock").contains_key(&id)
    }

    #[inline]
    fn dispose_data(&self, id: TensorId) -> bool {
        self.buffers
            .write()
            .expect("failed to lock")
            .remove(&id)
            .is_some()
    }

    fn dispose(&self) {
        self.buffers.write().expect("failed to lock").clear();
    }

    #[inline]
    fn num_tensors(&self) -> usize {
        self.buffers.read().expect("failed to lock").len()
    }
}

#[derive(Debug, Default, Clone)]
pub struct CpuBuilder {
    pub ops: OpVTable<Cpu>,
}

impl CpuBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(self) -> Cpu {
        let ops = Arc::new(self.ops);
        let buffers = Default::default();
        Cpu { ops, buffers }
    }

    pub fn add_op<Op: BackendOp<Cpu> + 'static>(mut self) -> Self {
        register_op::<Cpu, Op>(&mut self.ops);
        self
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::CpuBuilder;
    use crate::loom::{
        device::{Backend, BackendError},
        num::{DataBuffer, DataType, NAN_I32},
        shape::Shape,
        tensor::TensorId,
    };

    #[tokio::test]
    async fn test_write_read() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build();
        let id = TensorId::new();
        cpu.register(id, &Shape::from([3]), DataType::I32)?;
        assert!(matches!(cpu.read(id), Err(BackendError::Uninitialized(_))));

        let data = DataBuffer::from(vec![1, NAN_I32, 3]);
        cpu.write(id, data.clone())?;
        assert_eq!(cpu.read(id)?, data);
        assert_eq!(cpu.read_async(id).await?, data);

        let err = cpu.write(id, DataBuffer::from(vec![1.0f32, 2.0, 3.0]));
        assert!(matches!(err, Err(BackendError::Write { .. })));

        assert_eq!(cpu.num_tensors(), 1);
        assert!(cpu.dispose_data(id));
        assert!(!cpu.dispose_data(id));
        assert_eq!(cpu.num_tensors(), 0);
        Ok(())
    }

    #[test]
    fn test_write_unregistered() {
        let cpu = CpuBuilder::new().build();
        let id = TensorId::new();
        let err = cpu.write(id, DataBuffer::from(vec![1.0f32]));
        assert!(matches!(err, Err(BackendError::Unregistered(x)) if x == id));
    }
}
