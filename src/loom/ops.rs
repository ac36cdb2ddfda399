use std::{
    any::{Any, TypeId},
    borrow::Cow,
    fmt::Debug,
};

use rustc_hash::FxHashMap as HashMap;

use super::{
    error::EngineError,
    tensor::{Tensor, TensorInfo},
};

/// A named tensor input of an op.
#[derive(Debug, Clone, Copy)]
pub struct Operand<'a> {
    pub name: &'static str,
    pub tensor: &'a Tensor,
}

/// Lists an op's name and tensor inputs. Usually derived with `#[derive(Operands)]`.
pub trait Operands {
    fn name(&self) -> Cow<'static, str>;
    fn operands(&self) -> Vec<Operand<'_>>;
}

pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    #[inline]
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A logical operation dispatched through the engine.
pub trait TensorOp: Operands + AsAny + Debug + Send + Sync {
    /// Validates the operands and returns the shapes and types of the outputs.
    ///
    /// Called before any output storage is allocated, so a failure here leaves nothing behind.
    fn infer(&self) -> Result<Vec<TensorInfo>, EngineError>;
}

impl<'a> dyn TensorOp + 'a {
    #[inline]
    pub fn downcast_ref<Op: TensorOp + 'static>(&self) -> Option<&Op> {
        self.as_any().downcast_ref()
    }

    /// The [`TypeId`] of the concrete op, which keys backend vtables.
    #[inline]
    pub fn op_type(&self) -> TypeId {
        self.as_any().type_id()
    }
}

/// Inputs and freshly registered outputs of one kernel launch.
#[derive(Debug, Clone)]
pub struct KernelIo {
    pub inputs: Vec<Tensor>,
    pub outputs: Vec<Tensor>,
}

impl KernelIo {
    #[inline]
    pub fn input(&self, index: usize) -> &Tensor {
        &self.inputs[index]
    }

    #[inline]
    pub fn output(&self) -> &Tensor {
        &self.outputs[0]
    }
}

/// Implemented for each backend for each [`TensorOp`].
/// Defines the op's actual execution on the backend.
pub trait BackendOp<B>: TensorOp {
    fn execute(&self, backend: &B, io: &KernelIo) -> Result<(), EngineError>;
}

pub type OpFn<B> = fn(&B, &dyn TensorOp, &KernelIo) -> Result<(), EngineError>;
pub type OpVTable<B> = HashMap<TypeId, OpFn<B>>;

/// Inserts the kernel of `Op` into a vtable.
pub fn register_op<B, Op>(ops: &mut OpVTable<B>)
where
    Op: BackendOp<B> + 'static,
{
    let f: OpFn<B> = |backend, op, io| match op.downcast_ref::<Op>() {
        Some(op) => op.execute(backend, io),
        None => unreachable!(),
    };
    ops.insert(TypeId::of::<Op>(), f);
}
