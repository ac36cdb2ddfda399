//! A tensor execution engine with scoped memory management.
//!
//! Tensors are handles to storage owned by a [`Backend`](loom::device::Backend). Every
//! op output is tracked by the innermost open scope, and closing a scope disposes
//! everything it created except what it returns:
//!
//! ```no_run
//! use weft::prelude::*;
//!
//! # fn main() -> Result<(), EngineError> {
//! let cpu = CpuBuilder::new().add_default_ops().build();
//! let engine = EngineBuilder::new(cpu).build();
//!
//! let y = engine.scope(|engine| {
//!     let x = engine.tensor([3], [2.0f32, 1.0, 3.0])?;
//!     let e = engine.exp(&x)?;
//!     engine.softmax(&e)
//! })?;
//! assert_eq!(engine.num_tensors(), 1);
//! println!("{}", engine.read(&y)?);
//! # Ok(())
//! # }
//! ```

pub mod hal;
pub mod loom;

pub use weft_derive::Operands;

pub mod prelude {
    pub use crate::{
        hal::frontend::TensorOps,
        loom::{
            device::{Backend, Cpu, CpuBuilder, Gpu, GpuBuilder},
            engine::{Dispatch, Engine, EngineBuilder, MemoryInfo, Scope},
            error::EngineError,
            num::{DataBuffer, DataType},
            shape::Shape,
            tensor::Tensor,
        },
    };
}
