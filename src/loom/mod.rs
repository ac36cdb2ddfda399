//! The `loom` module is the runtime core: tensors as handles, the backends that own
//! their storage, and the engine that runs ops and bounds tensor lifetimes by scopes.
//!
//! ## Key Components
//! 1. **Engine** ([`engine`]): dispatches [`ops::TensorOp`]s, tracks every output in the
//!    active scope and disposes whatever a closing scope does not return.
//! 2. **Backends** ([`device`]): a host backend and a device backend generic over a
//!    [`device::gpu::GpuContext`], which compiles and caches generated WGSL programs.
//! 3. **Values** ([`num`], [`shape`], [`tensor`]): data types, host buffers and shapes.
//! 4. **Flags** ([`env`]): device capabilities, probed once and overridable.

#![cfg_attr(target_arch = "wasm32", allow(async_fn_in_trait))]

pub mod device;
pub mod engine;
pub mod env;
pub mod error;
pub mod num;
pub mod ops;
pub mod platform;
pub mod scope;
pub mod shape;
pub mod tensor;
