use std::{
    future::Future,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use instant::Instant;
use itertools::Itertools;

use super::{
    device::Backend,
    error::{DTypeMismatchError, EngineError, ShapeMismatchError, UsageError},
    num::{DataBuffer, DataType, Scalar},
    ops::{KernelIo, TensorOp},
    scope::{ScopeId, ScopeResult, ScopeStack},
    shape::Shape,
    tensor::{Tensor, TensorInfo},
};

/// Snapshot of live resources, for leak checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryInfo {
    pub num_tensors: usize,
    pub num_textures: usize,
}

#[derive(Debug, Clone)]
pub struct EngineBuilder<B> {
    backend: B,
    safe_mode: bool,
    debug_mode: bool,
}

impl<B: Backend> EngineBuilder<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            safe_mode: false,
            debug_mode: false,
        }
    }

    /// Requires every tensor to be created inside an explicit scope.
    pub fn safe_mode(mut self, safe_mode: bool) -> Self {
        self.safe_mode = safe_mode;
        self
    }

    /// Reads back every op's outputs to time it and to catch NaN.
    pub fn debug_mode(mut self, debug_mode: bool) -> Self {
        self.debug_mode = debug_mode;
        self
    }

    pub fn build(self) -> Engine<B> {
        let Self {
            backend,
            safe_mode,
            debug_mode,
        } = self;
        if debug_mode {
            log::warn!("debug mode is enabled: every op blocks on reading its outputs");
        }
        Engine {
            backend,
            scopes: Mutex::new(ScopeStack::new()),
            safe_mode,
            debug_mode,
        }
    }
}

/// Runs ops on a backend and bounds the lifetime of their results by scopes.
#[derive(Debug)]
pub struct Engine<B> {
    backend: B,
    scopes: Mutex<ScopeStack>,
    safe_mode: bool,
    debug_mode: bool,
}

impl<B: Backend> Engine<B> {
    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[inline]
    pub fn safe_mode(&self) -> bool {
        self.safe_mode
    }

    #[inline]
    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    #[inline]
    fn scopes(&self) -> MutexGuard<'_, ScopeStack> {
        self.scopes.lock().expect("failed to lock")
    }

    /// The scope new tensors are tracked in.
    #[inline]
    pub fn active_scope(&self) -> ScopeId {
        self.scopes().active()
    }

    /// Number of open scopes above the root.
    #[inline]
    pub fn depth(&self) -> usize {
        self.scopes().depth()
    }

    /// Opens a scope nested in the active one.
    pub fn start_scope(&self) -> Result<ScopeId, EngineError> {
        self.open_scope(self.active_scope(), None)
    }

    /// Closes the active scope, keeping every tensor reachable from `result`.
    pub fn end_scope<R: ScopeResult + ?Sized>(&self, result: &R) -> Result<(), EngineError> {
        self.close_scope(self.active_scope(), result)
    }

    pub(crate) fn open_scope(
        &self,
        parent: ScopeId,
        name: Option<&str>,
    ) -> Result<ScopeId, EngineError> {
        let id = self.scopes().start(parent, name)?;
        log::debug!("open {id} ({})", name.unwrap_or("anonymous"));
        Ok(id)
    }

    /// Closes `scope`. Tensors it owns move to its parent if reachable from `result`
    /// and are disposed otherwise.
    pub fn close_scope<R: ScopeResult + ?Sized>(
        &self,
        scope: ScopeId,
        result: &R,
    ) -> Result<(), EngineError> {
        let keep = result.tensor_ids();
        let disposed = self.scopes().end(scope, &keep)?;
        log::debug!("close {scope}, disposing {} tensors", disposed.len());
        for id in disposed {
            self.backend.dispose_data(id);
        }
        Ok(())
    }

    /// Closes a scope from a drop guard. Never panics.
    fn close_scope_quietly(&self, scope: ScopeId) {
        let disposed = match self.scopes.lock() {
            Ok(mut scopes) => scopes.end(scope, &Default::default()),
            Err(_) => return,
        };
        match disposed {
            Ok(disposed) => {
                log::debug!("unwind {scope}, disposing {} tensors", disposed.len());
                for id in disposed {
                    self.backend.dispose_data(id);
                }
            }
            Err(err) => log::warn!("failed to close {scope}: {err}"),
        }
    }

    /// Runs `f` in a fresh scope. Every tensor created inside is disposed when it
    /// returns, except those reachable from its result, which move to the enclosing scope.
    ///
    /// The scope is closed even if `f` fails or panics; on failure nothing is kept.
    pub fn scope<R, F>(&self, f: F) -> Result<R, EngineError>
    where
        R: ScopeResult,
        F: FnOnce(&Self) -> Result<R, EngineError>,
    {
        self.run_scope(None, f)
    }

    /// A named [`Engine::scope`]. The name shows up in logs.
    pub fn tidy<R, F>(&self, name: &str, f: F) -> Result<R, EngineError>
    where
        R: ScopeResult,
        F: FnOnce(&Self) -> Result<R, EngineError>,
    {
        self.run_scope(Some(name), f)
    }

    fn run_scope<R, F>(&self, name: Option<&str>, f: F) -> Result<R, EngineError>
    where
        R: ScopeResult,
        F: FnOnce(&Self) -> Result<R, EngineError>,
    {
        let guard = ScopeGuard::open(self, self.active_scope(), name)?;
        let output = f(self);
        guard.close(output)
    }

    /// Runs an asynchronous body in a fresh scope.
    ///
    /// The scope nests in the one active at the call, not at the first poll, so the
    /// result lands where the call was made. The body gets a [`Scope`] handle; tensors
    /// made through it are tracked by that scope no matter which scopes other tasks
    /// open in the meantime. The scope is closed when the body finishes, fails, or is
    /// dropped before completion.
    pub fn scope_async<'a, R, F, Fut>(
        &'a self,
        f: F,
    ) -> impl Future<Output = Result<R, EngineError>> + 'a
    where
        R: ScopeResult + 'a,
        F: FnOnce(Scope<'a, B>) -> Fut + 'a,
        Fut: Future<Output = Result<R, EngineError>> + 'a,
    {
        let parent = self.active_scope();
        async move {
            let guard = ScopeGuard::open(self, parent, None)?;
            let scope = Scope {
                engine: self,
                id: guard.id,
            };
            let output = f(scope).await;
            guard.close(output)
        }
    }

    fn check_scope(&self, scope: ScopeId) -> Result<(), EngineError> {
        let scopes = self.scopes();
        if self.safe_mode && scope == scopes.root() {
            return Err(UsageError::NoScope.into());
        }
        if !scopes.is_open(scope) {
            return Err(UsageError::ScopeClosed(scope).into());
        }
        Ok(())
    }

    fn check_alive(&self, tensor: &Tensor) -> Result<(), EngineError> {
        match self.backend.contains(tensor.id()) {
            true => Ok(()),
            false => Err(UsageError::Disposed(tensor.id()).into()),
        }
    }

    /// Tracks `tensor` in the active scope.
    pub fn track(&self, tensor: &Tensor) -> Result<(), EngineError> {
        self.track_in(self.active_scope(), tensor)
    }

    pub(crate) fn track_in(&self, scope: ScopeId, tensor: &Tensor) -> Result<(), EngineError> {
        self.check_scope(scope)?;
        self.check_alive(tensor)?;
        self.scopes().track(scope, tensor.id())?;
        Ok(())
    }

    /// Exempts `tensor` from disposal by any scope. It lives until disposed explicitly.
    pub fn keep(&self, tensor: &Tensor) -> Result<(), EngineError> {
        let mut scopes = self.scopes();
        if self.safe_mode && scopes.depth() == 0 {
            return Err(UsageError::NoScope.into());
        }
        scopes.untrack(tensor.id());
        Ok(())
    }

    /// Frees a tensor's storage. Returns `false` if it was already disposed.
    pub fn dispose(&self, tensor: &Tensor) -> bool {
        self.scopes().untrack(tensor.id());
        self.backend.dispose_data(tensor.id())
    }

    fn dispose_all<'a>(&self, tensors: impl IntoIterator<Item = &'a Tensor>) {
        let mut scopes = self.scopes();
        for tensor in tensors {
            scopes.untrack(tensor.id());
            self.backend.dispose_data(tensor.id());
        }
    }

    /// Creates a tensor from host data, tracked in the active scope.
    pub fn tensor(
        &self,
        shape: impl Into<Shape>,
        data: impl Into<DataBuffer>,
    ) -> Result<Tensor, EngineError> {
        self.tensor_in(self.active_scope(), shape.into(), data.into())
    }

    pub fn zeros(&self, shape: impl Into<Shape>, r#type: DataType) -> Result<Tensor, EngineError> {
        let shape = shape.into();
        let data = DataBuffer::zeros(r#type, shape.size());
        self.tensor_in(self.active_scope(), shape, data)
    }

    pub(crate) fn tensor_in(
        &self,
        scope: ScopeId,
        shape: Shape,
        data: DataBuffer,
    ) -> Result<Tensor, EngineError> {
        if data.len() != shape.size() {
            let expected = format!("{} values", shape.size());
            let actual = format!("{} values", data.len());
            return Err(ShapeMismatchError::new("data", expected, actual).into());
        }
        self.check_scope(scope)?;

        let tensor = Tensor::new(TensorInfo::new(shape, data.data_type()));
        self.backend
            .register(tensor.id(), tensor.shape(), tensor.data_type())?;
        let tracked = self
            .backend
            .write(tensor.id(), data)
            .map_err(EngineError::from)
            .and_then(|_| self.track_in(scope, &tensor));
        if let Err(err) = tracked {
            self.backend.dispose_data(tensor.id());
            return Err(err);
        }
        Ok(tensor)
    }

    /// Overwrites the contents of a tensor.
    pub fn write(&self, tensor: &Tensor, data: impl Into<DataBuffer>) -> Result<(), EngineError> {
        let data = data.into();
        self.check_alive(tensor)?;
        if data.data_type() != tensor.data_type() {
            let err = DTypeMismatchError::new("data", tensor.data_type(), data.data_type());
            return Err(err.into());
        }
        if data.len() != tensor.size() {
            let expected = format!("{} values", tensor.size());
            let actual = format!("{} values", data.len());
            return Err(ShapeMismatchError::new("data", expected, actual).into());
        }
        self.backend.write(tensor.id(), data)?;
        Ok(())
    }

    /// Reads a tensor back, blocking on the device if needed.
    pub fn read(&self, tensor: &Tensor) -> Result<DataBuffer, EngineError> {
        self.check_alive(tensor)?;
        Ok(self.backend.read(tensor.id())?)
    }

    pub async fn read_async(&self, tensor: &Tensor) -> Result<DataBuffer, EngineError> {
        self.check_alive(tensor)?;
        Ok(self.backend.read_async(tensor.id()).await?)
    }

    /// Reads a tensor back as a vector of `T`, which must match its data type.
    pub fn read_vec<T: Scalar>(&self, tensor: &Tensor) -> Result<Vec<T>, EngineError> {
        let mismatch = || DTypeMismatchError::new("tensor", T::DATA_TYPE, tensor.data_type());
        if tensor.data_type() != T::DATA_TYPE {
            return Err(mismatch().into());
        }
        let data = self.read(tensor)?;
        let data = data.as_slice::<T>().ok_or_else(mismatch)?;
        Ok(data.to_vec())
    }

    /// Runs `op`, tracking its outputs in the active scope.
    pub fn run<Op: TensorOp>(&self, op: Op) -> Result<Vec<Tensor>, EngineError> {
        self.dispatch_in(self.active_scope(), &op)
    }

    /// Validates `op`, allocates its outputs, executes it and tracks the outputs in `scope`.
    ///
    /// Nothing is left allocated if any step fails.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(op = %op.name())))]
    pub(crate) fn dispatch_in(
        &self,
        scope: ScopeId,
        op: &dyn TensorOp,
    ) -> Result<Vec<Tensor>, EngineError> {
        self.check_scope(scope)?;
        let operands = op.operands();
        for operand in &operands {
            self.check_alive(operand.tensor)?;
        }
        let infos = op.infer()?;

        let inputs = operands.iter().map(|x| x.tensor.clone()).collect_vec();
        let outputs = infos.into_iter().map(Tensor::new).collect_vec();
        for (index, output) in outputs.iter().enumerate() {
            let id = output.id();
            if let Err(err) = self
                .backend
                .register(id, output.shape(), output.data_type())
            {
                self.dispose_all(&outputs[..index]);
                return Err(err.into());
            }
        }
        let io = KernelIo { inputs, outputs };

        let start = Instant::now();
        let result = self
            .backend
            .execute(op, &io)
            .and_then(|_| match self.debug_mode {
                true => self.check_outputs(op, &io.outputs, start),
                false => Ok(()),
            })
            .and_then(|_| {
                io.outputs
                    .iter()
                    .try_for_each(|output| self.track_in(scope, output))
            });
        if let Err(err) = result {
            self.dispose_all(&io.outputs);
            return Err(err);
        }
        Ok(io.outputs)
    }

    fn check_outputs(
        &self,
        op: &dyn TensorOp,
        outputs: &[Tensor],
        start: Instant,
    ) -> Result<(), EngineError> {
        for output in outputs {
            let data = self.backend.read(output.id())?;
            if data.has_nan() {
                log::error!("NaN detected in the output of `{}`", op.name());
                return Err(EngineError::NotANumber(op.name().into()));
            }
        }
        log::info!(
            "{:<16} {:>12.3?} {}",
            op.name(),
            start.elapsed(),
            outputs.iter().map(|output| output.shape()).format(", ")
        );
        Ok(())
    }

    /// Wall time of `f`, including reading back every tensor it returns.
    /// Everything `f` creates is disposed.
    pub fn time<R, F>(&self, f: F) -> Result<Duration, EngineError>
    where
        R: ScopeResult,
        F: FnOnce(&Self) -> Result<R, EngineError>,
    {
        let start = Instant::now();
        self.scope(|engine| {
            let output = f(engine)?;
            let mut ids = vec![];
            output.tensors(&mut ids);
            for id in ids {
                engine.backend.read(id)?;
            }
            Ok(())
        })?;
        Ok(start.elapsed())
    }

    #[inline]
    pub fn num_tensors(&self) -> usize {
        self.backend.num_tensors()
    }

    #[inline]
    pub fn memory(&self) -> MemoryInfo {
        MemoryInfo {
            num_tensors: self.backend.num_tensors(),
            num_textures: self.backend.num_resources(),
        }
    }

    /// Closes every open scope and tears down the backend.
    pub fn teardown(&self) {
        let disposed = self.scopes().teardown();
        log::debug!("teardown, disposing {} tracked tensors", disposed.len());
        for id in disposed {
            self.backend.dispose_data(id);
        }
        self.backend.dispose();
    }
}

/// Closes its scope when dropped unless closed explicitly.
struct ScopeGuard<'a, B: Backend> {
    engine: &'a Engine<B>,
    id: ScopeId,
    closed: bool,
}

impl<'a, B: Backend> ScopeGuard<'a, B> {
    fn open(engine: &'a Engine<B>, parent: ScopeId, name: Option<&str>) -> Result<Self, EngineError> {
        let id = engine.open_scope(parent, name)?;
        let closed = false;
        Ok(Self { engine, id, closed })
    }

    fn close<R: ScopeResult>(
        mut self,
        output: Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        self.closed = true;
        match output {
            Ok(value) => {
                self.engine.close_scope(self.id, &value)?;
                Ok(value)
            }
            Err(err) => {
                self.engine.close_scope(self.id, &())?;
                Err(err)
            }
        }
    }
}

impl<B: Backend> Drop for ScopeGuard<'_, B> {
    fn drop(&mut self) {
        if !self.closed {
            self.engine.close_scope_quietly(self.id);
        }
    }
}

/// A handle to one open scope. Tensors made through it are tracked by that scope.
pub struct Scope<'a, B> {
    engine: &'a Engine<B>,
    id: ScopeId,
}

impl<B> Clone for Scope<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for Scope<'_, B> {}

impl<B> std::fmt::Debug for Scope<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Scope").field(&self.id).finish()
    }
}

impl<'a, B: Backend> Scope<'a, B> {
    #[inline]
    pub fn id(&self) -> ScopeId {
        self.id
    }

    #[inline]
    pub fn engine(&self) -> &'a Engine<B> {
        self.engine
    }

    pub fn tensor(
        &self,
        shape: impl Into<Shape>,
        data: impl Into<DataBuffer>,
    ) -> Result<Tensor, EngineError> {
        self.engine.tensor_in(self.id, shape.into(), data.into())
    }

    pub fn zeros(&self, shape: impl Into<Shape>, r#type: DataType) -> Result<Tensor, EngineError> {
        let shape = shape.into();
        let data = DataBuffer::zeros(r#type, shape.size());
        self.engine.tensor_in(self.id, shape, data)
    }

    pub fn track(&self, tensor: &Tensor) -> Result<(), EngineError> {
        self.engine.track_in(self.id, tensor)
    }

    pub fn keep(&self, tensor: &Tensor) -> Result<(), EngineError> {
        self.engine.keep(tensor)
    }

    pub fn run<Op: TensorOp>(&self, op: Op) -> Result<Vec<Tensor>, EngineError> {
        self.engine.dispatch_in(self.id, &op)
    }

    pub fn read(&self, tensor: &Tensor) -> Result<DataBuffer, EngineError> {
        self.engine.read(tensor)
    }

    pub async fn read_async(&self, tensor: &Tensor) -> Result<DataBuffer, EngineError> {
        self.engine.read_async(tensor).await
    }
}

/// Where ops run and their outputs get tracked: the engine's active scope, or a given one.
pub trait Dispatch {
    fn dispatch(&self, op: &dyn TensorOp) -> Result<Vec<Tensor>, EngineError>;

    /// Creates a tracked tensor from host data.
    fn constant(&self, shape: Shape, data: DataBuffer) -> Result<Tensor, EngineError>;

    /// Runs `f` in a scope nested in this one.
    fn nested<R, F>(&self, name: &str, f: F) -> Result<R, EngineError>
    where
        R: ScopeResult,
        F: FnOnce(&Self) -> Result<R, EngineError>;
}

impl<B: Backend> Dispatch for Engine<B> {
    fn dispatch(&self, op: &dyn TensorOp) -> Result<Vec<Tensor>, EngineError> {
        self.dispatch_in(self.active_scope(), op)
    }

    fn constant(&self, shape: Shape, data: DataBuffer) -> Result<Tensor, EngineError> {
        self.tensor_in(self.active_scope(), shape, data)
    }

    fn nested<R, F>(&self, name: &str, f: F) -> Result<R, EngineError>
    where
        R: ScopeResult,
        F: FnOnce(&Self) -> Result<R, EngineError>,
    {
        self.tidy(name, f)
    }
}

impl<B: Backend> Dispatch for Scope<'_, B> {
    fn dispatch(&self, op: &dyn TensorOp) -> Result<Vec<Tensor>, EngineError> {
        self.engine.dispatch_in(self.id, op)
    }

    fn constant(&self, shape: Shape, data: DataBuffer) -> Result<Tensor, EngineError> {
        self.engine.tensor_in(self.id, shape, data)
    }

    fn nested<R, F>(&self, name: &str, f: F) -> Result<R, EngineError>
    where
        R: ScopeResult,
        F: FnOnce(&Self) -> Result<R, EngineError>,
    {
        let guard = ScopeGuard::open(self.engine, self.id, Some(name))?;
        let scope = Scope {
            engine: self.engine,
            id: guard.id,
        };
        let output = f(&scope);
        guard.close(output)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Dispatch, Engine, EngineBuilder, MemoryInfo};
    use crate::loom::{
        device::{Backend, Cpu, CpuBuilder},
        error::{EngineError, ShapeMismatchError, UsageError},
        num::{DataBuffer, DataType},
        ops::{BackendOp, KernelIo, TensorOp},
        tensor::{Tensor, TensorInfo},
    };

    /// Doubles a float tensor; yields NaN for negative inputs.
    #[derive(Debug, weft_derive::Operands)]
    #[operands(crate = "crate")]
    struct DoubleOp {
        #[operand]
        x: Tensor,
    }

    impl TensorOp for DoubleOp {
        fn infer(&self) -> Result<Vec<TensorInfo>, EngineError> {
            Ok(vec![self.x.info().clone()])
        }
    }

    impl BackendOp<Cpu> for DoubleOp {
        fn execute(&self, backend: &Cpu, io: &KernelIo) -> Result<(), EngineError> {
            let x = backend.fetch(io.input(0).id())?.to_f64_vec();
            let output = x
                .into_iter()
                .map(|x| if x < 0.0 { f64::NAN } else { x * 2.0 });
            let output = DataBuffer::from_f64(output, io.output().data_type());
            backend.write(io.output().id(), output)?;
            Ok(())
        }
    }

    fn engine(safe_mode: bool, debug_mode: bool) -> Engine<Cpu> {
        let cpu = CpuBuilder::new().add_op::<DoubleOp>().build();
        EngineBuilder::new(cpu)
            .safe_mode(safe_mode)
            .debug_mode(debug_mode)
            .build()
    }

    fn double(engine: &impl Dispatch, x: &Tensor) -> Result<Tensor, EngineError> {
        let op = DoubleOp { x: x.clone() };
        Ok(engine.dispatch(&op)?.remove(0))
    }

    #[test]
    fn test_scope_keeps_result() -> Result<(), Box<dyn Error>> {
        let engine = engine(false, false);
        let y = engine.scope(|engine| {
            let x = engine.tensor([3], [1.0f32, 2.0, 3.0])?;
            let y = double(engine, &x)?;
            let z = double(engine, &y)?;
            assert_eq!(engine.num_tensors(), 3);
            Ok(z)
        })?;
        assert_eq!(engine.num_tensors(), 1);
        assert_eq!(engine.read_vec::<f32>(&y)?, vec![4.0, 8.0, 12.0]);
        assert_eq!(engine.depth(), 0);
        Ok(())
    }

    #[test]
    fn test_nested_scopes() -> Result<(), Box<dyn Error>> {
        let engine = engine(false, false);
        let (a, b) = engine.scope(|engine| {
            let x = engine.tensor([2], [1.0f32, 2.0])?;
            let a = engine.tidy("inner", |engine| {
                let y = double(engine, &x)?;
                double(engine, &y)
            })?;
            // `x` and `a` are alive, the intermediate is gone
            assert_eq!(engine.num_tensors(), 2);
            let b = double(engine, &a)?;
            Ok((a, b))
        })?;
        assert_eq!(engine.num_tensors(), 2);
        assert_eq!(engine.read_vec::<f32>(&a)?, vec![4.0, 8.0]);
        assert_eq!(engine.read_vec::<f32>(&b)?, vec![8.0, 16.0]);
        Ok(())
    }

    #[test]
    fn test_keep() -> Result<(), Box<dyn Error>> {
        let engine = engine(false, false);
        let kept = engine.scope(|engine| {
            let x = engine.tensor([1], [1.0f32])?;
            let y = double(engine, &x)?;
            engine.keep(&y)?;
            Ok(y)
        })?;
        assert_eq!(engine.num_tensors(), 1);

        // a kept tensor survives any later scope that returns nothing
        engine.scope(|engine| {
            let _ = double(engine, &kept)?;
            Ok(())
        })?;
        assert_eq!(engine.num_tensors(), 1);
        assert!(engine.dispose(&kept));
        assert!(!engine.dispose(&kept));
        assert_eq!(engine.num_tensors(), 0);
        Ok(())
    }

    #[test]
    fn test_manual_scopes() -> Result<(), Box<dyn Error>> {
        let engine = engine(false, false);
        engine.start_scope()?;
        let x = engine.tensor([1], [1.0f32])?;
        let y = double(&engine, &x)?;
        engine.end_scope(&y)?;
        assert_eq!(engine.num_tensors(), 1);

        let err = engine.end_scope(&());
        assert!(matches!(err, Err(EngineError::Usage(UsageError::EndRootScope))));
        Ok(())
    }

    #[test]
    fn test_failing_scope_disposes_everything() -> Result<(), Box<dyn Error>> {
        let engine = engine(false, false);
        let result: Result<Tensor, _> = engine.scope(|engine| {
            let x = engine.tensor([2], [1.0f32, 2.0])?;
            let _ = double(engine, &x)?;
            engine.tensor([3], [1.0f32, 2.0])
        });
        assert!(matches!(result, Err(EngineError::Shape(_))));
        assert_eq!(engine.num_tensors(), 0);
        assert_eq!(engine.depth(), 0);
        Ok(())
    }

    #[test]
    fn test_panicking_scope_disposes_everything() {
        let engine = engine(false, false);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = engine.scope(|engine| -> Result<(), EngineError> {
                let _ = engine.tensor([2], [1.0f32, 2.0])?;
                panic!("boom");
            });
        }));
        assert!(result.is_err());
        assert_eq!(engine.num_tensors(), 0);
        assert_eq!(engine.depth(), 0);
    }

    #[test]
    fn test_safe_mode() -> Result<(), Box<dyn Error>> {
        let engine = engine(true, false);
        let err = engine.tensor([1], [1.0f32]);
        assert!(matches!(err, Err(EngineError::Usage(UsageError::NoScope))));
        assert_eq!(engine.num_tensors(), 0);

        let y = engine.scope(|engine| {
            let x = engine.tensor([1], [1.0f32])?;
            double(engine, &x)
        })?;
        assert_eq!(engine.read_vec::<f32>(&y)?, vec![2.0]);

        let err = double(&engine, &y);
        assert!(matches!(err, Err(EngineError::Usage(UsageError::NoScope))));
        let err = engine.keep(&y);
        assert!(matches!(err, Err(EngineError::Usage(UsageError::NoScope))));
        Ok(())
    }

    #[test]
    fn test_disposed_input() -> Result<(), Box<dyn Error>> {
        let engine = engine(false, false);
        let x = engine.tensor([1], [1.0f32])?;
        engine.dispose(&x);
        let err = double(&engine, &x);
        assert!(matches!(
            err,
            Err(EngineError::Usage(UsageError::Disposed(id))) if id == x.id()
        ));
        assert!(engine.read(&x).is_err());
        assert_eq!(engine.num_tensors(), 0);
        Ok(())
    }

    #[test]
    fn test_data_checks() -> Result<(), Box<dyn Error>> {
        let engine = engine(false, false);
        let err = engine.tensor([2, 2], [1.0f32, 2.0, 3.0]);
        let expected = ShapeMismatchError::new("data", "4 values", "3 values");
        assert!(matches!(err, Err(EngineError::Shape(err)) if err == expected));

        let x = engine.tensor([2], [1i32, 2])?;
        assert!(matches!(engine.read_vec::<f32>(&x), Err(EngineError::DType(_))));
        assert_eq!(engine.read_vec::<i32>(&x)?, vec![1, 2]);

        assert!(matches!(engine.write(&x, [1.0f32, 2.0]), Err(EngineError::DType(_))));
        assert!(matches!(engine.write(&x, [1i32, 2, 3]), Err(EngineError::Shape(_))));
        engine.write(&x, [3i32, 4])?;
        assert_eq!(engine.read_vec::<i32>(&x)?, vec![3, 4]);

        let z = engine.zeros([2, 3], DataType::Bool)?;
        assert_eq!(engine.read_vec::<u8>(&z)?, vec![0; 6]);
        Ok(())
    }

    #[test]
    fn test_debug_mode_catches_nan() -> Result<(), Box<dyn Error>> {
        let engine = engine(false, true);
        let err = engine.scope(|engine| {
            let x = engine.tensor([2], [1.0f32, -1.0])?;
            double(engine, &x)
        });
        assert!(matches!(err, Err(EngineError::NotANumber(name)) if name == "double"));
        assert_eq!(engine.num_tensors(), 0);

        // without debug mode NaN passes through
        let engine = self::engine(false, false);
        let x = engine.tensor([2], [1.0f32, -1.0])?;
        let y = double(&engine, &x)?;
        assert!(engine.read(&y)?.has_nan());
        Ok(())
    }

    #[test]
    fn test_debug_mode_checks_sentinels() -> Result<(), Box<dyn Error>> {
        use crate::hal::frontend::TensorOps;

        let cpu = CpuBuilder::new().add_default_ops().build();
        let engine = EngineBuilder::new(cpu).debug_mode(true).build();
        let x = engine.tensor([2], [1.0f32, f32::NAN])?;
        for r#type in [DataType::I32, DataType::Bool] {
            let err = engine.cast(&x, r#type);
            assert!(matches!(err, Err(EngineError::NotANumber(name)) if name == "cast"));
        }
        assert_eq!(engine.num_tensors(), 1);

        let y = engine.tensor([2], [1.0f32, 2.0])?;
        let y = engine.cast(&y, DataType::I32)?;
        assert_eq!(engine.read_vec::<i32>(&y)?, vec![1, 2]);
        Ok(())
    }

    #[test]
    fn test_time_and_memory() -> Result<(), Box<dyn Error>> {
        let engine = engine(false, false);
        let x = engine.tensor([4], [1.0f32, 2.0, 3.0, 4.0])?;
        let elapsed = engine.time(|engine| double(engine, &x))?;
        assert!(elapsed.as_secs() < 60);
        assert_eq!(
            engine.memory(),
            MemoryInfo {
                num_tensors: 1,
                num_textures: 0
            }
        );

        engine.teardown();
        assert_eq!(engine.backend().num_tensors(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_scope_async() -> Result<(), Box<dyn Error>> {
        let engine = engine(true, false);
        let y = engine
            .scope_async(|scope| async move {
                let x = scope.tensor([2], [1.0f32, 2.0])?;
                tokio::task::yield_now().await;
                let y = double(&scope, &x)?;
                let data = scope.read_async(&y).await?;
                assert_eq!(data, DataBuffer::from([2.0f32, 4.0]));
                let z = scope.nested("inner", |scope| {
                    let t = double(scope, &y)?;
                    double(scope, &t)
                })?;
                assert_eq!(scope.engine().num_tensors(), 3);
                Ok::<_, EngineError>(z)
            })
            .await?;
        assert_eq!(engine.num_tensors(), 1);
        assert_eq!(engine.read_async(&y).await?, DataBuffer::from([8.0f32, 16.0]));
        Ok(())
    }

    #[tokio::test]
    async fn test_interleaved_async_scopes() -> Result<(), Box<dyn Error>> {
        let engine = engine(true, false);
        let (sender, receiver) = tokio::sync::oneshot::channel::<()>();

        let first = engine.scope_async(|scope| async move {
            let x = scope.tensor([1], [1.0f32])?;
            receiver.await.ok();
            double(&scope, &x)
        });
        let second = engine.scope_async(|scope| async move {
            let x = scope.tensor([1], [2.0f32])?;
            let y = double(&scope, &x)?;
            sender.send(()).ok();
            Ok::<_, EngineError>(y)
        });
        let (a, b) = futures::future::join(first, second).await;
        let (a, b) = (a?, b?);

        // both scopes were opened from the root, so each result outlives the other scope
        assert_eq!(engine.read_vec::<f32>(&a)?, vec![2.0]);
        assert_eq!(engine.read_vec::<f32>(&b)?, vec![4.0]);
        assert_eq!(engine.num_tensors(), 2);
        assert_eq!(engine.depth(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_async_scope_parent_is_taken_at_call() -> Result<(), Box<dyn Error>> {
        let engine = engine(false, false);
        let outer = engine.start_scope()?;
        let pending = engine.scope_async(|scope| async move {
            let x = scope.tensor([1], [3.0f32])?;
            double(&scope, &x)
        });
        // the future is polled only after its caller's scope has moved on
        let sibling = engine.start_scope()?;
        let y = pending.await?;
        assert_eq!(engine.scopes().owner(y.id()), Some(outer));

        engine.close_scope(sibling, &())?;
        assert_eq!(engine.read_vec::<f32>(&y)?, vec![6.0]);
        engine.end_scope(&())?;
        assert_eq!(engine.num_tensors(), 0);
        Ok(())
    }
}
