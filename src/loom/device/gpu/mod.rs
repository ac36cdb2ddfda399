use std::sync::{Arc, Mutex, MutexGuard};

use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use super::{Backend, BackendError, execute_op};
use crate::loom::{
    env::{Environment, Feature},
    error::EngineError,
    num::{DataBuffer, DataType},
    ops::{BackendOp, KernelIo, OpVTable, TensorOp, register_op},
    platform::BoxFuture,
    shape::{Shape, TexShape},
    tensor::{Tensor, TensorId},
};

pub use context::{GpuContext, ProgramLayout};
pub use program::{Binary, GpuProgram, ProgramCache, ShapeInfo, make_shader_key};
pub use texture::TextureManager;
pub use webgpu::{WgpuContext, WgpuProgram, WgpuTexture};

pub mod context;
#[cfg(test)]
pub mod mock;
pub mod program;
pub mod shader;
pub mod texture;
pub mod webgpu;

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("failed to preprocess shader: {0}")]
    Preprocess(String),
    #[error("failed to compile shader: {0}")]
    Compile(String),
    #[error("texture {0} exceeds the device limit of {1}")]
    TextureSize(TexShape, usize),
    #[error("program expects {expected} inputs, {actual} bound")]
    Binding { expected: usize, actual: usize },
    #[error("failed to map buffer: {0}")]
    BufferAsync(#[from] wgpu::BufferAsyncError),
    #[error("failed to poll device: {0}")]
    Poll(#[from] wgpu::PollError),
    #[error("device readback dropped")]
    Recv(#[from] flume::RecvError),
}

impl From<GpuError> for EngineError {
    fn from(value: GpuError) -> Self {
        EngineError::Backend(value.into())
    }
}

#[derive(Debug, Error)]
pub enum GpuBuildError {
    #[error("failed to request adaptor")]
    RequestAdapterError(#[from] wgpu::RequestAdapterError),
    #[error("failed to request device")]
    RequestDeviceError(#[from] wgpu::RequestDeviceError),
}

/// Where the freshest copy of a tensor lives.
#[derive(Debug)]
enum TexState<T> {
    /// No texture; the host copy, if any, is authoritative.
    Unmaterialized,
    /// A texture holding the same values as the host copy.
    Clean(T),
    /// A texture written by a kernel; there is no host copy.
    Dirty(T),
}

impl<T> TexState<T> {
    fn texture(&self) -> Option<&T> {
        match self {
            TexState::Unmaterialized => None,
            TexState::Clean(texture) | TexState::Dirty(texture) => Some(texture),
        }
    }

    fn into_texture(self) -> Option<T> {
        match self {
            TexState::Unmaterialized => None,
            TexState::Clean(texture) | TexState::Dirty(texture) => Some(texture),
        }
    }
}

#[derive(Debug)]
struct Record<T> {
    shape: Shape,
    r#type: DataType,
    tex_shape: TexShape,
    values: Option<DataBuffer>,
    state: TexState<T>,
}

impl<T> Record<T> {
    #[inline]
    fn info(&self) -> ShapeInfo {
        let logical = self.shape.clone();
        let texture = self.tex_shape;
        ShapeInfo { logical, texture }
    }
}

type Records<C> = HashMap<TensorId, Record<<C as GpuContext>::Texture>>;

/// The device backend. Kernels run as compiled programs over packed textures.
pub struct Gpu<C: GpuContext> {
    context: Arc<C>,
    /// Operators that the backend is able to execute.
    ops: Arc<OpVTable<Self>>,
    records: Arc<Mutex<Records<C>>>,
    textures: Arc<TextureManager<C>>,
    programs: Arc<ProgramCache<C::Program>>,
    env: Arc<Environment>,
}

impl<C: GpuContext> Clone for Gpu<C> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            ops: self.ops.clone(),
            records: self.records.clone(),
            textures: self.textures.clone(),
            programs: self.programs.clone(),
            env: self.env.clone(),
        }
    }
}

impl<C: GpuContext> std::fmt::Debug for Gpu<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gpu")
            .field("num_tensors", &self.num_tensors())
            .field("num_textures", &self.textures.num_used())
            .field("num_programs", &self.programs.len())
            .finish()
    }
}

impl<C: GpuContext> Gpu<C> {
    #[inline]
    pub fn context(&self) -> &C {
        &self.context
    }

    #[inline]
    pub fn textures(&self) -> &TextureManager<C> {
        &self.textures
    }

    #[inline]
    pub fn programs(&self) -> &ProgramCache<C::Program> {
        &self.programs
    }

    #[inline]
    pub fn env(&self) -> &Environment {
        &self.env
    }

    #[inline]
    fn records(&self) -> MutexGuard<'_, Records<C>> {
        self.records.lock().expect("failed to lock")
    }

    #[inline]
    fn flag(&self, feature: Feature) -> bool {
        self.env.get(feature, |feature| self.context.probe(feature)).as_bool()
    }

    #[inline]
    fn max_texture_size(&self) -> usize {
        let max = self.env.get(Feature::MaxTextureSize, |feature| {
            self.context.probe(feature)
        });
        max.as_number() as usize
    }

    /// Makes sure the tensor has a texture, uploading its host copy if needed.
    fn materialize(&self, records: &mut Records<C>, id: TensorId) -> Result<(), BackendError> {
        let record = records.get_mut(&id).ok_or(BackendError::Unregistered(id))?;
        if record.state.texture().is_some() {
            return Ok(());
        }
        let values = record
            .values
            .as_ref()
            .ok_or(BackendError::Uninitialized(id))?;
        let texture = self.textures.acquire(record.tex_shape)?;
        if let Err(err) = self.context.upload(&texture, &values.to_f32_vec()) {
            self.textures.release(texture, record.tex_shape);
            return Err(err.into());
        }
        record.state = TexState::Clean(texture);
        Ok(())
    }

    /// Number of device textures currently materialized.
    #[inline]
    pub fn num_textures(&self) -> usize {
        self.textures.num_used()
    }

    /// Uploads a tensor to the device if it is not there yet.
    pub fn upload(&self, id: TensorId) -> Result<(), BackendError> {
        let mut records = self.records();
        self.materialize(&mut records, id)
    }

    /// Specializes `program` to the shapes of `inputs` and `output`, compiling it on a
    /// cache miss, and runs it. The output's previous contents are discarded.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(program = %program.name)))]
    pub fn run_program(
        &self,
        program: &GpuProgram,
        inputs: &[Tensor],
        output: &Tensor,
    ) -> Result<(), EngineError> {
        let nan_uniform = !self.flag(Feature::FloatTextureEnabled);
        let mut records = self.records();

        for input in inputs {
            self.materialize(&mut records, input.id())?;
        }
        let info = |records: &Records<C>, id: TensorId| {
            records
                .get(&id)
                .map(Record::info)
                .ok_or(BackendError::Unregistered(id))
        };
        let input_infos: Vec<_> = inputs
            .iter()
            .map(|input| info(&records, input.id()))
            .try_collect()?;
        let output_info = info(&records, output.id())?;

        let key = make_shader_key(program, &input_infos, &output_info);
        let binary = self.programs.get_or_compile(key, || {
            let source = shader::build_source(program, &input_infos, &output_info, nan_uniform)?;
            let layout = ProgramLayout {
                num_inputs: input_infos.len(),
                uniform: nan_uniform,
            };
            log::debug!("compile program `{}` for {}", program.name, output_info);
            let compiled = self.context.compile(&source, layout)?;
            Ok(Binary {
                program: compiled,
                source,
                inputs: input_infos.clone(),
                output: output_info.clone(),
                batch_dims: program.batch_dims,
            })
        })?;
        binary.validate(&input_infos, &output_info)?;

        // the output gets a fresh texture; whatever it held before is stale
        let texture = self.textures.acquire(output_info.texture)?;
        let Some(record) = records.get_mut(&output.id()) else {
            self.textures.release(texture, output_info.texture);
            return Err(BackendError::Unregistered(output.id()).into());
        };
        let stale = std::mem::replace(&mut record.state, TexState::Dirty(texture));
        record.values = None;
        if let Some(stale) = stale.into_texture() {
            self.textures.release(stale, output_info.texture);
        }

        let textures: Vec<_> = inputs
            .iter()
            .map(|input| {
                records
                    .get(&input.id())
                    .and_then(|record| record.state.texture())
                    .ok_or(BackendError::Uninitialized(input.id()))
            })
            .try_collect()?;
        let target = records
            .get(&output.id())
            .and_then(|record| record.state.texture())
            .ok_or(BackendError::Uninitialized(output.id()))?;
        let uniforms = match nan_uniform {
            true => vec![[f32::NAN, 0.0, 0.0, 0.0]],
            false => vec![],
        };
        self.context
            .run(&binary.program, &textures, target, &uniforms)?;
        Ok(())
    }

    /// Stores downloaded values as the host copy and releases the texture they came from.
    fn finish_read(&self, id: TensorId, values: &[f32]) -> Result<DataBuffer, BackendError> {
        let mut records = self.records();
        let record = records.get_mut(&id).ok_or(BackendError::Unregistered(id))?;
        let data = DataBuffer::from_f32(values, record.r#type);
        if let TexState::Dirty(_) = record.state {
            let tex_shape = record.tex_shape;
            let textures = &self.textures;
            take_mut::take(&mut record.state, |state| {
                if let Some(texture) = state.into_texture() {
                    textures.release(texture, tex_shape);
                }
                TexState::Unmaterialized
            });
            record.values = Some(data.clone());
        }
        Ok(data)
    }
}

impl<C: GpuContext> Backend for Gpu<C> {
    #[inline]
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn register(&self, id: TensorId, shape: &Shape, r#type: DataType) -> Result<(), BackendError> {
        let tex_shape = TexShape::from_shape(shape, self.max_texture_size());
        let mut records = self.records();
        if records.contains_key(&id) {
            return Err(BackendError::Registered(id));
        }
        let record = Record {
            shape: shape.clone(),
            r#type,
            tex_shape,
            values: None,
            state: TexState::Unmaterialized,
        };
        records.insert(id, record);
        Ok(())
    }

    fn write(&self, id: TensorId, data: DataBuffer) -> Result<(), BackendError> {
        let mut records = self.records();
        let record = records.get_mut(&id).ok_or(BackendError::Unregistered(id))?;
        if data.data_type() != record.r#type || data.len() != record.shape.size() {
            return Err(BackendError::Write {
                id,
                expected: record.r#type,
                size: record.shape.size(),
                actual: data.data_type(),
                len: data.len(),
            });
        }
        // overwriting releases the stale texture; the next kernel re-uploads
        let tex_shape = record.tex_shape;
        let textures = &self.textures;
        take_mut::take(&mut record.state, |state| {
            if let Some(texture) = state.into_texture() {
                textures.release(texture, tex_shape);
            }
            TexState::Unmaterialized
        });
        record.values = Some(data);
        Ok(())
    }

    fn read(&self, id: TensorId) -> Result<DataBuffer, BackendError> {
        let values = {
            let records = self.records();
            let record = records.get(&id).ok_or(BackendError::Unregistered(id))?;
            match &record.state {
                TexState::Dirty(texture) => {
                    self.context.download(texture, record.shape.size())?
                }
                _ => return record.values.clone().ok_or(BackendError::Uninitialized(id)),
            }
        };
        self.finish_read(id, &values)
    }

    fn read_async(&self, id: TensorId) -> BoxFuture<'static, Result<DataBuffer, BackendError>> {
        if !self.flag(Feature::AsyncReadbackEnabled) {
            return Box::pin(futures::future::ready(self.read(id)));
        }
        let future = {
            let records = self.records();
            let record = match records.get(&id) {
                Some(record) => record,
                None => {
                    let err = BackendError::Unregistered(id);
                    return Box::pin(futures::future::ready(Err(err)));
                }
            };
            match &record.state {
                TexState::Dirty(texture) => {
                    self.context.download_async(texture, record.shape.size())
                }
                _ => {
                    let data = record.values.clone().ok_or(BackendError::Uninitialized(id));
                    return Box::pin(futures::future::ready(data));
                }
            }
        };
        let backend = self.clone();
        Box::pin(async move {
            let values = future.await?;
            backend.finish_read(id, &values)
        })
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(op = %op.name())))]
    fn execute(&self, op: &dyn TensorOp, io: &KernelIo) -> Result<(), EngineError> {
        execute_op(self, &self.ops, op, io)
    }

    #[inline]
    fn contains(&self, id: TensorId) -> bool {
        self.records().contains_key(&id)
    }

    fn dispose_data(&self, id: TensorId) -> bool {
        let Some(record) = self.records().remove(&id) else {
            return false;
        };
        if let Some(texture) = record.state.into_texture() {
            self.textures.release(texture, record.tex_shape);
        }
        true
    }

    fn dispose(&self) {
        let records = std::mem::take(&mut *self.records());
        let textures = records
            .into_values()
            .filter_map(|record| {
                let tex_shape = record.tex_shape;
                record.state.into_texture().map(|texture| (texture, tex_shape))
            })
            .collect_vec();
        self.textures.dispose_all(textures);
        self.programs.clear();
    }

    #[inline]
    fn num_tensors(&self) -> usize {
        self.records().len()
    }

    #[inline]
    fn num_resources(&self) -> usize {
        self.textures.num_used()
    }
}

pub struct GpuBuilder<C: GpuContext> {
    pub context: C,
    pub env: Environment,
    pub ops: OpVTable<Gpu<C>>,
}

impl<C: GpuContext> GpuBuilder<C> {
    pub fn new(context: C) -> Self {
        Self {
            context,
            env: Environment::from_env(),
            ops: Default::default(),
        }
    }

    pub fn environment(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    pub fn build(self) -> Gpu<C> {
        let Self { context, env, ops } = self;
        let context = Arc::new(context);
        let textures = Arc::new(TextureManager::new(context.clone()));
        Gpu {
            context,
            ops: Arc::new(ops),
            records: Default::default(),
            textures,
            programs: Default::default(),
            env: Arc::new(env),
        }
    }

    pub fn add_op<Op>(mut self) -> Self
    where
        Op: BackendOp<Gpu<C>> + 'static,
    {
        register_op::<Gpu<C>, Op>(&mut self.ops);
        self
    }
}
