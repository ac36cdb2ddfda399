use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use super::{GpuContext, GpuError, ProgramLayout, shader::validate_wgsl};
use crate::loom::{
    env::{Feature, FlagValue},
    platform::BoxFuture,
    shape::TexShape,
};

/// A host-memory stand-in for a device.
///
/// Textures are shared host vectors. Compiling validates the WGSL with naga and
/// running a program only checks its bindings, since nothing executes it.
#[derive(Debug)]
pub struct MockContext {
    pub float_textures: bool,
    pub async_readback: bool,
    pub max_texture_size: usize,
    created: AtomicUsize,
    deleted: AtomicUsize,
    compiled: AtomicUsize,
    runs: AtomicUsize,
    sources: Mutex<Vec<String>>,
}

impl Default for MockContext {
    fn default() -> Self {
        Self {
            float_textures: true,
            async_readback: true,
            max_texture_size: 4096,
            created: Default::default(),
            deleted: Default::default(),
            compiled: Default::default(),
            runs: Default::default(),
            sources: Default::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockTexture {
    pub shape: TexShape,
    pub data: Arc<Mutex<Vec<f32>>>,
}

#[derive(Debug)]
pub struct MockProgram {
    pub layout: ProgramLayout,
}

impl MockContext {
    pub fn num_created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    pub fn num_deleted(&self) -> usize {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn num_compiled(&self) -> usize {
        self.compiled.load(Ordering::Acquire)
    }

    pub fn num_runs(&self) -> usize {
        self.runs.load(Ordering::Acquire)
    }

    /// Sources of every compiled program, in order.
    pub fn sources(&self) -> Vec<String> {
        self.sources.lock().expect("failed to lock").clone()
    }
}

impl GpuContext for MockContext {
    type Texture = MockTexture;
    type Program = MockProgram;

    fn create_texture(&self, shape: TexShape) -> Result<Self::Texture, GpuError> {
        if shape.rows() > self.max_texture_size || shape.cols() > self.max_texture_size {
            return Err(GpuError::TextureSize(shape, self.max_texture_size));
        }
        self.created.fetch_add(1, Ordering::AcqRel);
        let data = Arc::new(Mutex::new(vec![0.0; shape.size()]));
        Ok(MockTexture { shape, data })
    }

    fn delete_texture(&self, _texture: Self::Texture) {
        self.deleted.fetch_add(1, Ordering::AcqRel);
    }

    fn upload(&self, texture: &Self::Texture, data: &[f32]) -> Result<(), GpuError> {
        let mut texels = texture.data.lock().expect("failed to lock");
        texels[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn download(&self, texture: &Self::Texture, len: usize) -> Result<Vec<f32>, GpuError> {
        let texels = texture.data.lock().expect("failed to lock");
        Ok(texels[..len].to_vec())
    }

    fn download_async(
        &self,
        texture: &Self::Texture,
        len: usize,
    ) -> BoxFuture<'static, Result<Vec<f32>, GpuError>> {
        let data = texture.data.clone();
        Box::pin(async move {
            tokio::task::yield_now().await;
            let texels = data.lock().expect("failed to lock");
            Ok(texels[..len].to_vec())
        })
    }

    fn compile(&self, source: &str, layout: ProgramLayout) -> Result<Self::Program, GpuError> {
        validate_wgsl(source)?;
        self.compiled.fetch_add(1, Ordering::AcqRel);
        self.sources
            .lock()
            .expect("failed to lock")
            .push(source.to_string());
        Ok(MockProgram { layout })
    }

    fn run(
        &self,
        program: &Self::Program,
        inputs: &[&Self::Texture],
        _output: &Self::Texture,
        uniforms: &[[f32; 4]],
    ) -> Result<(), GpuError> {
        let layout = program.layout;
        if inputs.len() != layout.num_inputs || uniforms.is_empty() == layout.uniform {
            return Err(GpuError::Binding {
                expected: layout.num_inputs,
                actual: inputs.len(),
            });
        }
        self.runs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn probe(&self, feature: Feature) -> FlagValue {
        match feature {
            Feature::FloatTextureEnabled => FlagValue::Bool(self.float_textures),
            Feature::AsyncReadbackEnabled => FlagValue::Bool(self.async_readback),
            Feature::MaxTextureSize => FlagValue::Number(self.max_texture_size as f64),
            Feature::DeviceApiVersion => FlagValue::Number(0.0),
        }
    }
}
