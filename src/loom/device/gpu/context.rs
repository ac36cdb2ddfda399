use std::fmt::Debug;

use super::GpuError;
use crate::loom::{
    env::{Feature, FlagValue},
    platform::BoxFuture,
    shape::TexShape,
};

/// Binding layout a program is compiled against.
///
/// Inputs bind first in order, then the output, then the optional NaN uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramLayout {
    pub num_inputs: usize,
    pub uniform: bool,
}

/// The device driver seen by the GPU backend.
///
/// Resources ("textures") hold packed `f32` values. Failures are fatal to the
/// call that hit them; nothing is retried.
pub trait GpuContext: Send + Sync + 'static {
    type Texture: Debug + Send + Sync + 'static;
    type Program: Debug + Send + Sync + 'static;

    fn create_texture(&self, shape: TexShape) -> Result<Self::Texture, GpuError>;
    fn delete_texture(&self, texture: Self::Texture);

    fn upload(&self, texture: &Self::Texture, data: &[f32]) -> Result<(), GpuError>;
    /// Reads back the first `len` values, blocking until the device is done.
    fn download(&self, texture: &Self::Texture, len: usize) -> Result<Vec<f32>, GpuError>;
    fn download_async(
        &self,
        texture: &Self::Texture,
        len: usize,
    ) -> BoxFuture<'static, Result<Vec<f32>, GpuError>>;

    fn compile(&self, source: &str, layout: ProgramLayout) -> Result<Self::Program, GpuError>;
    fn run(
        &self,
        program: &Self::Program,
        inputs: &[&Self::Texture],
        output: &Self::Texture,
        uniforms: &[[f32; 4]],
    ) -> Result<(), GpuError>;

    /// Answers an environment query about this device.
    fn probe(&self, feature: Feature) -> FlagValue;
}
