use itertools::Itertools;
use wgpu::util::DeviceExt;

use super::{
    GpuBuildError, GpuContext, GpuError, ProgramLayout,
    shader::{dispatch_size, validate_wgsl},
};
use crate::loom::{
    env::{Feature, FlagValue},
    platform::{self, BoxFuture},
    shape::TexShape,
};

/// A [`GpuContext`] on a WebGPU device. Textures are storage buffers of `f32`.
#[derive(Debug, Clone)]
pub struct WgpuContext {
    /// Handle to a WebGPU compute device.
    device: wgpu::Device,
    /// The WebGPU command queue.
    queue: wgpu::Queue,
    limits: wgpu::Limits,
}

#[derive(Debug, Clone)]
pub struct WgpuTexture {
    buffer: wgpu::Buffer,
    len: usize,
}

#[derive(Debug, Clone)]
pub struct WgpuProgram {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    layout: ProgramLayout,
}

impl WgpuContext {
    /// Requests a device from `adapter`.
    pub async fn new(adapter: &wgpu::Adapter) -> Result<Self, GpuBuildError> {
        let limits = adapter.limits();
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: None,
                required_features: wgpu::Features::empty(),
                required_limits: limits.clone(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await?;
        Ok(Self {
            device,
            queue,
            limits,
        })
    }

    /// Picks the default adapter of a fresh instance and requests a device from it.
    pub async fn request() -> Result<Self, GpuBuildError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await?;
        log::info!("using adapter {:?}", adapter.get_info());
        Self::new(&adapter).await
    }

    #[inline]
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    #[inline]
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Copies `texture` into a mappable buffer. The values arrive once the device is polled.
    fn read_texture(
        &self,
        texture: &WgpuTexture,
        len: usize,
    ) -> flume::Receiver<Result<Vec<f32>, GpuError>> {
        let (sender, receiver) = flume::bounded(1);
        wgpu::util::DownloadBuffer::read_buffer(
            &self.device,
            &self.queue,
            &texture.buffer.slice(..),
            move |data| {
                let data = data
                    .map(|data| {
                        let mut data = bytemuck::pod_collect_to_vec::<u8, f32>(&data);
                        data.truncate(len);
                        data
                    })
                    .map_err(GpuError::from);
                _ = sender.send(data)
            },
        );
        receiver
    }
}

impl GpuContext for WgpuContext {
    type Texture = WgpuTexture;
    type Program = WgpuProgram;

    fn create_texture(&self, shape: TexShape) -> Result<Self::Texture, GpuError> {
        let len = shape.size();
        let size = (len.max(1) * size_of::<f32>()) as u64;
        if size > self.limits.max_storage_buffer_binding_size as u64 {
            let max = self.limits.max_storage_buffer_binding_size as usize / size_of::<f32>();
            return Err(GpuError::TextureSize(shape, max));
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Ok(WgpuTexture { buffer, len })
    }

    fn delete_texture(&self, texture: Self::Texture) {
        texture.buffer.destroy();
    }

    fn upload(&self, texture: &Self::Texture, data: &[f32]) -> Result<(), GpuError> {
        if !data.is_empty() {
            self.queue
                .write_buffer(&texture.buffer, 0, bytemuck::cast_slice(data));
        }
        Ok(())
    }

    fn download(&self, texture: &Self::Texture, len: usize) -> Result<Vec<f32>, GpuError> {
        let receiver = self.read_texture(texture, len);
        self.device.poll(wgpu::PollType::Wait)?;
        receiver.recv()?
    }

    fn download_async(
        &self,
        texture: &Self::Texture,
        len: usize,
    ) -> BoxFuture<'static, Result<Vec<f32>, GpuError>> {
        let receiver = self.read_texture(texture, len);
        let device = self.device.clone();
        platform::spawn_blocking(move || {
            _ = device.poll(wgpu::PollType::Wait);
        });
        Box::pin(async move { receiver.recv_async().await? })
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    fn compile(&self, source: &str, layout: ProgramLayout) -> Result<Self::Program, GpuError> {
        // the driver panics on invalid shaders, so reject them first
        validate_wgsl(source)?;

        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: None,
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });

        let buffer = |binding: usize, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding: binding as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let mut entries = (0..layout.num_inputs)
            .map(|binding| buffer(binding, true))
            .collect_vec();
        entries.push(buffer(layout.num_inputs, false));
        if layout.uniform {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: layout.num_inputs as u32 + 1,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }

        let bind_group_layout =
            self.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: None,
                    entries: &entries,
                });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: None,
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: None,
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            });
        Ok(WgpuProgram {
            pipeline,
            bind_group_layout,
            layout,
        })
    }

    fn run(
        &self,
        program: &Self::Program,
        inputs: &[&Self::Texture],
        output: &Self::Texture,
        uniforms: &[[f32; 4]],
    ) -> Result<(), GpuError> {
        let layout = program.layout;
        if inputs.len() != layout.num_inputs {
            return Err(GpuError::Binding {
                expected: layout.num_inputs,
                actual: inputs.len(),
            });
        }
        if output.len == 0 {
            return Ok(());
        }

        let uniform = match layout.uniform {
            true => Some(
                self.device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: None,
                        contents: bytemuck::cast_slice(uniforms),
                        usage: wgpu::BufferUsages::UNIFORM,
                    }),
            ),
            false => None,
        };

        let mut entries = inputs
            .iter()
            .chain([&output])
            .enumerate()
            .map(|(binding, texture)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: texture.buffer.as_entire_binding(),
            })
            .collect_vec();
        if let Some(uniform) = &uniform {
            entries.push(wgpu::BindGroupEntry {
                binding: layout.num_inputs as u32 + 1,
                resource: uniform.as_entire_binding(),
            });
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &program.bind_group_layout,
            entries: &entries,
        });

        let [x, y, z] = dispatch_size(output.len);
        let mut encoder = self.device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(&program.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, z);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn probe(&self, feature: Feature) -> FlagValue {
        match feature {
            Feature::FloatTextureEnabled => FlagValue::Bool(true),
            Feature::AsyncReadbackEnabled => FlagValue::Bool(cfg!(not(target_arch = "wasm32"))),
            Feature::MaxTextureSize => {
                FlagValue::Number(self.limits.max_texture_dimension_2d as f64)
            }
            Feature::DeviceApiVersion => FlagValue::Number(2.0),
        }
    }
}
