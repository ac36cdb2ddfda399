//! WGSL kernels for every op in [`crate::hal::ops`].
//!
//! Each kernel is a [`GpuProgram`] template: the backend specializes it to the
//! shapes of a launch and caches the compiled result.

use crate::{
    hal::ops::{
        BinaryOp, CastOp, CloneOp, ConcatOp, MatMulOp, ReduceOp, ReshapeOp, SelectOp, SoftmaxOp,
        UnaryOp,
    },
    loom::{
        device::{
            Backend as _,
            gpu::{Gpu, GpuBuilder, GpuContext, GpuProgram},
        },
        error::EngineError,
        num::DataBuffer,
        ops::KernelIo,
    },
};

mod elementwise;
mod matmul;
mod memory;
mod norm;

impl<C: GpuContext> GpuBuilder<C> {
    /// Registers a kernel for every op in [`crate::hal::ops`].
    pub fn add_default_ops(self) -> Self {
        self.add_op::<BinaryOp>()
            .add_op::<UnaryOp>()
            .add_op::<SelectOp>()
            .add_op::<CastOp>()
            .add_op::<ConcatOp>()
            .add_op::<CloneOp>()
            .add_op::<ReshapeOp>()
            .add_op::<SoftmaxOp>()
            .add_op::<ReduceOp>()
            .add_op::<MatMulOp>()
    }
}

/// Runs `program` over the kernel's inputs. Empty outputs never reach the device.
fn launch<C: GpuContext>(
    backend: &Gpu<C>,
    program: GpuProgram,
    io: &KernelIo,
) -> Result<(), EngineError> {
    let output = io.output();
    if output.size() == 0 {
        backend.write(output.id(), DataBuffer::zeros(output.data_type(), 0))?;
        return Ok(());
    }
    backend.run_program(&program, &io.inputs, output)
}

/// Fills the output on the host, for launches whose inputs are empty.
fn fill<C: GpuContext>(backend: &Gpu<C>, io: &KernelIo, value: f64) -> Result<(), EngineError> {
    let output = io.output();
    let values = vec![value; output.size()];
    backend.write(output.id(), DataBuffer::from_f64(values, output.data_type()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::GpuBuilder;
    use crate::{
        hal::frontend::TensorOps,
        loom::{
            device::{
                Backend, CpuBuilder,
                gpu::{Gpu, WgpuContext, mock::MockContext, shader::validate_wgsl},
            },
            engine::{Engine, EngineBuilder},
            env::Environment,
            error::{EngineError, UnsupportedFeatureError},
            num::DataType,
            shape::Shape,
            tensor::Tensor,
        },
    };

    fn engine() -> Engine<Gpu<MockContext>> {
        let gpu = GpuBuilder::new(MockContext::default())
            .environment(Environment::new())
            .add_default_ops()
            .build();
        EngineBuilder::new(gpu).build()
    }

    #[test]
    fn test_every_kernel_compiles() -> Result<(), Box<dyn Error>> {
        let engine = engine();
        engine.scope(|scope| {
            let a = scope.tensor([2, 3], [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0])?;
            let b = scope.tensor([3], [1.0f32, 2.0, 3.0])?;
            let i = scope.tensor([2, 3], [1i32, 2, 3, 4, 5, 6])?;
            let m = scope.greater(&a, &b)?;

            for kind in crate::hal::ops::BinaryKind::ALL {
                scope.binary(kind, &a, &b)?;
            }
            for kind in crate::hal::ops::UnaryKind::ALL {
                scope.unary(kind, &a)?;
            }
            scope.pow(&i, &i)?;
            scope.select(&m, &a, &a)?;
            scope.cast(&a, DataType::I32)?;
            scope.cast(&i, DataType::Bool)?;
            scope.concat(&a, &a, 0)?;
            scope.concat(&a, &a, 1)?;
            scope.softmax(&a)?;
            scope.sum(&a)?;
            scope.max(&i)?;
            scope.min(&b)?;
            let t = scope.reshape(&a, [3, 2])?;
            scope.matmul(&a, &t)?;
            scope.clone_tensor(&a)?;
            Ok::<_, EngineError>(())
        })?;

        let context = engine.backend().context();
        let sources = context.sources();
        assert_eq!(sources.len(), context.num_compiled());
        for source in sources {
            validate_wgsl(&source)?;
        }
        Ok(())
    }

    #[test]
    fn test_program_reuse() -> Result<(), Box<dyn Error>> {
        let engine = engine();
        let a = engine.tensor([2, 3], [0.0f32; 6])?;
        let b = engine.tensor([2, 3], [1.0f32; 6])?;
        let c = engine.tensor([3, 2], [1.0f32; 6])?;

        engine.add(&a, &b)?;
        engine.add(&b, &a)?;
        let context = engine.backend().context();
        assert_eq!(context.num_compiled(), 1);
        assert_eq!(context.num_runs(), 2);

        // a new shape is a new program
        engine.add(&c, &c)?;
        assert_eq!(context.num_compiled(), 2);
        // so is a new op over the same shapes
        engine.sub(&a, &b)?;
        assert_eq!(context.num_compiled(), 3);
        Ok(())
    }

    #[test]
    fn test_rank_limit() -> Result<(), Box<dyn Error>> {
        let engine = engine();
        let shape = Shape::from([1, 2, 1, 2, 1]);
        let cond = engine.tensor(shape.clone(), [true, false, true, false])?;
        let a = engine.zeros(shape.clone(), DataType::F32)?;
        let b = engine.zeros(shape, DataType::F32)?;

        let before = engine.num_tensors();
        let err = engine.select(&cond, &a, &b);
        assert!(matches!(
            err,
            Err(EngineError::Unsupported(UnsupportedFeatureError::Rank { rank: 5, max: 4, .. }))
        ));
        assert_eq!(engine.num_tensors(), before);
        Ok(())
    }

    #[test]
    fn test_scope_releases_textures() -> Result<(), Box<dyn Error>> {
        let engine = engine();
        let x = engine.tensor([4, 4], [0.5f32; 16])?;
        let y = engine.scope(|scope| {
            let y = scope.exp(&x)?;
            let y = scope.mul(&y, &x)?;
            let y = scope.softmax(&y)?;
            scope.sum(&y)
        })?;
        // one texture for `x` and one for the result
        assert_eq!(engine.memory().num_textures, 2);
        assert_eq!(engine.num_tensors(), 2);

        engine.dispose(&y);
        engine.dispose(&x);
        assert_eq!(engine.memory().num_textures, 0);
        let context = engine.backend().context();
        assert_eq!(context.num_created(), context.num_deleted());
        Ok(())
    }

    #[tokio::test]
    async fn test_device_matches_cpu() -> Result<(), Box<dyn Error>> {
        let context = match WgpuContext::request().await {
            Ok(context) => context,
            Err(err) => {
                log::warn!("skipping device test: {err}");
                return Ok(());
            }
        };
        let gpu = GpuBuilder::new(context).add_default_ops().build();
        let gpu = EngineBuilder::new(gpu).build();
        let cpu = CpuBuilder::new().add_default_ops().build();
        let cpu = EngineBuilder::new(cpu).build();

        fastrand::seed(42);
        let a = (0..24).map(|_| fastrand::f32() * 4.0 - 2.0).collect_vec();
        let b = (0..8).map(|_| fastrand::f32() * 4.0 - 2.0).collect_vec();

        fn run<B: Backend>(
            engine: &Engine<B>,
            a: &[f32],
            b: &[f32],
        ) -> Result<Vec<Tensor>, EngineError> {
            engine.scope(|engine| {
                let a = engine.tensor([3, 8], a.to_vec())?;
                let b = engine.tensor([8], b.to_vec())?;
                let t = engine.reshape(&b, [8, 1])?;
                Ok(vec![
                    engine.add(&a, &b)?,
                    engine.tanh(&a)?,
                    engine.softmax(&a)?,
                    engine.sum(&a)?,
                    engine.matmul(&a, &t)?,
                    engine.concat(&a, &a, 1)?,
                ])
            })
        }

        let expected = run(&cpu, &a, &b)?;
        let computed = run(&gpu, &a, &b)?;
        for (x, y) in computed.iter().zip_eq(expected.iter()) {
            let x = gpu.read_async(x).await?.to_f64_vec();
            let y = cpu.read(y)?.to_f64_vec();
            for (index, (x, y)) in x.iter().zip_eq(y.iter()).enumerate() {
                assert_approx_eq!(index, x, y, 1e-4);
            }
        }
        Ok(())
    }

    #[test]
    fn test_empty_tensors() -> Result<(), Box<dyn Error>> {
        let engine = engine();
        let x = engine.zeros([2, 0], DataType::F32)?;
        let y = engine.exp(&x)?;
        assert_eq!(engine.read_vec::<f32>(&y)?, Vec::<f32>::new());
        let s = engine.sum(&x)?;
        assert_eq!(engine.read_vec::<f32>(&s)?, vec![0.0, 0.0]);
        assert_eq!(engine.backend().context().num_compiled(), 0);
        Ok(())
    }
}
