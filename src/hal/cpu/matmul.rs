use super::map_indices;
use crate::{
    hal::ops::MatMulOp,
    loom::{
        device::{Backend as _, Cpu},
        error::EngineError,
        num::DataBuffer,
        ops::{BackendOp, KernelIo},
    },
};

impl BackendOp<Cpu> for MatMulOp {
    fn execute(&self, backend: &Cpu, io: &KernelIo) -> Result<(), EngineError> {
        let (a, b, output) = (io.input(0), io.input(1), io.output());
        let x = backend.fetch(a.id())?.to_f64_vec();
        let y = backend.fetch(b.id())?.to_f64_vec();

        let [k, n] = [a.shape()[1], b.shape()[1]];
        let values = map_indices(output.size(), |index| {
            let (i, j) = (index / n, index % n);
            (0..k).map(|l| x[i * k + l] * y[l * n + j]).sum()
        });

        let data = DataBuffer::from_f64(values, output.data_type());
        backend.write(output.id(), data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use crate::{
        hal::frontend::TensorOps,
        loom::{
            device::CpuBuilder,
            engine::EngineBuilder,
            error::EngineError,
            shape::Shape,
        },
    };

    #[test]
    fn test_matmul() -> Result<(), Box<dyn Error>> {
        fastrand::seed(42);
        let cpu = CpuBuilder::new().add_default_ops().build();
        let engine = EngineBuilder::new(cpu).build();

        const M: usize = 7;
        const K: usize = 13;
        const N: usize = 5;

        let a = (0..M * K).map(|_| fastrand::f32() - 0.5).collect_vec();
        let b = (0..K * N).map(|_| fastrand::f32() - 0.5).collect_vec();

        let mut r#ref = vec![0.0f32; M * N];
        for (i, j, l) in itertools::iproduct!(0..M, 0..N, 0..K) {
            r#ref[i * N + j] += a[i * K + l] * b[l * N + j];
        }

        let x = engine.tensor([M, K], a)?;
        let y = engine.tensor([K, N], b)?;
        let z = engine.matmul(&x, &y)?;
        assert_eq!(z.shape(), &Shape::from([M, N]));

        let output = engine.read_vec::<f32>(&z)?;
        for (index, (&computed, &expected)) in output.iter().zip_eq(r#ref.iter()).enumerate() {
            assert_approx_eq!(index, computed, expected, 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_matmul_int() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().add_default_ops().build();
        let engine = EngineBuilder::new(cpu).build();

        let x = engine.tensor([2, 2], [1i32, 2, 3, 4])?;
        let y = engine.tensor([2, 1], [5i32, 6])?;
        let z = engine.matmul(&x, &y)?;
        assert_eq!(engine.read_vec::<i32>(&z)?, vec![17, 39]);

        assert!(matches!(
            engine.matmul(&y, &y),
            Err(EngineError::Shape(err)) if err.operand == "b"
        ));
        let f = engine.tensor([1, 2], [1.0f32, 2.0])?;
        assert!(matches!(engine.matmul(&f, &x), Err(EngineError::DType(_))));
        Ok(())
    }
}
