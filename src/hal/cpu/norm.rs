use super::map_rows;
use crate::{
    hal::ops::{ReduceKind, ReduceOp, SoftmaxOp},
    loom::{
        device::{Backend as _, Cpu},
        error::EngineError,
        num::DataBuffer,
        ops::{BackendOp, KernelIo},
    },
};

/// Softmax of one row, shifted by its maximum so large logits do not overflow.
fn softmax(x: &[f64]) -> Vec<f64> {
    let max = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let x = x.iter().map(|x| (x - max).exp());
    let sum: f64 = x.clone().sum();
    x.map(|x| x / sum).collect()
}

fn reduce(kind: ReduceKind, x: &[f64]) -> f64 {
    let nan = |f: fn(f64, f64) -> f64| {
        move |acc: f64, x: f64| match acc.is_nan() || x.is_nan() {
            true => f64::NAN,
            false => f(acc, x),
        }
    };
    match kind {
        ReduceKind::Sum => x.iter().sum(),
        ReduceKind::Max => x.iter().copied().fold(f64::NEG_INFINITY, nan(f64::max)),
        ReduceKind::Min => x.iter().copied().fold(f64::INFINITY, nan(f64::min)),
    }
}

impl BackendOp<Cpu> for SoftmaxOp {
    fn execute(&self, backend: &Cpu, io: &KernelIo) -> Result<(), EngineError> {
        let (input, output) = (io.input(0), io.output());
        let x = backend.fetch(input.id())?.to_f64_vec();
        let len = input.shape().last().copied().unwrap_or(1);
        let values = map_rows(&x, len, softmax);
        let data = DataBuffer::from_f64(values, output.data_type());
        backend.write(output.id(), data)?;
        Ok(())
    }
}

impl BackendOp<Cpu> for ReduceOp {
    fn execute(&self, backend: &Cpu, io: &KernelIo) -> Result<(), EngineError> {
        let (input, output) = (io.input(0), io.output());
        let x = backend.fetch(input.id())?.to_f64_vec();
        let len = input.shape().last().copied().unwrap_or(1);
        let kind = self.kind;
        let values = match len {
            // every row is empty
            0 => vec![reduce(kind, &[]); output.size()],
            len => map_rows(&x, len, |row| vec![reduce(kind, row)]),
        };
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
            device::{Cpu, CpuBuilder},
            engine::{Engine, EngineBuilder},
            error::EngineError,
            num::{DataType, NAN_I32},
            shape::Shape,
        },
    };

    fn engine() -> Engine<Cpu> {
        let cpu = CpuBuilder::new().add_default_ops().build();
        EngineBuilder::new(cpu).build()
    }

    #[test]
    fn test_softmax() -> Result<(), Box<dyn Error>> {
        let engine = engine();

        let x = engine.tensor([3], [2.0f32, 1.0, 3.0])?;
        let y = engine.read_vec::<f32>(&engine.softmax(&x)?)?;
        let r#ref = [0.24472847, 0.09003057, 0.66524095];
        for (index, (&computed, &expected)) in y.iter().zip_eq(r#ref.iter()).enumerate() {
            assert_approx_eq!(index, computed, expected, 1e-6);
        }
        assert_approx_eq!("sum", y.iter().sum::<f32>(), 1.0, 1e-6);

        let x = engine.tensor([2], [-1000.0f32, 1000.0])?;
        let y = engine.read_vec::<f32>(&engine.softmax(&x)?)?;
        assert_eq!(y, vec![0.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_softmax_rows() -> Result<(), Box<dyn Error>> {
        fastrand::seed(42);
        let engine = engine();

        let data = (0..24).map(|_| fastrand::f32() * 10.0 - 5.0).collect_vec();
        let x = engine.tensor([2, 3, 4], data)?;
        let y = engine.softmax_axis(&x, 2)?;
        assert_eq!(y.shape(), &Shape::from([2, 3, 4]));
        for (index, row) in engine.read_vec::<f32>(&y)?.chunks(4).enumerate() {
            assert_approx_eq!(index, row.iter().sum::<f32>(), 1.0, 1e-5);
        }

        let err = engine.softmax_axis(&x, 1);
        assert!(matches!(err, Err(EngineError::Unsupported(_))));
        let i = engine.tensor([2], [1i32, 2])?;
        assert!(matches!(engine.softmax(&i), Err(EngineError::DType(_))));
        Ok(())
    }

    #[test]
    fn test_reduce() -> Result<(), Box<dyn Error>> {
        let engine = engine();

        let x = engine.tensor([2, 3], [1.0f32, 5.0, 3.0, -1.0, f32::NAN, 0.0])?;
        let sum = engine.read_vec::<f32>(&engine.sum(&x)?)?;
        assert_eq!(sum[0], 9.0);
        assert!(sum[1].is_nan());
        let max = engine.read_vec::<f32>(&engine.max(&x)?)?;
        assert_eq!(max[0], 5.0);
        assert!(max[1].is_nan());
        let min = engine.read_vec::<f32>(&engine.min(&x)?)?;
        assert_eq!(min[0], 1.0);

        let m = engine.tensor([4], [true, false, true, true])?;
        let count = engine.sum(&m)?;
        assert_eq!(count.data_type(), DataType::I32);
        assert_eq!(count.shape(), &Shape::scalar());
        assert_eq!(engine.read_vec::<i32>(&count)?, vec![3]);

        let i = engine.tensor([1, 2], [7i32, NAN_I32])?;
        assert_eq!(engine.read_vec::<i32>(&engine.max(&i)?)?, vec![NAN_I32]);
        Ok(())
    }

    #[test]
    fn test_composites() -> Result<(), Box<dyn Error>> {
        let engine = engine();
        let x = engine.tensor([2, 2], [1.0f32, 3.0, 1000.0, 1000.0])?;

        let before = engine.num_tensors();
        let y = engine.log_sum_exp(&x)?;
        // only the result survives the nested scope
        assert_eq!(engine.num_tensors(), before + 1);
        let y = engine.read_vec::<f32>(&y)?;
        assert_approx_eq!(0, y[0], 3.126928, 1e-5);
        assert_approx_eq!(1, y[1], 1000.6931, 1e-3);

        let i = engine.tensor([2, 2], [1i32, 2, 3, 6])?;
        let mean = engine.mean(&i)?;
        assert_eq!(engine.num_tensors(), before + 3);
        assert_eq!(engine.read_vec::<f32>(&mean)?, vec![1.5, 4.5]);
        Ok(())
    }
}
