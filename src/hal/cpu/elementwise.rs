use super::map_indices;
use crate::{
    hal::ops::{BinaryKind, BinaryOp, CastOp, SelectOp, UnaryKind, UnaryOp},
    loom::{
        device::{Backend as _, Cpu},
        error::EngineError,
        num::{DataBuffer, DataType},
        ops::{BackendOp, KernelIo},
    },
};

/// Comparisons involving NaN are false.
fn compare(x: f64, y: f64, f: impl Fn(f64, f64) -> bool) -> f64 {
    match x.is_nan() || y.is_nan() {
        true => 0.0,
        false => f(x, y) as u8 as f64,
    }
}

fn binary(kind: BinaryKind, x: f64, y: f64) -> f64 {
    match kind {
        BinaryKind::Add => x + y,
        BinaryKind::Sub => x - y,
        BinaryKind::Mul => x * y,
        BinaryKind::Div => x / y,
        BinaryKind::Pow => x.powf(y),
        // `f64::max` drops NaN, these propagate it
        BinaryKind::Maximum if x.is_nan() || y.is_nan() => f64::NAN,
        BinaryKind::Maximum => x.max(y),
        BinaryKind::Minimum if x.is_nan() || y.is_nan() => f64::NAN,
        BinaryKind::Minimum => x.min(y),
        BinaryKind::Equal => compare(x, y, |x, y| x == y),
        BinaryKind::Greater => compare(x, y, |x, y| x > y),
        BinaryKind::Less => compare(x, y, |x, y| x < y),
    }
}

fn unary(kind: UnaryKind, x: f64) -> f64 {
    match kind {
        UnaryKind::Neg => -x,
        UnaryKind::Abs => x.abs(),
        UnaryKind::Exp => x.exp(),
        UnaryKind::Log => x.ln(),
        UnaryKind::Sqrt => x.sqrt(),
        UnaryKind::Square => x * x,
        UnaryKind::Relu if x.is_nan() => x,
        UnaryKind::Relu => x.max(0.0),
        UnaryKind::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        UnaryKind::Tanh => x.tanh(),
    }
}

impl BackendOp<Cpu> for BinaryOp {
    fn execute(&self, backend: &Cpu, io: &KernelIo) -> Result<(), EngineError> {
        let (a, b, output) = (io.input(0), io.input(1), io.output());
        let x = backend.fetch(a.id())?.to_f64_vec();
        let y = backend.fetch(b.id())?.to_f64_vec();

        let kind = self.kind;
        let shape = output.shape();
        let values = match (a.shape() == shape, b.shape() == shape) {
            // no broadcasting, skip the coordinate math
            (true, true) => map_indices(shape.size(), |index| binary(kind, x[index], y[index])),
            _ => map_indices(shape.size(), |index| {
                let coords = shape.coords(index);
                let x = x[a.shape().broadcast_index(&coords)];
                let y = y[b.shape().broadcast_index(&coords)];
                binary(kind, x, y)
            }),
        };
        let data = DataBuffer::from_f64(values, output.data_type());
        backend.write(output.id(), data)?;
        Ok(())
    }
}

impl BackendOp<Cpu> for UnaryOp {
    fn execute(&self, backend: &Cpu, io: &KernelIo) -> Result<(), EngineError> {
        let output = io.output();
        let x = backend.fetch(io.input(0).id())?.to_f64_vec();
        let kind = self.kind;
        let values = map_indices(x.len(), |index| unary(kind, x[index]));
        let data = DataBuffer::from_f64(values, output.data_type());
        backend.write(output.id(), data)?;
        Ok(())
    }
}

impl BackendOp<Cpu> for SelectOp {
    fn execute(&self, backend: &Cpu, io: &KernelIo) -> Result<(), EngineError> {
        let output = io.output();
        let cond = backend.fetch(io.input(0).id())?.to_f64_vec();
        let a = backend.fetch(io.input(1).id())?.to_f64_vec();
        let b = backend.fetch(io.input(2).id())?.to_f64_vec();
        let values = map_indices(cond.len(), |index| match cond[index] {
            x if x.is_nan() => f64::NAN,
            x if x != 0.0 => a[index],
            _ => b[index],
        });
        let data = DataBuffer::from_f64(values, output.data_type());
        backend.write(output.id(), data)?;
        Ok(())
    }
}

impl BackendOp<Cpu> for CastOp {
    fn execute(&self, backend: &Cpu, io: &KernelIo) -> Result<(), EngineError> {
        let output = io.output();
        let data = backend.fetch(io.input(0).id())?;
        if data.data_type() == self.r#type {
            backend.write(output.id(), data)?;
            return Ok(());
        }
        let x = data.to_f64_vec();
        let values = match self.r#type {
            DataType::I32 => x.into_iter().map(f64::trunc).collect(),
            _ => x,
        };
        let data = DataBuffer::from_f64(values, self.r#type);
        backend.write(output.id(), data)?;
        Ok(())
    }
}
