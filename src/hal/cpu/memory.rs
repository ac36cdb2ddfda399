use itertools::Itertools;

use crate::{
    hal::ops::{CloneOp, ConcatOp, ReshapeOp},
    loom::{
        device::{Backend as _, Cpu},
        error::EngineError,
        num::DataBuffer,
        ops::{BackendOp, KernelIo},
    },
};

impl BackendOp<Cpu> for ConcatOp {
    fn execute(&self, backend: &Cpu, io: &KernelIo) -> Result<(), EngineError> {
        let (a, b, output) = (io.input(0), io.input(1), io.output());
        let x = backend.fetch(a.id())?.to_f64_vec();
        let y = backend.fetch(b.id())?.to_f64_vec();

        // both operands are runs of contiguous chunks, one per index of the outer axes
        let outer: usize = output.shape()[..self.axis].iter().product();
        let ca: usize = a.shape()[self.axis..].iter().product();
        let cb: usize = b.shape()[self.axis..].iter().product();
        let values = (0..outer)
            .flat_map(|index| {
                let x = &x[index * ca..(index + 1) * ca];
                let y = &y[index * cb..(index + 1) * cb];
                x.iter().chain(y).copied()
            })
            .collect_vec();

        let data = DataBuffer::from_f64(values, output.data_type());
        backend.write(output.id(), data)?;
        Ok(())
    }
}

impl BackendOp<Cpu> for CloneOp {
    fn execute(&self, backend: &Cpu, io: &KernelIo) -> Result<(), EngineError> {
        let data = backend.fetch(io.input(0).id())?;
        backend.write(io.output().id(), data)?;
        Ok(())
    }
}

impl BackendOp<Cpu> for ReshapeOp {
    fn execute(&self, backend: &Cpu, io: &KernelIo) -> Result<(), EngineError> {
        let data = backend.fetch(io.input(0).id())?;
        backend.write(io.output().id(), data)?;
        Ok(())
    }
}
