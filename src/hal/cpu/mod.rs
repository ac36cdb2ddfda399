use crate::{
    hal::ops::{
        BinaryOp, CastOp, CloneOp, ConcatOp, MatMulOp, ReduceOp, ReshapeOp, SelectOp, SoftmaxOp,
        UnaryOp,
    },
    loom::device::CpuBuilder,
};

mod elementwise;
mod matmul;
mod memory;
mod norm;

impl CpuBuilder {
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

/// Evaluates `f` at every output index, in parallel when `rayon` is enabled.
fn map_indices<F>(len: usize, f: F) -> Vec<f64>
where
    F: Fn(usize) -> f64 + Send + Sync,
{
    #[cfg(not(feature = "rayon"))]
    let output = (0..len).map(f).collect();
    #[cfg(feature = "rayon")]
    let output = {
        use rayon::prelude::*;
        (0..len).into_par_iter().map(f).collect()
    };
    output
}

/// Maps every row along the last axis of `x` to a new row.
fn map_rows<F>(x: &[f64], len: usize, f: F) -> Vec<f64>
where
    F: Fn(&[f64]) -> Vec<f64> + Send + Sync,
{
    if len == 0 {
        return vec![];
    }
    #[cfg(not(feature = "rayon"))]
    let output = x.chunks_exact(len).flat_map(f).collect();
    #[cfg(feature = "rayon")]
    let output = {
        use rayon::prelude::*;
        x.par_chunks_exact(len).flat_map_iter(f).collect()
    };
    output
}
