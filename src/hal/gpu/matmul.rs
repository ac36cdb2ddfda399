use super::{fill, launch};
use crate::{
    hal::ops::MatMulOp,
    loom::{
        device::gpu::{Gpu, GpuContext, GpuProgram},
        error::EngineError,
        ops::{BackendOp, KernelIo},
    },
};

impl<C: GpuContext> BackendOp<Gpu<C>> for MatMulOp {
    fn execute(&self, backend: &Gpu<C>, io: &KernelIo) -> Result<(), EngineError> {
        let k = io.input(0).shape()[1];
        if k == 0 {
            return fill(backend, io, 0.0);
        }
        let user_code = format!(
            r#"
fn run() {{
    let c = getOutputCoords();
    var acc = 0.0;
    for (var l = 0; l < {k}; l = l + 1) {{
        acc = acc + getA(c.x, l) * getB(l, c.y);
    }}
    setOutput(acc);
}}"#
        );
        let shape = io.output().shape().clone();
        let program = GpuProgram::new("matmul", vec!["A", "B"], shape, user_code);
        launch(backend, program, io)
    }
}
