use itertools::Itertools;

use super::launch;
use crate::{
    hal::ops::{CloneOp, ConcatOp, ReshapeOp},
    loom::{
        device::gpu::{Gpu, GpuContext, GpuProgram, shader::components},
        error::EngineError,
        ops::{BackendOp, KernelIo},
    },
};

impl<C: GpuContext> BackendOp<Gpu<C>> for ConcatOp {
    fn execute(&self, backend: &Gpu<C>, io: &KernelIo) -> Result<(), EngineError> {
        let (a, b, output) = (io.input(0), io.input(1), io.output());
        // empty buffers cannot be bound; joining with nothing is a copy
        if output.size() > 0 && (a.size() == 0 || b.size() == 0) {
            let x = if a.size() == 0 { b } else { a };
            let program = GpuProgram::new("clone", vec!["X"], output.shape().clone(), COPY);
            return backend.run_program(&program, std::slice::from_ref(x), output);
        }

        let coords = components("c", output.rank());
        let split = a.shape()[self.axis];

        let args_a = coords.iter().join(", ");
        let args_b = coords
            .iter()
            .enumerate()
            .map(|(axis, c)| match axis == self.axis {
                true => format!("{c} - {split}"),
                false => c.clone(),
            })
            .join(", ");
        let c = &coords[self.axis];
        let user_code = format!(
            r#"
fn run() {{
    let c = getOutputCoords();
    if ({c} < {split}) {{
        setOutput(getA({args_a}));
    }} else {{
        setOutput(getB({args_b}));
    }}
}}"#
        );

        let name = format!("concat_{}", self.axis);
        let program = GpuProgram::new(name, vec!["A", "B"], output.shape().clone(), user_code);
        launch(backend, program, io)
    }
}

const COPY: &str = r#"
fn run() {
    setOutput(getXFlat(out_index));
}"#;

impl<C: GpuContext> BackendOp<Gpu<C>> for CloneOp {
    fn execute(&self, backend: &Gpu<C>, io: &KernelIo) -> Result<(), EngineError> {
        let shape = io.output().shape().clone();
        let program = GpuProgram::new("clone", vec!["X"], shape, COPY);
        launch(backend, program, io)
    }
}

impl<C: GpuContext> BackendOp<Gpu<C>> for ReshapeOp {
    fn execute(&self, backend: &Gpu<C>, io: &KernelIo) -> Result<(), EngineError> {
        // flat order is preserved, so a reshape is a copy into the new layout
        let shape = io.output().shape().clone();
        let program = GpuProgram::new("reshape", vec!["X"], shape, COPY);
        launch(backend, program, io)
    }
}
