use super::{fill, launch};
use crate::{
    hal::ops::{ReduceKind, ReduceOp, SoftmaxOp},
    loom::{
        device::gpu::{Gpu, GpuContext, GpuProgram},
        error::EngineError,
        ops::{BackendOp, KernelIo},
    },
};

impl<C: GpuContext> BackendOp<Gpu<C>> for SoftmaxOp {
    fn execute(&self, backend: &Gpu<C>, io: &KernelIo) -> Result<(), EngineError> {
        let output = io.output();
        let len = output.shape().last().copied().unwrap_or(1);
        // a row holding NaN is NaN throughout
        let user_code = format!(
            r#"
fn run() {{
    let start = out_index - out_index % {len};
    var m = getXFlat(start);
    for (var i = 0; i < {len}; i = i + 1) {{
        let x = getXFlat(start + i);
        if (is_nan(x)) {{
            setOutput(make_nan());
            return;
        }}
        m = max(m, x);
    }}
    var sum = 0.0;
    for (var i = 0; i < {len}; i = i + 1) {{
        sum = sum + exp(getXFlat(start + i) - m);
    }}
    setOutput(exp(getXFlat(out_index) - m) / sum);
}}"#
        );
        let program = GpuProgram::new("softmax", vec!["X"], output.shape().clone(), user_code);
        launch(backend, program, io)
    }
}

impl<C: GpuContext> BackendOp<Gpu<C>> for ReduceOp {
    fn execute(&self, backend: &Gpu<C>, io: &KernelIo) -> Result<(), EngineError> {
        let output = io.output();
        let len = io.input(0).shape().last().copied().unwrap_or(1);
        if len == 0 {
            let identity = match self.kind {
                ReduceKind::Sum => 0.0,
                ReduceKind::Max => f64::NEG_INFINITY,
                ReduceKind::Min => f64::INFINITY,
            };
            return fill(backend, io, identity);
        }

        let (init, combine) = match self.kind {
            ReduceKind::Sum => ("0.0", "acc + x"),
            ReduceKind::Max => ("getXFlat(start)", "max(acc, x)"),
            ReduceKind::Min => ("getXFlat(start)", "min(acc, x)"),
        };
        let user_code = format!(
            r#"
fn run() {{
    let start = out_index * {len};
    var acc = {init};
    for (var i = 0; i < {len}; i = i + 1) {{
        let x = getXFlat(start + i);
        if (is_nan(x)) {{
            setOutput(make_nan());
            return;
        }}
        acc = {combine};
    }}
    setOutput(acc);
}}"#
        );
        let name = format!("reduce_{}", self.kind);
        let program = GpuProgram::new(name, vec!["X"], output.shape().clone(), user_code);
        launch(backend, program, io)
    }
}
