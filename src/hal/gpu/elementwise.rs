use super::launch;
use crate::{
    hal::ops::{BinaryKind, BinaryOp, CastOp, SelectOp, UnaryKind, UnaryOp},
    loom::{
        device::gpu::{Gpu, GpuContext, GpuProgram},
        error::EngineError,
        num::DataType,
        ops::{BackendOp, KernelIo},
    },
};

/// `pow` is undefined for negative bases in WGSL.
const POWER: &str = r#"
fn power(x: f32, y: f32) -> f32 {
    if (y == 0.0) {
        return 1.0;
    }
    let r = pow(abs(x), y);
    if (x >= 0.0) {
        return r;
    }
    if (y != floor(y)) {
        return make_nan();
    }
    if (y - 2.0 * floor(y * 0.5) == 1.0) {
        return -r;
    }
    return r;
}
"#;

/// `tanh` overflows for large inputs on some drivers.
const TANH: &str = r#"
fn stable_tanh(x: f32) -> f32 {
    let e = exp(-2.0 * abs(x));
    return sign(x) * (1.0 - e) / (1.0 + e);
}
"#;

impl<C: GpuContext> BackendOp<Gpu<C>> for BinaryOp {
    fn execute(&self, backend: &Gpu<C>, io: &KernelIo) -> Result<(), EngineError> {
        let (value, helper) = match self.kind {
            BinaryKind::Add => ("a + b", ""),
            BinaryKind::Sub => ("a - b", ""),
            BinaryKind::Mul => ("a * b", ""),
            BinaryKind::Div => ("a / b", ""),
            BinaryKind::Pow => ("power(a, b)", POWER),
            BinaryKind::Maximum => ("max(a, b)", ""),
            BinaryKind::Minimum => ("min(a, b)", ""),
            BinaryKind::Equal => ("select(0.0, 1.0, a == b)", ""),
            BinaryKind::Greater => ("select(0.0, 1.0, a > b)", ""),
            BinaryKind::Less => ("select(0.0, 1.0, a < b)", ""),
        };
        // comparisons against NaN are false, everything else propagates it
        let nan = match self.kind.is_comparison() {
            true => "0.0",
            false => "make_nan()",
        };
        let user_code = format!(
            r#"{helper}
fn run() {{
    let a = getAAtOutCoords();
    let b = getBAtOutCoords();
    if (is_nan(a) || is_nan(b)) {{
        setOutput({nan});
        return;
    }}
    setOutput({value});
}}"#
        );
        let shape = io.output().shape().clone();
        let program = GpuProgram::new(self.kind.to_string(), vec!["A", "B"], shape, user_code)
            .with_broadcast(true);
        launch(backend, program, io)
    }
}

impl<C: GpuContext> BackendOp<Gpu<C>> for UnaryOp {
    fn execute(&self, backend: &Gpu<C>, io: &KernelIo) -> Result<(), EngineError> {
        let (value, helper) = match self.kind {
            UnaryKind::Neg => ("-x", ""),
            UnaryKind::Abs => ("abs(x)", ""),
            UnaryKind::Exp => ("exp(x)", ""),
            UnaryKind::Log => ("select(log(x), make_nan(), x < 0.0)", ""),
            UnaryKind::Sqrt => ("select(sqrt(x), make_nan(), x < 0.0)", ""),
            UnaryKind::Square => ("x * x", ""),
            UnaryKind::Relu => ("max(x, 0.0)", ""),
            UnaryKind::Sigmoid => ("1.0 / (1.0 + exp(-x))", ""),
            UnaryKind::Tanh => ("stable_tanh(x)", TANH),
        };
        let user_code = format!(
            r#"{helper}
fn run() {{
    let x = getXAtOutCoords();
    if (is_nan(x)) {{
        setOutput(make_nan());
        return;
    }}
    setOutput({value});
}}"#
        );
        let shape = io.output().shape().clone();
        let program = GpuProgram::new(self.kind.to_string(), vec!["X"], shape, user_code);
        launch(backend, program, io)
    }
}

impl<C: GpuContext> BackendOp<Gpu<C>> for SelectOp {
    fn execute(&self, backend: &Gpu<C>, io: &KernelIo) -> Result<(), EngineError> {
        let user_code = r#"
fn run() {
    let cond = getCondFlat(out_index);
    if (is_nan(cond)) {
        setOutput(make_nan());
        return;
    }
    setOutput(select(getBFlat(out_index), getAFlat(out_index), cond != 0.0));
}"#;
        let shape = io.output().shape().clone();
        let program = GpuProgram::new("select", vec!["Cond", "A", "B"], shape, user_code);
        launch(backend, program, io)
    }
}

impl<C: GpuContext> BackendOp<Gpu<C>> for CastOp {
    fn execute(&self, backend: &Gpu<C>, io: &KernelIo) -> Result<(), EngineError> {
        let value = match self.r#type {
            DataType::F32 => "x",
            DataType::I32 => "trunc(x)",
            DataType::Bool => "select(0.0, 1.0, x != 0.0)",
        };
        let user_code = format!(
            r#"
fn run() {{
    let x = getXFlat(out_index);
    if (is_nan(x)) {{
        setOutput(make_nan());
        return;
    }}
    setOutput({value});
}}"#
        );
        let shape = io.output().shape().clone();
        let name = format!("cast_{}", self.r#type);
        let program = GpuProgram::new(name, vec!["X"], shape, user_code);
        launch(backend, program, io)
    }
}
