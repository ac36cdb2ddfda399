//! Generates WGSL for a [`GpuProgram`] specialized to concrete shapes.
//!
//! Every input `X` is bound as a flat `array<f32>` holding its packed texture in
//! row-major order, and gets these accessors:
//! - `sampleX(rc: vec2<i32>)`: one texel by row and column;
//! - `getXFlat(index: i32)`: one element by flat logical index;
//! - `getX(i0, ..)`: one element by logical coordinates, clamped on broadcast axes
//!   when the program broadcasts;
//! - `getXAtOutCoords()`: the element aligned with the current output element.
//!
//! The output side provides `getOutputCoords()`, `setOutput(value)` and the private
//! `out_index`. NaN helpers are `is_nan(x)` and `make_nan()`. The program's user code
//! must define `fn run()`.

use std::fmt::Write;

use itertools::Itertools;

use super::{
    GpuError,
    program::{GpuProgram, ShapeInfo},
};
use crate::loom::error::{EngineError, ShapeMismatchError, UnsupportedFeatureError};

/// Threads per workgroup along `x`.
pub const WORKGROUP_SIZE: u32 = 64;
/// Highest rank the generated coordinate accessors support.
pub const MAX_RANK: usize = 4;
/// Workgroups per dispatch dimension.
pub const MAX_WORKGROUPS: u32 = 65535;

const NAN_UNIFORM: &str = "WEFT_NAN_UNIFORM_ENABLED";

const PRELUDE: &str = r#"
var<private> out_index: i32;
var<private> nan_bits: u32 = 0x7fc00000u;

fn is_nan(x: f32) -> bool {
    let bits = bitcast<u32>(x);
#ifdef WEFT_NAN_UNIFORM_ENABLED
    if (bits == bitcast<u32>(nan_uniform.x)) {
        return true;
    }
#endif
    return (bits & 0x7f800000u) == 0x7f800000u && (bits & 0x007fffffu) != 0u;
}

fn make_nan() -> f32 {
#ifdef WEFT_NAN_UNIFORM_ENABLED
    return nan_uniform.x;
#else
    return bitcast<f32>(nan_bits);
#endif
}

fn setOutput(value: f32) {
    out_buf[out_index] = value;
}
"#;

/// Components of a coordinate value of `rank` bound to `name`, outermost first.
///
/// Rank 1 coordinates are a bare `i32`; ranks 2 to 4 are `vecN<i32>`.
pub fn components(name: &str, rank: usize) -> Vec<String> {
    match rank {
        0 => vec![],
        1 => vec![name.to_string()],
        _ => ["x", "y", "z", "w"][..rank]
            .iter()
            .map(|c| format!("{name}.{c}"))
            .collect(),
    }
}

/// The WGSL type of a coordinate value of `rank`.
pub fn coords_type(rank: usize) -> String {
    match rank {
        0 | 1 => "i32".into(),
        rank => format!("vec{rank}<i32>"),
    }
}

fn check_rank(program: &GpuProgram, rank: usize) -> Result<(), EngineError> {
    if rank > MAX_RANK {
        let op = program.name.to_string();
        let max = MAX_RANK;
        return Err(UnsupportedFeatureError::Rank { op, rank, max }.into());
    }
    Ok(())
}

/// Builds the full WGSL source of `program` for the given bindings.
///
/// `nan_uniform` selects the NaN encoding for devices without float textures:
/// `make_nan` then returns the value uploaded in a uniform instead of a bit pattern,
/// and `is_nan` also matches that value.
#[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(program = %program.name)))]
pub fn build_source(
    program: &GpuProgram,
    inputs: &[ShapeInfo],
    output: &ShapeInfo,
    nan_uniform: bool,
) -> Result<String, EngineError> {
    if program.variables.len() != inputs.len() {
        let err = ShapeMismatchError::new(
            "inputs",
            format!("{} inputs", program.variables.len()),
            format!("{} inputs", inputs.len()),
        );
        return Err(err.into());
    }
    for info in inputs.iter().chain([output]) {
        check_rank(program, info.logical.rank())?;
    }

    let mut source = String::new();
    for (binding, name) in program.variables.iter().enumerate() {
        let _ = writeln!(
            source,
            "@group(0) @binding({binding}) var<storage, read> buf_{name}: array<f32>;"
        );
    }
    let binding = inputs.len();
    let _ = writeln!(
        source,
        "@group(0) @binding({binding}) var<storage, read_write> out_buf: array<f32>;"
    );
    let _ = writeln!(source, "#ifdef {NAN_UNIFORM}");
    let _ = writeln!(
        source,
        "@group(0) @binding({}) var<uniform> nan_uniform: vec4<f32>;",
        binding + 1
    );
    let _ = writeln!(source, "#endif");
    source.push_str(PRELUDE);

    source.push_str(&output_coords(output));
    for (name, info) in program.variables.iter().zip_eq(inputs) {
        source.push_str(&input_accessors(name, info, output, program.broadcast));
    }
    source.push_str(&entry_point(output));
    source.push('\n');
    source.push_str(&program.user_code);
    source.push('\n');

    preprocess(&source, nan_uniform).map_err(Into::into)
}

fn preprocess(source: &str, nan_uniform: bool) -> Result<String, GpuError> {
    let mut context = gpp::Context::new();
    if nan_uniform {
        context.macros.insert(NAN_UNIFORM.into(), "1".into());
    }
    gpp::process_str(source, &mut context).map_err(|err| GpuError::Preprocess(err.to_string()))
}

fn output_coords(output: &ShapeInfo) -> String {
    let rank = output.logical.rank();
    let strides = output.logical.strides();
    let ty = coords_type(rank);
    let mut body = String::new();
    match rank {
        0 => body.push_str("    return 0;\n"),
        1 => body.push_str("    return out_index;\n"),
        _ => {
            body.push_str("    var index = out_index;\n");
            for (axis, stride) in strides.iter().enumerate().take(rank - 1) {
                let _ = writeln!(body, "    let c{axis} = index / {stride};");
                let _ = writeln!(body, "    index = index - c{axis} * {stride};");
            }
            let coords = (0..rank - 1).map(|axis| format!("c{axis}")).join(", ");
            let _ = writeln!(body, "    return {ty}({coords}, index);");
        }
    }
    format!("\nfn getOutputCoords() -> {ty} {{\n{body}}}\n")
}

fn input_accessors(name: &str, info: &ShapeInfo, output: &ShapeInfo, broadcast: bool) -> String {
    let cols = info.texture.cols().max(1);
    let shape = &info.logical;
    let rank = shape.rank();

    let mut source = String::new();
    let _ = write!(
        source,
        "
fn sample{name}(rc: vec2<i32>) -> f32 {{
    return buf_{name}[rc.x * {cols} + rc.y];
}}

fn get{name}Flat(index: i32) -> f32 {{
    return sample{name}(vec2<i32>(index / {cols}, index % {cols}));
}}
"
    );

    let params = (0..rank).map(|axis| format!("i{axis}: i32")).join(", ");
    let index = match rank {
        0 => "0".to_string(),
        _ => shape
            .strides()
            .iter()
            .enumerate()
            .map(|(axis, stride)| match broadcast {
                true => format!("min(i{axis}, {}) * {stride}", shape[axis].max(1) - 1),
                false => format!("i{axis} * {stride}"),
            })
            .join(" + "),
    };
    let _ = write!(
        source,
        "
fn get{name}({params}) -> f32 {{
    return get{name}Flat({index});
}}
"
    );

    // inputs of higher rank than the output (reductions) have no aligned element
    let out_rank = output.logical.rank();
    if rank <= out_rank {
        let args = components("coords", out_rank)
            .into_iter()
            .skip(out_rank - rank)
            .join(", ");
        let coords = match out_rank {
            0 => "",
            _ => "    let coords = getOutputCoords();\n",
        };
        let _ = write!(
            source,
            "
fn get{name}AtOutCoords() -> f32 {{
{coords}    return get{name}({args});
}}
"
        );
    }
    source
}

fn entry_point(output: &ShapeInfo) -> String {
    let size = output.logical.size();
    format!(
        "
@compute @workgroup_size({WORKGROUP_SIZE}, 1, 1)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {{
    let index = gid.x + gid.y * groups.x * {WORKGROUP_SIZE}u;
    if (index >= {size}u) {{
        return;
    }}
    out_index = i32(index);
    run();
}}
"
    )
}

/// Workgroup counts covering `size` threads, spilling into `y` past the per-dimension limit.
pub fn dispatch_size(size: usize) -> [u32; 3] {
    let groups = (size as u32).div_ceil(WORKGROUP_SIZE);
    match groups {
        groups if groups <= MAX_WORKGROUPS => [groups, 1, 1],
        groups => [MAX_WORKGROUPS, groups.div_ceil(MAX_WORKGROUPS), 1],
    }
}

/// Parses and validates WGSL the way the driver would, without a device.
pub fn validate_wgsl(source: &str) -> Result<naga::Module, GpuError> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|err| GpuError::Compile(err.emit_to_string(source)))?;
    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::empty(),
    )
    .validate(&module)
    .map_err(|err| GpuError::Compile(format!("{err:?}")))?;
    Ok(module)
}
