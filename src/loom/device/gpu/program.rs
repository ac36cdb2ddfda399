use std::{
    borrow::Cow,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use derive_more::Display;
use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;

use crate::loom::{
    error::{EngineError, ShapeMismatchError},
    shape::{Shape, TexShape},
};

/// Logical shape of a tensor and the shape of the texture holding it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[display("{logical}_{texture}")]
pub struct ShapeInfo {
    pub logical: Shape,
    pub texture: TexShape,
}

/// An op template to be specialized for concrete shapes.
#[derive(Debug, Clone)]
pub struct GpuProgram {
    /// Identity of the op the program implements.
    pub name: Cow<'static, str>,
    /// Names of the inputs, bound in order. Accessors are generated as `get{name}`.
    pub variables: Vec<&'static str>,
    pub output_shape: Shape,
    /// WGSL defining `fn run()`, which calls the generated accessors and `setOutput`.
    pub user_code: String,
    /// Whether inputs may broadcast against the output.
    pub broadcast: bool,
    /// Inputs whose leading batch axes may vary between launches of one compiled program.
    pub batch_dims: Option<usize>,
}

impl GpuProgram {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        variables: Vec<&'static str>,
        output_shape: Shape,
        user_code: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            variables,
            output_shape,
            user_code: user_code.into(),
            broadcast: false,
            batch_dims: None,
        }
    }

    pub fn with_broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    pub fn with_batch_dims(mut self, batch_dims: usize) -> Self {
        self.batch_dims = Some(batch_dims);
        self
    }
}

/// The structural signature of a specialized program.
///
/// Two launches share a compiled program only if their keys are equal.
pub fn make_shader_key(program: &GpuProgram, inputs: &[ShapeInfo], output: &ShapeInfo) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        program.name,
        program.broadcast,
        inputs.iter().format("|"),
        output,
        program.user_code
    )
}

/// A compiled, shape-specialized program.
#[derive(Debug)]
pub struct Binary<P> {
    pub program: P,
    pub source: String,
    pub inputs: Vec<ShapeInfo>,
    pub output: ShapeInfo,
    pub batch_dims: Option<usize>,
}

impl<P> Binary<P> {
    /// Checks that a launch binds what the program was compiled for.
    pub fn validate(&self, inputs: &[ShapeInfo], output: &ShapeInfo) -> Result<(), EngineError> {
        if inputs.len() != self.inputs.len() {
            let err = ShapeMismatchError::new(
                "inputs",
                format!("{} inputs", self.inputs.len()),
                format!("{} inputs", inputs.len()),
            );
            return Err(err.into());
        }
        if self.batch_dims.is_some() {
            return Ok(());
        }
        for (index, (expected, actual)) in self.inputs.iter().zip_eq(inputs).enumerate() {
            if expected != actual {
                let operand = format!("input {index}");
                return Err(ShapeMismatchError::new(operand, expected, actual).into());
            }
        }
        if &self.output != output {
            return Err(ShapeMismatchError::new("output", &self.output, output).into());
        }
        Ok(())
    }
}

/// Compiled programs by [`make_shader_key`]. Entries live until [`ProgramCache::clear`].
#[derive(Debug)]
pub struct ProgramCache<P> {
    binaries: Mutex<HashMap<String, Arc<Binary<P>>>>,
    compiles: AtomicUsize,
}

impl<P> Default for ProgramCache<P> {
    fn default() -> Self {
        Self {
            binaries: Default::default(),
            compiles: AtomicUsize::new(0),
        }
    }
}

impl<P> ProgramCache<P> {
    /// Returns the cached binary for `key`, compiling it with `compile` on a miss.
    ///
    /// The lock is held while compiling, so concurrent misses on one key compile once.
    pub fn get_or_compile(
        &self,
        key: String,
        compile: impl FnOnce() -> Result<Binary<P>, EngineError>,
    ) -> Result<Arc<Binary<P>>, EngineError> {
        let mut binaries = self.binaries.lock().expect("failed to lock");
        if let Some(binary) = binaries.get(&key) {
            return Ok(binary.clone());
        }
        let binary = Arc::new(compile()?);
        self.compiles.fetch_add(1, Ordering::AcqRel);
        binaries.insert(key, binary.clone());
        Ok(binary)
    }

    /// Number of programs compiled through this cache.
    #[inline]
    pub fn num_compiled(&self) -> usize {
        self.compiles.load(Ordering::Acquire)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.binaries.lock().expect("failed to lock").len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.binaries.lock().expect("failed to lock").clear();
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Binary, GpuProgram, ProgramCache, ShapeInfo, make_shader_key};
    use crate::loom::{
        error::EngineError,
        shape::{Shape, TexShape},
    };

    fn info(shape: impl Into<Shape>) -> ShapeInfo {
        let logical = shape.into();
        let texture = TexShape::from_shape(&logical, 1024);
        ShapeInfo { logical, texture }
    }

    fn binary(inputs: Vec<ShapeInfo>, output: ShapeInfo) -> Binary<()> {
        Binary {
            program: (),
            source: String::new(),
            inputs,
            output,
            batch_dims: None,
        }
    }

    #[test]
    fn test_shader_key() {
        let program = GpuProgram::new("add", vec!["A", "B"], Shape::from([3]), "fn run() {}")
            .with_broadcast(true);
        let key = make_shader_key(&program, &[info([3]), info([1])], &info([3]));
        assert_eq!(key, "add|true|[3]_[3, 1]|[1]_[1, 1]|[3]_[3, 1]|fn run() {}");

        // same op, different shape
        let other = make_shader_key(&program, &[info([3]), info([3])], &info([3]));
        assert_ne!(key, other);
        // same shapes, different template
        let mut program = program;
        program.user_code = "fn run() { }".into();
        assert_ne!(key, make_shader_key(&program, &[info([3]), info([1])], &info([3])));
    }

    #[test]
    fn test_validate() {
        let compiled = binary(vec![info([2, 3]), info([3])], info([2, 3]));
        assert!(compiled.validate(&[info([2, 3]), info([3])], &info([2, 3])).is_ok());
        assert!(matches!(
            compiled.validate(&[info([2, 3])], &info([2, 3])),
            Err(EngineError::Shape(_))
        ));
        assert!(matches!(
            compiled.validate(&[info([2, 3]), info([1])], &info([2, 3])),
            Err(EngineError::Shape(err)) if err.operand == "input 1"
        ));

        let mut batched = compiled;
        batched.batch_dims = Some(1);
        assert!(batched.validate(&[info([4, 3]), info([3])], &info([4, 3])).is_ok());
    }

    #[test]
    fn test_cache_hits() -> Result<(), Box<dyn Error>> {
        let cache = ProgramCache::default();
        let compile = || Ok(binary(vec![info([3])], info([3])));
        let a = cache.get_or_compile("a".into(), compile)?;
        let b = cache.get_or_compile("a".into(), compile)?;
        assert!(std::sync::Arc::ptr_eq(&a, &b));
        assert_eq!(cache.num_compiled(), 1);

        cache.get_or_compile("b".into(), compile)?;
        assert_eq!(cache.num_compiled(), 2);
        assert_eq!(cache.len(), 2);

        let failed = cache.get_or_compile("c".into(), || {
            Err(EngineError::NotANumber("never compiled".into()))
        });
        assert!(failed.is_err());
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
        Ok(())
    }
}
