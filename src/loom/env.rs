//! Device capability flags, probed lazily and cached for the life of an [`Environment`].

use std::{str::FromStr, sync::Mutex};

use derive_more::Display;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

/// Name of the process environment variable holding flag overrides.
pub const FLAGS_VAR: &str = "WEFT_FLAGS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Feature {
    /// Device resources can hold 32-bit floats, including NaN, directly.
    #[display("FLOAT_TEXTURE_ENABLED")]
    FloatTextureEnabled,
    /// The device can download a resource without blocking the caller.
    #[display("ASYNC_READBACK_ENABLED")]
    AsyncReadbackEnabled,
    /// Largest side of a 2-D device resource.
    #[display("MAX_TEXTURE_SIZE")]
    MaxTextureSize,
    #[display("DEVICE_API_VERSION")]
    DeviceApiVersion,
}

impl Feature {
    pub const ALL: [Feature; 4] = [
        Feature::FloatTextureEnabled,
        Feature::AsyncReadbackEnabled,
        Feature::MaxTextureSize,
        Feature::DeviceApiVersion,
    ];

    #[inline]
    fn is_bool(self) -> bool {
        matches!(
            self,
            Feature::FloatTextureEnabled | Feature::AsyncReadbackEnabled
        )
    }
}

impl FromStr for Feature {
    type Err = EnvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|feature| feature.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| EnvError::UnknownFlag(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Display)]
pub enum FlagValue {
    Bool(bool),
    Number(f64),
}

impl FlagValue {
    #[inline]
    pub fn as_bool(self) -> bool {
        match self {
            FlagValue::Bool(value) => value,
            FlagValue::Number(value) => value != 0.0,
        }
    }

    #[inline]
    pub fn as_number(self) -> f64 {
        match self {
            FlagValue::Bool(value) => value as u8 as f64,
            FlagValue::Number(value) => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    #[error("unknown feature flag `{0}`")]
    UnknownFlag(String),
    #[error("invalid value `{1}` for feature flag `{0}`")]
    InvalidValue(Feature, String),
    #[error("malformed feature flag entry `{0}`, expected `NAME=value`")]
    Malformed(String),
}

/// A key-value store of device capabilities.
///
/// Overrides win over probing. Probed values are computed at most once.
#[derive(Debug, Default)]
pub struct Environment {
    overrides: HashMap<Feature, FlagValue>,
    cache: Mutex<HashMap<Feature, FlagValue>>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses overrides of the form `NAME=value,NAME=value`.
    pub fn from_flags(flags: &str) -> Result<Self, EnvError> {
        let mut env = Self::new();
        for entry in flags.split(',').map(str::trim).filter(|x| !x.is_empty()) {
            let Some((name, value)) = entry.split_once('=') else {
                return Err(EnvError::Malformed(entry.to_string()));
            };
            let feature: Feature = name.trim().parse()?;
            let value = value.trim();
            let value = match (feature.is_bool(), value) {
                (true, "true") => FlagValue::Bool(true),
                (true, "false") => FlagValue::Bool(false),
                (false, value) => value
                    .parse()
                    .map(FlagValue::Number)
                    .map_err(|_| EnvError::InvalidValue(feature, value.to_string()))?,
                (true, value) => return Err(EnvError::InvalidValue(feature, value.to_string())),
            };
            env.overrides.insert(feature, value);
        }
        Ok(env)
    }

    /// Reads overrides from [`FLAGS_VAR`]. A malformed variable is logged and ignored.
    pub fn from_env() -> Self {
        match std::env::var(FLAGS_VAR) {
            Ok(flags) => Self::from_flags(&flags).unwrap_or_else(|err| {
                log::warn!("ignoring {FLAGS_VAR}: {err}");
                Self::new()
            }),
            Err(_) => Self::new(),
        }
    }

    pub fn with(mut self, feature: Feature, value: FlagValue) -> Self {
        self.set(feature, value);
        self
    }

    pub fn set(&mut self, feature: Feature, value: FlagValue) {
        self.overrides.insert(feature, value);
    }

    /// Returns the flag's value, calling `probe` only on the first query of a flag with no override.
    pub fn get(&self, feature: Feature, probe: impl FnOnce(Feature) -> FlagValue) -> FlagValue {
        if let Some(value) = self.overrides.get(&feature) {
            return *value;
        }
        let mut cache = self.cache.lock().expect("failed to lock");
        *cache.entry(feature).or_insert_with(|| {
            let value = probe(feature);
            log::debug!("probed {feature} = {value}");
            value
        })
    }

    /// Forgets every probed value. Overrides are kept.
    pub fn reset(&self) {
        self.cache.lock().expect("failed to lock").clear();
    }
}
