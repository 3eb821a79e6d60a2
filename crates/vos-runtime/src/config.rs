//! Engine configuration – reads `vos.toml`-style files.
//!
//! ```toml
//! workers = 4
//! read_previous_frame = false
//!
//! [codec]
//! kind = "enhanced"
//! top_k = 32
//!
//! [retention]
//! mem_every = 5
//! ```
//!
//! Every field is optional; see [`EngineConfig::default`].  The retention
//! table must end up with exactly one of `mem_every` / `mem_number`, which is
//! checked when the engine is built, not when the file is parsed.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use vos_codec::CodecVariant;
use vos_memory::{RetentionPolicy, RetentionSpec};
use vos_types::VosError;

use crate::engine::{EngineOptions, PropagationEngine};
use crate::pool::SequencePool;

/// Explicit, process-state-free configuration of a propagation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of sequences processed concurrently by a [`SequencePool`].
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// See [`EngineOptions::read_previous_frame`].
    #[serde(default)]
    pub read_previous_frame: bool,

    /// Which codec to build.
    #[serde(default)]
    pub codec: CodecVariant,

    #[serde(default = "default_retention")]
    pub retention: RetentionSpec,
}

fn default_retention() -> RetentionSpec {
    RetentionSpec::every(5)
}
fn default_workers() -> usize {
    2
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            read_previous_frame: false,
            codec: CodecVariant::default(),
            retention: default_retention(),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, VosError> {
        toml::from_str(raw)
            .map_err(|e| VosError::Configuration(format!("failed to parse config: {e}")))
    }

    /// Load the config from `path`, then apply `VOS_*` environment overrides.
    /// Returns `None` if the file does not exist.
    pub fn load_from(path: &Path) -> Result<Option<Self>, VosError> {
        let mut cfg = Self::read_file(path)?;
        if let Some(cfg) = cfg.as_mut() {
            cfg.apply_env_overrides();
        }
        Ok(cfg)
    }

    /// Parse the file at `path` as is, without environment overrides.
    /// Returns `None` if the file does not exist.
    pub fn read_file(path: &Path) -> Result<Option<Self>, VosError> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path).map_err(|e| {
            VosError::Configuration(format!("failed to read config at {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw).map(Some)
    }

    /// Render the config as pretty TOML.
    pub fn to_toml_string(&self) -> Result<String, VosError> {
        toml::to_string_pretty(self)
            .map_err(|e| VosError::Configuration(format!("failed to serialize config: {e}")))
    }

    /// Apply `VOS_*` environment variable overrides.
    ///
    /// | Variable | Effect |
    /// |---|---|
    /// | `VOS_MEM_EVERY` | sets `retention.mem_every`, clears `mem_number` |
    /// | `VOS_MEM_NUMBER` | sets `retention.mem_number`, clears `mem_every` |
    /// | `VOS_WORKERS` | `workers` |
    ///
    /// Values that do not parse as integers are ignored.  If both retention
    /// variables are set, `VOS_MEM_NUMBER` wins.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Same as [`EngineConfig::apply_env_overrides`] with an arbitrary lookup.
    /// Extracted for testability without mutating environment variables.
    pub(crate) fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<usize>().ok());
        if let Some(k) = number("VOS_MEM_EVERY") {
            self.retention = RetentionSpec::every(k);
        }
        if let Some(m) = number("VOS_MEM_NUMBER") {
            self.retention = RetentionSpec::number(m);
        }
        if let Some(w) = number("VOS_WORKERS") {
            self.workers = w;
        }
    }

    /// Validate the retention spec.
    pub fn retention_policy(&self) -> Result<RetentionPolicy, VosError> {
        self.retention.resolve()
    }

    /// Build the configured engine.
    ///
    /// # Errors
    ///
    /// Returns [`VosError::Configuration`] if the retention spec or the codec
    /// parameters are invalid.
    pub fn build_engine(&self) -> Result<PropagationEngine, VosError> {
        self.retention.resolve()?;
        let codec = self.codec.build()?;
        Ok(PropagationEngine::new(codec).with_options(EngineOptions {
            read_previous_frame: self.read_previous_frame,
        }))
    }

    pub fn pool(&self) -> SequencePool {
        SequencePool::new(self.workers)
    }
}
