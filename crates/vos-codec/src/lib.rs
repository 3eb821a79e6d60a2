//! `vos-codec` – the feature codec behind the propagation loop.
//!
//! A codec is a narrow two-function capability:
//!
//! - **write path** – [`FeatureCodec::encode`] turns a frame and its
//!   probability volume into a (key, value) pair;
//! - **read path** – [`FeatureCodec::decode`] turns a frame plus the
//!   accumulated memory into that frame's probability volume.
//!
//! Codecs are pure functions of their inputs and are shared between
//! concurrently running sequences behind an `Arc<dyn FeatureCodec>`.
//!
//! # Modules
//!
//! - [`affinity`] – pixel key descriptors, the softmax memory read and STM
//!   soft aggregation.
//! - [`stm`] – [`SpaceTimeCodec`][stm::SpaceTimeCodec]: dense space-time
//!   memory read.
//! - [`emn`] – [`EnhancedMemoryCodec`][emn::EnhancedMemoryCodec]: top-k
//!   sparse read blended with a short-term read of the latest entry.
//!
//! [`CodecVariant`] is the serialisable tagged choice between the two.

pub mod affinity;
pub mod emn;
pub mod stm;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use vos_memory::MemoryView;
use vos_types::{Frame, KeyValue, ProbabilityVolume, VosError};

pub use emn::EnhancedMemoryCodec;
pub use stm::SpaceTimeCodec;

// ─────────────────────────────────────────────────────────────────────────────
// FeatureCodec
// ─────────────────────────────────────────────────────────────────────────────

/// The feature-extraction / segmentation network contract.
pub trait FeatureCodec: Send + Sync {
    /// Stable identifier used in logs, e.g. `"space_time"`.
    fn name(&self) -> &str;

    /// Derive the (key, value) pair of `frame` given its probability volume.
    ///
    /// # Errors
    ///
    /// Returns [`VosError::CodecFailure`] on malformed input (e.g. the frame
    /// and the volume disagree on resolution).
    fn encode(&self, frame: &Frame, probs: &ProbabilityVolume) -> Result<KeyValue, VosError>;

    /// Infer the probability volume of `frame` from the memory.
    ///
    /// The returned volume has `num_objects + 1` channels at the frame's
    /// resolution and sums to 1 at every pixel.
    ///
    /// # Errors
    ///
    /// Returns [`VosError::CodecFailure`] if the memory cannot be read with
    /// this frame (empty memory, mismatched key width or resolution).
    fn decode(
        &self,
        frame: &Frame,
        memory: &MemoryView,
        num_objects: usize,
    ) -> Result<ProbabilityVolume, VosError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// CodecVariant
// ─────────────────────────────────────────────────────────────────────────────

fn default_temperature() -> f32 {
    0.1
}
fn default_top_k() -> usize {
    16
}
fn default_short_term_weight() -> f32 {
    0.5
}

/// Selects one of the built-in codecs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CodecVariant {
    SpaceTime {
        #[serde(default = "default_temperature")]
        temperature: f32,
    },
    Enhanced {
        #[serde(default = "default_temperature")]
        temperature: f32,
        #[serde(default = "default_top_k")]
        top_k: usize,
        #[serde(default = "default_short_term_weight")]
        short_term_weight: f32,
    },
}

impl Default for CodecVariant {
    fn default() -> Self {
        CodecVariant::SpaceTime {
            temperature: default_temperature(),
        }
    }
}

impl CodecVariant {
    /// Instantiate the selected codec.
    ///
    /// # Errors
    ///
    /// Returns [`VosError::Configuration`] if the variant's parameters are
    /// out of range.
    pub fn build(&self) -> Result<Arc<dyn FeatureCodec>, VosError> {
        let codec: Arc<dyn FeatureCodec> = match *self {
            CodecVariant::SpaceTime { temperature } => Arc::new(SpaceTimeCodec::new(temperature)?),
            CodecVariant::Enhanced {
                temperature,
                top_k,
                short_term_weight,
            } => Arc::new(EnhancedMemoryCodec::new(temperature, top_k, short_term_weight)?),
        };
        Ok(codec)
    }
}
