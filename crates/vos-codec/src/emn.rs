//! Enhanced-memory codec.
//!
//! Differs from [`SpaceTimeCodec`][crate::stm::SpaceTimeCodec] in two ways:
//!
//! 1. **Sparse long-term read** – each query pixel attends only to its
//!    `top_k` best-matching memory positions.
//! 2. **Short-term blend** – the readout from the most recent memory entry
//!    alone is mixed in with weight `short_term_weight`:
//!
//! ```text
//! readout = (1 − β) · read_topk(all entries) + β · read_dense(last entry)
//! ```
//!
//! Both terms are convex combinations of probability rows, so the blend is
//! one too.

use tracing::trace;
use vos_memory::MemoryView;
use vos_types::{Frame, KeyValue, ProbabilityVolume, VosError};

use crate::FeatureCodec;
use crate::affinity::{self, MemoryRows};
use crate::stm::{assemble, encode_pixels};

/// Non-learned EMN-style codec.
#[derive(Debug, Clone)]
pub struct EnhancedMemoryCodec {
    temperature: f32,
    top_k: usize,
    short_term_weight: f32,
}

impl EnhancedMemoryCodec {
    /// # Errors
    ///
    /// Returns [`VosError::Configuration`] if `temperature` is not positive,
    /// `top_k` is zero, or `short_term_weight` lies outside `[0, 1]`.
    pub fn new(temperature: f32, top_k: usize, short_term_weight: f32) -> Result<Self, VosError> {
        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(VosError::Configuration(format!(
                "enhanced codec: temperature must be positive, got {temperature}"
            )));
        }
        if top_k == 0 {
            return Err(VosError::Configuration(
                "enhanced codec: top_k must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&short_term_weight) {
            return Err(VosError::Configuration(format!(
                "enhanced codec: short_term_weight must be in [0, 1], got {short_term_weight}"
            )));
        }
        Ok(Self {
            temperature,
            top_k,
            short_term_weight,
        })
    }
}

impl FeatureCodec for EnhancedMemoryCodec {
    fn name(&self) -> &str {
        "enhanced"
    }

    fn encode(&self, frame: &Frame, probs: &ProbabilityVolume) -> Result<KeyValue, VosError> {
        encode_pixels(self.name(), frame, probs)
    }

    fn decode(
        &self,
        frame: &Frame,
        memory: &MemoryView,
        num_objects: usize,
    ) -> Result<ProbabilityVolume, VosError> {
        affinity::check_compatible(
            self.name(),
            frame,
            &memory.keys,
            &memory.values,
            num_objects,
        )?;
        let depth = memory.depth();
        let queries = affinity::pixel_keys(frame);

        let long_term = MemoryRows::new(&memory.keys, &memory.values, 0..depth);
        trace!(positions = long_term.len(), top_k = self.top_k, "enhanced read");
        let mut readout = affinity::read(&queries, &long_term, self.temperature, Some(self.top_k));

        if self.short_term_weight > 0.0 {
            let short_term = MemoryRows::new(&memory.keys, &memory.values, depth - 1..depth);
            let recent = affinity::read(&queries, &short_term, self.temperature, None);
            let beta = self.short_term_weight;
            for (r, s) in readout.iter_mut().zip(recent) {
                *r = (1.0 - beta) * *r + beta * s;
            }
        }

        affinity::soft_aggregate(&mut readout, num_objects + 1);
        assemble(frame, readout, num_objects)
    }
}
