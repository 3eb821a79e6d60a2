//! Space-time memory codec.
//!
//! Dense read: every query pixel attends over every pixel of every memory
//! frame.  See [`affinity`][crate::affinity] for the descriptor and read
//! equations.

use tracing::trace;
use vos_memory::MemoryView;
use vos_types::{FeatureMap, Frame, KeyValue, ProbabilityVolume, Shape, VosError};

use crate::FeatureCodec;
use crate::affinity::{self, MemoryRows};

/// Non-learned STM-style codec.
#[derive(Debug, Clone)]
pub struct SpaceTimeCodec {
    temperature: f32,
}

impl SpaceTimeCodec {
    /// # Errors
    ///
    /// Returns [`VosError::Configuration`] unless `temperature` is finite and
    /// positive.
    pub fn new(temperature: f32) -> Result<Self, VosError> {
        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(VosError::Configuration(format!(
                "space_time codec: temperature must be positive, got {temperature}"
            )));
        }
        Ok(Self { temperature })
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }
}

impl FeatureCodec for SpaceTimeCodec {
    fn name(&self) -> &str {
        "space_time"
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
        let rows = MemoryRows::new(&memory.keys, &memory.values, 0..memory.depth());
        trace!(positions = rows.len(), "space_time read");
        let queries = affinity::pixel_keys(frame);
        let mut readout = affinity::read(&queries, &rows, self.temperature, None);
        affinity::soft_aggregate(&mut readout, num_objects + 1);
        assemble(frame, readout, num_objects)
    }
}

/// Shared write path: pixel keys and the probability volume as the value.
pub(crate) fn encode_pixels(
    codec: &str,
    frame: &Frame,
    probs: &ProbabilityVolume,
) -> Result<KeyValue, VosError> {
    let fs = frame.shape();
    let ps = probs.shape();
    if !fs.same_resolution(&ps) {
        return Err(VosError::CodecFailure(format!(
            "{codec}: frame is {}x{} but probability volume is {}x{}",
            fs.height, fs.width, ps.height, ps.width
        )));
    }
    let key_shape = Shape::new(affinity::key_channels(fs.channels), fs.height, fs.width);
    let key_data = affinity::to_channel_major(&affinity::pixel_keys(frame), key_shape);
    Ok(KeyValue {
        key: FeatureMap::new(
            key_shape.channels,
            key_shape.height,
            key_shape.width,
            key_data,
        )?,
        value: FeatureMap::new(ps.channels, ps.height, ps.width, probs.data().to_vec())?,
    })
}

/// Turn position-major readout rows into a probability volume.
pub(crate) fn assemble(
    frame: &Frame,
    rows: Vec<f32>,
    num_objects: usize,
) -> Result<ProbabilityVolume, VosError> {
    let fs = frame.shape();
    let shape = Shape::new(num_objects + 1, fs.height, fs.width);
    let data = affinity::to_channel_major(&rows, shape);
    ProbabilityVolume::new(shape.channels, shape.height, shape.width, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two-pixel frame: left pixel red, right pixel blue.
    fn red_blue() -> Frame {
        Frame::new(3, 1, 2, vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0]).unwrap()
    }

    #[test]
    fn rejects_non_positive_temperature() {
        assert!(SpaceTimeCodec::new(0.0).is_err());
        assert!(SpaceTimeCodec::new(-1.0).is_err());
        assert!(SpaceTimeCodec::new(f32::NAN).is_err());
    }

    #[test]
    fn encode_shapes() {
        let codec = SpaceTimeCodec::new(0.1).unwrap();
        let probs = ProbabilityVolume::from_label_map(&[0, 1], 1, 1, 2).unwrap();
        let kv = codec.encode(&red_blue(), &probs).unwrap();
        assert_eq!(kv.key.shape(), Shape::new(5, 1, 2));
        assert_eq!(kv.value.shape(), Shape::new(2, 1, 2));
        assert_eq!(kv.value.data(), probs.data());
    }

    #[test]
    fn encode_rejects_resolution_mismatch() {
        let codec = SpaceTimeCodec::new(0.1).unwrap();
        let probs = ProbabilityVolume::uniform(1, 2, 2);
        let err = codec.encode(&red_blue(), &probs).unwrap_err();
        assert!(matches!(err, VosError::CodecFailure(_)));
    }

    #[test]
    fn decode_recovers_labels_of_identical_frame() {
        let codec = SpaceTimeCodec::new(0.05).unwrap();
        let frame = red_blue();
        let probs = ProbabilityVolume::from_label_map(&[0, 1], 1, 1, 2).unwrap();
        let kv = codec.encode(&frame, &probs).unwrap();
        let memory = MemoryView::from_candidate(0, &kv).unwrap();

        let out = codec.decode(&frame, &memory, 1).unwrap();
        assert!(out.is_normalized(1e-5));
        assert!(out.get(0, 0, 0) > 0.9, "left pixel should stay background");
        assert!(out.get(1, 0, 1) > 0.9, "right pixel should stay object 1");
    }

    #[test]
    fn decode_rejects_wrong_object_count() {
        let codec = SpaceTimeCodec::new(0.1).unwrap();
        let frame = red_blue();
        let probs = ProbabilityVolume::from_label_map(&[0, 1], 1, 1, 2).unwrap();
        let memory = MemoryView::from_candidate(0, &codec.encode(&frame, &probs).unwrap()).unwrap();
        let err = codec.decode(&frame, &memory, 2).unwrap_err();
        assert!(err.to_string().contains("expected 3"));
    }

    #[test]
    fn decode_rejects_resolution_change() {
        let codec = SpaceTimeCodec::new(0.1).unwrap();
        let probs = ProbabilityVolume::from_label_map(&[0, 1], 1, 1, 2).unwrap();
        let memory =
            MemoryView::from_candidate(0, &codec.encode(&red_blue(), &probs).unwrap()).unwrap();
        let other = Frame::new(3, 2, 1, vec![0.0; 6]).unwrap();
        assert!(matches!(
            codec.decode(&other, &memory, 1),
            Err(VosError::CodecFailure(_))
        ));
    }

    #[test]
    fn decode_rejects_value_smaller_than_key() {
        let codec = SpaceTimeCodec::new(0.1).unwrap();
        let kv = KeyValue {
            key: FeatureMap::new(5, 1, 2, vec![0.0; 10]).unwrap(),
            value: FeatureMap::new(2, 1, 1, vec![1.0, 0.0]).unwrap(),
        };
        let memory = MemoryView::from_candidate(0, &kv).unwrap();
        let err = codec.decode(&red_blue(), &memory, 1).unwrap_err();
        assert!(matches!(err, VosError::CodecFailure(_)));
        assert!(err.to_string().contains("do not match keys"));
    }

    #[test]
    fn decode_rejects_depth_mismatch() {
        let codec = SpaceTimeCodec::new(0.1).unwrap();
        let frame = red_blue();
        let probs = ProbabilityVolume::from_label_map(&[0, 1], 1, 1, 2).unwrap();
        let kv = codec.encode(&frame, &probs).unwrap();
        let mut memory = MemoryView::from_candidate(0, &kv).unwrap();
        memory.keys.push(1, &kv.key).unwrap();

        assert!(matches!(
            codec.decode(&frame, &memory, 1),
            Err(VosError::CodecFailure(_))
        ));
    }
}
