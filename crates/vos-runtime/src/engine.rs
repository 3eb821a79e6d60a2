//! [`PropagationEngine`] – the causal memory read/write loop.
//!
//! For a sequence of `T` frames the engine:
//!
//! 1. **Init** – takes the supplied initial mask as frame 0's volume and
//!    starts from an empty [`MemoryBank`].
//! 2. **Step(t)**, `t = 1..T` in order:
//!    - encode frame `t − 1` with its volume into a *candidate* pair;
//!    - commit the candidate iff `t − 1` is a memory frame under the
//!      [`RetentionPolicy`];
//!    - read the concatenated memory (falling back to the candidate alone if
//!      nothing has been committed yet);
//!    - decode frame `t` against that memory.
//! 3. **Terminal** – commits frame `T − 1` if it is a memory frame, so the
//!    bank holds exactly the policy's memory frames, and returns all `T`
//!    volumes.
//!
//! At every read the memory only contains frames strictly before the frame
//! being inferred.  Any error aborts the whole sequence; no partial result is
//! returned.
//!
//! # Example
//!
//! ```rust
//! use vos_codec::CodecVariant;
//! use vos_memory::RetentionSpec;
//! use vos_runtime::engine::PropagationEngine;
//! use vos_runtime::synthetic::moving_square;
//!
//! let video = moving_square("demo", 4, 12, 12).unwrap();
//! let engine = PropagationEngine::new(CodecVariant::default().build().unwrap());
//!
//! let result = engine
//!     .propagate_sequence(&video.sequence, &RetentionSpec::every(2))
//!     .unwrap();
//! assert_eq!(result.volumes.len(), 4);
//! assert_eq!(result.memory_frames, vec![0, 2]);
//! ```

use std::borrow::Cow;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};
use vos_codec::FeatureCodec;
use vos_memory::{MemoryBank, MemoryView, RetentionPolicy, RetentionSpec};
use vos_types::{Frame, LabelMap, ProbabilityVolume, Shape, VideoSequence, VosError};

use crate::decode;

/// Largest tolerated deviation of a decoded pixel's channel sum from 1.
pub const NORMALIZATION_TOLERANCE: f32 = 1e-4;

// ─────────────────────────────────────────────────────────────────────────────
// Options and results
// ─────────────────────────────────────────────────────────────────────────────

/// Behavioural switches of the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Always include frame `t − 1`'s candidate pair in the read for frame
    /// `t`, even when `t − 1` is not a memory frame.  The candidate is used
    /// for that one read only and never committed.
    #[serde(default)]
    pub read_previous_frame: bool,
}

/// The memory frames visible to one read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRecord {
    /// Frame being inferred.
    pub target: usize,
    /// Frames whose pairs were visible, in concatenation order.
    pub frames: Vec<usize>,
}

/// Output of one completed sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Propagation {
    /// One volume per input frame; `volumes[0]` is the initial mask.
    pub volumes: Vec<ProbabilityVolume>,
    /// Frames committed to memory, in commit order.
    pub memory_frames: Vec<usize>,
    /// One record per inferred frame (`1..T`).
    pub reads: Vec<ReadRecord>,
}

impl Propagation {
    /// Per-pixel argmax of every volume.
    pub fn labels(&self) -> Result<Vec<LabelMap>, VosError> {
        decode::decode_all(&self.volumes)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PropagationEngine
// ─────────────────────────────────────────────────────────────────────────────

/// Drives the per-sequence inference loop over a shared [`FeatureCodec`].
///
/// The engine holds no per-sequence state: every call builds its own
/// [`MemoryBank`], so one engine can serve many sequences concurrently.
#[derive(Clone)]
pub struct PropagationEngine {
    codec: Arc<dyn FeatureCodec>,
    options: EngineOptions,
}

impl std::fmt::Debug for PropagationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropagationEngine")
            .field("codec", &self.codec.name())
            .field("options", &self.options)
            .finish()
    }
}

impl PropagationEngine {
    pub fn new(codec: Arc<dyn FeatureCodec>) -> Self {
        Self {
            codec,
            options: EngineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> EngineOptions {
        self.options
    }

    pub fn codec_name(&self) -> &str {
        self.codec.name()
    }

    /// Propagate a dataset-supplied sequence.
    ///
    /// # Errors
    ///
    /// See [`PropagationEngine::propagate`].  Additionally returns
    /// [`VosError::ShapeMismatch`] if `meta.num_frames` disagrees with the
    /// number of frames.
    pub fn propagate_sequence(
        &self,
        sequence: &VideoSequence,
        retention: &RetentionSpec,
    ) -> Result<Propagation, VosError> {
        let policy = retention.resolve()?;
        self.run_sequence(sequence, policy)
    }

    /// [`PropagationEngine::propagate_sequence`] with an already validated
    /// policy.
    pub fn run_sequence(
        &self,
        sequence: &VideoSequence,
        policy: RetentionPolicy,
    ) -> Result<Propagation, VosError> {
        let span = info_span!(
            "sequence",
            name = %sequence.meta.name,
            frames = sequence.frames.len(),
            objects = sequence.num_objects,
            codec = self.codec.name(),
        );
        let _enter = span.enter();

        if sequence.meta.num_frames != sequence.frames.len() {
            return Err(VosError::shape_mismatch(
                format!("sequence {}", sequence.meta.name),
                format!("{} frames", sequence.meta.num_frames),
                format!("{} frames", sequence.frames.len()),
            ));
        }

        let result = self.propagate_with_policy(
            &sequence.frames,
            &sequence.initial_mask,
            sequence.num_objects,
            policy,
        );
        match &result {
            Ok(p) => info!(commits = p.memory_frames.len(), "sequence complete"),
            Err(e) => warn!(error = %e, "sequence aborted"),
        }
        result
    }

    /// Propagate `initial_mask` through `frames`.
    ///
    /// The retention spec is validated before any frame is touched.
    ///
    /// # Errors
    ///
    /// - [`VosError::Configuration`] – the retention spec is invalid.
    /// - [`VosError::ShapeMismatch`] – no frames, frames of differing shape,
    ///   an initial mask that is not `num_objects + 1` channels at frame
    ///   resolution, or a decoded volume of the wrong shape.
    /// - [`VosError::CodecFailure`] – raised by the codec, or a decoded volume
    ///   that is not normalised.
    pub fn propagate(
        &self,
        frames: &[Frame],
        initial_mask: &ProbabilityVolume,
        num_objects: usize,
        retention: &RetentionSpec,
    ) -> Result<Propagation, VosError> {
        let policy = retention.resolve()?;
        self.propagate_with_policy(frames, initial_mask, num_objects, policy)
    }

    /// [`PropagationEngine::propagate`] with an already validated policy.
    pub fn propagate_with_policy(
        &self,
        frames: &[Frame],
        initial_mask: &ProbabilityVolume,
        num_objects: usize,
        policy: RetentionPolicy,
    ) -> Result<Propagation, VosError> {
        let expected = validate_inputs(frames, initial_mask, num_objects)?;
        let num_frames = frames.len();

        let mut is_memory = vec![false; num_frames];
        for i in policy.memory_frames(num_frames) {
            is_memory[i] = true;
        }

        let mut bank = MemoryBank::with_capacity(policy.capacity_hint(num_frames));
        let mut volumes = Vec::with_capacity(num_frames);
        let mut reads = Vec::with_capacity(num_frames.saturating_sub(1));
        volumes.push(initial_mask.clone());

        for t in 1..num_frames {
            let prev = t - 1;
            let candidate = self.codec.encode(&frames[prev], &volumes[prev])?;
            let candidate = if is_memory[prev] {
                bank.append(prev, candidate);
                None
            } else {
                Some(candidate)
            };

            let view: Cow<'_, MemoryView> = match (bank.read_all()?, &candidate) {
                (Some(stored), Some(c)) if self.options.read_previous_frame => {
                    Cow::Owned(stored.with_candidate(prev, c)?)
                }
                (Some(stored), _) => Cow::Borrowed(stored),
                (None, Some(c)) => Cow::Owned(MemoryView::from_candidate(prev, c)?),
                (None, None) => unreachable!("a committed candidate leaves the bank non-empty"),
            };

            let probs = self.codec.decode(&frames[t], &view, num_objects)?;
            check_output(t, &probs, expected)?;
            debug!(frame = t, memory = view.depth(), "frame inferred");

            reads.push(ReadRecord {
                target: t,
                frames: view.frames().to_vec(),
            });
            volumes.push(probs);
        }

        let last = num_frames - 1;
        if is_memory[last] {
            let kv = self.codec.encode(&frames[last], &volumes[last])?;
            bank.append(last, kv);
        }

        Ok(Propagation {
            volumes,
            memory_frames: bank.committed_frames(),
            reads,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Check the static inputs and return the shape every volume must have.
fn validate_inputs(
    frames: &[Frame],
    initial_mask: &ProbabilityVolume,
    num_objects: usize,
) -> Result<Shape, VosError> {
    let first = frames
        .first()
        .ok_or_else(|| VosError::shape_mismatch("frames", "at least 1 frame", "0 frames"))?
        .shape();

    if let Some((i, f)) = frames.iter().enumerate().find(|(_, f)| f.shape() != first) {
        return Err(VosError::shape_mismatch(format!("frame {i}"), first, f.shape()));
    }

    let expected = Shape::new(num_objects + 1, first.height, first.width);
    if initial_mask.shape() != expected {
        return Err(VosError::shape_mismatch(
            "initial mask",
            expected,
            initial_mask.shape(),
        ));
    }
    Ok(expected)
}

fn check_output(t: usize, probs: &ProbabilityVolume, expected: Shape) -> Result<(), VosError> {
    if probs.shape() != expected {
        return Err(VosError::shape_mismatch(
            format!("decoded frame {t}"),
            expected,
            probs.shape(),
        ));
    }
    let deviation = probs.max_deviation();
    if deviation > NORMALIZATION_TOLERANCE {
        return Err(VosError::CodecFailure(format!(
            "decoded frame {t} is not normalised (max deviation {deviation})"
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vos_codec::CodecVariant;
    use vos_types::{FeatureMap, KeyValue};

    use crate::synthetic::{SyntheticObject, moving_objects, moving_square};

    /// Frame `t` is a 1-channel 2×2 image filled with the value `t`.
    fn indexed_frames(n: usize) -> Vec<Frame> {
        (0..n)
            .map(|t| Frame::new(1, 2, 2, vec![t as f32; 4]).unwrap())
            .collect()
    }

    fn single_object_mask() -> ProbabilityVolume {
        ProbabilityVolume::from_label_map(&[0, 1, 1, 0], 1, 2, 2).unwrap()
    }

    /// `encode` stores the frame as key and the volume as value; `decode`
    /// returns a fixed mask.  Records the memory visible to every decode,
    /// keyed by the target frame index (read back from the frame's pixels).
    struct StubCodec {
        mask: ProbabilityVolume,
        encodes: AtomicUsize,
        reads: Mutex<Vec<(usize, Vec<usize>)>>,
    }

    impl StubCodec {
        fn new(mask: ProbabilityVolume) -> Self {
            Self {
                mask,
                encodes: AtomicUsize::new(0),
                reads: Mutex::new(Vec::new()),
            }
        }
    }

    impl FeatureCodec for StubCodec {
        fn name(&self) -> &str {
            "stub"
        }

        fn encode(&self, frame: &Frame, probs: &ProbabilityVolume) -> Result<KeyValue, VosError> {
            self.encodes.fetch_add(1, Ordering::SeqCst);
            let fs = frame.shape();
            let ps = probs.shape();
            Ok(KeyValue {
                key: FeatureMap::new(fs.channels, fs.height, fs.width, frame.pixels().to_vec())?,
                value: FeatureMap::new(ps.channels, ps.height, ps.width, probs.data().to_vec())?,
            })
        }

        fn decode(
            &self,
            frame: &Frame,
            memory: &MemoryView,
            _num_objects: usize,
        ) -> Result<ProbabilityVolume, VosError> {
            let target = frame.pixels()[0] as usize;
            self.reads
                .lock()
                .unwrap()
                .push((target, memory.frames().to_vec()));
            Ok(self.mask.clone())
        }
    }

    /// Fails or misbehaves when decoding frame `bad_frame`.
    struct FaultyCodec {
        bad_frame: usize,
        fault: Fault,
    }

    enum Fault {
        Error,
        WrongChannels,
        Unnormalized,
    }

    impl FeatureCodec for FaultyCodec {
        fn name(&self) -> &str {
            "faulty"
        }

        fn encode(&self, frame: &Frame, probs: &ProbabilityVolume) -> Result<KeyValue, VosError> {
            StubCodec::new(probs.clone()).encode(frame, probs)
        }

        fn decode(
            &self,
            frame: &Frame,
            _memory: &MemoryView,
            num_objects: usize,
        ) -> Result<ProbabilityVolume, VosError> {
            let target = frame.pixels()[0] as usize;
            if target != self.bad_frame {
                return Ok(ProbabilityVolume::uniform(num_objects, 2, 2));
            }
            match self.fault {
                Fault::Error => Err(VosError::CodecFailure("malformed input".to_string())),
                Fault::WrongChannels => Ok(ProbabilityVolume::uniform(num_objects + 1, 2, 2)),
                Fault::Unnormalized => ProbabilityVolume::new(2, 2, 2, vec![0.9; 8]),
            }
        }
    }

    fn stub_engine() -> (Arc<StubCodec>, PropagationEngine) {
        let codec = Arc::new(StubCodec::new(single_object_mask()));
        let engine = PropagationEngine::new(codec.clone());
        (codec, engine)
    }

    // ── End-to-end plumbing ──────────────────────────────────────────────────

    #[test]
    fn stub_codec_reproduces_initial_mask_on_every_frame() {
        let (_, engine) = stub_engine();
        let mask = single_object_mask();
        let result = engine
            .propagate(&indexed_frames(4), &mask, 1, &RetentionSpec::every(1))
            .unwrap();
        assert_eq!(result.volumes.len(), 4);
        for volume in &result.volumes {
            assert_eq!(volume, &mask);
        }
    }

    #[test]
    fn single_frame_sequence_returns_initial_mask() {
        let (codec, engine) = stub_engine();
        let result = engine
            .propagate(
                &indexed_frames(1),
                &single_object_mask(),
                1,
                &RetentionSpec::every(5),
            )
            .unwrap();
        assert_eq!(result.volumes, vec![single_object_mask()]);
        assert!(result.reads.is_empty());
        assert_eq!(result.memory_frames, vec![0]);
        assert_eq!(codec.encodes.load(Ordering::SeqCst), 1);
    }

    // ── Causality ────────────────────────────────────────────────────────────

    #[test]
    fn memory_only_contains_past_frames() {
        let (codec, engine) = stub_engine();
        engine
            .propagate(
                &indexed_frames(12),
                &single_object_mask(),
                1,
                &RetentionSpec::every(3),
            )
            .unwrap();

        let reads = codec.reads.lock().unwrap();
        assert_eq!(reads.len(), 11);
        for (target, frames) in reads.iter() {
            assert!(!frames.is_empty());
            assert!(frames.iter().all(|&f| f < *target), "frame {target} saw {frames:?}");
            assert!(frames.windows(2).all(|w| w[0] < w[1]), "{frames:?} not increasing");
        }
    }

    #[test]
    fn read_records_match_codec_observations() {
        let (codec, engine) = stub_engine();
        let result = engine
            .propagate(
                &indexed_frames(6),
                &single_object_mask(),
                1,
                &RetentionSpec::number(2),
            )
            .unwrap();
        let observed: Vec<ReadRecord> = codec
            .reads
            .lock()
            .unwrap()
            .iter()
            .map(|(target, frames)| ReadRecord {
                target: *target,
                frames: frames.clone(),
            })
            .collect();
        assert_eq!(result.reads, observed);
        // Memory frames are 0 and 3: frame 4 is the first to see frame 3.
        assert_eq!(result.reads[2].frames, vec![0]);
        assert_eq!(result.reads[3].frames, vec![0, 3]);
    }

    #[test]
    fn previous_frame_option_adds_uncommitted_candidate() {
        let codec = Arc::new(StubCodec::new(single_object_mask()));
        let engine = PropagationEngine::new(codec.clone()).with_options(EngineOptions {
            read_previous_frame: true,
        });
        let result = engine
            .propagate(
                &indexed_frames(7),
                &single_object_mask(),
                1,
                &RetentionSpec::every(5),
            )
            .unwrap();

        assert_eq!(result.reads[0].frames, vec![0]);
        assert_eq!(result.reads[2].frames, vec![0, 2]);
        assert_eq!(result.reads[5].frames, vec![0, 5]);
        // The candidates were never committed.
        assert_eq!(result.memory_frames, vec![0, 5]);
    }

    // ── Retention ────────────────────────────────────────────────────────────

    #[test]
    fn fixed_interval_commits() {
        let (_, engine) = stub_engine();
        let result = engine
            .propagate(
                &indexed_frames(12),
                &single_object_mask(),
                1,
                &RetentionSpec::every(5),
            )
            .unwrap();
        assert_eq!(result.memory_frames, vec![0, 5, 10]);
    }

    #[test]
    fn fixed_budget_commits() {
        let (_, engine) = stub_engine();
        let result = engine
            .propagate(
                &indexed_frames(12),
                &single_object_mask(),
                1,
                &RetentionSpec::number(3),
            )
            .unwrap();
        assert_eq!(result.memory_frames, vec![0, 4, 8]);
    }

    #[test]
    fn budget_including_last_frame_still_commits_it() {
        let (_, engine) = stub_engine();
        // round(0), round(1.33), round(2.67) → 0, 1, 3
        let result = engine
            .propagate(
                &indexed_frames(4),
                &single_object_mask(),
                1,
                &RetentionSpec::number(3),
            )
            .unwrap();
        assert_eq!(result.memory_frames, vec![0, 1, 3]);
    }

    #[test]
    fn invalid_retention_fails_before_any_frame() {
        let (codec, engine) = stub_engine();
        let both = RetentionSpec {
            mem_every: Some(5),
            mem_number: Some(3),
        };
        for spec in [both, RetentionSpec::default()] {
            let err = engine
                .propagate(&indexed_frames(4), &single_object_mask(), 1, &spec)
                .unwrap_err();
            assert!(matches!(err, VosError::Configuration(_)));
        }
        assert_eq!(codec.encodes.load(Ordering::SeqCst), 0);
        assert!(codec.reads.lock().unwrap().is_empty());
    }

    // ── Shape validation ─────────────────────────────────────────────────────

    #[test]
    fn empty_frame_list_is_shape_mismatch() {
        let (_, engine) = stub_engine();
        let err = engine
            .propagate(&[], &single_object_mask(), 1, &RetentionSpec::every(1))
            .unwrap_err();
        assert!(matches!(err, VosError::ShapeMismatch { .. }));
    }

    #[test]
    fn initial_mask_with_wrong_object_count_is_rejected() {
        let (_, engine) = stub_engine();
        let err = engine
            .propagate(
                &indexed_frames(3),
                &single_object_mask(),
                2,
                &RetentionSpec::every(1),
            )
            .unwrap_err();
        assert!(err.to_string().contains("initial mask"));
    }

    #[test]
    fn frame_resolution_change_is_rejected() {
        let (codec, engine) = stub_engine();
        let mut frames = indexed_frames(3);
        frames[2] = Frame::new(1, 3, 3, vec![2.0; 9]).unwrap();
        let err = engine
            .propagate(&frames, &single_object_mask(), 1, &RetentionSpec::every(1))
            .unwrap_err();
        assert!(err.to_string().contains("frame 2"));
        assert_eq!(codec.encodes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn object_count_change_mid_sequence_is_shape_mismatch() {
        let engine = PropagationEngine::new(Arc::new(FaultyCodec {
            bad_frame: 2,
            fault: Fault::WrongChannels,
        }));
        let err = engine
            .propagate(
                &indexed_frames(4),
                &single_object_mask(),
                1,
                &RetentionSpec::every(1),
            )
            .unwrap_err();
        match err {
            VosError::ShapeMismatch { context, .. } => assert_eq!(context, "decoded frame 2"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn codec_error_propagates_unchanged() {
        let engine = PropagationEngine::new(Arc::new(FaultyCodec {
            bad_frame: 3,
            fault: Fault::Error,
        }));
        let err = engine
            .propagate(
                &indexed_frames(5),
                &single_object_mask(),
                1,
                &RetentionSpec::every(2),
            )
            .unwrap_err();
        assert_eq!(err, VosError::CodecFailure("malformed input".to_string()));
    }

    #[test]
    fn unnormalized_output_is_codec_failure() {
        let engine = PropagationEngine::new(Arc::new(FaultyCodec {
            bad_frame: 1,
            fault: Fault::Unnormalized,
        }));
        let err = engine
            .propagate(
                &indexed_frames(3),
                &single_object_mask(),
                1,
                &RetentionSpec::every(1),
            )
            .unwrap_err();
        assert!(err.to_string().contains("not normalised"));
    }

    #[test]
    fn meta_frame_count_must_match() {
        let (_, engine) = stub_engine();
        let mut video = moving_square("short", 3, 8, 8).unwrap();
        video.sequence.meta.num_frames = 5;
        let err = engine
            .propagate_sequence(&video.sequence, &RetentionSpec::every(1))
            .unwrap_err();
        assert!(matches!(err, VosError::ShapeMismatch { .. }));
    }

    // ── Real codecs ──────────────────────────────────────────────────────────

    #[test]
    fn every_volume_has_n_plus_one_normalized_channels() {
        let objects = [
            SyntheticObject {
                size: 3,
                start: (1, 1),
                velocity: (0, 1),
                colour: [1.0, 0.0, 0.0],
            },
            SyntheticObject {
                size: 3,
                start: (7, 2),
                velocity: (-1, 0),
                colour: [0.0, 0.0, 1.0],
            },
        ];
        let video = moving_objects("pair", 5, 12, 12, &objects).unwrap();
        for variant in [
            CodecVariant::default(),
            CodecVariant::Enhanced {
                temperature: 0.1,
                top_k: 8,
                short_term_weight: 0.5,
            },
        ] {
            let engine = PropagationEngine::new(variant.build().unwrap());
            let result = engine
                .propagate_sequence(&video.sequence, &RetentionSpec::every(2))
                .unwrap();
            for volume in &result.volumes {
                assert_eq!(volume.shape(), Shape::new(3, 12, 12));
                assert!(volume.is_normalized(1e-5));
            }
        }
    }

    #[test]
    fn identical_runs_are_bit_identical() {
        let video = moving_square("det", 6, 10, 10).unwrap();
        let engine = PropagationEngine::new(CodecVariant::default().build().unwrap());
        let a = engine
            .propagate_sequence(&video.sequence, &RetentionSpec::number(3))
            .unwrap();
        let b = engine
            .propagate_sequence(&video.sequence, &RetentionSpec::number(3))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn space_time_codec_tracks_moving_square() {
        let video = moving_square("track", 6, 16, 16).unwrap();
        let engine = PropagationEngine::new(CodecVariant::default().build().unwrap());
        let result = engine
            .propagate_sequence(&video.sequence, &RetentionSpec::every(1))
            .unwrap();
        let labels = result.labels().unwrap();
        for (t, (predicted, truth)) in labels.iter().zip(&video.labels).enumerate() {
            let iou = decode::iou(predicted, truth, 1);
            assert!(iou > 0.8, "frame {t}: IoU {iou}");
        }
    }
}
