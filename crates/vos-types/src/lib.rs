//! `vos-types` – shared data model for memory-based video object segmentation.
//!
//! Every tensor in this crate is a dense `f32` buffer in channel-major
//! (`C × H × W`) layout together with its [`Shape`].  Constructors validate
//! the buffer length so downstream code can index without re-checking.
//!
//! - [`Frame`] – one immutable RGB (or any multi-channel) image.
//! - [`ProbabilityVolume`] – per-pixel soft assignment over `N + 1` channels
//!   (background is channel 0).
//! - [`FeatureMap`] / [`FeatureStack`] – a single key or value descriptor and
//!   the time-axis concatenation of several of them.
//! - [`VideoSequence`] – the unit handed over by a dataset collaborator.
//! - [`VosError`] – the error type shared across the workspace.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Sequence-local error kinds.  None of them is retried; a sequence either
/// completes with a full set of probability volumes or fails with one of
/// these.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VosError {
    /// The retention policy (or another explicit parameter) is under- or
    /// over-specified.
    #[error("Configuration Error: {0}")]
    Configuration(String),

    #[error("Shape Mismatch in {context}: expected {expected}, found {found}")]
    ShapeMismatch {
        context: String,
        expected: String,
        found: String,
    },

    /// The feature codec rejected its input.
    #[error("Codec Failure: {0}")]
    CodecFailure(String),
}

impl VosError {
    /// Shorthand for building a [`VosError::ShapeMismatch`].
    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: impl fmt::Display,
        found: impl fmt::Display,
    ) -> Self {
        VosError::ShapeMismatch {
            context: context.into(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shape
// ─────────────────────────────────────────────────────────────────────────────

/// Channel count and spatial resolution of a CHW tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl Shape {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// Number of spatial positions (`H × W`).
    pub fn pixels(&self) -> usize {
        self.height * self.width
    }

    /// Total number of scalars (`C × H × W`).
    pub fn len(&self) -> usize {
        self.channels * self.pixels()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` when both shapes share the same `H × W`.
    pub fn same_resolution(&self, other: &Shape) -> bool {
        self.height == other.height && self.width == other.width
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.channels, self.height, self.width)
    }
}

fn check_len(context: &str, shape: Shape, len: usize) -> Result<(), VosError> {
    if shape.len() != len {
        return Err(VosError::shape_mismatch(
            context,
            format!("{} values ({shape})", shape.len()),
            format!("{len} values"),
        ));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Frame
// ─────────────────────────────────────────────────────────────────────────────

/// A single video frame.  Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    shape: Shape,
    pixels: Vec<f32>,
}

impl Frame {
    /// Build a frame from CHW pixel data.
    ///
    /// # Errors
    ///
    /// Returns [`VosError::ShapeMismatch`] if `pixels.len() != c * h * w`.
    pub fn new(
        channels: usize,
        height: usize,
        width: usize,
        pixels: Vec<f32>,
    ) -> Result<Self, VosError> {
        let shape = Shape::new(channels, height, width);
        check_len("frame", shape, pixels.len())?;
        Ok(Self { shape, pixels })
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    /// Value of channel `c` at `(y, x)`.
    pub fn get(&self, c: usize, y: usize, x: usize) -> f32 {
        self.pixels[c * self.shape.pixels() + y * self.shape.width + x]
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ProbabilityVolume
// ─────────────────────────────────────────────────────────────────────────────

/// Soft per-pixel assignment of one frame over `N + 1` object channels.
///
/// Channel 0 is background.  A well-formed volume sums to 1 over the channel
/// axis at every pixel; [`ProbabilityVolume::is_normalized`] checks this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityVolume {
    shape: Shape,
    data: Vec<f32>,
}

impl ProbabilityVolume {
    /// Wrap CHW probability data.
    ///
    /// # Errors
    ///
    /// Returns [`VosError::ShapeMismatch`] if the buffer length disagrees with
    /// the shape or `channels == 0`.
    pub fn new(
        channels: usize,
        height: usize,
        width: usize,
        data: Vec<f32>,
    ) -> Result<Self, VosError> {
        if channels == 0 {
            return Err(VosError::shape_mismatch(
                "probability volume",
                "at least 1 channel",
                "0 channels",
            ));
        }
        let shape = Shape::new(channels, height, width);
        check_len("probability volume", shape, data.len())?;
        Ok(Self { shape, data })
    }

    /// One-hot encode an integer label map into `num_objects + 1` channels.
    ///
    /// # Errors
    ///
    /// Returns [`VosError::ShapeMismatch`] if `labels.len() != height * width`
    /// or any label exceeds `num_objects`.
    pub fn from_label_map(
        labels: &[u8],
        num_objects: usize,
        height: usize,
        width: usize,
    ) -> Result<Self, VosError> {
        let plane = height * width;
        if labels.len() != plane {
            return Err(VosError::shape_mismatch(
                "label map",
                format!("{plane} labels"),
                format!("{} labels", labels.len()),
            ));
        }
        let channels = num_objects + 1;
        let mut data = vec![0.0; channels * plane];
        for (p, &label) in labels.iter().enumerate() {
            let label = label as usize;
            if label >= channels {
                return Err(VosError::shape_mismatch(
                    "label map",
                    format!("labels in 0..={num_objects}"),
                    format!("label {label}"),
                ));
            }
            data[label * plane + p] = 1.0;
        }
        Ok(Self {
            shape: Shape::new(channels, height, width),
            data,
        })
    }

    /// A volume assigning equal probability to every channel.
    pub fn uniform(num_objects: usize, height: usize, width: usize) -> Self {
        let channels = num_objects + 1;
        Self {
            shape: Shape::new(channels, height, width),
            data: vec![1.0 / channels as f32; channels * height * width],
        }
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Number of foreground objects (`channels - 1`).
    pub fn num_objects(&self) -> usize {
        self.shape.channels - 1
    }

    pub fn get(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[c * self.shape.pixels() + y * self.shape.width + x]
    }

    /// The `H × W` plane of channel `c`.
    pub fn plane(&self, c: usize) -> &[f32] {
        let n = self.shape.pixels();
        &self.data[c * n..(c + 1) * n]
    }

    /// Sum over the channel axis at flat pixel index `p`.
    pub fn channel_sum(&self, p: usize) -> f32 {
        let n = self.shape.pixels();
        (0..self.shape.channels).map(|c| self.data[c * n + p]).sum()
    }

    /// Largest absolute deviation of any pixel's channel sum from 1.
    pub fn max_deviation(&self) -> f32 {
        (0..self.shape.pixels())
            .map(|p| (self.channel_sum(p) - 1.0).abs())
            .fold(0.0, f32::max)
    }

    /// `true` when every pixel's channels sum to 1 within `tolerance`.
    pub fn is_normalized(&self, tolerance: f32) -> bool {
        self.max_deviation() <= tolerance
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Features
// ─────────────────────────────────────────────────────────────────────────────

/// A per-frame descriptor (key or value) in CHW layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMap {
    shape: Shape,
    data: Vec<f32>,
}

impl FeatureMap {
    pub fn new(
        channels: usize,
        height: usize,
        width: usize,
        data: Vec<f32>,
    ) -> Result<Self, VosError> {
        let shape = Shape::new(channels, height, width);
        check_len("feature map", shape, data.len())?;
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// The (key, value) pair the codec derives from one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: FeatureMap,
    pub value: FeatureMap,
}

/// Several [`FeatureMap`]s of identical shape concatenated along the time
/// axis.
///
/// Storage is entry-major: entry `t` occupies
/// `data[t * shape.len() .. (t + 1) * shape.len()]` in its own CHW layout.
/// `frames[t]` is the index of the video frame entry `t` was derived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureStack {
    shape: Shape,
    frames: Vec<usize>,
    data: Vec<f32>,
}

impl FeatureStack {
    /// An empty stack whose entries will have `shape`.
    pub fn empty(shape: Shape) -> Self {
        Self {
            shape,
            frames: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Append one entry.
    ///
    /// # Errors
    ///
    /// Returns [`VosError::ShapeMismatch`] if `map` does not match the stack's
    /// entry shape.
    pub fn push(&mut self, frame_index: usize, map: &FeatureMap) -> Result<(), VosError> {
        if map.shape() != self.shape {
            return Err(VosError::shape_mismatch(
                "feature stack",
                self.shape,
                map.shape(),
            ));
        }
        self.frames.push(frame_index);
        self.data.extend_from_slice(map.data());
        Ok(())
    }

    /// Shape of a single entry.
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Number of entries (the `T` axis).
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frame indices of the entries, in concatenation order.
    pub fn frames(&self) -> &[usize] {
        &self.frames
    }

    /// The CHW slice of entry `t`.
    pub fn entry(&self, t: usize) -> &[f32] {
        let n = self.shape.len();
        &self.data[t * n..(t + 1) * n]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoded output
// ─────────────────────────────────────────────────────────────────────────────

/// Hard per-pixel object labels for one frame (0 = background).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMap {
    pub height: usize,
    pub width: usize,
    pub labels: Vec<u8>,
}

impl LabelMap {
    pub fn get(&self, y: usize, x: usize) -> u8 {
        self.labels[y * self.width + x]
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dataset contract
// ─────────────────────────────────────────────────────────────────────────────

/// Descriptive metadata carried alongside a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceMeta {
    /// Sequence identifier (e.g. `"blackswan"`).
    pub name: String,
    pub num_frames: usize,
}

/// One video as supplied by a dataset collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSequence {
    pub frames: Vec<Frame>,
    /// Ground-truth (or externally supplied) volume for frame 0.
    pub initial_mask: ProbabilityVolume,
    /// Number of foreground objects; fixed for the whole sequence.
    pub num_objects: usize,
    pub meta: SequenceMeta,
}
