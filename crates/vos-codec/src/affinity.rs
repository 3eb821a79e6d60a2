//! Pixel descriptors and the space-time memory read shared by both codecs.
//!
//! # Key descriptor
//!
//! The key of pixel `p` is its L2-normalised colour vector followed by its
//! normalised `(y, x)` coordinates scaled by [`POSITION_WEIGHT`]:
//!
//! ```text
//! key(p) = [ rgb(p) / ‖rgb(p)‖ , w·y/H , w·x/W ]
//! ```
//!
//! # Memory read
//!
//! For a query pixel `q` and memory positions `j` (all pixels of all memory
//! frames), the read weight is a softmax over negative squared distances:
//!
//! ```text
//! w_j = exp(−‖q − k_j‖² / τ) / Σ_i exp(−‖q − k_i‖² / τ)
//! readout(q) = Σ_j w_j · v_j
//! ```
//!
//! Up to a per-query constant this equals the affinity `2·q·k_j − ‖k_j‖²`.
//!
//! Because every value is itself a probability distribution, the readout is
//! a convex combination and therefore already sums to 1; [`soft_aggregate`]
//! then sharpens it in odds space and renormalises.

use vos_types::{FeatureStack, Frame, Shape, VosError};

/// Weight of the spatial coordinates relative to the unit colour vector.
pub const POSITION_WEIGHT: f32 = 1.0;

/// Clamp applied to probabilities before the odds transform.
const PROB_EPS: f32 = 1e-7;

/// Number of key channels produced for a frame with `frame_channels`.
pub fn key_channels(frame_channels: usize) -> usize {
    frame_channels + 2
}

/// Compute the key descriptor of every pixel of `frame`, position-major
/// (`H·W` rows of [`key_channels`] values).
pub fn pixel_keys(frame: &Frame) -> Vec<f32> {
    let shape = frame.shape();
    let ck = key_channels(shape.channels);
    let mut keys = Vec::with_capacity(shape.pixels() * ck);
    for y in 0..shape.height {
        for x in 0..shape.width {
            let norm = (0..shape.channels)
                .map(|c| frame.get(c, y, x).powi(2))
                .sum::<f32>()
                .sqrt();
            for c in 0..shape.channels {
                keys.push(if norm > 0.0 { frame.get(c, y, x) / norm } else { 0.0 });
            }
            keys.push(POSITION_WEIGHT * y as f32 / shape.height.max(1) as f32);
            keys.push(POSITION_WEIGHT * x as f32 / shape.width.max(1) as f32);
        }
    }
    keys
}

/// Convert position-major rows into a channel-major buffer.
pub fn to_channel_major(rows: &[f32], shape: Shape) -> Vec<f32> {
    let n = shape.pixels();
    let mut out = vec![0.0; shape.len()];
    for p in 0..n {
        for c in 0..shape.channels {
            out[c * n + p] = rows[p * shape.channels + c];
        }
    }
    out
}

/// Transpose entries `range` of a stack into position-major rows.
pub fn to_position_major(stack: &FeatureStack, range: std::ops::Range<usize>) -> Vec<f32> {
    let shape = stack.shape();
    let n = shape.pixels();
    let mut rows = Vec::with_capacity(range.len() * shape.len());
    for t in range {
        let entry = stack.entry(t);
        for p in 0..n {
            for c in 0..shape.channels {
                rows.push(entry[c * n + p]);
            }
        }
    }
    rows
}

/// Memory keys and values flattened for a read.
pub struct MemoryRows {
    pub keys: Vec<f32>,
    pub values: Vec<f32>,
    pub key_width: usize,
    pub value_width: usize,
}

impl MemoryRows {
    /// Flatten entries `range` of the given stacks.
    pub fn new(keys: &FeatureStack, values: &FeatureStack, range: std::ops::Range<usize>) -> Self {
        Self {
            keys: to_position_major(keys, range.clone()),
            values: to_position_major(values, range),
            key_width: keys.shape().channels,
            value_width: values.shape().channels,
        }
    }

    /// Number of memory positions.
    pub fn len(&self) -> usize {
        if self.key_width == 0 {
            0
        } else {
            self.keys.len() / self.key_width
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read the memory for every query row.
///
/// `top_k` limits each softmax to the `k` highest-scoring memory positions;
/// `None` uses all of them.  Returns position-major readout rows of
/// `memory.value_width` values each.
pub fn read(
    queries: &[f32],
    memory: &MemoryRows,
    temperature: f32,
    top_k: Option<usize>,
) -> Vec<f32> {
    let width = memory.key_width;
    let len = memory.len();
    let mut out = Vec::with_capacity(queries.len() / width.max(1) * memory.value_width);
    let mut scores = vec![0.0f32; len];
    let mut order: Vec<usize> = (0..len).collect();

    for q in queries.chunks_exact(width) {
        for (j, k) in memory.keys.chunks_exact(width).enumerate() {
            scores[j] = -q.iter().zip(k).map(|(a, b)| (a - b).powi(2)).sum::<f32>() / temperature;
        }

        let selected: &[usize] = match top_k {
            Some(k) if k < len => {
                order.iter_mut().enumerate().for_each(|(i, o)| *o = i);
                order.select_nth_unstable_by(k, |a, b| scores[*b].total_cmp(&scores[*a]));
                &order[..k]
            }
            _ => {
                order.iter_mut().enumerate().for_each(|(i, o)| *o = i);
                &order[..]
            }
        };

        let max = selected
            .iter()
            .map(|&j| scores[j])
            .fold(f32::NEG_INFINITY, f32::max);
        let mut readout = vec![0.0f32; memory.value_width];
        let mut total = 0.0f32;
        for &j in selected {
            let w = (scores[j] - max).exp();
            total += w;
            let v = &memory.values[j * memory.value_width..(j + 1) * memory.value_width];
            for (r, x) in readout.iter_mut().zip(v) {
                *r += w * x;
            }
        }
        out.extend(readout.into_iter().map(|r| r / total));
    }
    out
}

/// Sharpen position-major probability rows in odds space and renormalise
/// each row with a softmax.
pub fn soft_aggregate(rows: &mut [f32], channels: usize) {
    for row in rows.chunks_exact_mut(channels) {
        for p in row.iter_mut() {
            let clamped = p.clamp(PROB_EPS, 1.0 - PROB_EPS);
            *p = (clamped / (1.0 - clamped)).ln();
        }
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut total = 0.0;
        for p in row.iter_mut() {
            *p = (*p - max).exp();
            total += *p;
        }
        for p in row.iter_mut() {
            *p /= total;
        }
    }
}

/// Check that `memory` can be read with queries computed from `frame`.
pub fn check_compatible(
    codec: &str,
    frame: &Frame,
    keys: &FeatureStack,
    values: &FeatureStack,
    num_objects: usize,
) -> Result<(), VosError> {
    let fs = frame.shape();
    if keys.is_empty() {
        return Err(VosError::CodecFailure(format!("{codec}: memory is empty")));
    }
    if keys.shape().channels != key_channels(fs.channels) {
        return Err(VosError::CodecFailure(format!(
            "{codec}: memory keys have {} channels, frame yields {}",
            keys.shape().channels,
            key_channels(fs.channels)
        )));
    }
    if !keys.shape().same_resolution(&fs) {
        return Err(VosError::CodecFailure(format!(
            "{codec}: memory resolution {}x{} differs from frame {}x{}",
            keys.shape().height,
            keys.shape().width,
            fs.height,
            fs.width
        )));
    }
    if !values.shape().same_resolution(&keys.shape()) || values.depth() != keys.depth() {
        return Err(VosError::CodecFailure(format!(
            "{codec}: memory values ({} entries of {}) do not match keys ({} entries of {})",
            values.depth(),
            values.shape(),
            keys.depth(),
            keys.shape()
        )));
    }
    if values.shape().channels != num_objects + 1 {
        return Err(VosError::CodecFailure(format!(
            "{codec}: memory values have {} channels, expected {}",
            values.shape().channels,
            num_objects + 1
        )));
    }
    Ok(())
}
