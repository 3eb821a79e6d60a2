//! Deterministic synthetic videos.
//!
//! Builds short clips of flat-coloured squares translating over a uniform
//! grey background, together with their ground-truth label maps.  Useful for
//! exercising the full propagation pipeline without a dataset on disk.

use vos_types::{Frame, LabelMap, ProbabilityVolume, SequenceMeta, VideoSequence, VosError};

/// Background intensity on all three channels.
const BACKGROUND: f32 = 0.3;

/// A square object moving at constant velocity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticObject {
    /// Side length in pixels.
    pub size: usize,
    /// Top-left corner at frame 0, as `(row, col)`.
    pub start: (usize, usize),
    /// Displacement per frame, as `(rows, cols)`.
    pub velocity: (isize, isize),
    /// RGB colour in `[0, 1]`.
    pub colour: [f32; 3],
}

impl SyntheticObject {
    /// Top-left corner at frame `t`, clamped so the square stays in view.
    fn corner(&self, t: usize, height: usize, width: usize) -> (usize, usize) {
        let place = |start: usize, v: isize, extent: usize| {
            let max = extent.saturating_sub(self.size) as isize;
            (start as isize + v * t as isize).clamp(0, max) as usize
        };
        (
            place(self.start.0, self.velocity.0, height),
            place(self.start.1, self.velocity.1, width),
        )
    }
}

/// A generated sequence and the true label map of every frame.
#[derive(Debug, Clone)]
pub struct SyntheticVideo {
    pub sequence: VideoSequence,
    pub labels: Vec<LabelMap>,
}

/// Render `objects` over `num_frames` frames.  Object `i` gets label `i + 1`;
/// later objects are drawn over earlier ones.
///
/// # Errors
///
/// Returns [`VosError::Configuration`] for an empty clip, zero-sized objects,
/// or more than 255 objects.
pub fn moving_objects(
    name: &str,
    num_frames: usize,
    height: usize,
    width: usize,
    objects: &[SyntheticObject],
) -> Result<SyntheticVideo, VosError> {
    if num_frames == 0 || height == 0 || width == 0 {
        return Err(VosError::Configuration(
            "synthetic video needs at least one non-empty frame".to_string(),
        ));
    }
    if objects.len() > 255 {
        return Err(VosError::Configuration(format!(
            "synthetic video supports at most 255 objects, got {}",
            objects.len()
        )));
    }
    if objects.iter().any(|o| o.size == 0) {
        return Err(VosError::Configuration(
            "synthetic objects must have a non-zero size".to_string(),
        ));
    }

    let plane = height * width;
    let mut frames = Vec::with_capacity(num_frames);
    let mut labels = Vec::with_capacity(num_frames);
    for t in 0..num_frames {
        let mut pixels = vec![BACKGROUND; 3 * plane];
        let mut label_map = vec![0u8; plane];
        for (i, object) in objects.iter().enumerate() {
            let (top, left) = object.corner(t, height, width);
            for y in top..(top + object.size).min(height) {
                for x in left..(left + object.size).min(width) {
                    let p = y * width + x;
                    label_map[p] = (i + 1) as u8;
                    for (c, value) in object.colour.iter().enumerate() {
                        pixels[c * plane + p] = *value;
                    }
                }
            }
        }
        frames.push(Frame::new(3, height, width, pixels)?);
        labels.push(LabelMap {
            height,
            width,
            labels: label_map,
        });
    }

    let initial_mask =
        ProbabilityVolume::from_label_map(&labels[0].labels, objects.len(), height, width)?;
    Ok(SyntheticVideo {
        sequence: VideoSequence {
            frames,
            initial_mask,
            num_objects: objects.len(),
            meta: SequenceMeta {
                name: name.to_string(),
                num_frames,
            },
        },
        labels,
    })
}

/// One red square, a quarter of the frame wide, drifting right by one pixel
/// per frame.
pub fn moving_square(
    name: &str,
    num_frames: usize,
    height: usize,
    width: usize,
) -> Result<SyntheticVideo, VosError> {
    let size = (height.min(width) / 4).max(1);
    moving_objects(
        name,
        num_frames,
        height,
        width,
        &[SyntheticObject {
            size,
            start: (height / 4, width / 4),
            velocity: (0, 1),
            colour: [1.0, 0.0, 0.0],
        }],
    )
}
