//! Decoding stage: probability volumes → hard label maps.
//!
//! The engine's output stays soft; this module is the thin downstream
//! consumer that takes a per-pixel argmax over the channel axis and, for
//! inspection, blends the resulting labels onto the RGB frame with the
//! DAVIS colour palette.

use vos_types::{LabelMap, ProbabilityVolume, VosError};

/// Per-pixel argmax over the channel axis.  Ties resolve to the lowest
/// channel index.
///
/// # Errors
///
/// Returns [`VosError::ShapeMismatch`] if the volume has more than 256
/// channels (labels are 8-bit).
pub fn argmax_labels(volume: &ProbabilityVolume) -> Result<LabelMap, VosError> {
    let shape = volume.shape();
    if shape.channels > 256 {
        return Err(VosError::shape_mismatch(
            "label decoding",
            "at most 256 channels",
            format!("{} channels", shape.channels),
        ));
    }
    let n = shape.pixels();
    let data = volume.data();
    let labels = (0..n)
        .map(|p| {
            let mut best = 0;
            for c in 1..shape.channels {
                if data[c * n + p] > data[best * n + p] {
                    best = c;
                }
            }
            best as u8
        })
        .collect();
    Ok(LabelMap {
        height: shape.height,
        width: shape.width,
        labels,
    })
}

/// [`argmax_labels`] for every volume of a sequence.
pub fn decode_all(volumes: &[ProbabilityVolume]) -> Result<Vec<LabelMap>, VosError> {
    volumes.iter().map(argmax_labels).collect()
}

/// Intersection-over-union of `label` between two label maps of equal size.
///
/// Returns 1.0 when the label is absent from both.
pub fn iou(predicted: &LabelMap, truth: &LabelMap, label: u8) -> f32 {
    let (mut inter, mut union) = (0usize, 0usize);
    for (&p, &t) in predicted.labels.iter().zip(&truth.labels) {
        let (a, b) = (p == label, t == label);
        inter += (a && b) as usize;
        union += (a || b) as usize;
    }
    if union == 0 {
        1.0
    } else {
        inter as f32 / union as f32
    }
}

/// The 256-entry DAVIS / PASCAL VOC colour map.
///
/// Colour `i` spreads the bits of `i` over the three channels, most
/// significant first: bit 0 → red, bit 1 → green, bit 2 → blue, and so on
/// for the next three bits at the next-lower intensity bit.
pub fn davis_palette() -> [[u8; 3]; 256] {
    let mut palette = [[0u8; 3]; 256];
    for (i, colour) in palette.iter_mut().enumerate() {
        let mut id = i;
        for shift in (0..8).rev() {
            for (channel, value) in colour.iter_mut().enumerate() {
                *value |= (((id >> channel) & 1) as u8) << shift;
            }
            id >>= 3;
        }
    }
    palette
}

/// Blend `labels` onto an interleaved RGB image (`H·W·3` bytes).
///
/// Object pixels become `alpha · image + (1 − alpha) · palette[label]`;
/// object pixels bordering a different label are drawn black as a contour.
/// Background pixels are left untouched.
///
/// # Errors
///
/// Returns [`VosError::ShapeMismatch`] if `rgb` is not `H·W·3` bytes.
pub fn overlay(
    rgb: &[u8],
    labels: &LabelMap,
    palette: &[[u8; 3]; 256],
    alpha: f32,
) -> Result<Vec<u8>, VosError> {
    let (h, w) = (labels.height, labels.width);
    if rgb.len() != h * w * 3 {
        return Err(VosError::shape_mismatch(
            "overlay image",
            format!("{} bytes", h * w * 3),
            format!("{} bytes", rgb.len()),
        ));
    }
    let alpha = alpha.clamp(0.0, 1.0);
    let mut out = rgb.to_vec();
    for y in 0..h {
        for x in 0..w {
            let label = labels.get(y, x);
            if label == 0 {
                continue;
            }
            let px = &mut out[(y * w + x) * 3..(y * w + x) * 3 + 3];
            if is_contour(labels, y, x) {
                px.fill(0);
                continue;
            }
            let colour = palette[label as usize];
            for (v, c) in px.iter_mut().zip(colour) {
                *v = (alpha * *v as f32 + (1.0 - alpha) * c as f32).round() as u8;
            }
        }
    }
    Ok(out)
}

fn is_contour(labels: &LabelMap, y: usize, x: usize) -> bool {
    let label = labels.get(y, x);
    let neighbours = [
        (y.checked_sub(1), Some(x)),
        ((y + 1 < labels.height).then_some(y + 1), Some(x)),
        (Some(y), x.checked_sub(1)),
        (Some(y), (x + 1 < labels.width).then_some(x + 1)),
    ];
    neighbours.into_iter().any(|n| match n {
        (Some(ny), Some(nx)) => labels.get(ny, nx) != label,
        _ => false,
    })
}
