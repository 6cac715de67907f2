use super::color::to_hsl;
use super::types::Classification;
use crate::config::KeyConfig;
use crate::frame::Frame;

/// Similarity above which a pixel is treated as key colour.
pub const KEY_THRESHOLD: f32 = 0.4;

/// Classify one pixel against the configured HSL box.
///
/// In-range pixels are scored by their distance from the centre of the box:
/// each axis is normalised by its domain (the half circle for hue, 255 for
/// saturation and lightness), the three are combined as a Euclidean norm
/// scaled back to `[0, 1]`, and the tolerance widens the penalty.
/// Out-of-range pixels score 0.
///
/// Bounds are taken as given; callers validate `min <= max`.
#[inline]
pub fn classify(rgb: [u8; 3], cfg: &KeyConfig) -> Classification {
    let [r, g, b] = rgb;
    if r as u16 + g as u16 + b as u16 == 0 {
        return Classification::NONE;
    }

    let hsl = to_hsl(r, g, b);
    let in_range = hsl.h >= cfg.hue_min as f32
        && hsl.h <= cfg.hue_max as f32
        && hsl.s >= cfg.saturation_min as f32
        && hsl.s <= cfg.saturation_max as f32
        && hsl.l >= cfg.lightness_min as f32
        && hsl.l <= cfg.lightness_max as f32;
    if !in_range {
        return Classification::NONE;
    }

    let hue_mid = (cfg.hue_min as f32 + cfg.hue_max as f32) / 2.0;
    let sat_mid = (cfg.saturation_min as f32 + cfg.saturation_max as f32) / 2.0;
    let light_mid = (cfg.lightness_min as f32 + cfg.lightness_max as f32) / 2.0;

    let dh = hue_distance(hsl.h, hue_mid) / 180.0;
    let ds = (hsl.s - sat_mid).abs() / 255.0;
    let dl = (hsl.l - light_mid).abs() / 255.0;
    let distance = (dh * dh + ds * ds + dl * dl).sqrt() / 3f32.sqrt();

    let similarity = (1.0 - distance * (1.0 + cfg.tolerance as f32 / 100.0)).clamp(0.0, 1.0);
    Classification {
        is_key: similarity > KEY_THRESHOLD,
        similarity,
    }
}

/// Shorter arc between two hues, in degrees.
#[inline]
fn hue_distance(a: f32, b: f32) -> f32 {
    let d = (a - b).abs() % 360.0;
    d.min(360.0 - d)
}

/// Classify every pixel of a frame, row-major.
pub fn classify_frame(frame: &Frame, cfg: &KeyConfig) -> Vec<Classification> {
    frame
        .as_raw()
        .chunks_exact(4)
        .map(|px| classify([px[0], px[1], px[2]], cfg))
        .collect()
}
