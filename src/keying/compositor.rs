use super::types::Classification;
use crate::config::Background;
use crate::frame::Frame;
use image::{imageops, RgbaImage};
use std::sync::Arc;

/// Build the output frame from per-pixel classifications.
///
/// - non-key pixels pass through unchanged with alpha 255
/// - key pixels take the background pixel at the same coordinate, alpha 255
/// - key pixels without a usable background keep their RGB with alpha 0
///
/// `background` must already match the frame size; anything else is treated
/// as no background. Edges are hard: there is no partial alpha.
pub fn composite(
    frame: &Frame,
    classifications: &[Classification],
    background: Option<&RgbaImage>,
) -> Frame {
    let background = background.filter(|bg| bg.dimensions() == frame.dimensions());
    let src = frame.as_raw();
    let mut out = Vec::with_capacity(src.len());

    for (i, (px, class)) in src.chunks_exact(4).zip(classifications).enumerate() {
        if !class.is_key {
            out.extend_from_slice(&[px[0], px[1], px[2], 255]);
            continue;
        }
        match background {
            Some(bg) => {
                let offset = i * 4;
                let bg_px = &bg.as_raw()[offset..offset + 3];
                out.extend_from_slice(&[bg_px[0], bg_px[1], bg_px[2], 255]);
            }
            None => out.extend_from_slice(&[px[0], px[1], px[2], 0]),
        }
    }

    // Short classification slices leave the remaining pixels untouched.
    if out.len() < src.len() {
        for px in src[out.len()..].chunks_exact(4) {
            out.extend_from_slice(&[px[0], px[1], px[2], 255]);
        }
    }

    let (width, height) = frame.dimensions();
    Frame::from_raw(width, height, out).unwrap_or_else(|| frame.clone())
}

/// Keeps the background rescaled to the current frame size.
///
/// The resize only reruns when the frame size or the background identity
/// changes. A background that has not finished decoding yields `None`.
#[derive(Default)]
pub struct BackgroundCache {
    scaled: Option<ScaledBackground>,
}

struct ScaledBackground {
    background_id: u64,
    dimensions: (u32, u32),
    image: Arc<RgbaImage>,
}

impl BackgroundCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prepare(
        &mut self,
        background: Option<&Background>,
        width: u32,
        height: u32,
    ) -> Option<Arc<RgbaImage>> {
        let Some(background) = background else {
            self.scaled = None;
            return None;
        };
        let source = background.image()?;

        if let Some(scaled) = &self.scaled {
            if scaled.background_id == background.id() && scaled.dimensions == (width, height) {
                return Some(Arc::clone(&scaled.image));
            }
        }

        let _span = tracing::debug_span!("scale_background").entered();
        let image = if source.dimensions() == (width, height) {
            Arc::clone(source)
        } else {
            tracing::debug!(
                "Rescaling background {} from {}x{} to {}x{}",
                background.id(),
                source.width(),
                source.height(),
                width,
                height
            );
            Arc::new(imageops::resize(
                source.as_ref(),
                width,
                height,
                imageops::FilterType::Triangle,
            ))
        };

        self.scaled = Some(ScaledBackground {
            background_id: background.id(),
            dimensions: (width, height),
            image: Arc::clone(&image),
        });
        Some(image)
    }

    pub fn clear(&mut self) {
        self.scaled = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyConfig;
    use crate::keying::classifier::classify_frame;
    use image::Rgba;

    fn green_red() -> Frame {
        Frame::from_raw(2, 1, vec![0, 255, 0, 255, 255, 0, 0, 255]).unwrap()
    }

    #[test]
    fn key_pixels_turn_transparent_without_background() {
        let frame = green_red();
        let classes = classify_frame(&frame, &KeyConfig::green());
        let out = composite(&frame, &classes, None);

        assert_eq!(out.pixel(0, 0), [0, 255, 0, 0]);
        assert_eq!(out.pixel(1, 0), [255, 0, 0, 255]);
    }

    #[test]
    fn key_pixels_take_the_background() {
        let frame = green_red();
        let classes = classify_frame(&frame, &KeyConfig::green());
        let mut bg = RgbaImage::new(2, 1);
        bg.put_pixel(0, 0, Rgba([10, 20, 30, 255]));
        bg.put_pixel(1, 0, Rgba([40, 50, 60, 255]));

        let out = composite(&frame, &classes, Some(&bg));
        assert_eq!(out.pixel(0, 0), [10, 20, 30, 255]);
        assert_eq!(out.pixel(1, 0), [255, 0, 0, 255]);
    }

    #[test]
    fn mismatched_background_is_ignored() {
        let frame = green_red();
        let classes = classify_frame(&frame, &KeyConfig::green());
        let bg = RgbaImage::from_pixel(4, 4, Rgba([9, 9, 9, 255]));
        let out = composite(&frame, &classes, Some(&bg));
        assert_eq!(out.pixel(0, 0)[3], 0);
    }

    #[test]
    fn non_key_alpha_is_forced_opaque() {
        let frame = Frame::from_raw(1, 1, vec![255, 0, 0, 17]).unwrap();
        let out = composite(&frame, &[Classification::NONE], None);
        assert_eq!(out.pixel(0, 0), [255, 0, 0, 255]);
    }

    #[test]
    fn compositing_is_deterministic() {
        let frame = Frame::from_raw(
            3,
            1,
            vec![0, 255, 0, 255, 20, 200, 30, 255, 200, 180, 170, 255],
        )
        .unwrap();
        let cfg = KeyConfig::green();
        let bg = RgbaImage::from_pixel(3, 1, Rgba([1, 2, 3, 255]));

        let a = composite(&frame, &classify_frame(&frame, &cfg), Some(&bg));
        let b = composite(&frame, &classify_frame(&frame, &cfg), Some(&bg));
        assert_eq!(a.as_raw(), b.as_raw());
    }

    #[test]
    fn cache_rescales_once_per_size() {
        let background = Background::from_image(RgbaImage::from_pixel(8, 8, Rgba([5, 5, 5, 255])));
        let mut cache = BackgroundCache::new();

        let first = cache.prepare(Some(&background), 4, 2).unwrap();
        let second = cache.prepare(Some(&background), 4, 2).unwrap();
        assert_eq!(first.dimensions(), (4, 2));
        assert!(Arc::ptr_eq(&first, &second));

        let resized = cache.prepare(Some(&background), 2, 2).unwrap();
        assert_eq!(resized.dimensions(), (2, 2));
    }

    #[test]
    fn cache_yields_nothing_until_background_decodes() {
        let (background, slot) = Background::deferred();
        let mut cache = BackgroundCache::new();
        assert!(cache.prepare(Some(&background), 2, 2).is_none());

        slot.fulfil(RgbaImage::new(2, 2));
        assert!(cache.prepare(Some(&background), 2, 2).is_some());
        assert!(cache.prepare(None, 2, 2).is_none());
    }
}
