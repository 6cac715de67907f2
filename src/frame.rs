use image::{DynamicImage, Rgb, RgbImage, RgbaImage};
use std::sync::Arc;

/// An immutable RGBA8 frame.
///
/// Cloning is cheap: the pixel buffer is shared, and every processing step
/// produces a new `Frame` instead of mutating one a consumer may hold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    image: Arc<RgbaImage>,
}

impl Frame {
    pub fn new(image: RgbaImage) -> Self {
        Self {
            image: Arc::new(image),
        }
    }

    /// Wrap a raw RGBA buffer. Returns `None` if the buffer is not exactly
    /// `width * height * 4` bytes.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        RgbaImage::from_raw(width, height, data).map(Self::new)
    }

    /// Promote an RGB capture to an opaque RGBA frame.
    pub fn from_rgb(image: RgbImage) -> Self {
        Self::new(DynamicImage::ImageRgb8(image).to_rgba8())
    }

    /// A frame filled with a single colour.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        Self::new(RgbaImage::from_pixel(width, height, image::Rgba(rgba)))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn as_raw(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        self.image.get_pixel(x, y).0
    }

    /// True when both frames share the same pixel buffer.
    pub fn ptr_eq(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.image, &other.image)
    }

    /// Drop the alpha channel by blending every pixel over `matte`.
    ///
    /// Used by outputs that cannot carry transparency (loopback devices,
    /// JPEG segments).
    pub fn flatten(&self, matte: [u8; 3]) -> RgbImage {
        let (width, height) = self.dimensions();
        let mut out = RgbImage::new(width, height);
        for (dst, src) in out.pixels_mut().zip(self.image.pixels()) {
            let a = src[3] as u16;
            if a == 255 {
                *dst = Rgb([src[0], src[1], src[2]]);
                continue;
            }
            let inv = 255 - a;
            *dst = Rgb([
                (mul_div255(src[0] as u16, a) + mul_div255(matte[0] as u16, inv)).min(255) as u8,
                (mul_div255(src[1] as u16, a) + mul_div255(matte[1] as u16, inv)).min(255) as u8,
                (mul_div255(src[2] as u16, a) + mul_div255(matte[2] as u16, inv)).min(255) as u8,
            ]);
        }
        out
    }
}

fn mul_div255(x: u16, a: u16) -> u16 {
    (x * a + 127) / 255
}
