use super::OutputSink;
use crate::frame::Frame;
use anyhow::{Context, Result};
use image::RgbImage;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Writes composited frames to a v4l2loopback device as YUYV.
///
/// Loopback consumers cannot see alpha, so transparent pixels are blended
/// over `matte` first.
pub struct V4L2Output {
    file: File,
    width: u32,
    height: u32,
    matte: [u8; 3],
}

impl V4L2Output {
    pub fn new<P: AsRef<Path>>(device_path: P, width: u32, height: u32) -> Result<Self> {
        let path = device_path.as_ref();
        tracing::info!(
            "Opening v4l2loopback device at {} ({}x{})",
            path.display(),
            width,
            height
        );

        #[cfg(feature = "loopback")]
        negotiate_format(path, width, height)?;

        // v4l2loopback accepts raw frame data written to the device file
        let file = File::options()
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open v4l2loopback device at {}", path.display()))?;

        tracing::info!("v4l2loopback device opened successfully");

        Ok(Self {
            file,
            width,
            height,
            matte: [0, 0, 0],
        })
    }

    /// Colour shown where the composited frame is transparent.
    pub fn with_matte(mut self, matte: [u8; 3]) -> Self {
        self.matte = matte;
        self
    }
}

#[cfg(feature = "loopback")]
fn negotiate_format(path: &Path, width: u32, height: u32) -> Result<()> {
    use v4l::video::Output;

    let device = v4l::Device::with_path(path)
        .with_context(|| format!("Failed to open {} for format negotiation", path.display()))?;
    let requested = v4l::Format::new(width, height, v4l::FourCC::new(b"YUYV"));
    let actual = Output::set_format(&device, &requested).context("Failed to set YUYV format")?;
    tracing::debug!(
        "Loopback format negotiated: {}x{} {}",
        actual.width,
        actual.height,
        actual.fourcc
    );
    Ok(())
}

/// Convert an RGB frame to YUV422 (YUYV), pairing horizontally adjacent
/// pixels and averaging their chroma.
fn rgb_to_yuyv(rgb_image: &RgbImage) -> Vec<u8> {
    let (width, height) = rgb_image.dimensions();
    let mut yuyv = Vec::with_capacity((width * height * 2) as usize);

    for y in 0..height {
        for x in (0..width).step_by(2) {
            let pixel1 = rgb_image.get_pixel(x, y);
            let pixel2 = if x + 1 < width {
                rgb_image.get_pixel(x + 1, y)
            } else {
                pixel1
            };

            let (y1, u1, v1) = rgb_to_yuv(pixel1[0], pixel1[1], pixel1[2]);
            let (y2, u2, v2) = rgb_to_yuv(pixel2[0], pixel2[1], pixel2[2]);

            let u = ((u1 as u16 + u2 as u16) / 2) as u8;
            let v = ((v1 as u16 + v2 as u16) / 2) as u8;

            // YUYV format: Y0 U Y1 V
            yuyv.extend_from_slice(&[y1, u, y2, v]);
        }
    }

    yuyv
}

fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let r = r as f32;
    let g = g as f32;
    let b = b as f32;

    let y = (0.299 * r + 0.587 * g + 0.114 * b).clamp(0.0, 255.0) as u8;
    let u = ((-0.147 * r - 0.289 * g + 0.436 * b) + 128.0).clamp(0.0, 255.0) as u8;
    let v = ((0.615 * r - 0.515 * g - 0.100 * b) + 128.0).clamp(0.0, 255.0) as u8;

    (y, u, v)
}

impl OutputSink for V4L2Output {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let flat = frame.flatten(self.matte);
        let flat = if flat.dimensions() != (self.width, self.height) {
            image::imageops::resize(
                &flat,
                self.width,
                self.height,
                image::imageops::FilterType::Triangle,
            )
        } else {
            flat
        };

        let yuyv_data = rgb_to_yuyv(&flat);

        self.file
            .write_all(&yuyv_data)
            .context("Failed to write frame to v4l2loopback device")?;

        Ok(())
    }

    fn resolution(&self) -> Option<(u32, u32)> {
        Some((self.width, self.height))
    }
}
