use super::{RecordingSession, SegmentEncoder};
use crate::frame::Frame;
use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;

const DEFAULT_QUALITY: u8 = 85;

/// Motion JPEG: every frame becomes one self-contained JPEG segment, so the
/// concatenated session is a playable MJPEG stream.
pub struct MjpegEncoder {
    quality: u8,
    matte: [u8; 3],
}

impl MjpegEncoder {
    pub fn new() -> Self {
        Self {
            quality: DEFAULT_QUALITY,
            matte: [0, 0, 0],
        }
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.clamp(1, 100);
        self
    }
}

impl Default for MjpegEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentEncoder for MjpegEncoder {
    fn encode(&mut self, frame: &Frame, session: &RecordingSession) -> Result<()> {
        let flat = frame.flatten(self.matte);
        let mut buf = Vec::new();
        flat.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, self.quality))
            .context("Failed to encode JPEG segment")?;
        session.push(buf);
        Ok(())
    }

    fn finish(&mut self, _session: &RecordingSession) -> Result<()> {
        Ok(())
    }

    fn mime_type(&self) -> &'static str {
        "video/x-motion-jpeg"
    }

    fn extension(&self) -> &'static str {
        "mjpeg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_frame_is_a_jpeg_segment() {
        let session = RecordingSession::new();
        let mut encoder = MjpegEncoder::new().with_quality(70);
        encoder.encode(&Frame::solid(8, 8, [0, 255, 0, 0]), &session).unwrap();
        encoder.encode(&Frame::solid(8, 8, [255, 0, 0, 255]), &session).unwrap();
        encoder.finish(&session).unwrap();

        let segments = session.take();
        assert_eq!(segments.len(), 2);
        for segment in &segments {
            assert_eq!(&segment[..2], &[0xFF, 0xD8]);
            assert_eq!(&segment[segment.len() - 2..], &[0xFF, 0xD9]);
        }
        let decoded = image::load_from_memory(&segments[1]).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (8, 8));
    }
}
