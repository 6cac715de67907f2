use super::{FrameSource, SourceStatus};
use crate::error::{KeyError, KeyResult};
use crate::frame::Frame;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "tif", "tiff", "webp"];

/// Plays a directory of still images in file-name order, one per tick.
pub struct ImageSequenceSource {
    dir: PathBuf,
    paths: Vec<PathBuf>,
    width: u32,
    height: u32,
    position: usize,
    looping: bool,
    ended: bool,
}

impl ImageSequenceSource {
    pub fn open<P: AsRef<Path>>(dir: P, looping: bool) -> KeyResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tracing::info!("Opening image sequence {}", dir.display());

        let entries = std::fs::read_dir(&dir).map_err(|e| {
            KeyError::source_unavailable(format!("cannot read {}: {}", dir.display(), e))
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && has_image_extension(path))
            .collect();
        paths.sort();

        let first = paths.first().ok_or_else(|| {
            KeyError::source_unavailable(format!("no images found in {}", dir.display()))
        })?;
        let (width, height) = image::image_dimensions(first).map_err(|e| {
            KeyError::source_unavailable(format!("cannot decode {}: {}", first.display(), e))
        })?;

        tracing::info!(
            "Image sequence has {} frames at {}x{}",
            paths.len(),
            width,
            height
        );

        Ok(Self {
            dir,
            paths,
            width,
            height,
            position: 0,
            looping,
            ended: false,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl FrameSource for ImageSequenceSource {
    fn status(&mut self) -> SourceStatus {
        if self.ended || self.paths.is_empty() {
            SourceStatus::Ended
        } else {
            SourceStatus::Ready
        }
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn capture_frame(&mut self) -> KeyResult<Frame> {
        let path = self
            .paths
            .get(self.position)
            .ok_or_else(|| KeyError::stalled(format!("{} has ended", self.dir.display())))?;

        let decoded = image::open(path).map_err(|e| {
            KeyError::source_unavailable(format!("cannot decode {}: {}", path.display(), e))
        })?;
        let mut rgba = decoded.to_rgba8();
        if rgba.dimensions() != (self.width, self.height) {
            tracing::debug!(
                "Resizing {} to sequence size {}x{}",
                path.display(),
                self.width,
                self.height
            );
            rgba = image::imageops::resize(
                &rgba,
                self.width,
                self.height,
                image::imageops::FilterType::Triangle,
            );
        }

        self.position += 1;
        if self.position >= self.paths.len() {
            if self.looping {
                self.position = 0;
            } else {
                self.ended = true;
            }
        }
        Ok(Frame::new(rgba))
    }

    fn restart(&mut self) -> KeyResult<()> {
        if self.paths.is_empty() {
            return Err(KeyError::stalled(format!(
                "{} has no frames to restart",
                self.dir.display()
            )));
        }
        self.position = 0;
        self.ended = false;
        Ok(())
    }

    fn release(&mut self) {
        self.paths.clear();
    }

    fn describe(&self) -> String {
        format!("image sequence {}", self.dir.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "chromakey-seq-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn plays_images_in_name_order() {
        let dir = scratch_dir("order");
        RgbaImage::from_pixel(2, 2, Rgba([2, 0, 0, 255]))
            .save(dir.join("b.png"))
            .unwrap();
        RgbaImage::from_pixel(2, 2, Rgba([1, 0, 0, 255]))
            .save(dir.join("a.png"))
            .unwrap();
        std::fs::write(dir.join("notes.txt"), "skip me").unwrap();

        let mut source = ImageSequenceSource::open(&dir, false).unwrap();
        assert_eq!(source.len(), 2);
        assert_eq!(source.resolution(), (2, 2));
        assert_eq!(source.capture_frame().unwrap().pixel(0, 0)[0], 1);
        assert_eq!(source.capture_frame().unwrap().pixel(0, 0)[0], 2);
        assert_eq!(source.status(), SourceStatus::Ended);

        source.restart().unwrap();
        assert_eq!(source.status(), SourceStatus::Ready);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn empty_directory_is_unavailable() {
        let dir = scratch_dir("empty");
        assert!(matches!(
            ImageSequenceSource::open(&dir, false),
            Err(KeyError::SourceUnavailable(_))
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
