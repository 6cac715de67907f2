use crate::error::{KeyError, KeyResult};
use crate::frame::Frame;
use image::ImageFormat;
use std::io::Cursor;
use std::path::Path;

/// Encode a composited frame as PNG, keeping its alpha channel.
pub fn encode_png(frame: &Frame) -> KeyResult<Vec<u8>> {
    if frame.is_empty() {
        return Err(KeyError::export("frame has no pixels"));
    }
    let mut buf = Vec::new();
    frame
        .image()
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| KeyError::export(format!("png encoding failed: {e}")))?;
    Ok(buf)
}

/// Write `bytes` to `path` without leaving a partial file behind.
///
/// The data goes to a sibling temporary file that is renamed into place
/// once fully written.
pub fn write_asset(path: &Path, bytes: &[u8]) -> KeyResult<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| KeyError::export(format!("'{}' is not a file path", path.display())))?;
    let mut partial_name = file_name.to_os_string();
    partial_name.push(".part");
    let partial = path.with_file_name(partial_name);

    if let Err(e) = std::fs::write(&partial, bytes) {
        let _ = std::fs::remove_file(&partial);
        return Err(KeyError::export(format!(
            "failed to write '{}': {}",
            partial.display(),
            e
        )));
    }
    std::fs::rename(&partial, path).map_err(|e| {
        let _ = std::fs::remove_file(&partial);
        KeyError::export(format!("failed to move '{}' into place: {}", path.display(), e))
    })?;

    tracing::info!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

/// Encode and write a still frame.
pub fn save_png(frame: &Frame, path: &Path) -> KeyResult<()> {
    let bytes = encode_png(frame)?;
    write_asset(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn png_round_trips_alpha() {
        let frame = Frame::from_raw(2, 1, vec![0, 255, 0, 0, 255, 0, 0, 255]).unwrap();
        let bytes = encode_png(&frame).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap().to_rgba8();
        assert_eq!(decoded.as_raw(), frame.as_raw());
    }

    #[test]
    fn empty_frame_is_an_export_failure() {
        let frame = Frame::from_raw(0, 0, Vec::new()).unwrap();
        assert!(matches!(encode_png(&frame), Err(KeyError::Export(_))));
    }

    #[test]
    fn failed_write_leaves_nothing_behind() {
        let dir = std::env::temp_dir().join(format!("chromakey-missing-{}", std::process::id()));
        let target = dir.join("still.png");
        assert!(write_asset(&target, b"data").is_err());
        assert!(!target.exists());
        assert!(!dir.join("still.png.part").exists());
    }

    #[test]
    fn save_png_writes_the_file() {
        let path = std::env::temp_dir().join(format!("chromakey-still-{}.png", std::process::id()));
        save_png(&Frame::solid(3, 3, [1, 2, 3, 255]), &path).unwrap();
        let decoded = image::open(&path).unwrap().to_rgba8();
        assert_eq!(decoded.dimensions(), (3, 3));
        std::fs::remove_file(&path).unwrap();
    }
}
