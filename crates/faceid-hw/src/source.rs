//! Video source abstraction and the image-directory source.

use crate::frame::Frame;
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "pgm"];

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("video source unavailable: {0}")]
    Unavailable(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("video source already released")]
    Released,
}

/// An acquired video source. Frames are pulled one at a time.
pub trait VideoSource: Send {
    fn current_frame(&mut self) -> Result<Frame, SourceError>;

    /// Release the underlying device. Calling it again is a no-op.
    fn release(&mut self);

    fn describe(&self) -> String;
}

/// Acquires a [`VideoSource`]. Acquisition failure (missing device,
/// permission denied) is reported as [`SourceError::Unavailable`].
pub trait SourceOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn VideoSource>, SourceError>;
}

/// Cycles through the images of a directory in file-name order.
pub struct ImageDirSource {
    dir: PathBuf,
    paths: Vec<PathBuf>,
    next: usize,
    sequence: u32,
    released: bool,
}

impl ImageDirSource {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, SourceError> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| SourceError::Unavailable(format!("{}: {e}", dir.display())))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(SourceError::Unavailable(format!(
                "{}: no images found",
                dir.display()
            )));
        }

        tracing::info!(dir = %dir.display(), images = paths.len(), "opened image directory source");

        Ok(Self {
            dir: dir.to_path_buf(),
            paths,
            next: 0,
            sequence: 0,
            released: false,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl VideoSource for ImageDirSource {
    fn current_frame(&mut self) -> Result<Frame, SourceError> {
        if self.released {
            return Err(SourceError::Released);
        }
        let path = &self.paths[self.next % self.paths.len()];
        self.next = (self.next + 1) % self.paths.len();

        let gray = image::open(path)
            .map_err(|e| SourceError::CaptureFailed(format!("{}: {e}", path.display())))?
            .to_luma8();
        let (width, height) = gray.dimensions();

        let frame = Frame::from_gray(gray.into_raw(), width, height, self.sequence);
        self.sequence = self.sequence.wrapping_add(1);
        Ok(frame)
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            tracing::debug!(dir = %self.dir.display(), "image directory source released");
        }
    }

    fn describe(&self) -> String {
        format!("images:{}", self.dir.display())
    }
}

/// Opens a fresh [`ImageDirSource`] per session.
pub struct ImageDirOpener {
    pub dir: PathBuf,
}

impl SourceOpener for ImageDirOpener {
    fn open(&self) -> Result<Box<dyn VideoSource>, SourceError> {
        Ok(Box::new(ImageDirSource::open(&self.dir)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn write_image(dir: &Path, name: &str, value: u8) {
        GrayImage::from_pixel(4, 3, Luma([value]))
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn test_cycles_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "b.png", 200);
        write_image(dir.path(), "a.png", 10);
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut source = ImageDirSource::open(dir.path()).unwrap();
        assert_eq!(source.len(), 2);

        let first = source.current_frame().unwrap();
        assert_eq!((first.width, first.height), (4, 3));
        assert!(first.is_dark);
        assert_eq!(first.sequence, 0);

        let second = source.current_frame().unwrap();
        assert_eq!(second.data, vec![200u8; 12]);
        assert_eq!(second.sequence, 1);

        let third = source.current_frame().unwrap();
        assert_eq!(third.data, vec![10u8; 12]);
        assert_eq!(third.sequence, 2);
    }

    #[test]
    fn test_missing_or_empty_dir_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ImageDirSource::open(dir.path()),
            Err(SourceError::Unavailable(_))
        ));
        assert!(matches!(
            ImageDirSource::open(dir.path().join("missing")),
            Err(SourceError::Unavailable(_))
        ));
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "a.png", 100);
        let opener = ImageDirOpener { dir: dir.path().to_path_buf() };
        let mut source = opener.open().unwrap();
        source.release();
        source.release();
        assert!(matches!(source.current_frame(), Err(SourceError::Released)));
    }
}
