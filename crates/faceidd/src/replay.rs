//! Fixture-backed extractor that replays recorded detections.
//!
//! The fixture is JSON of the form
//! `{"frames": [[{"descriptor": [...], "box": {"x":..,"y":..,"width":..,"height":..}}], []]}`.
//! Each call returns the next entry of `frames`, wrapping around.

use faceid_core::{DetectedFace, Extractor, ExtractorError};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct ReplayFile {
    frames: Vec<Vec<DetectedFace>>,
}

pub struct ReplayExtractor {
    frames: Vec<Vec<DetectedFace>>,
    next: usize,
}

impl ReplayExtractor {
    pub fn load(path: &Path) -> Result<Self, ExtractorError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ExtractorError::Unavailable(format!("{}: {e}", path.display())))?;
        let file: ReplayFile = serde_json::from_str(&raw)
            .map_err(|e| ExtractorError::Unavailable(format!("{}: {e}", path.display())))?;

        tracing::info!(path = %path.display(), frames = file.frames.len(), "loaded replay detections");
        Ok(Self::from_frames(file.frames))
    }

    pub fn from_frames(frames: Vec<Vec<DetectedFace>>) -> Self {
        Self { frames, next: 0 }
    }
}

impl Extractor for ReplayExtractor {
    fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, ExtractorError> {
        let expected = width as usize * height as usize;
        if frame.len() != expected {
            return Err(ExtractorError::InvalidFrame(format!(
                "expected {expected} bytes for {width}x{height}, got {}",
                frame.len()
            )));
        }
        if self.frames.is_empty() {
            return Ok(Vec::new());
        }
        let faces = self.frames[self.next].clone();
        self.next = (self.next + 1) % self.frames.len();
        Ok(faces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"{
        "frames": [
            [{"descriptor": [0.1, 0.2], "box": {"x": 1, "y": 2, "width": 30, "height": 40}}],
            []
        ]
    }"#;

    #[test]
    fn test_replays_frames_cyclically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detections.json");
        std::fs::write(&path, FIXTURE).unwrap();

        let mut extractor = ReplayExtractor::load(&path).unwrap();
        let frame = vec![0u8; 4];

        let first = extractor.detect(&frame, 2, 2).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].descriptor.values(), &[0.1, 0.2]);
        assert_eq!(first[0].bbox.height, 40.0);

        assert!(extractor.detect(&frame, 2, 2).unwrap().is_empty());
        assert_eq!(extractor.detect(&frame, 2, 2).unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_mismatched_frame() {
        let mut extractor = ReplayExtractor::from_frames(vec![]);
        assert!(matches!(
            extractor.detect(&[0u8; 3], 2, 2),
            Err(ExtractorError::InvalidFrame(_))
        ));
        assert!(extractor.detect(&[0u8; 4], 2, 2).unwrap().is_empty());
    }

    #[test]
    fn test_missing_fixture_is_unavailable() {
        let err = ReplayExtractor::load(Path::new("/nonexistent/detections.json"))
            .err()
            .unwrap();
        assert!(matches!(err, ExtractorError::Unavailable(_)));
    }
}
