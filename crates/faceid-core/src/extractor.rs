//! Boundary to the external face embedding extractor.

use crate::types::DetectedFace;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("extractor unavailable: {0}")]
    Unavailable(String),
}

/// Maps a grayscale frame to zero or more faces with descriptors.
///
/// Implementations may block and are not assumed to be reentrant, hence
/// `&mut self`. An empty result means no face was found and is not an error.
pub trait Extractor: Send {
    fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, ExtractorError>;
}
