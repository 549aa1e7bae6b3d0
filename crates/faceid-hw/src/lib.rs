//! faceid-hw: Video sources for the detection loop.
//!
//! Provides the frame type, the `VideoSource` acquisition traits, an
//! image-directory source and, with the `v4l2` feature, V4L2 camera capture.

#[cfg(feature = "v4l2")]
pub mod camera;
pub mod frame;
pub mod source;

#[cfg(feature = "v4l2")]
pub use camera::{Camera, CameraOpener};
pub use frame::Frame;
pub use source::{ImageDirOpener, ImageDirSource, SourceError, SourceOpener, VideoSource};
