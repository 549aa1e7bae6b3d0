use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Label assigned to a descriptor that matched no identity under the threshold.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Fixed-length face embedding produced by an extractor (typically 128-dimensional).
///
/// Immutable once constructed: the values are only reachable through a shared slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor(Vec<f32>);

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    /// Embedding dimensionality.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Index of the first NaN or infinite value, if any.
    pub fn first_non_finite(&self) -> Option<usize> {
        self.0.iter().position(|v| !v.is_finite())
    }

    /// Euclidean distance to `other`, or `None` when the dimensionalities differ.
    pub fn euclidean_distance(&self, other: &Descriptor) -> Option<f32> {
        if self.0.len() != other.0.len() {
            return None;
        }
        let sum: f32 = self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum();
        Some(sum.sqrt())
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// One face reported by the extractor for a single frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub descriptor: Descriptor,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

/// Detections from one extractor invocation, in extractor order.
#[derive(Debug, Clone)]
pub struct DetectionTick {
    pub faces: Vec<DetectedFace>,
    /// Sequence number of the frame the detections came from.
    pub sequence: u32,
    pub captured_at: Instant,
}

impl DetectionTick {
    pub fn new(faces: Vec<DetectedFace>, sequence: u32) -> Self {
        Self {
            faces,
            sequence,
            captured_at: Instant::now(),
        }
    }

    /// Stamp the tick with the capture time of its frame.
    pub fn with_captured_at(mut self, captured_at: Instant) -> Self {
        self.captured_at = captured_at;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }
}

/// Outcome label of a match: a registered identity name, or unknown.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Label {
    Known(String),
    Unknown,
}

impl Label {
    pub fn as_str(&self) -> &str {
        match self {
            Label::Known(name) => name,
            Label::Unknown => UNKNOWN_LABEL,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Label::Known(_))
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-face matching result for one tick. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub label: Label,
    /// Euclidean distance to the closest template; `+inf` for an empty gallery.
    pub distance: f32,
    pub face_box: BoundingBox,
}

/// A registered identity as held by the template store.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub name: String,
    pub descriptors: Vec<Descriptor>,
}

/// Normalize an identity name: surrounding whitespace is trimmed, and an
/// empty result is rejected. Names are otherwise case-sensitive.
pub fn normalize_name(raw: &str) -> Option<&str> {
    let name = raw.trim();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}
