//! Enrollment: collecting descriptors for a new identity and committing them.
//!
//! A tick contributes a sample only when it contains exactly one face. Ticks
//! with several faces are rejected with [`EnrollError::MultipleFacesDetected`]
//! rather than guessing which face belongs to the enrolling user.

use crate::store::{StoreError, TemplateStore};
use crate::types::{normalize_name, Descriptor, DetectedFace, DetectionTick};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("identity name must be non-empty")]
    InvalidName,
    #[error("sample count must be at least 1")]
    InvalidSampleCount,
    #[error("no face detected")]
    NoFaceDetected,
    #[error("{count} faces detected; enrollment requires exactly one")]
    MultipleFacesDetected { count: usize },
    #[error("sample {index} has {found} dims, expected {expected}")]
    InconsistentDimensions {
        index: usize,
        expected: usize,
        found: usize,
    },
    #[error("descriptor has a non-finite value at position {position}")]
    NonFiniteDescriptor { position: usize },
    #[error("enrollment incomplete: {collected} of {required} samples")]
    Incomplete { collected: usize, required: usize },
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl EnrollError {
    /// Whether the next tick may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EnrollError::NoFaceDetected
                | EnrollError::MultipleFacesDetected { .. }
                | EnrollError::InconsistentDimensions { .. }
                | EnrollError::NonFiniteDescriptor { .. }
        )
    }
}

/// Successful enrollment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Registered {
    pub name: String,
    pub templates: usize,
}

/// Progress after offering a tick to an [`EnrollmentSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollProgress {
    Collecting { collected: usize, required: usize },
    Ready,
}

/// The single face an enrollment tick may contribute.
pub fn accept_single_face(tick: &DetectionTick) -> Result<&DetectedFace, EnrollError> {
    match tick.faces.as_slice() {
        [] => Err(EnrollError::NoFaceDetected),
        [face] => Ok(face),
        faces => Err(EnrollError::MultipleFacesDetected { count: faces.len() }),
    }
}

/// Bounded sample buffer for one identity, committed with a single save.
#[derive(Debug)]
pub struct EnrollmentSession {
    name: String,
    required: usize,
    samples: Vec<Descriptor>,
}

impl EnrollmentSession {
    pub fn new(name: &str, required: usize) -> Result<Self, EnrollError> {
        let name = normalize_name(name).ok_or(EnrollError::InvalidName)?;
        if required == 0 {
            return Err(EnrollError::InvalidSampleCount);
        }
        Ok(Self {
            name: name.to_string(),
            required,
            samples: Vec::with_capacity(required),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collected(&self) -> usize {
        self.samples.len()
    }

    pub fn is_ready(&self) -> bool {
        self.samples.len() >= self.required
    }

    /// Add the tick's face as a sample. Ticks offered once ready are ignored.
    pub fn offer(&mut self, tick: &DetectionTick) -> Result<EnrollProgress, EnrollError> {
        if self.is_ready() {
            return Ok(EnrollProgress::Ready);
        }
        let face = accept_single_face(tick)?;
        if let Some(position) = face.descriptor.first_non_finite() {
            return Err(EnrollError::NonFiniteDescriptor { position });
        }

        if let Some(first) = self.samples.first() {
            if first.len() != face.descriptor.len() {
                return Err(EnrollError::InconsistentDimensions {
                    index: self.samples.len(),
                    expected: first.len(),
                    found: face.descriptor.len(),
                });
            }
        }
        self.samples.push(face.descriptor.clone());

        tracing::debug!(
            name = %self.name,
            collected = self.samples.len(),
            required = self.required,
            "enroll: sample accepted"
        );

        if self.is_ready() {
            Ok(EnrollProgress::Ready)
        } else {
            Ok(EnrollProgress::Collecting {
                collected: self.samples.len(),
                required: self.required,
            })
        }
    }

    /// Replace any stored templates for the name with the collected samples.
    pub fn commit(self, store: &TemplateStore) -> Result<Registered, EnrollError> {
        if !self.is_ready() {
            return Err(EnrollError::Incomplete {
                collected: self.samples.len(),
                required: self.required,
            });
        }
        store.save(&self.name, &self.samples)?;
        tracing::info!(name = %self.name, templates = self.samples.len(), "identity registered");
        Ok(Registered {
            name: self.name,
            templates: self.samples.len(),
        })
    }
}

/// Enroll `name` from a single tick.
pub fn enroll(
    store: &TemplateStore,
    name: &str,
    tick: &DetectionTick,
) -> Result<Registered, EnrollError> {
    let mut session = EnrollmentSession::new(name, 1)?;
    session.offer(tick)?;
    session.commit(store)
}
