//! Nearest-template matching over labeled descriptor collections.

use crate::types::{Descriptor, DetectionTick, Label, MatchResult};
use thiserror::Error;

/// Conventional maximum distance for a positive match with 128-d embeddings.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("descriptor length mismatch: candidate has {candidate} dims, template '{name}' has {template}")]
    InvalidDescriptorLength {
        name: String,
        candidate: usize,
        template: usize,
    },
}

/// Insertion-ordered mapping of identity name to its templates.
///
/// Enumeration order is insertion order; replacing an existing name keeps
/// its original position.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<(String, Vec<Descriptor>)>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, templates: Vec<Descriptor>) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = templates,
            None => self.entries.push((name, templates)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[Descriptor]> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Descriptor])> {
        self.entries.iter().map(|(n, t)| (n.as_str(), t.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, Vec<Descriptor>)> for Gallery {
    fn from_iter<I: IntoIterator<Item = (String, Vec<Descriptor>)>>(iter: I) -> Self {
        let mut gallery = Gallery::new();
        for (name, templates) in iter {
            gallery.insert(name, templates);
        }
        gallery
    }
}

/// Closest template found for a single candidate descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct BestMatch {
    pub label: Label,
    pub distance: f32,
}

/// Strategy for comparing a candidate descriptor against a gallery.
pub trait Matcher {
    fn best_match(
        &self,
        candidate: &Descriptor,
        gallery: &Gallery,
        threshold: f32,
    ) -> Result<BestMatch, MatchError>;
}

/// Euclidean nearest-neighbour matcher.
///
/// Visits every template of every identity in gallery order and keeps the
/// global minimum. Only a strictly smaller distance replaces the current
/// best, so on ties the identity enumerated first wins.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn best_match(
        &self,
        candidate: &Descriptor,
        gallery: &Gallery,
        threshold: f32,
    ) -> Result<BestMatch, MatchError> {
        let mut best_distance = f32::INFINITY;
        let mut best_name: Option<&str> = None;

        for (name, templates) in gallery.iter() {
            for template in templates {
                let distance = candidate.euclidean_distance(template).ok_or_else(|| {
                    MatchError::InvalidDescriptorLength {
                        name: name.to_string(),
                        candidate: candidate.len(),
                        template: template.len(),
                    }
                })?;
                if distance < best_distance {
                    best_distance = distance;
                    best_name = Some(name);
                }
            }
        }

        let label = match best_name {
            Some(name) if best_distance <= threshold => Label::Known(name.to_string()),
            _ => Label::Unknown,
        };

        Ok(BestMatch {
            label,
            distance: best_distance,
        })
    }
}

/// Match every face of a tick independently, preserving detection order.
pub fn match_tick(
    matcher: &dyn Matcher,
    tick: &DetectionTick,
    gallery: &Gallery,
    threshold: f32,
) -> Result<Vec<MatchResult>, MatchError> {
    tick.faces
        .iter()
        .map(|face| {
            let best = matcher.best_match(&face.descriptor, gallery, threshold)?;
            Ok(MatchResult {
                label: best.label,
                distance: best.distance,
                face_box: face.bbox,
            })
        })
        .collect()
}
