//! Verification: per-tick matching against a target identity with an M-of-N
//! sliding window before a session counts as authenticated.

use crate::matcher::{match_tick, EuclideanMatcher, Gallery, MatchError, Matcher};
use crate::store::{StoreError, TemplateStore};
use crate::types::{normalize_name, DetectionTick, MatchResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("identity not registered: {0}")]
    NotRegistered(String),
    #[error("identity name must be non-empty")]
    InvalidName,
    #[error("pass window requires 1 <= required ({required}) <= size ({size})")]
    InvalidWindow { size: usize, required: usize },
    #[error("match: {0}")]
    Match(#[from] MatchError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Which identities a verification session compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GalleryScope {
    /// Every registered identity; the target only passes when it is the
    /// closest identity overall.
    #[default]
    All,
    /// Only the target's own templates.
    Target,
}

/// Sliding window of per-tick pass/fail outcomes.
#[derive(Debug, Clone)]
pub struct PassWindow {
    outcomes: VecDeque<bool>,
    size: usize,
    required: usize,
}

impl PassWindow {
    pub fn new(size: usize, required: usize) -> Result<Self, VerifyError> {
        if required == 0 || required > size {
            return Err(VerifyError::InvalidWindow { size, required });
        }
        Ok(Self {
            outcomes: VecDeque::with_capacity(size),
            size,
            required,
        })
    }

    /// Record one tick outcome; returns whether the window is now satisfied.
    pub fn record(&mut self, passed: bool) -> bool {
        if self.outcomes.len() == self.size {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(passed);
        self.is_satisfied()
    }

    pub fn passes(&self) -> usize {
        self.outcomes.iter().filter(|&&p| p).count()
    }

    pub fn observed(&self) -> usize {
        self.outcomes.len()
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn is_satisfied(&self) -> bool {
        self.passes() >= self.required
    }
}

/// Session-level verification state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Pending {
        passes: usize,
        observed: usize,
        required: usize,
    },
    Authenticated,
}

/// Output of one verification tick.
#[derive(Debug, Clone)]
pub struct VerificationUpdate {
    /// One result per detected face, in detection order.
    pub results: Vec<MatchResult>,
    /// Whether this tick counted as a pass for the target.
    pub target_matched: bool,
    pub decision: Decision,
}

/// Verification session for one target identity.
pub struct Verifier {
    target: String,
    gallery: Gallery,
    threshold: f32,
    window: PassWindow,
    matcher: Box<dyn Matcher + Send>,
    authenticated: bool,
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier")
            .field("target", &self.target)
            .field("identities", &self.gallery.len())
            .field("threshold", &self.threshold)
            .field("window", &self.window)
            .field("authenticated", &self.authenticated)
            .finish()
    }
}

impl Verifier {
    /// Verify against a caller-supplied gallery, which must contain `target`.
    pub fn new(
        target: &str,
        gallery: Gallery,
        threshold: f32,
        window: PassWindow,
    ) -> Result<Self, VerifyError> {
        let target = normalize_name(target).ok_or(VerifyError::InvalidName)?;
        if !gallery.contains(target) {
            return Err(VerifyError::NotRegistered(target.to_string()));
        }
        Ok(Self {
            target: target.to_string(),
            gallery,
            threshold,
            window,
            matcher: Box::new(EuclideanMatcher),
            authenticated: false,
        })
    }

    /// Verify against templates loaded from `store`.
    pub fn from_store(
        store: &TemplateStore,
        target: &str,
        scope: GalleryScope,
        threshold: f32,
        window: PassWindow,
    ) -> Result<Self, VerifyError> {
        let name = normalize_name(target).ok_or(VerifyError::InvalidName)?;
        let gallery = match scope {
            GalleryScope::All => store.gallery()?,
            GalleryScope::Target => match store.load(name) {
                Ok(descriptors) => [(name.to_string(), descriptors)].into_iter().collect(),
                Err(StoreError::NotFound(_)) => Gallery::new(),
                Err(e) => return Err(e.into()),
            },
        };
        Self::new(name, gallery, threshold, window)
    }

    pub fn with_matcher(mut self, matcher: Box<dyn Matcher + Send>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn decision(&self) -> Decision {
        if self.authenticated {
            Decision::Authenticated
        } else {
            Decision::Pending {
                passes: self.window.passes(),
                observed: self.window.observed(),
                required: self.window.required(),
            }
        }
    }

    /// Match a tick. Empty ticks report nothing and leave the window untouched.
    /// Once authenticated, the session stays authenticated.
    pub fn on_tick(&mut self, tick: &DetectionTick) -> Result<VerificationUpdate, VerifyError> {
        if tick.is_empty() {
            return Ok(VerificationUpdate {
                results: Vec::new(),
                target_matched: false,
                decision: self.decision(),
            });
        }

        let results = match_tick(self.matcher.as_ref(), tick, &self.gallery, self.threshold)?;
        let target_matched = results.iter().any(|r| r.label.as_str() == self.target && r.label.is_known());

        if self.window.record(target_matched) && !self.authenticated {
            self.authenticated = true;
            tracing::info!(
                identity = %self.target,
                passes = self.window.passes(),
                observed = self.window.observed(),
                "verification authenticated"
            );
        }

        tracing::debug!(
            identity = %self.target,
            faces = results.len(),
            target_matched,
            "verify: tick matched"
        );

        Ok(VerificationUpdate {
            results,
            target_matched,
            decision: self.decision(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::BestMatch;
    use crate::types::{BoundingBox, Descriptor, DetectedFace, Label};

    fn alice() -> Descriptor {
        Descriptor::new((0..128).map(|i| 0.1 + i as f32 * 0.002).collect())
    }

    fn shifted(offset: f32) -> Descriptor {
        let mut values = alice().values().to_vec();
        values[0] += offset;
        Descriptor::new(values)
    }

    fn tick_of(descriptors: Vec<Descriptor>) -> DetectionTick {
        let faces = descriptors
            .into_iter()
            .map(|descriptor| DetectedFace {
                descriptor,
                bbox: BoundingBox { x: 0.0, y: 0.0, width: 80.0, height: 80.0 },
            })
            .collect();
        DetectionTick::new(faces, 0)
    }

    fn alice_gallery() -> Gallery {
        [("alice".to_string(), vec![alice()])].into_iter().collect()
    }

    #[test]
    fn test_window_m_of_n() {
        let mut window = PassWindow::new(5, 3).unwrap();
        assert!(!window.record(true));
        assert!(!window.record(false));
        assert!(!window.record(true));
        assert!(window.record(true));
    }

    #[test]
    fn test_window_slides() {
        let mut window = PassWindow::new(3, 2).unwrap();
        window.record(true);
        window.record(false);
        window.record(false);
        // The early pass has slid out of the window.
        assert!(!window.record(true));
        assert_eq!(window.observed(), 3);
        assert!(window.record(true));
    }

    #[test]
    fn test_window_validation() {
        assert!(PassWindow::new(3, 0).is_err());
        assert!(PassWindow::new(3, 4).is_err());
        assert!(PassWindow::new(1, 1).is_ok());
    }

    /// Matcher that always reports the same label, to exercise the seam.
    struct FixedMatcher(Label);

    impl Matcher for FixedMatcher {
        fn best_match(
            &self,
            _candidate: &Descriptor,
            _gallery: &Gallery,
            _threshold: f32,
        ) -> Result<BestMatch, MatchError> {
            Ok(BestMatch { label: self.0.clone(), distance: 0.5 })
        }
    }

    #[test]
    fn test_custom_matcher_decides_passes() {
        let mut verifier =
            Verifier::new("alice", alice_gallery(), 0.6, PassWindow::new(1, 1).unwrap())
                .unwrap()
                .with_matcher(Box::new(FixedMatcher(Label::Unknown)));
        let update = verifier.on_tick(&tick_of(vec![alice()])).unwrap();
        assert_eq!(update.results[0].label, Label::Unknown);
        assert_eq!(update.results[0].distance, 0.5);
        assert!(!update.target_matched);

        let mut verifier =
            Verifier::new("alice", alice_gallery(), 0.6, PassWindow::new(1, 1).unwrap())
                .unwrap()
                .with_matcher(Box::new(FixedMatcher(Label::Known("alice".into()))));
        let update = verifier.on_tick(&tick_of(vec![shifted(5.0)])).unwrap();
        assert!(update.target_matched);
        assert_eq!(update.decision, Decision::Authenticated);
    }

    #[test]
    fn test_identical_descriptor_matches_at_zero_distance() {
        let mut verifier =
            Verifier::new("alice", alice_gallery(), 0.6, PassWindow::new(1, 1).unwrap()).unwrap();
        let update = verifier.on_tick(&tick_of(vec![alice()])).unwrap();
        assert_eq!(update.results.len(), 1);
        assert_eq!(update.results[0].label, Label::Known("alice".into()));
        assert_eq!(update.results[0].distance, 0.0);
        assert_eq!(update.decision, Decision::Authenticated);
    }

    #[test]
    fn test_distant_descriptor_is_unknown() {
        let mut verifier =
            Verifier::new("alice", alice_gallery(), 0.6, PassWindow::new(1, 1).unwrap()).unwrap();
        let update = verifier.on_tick(&tick_of(vec![shifted(0.9)])).unwrap();
        assert_eq!(update.results[0].label, Label::Unknown);
        assert!(!update.target_matched);
        assert!(matches!(update.decision, Decision::Pending { passes: 0, observed: 1, .. }));
    }

    #[test]
    fn test_requires_multiple_passing_ticks() {
        let mut verifier =
            Verifier::new("alice", alice_gallery(), 0.6, PassWindow::new(5, 3).unwrap()).unwrap();
        let close = tick_of(vec![shifted(0.1)]);
        let far = tick_of(vec![shifted(2.0)]);

        assert!(matches!(verifier.on_tick(&close).unwrap().decision, Decision::Pending { .. }));
        assert!(matches!(verifier.on_tick(&far).unwrap().decision, Decision::Pending { .. }));
        assert!(matches!(verifier.on_tick(&close).unwrap().decision, Decision::Pending { .. }));
        assert_eq!(verifier.on_tick(&close).unwrap().decision, Decision::Authenticated);
        // Latched for the rest of the session.
        assert_eq!(verifier.on_tick(&far).unwrap().decision, Decision::Authenticated);
    }

    #[test]
    fn test_empty_tick_reports_nothing() {
        let mut verifier =
            Verifier::new("alice", alice_gallery(), 0.6, PassWindow::new(2, 2).unwrap()).unwrap();
        let update = verifier.on_tick(&tick_of(vec![])).unwrap();
        assert!(update.results.is_empty());
        assert_eq!(
            update.decision,
            Decision::Pending { passes: 0, observed: 0, required: 2 }
        );
    }

    #[test]
    fn test_any_face_in_tick_can_pass() {
        let mut verifier =
            Verifier::new("alice", alice_gallery(), 0.6, PassWindow::new(1, 1).unwrap()).unwrap();
        let update = verifier.on_tick(&tick_of(vec![shifted(3.0), alice()])).unwrap();
        let labels: Vec<&str> = update.results.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["unknown", "alice"]);
        assert!(update.target_matched);
    }

    #[test]
    fn test_closer_other_identity_blocks_pass() {
        let mut gallery = Gallery::new();
        gallery.insert("alice", vec![shifted(0.3)]);
        gallery.insert("bob", vec![shifted(0.2)]);
        let mut verifier =
            Verifier::new("alice", gallery, 0.6, PassWindow::new(1, 1).unwrap()).unwrap();
        let update = verifier.on_tick(&tick_of(vec![alice()])).unwrap();
        assert_eq!(update.results[0].label, Label::Known("bob".into()));
        assert!(!update.target_matched);
    }

    #[test]
    fn test_unregistered_target() {
        let store = TemplateStore::in_memory();
        store.save("bob", &[alice()]).unwrap();
        for scope in [GalleryScope::All, GalleryScope::Target] {
            let err = Verifier::from_store(&store, "alice", scope, 0.6, PassWindow::new(1, 1).unwrap())
                .unwrap_err();
            assert!(matches!(err, VerifyError::NotRegistered(ref n) if n == "alice"));
        }
    }

    #[test]
    fn test_from_store_scopes() {
        let store = TemplateStore::in_memory();
        store.save("alice", &[shifted(0.3)]).unwrap();
        store.save("bob", &[shifted(0.2)]).unwrap();

        let mut all =
            Verifier::from_store(&store, "alice", GalleryScope::All, 0.6, PassWindow::new(1, 1).unwrap())
                .unwrap();
        assert!(!all.on_tick(&tick_of(vec![alice()])).unwrap().target_matched);

        let mut target_only = Verifier::from_store(
            &store,
            "alice",
            GalleryScope::Target,
            0.6,
            PassWindow::new(1, 1).unwrap(),
        )
        .unwrap();
        assert!(target_only.on_tick(&tick_of(vec![alice()])).unwrap().target_matched);
    }

    #[test]
    fn test_dimension_mismatch_surfaces() {
        let mut verifier =
            Verifier::new("alice", alice_gallery(), 0.6, PassWindow::new(1, 1).unwrap()).unwrap();
        let err = verifier
            .on_tick(&tick_of(vec![Descriptor::new(vec![0.0; 64])]))
            .unwrap_err();
        assert!(matches!(err, VerifyError::Match(MatchError::InvalidDescriptorLength { .. })));
    }
}
