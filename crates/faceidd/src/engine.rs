use crate::detection_loop::{
    DetectionLoop, LoopConfig, LoopError, LoopStatus, SharedExtractor, TickControl,
};
use faceid_core::store::IdentitySummary;
use faceid_core::{
    Decision, DetectionTick, EnrollError, EnrollProgress, EnrollmentSession, GalleryScope,
    MatchResult, PassWindow, Registered, StoreError, TemplateStore, Verifier, VerifyError,
};
use faceid_hw::SourceOpener;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detection loop: {0}")]
    Loop(#[from] LoopError),
    #[error("enrollment: {0}")]
    Enroll(#[from] EnrollError),
    #[error("verification: {0}")]
    Verify(#[from] VerifyError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("verification session failed: {0}")]
    VerificationFailed(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine session ended unexpectedly")]
    ChannelClosed,
}

impl EngineError {
    /// Stable short code so callers can tell failure kinds apart.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Loop(LoopError::VideoSourceUnavailable(_)) => "VideoSourceUnavailable",
            EngineError::Loop(LoopError::InvalidInterval) => "InvalidInterval",
            EngineError::Loop(_) => "Busy",
            EngineError::Enroll(EnrollError::NoFaceDetected) => "NoFaceDetected",
            EngineError::Enroll(EnrollError::MultipleFacesDetected { .. }) => "MultipleFacesDetected",
            EngineError::Enroll(EnrollError::InvalidName)
            | EngineError::Verify(VerifyError::InvalidName)
            | EngineError::Store(StoreError::InvalidName) => "InvalidName",
            EngineError::Verify(VerifyError::NotRegistered(_)) => "NotRegistered",
            EngineError::Verify(VerifyError::Match(_)) | EngineError::VerificationFailed(_) => {
                "VerificationFailed"
            }
            EngineError::Timeout(_) => "Timeout",
            _ => "Internal",
        }
    }
}

/// Tunables for enrollment and verification sessions.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub match_threshold: f32,
    pub tick_interval: Duration,
    pub samples_per_enroll: usize,
    pub enroll_timeout: Duration,
    pub pass_window: usize,
    pub passes_required: usize,
    pub gallery_scope: GalleryScope,
    pub max_consecutive_failures: u32,
}

/// Session state published by a running verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationStatus {
    Pending {
        passes: usize,
        observed: usize,
        required: usize,
    },
    Authenticated,
    Failed(String),
}

impl From<Decision> for VerificationStatus {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Pending {
                passes,
                observed,
                required,
            } => VerificationStatus::Pending {
                passes,
                observed,
                required,
            },
            Decision::Authenticated => VerificationStatus::Authenticated,
        }
    }
}

#[derive(Default)]
struct EngineHealth {
    sessions: AtomicU64,
    ticks_skipped: AtomicU64,
    extractor_failures: AtomicU64,
    source_failures: AtomicU64,
    unhealthy: AtomicBool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub sessions: u64,
    pub ticks_skipped: u64,
    pub extractor_failures: u64,
    pub source_failures: u64,
    pub unhealthy: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Enrollment and verification front end over one extractor, store and video source.
pub struct Engine {
    extractor: SharedExtractor,
    store: Arc<TemplateStore>,
    opener: Arc<dyn SourceOpener>,
    settings: EngineSettings,
    health: Arc<EngineHealth>,
}

impl Engine {
    pub fn new(
        extractor: SharedExtractor,
        store: Arc<TemplateStore>,
        opener: Arc<dyn SourceOpener>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            extractor,
            store,
            opener,
            settings,
            health: Arc::new(EngineHealth::default()),
        }
    }

    pub fn store(&self) -> &TemplateStore {
        &self.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            sessions: self.health.sessions.load(Ordering::Relaxed),
            ticks_skipped: self.health.ticks_skipped.load(Ordering::Relaxed),
            extractor_failures: self.health.extractor_failures.load(Ordering::Relaxed),
            source_failures: self.health.source_failures.load(Ordering::Relaxed),
            unhealthy: self.health.unhealthy.load(Ordering::Relaxed),
        }
    }

    pub fn list(&self) -> Result<Vec<IdentitySummary>, EngineError> {
        Ok(self.store.list()?)
    }

    pub fn remove(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.store.delete(name)?)
    }

    fn new_loop(&self, interval: Duration) -> DetectionLoop {
        self.health.sessions.fetch_add(1, Ordering::Relaxed);
        DetectionLoop::new(
            Arc::clone(&self.extractor),
            LoopConfig {
                interval,
                max_consecutive_failures: self.settings.max_consecutive_failures,
            },
        )
    }

    fn status_reporter(&self) -> impl FnMut(LoopStatus) + Send + 'static {
        let health = Arc::clone(&self.health);
        move |status| match status {
            LoopStatus::TickSkipped => {
                health.ticks_skipped.fetch_add(1, Ordering::Relaxed);
            }
            LoopStatus::ExtractorFailed { .. } => {
                health.extractor_failures.fetch_add(1, Ordering::Relaxed);
            }
            LoopStatus::SourceFailed { .. } => {
                health.source_failures.fetch_add(1, Ordering::Relaxed);
            }
            LoopStatus::Unhealthy { .. } => health.unhealthy.store(true, Ordering::Relaxed),
            LoopStatus::Recovered { .. } => health.unhealthy.store(false, Ordering::Relaxed),
            LoopStatus::Finished => {}
        }
    }

    /// Capture `samples_per_enroll` single-face samples from the live source
    /// and register them under `name`, replacing earlier templates.
    ///
    /// Ticks without exactly one face are retried until the enroll timeout;
    /// if it expires, the last rejection (e.g. `NoFaceDetected`) is returned.
    pub async fn enroll(&self, name: &str) -> Result<Registered, EngineError> {
        let mut session = Some(EnrollmentSession::new(name, self.settings.samples_per_enroll)?);
        tracing::info!(name = name.trim(), samples = self.settings.samples_per_enroll, "enroll requested");

        let last_rejection: Arc<Mutex<Option<EnrollError>>> = Arc::new(Mutex::new(None));
        let (reply_tx, reply_rx) = oneshot::channel::<Result<Registered, EnrollError>>();
        let mut reply = Some(reply_tx);
        let store = Arc::clone(&self.store);
        let rejection = Arc::clone(&last_rejection);

        let handler = move |tick: DetectionTick| {
            let Some(active) = session.as_mut() else {
                return TickControl::Finish;
            };
            let outcome = match active.offer(&tick) {
                Ok(EnrollProgress::Collecting { .. }) => return TickControl::Continue,
                Ok(EnrollProgress::Ready) => match session.take() {
                    Some(ready) => ready.commit(&store),
                    None => return TickControl::Finish,
                },
                Err(e) if e.is_retryable() => {
                    tracing::debug!(error = %e, sequence = tick.sequence, "enroll: tick rejected");
                    *lock(&rejection) = Some(e);
                    return TickControl::Continue;
                }
                Err(e) => Err(e),
            };
            if let Some(reply) = reply.take() {
                let _ = reply.send(outcome);
            }
            TickControl::Finish
        };

        let mut detection = self.new_loop(self.settings.tick_interval);
        detection.start(self.opener.as_ref(), handler, self.status_reporter())?;

        let timeout = self.settings.enroll_timeout;
        let outcome = tokio::time::timeout(timeout, reply_rx).await;
        detection.stop().await;

        match outcome {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(_)) => Err(EngineError::ChannelClosed),
            Err(_) => {
                let last = lock(&last_rejection).take();
                tracing::warn!(?timeout, "enroll timed out");
                match last {
                    Some(e) => Err(e.into()),
                    None => Err(EngineError::Timeout(timeout)),
                }
            }
        }
    }

    /// Start a continuous verification session for `target`.
    ///
    /// `on_result` receives every per-face match result, in detection order.
    /// The session keeps running until the handle is stopped.
    pub fn start_verification(
        &self,
        target: &str,
        mut on_result: impl FnMut(&MatchResult) + Send + 'static,
        interval: Duration,
    ) -> Result<VerificationHandle, EngineError> {
        let window = PassWindow::new(self.settings.pass_window, self.settings.passes_required)?;
        let mut verifier = Verifier::from_store(
            &self.store,
            target,
            self.settings.gallery_scope,
            self.settings.match_threshold,
            window,
        )?;
        let target = verifier.target().to_string();
        tracing::info!(identity = %target, scope = ?self.settings.gallery_scope, "verification requested");

        let (status_tx, status_rx) = watch::channel(VerificationStatus::from(verifier.decision()));
        let handler = move |tick: DetectionTick| match verifier.on_tick(&tick) {
            Ok(update) => {
                for result in &update.results {
                    on_result(result);
                }
                let next = VerificationStatus::from(update.decision);
                status_tx.send_if_modified(|current| {
                    if *current == next {
                        false
                    } else {
                        *current = next;
                        true
                    }
                });
                TickControl::Continue
            }
            Err(e) => {
                tracing::error!(error = %e, "verification aborted");
                let _ = status_tx.send(VerificationStatus::Failed(e.to_string()));
                TickControl::Finish
            }
        };

        let mut detection = self.new_loop(interval);
        detection.start(self.opener.as_ref(), handler, self.status_reporter())?;

        Ok(VerificationHandle {
            target,
            detection,
            status: status_rx,
        })
    }

    /// Stop a verification session. Idempotent.
    pub async fn stop(&self, handle: &mut VerificationHandle) {
        handle.stop().await;
    }

    /// Run a verification session until it authenticates or `timeout` expires.
    pub async fn verify(&self, target: &str, timeout: Duration) -> Result<bool, EngineError> {
        let mut handle = self.start_verification(
            target,
            |result| {
                tracing::debug!(label = %result.label, distance = result.distance, "verify: face matched");
            },
            self.settings.tick_interval,
        )?;

        let outcome = tokio::time::timeout(timeout, handle.authenticated()).await;
        handle.stop().await;

        match outcome {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::info!(identity = %handle.target(), status = ?handle.status(), "verification not authenticated before timeout");
                Ok(false)
            }
        }
    }
}

/// Running verification session returned by [`Engine::start_verification`].
pub struct VerificationHandle {
    target: String,
    detection: DetectionLoop,
    status: watch::Receiver<VerificationStatus>,
}

impl VerificationHandle {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn status(&self) -> VerificationStatus {
        self.status.borrow().clone()
    }

    /// Wait until the session authenticates. Fails if the session aborts.
    pub async fn authenticated(&mut self) -> Result<(), EngineError> {
        let status = self
            .status
            .wait_for(|s| !matches!(s, VerificationStatus::Pending { .. }))
            .await
            .map_err(|_| EngineError::ChannelClosed)?
            .clone();
        match status {
            VerificationStatus::Authenticated => Ok(()),
            VerificationStatus::Failed(message) => Err(EngineError::VerificationFailed(message)),
            VerificationStatus::Pending { .. } => Err(EngineError::ChannelClosed),
        }
    }

    pub async fn stop(&mut self) {
        self.detection.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeOpener, ScriptedExtractor};
    use faceid_core::{BoundingBox, Descriptor, DetectedFace, Label};

    fn alice() -> Descriptor {
        Descriptor::new((0..128).map(|i| 0.1 + i as f32 * 0.001).collect())
    }

    fn stranger() -> Descriptor {
        let mut values = alice().values().to_vec();
        values[0] += 0.9;
        Descriptor::new(values)
    }

    fn face(descriptor: Descriptor) -> DetectedFace {
        DetectedFace {
            descriptor,
            bbox: BoundingBox { x: 10.0, y: 10.0, width: 100.0, height: 100.0 },
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            match_threshold: 0.6,
            tick_interval: Duration::from_millis(5),
            samples_per_enroll: 2,
            enroll_timeout: Duration::from_millis(300),
            pass_window: 3,
            passes_required: 2,
            gallery_scope: GalleryScope::All,
            max_consecutive_failures: 3,
        }
    }

    fn engine(extractor: ScriptedExtractor, opener: &FakeOpener) -> (Engine, Arc<TemplateStore>) {
        let store = Arc::new(TemplateStore::in_memory());
        let engine = Engine::new(
            Arc::new(Mutex::new(extractor)),
            Arc::clone(&store),
            Arc::new(opener.clone()),
            settings(),
        );
        (engine, store)
    }

    #[tokio::test]
    async fn test_enroll_then_verify() {
        let opener = FakeOpener::new();
        let (engine, store) = engine(ScriptedExtractor::returning(vec![face(alice())]), &opener);

        let registered = engine.enroll("alice").await.unwrap();
        assert_eq!(registered, Registered { name: "alice".into(), templates: 2 });
        assert_eq!(store.load("alice").unwrap(), vec![alice(), alice()]);
        assert_eq!(opener.released(), 1);

        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        let mut handle = engine
            .start_verification(
                "alice",
                move |r: &MatchResult| sink.lock().unwrap().push(r.clone()),
                Duration::from_millis(5),
            )
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle.authenticated())
            .await
            .unwrap()
            .unwrap();
        engine.stop(&mut handle).await;
        engine.stop(&mut handle).await;

        assert_eq!(handle.status(), VerificationStatus::Authenticated);
        assert_eq!(opener.opened(), 2);
        assert_eq!(opener.released(), 2);

        let results = results.lock().unwrap();
        assert!(results.len() >= 2);
        for r in results.iter() {
            assert_eq!(r.label, Label::Known("alice".into()));
            assert_eq!(r.distance, 0.0);
        }
    }

    #[tokio::test]
    async fn test_enroll_without_face() {
        let opener = FakeOpener::new();
        let (engine, store) = engine(ScriptedExtractor::empty(), &opener);

        let err = engine.enroll("alice").await.unwrap_err();
        assert!(matches!(err, EngineError::Enroll(EnrollError::NoFaceDetected)));
        assert_eq!(err.code(), "NoFaceDetected");
        assert!(store.names().unwrap().is_empty());
        assert_eq!(opener.released(), 1);
    }

    #[tokio::test]
    async fn test_enroll_multiple_faces() {
        let opener = FakeOpener::new();
        let (engine, store) =
            engine(ScriptedExtractor::returning(vec![face(alice()), face(stranger())]), &opener);

        let err = engine.enroll("alice").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Enroll(EnrollError::MultipleFacesDetected { count: 2 })
        ));
        assert!(!store.exists("alice"));
    }

    #[tokio::test]
    async fn test_enroll_invalid_name_skips_camera() {
        let opener = FakeOpener::new();
        let (engine, _store) = engine(ScriptedExtractor::returning(vec![face(alice())]), &opener);
        let err = engine.enroll("   ").await.unwrap_err();
        assert_eq!(err.code(), "InvalidName");
        assert_eq!(opener.opened(), 0);
    }

    #[tokio::test]
    async fn test_enroll_source_unavailable() {
        let opener = FakeOpener::unavailable();
        let (engine, _store) = engine(ScriptedExtractor::returning(vec![face(alice())]), &opener);
        let err = engine.enroll("alice").await.unwrap_err();
        assert!(matches!(err, EngineError::Loop(LoopError::VideoSourceUnavailable(_))));
        assert_eq!(err.code(), "VideoSourceUnavailable");
    }

    #[tokio::test]
    async fn test_zero_interval_verification_skips_camera() {
        let opener = FakeOpener::new();
        let (engine, store) = engine(ScriptedExtractor::returning(vec![face(alice())]), &opener);
        store.save("alice", &[alice()]).unwrap();

        let err = engine
            .start_verification("alice", |_: &MatchResult| {}, Duration::ZERO)
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Loop(LoopError::InvalidInterval)));
        assert_eq!(err.code(), "InvalidInterval");
        assert_eq!(opener.opened(), 0);
    }

    #[tokio::test]
    async fn test_verify_unregistered_skips_camera() {
        let opener = FakeOpener::new();
        let (engine, store) = engine(ScriptedExtractor::returning(vec![face(alice())]), &opener);
        store.save("bob", &[stranger()]).unwrap();

        let err = engine.verify("alice", Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, EngineError::Verify(VerifyError::NotRegistered(_))));
        assert_eq!(err.code(), "NotRegistered");
        assert_eq!(opener.opened(), 0);
    }

    #[tokio::test]
    async fn test_verify_registered_face() {
        let opener = FakeOpener::new();
        let (engine, store) = engine(ScriptedExtractor::returning(vec![face(alice())]), &opener);
        store.save("alice", &[alice()]).unwrap();

        assert!(engine.verify("alice", Duration::from_secs(2)).await.unwrap());
        assert_eq!(opener.released(), 1);
    }

    #[tokio::test]
    async fn test_verify_stranger_is_rejected() {
        let opener = FakeOpener::new();
        let (engine, store) = engine(ScriptedExtractor::returning(vec![face(stranger())]), &opener);
        store.save("alice", &[alice()]).unwrap();

        assert!(!engine.verify("alice", Duration::from_millis(150)).await.unwrap());
        assert_eq!(opener.released(), 1);
    }

    #[tokio::test]
    async fn test_verify_dimension_mismatch_aborts() {
        let opener = FakeOpener::new();
        let (engine, store) = engine(
            ScriptedExtractor::returning(vec![face(Descriptor::new(vec![0.0; 64]))]),
            &opener,
        );
        store.save("alice", &[alice()]).unwrap();

        let err = engine.verify("alice", Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, EngineError::VerificationFailed(_)));
        assert_eq!(err.code(), "VerificationFailed");
    }

    #[tokio::test]
    async fn test_health_records_extractor_failures() {
        let opener = FakeOpener::new();
        let (engine, store) = engine(
            ScriptedExtractor::returning(vec![face(alice())]).failing_first(3),
            &opener,
        );
        store.save("alice", &[alice()]).unwrap();

        assert!(engine.verify("alice", Duration::from_secs(2)).await.unwrap());
        let health = engine.health();
        assert_eq!(health.extractor_failures, 3);
        assert!(!health.unhealthy);
        assert_eq!(health.sessions, 1);
    }

    #[tokio::test]
    async fn test_list_and_remove() {
        let opener = FakeOpener::new();
        let (engine, store) = engine(ScriptedExtractor::empty(), &opener);
        store.save("alice", &[alice()]).unwrap();
        store.save("bob", &[stranger()]).unwrap();

        let names: Vec<String> = engine.list().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alice".to_string(), "bob".to_string()]);
        assert!(engine.remove("bob").unwrap());
        assert!(!engine.remove("bob").unwrap());
        assert_eq!(engine.list().unwrap().len(), 1);
    }
}
