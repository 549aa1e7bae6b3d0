//! Periodic detection loop with a single-flight extractor.
//!
//! Each interval tick pulls one frame and runs the extractor on the blocking
//! pool. While an extraction is in flight, further ticks are skipped rather
//! than queued. The video source is owned by the loop task and released
//! when the task exits, whichever way it exits.

use faceid_core::{DetectedFace, DetectionTick, Extractor, ExtractorError};
use faceid_hw::{SourceError, SourceOpener, VideoSource};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Extractor shared between sessions; the mutex also rules out reentrant use.
pub type SharedExtractor = Arc<Mutex<dyn Extractor>>;

pub type StatusCallback = Box<dyn FnMut(LoopStatus) + Send>;

#[derive(Error, Debug)]
pub enum LoopError {
    #[error("video source unavailable: {0}")]
    VideoSourceUnavailable(#[source] SourceError),
    #[error("detection loop already running")]
    AlreadyRunning,
    #[error("detection loop already stopped")]
    AlreadyStopped,
    #[error("tick interval must be non-zero")]
    InvalidInterval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Stopped,
}

/// What the loop should do after a tick has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    Continue,
    Finish,
}

/// Receives every completed tick, including ticks without faces.
pub trait TickHandler: Send + 'static {
    fn on_tick(&mut self, tick: DetectionTick) -> TickControl;
}

impl<F> TickHandler for F
where
    F: FnMut(DetectionTick) -> TickControl + Send + 'static,
{
    fn on_tick(&mut self, tick: DetectionTick) -> TickControl {
        self(tick)
    }
}

/// Health and scheduling events reported through the status callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStatus {
    /// An interval elapsed while the previous extraction was still running.
    TickSkipped,
    ExtractorFailed { error: String, consecutive: u32 },
    SourceFailed { error: String, consecutive: u32 },
    /// Consecutive failures reached the configured limit. Reported once per streak.
    Unhealthy { consecutive: u32 },
    /// First successful tick after `after` consecutive failures.
    Recovered { after: u32 },
    /// The handler finished the session.
    Finished,
}

#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    pub interval: Duration,
    pub max_consecutive_failures: u32,
}

/// Detection loop lifecycle: `Idle` → `Running` → `Stopped`.
pub struct DetectionLoop {
    extractor: SharedExtractor,
    config: LoopConfig,
    state: LoopState,
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl DetectionLoop {
    pub fn new(extractor: SharedExtractor, config: LoopConfig) -> Self {
        Self {
            extractor,
            config,
            state: LoopState::Idle,
            cancel: None,
            task: None,
        }
    }

    /// Current state. A loop whose handler finished reads as `Stopped`.
    pub fn state(&self) -> LoopState {
        match (&self.state, &self.task) {
            (LoopState::Running, Some(task)) if task.is_finished() => LoopState::Stopped,
            (state, _) => *state,
        }
    }

    /// Acquire the video source and begin ticking. Must be called within a
    /// Tokio runtime. On acquisition failure the loop stays `Idle`.
    pub fn start(
        &mut self,
        opener: &dyn SourceOpener,
        handler: impl TickHandler,
        on_status: impl FnMut(LoopStatus) + Send + 'static,
    ) -> Result<(), LoopError> {
        match self.state() {
            LoopState::Running => return Err(LoopError::AlreadyRunning),
            LoopState::Stopped => return Err(LoopError::AlreadyStopped),
            LoopState::Idle => {}
        }
        if self.config.interval.is_zero() {
            return Err(LoopError::InvalidInterval);
        }

        let source = opener.open().map_err(LoopError::VideoSourceUnavailable)?;
        tracing::info!(
            source = %source.describe(),
            interval_ms = self.config.interval.as_millis() as u64,
            "detection loop starting"
        );

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(run_loop(
            SourceGuard::new(source),
            Arc::clone(&self.extractor),
            self.config,
            handler,
            Box::new(on_status),
            cancel_rx,
        ));

        self.cancel = Some(cancel_tx);
        self.task = Some(task);
        self.state = LoopState::Running;
        Ok(())
    }

    /// Cancel pending ticks and wait for the loop task to exit, which
    /// releases the video source. An extraction already running is waited
    /// out. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "detection loop task failed");
            }
            tracing::info!("detection loop stopped");
        }
        if self.state == LoopState::Running {
            self.state = LoopState::Stopped;
        }
    }
}

/// Releases the wrapped source exactly once, on drop.
struct SourceGuard {
    source: Box<dyn VideoSource>,
}

impl SourceGuard {
    fn new(source: Box<dyn VideoSource>) -> Self {
        Self { source }
    }
}

impl Drop for SourceGuard {
    fn drop(&mut self) {
        self.source.release();
    }
}

/// Consecutive failure tracking shared by source and extractor errors.
struct Health {
    consecutive: u32,
    limit: u32,
}

impl Health {
    fn failure(&mut self, on_status: &mut StatusCallback) -> u32 {
        self.consecutive += 1;
        if self.consecutive == self.limit {
            tracing::error!(consecutive = self.consecutive, "detection loop unhealthy");
            on_status(LoopStatus::Unhealthy {
                consecutive: self.consecutive,
            });
        }
        self.consecutive
    }

    fn success(&mut self, on_status: &mut StatusCallback) {
        if self.consecutive > 0 {
            tracing::info!(after = self.consecutive, "detection loop recovered");
            on_status(LoopStatus::Recovered {
                after: self.consecutive,
            });
            self.consecutive = 0;
        }
    }
}

type Extraction = Result<Vec<DetectedFace>, ExtractorError>;

/// Outcome of one frame pull plus extraction on the blocking pool.
enum Pulled {
    Frame {
        sequence: u32,
        captured_at: Instant,
        extraction: Extraction,
    },
    SourceFailed(SourceError),
}

/// Pull a frame and run the extractor on it. Both may block.
fn pull_and_extract(source: &mut SourceGuard, extractor: &SharedExtractor) -> Pulled {
    let frame = match source.source.current_frame() {
        Ok(frame) => frame,
        Err(e) => return Pulled::SourceFailed(e),
    };
    let mut extractor = extractor.lock().unwrap_or_else(PoisonError::into_inner);
    Pulled::Frame {
        sequence: frame.sequence,
        captured_at: frame.timestamp,
        extraction: extractor.detect(&frame.data, frame.width, frame.height),
    }
}

async fn run_loop(
    source: SourceGuard,
    extractor: SharedExtractor,
    config: LoopConfig,
    mut handler: impl TickHandler,
    mut on_status: StatusCallback,
    mut cancel: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut health = Health {
        consecutive: 0,
        limit: config.max_consecutive_failures.max(1),
    };
    // Travels into each blocking job and back; dropping it releases the source.
    let mut source = Some(source);

    'ticks: loop {
        tokio::select! {
            biased;
            _ = &mut cancel => break 'ticks,
            _ = ticker.tick() => {}
        }
        let Some(mut guard) = source.take() else {
            break;
        };

        let shared = Arc::clone(&extractor);
        let mut job: JoinHandle<(SourceGuard, Pulled)> = tokio::task::spawn_blocking(move || {
            let pulled = pull_and_extract(&mut guard, &shared);
            (guard, pulled)
        });

        // Single flight: nothing else is dispatched until this job resolves.
        let joined = loop {
            tokio::select! {
                biased;
                _ = &mut cancel => {
                    // Either prevents the job from starting or waits it out,
                    // so no extractor invocation outlives stop().
                    job.abort();
                    let _ = (&mut job).await;
                    break 'ticks;
                }
                joined = &mut job => break joined,
                _ = ticker.tick() => {
                    tracing::debug!("extraction in flight; tick skipped");
                    on_status(LoopStatus::TickSkipped);
                }
            }
        };

        let pulled = match joined {
            Ok((guard, pulled)) => {
                source = Some(guard);
                pulled
            }
            Err(e) => {
                // The source went down with the job.
                report_extractor_failure(
                    format!("extractor task failed: {e}"),
                    &mut health,
                    &mut on_status,
                );
                tracing::error!("video source lost with failed extraction task; loop ending");
                break;
            }
        };

        let (sequence, captured_at, faces) = match pulled {
            Pulled::Frame {
                sequence,
                captured_at,
                extraction: Ok(faces),
            } => (sequence, captured_at, faces),
            Pulled::Frame {
                extraction: Err(e), ..
            } => {
                report_extractor_failure(e.to_string(), &mut health, &mut on_status);
                continue;
            }
            Pulled::SourceFailed(e) => {
                let consecutive = health.failure(&mut on_status);
                tracing::warn!(error = %e, consecutive, "frame capture failed");
                on_status(LoopStatus::SourceFailed {
                    error: e.to_string(),
                    consecutive,
                });
                continue;
            }
        };
        health.success(&mut on_status);

        tracing::debug!(sequence, faces = faces.len(), "tick extracted");
        let tick = DetectionTick::new(faces, sequence).with_captured_at(captured_at);
        if handler.on_tick(tick) == TickControl::Finish {
            on_status(LoopStatus::Finished);
            break;
        }
    }
}

fn report_extractor_failure(error: String, health: &mut Health, on_status: &mut StatusCallback) {
    let consecutive = health.failure(on_status);
    tracing::warn!(%error, consecutive, "extractor failed");
    on_status(LoopStatus::ExtractorFailed { error, consecutive });
}
