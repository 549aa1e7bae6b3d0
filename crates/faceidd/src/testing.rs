//! Fakes for the extractor and video source used by daemon tests.

use faceid_core::{DetectedFace, Extractor, ExtractorError};
use faceid_hw::{Frame, SourceError, SourceOpener, VideoSource};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Call counters shared with a [`ScriptedExtractor`].
#[derive(Clone, Default)]
pub struct CallStats {
    calls: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl CallStats {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

/// Returns the same faces on every call, optionally slow or failing at first.
pub struct ScriptedExtractor {
    faces: Vec<DetectedFace>,
    delay: Duration,
    fail_first: usize,
    stats: CallStats,
}

impl ScriptedExtractor {
    pub fn empty() -> Self {
        Self::returning(Vec::new())
    }

    pub fn returning(faces: Vec<DetectedFace>) -> Self {
        Self {
            faces,
            delay: Duration::ZERO,
            fail_first: 0,
            stats: CallStats::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_first(mut self, count: usize) -> Self {
        self.fail_first = count;
        self
    }

    pub fn stats(&self) -> CallStats {
        self.stats.clone()
    }
}

impl Extractor for ScriptedExtractor {
    fn detect(
        &mut self,
        _frame: &[u8],
        _width: u32,
        _height: u32,
    ) -> Result<Vec<DetectedFace>, ExtractorError> {
        let call = self.stats.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_active.fetch_max(active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.stats.active.fetch_sub(1, Ordering::SeqCst);

        if call < self.fail_first {
            Err(ExtractorError::InferenceFailed(format!("scripted failure {call}")))
        } else {
            Ok(self.faces.clone())
        }
    }
}

/// Opens [`FakeSource`]s and counts acquisitions and releases.
#[derive(Clone, Default)]
pub struct FakeOpener {
    unavailable: bool,
    failing_frames: usize,
    opened: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl FakeOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Each opened source fails its first `count` frame reads.
    pub fn failing_frames(mut self, count: usize) -> Self {
        self.failing_frames = count;
        self
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl SourceOpener for FakeOpener {
    fn open(&self) -> Result<Box<dyn VideoSource>, SourceError> {
        if self.unavailable {
            return Err(SourceError::Unavailable("no camera".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSource {
            sequence: 0,
            failures_left: self.failing_frames,
            released: AtomicBool::new(false),
            release_count: Arc::clone(&self.released),
        }))
    }
}

pub struct FakeSource {
    sequence: u32,
    failures_left: usize,
    released: AtomicBool,
    release_count: Arc<AtomicUsize>,
}

impl VideoSource for FakeSource {
    fn current_frame(&mut self) -> Result<Frame, SourceError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(SourceError::Released);
        }
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(SourceError::CaptureFailed("scripted frame failure".into()));
        }
        let frame = Frame::from_gray(vec![128u8; 16], 4, 4, self.sequence);
        self.sequence += 1;
        Ok(frame)
    }

    fn release(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.release_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn describe(&self) -> String {
        "fake".into()
    }
}
