use crate::engine::EngineSettings;
use faceid_core::{GalleryScope, DEFAULT_MATCH_THRESHOLD};
use faceid_hw::{ImageDirOpener, SourceOpener};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration.
///
/// Built from defaults, then the TOML file named by `FACEID_CONFIG`, then
/// `FACEID_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Path to the SQLite template database.
    pub db_path: PathBuf,
    /// Maximum Euclidean distance for a positive match.
    pub match_threshold: f32,
    /// Detection loop tick interval in milliseconds.
    pub tick_interval_ms: u64,
    /// Single-face samples captured per enrollment.
    pub samples_per_enroll: usize,
    pub enroll_timeout_secs: u64,
    pub verify_timeout_secs: u64,
    /// Size of the verification pass window (N in M-of-N).
    pub pass_window: usize,
    /// Passing ticks needed within the window (M in M-of-N).
    pub passes_required: usize,
    /// Consecutive extractor/source failures before the loop reports unhealthy.
    pub max_consecutive_failures: u32,
    pub gallery_scope: GalleryScope,
    /// Directory of still images replayed as the video source.
    pub frames_dir: Option<PathBuf>,
    /// V4L2 device path. Takes precedence over `frames_dir`.
    pub camera_device: Option<String>,
    /// Recorded detections fixture for the replay extractor.
    pub detections_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    match_threshold: Option<f32>,
    tick_interval_ms: Option<u64>,
    samples_per_enroll: Option<usize>,
    enroll_timeout_secs: Option<u64>,
    verify_timeout_secs: Option<u64>,
    pass_window: Option<usize>,
    passes_required: Option<usize>,
    max_consecutive_failures: Option<u32>,
    gallery_scope: Option<GalleryScope>,
    frames_dir: Option<PathBuf>,
    camera_device: Option<String>,
    detections_path: Option<PathBuf>,
}

impl Config {
    /// Defaults, with the database under `$XDG_DATA_HOME/faceid`.
    fn defaults(lookup: &impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = lookup("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("faceid");

        Self {
            db_path: data_dir.join("templates.db"),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            tick_interval_ms: 100,
            samples_per_enroll: 3,
            enroll_timeout_secs: 15,
            verify_timeout_secs: 10,
            pass_window: 5,
            passes_required: 3,
            max_consecutive_failures: 5,
            gallery_scope: GalleryScope::All,
            frames_dir: None,
            camera_device: None,
            detections_path: None,
        }
    }

    /// Load configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::defaults(&lookup);

        if let Some(path) = lookup("FACEID_CONFIG") {
            config.apply_file(Path::new(&path))?;
        }
        config.apply_env(&lookup);
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");

        if let Some(v) = file.db_path {
            self.db_path = v;
        }
        if let Some(v) = file.match_threshold {
            self.match_threshold = v;
        }
        if let Some(v) = file.tick_interval_ms {
            self.tick_interval_ms = v;
        }
        if let Some(v) = file.samples_per_enroll {
            self.samples_per_enroll = v;
        }
        if let Some(v) = file.enroll_timeout_secs {
            self.enroll_timeout_secs = v;
        }
        if let Some(v) = file.verify_timeout_secs {
            self.verify_timeout_secs = v;
        }
        if let Some(v) = file.pass_window {
            self.pass_window = v;
        }
        if let Some(v) = file.passes_required {
            self.passes_required = v;
        }
        if let Some(v) = file.max_consecutive_failures {
            self.max_consecutive_failures = v;
        }
        if let Some(v) = file.gallery_scope {
            self.gallery_scope = v;
        }
        if file.frames_dir.is_some() {
            self.frames_dir = file.frames_dir;
        }
        if file.camera_device.is_some() {
            self.camera_device = file.camera_device;
        }
        if file.detections_path.is_some() {
            self.detections_path = file.detections_path;
        }
        Ok(())
    }

    fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACEID_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        self.match_threshold = env_f32(lookup, "FACEID_MATCH_THRESHOLD", self.match_threshold);
        self.tick_interval_ms = env_u64(lookup, "FACEID_TICK_INTERVAL_MS", self.tick_interval_ms);
        self.samples_per_enroll =
            env_usize(lookup, "FACEID_SAMPLES_PER_ENROLL", self.samples_per_enroll);
        self.enroll_timeout_secs =
            env_u64(lookup, "FACEID_ENROLL_TIMEOUT_SECS", self.enroll_timeout_secs);
        self.verify_timeout_secs =
            env_u64(lookup, "FACEID_VERIFY_TIMEOUT_SECS", self.verify_timeout_secs);
        self.pass_window = env_usize(lookup, "FACEID_PASS_WINDOW", self.pass_window);
        self.passes_required = env_usize(lookup, "FACEID_PASSES_REQUIRED", self.passes_required);
        self.max_consecutive_failures = env_u64(
            lookup,
            "FACEID_MAX_CONSECUTIVE_FAILURES",
            u64::from(self.max_consecutive_failures),
        )
        .try_into()
        .unwrap_or(self.max_consecutive_failures);

        match lookup("FACEID_GALLERY_SCOPE").as_deref() {
            Some("all") => self.gallery_scope = GalleryScope::All,
            Some("target") => self.gallery_scope = GalleryScope::Target,
            Some(other) => {
                tracing::warn!(value = other, "ignoring FACEID_GALLERY_SCOPE (expected all|target)")
            }
            None => {}
        }
        if let Some(v) = lookup("FACEID_FRAMES_DIR") {
            self.frames_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FACEID_CAMERA_DEVICE") {
            self.camera_device = Some(v);
        }
        if let Some(v) = lookup("FACEID_DETECTIONS_PATH") {
            self.detections_path = Some(PathBuf::from(v));
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.match_threshold.is_finite() || self.match_threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be a non-negative number, got {}",
                self.match_threshold
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be at least 1".into()));
        }
        if self.samples_per_enroll == 0 {
            return Err(ConfigError::Invalid("samples_per_enroll must be at least 1".into()));
        }
        if self.passes_required == 0 || self.passes_required > self.pass_window {
            return Err(ConfigError::Invalid(format!(
                "passes_required ({}) must be between 1 and pass_window ({})",
                self.passes_required, self.pass_window
            )));
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid(
                "max_consecutive_failures must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            match_threshold: self.match_threshold,
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            samples_per_enroll: self.samples_per_enroll,
            enroll_timeout: Duration::from_secs(self.enroll_timeout_secs),
            pass_window: self.pass_window,
            passes_required: self.passes_required,
            gallery_scope: self.gallery_scope,
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }

    /// The configured video source: camera device first, then image directory.
    pub fn source_opener(&self) -> Result<Arc<dyn SourceOpener>, ConfigError> {
        if let Some(device) = &self.camera_device {
            return camera_opener(device);
        }
        match &self.frames_dir {
            Some(dir) => Ok(Arc::new(ImageDirOpener { dir: dir.clone() })),
            None => Err(ConfigError::Invalid(
                "no video source configured (set camera_device or frames_dir)".into(),
            )),
        }
    }
}

#[cfg(feature = "v4l2")]
fn camera_opener(device: &str) -> Result<Arc<dyn SourceOpener>, ConfigError> {
    Ok(Arc::new(faceid_hw::CameraOpener {
        device_path: device.to_string(),
    }))
}

#[cfg(not(feature = "v4l2"))]
fn camera_opener(device: &str) -> Result<Arc<dyn SourceOpener>, ConfigError> {
    Err(ConfigError::Invalid(format!(
        "camera_device {device} requires the v4l2 feature"
    )))
}

fn env_parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparseable value");
            default
        }),
        None => default,
    }
}

fn env_f32(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    env_parse(lookup, key, default)
}

fn env_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    env_parse(lookup, key, default)
}

fn env_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    env_parse(lookup, key, default)
}
