//! Settings schema
//!
//! Every field carries a default so a partial file (or no file at all) yields a
//! usable configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use common::utils::duration_from_secs_f64;
use common::LogLevel;

/// Complete settings for a recognition pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionSettings {
    /// Which model to load and how
    pub model: ModelSettings,
    /// Prediction aggregation parameters
    pub aggregation: AggregationSettings,
    /// Update and frame cadence
    pub cadence: CadenceSettings,
    /// Artifact cache
    pub storage: StorageSettings,
    /// Remote artifact retrieval
    pub fetch: FetchSettings,
    /// Log output
    pub logging: LoggingSettings,
}

/// Classification backend variant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Locally compiled model bundle
    #[default]
    Local,
    /// Cloud-registered labeler kept resident on the device
    RemoteLabeler,
}

/// Model selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Model identifier, also the cache key
    pub identifier: String,
    /// Backend variant
    pub backend: BackendKind,
    /// Artifact shipped with the application
    pub bundled_path: Option<PathBuf>,
    /// Artifact download location
    pub remote_url: Option<String>,
    /// Confidence threshold handed to the remote labeler
    pub detection_threshold: f32,
    /// Results below this confidence are dropped by the local backend
    pub local_confidence_floor: f32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            identifier: "default".to_string(),
            backend: BackendKind::Local,
            bundled_path: None,
            remote_url: None,
            detection_threshold: 0.0,
            local_confidence_floor: 0.2,
        }
    }
}

/// Prediction aggregation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationSettings {
    /// Minimum confidence change that counts as an update of a known label
    pub hysteresis: f32,
    /// Any raw prediction at or above this confidence requests a capture stop
    pub auto_stop_threshold: f32,
    /// Labels not re-sighted within this window are dropped
    pub retention_window_secs: f64,
    /// Whether a fold that only expired labels reports a change
    pub purge_counts_as_change: bool,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            hysteresis: 0.05,
            auto_stop_threshold: 0.85,
            retention_window_secs: 10.0,
            purge_counts_as_change: false,
        }
    }
}

impl AggregationSettings {
    /// Gets the retention window
    pub fn retention_window(&self) -> Duration {
        duration_from_secs_f64(self.retention_window_secs)
    }
}

/// Update and frame cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceSettings {
    /// Minimum time between two result pushes
    pub min_push_interval_secs: f64,
    /// Minimum time between two live frames sent to inference
    pub frame_interval_secs: f64,
}

impl Default for CadenceSettings {
    fn default() -> Self {
        Self {
            min_push_interval_secs: 2.0,
            frame_interval_secs: 0.1,
        }
    }
}

impl CadenceSettings {
    /// Gets the minimum push interval
    pub fn min_push_interval(&self) -> Duration {
        duration_from_secs_f64(self.min_push_interval_secs)
    }

    /// Gets the live frame sampling interval
    pub fn frame_interval(&self) -> Duration {
        duration_from_secs_f64(self.frame_interval_secs)
    }
}

/// Artifact cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Root directory of the per-model artifact cache
    pub cache_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir()
            .map(|dir| dir.join("image-recognizer").join("models"))
            .unwrap_or_else(|| PathBuf::from(".image-recognizer/models"));

        Self { cache_dir }
    }
}

/// Remote artifact retrieval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    /// Upper bound on one fetch; zero disables the bound
    pub timeout_secs: u64,
    /// User agent sent with fetch requests
    pub user_agent: String,
    /// Expected SHA-256 of the fetched artifact, hex encoded
    pub expected_sha256: Option<String>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            user_agent: concat!("image-recognizer/", env!("CARGO_PKG_VERSION")).to_string(),
            expected_sha256: None,
        }
    }
}

impl FetchSettings {
    /// Gets the fetch timeout, if one applies
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// Log output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is not set
    pub level: LogLevel,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}
