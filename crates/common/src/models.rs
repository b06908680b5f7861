//! Common data models for Image Recognizer
//!
//! This module defines the data models shared by the storage, lifecycle,
//! inference and aggregation crates.

use std::fmt;
use std::path::{Path, PathBuf};

use bytesize::ByteSize;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// File extension of the compiled (backend-ready) artifact format
pub const COMPILED_EXTENSION: &str = "pmc";

/// Stable name of a classification model, used as the cache key
///
/// Identifiers double as directory names in the artifact cache, so only
/// ASCII alphanumerics, `-`, `_` and `.` are accepted and the names `.`
/// and `..` are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelIdentifier(String);

impl ModelIdentifier {
    /// Creates a validated model identifier
    pub fn new(value: impl Into<String>) -> Result<Self, StoreError> {
        let value = value.into();

        if value.is_empty() || value == "." || value == ".." {
            return Err(StoreError::InvalidIdentifier(value));
        }

        let valid = value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

        if !valid {
            return Err(StoreError::InvalidIdentifier(value));
        }

        Ok(Self(value))
    }

    /// Gets the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ModelIdentifier {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ModelIdentifier> for String {
    fn from(id: ModelIdentifier) -> Self {
        id.0
    }
}

/// Form of a stored model artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Uncompiled model definition
    Source,
    /// Backend-ready compiled model
    Compiled,
}

impl ArtifactKind {
    /// Infers the artifact kind from a file path or URL path
    ///
    /// Only the compiled extension is recognised; anything else is source.
    pub fn from_path(path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or(path);

        match Path::new(path).extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case(COMPILED_EXTENSION) => ArtifactKind::Compiled,
            _ => ArtifactKind::Source,
        }
    }

    /// Gets the file name used for this kind inside a model's cache directory
    pub fn file_name(&self) -> &'static str {
        match self {
            ArtifactKind::Source => "source.artifact",
            ArtifactKind::Compiled => "compiled.artifact",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Source => write!(f, "source"),
            ArtifactKind::Compiled => write!(f, "compiled"),
        }
    }
}

/// Raw bytes of a model together with their declared form
#[derive(Clone, PartialEq, Eq)]
pub struct ModelArtifact {
    /// Declared form of the bytes
    pub kind: ArtifactKind,
    /// Artifact payload
    pub bytes: Vec<u8>,
}

impl ModelArtifact {
    /// Creates a new artifact
    pub fn new(kind: ArtifactKind, bytes: Vec<u8>) -> Self {
        Self { kind, bytes }
    }

    /// Gets the payload size for display
    pub fn size(&self) -> ByteSize {
        ByteSize::b(self.bytes.len() as u64)
    }
}

impl fmt::Debug for ModelArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelArtifact")
            .field("kind", &self.kind)
            .field("size", &self.size())
            .finish()
    }
}

/// Where a model comes from when it is not cached yet
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSource {
    /// An artifact shipped with the application
    Bundled(PathBuf),
    /// An artifact downloaded from a URL
    Remote { url: String },
    /// A cloud-registered labeler resolved by model name
    RemoteLabeler { confidence_threshold: f32 },
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Bundled(path) => write!(f, "bundled:{}", path.display()),
            ModelSource::Remote { url } => write!(f, "remote:{}", url),
            ModelSource::RemoteLabeler { confidence_threshold } => {
                write!(f, "remote-labeler(threshold={})", confidence_threshold)
            }
        }
    }
}

/// Progress of an artifact transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchProgress {
    /// Bytes received so far
    pub received_bytes: u64,
    /// Total bytes, when the remote announced it
    pub total_bytes: Option<u64>,
}

impl FetchProgress {
    /// Gets the completed fraction, when the total is known
    pub fn fraction(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(1.0),
            Some(total) => Some((self.received_bytes as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

impl fmt::Display for FetchProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.total_bytes, self.fraction()) {
            (Some(total), Some(fraction)) => write!(
                f,
                "{} / {} ({:.0}%)",
                ByteSize::b(self.received_bytes),
                ByteSize::b(total),
                fraction * 100.0
            ),
            _ => write!(f, "{}", ByteSize::b(self.received_bytes)),
        }
    }
}

/// One label produced by a single inference call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPrediction {
    /// Label as it should be displayed
    pub label: String,
    /// Confidence in [0, 1]
    pub confidence: f32,
    /// When the frame was classified
    pub observed_at: DateTime<Utc>,
}

impl RawPrediction {
    /// Creates a new raw prediction
    pub fn new(label: impl Into<String>, confidence: f32, observed_at: DateTime<Utc>) -> Self {
        Self {
            label: label.into(),
            confidence,
            observed_at,
        }
    }
}

/// Running, deduplicated state of one label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedPrediction {
    /// Label, unique within an aggregated set
    pub label: String,
    /// Latest confidence in [0, 1]
    pub confidence: f32,
    /// When the label was last sighted
    pub last_seen_at: DateTime<Utc>,
}
