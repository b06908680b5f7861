//! Error types for the common crate
//!
//! This module defines the error taxonomy shared by the model lifecycle manager,
//! the inference backends and the recognition pipeline.

use thiserror::Error;

/// Errors reported by a model load
///
/// A single load result is handed to every caller attached to the same in-flight
/// load, so the type is `Clone` and carries its context as strings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// No usable artifact exists in the cache or the bundle
    #[error("no artifact available for model {model_id}")]
    MissingArtifact { model_id: String },

    /// Retrieving the remote artifact failed
    #[error("fetching model {model_id} failed: {reason}")]
    FetchFailed { model_id: String, reason: String },

    /// The source artifact could not be compiled
    #[error("compiling model {model_id} failed: {reason}")]
    CompileFailed { model_id: String, reason: String },

    /// Reading or writing the artifact cache failed
    #[error("artifact storage for model {model_id} failed: {reason}")]
    Storage { model_id: String, reason: String },

    /// The requested backend variant has no capability wired into the manager
    #[error("backend unavailable for model {model_id}: {reason}")]
    BackendUnavailable { model_id: String, reason: String },

    /// The load task ended without producing a result
    #[error("load of model {model_id} was interrupted: {reason}")]
    Interrupted { model_id: String, reason: String },
}

impl LoadError {
    /// Returns true if retrying the same load may succeed without caller intervention
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LoadError::FetchFailed { .. } | LoadError::Storage { .. } | LoadError::Interrupted { .. }
        )
    }
}

/// Errors reported by a single inference call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferError {
    /// Recognition attempted before the model reached the ready state
    #[error("model is not ready for inference")]
    ModelNotReady,

    /// The supplied frame cannot be classified
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// The backend failed while classifying
    #[error("inference failed: {0}")]
    Backend(String),
}

/// Errors reported by a model fetcher
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The remote answered with a non-success status
    #[error("HTTP {status} while fetching {url}")]
    Status { url: String, status: u16 },

    /// The transfer itself failed
    #[error("transport error: {0}")]
    Transport(String),

    /// The fetched bytes do not match the expected digest
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// The fetch did not complete in time
    #[error("fetch timed out after {0}")]
    TimedOut(String),
}

/// Errors reported by a model blob store
#[derive(Error, Debug)]
pub enum StoreError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The identifier cannot be mapped onto the store layout
    #[error("invalid model identifier: {0}")]
    InvalidIdentifier(String),

    /// The requested artifact does not exist
    #[error("artifact not found: {0}")]
    NotFound(String),
}

/// Errors reported by a backend compile step
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The source artifact could not be parsed
    #[error("malformed source artifact: {0}")]
    Malformed(String),

    /// The source artifact parsed but describes an unusable model
    #[error("invalid model definition: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_classification() {
        let fetch = LoadError::FetchFailed {
            model_id: "flowers".to_string(),
            reason: "HTTP 503".to_string(),
        };
        assert!(fetch.is_transient());

        let missing = LoadError::MissingArtifact { model_id: "flowers".to_string() };
        assert!(!missing.is_transient());

        let compile = LoadError::CompileFailed {
            model_id: "flowers".to_string(),
            reason: "bad prototype".to_string(),
        };
        assert!(!compile.is_transient());
    }

    #[test]
    fn test_display() {
        let err = FetchError::Status { url: "https://example.org/m".to_string(), status: 404 };
        assert_eq!(err.to_string(), "HTTP 404 while fetching https://example.org/m");
        assert_eq!(InferError::ModelNotReady.to_string(), "model is not ready for inference");
    }
}
