//! Model lifecycle states

use std::fmt;

use common::error::LoadError;
use common::FetchProgress;
use inference_engine::InferenceBackend;

/// Lifecycle state of one model identifier
#[derive(Debug, Clone, Default)]
pub enum ModelLifecycleState {
    /// Nothing loaded and nothing in flight
    #[default]
    Unloaded,
    /// Artifact bytes are being retrieved
    Fetching(FetchProgress),
    /// A source artifact is being compiled
    Compiling,
    /// The backend is ready for inference
    Ready(InferenceBackend),
    /// The last load failed
    Failed(LoadError),
}

impl ModelLifecycleState {
    /// Returns true for the ready state
    pub fn is_ready(&self) -> bool {
        matches!(self, ModelLifecycleState::Ready(_))
    }

    /// Gets the ready backend, if any
    pub fn backend(&self) -> Option<&InferenceBackend> {
        match self {
            ModelLifecycleState::Ready(backend) => Some(backend),
            _ => None,
        }
    }

    /// Gets the failure, if any
    pub fn error(&self) -> Option<&LoadError> {
        match self {
            ModelLifecycleState::Failed(error) => Some(error),
            _ => None,
        }
    }
}

impl fmt::Display for ModelLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelLifecycleState::Unloaded => write!(f, "unloaded"),
            ModelLifecycleState::Fetching(progress) => write!(f, "fetching ({})", progress),
            ModelLifecycleState::Compiling => write!(f, "compiling"),
            ModelLifecycleState::Ready(backend) => write!(f, "ready ({})", backend.variant()),
            ModelLifecycleState::Failed(error) => write!(f, "failed: {}", error),
        }
    }
}
