//! Inference backends
//!
//! This module provides the closed set of backends the recognition pipeline can
//! drive. A backend value is only handed out by the lifecycle manager once the
//! model is ready; invalidating the model flips a shared flag so every clone
//! held elsewhere starts answering `ModelNotReady`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::trace;

use common::error::InferError;
use common::{ModelIdentifier, RawPrediction};

use crate::frame::Frame;
use crate::remote::RemoteLabelerBackend;
use crate::runtime::LocalModel;

/// Local results at or below this confidence are discarded
pub const DEFAULT_CONFIDENCE_FLOOR: f32 = 0.2;

/// Which kind of backend is behind an [`InferenceBackend`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendVariant {
    /// Model compiled and executed in process
    Local,
    /// Cloud-registered model executed on device
    RemoteLabeler,
}

impl fmt::Display for BackendVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendVariant::Local => write!(f, "local"),
            BackendVariant::RemoteLabeler => write!(f, "remote-labeler"),
        }
    }
}

/// Backend for a model executed in process
#[derive(Clone)]
pub struct LocalBackend {
    /// Model identifier
    model_id: ModelIdentifier,
    /// Instantiated model
    model: Arc<dyn LocalModel>,
    /// Results must be strictly above this confidence
    confidence_floor: f32,
    /// Cleared when the lifecycle manager invalidates the model
    valid: Arc<AtomicBool>,
}

impl LocalBackend {
    /// Creates a backend using [`DEFAULT_CONFIDENCE_FLOOR`]
    pub fn new(model_id: ModelIdentifier, model: Arc<dyn LocalModel>) -> Self {
        Self {
            model_id,
            model,
            confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Overrides the confidence floor
    pub fn with_confidence_floor(mut self, floor: f32) -> Self {
        self.confidence_floor = floor;
        self
    }

    /// Gets the model identifier
    pub fn model_id(&self) -> &ModelIdentifier {
        &self.model_id
    }

    /// Gets the confidence floor
    pub fn confidence_floor(&self) -> f32 {
        self.confidence_floor
    }

    /// Classifies one frame on a blocking worker
    pub async fn recognize(&self, frame: &Frame) -> Result<Vec<RawPrediction>, InferError> {
        if !self.valid.load(Ordering::SeqCst) {
            return Err(InferError::ModelNotReady);
        }

        let model = self.model.clone();
        let frame = frame.clone();
        let scores = tokio::task::spawn_blocking(move || model.classify(&frame))
            .await
            .map_err(|e| InferError::Backend(format!("inference worker failed: {}", e)))??;

        let observed_at = Utc::now();
        let floor = self.confidence_floor;

        let predictions: Vec<RawPrediction> = scores
            .into_iter()
            .filter(|(_, confidence)| *confidence > floor)
            .map(|(label, confidence)| RawPrediction::new(label, confidence.clamp(0.0, 1.0), observed_at))
            .collect();

        trace!(model_id = %self.model_id, count = predictions.len(), "Local model produced predictions");

        Ok(predictions)
    }
}

impl fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBackend")
            .field("model_id", &self.model_id)
            .field("model", &self.model.name())
            .field("confidence_floor", &self.confidence_floor)
            .finish()
    }
}

/// A ready backend
#[derive(Debug, Clone)]
pub enum InferenceBackend {
    /// In-process model
    Local(LocalBackend),
    /// On-device copy of a cloud-registered model
    RemoteLabeler(RemoteLabelerBackend),
}

impl InferenceBackend {
    /// Gets the backend variant
    pub fn variant(&self) -> BackendVariant {
        match self {
            InferenceBackend::Local(_) => BackendVariant::Local,
            InferenceBackend::RemoteLabeler(_) => BackendVariant::RemoteLabeler,
        }
    }

    /// Gets the model identifier
    pub fn model_id(&self) -> &ModelIdentifier {
        match self {
            InferenceBackend::Local(backend) => backend.model_id(),
            InferenceBackend::RemoteLabeler(backend) => backend.model_id(),
        }
    }

    /// Recognizes one frame
    ///
    /// Returns `ModelNotReady` once the backend has been invalidated.
    pub async fn recognize(&self, frame: &Frame) -> Result<Vec<RawPrediction>, InferError> {
        match self {
            InferenceBackend::Local(backend) => backend.recognize(frame).await,
            InferenceBackend::RemoteLabeler(backend) => backend.recognize(frame).await,
        }
    }

    /// Marks this backend and all its clones unusable
    pub fn invalidate(&self) {
        match self {
            InferenceBackend::Local(backend) => backend.valid.store(false, Ordering::SeqCst),
            InferenceBackend::RemoteLabeler(backend) => backend.invalidate(),
        }
    }

    /// Returns true until the backend is invalidated or its model is evicted
    pub fn is_valid(&self) -> bool {
        match self {
            InferenceBackend::Local(backend) => backend.valid.load(Ordering::SeqCst),
            InferenceBackend::RemoteLabeler(backend) => backend.is_valid(),
        }
    }

    /// Returns true when both values are clones of the same loaded backend
    pub fn same_instance(&self, other: &InferenceBackend) -> bool {
        match (self, other) {
            (InferenceBackend::Local(a), InferenceBackend::Local(b)) => Arc::ptr_eq(&a.valid, &b.valid),
            (InferenceBackend::RemoteLabeler(a), InferenceBackend::RemoteLabeler(b)) => a.same_instance(b),
            _ => false,
        }
    }
}

impl From<LocalBackend> for InferenceBackend {
    fn from(backend: LocalBackend) -> Self {
        InferenceBackend::Local(backend)
    }
}

impl From<RemoteLabelerBackend> for InferenceBackend {
    fn from(backend: RemoteLabelerBackend) -> Self {
        InferenceBackend::RemoteLabeler(backend)
    }
}
