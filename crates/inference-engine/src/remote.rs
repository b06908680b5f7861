//! Remote labeler backend
//!
//! A cloud-trained labeler is downloaded by a platform download manager and then
//! runs on the device. The backend only forwards frames to it and applies the
//! configured confidence threshold.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::trace;

use common::error::InferError;
use common::{ModelIdentifier, RawPrediction};

use crate::frame::Frame;

/// On-device copy of a cloud-registered labeler
#[async_trait]
pub trait OnDeviceLabeler: Send + Sync {
    /// Gets the registered model name
    fn model_name(&self) -> &str;

    /// Returns true while the model files are present on the device
    fn is_resident(&self) -> bool;

    /// Labels one frame, returning `(label, confidence)` pairs
    async fn label(&self, frame: &Frame, confidence_threshold: f32) -> Result<Vec<(String, f32)>, InferError>;
}

/// Backend delegating to an [`OnDeviceLabeler`]
#[derive(Clone)]
pub struct RemoteLabelerBackend {
    /// Model identifier
    model_id: ModelIdentifier,
    /// Resident labeler
    labeler: Arc<dyn OnDeviceLabeler>,
    /// Results below this confidence are dropped
    confidence_threshold: f32,
    /// Cleared when the lifecycle manager invalidates the model
    valid: Arc<AtomicBool>,
}

impl RemoteLabelerBackend {
    /// Creates a backend for a resident labeler
    pub fn new(model_id: ModelIdentifier, labeler: Arc<dyn OnDeviceLabeler>, confidence_threshold: f32) -> Self {
        Self {
            model_id,
            labeler,
            confidence_threshold,
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Gets the model identifier
    pub fn model_id(&self) -> &ModelIdentifier {
        &self.model_id
    }

    /// Gets the configured confidence threshold
    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst) && self.labeler.is_resident()
    }

    pub(crate) fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.valid, &other.valid)
    }

    /// Labels one frame
    pub async fn recognize(&self, frame: &Frame) -> Result<Vec<RawPrediction>, InferError> {
        if !self.is_valid() {
            return Err(InferError::ModelNotReady);
        }

        let labels = self.labeler.label(frame, self.confidence_threshold).await?;
        let observed_at = Utc::now();

        let predictions: Vec<RawPrediction> = labels
            .into_iter()
            .filter(|(_, confidence)| *confidence >= self.confidence_threshold)
            .map(|(label, confidence)| RawPrediction::new(label, confidence.clamp(0.0, 1.0), observed_at))
            .collect();

        trace!(model_id = %self.model_id, count = predictions.len(), "Remote labeler produced predictions");

        Ok(predictions)
    }
}

impl fmt::Debug for RemoteLabelerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteLabelerBackend")
            .field("model_id", &self.model_id)
            .field("model_name", &self.labeler.model_name())
            .field("confidence_threshold", &self.confidence_threshold)
            .finish()
    }
}
