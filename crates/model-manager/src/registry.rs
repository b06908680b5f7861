//! Remote model registry contract
//!
//! This module provides the contract for cloud-registered labelers that a
//! platform download manager brings onto the device, and an in-process
//! registry implementing it.
//!
//! Completion is delivered through a [`DownloadWatch`] obtained per load. The
//! watch keeps the latest status, so a download that finished before the
//! caller looked is still observed as finished.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info};

use common::error::{FetchError, InferError};
use common::FetchProgress;
use inference_engine::{Frame, OnDeviceLabeler};

/// Network conditions under which the platform may download a model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadConditions {
    /// Download over metered connections
    pub allow_cellular: bool,
    /// Continue while the application is in the background
    pub allow_background: bool,
}

impl Default for DownloadConditions {
    fn default() -> Self {
        Self {
            allow_cellular: true,
            allow_background: true,
        }
    }
}

/// Status of a registry download
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadStatus {
    /// Requested but not started
    Pending,
    /// Bytes are arriving
    InProgress(FetchProgress),
    /// The model is resident on the device
    Completed,
    /// The download failed
    Failed(String),
}

/// Single-use subscription to one model's download status
#[derive(Debug)]
pub struct DownloadWatch {
    receiver: watch::Receiver<DownloadStatus>,
}

impl DownloadWatch {
    /// Wraps a status receiver
    pub fn new(receiver: watch::Receiver<DownloadStatus>) -> Self {
        Self { receiver }
    }

    /// Gets the latest status
    pub fn current(&self) -> DownloadStatus {
        self.receiver.borrow().clone()
    }

    /// Waits for the download to finish, forwarding progress on the way
    ///
    /// The watch is consumed, which deregisters the listener.
    pub async fn finished(mut self, on_progress: impl Fn(FetchProgress)) -> Result<(), String> {
        loop {
            let status = self.receiver.borrow_and_update().clone();
            match status {
                DownloadStatus::Completed => return Ok(()),
                DownloadStatus::Failed(reason) => return Err(reason),
                DownloadStatus::InProgress(progress) => on_progress(progress),
                DownloadStatus::Pending => {}
            }

            if self.receiver.changed().await.is_err() {
                return Err("download status channel closed".to_string());
            }
        }
    }
}

/// Platform registry of cloud-trained labelers
#[async_trait]
pub trait RemoteModelRegistry: Send + Sync {
    /// Registers a model by name so it can be downloaded
    async fn register(&self, name: &str, conditions: DownloadConditions) -> Result<(), FetchError>;

    /// Returns true if the model files are on the device
    ///
    /// The answer may lag behind download completion.
    fn is_resident(&self, name: &str) -> bool;

    /// Requests a download and subscribes to its status
    async fn download(&self, name: &str) -> Result<DownloadWatch, FetchError>;

    /// Opens the resident labeler
    async fn open_labeler(
        &self,
        name: &str,
        confidence_threshold: f32,
    ) -> Result<Arc<dyn OnDeviceLabeler>, FetchError>;
}

struct FakeModel {
    labels: Vec<(String, f32)>,
    registered: bool,
    resident: Arc<AtomicBool>,
    status: watch::Sender<DownloadStatus>,
}

/// In-process registry
///
/// Models are published with canned labels and become resident when
/// [`FakeRemoteRegistry::complete`] is called. Used by tests and the CLI demo
/// mode.
#[derive(Default)]
pub struct FakeRemoteRegistry {
    models: DashMap<String, FakeModel>,
    /// Report every model as absent regardless of its download status
    stale_residency: AtomicBool,
    /// Complete downloads as soon as they are requested
    complete_on_request: AtomicBool,
    downloads: AtomicUsize,
}

impl FakeRemoteRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a model available for registration
    pub fn publish<I, S>(&self, name: &str, labels: I)
    where
        I: IntoIterator<Item = (S, f32)>,
        S: Into<String>,
    {
        let (status, _) = watch::channel(DownloadStatus::Pending);
        self.models.insert(
            name.to_string(),
            FakeModel {
                labels: labels.into_iter().map(|(l, c)| (l.into(), c)).collect(),
                registered: false,
                resident: Arc::new(AtomicBool::new(false)),
                status,
            },
        );
    }

    /// Makes residency checks always answer false
    pub fn set_stale_residency(&self, stale: bool) {
        self.stale_residency.store(stale, Ordering::SeqCst);
    }

    /// Finishes every download at the moment it is requested
    pub fn set_complete_on_request(&self, enabled: bool) {
        self.complete_on_request.store(enabled, Ordering::SeqCst);
    }

    /// Reports download progress
    pub fn progress(&self, name: &str, progress: FetchProgress) {
        if let Some(model) = self.models.get(name) {
            model.status.send_replace(DownloadStatus::InProgress(progress));
        }
    }

    /// Marks the model resident and completes its download
    pub fn complete(&self, name: &str) {
        if let Some(model) = self.models.get(name) {
            model.resident.store(true, Ordering::SeqCst);
            model.status.send_replace(DownloadStatus::Completed);
        }
    }

    /// Fails the model's download
    pub fn fail(&self, name: &str, reason: &str) {
        if let Some(model) = self.models.get(name) {
            model.status.send_replace(DownloadStatus::Failed(reason.to_string()));
        }
    }

    /// Removes the model files from the device
    pub fn evict(&self, name: &str) {
        if let Some(model) = self.models.get(name) {
            model.resident.store(false, Ordering::SeqCst);
            model.status.send_replace(DownloadStatus::Pending);
        }
    }

    /// Gets the number of live status listeners for a model
    pub fn listener_count(&self, name: &str) -> usize {
        self.models
            .get(name)
            .map(|model| model.status.receiver_count())
            .unwrap_or(0)
    }

    /// Gets the number of download requests received
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn unknown(name: &str) -> FetchError {
        FetchError::Transport(format!("model {} is not published", name))
    }
}

#[async_trait]
impl RemoteModelRegistry for FakeRemoteRegistry {
    async fn register(&self, name: &str, conditions: DownloadConditions) -> Result<(), FetchError> {
        let mut model = self.models.get_mut(name).ok_or_else(|| Self::unknown(name))?;
        model.registered = true;
        debug!("Registered remote model {} ({:?})", name, conditions);
        Ok(())
    }

    fn is_resident(&self, name: &str) -> bool {
        if self.stale_residency.load(Ordering::SeqCst) {
            return false;
        }
        self.models
            .get(name)
            .map(|model| model.resident.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    async fn download(&self, name: &str) -> Result<DownloadWatch, FetchError> {
        let model = self.models.get(name).ok_or_else(|| Self::unknown(name))?;
        if !model.registered {
            return Err(FetchError::Transport(format!("model {} is not registered", name)));
        }

        self.downloads.fetch_add(1, Ordering::SeqCst);

        if self.complete_on_request.load(Ordering::SeqCst) {
            model.resident.store(true, Ordering::SeqCst);
            model.status.send_replace(DownloadStatus::Completed);
        }

        info!("Download requested for remote model {}", name);
        Ok(DownloadWatch::new(model.status.subscribe()))
    }

    async fn open_labeler(
        &self,
        name: &str,
        confidence_threshold: f32,
    ) -> Result<Arc<dyn OnDeviceLabeler>, FetchError> {
        let model = self.models.get(name).ok_or_else(|| Self::unknown(name))?;
        if !model.resident.load(Ordering::SeqCst) {
            return Err(FetchError::Transport(format!("model {} is not on the device", name)));
        }

        Ok(Arc::new(CannedLabeler {
            name: name.to_string(),
            labels: model.labels.clone(),
            confidence_threshold,
            resident: model.resident.clone(),
        }))
    }
}

/// Labeler answering every frame with the same labels
struct CannedLabeler {
    name: String,
    labels: Vec<(String, f32)>,
    confidence_threshold: f32,
    resident: Arc<AtomicBool>,
}

#[async_trait]
impl OnDeviceLabeler for CannedLabeler {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn is_resident(&self) -> bool {
        self.resident.load(Ordering::SeqCst)
    }

    async fn label(&self, _frame: &Frame, confidence_threshold: f32) -> Result<Vec<(String, f32)>, InferError> {
        let threshold = confidence_threshold.max(self.confidence_threshold);
        Ok(self
            .labels
            .iter()
            .filter(|(_, confidence)| *confidence >= threshold)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watch_sees_completion_published_before_subscribing() {
        let registry = FakeRemoteRegistry::new();
        registry.publish("birds", [("robin", 0.9)]);
        registry.register("birds", DownloadConditions::default()).await.unwrap();
        registry.complete("birds");

        let watch = registry.download("birds").await.unwrap();
        assert_eq!(watch.current(), DownloadStatus::Completed);
        assert_eq!(registry.listener_count("birds"), 1);

        watch.finished(|_| {}).await.unwrap();
        assert_eq!(registry.listener_count("birds"), 0);
    }

    #[tokio::test]
    async fn test_watch_forwards_progress_then_failure() {
        let registry = Arc::new(FakeRemoteRegistry::new());
        registry.publish("birds", [("robin", 0.9)]);
        registry.register("birds", DownloadConditions::default()).await.unwrap();
        let watch = registry.download("birds").await.unwrap();

        let driver = registry.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            driver.progress(
                "birds",
                FetchProgress {
                    received_bytes: 10,
                    total_bytes: Some(20),
                },
            );
            tokio::task::yield_now().await;
            driver.fail("birds", "quota exceeded");
        });

        let result = watch.finished(|_| {}).await;
        assert_eq!(result, Err("quota exceeded".to_string()));
    }

    #[tokio::test]
    async fn test_download_requires_registration() {
        let registry = FakeRemoteRegistry::new();
        registry.publish("birds", [("robin", 0.9)]);
        assert!(registry.download("birds").await.is_err());
        assert!(registry.download("fish").await.is_err());
    }

    #[tokio::test]
    async fn test_opened_labeler_applies_threshold() {
        let registry = FakeRemoteRegistry::new();
        registry.publish("birds", [("robin", 0.9), ("wren", 0.3)]);
        registry.complete("birds");

        let labeler = registry.open_labeler("birds", 0.5).await.unwrap();
        let labels = labeler.label(&Frame::solid(1, 1, [0, 0, 0]), 0.0).await.unwrap();
        assert_eq!(labels, vec![("robin".to_string(), 0.9)]);

        registry.evict("birds");
        assert!(!labeler.is_resident());
    }
}
