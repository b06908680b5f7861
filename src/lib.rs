//! Main integration module for Image Recognizer
//!
//! This module wires the recognition workspace together: it builds the artifact
//! cache, the fetcher, the local runtime and the lifecycle manager from
//! settings, and hands out a pipeline for the configured model.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use common::error::InferError;
use common::AggregatedPrediction;
use inference_engine::{Frame, InferenceBackend, PrototypeRuntime};
use model_manager::{HttpModelFetcher, LoadOptions, ModelLifecycleManager, RemoteModelRegistry};
use recognition_core::RecognitionPipeline;
use settings::{RecognitionSettings, SettingsManager};
use storage_adapter::FilesystemBlobStore;

/// Recognition facade for one configured model
pub struct Recognizer {
    /// Settings the recognizer was built from
    settings: RecognitionSettings,

    /// Lifecycle manager
    manager: Arc<ModelLifecycleManager>,

    /// Pipeline for the configured model
    pipeline: Arc<RecognitionPipeline>,
}

impl Recognizer {
    /// Creates a recognizer without a remote model registry
    pub async fn new(settings: RecognitionSettings) -> Result<Self> {
        Self::build(settings, None).await
    }

    /// Creates a recognizer able to resolve remote labelers through `registry`
    pub async fn with_registry(
        settings: RecognitionSettings,
        registry: Arc<dyn RemoteModelRegistry>,
    ) -> Result<Self> {
        Self::build(settings, Some(registry)).await
    }

    async fn build(
        settings: RecognitionSettings,
        registry: Option<Arc<dyn RemoteModelRegistry>>,
    ) -> Result<Self> {
        SettingsManager::validate(&settings)?;
        let model_id = SettingsManager::model_identifier(&settings)?;
        let source = SettingsManager::model_source(&settings)?;

        let store = FilesystemBlobStore::new(&settings.storage.cache_dir)
            .await
            .with_context(|| format!("failed to open model cache at {:?}", settings.storage.cache_dir))?;
        let fetcher = HttpModelFetcher::new(&settings.fetch.user_agent)?;

        let mut manager = ModelLifecycleManager::new(Arc::new(store), Arc::new(fetcher), Arc::new(PrototypeRuntime))
            .with_options(LoadOptions::from_settings(&settings));
        if let Some(registry) = registry {
            manager = manager.with_registry(registry);
        }
        let manager = Arc::new(manager);

        info!("Recognizer configured for model {} ({})", model_id, source);

        let pipeline = Arc::new(RecognitionPipeline::new(manager.clone(), model_id, source, &settings));

        Ok(Self {
            settings,
            manager,
            pipeline,
        })
    }

    /// Loads the configured model
    pub async fn load(&self) -> Result<InferenceBackend> {
        Ok(self.pipeline.load().await?)
    }

    /// Classifies one image file
    pub async fn classify_path(&self, path: &Path) -> Result<Vec<AggregatedPrediction>> {
        let frame = load_frame(path)?;
        Ok(self.pipeline.on_still_image(&frame).await?)
    }

    /// Drops the loaded model, optionally deleting its cached artifacts
    pub async fn invalidate(&self, purge_cache: bool) -> Result<()> {
        self.manager
            .invalidate(self.pipeline.model_id(), purge_cache)
            .await?;
        Ok(())
    }

    /// Gets the pipeline
    pub fn pipeline(&self) -> Arc<RecognitionPipeline> {
        self.pipeline.clone()
    }

    /// Gets the lifecycle manager
    pub fn manager(&self) -> Arc<ModelLifecycleManager> {
        self.manager.clone()
    }

    /// Gets the settings
    pub fn settings(&self) -> &RecognitionSettings {
        &self.settings
    }
}

/// Converts a decoded image into a frame
pub fn frame_from_image(image: &image::DynamicImage) -> Result<Frame, InferError> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    Frame::from_rgb8(width, height, rgb.into_raw())
}

/// Decodes an image file into a frame
pub fn load_frame(path: &Path) -> Result<Frame> {
    let image = image::open(path).with_context(|| format!("failed to decode image {:?}", path))?;
    Ok(frame_from_image(&image)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use image::{Rgb, RgbImage};
    use inference_engine::PrototypeModelSource;
    use model_manager::FakeRemoteRegistry;
    use settings::BackendKind;

    fn write_image(dir: &Path, name: &str, rgb: [u8; 3]) -> PathBuf {
        let path = dir.join(name);
        RgbImage::from_pixel(4, 4, Rgb(rgb)).save(&path).unwrap();
        path
    }

    fn write_model(dir: &Path) -> PathBuf {
        let red = Frame::solid(4, 4, [255, 0, 0]);
        let blue = Frame::solid(4, 4, [0, 0, 255]);
        let source = PrototypeModelSource::from_examples("colors", 4, [("red", &red), ("blue", &blue)]);

        let path = dir.join("colors.json");
        std::fs::write(&path, source.to_json().unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_classifies_bundled_model() {
        let dir = tempfile::tempdir().unwrap();

        let mut settings = RecognitionSettings::default();
        settings.model.identifier = "colors".to_string();
        settings.model.bundled_path = Some(write_model(dir.path()));
        settings.storage.cache_dir = dir.path().join("cache");

        let recognizer = Recognizer::new(settings).await.unwrap();
        recognizer.load().await.unwrap();

        let results = recognizer
            .classify_path(&write_image(dir.path(), "red.png", [250, 10, 10]))
            .await
            .unwrap();
        assert_eq!(results[0].label, "red");

        assert!(dir.path().join("cache").join("colors").exists());
    }

    #[tokio::test]
    async fn test_invalidate_then_reload() {
        let dir = tempfile::tempdir().unwrap();

        let mut settings = RecognitionSettings::default();
        settings.model.identifier = "colors".to_string();
        settings.model.bundled_path = Some(write_model(dir.path()));
        settings.storage.cache_dir = dir.path().join("cache");

        let recognizer = Recognizer::new(settings).await.unwrap();
        recognizer.load().await.unwrap();

        recognizer.invalidate(true).await.unwrap();
        assert!(!recognizer.pipeline().model_state().is_ready());

        recognizer.load().await.unwrap();
        assert!(recognizer.pipeline().model_state().is_ready());
    }

    #[tokio::test]
    async fn test_remote_labeler_through_registry() {
        let dir = tempfile::tempdir().unwrap();

        let registry = Arc::new(FakeRemoteRegistry::new());
        registry.publish("birds", [("Sparrow", 0.7), ("Robin", 0.1)]);
        registry.set_complete_on_request(true);

        let mut settings = RecognitionSettings::default();
        settings.model.identifier = "birds".to_string();
        settings.model.backend = BackendKind::RemoteLabeler;
        settings.model.detection_threshold = 0.5;
        settings.storage.cache_dir = dir.path().join("cache");

        let recognizer = Recognizer::with_registry(settings, registry).await.unwrap();
        recognizer.load().await.unwrap();

        let results = recognizer
            .classify_path(&write_image(dir.path(), "bird.png", [90, 80, 70]))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].label, "Sparrow");
    }

    #[tokio::test]
    async fn test_local_backend_needs_a_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = RecognitionSettings::default();
        settings.storage.cache_dir = dir.path().join("cache");

        assert!(Recognizer::new(settings).await.is_err());
    }
}
