//! Model lifecycle manager
//!
//! This module provides functionality for turning a model identifier into a ready
//! inference backend: cache lookup, self-healing of corrupt compiled artifacts,
//! fetching, compiling and remote labeler downloads.
//!
//! Every identifier owns one slot holding the authoritative state and at most
//! one in-flight load. The load runs on its own task, so it keeps going when the
//! callers waiting on it go away; every concurrent caller awaits the same shared
//! result.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use common::error::{FetchError, LoadError};
use common::utils::format_duration;
use common::{ArtifactKind, FetchProgress, ModelArtifact, ModelIdentifier, ModelSource};
use inference_engine::{
    InferenceBackend, InstantiateError, LocalBackend, LocalModelRuntime, RemoteLabelerBackend,
    DEFAULT_CONFIDENCE_FLOOR,
};
use settings::RecognitionSettings;
use storage_adapter::ModelBlobStore;

use crate::fetcher::{verify_sha256, ModelFetcher};
use crate::registry::{DownloadConditions, RemoteModelRegistry};
use crate::state::ModelLifecycleState;

type SharedLoad = Shared<BoxFuture<'static, Result<InferenceBackend, LoadError>>>;

/// Options applied to every load
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Upper bound on one fetch or registry download
    pub fetch_timeout: Option<Duration>,
    /// Expected SHA-256 of fetched artifacts, hex encoded
    pub expected_sha256: Option<String>,
    /// Confidence floor for local backends
    pub local_confidence_floor: f32,
    /// Conditions passed when registering remote labelers
    pub download_conditions: DownloadConditions,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            fetch_timeout: Some(Duration::from_secs(300)),
            expected_sha256: None,
            local_confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
            download_conditions: DownloadConditions::default(),
        }
    }
}

impl LoadOptions {
    /// Creates load options from settings
    pub fn from_settings(settings: &RecognitionSettings) -> Self {
        Self {
            fetch_timeout: settings.fetch.timeout(),
            expected_sha256: settings.fetch.expected_sha256.clone(),
            local_confidence_floor: settings.model.local_confidence_floor,
            download_conditions: DownloadConditions::default(),
        }
    }
}

struct ModelSlot {
    /// Authoritative state
    state: watch::Sender<ModelLifecycleState>,
    /// Load currently running for this identifier
    inflight: Mutex<Option<SharedLoad>>,
    /// Digest of the last source artifact that failed to compile, with the error
    failed_compile: Mutex<Option<(String, LoadError)>>,
}

impl ModelSlot {
    fn new() -> Self {
        let (state, _) = watch::channel(ModelLifecycleState::Unloaded);
        Self {
            state,
            inflight: Mutex::new(None),
            failed_compile: Mutex::new(None),
        }
    }

    fn current(&self) -> ModelLifecycleState {
        self.state.borrow().clone()
    }

    fn publish(&self, id: &ModelIdentifier, state: ModelLifecycleState) {
        debug!(model_id = %id, "Model state: {}", state);
        self.state.send_replace(state);
    }

    fn update_progress(&self, progress: FetchProgress) {
        trace!("Fetch progress: {}", progress);
        self.state.send_replace(ModelLifecycleState::Fetching(progress));
    }

    /// Publishes the outcome and releases the in-flight slot
    fn finish(&self, id: &ModelIdentifier, result: &Result<InferenceBackend, LoadError>) {
        let mut inflight = self.inflight.lock();
        let next = match result {
            Ok(backend) => ModelLifecycleState::Ready(backend.clone()),
            Err(e) => {
                if e.is_transient() {
                    warn!("Load of model {} failed, a retry may succeed: {}", id, e);
                }
                ModelLifecycleState::Failed(e.clone())
            }
        };
        self.publish(id, next);
        *inflight = None;
    }
}

#[derive(Clone)]
struct LoadContext {
    store: Arc<dyn ModelBlobStore>,
    fetcher: Arc<dyn ModelFetcher>,
    runtime: Arc<dyn LocalModelRuntime>,
    registry: Option<Arc<dyn RemoteModelRegistry>>,
    options: LoadOptions,
}

/// Produces ready inference backends, once per model identifier
pub struct ModelLifecycleManager {
    /// Capabilities shared with load tasks
    context: LoadContext,

    /// Per-identifier state
    slots: DashMap<ModelIdentifier, Arc<ModelSlot>>,
}

impl ModelLifecycleManager {
    /// Creates a new manager with default load options
    pub fn new(
        store: Arc<dyn ModelBlobStore>,
        fetcher: Arc<dyn ModelFetcher>,
        runtime: Arc<dyn LocalModelRuntime>,
    ) -> Self {
        Self {
            context: LoadContext {
                store,
                fetcher,
                runtime,
                registry: None,
                options: LoadOptions::default(),
            },
            slots: DashMap::new(),
        }
    }

    /// Enables remote labeler loads through `registry`
    pub fn with_registry(mut self, registry: Arc<dyn RemoteModelRegistry>) -> Self {
        self.context.registry = Some(registry);
        self
    }

    /// Replaces the load options
    pub fn with_options(mut self, options: LoadOptions) -> Self {
        self.context.options = options;
        self
    }

    /// Gets the load options
    pub fn options(&self) -> &LoadOptions {
        &self.context.options
    }

    fn slot(&self, id: &ModelIdentifier) -> Arc<ModelSlot> {
        self.slots
            .entry(id.clone())
            .or_insert_with(|| Arc::new(ModelSlot::new()))
            .clone()
    }

    /// Gets the current state of a model
    pub fn state(&self, id: &ModelIdentifier) -> ModelLifecycleState {
        self.slots
            .get(id)
            .map(|slot| slot.current())
            .unwrap_or_default()
    }

    /// Subscribes to state changes of a model
    pub fn subscribe(&self, id: &ModelIdentifier) -> watch::Receiver<ModelLifecycleState> {
        self.slot(id).state.subscribe()
    }

    /// Loads a model, returning its ready backend
    ///
    /// A ready model is returned without any work. While a load for `id` is in
    /// flight, further calls wait for that load instead of starting another. A
    /// failed model is retried from `Unloaded`.
    pub async fn load(&self, id: &ModelIdentifier, source: &ModelSource) -> Result<InferenceBackend, LoadError> {
        let slot = self.slot(id);

        let pending = {
            let mut inflight = slot.inflight.lock();
            let current = slot.current();

            if let Some(backend) = current.backend() {
                if backend.is_valid() {
                    return Ok(backend.clone());
                }
                warn!("Backend for model {} is no longer usable; reloading", id);
                slot.publish(id, ModelLifecycleState::Unloaded);
            }

            match inflight.as_ref() {
                Some(load) => {
                    debug!("Attaching to in-flight load of model {}", id);
                    load.clone()
                }
                None => {
                    if current.error().is_some() {
                        slot.publish(id, ModelLifecycleState::Unloaded);
                    }

                    info!("Loading model {} from {}", id, source);
                    let load = self.spawn_load(id.clone(), source.clone(), slot.clone());
                    *inflight = Some(load.clone());
                    load
                }
            }
        };

        pending.await
    }

    fn spawn_load(&self, id: ModelIdentifier, source: ModelSource, slot: Arc<ModelSlot>) -> SharedLoad {
        let context = self.context.clone();
        let task_slot = slot.clone();
        let task_id = id.clone();

        let handle = tokio::spawn(async move {
            let result = context.run(&task_id, &source, &task_slot).await;
            task_slot.finish(&task_id, &result);
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!("Load task for model {} ended abnormally: {}", id, e);
                    let result: Result<InferenceBackend, LoadError> = Err(LoadError::Interrupted {
                        model_id: id.to_string(),
                        reason: e.to_string(),
                    });
                    slot.finish(&id, &result);
                    result
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Resets a model to `Unloaded`
    ///
    /// A ready backend is invalidated, so clones held elsewhere start failing
    /// with `ModelNotReady`. With `purge_cache` the cached artifacts are deleted
    /// too. A model that is currently loading is left alone.
    pub async fn invalidate(&self, id: &ModelIdentifier, purge_cache: bool) -> Result<(), LoadError> {
        let slot = self.slot(id);

        {
            let inflight = slot.inflight.lock();
            if inflight.is_some() {
                warn!("Model {} is loading; invalidation skipped", id);
                return Ok(());
            }

            let current = slot.current();
            if let Some(backend) = current.backend() {
                backend.invalidate();
            }
            if !matches!(current, ModelLifecycleState::Unloaded) {
                info!("Invalidated model {}", id);
                slot.publish(id, ModelLifecycleState::Unloaded);
            }
        }

        if purge_cache {
            *slot.failed_compile.lock() = None;
            for kind in [ArtifactKind::Source, ArtifactKind::Compiled] {
                self.context
                    .store
                    .delete(id, kind)
                    .await
                    .map_err(|e| storage_error(id, e))?;
            }
            info!("Purged cached artifacts for model {}", id);
        }

        Ok(())
    }
}

impl LoadContext {
    async fn run(
        &self,
        id: &ModelIdentifier,
        source: &ModelSource,
        slot: &ModelSlot,
    ) -> Result<InferenceBackend, LoadError> {
        match source {
            ModelSource::RemoteLabeler { confidence_threshold } => {
                self.load_remote_labeler(id, *confidence_threshold, slot).await
            }
            ModelSource::Bundled(_) | ModelSource::Remote { .. } => self.load_local(id, source, slot).await,
        }
    }

    async fn load_local(
        &self,
        id: &ModelIdentifier,
        source: &ModelSource,
        slot: &ModelSlot,
    ) -> Result<InferenceBackend, LoadError> {
        if self.exists(id, ArtifactKind::Compiled).await? {
            let compiled = self.read(id, ArtifactKind::Compiled).await?;
            match self.instantiate(id, compiled.bytes).await? {
                Ok(backend) => {
                    info!("Model {} loaded from cached compiled artifact", id);
                    return Ok(backend);
                }
                Err(InstantiateError::Corrupt(reason)) => {
                    warn!("Discarding corrupt compiled artifact for model {}: {}", id, reason);
                    self.delete(id, ArtifactKind::Compiled).await?;
                }
            }
        }

        if self.exists(id, ArtifactKind::Source).await? {
            let cached = self.read(id, ArtifactKind::Source).await?;
            return self.compile_source(id, cached, slot).await;
        }

        let artifact = match source {
            ModelSource::Remote { url } => {
                ModelArtifact::new(ArtifactKind::from_path(url), self.fetch(id, url, slot).await?)
            }
            ModelSource::Bundled(path) => {
                let bytes = match tokio::fs::read(path).await {
                    Ok(bytes) => bytes,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        warn!("No cached or bundled artifact for model {} at {}", id, path.display());
                        return Err(LoadError::MissingArtifact {
                            model_id: id.to_string(),
                        });
                    }
                    Err(e) => return Err(storage_error(id, e)),
                };
                ModelArtifact::new(ArtifactKind::from_path(&path.to_string_lossy()), bytes)
            }
            ModelSource::RemoteLabeler { .. } => {
                return Err(LoadError::BackendUnavailable {
                    model_id: id.to_string(),
                    reason: "remote labeler sources carry no artifact".to_string(),
                })
            }
        };

        self.write(id, artifact.kind, &artifact.bytes).await?;

        match artifact.kind {
            ArtifactKind::Source => self.compile_source(id, artifact, slot).await,
            ArtifactKind::Compiled => match self.instantiate(id, artifact.bytes).await? {
                Ok(backend) => {
                    info!("Model {} loaded from compiled artifact", id);
                    Ok(backend)
                }
                Err(InstantiateError::Corrupt(reason)) => {
                    self.delete(id, ArtifactKind::Compiled).await?;
                    Err(LoadError::CompileFailed {
                        model_id: id.to_string(),
                        reason: format!("invalid compiled artifact: {}", reason),
                    })
                }
            },
        }
    }

    async fn compile_source(
        &self,
        id: &ModelIdentifier,
        source: ModelArtifact,
        slot: &ModelSlot,
    ) -> Result<InferenceBackend, LoadError> {
        let digest = hex::encode(Sha256::digest(&source.bytes));

        let memo = slot.failed_compile.lock().clone();
        if let Some((failed_digest, error)) = memo {
            if failed_digest == digest {
                debug!("Source artifact of model {} already failed to compile", id);
                return Err(error);
            }
        }

        slot.publish(id, ModelLifecycleState::Compiling);
        info!("Compiling model {} ({})", id, source.size());

        let runtime = self.runtime.clone();
        let compiled = tokio::task::spawn_blocking(move || runtime.compile(source))
            .await
            .map_err(|e| interrupted(id, e))?;

        let compiled = match compiled {
            Ok(compiled) => compiled,
            Err(e) => {
                error!("Compiling model {} failed: {}", id, e);
                return Err(remember_compile_failure(slot, id, digest, e.to_string()));
            }
        };

        self.write(id, ArtifactKind::Compiled, &compiled).await?;

        match self.instantiate(id, compiled).await? {
            Ok(backend) => {
                info!("Model {} compiled and ready", id);
                Ok(backend)
            }
            Err(InstantiateError::Corrupt(reason)) => {
                self.delete(id, ArtifactKind::Compiled).await?;
                Err(remember_compile_failure(
                    slot,
                    id,
                    digest,
                    format!("compiled output rejected: {}", reason),
                ))
            }
        }
    }

    async fn instantiate(
        &self,
        id: &ModelIdentifier,
        compiled: Vec<u8>,
    ) -> Result<Result<InferenceBackend, InstantiateError>, LoadError> {
        let runtime = self.runtime.clone();
        let model = tokio::task::spawn_blocking(move || runtime.instantiate(&compiled))
            .await
            .map_err(|e| interrupted(id, e))?;

        Ok(model.map(|model| {
            LocalBackend::new(id.clone(), model)
                .with_confidence_floor(self.options.local_confidence_floor)
                .into()
        }))
    }

    async fn fetch(&self, id: &ModelIdentifier, url: &str, slot: &ModelSlot) -> Result<Vec<u8>, LoadError> {
        slot.publish(id, ModelLifecycleState::Fetching(FetchProgress::default()));

        let progress = |p: FetchProgress| slot.update_progress(p);
        let fetch = self.fetcher.fetch(url, &progress);

        let result = match self.options.fetch_timeout {
            Some(limit) => match tokio::time::timeout(limit, fetch).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::TimedOut(format_duration(limit))),
            },
            None => fetch.await,
        };

        let bytes = result.map_err(|e| fetch_failed(id, e))?;

        if let Some(expected) = &self.options.expected_sha256 {
            verify_sha256(&bytes, expected).map_err(|e| fetch_failed(id, e))?;
            debug!("Checksum verification passed for model {}", id);
        }

        Ok(bytes)
    }

    async fn load_remote_labeler(
        &self,
        id: &ModelIdentifier,
        confidence_threshold: f32,
        slot: &ModelSlot,
    ) -> Result<InferenceBackend, LoadError> {
        let registry = self.registry.as_ref().ok_or_else(|| LoadError::BackendUnavailable {
            model_id: id.to_string(),
            reason: "no remote model registry configured".to_string(),
        })?;
        let name = id.as_str();

        registry
            .register(name, self.options.download_conditions)
            .await
            .map_err(|e| fetch_failed(id, e))?;

        // Subscribe before the residency check so an early completion is kept
        let watch = registry.download(name).await.map_err(|e| fetch_failed(id, e))?;

        if registry.is_resident(name) {
            debug!("Remote model {} already resident", id);
            drop(watch);
        } else {
            slot.publish(id, ModelLifecycleState::Fetching(FetchProgress::default()));
            let finished = watch.finished(|p| slot.update_progress(p));

            let outcome = match self.options.fetch_timeout {
                Some(limit) => match tokio::time::timeout(limit, finished).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(FetchError::TimedOut(format_duration(limit)).to_string()),
                },
                None => finished.await,
            };

            outcome.map_err(|reason| LoadError::FetchFailed {
                model_id: id.to_string(),
                reason,
            })?;
        }

        let labeler = registry
            .open_labeler(name, confidence_threshold)
            .await
            .map_err(|e| fetch_failed(id, e))?;

        info!("Remote labeler {} ready", id);
        Ok(RemoteLabelerBackend::new(id.clone(), labeler, confidence_threshold).into())
    }

    async fn exists(&self, id: &ModelIdentifier, kind: ArtifactKind) -> Result<bool, LoadError> {
        self.store.exists(id, kind).await.map_err(|e| storage_error(id, e))
    }

    async fn read(&self, id: &ModelIdentifier, kind: ArtifactKind) -> Result<ModelArtifact, LoadError> {
        self.store
            .read(id, kind)
            .await
            .map(|bytes| ModelArtifact::new(kind, bytes))
            .map_err(|e| storage_error(id, e))
    }

    async fn write(&self, id: &ModelIdentifier, kind: ArtifactKind, bytes: &[u8]) -> Result<(), LoadError> {
        self.store.write(id, kind, bytes).await.map_err(|e| storage_error(id, e))
    }

    async fn delete(&self, id: &ModelIdentifier, kind: ArtifactKind) -> Result<(), LoadError> {
        self.store.delete(id, kind).await.map_err(|e| storage_error(id, e))
    }
}

fn remember_compile_failure(slot: &ModelSlot, id: &ModelIdentifier, digest: String, reason: String) -> LoadError {
    let error = LoadError::CompileFailed {
        model_id: id.to_string(),
        reason,
    };
    *slot.failed_compile.lock() = Some((digest, error.clone()));
    error
}

fn storage_error(id: &ModelIdentifier, e: impl std::fmt::Display) -> LoadError {
    LoadError::Storage {
        model_id: id.to_string(),
        reason: e.to_string(),
    }
}

fn fetch_failed(id: &ModelIdentifier, e: FetchError) -> LoadError {
    LoadError::FetchFailed {
        model_id: id.to_string(),
        reason: e.to_string(),
    }
}

fn interrupted(id: &ModelIdentifier, e: tokio::task::JoinError) -> LoadError {
    LoadError::Interrupted {
        model_id: id.to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use common::error::CompileError;
    use inference_engine::{BackendVariant, Frame, LocalModel, PrototypeModelSource, PrototypeRuntime};
    use storage_adapter::InMemoryBlobStore;

    use crate::registry::FakeRemoteRegistry;

    struct ScriptedFetcher {
        responses: Mutex<VecDeque<Result<Vec<u8>, FetchError>>>,
        fallback: Vec<u8>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn serving(body: Vec<u8>) -> Self {
            Self {
                responses: Mutex::new(VecDeque::new()),
                fallback: body,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn then(self, response: Result<Vec<u8>, FetchError>) -> Self {
            self.responses.lock().push_back(response);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            _url: &str,
            progress: &(dyn Fn(FetchProgress) + Send + Sync),
        ) -> Result<Vec<u8>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            progress(FetchProgress {
                received_bytes: 0,
                total_bytes: Some(self.fallback.len() as u64),
            });
            tokio::time::sleep(self.delay).await;
            let scripted = self.responses.lock().pop_front();
            scripted.unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    #[derive(Default)]
    struct CountingRuntime {
        compiles: AtomicUsize,
    }

    impl CountingRuntime {
        fn compiles(&self) -> usize {
            self.compiles.load(Ordering::SeqCst)
        }
    }

    impl LocalModelRuntime for CountingRuntime {
        fn compile(&self, source: ModelArtifact) -> Result<Vec<u8>, CompileError> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            PrototypeRuntime.compile(source)
        }

        fn instantiate(&self, compiled: &[u8]) -> Result<Arc<dyn LocalModel>, InstantiateError> {
            PrototypeRuntime.instantiate(compiled)
        }
    }

    fn source_bytes() -> Vec<u8> {
        let red = Frame::solid(2, 2, [250, 10, 10]);
        let blue = Frame::solid(2, 2, [10, 10, 250]);
        PrototypeModelSource::from_examples("colors", 2, [("red", &red), ("blue", &blue)])
            .to_json()
            .unwrap()
    }

    fn id() -> ModelIdentifier {
        ModelIdentifier::new("colors").unwrap()
    }

    fn remote(url: &str) -> ModelSource {
        ModelSource::Remote { url: url.to_string() }
    }

    struct Harness {
        store: Arc<InMemoryBlobStore>,
        fetcher: Arc<ScriptedFetcher>,
        runtime: Arc<CountingRuntime>,
    }

    impl Harness {
        fn new(fetcher: ScriptedFetcher) -> Self {
            Self {
                store: Arc::new(InMemoryBlobStore::new()),
                fetcher: Arc::new(fetcher),
                runtime: Arc::new(CountingRuntime::default()),
            }
        }

        fn manager(&self) -> ModelLifecycleManager {
            ModelLifecycleManager::new(self.store.clone(), self.fetcher.clone(), self.runtime.clone())
        }
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_fetch_and_compile() {
        let harness = Harness::new(ScriptedFetcher::serving(source_bytes()).with_delay(Duration::from_millis(50)));
        let manager = harness.manager();
        let source = remote("https://models.example.com/colors.json");

        let (id_a, id_b) = (id(), id());
        let (a, b) = tokio::join!(manager.load(&id_a, &source), manager.load(&id_b, &source));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(a.same_instance(&b));
        assert_eq!(harness.fetcher.calls(), 1);
        assert_eq!(harness.runtime.compiles(), 1);
        assert!(manager.state(&id()).is_ready());

        let again = manager.load(&id(), &source).await.unwrap();
        assert!(again.same_instance(&a));
        assert_eq!(harness.fetcher.calls(), 1);
        assert_eq!(harness.runtime.compiles(), 1);
    }

    /// Serves the same body for every URL, holding URLs that contain "slow"
    struct PerUrlFetcher {
        body: Vec<u8>,
        slow: Duration,
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ModelFetcher for PerUrlFetcher {
        async fn fetch(
            &self,
            url: &str,
            _progress: &(dyn Fn(FetchProgress) + Send + Sync),
        ) -> Result<Vec<u8>, FetchError> {
            self.urls.lock().push(url.to_string());
            if url.contains("slow") {
                tokio::time::sleep(self.slow).await;
            }
            Ok(self.body.clone())
        }
    }

    #[tokio::test]
    async fn test_loads_of_different_models_run_independently() {
        let fetcher = Arc::new(PerUrlFetcher {
            body: source_bytes(),
            slow: Duration::from_millis(500),
            urls: Mutex::new(Vec::new()),
        });
        let runtime = Arc::new(CountingRuntime::default());
        let manager = ModelLifecycleManager::new(Arc::new(InMemoryBlobStore::new()), fetcher.clone(), runtime.clone());

        let slow_id = ModelIdentifier::new("a").unwrap();
        let fast_id = ModelIdentifier::new("b").unwrap();
        let slow_source = remote("https://models.example.com/slow/a.json");
        let fast_source = remote("https://models.example.com/fast/b.json");

        let started = tokio::time::Instant::now();
        let (slow, fast) = tokio::join!(manager.load(&slow_id, &slow_source), async {
            let backend = manager.load(&fast_id, &fast_source).await;
            let elapsed = started.elapsed();
            // The slow model is still in flight when the fast one is ready
            assert!(!manager.state(&slow_id).is_ready());
            assert!(manager.state(&fast_id).is_ready());
            (backend, elapsed)
        });

        let (fast, fast_elapsed) = fast;
        let (slow, fast) = (slow.unwrap(), fast.unwrap());
        assert!(fast_elapsed < Duration::from_millis(500));
        assert!(!slow.same_instance(&fast));
        assert_eq!(slow.model_id(), &slow_id);
        assert_eq!(fast.model_id(), &fast_id);

        let mut urls = fetcher.urls.lock().clone();
        urls.sort();
        assert_eq!(
            urls,
            vec![
                "https://models.example.com/fast/b.json".to_string(),
                "https://models.example.com/slow/a.json".to_string(),
            ]
        );
        assert_eq!(runtime.compiles(), 2);
        assert!(manager.state(&slow_id).is_ready());
        assert!(manager.state(&fast_id).is_ready());
    }

    #[tokio::test]
    async fn test_corrupt_compiled_artifact_is_recompiled_from_source() {
        let harness = Harness::new(ScriptedFetcher::serving(Vec::new()));
        harness.store.seed(&id(), ArtifactKind::Source, source_bytes());
        harness.store.seed(&id(), ArtifactKind::Compiled, b"garbage".to_vec());

        let manager = harness.manager();
        let backend = manager
            .load(&id(), &ModelSource::Bundled(PathBuf::from("/nonexistent/colors.json")))
            .await
            .unwrap();

        assert_eq!(backend.variant(), BackendVariant::Local);
        assert_eq!(harness.runtime.compiles(), 1);
        assert_eq!(harness.store.delete_count(), 1);
        assert_eq!(harness.fetcher.calls(), 0);

        let recompiled = harness.store.read(&id(), ArtifactKind::Compiled).await.unwrap();
        assert!(recompiled.starts_with(inference_engine::prototype::COMPILED_MAGIC));
    }

    #[tokio::test]
    async fn test_missing_bundled_artifact() {
        let harness = Harness::new(ScriptedFetcher::serving(Vec::new()));
        let manager = harness.manager();

        let result = manager
            .load(&id(), &ModelSource::Bundled(PathBuf::from("/definitely/missing/colors.json")))
            .await;

        assert_eq!(
            result.map(|_| ()),
            Err(LoadError::MissingArtifact {
                model_id: "colors".to_string()
            })
        );
        assert!(matches!(
            manager.state(&id()),
            ModelLifecycleState::Failed(LoadError::MissingArtifact { .. })
        ));
    }

    #[tokio::test]
    async fn test_bundled_compiled_artifact_skips_compile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("colors.pmc");
        let compiled = PrototypeRuntime.compile(ModelArtifact::new(ArtifactKind::Source, source_bytes())).unwrap();
        std::fs::write(&path, &compiled).unwrap();

        let harness = Harness::new(ScriptedFetcher::serving(Vec::new()));
        let manager = harness.manager();
        manager.load(&id(), &ModelSource::Bundled(path)).await.unwrap();

        assert_eq!(harness.runtime.compiles(), 0);
        assert!(harness.store.exists(&id(), ArtifactKind::Compiled).await.unwrap());
        assert!(!harness.store.exists(&id(), ArtifactKind::Source).await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_failure_then_retry() {
        let fetcher = ScriptedFetcher::serving(source_bytes()).then(Err(FetchError::Status {
            url: "https://models.example.com/colors.json".to_string(),
            status: 503,
        }));
        let harness = Harness::new(fetcher);
        let manager = harness.manager();
        let source = remote("https://models.example.com/colors.json");

        let first = manager.load(&id(), &source).await;
        assert!(matches!(first, Err(LoadError::FetchFailed { .. })));
        assert!(manager.state(&id()).error().map(LoadError::is_transient).unwrap_or(false));

        manager.load(&id(), &source).await.unwrap();
        assert_eq!(harness.fetcher.calls(), 2);
        assert!(manager.state(&id()).is_ready());
    }

    #[tokio::test]
    async fn test_fetch_timeout_fails_load() {
        let harness = Harness::new(ScriptedFetcher::serving(source_bytes()).with_delay(Duration::from_secs(10)));
        let manager = harness.manager().with_options(LoadOptions {
            fetch_timeout: Some(Duration::from_millis(20)),
            ..LoadOptions::default()
        });

        match manager.load(&id(), &remote("https://models.example.com/colors.json")).await {
            Err(LoadError::FetchFailed { reason, .. }) => assert!(reason.contains("timed out"), "{}", reason),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails_load() {
        let harness = Harness::new(ScriptedFetcher::serving(source_bytes()));
        let manager = harness.manager().with_options(LoadOptions {
            expected_sha256: Some("00".repeat(32)),
            ..LoadOptions::default()
        });

        let result = manager.load(&id(), &remote("https://models.example.com/colors.json")).await;
        assert!(matches!(result, Err(LoadError::FetchFailed { .. })));
        assert_eq!(harness.store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_compile_failure_is_not_retried_for_same_source() {
        let harness = Harness::new(ScriptedFetcher::serving(Vec::new()));
        harness.store.seed(&id(), ArtifactKind::Source, b"not a model".to_vec());
        let manager = harness.manager();
        let source = ModelSource::Bundled(PathBuf::from("/nonexistent/colors.json"));

        assert!(matches!(
            manager.load(&id(), &source).await,
            Err(LoadError::CompileFailed { .. })
        ));
        assert!(matches!(
            manager.load(&id(), &source).await,
            Err(LoadError::CompileFailed { .. })
        ));
        assert_eq!(harness.runtime.compiles(), 1);

        manager.invalidate(&id(), true).await.unwrap();
        harness.store.seed(&id(), ArtifactKind::Source, source_bytes());
        manager.load(&id(), &source).await.unwrap();
        assert_eq!(harness.runtime.compiles(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_discards_ready_backend() {
        let harness = Harness::new(ScriptedFetcher::serving(source_bytes()));
        let manager = harness.manager();
        let source = remote("https://models.example.com/colors.json");

        let held = manager.load(&id(), &source).await.unwrap();
        manager.invalidate(&id(), false).await.unwrap();

        assert!(matches!(manager.state(&id()), ModelLifecycleState::Unloaded));
        assert!(!held.is_valid());

        let reloaded = manager.load(&id(), &source).await.unwrap();
        assert!(!reloaded.same_instance(&held));
        assert_eq!(harness.fetcher.calls(), 1);
        assert_eq!(harness.runtime.compiles(), 1);
    }

    fn labeler_manager(registry: Arc<FakeRemoteRegistry>) -> ModelLifecycleManager {
        Harness::new(ScriptedFetcher::serving(Vec::new()))
            .manager()
            .with_registry(registry)
    }

    #[tokio::test]
    async fn test_remote_labeler_completion_before_check_is_honored() {
        let registry = Arc::new(FakeRemoteRegistry::new());
        registry.publish("birds", [("robin", 0.9)]);
        registry.set_stale_residency(true);
        registry.set_complete_on_request(true);

        let manager = labeler_manager(registry.clone());
        let id = ModelIdentifier::new("birds").unwrap();
        let backend = manager
            .load(&id, &ModelSource::RemoteLabeler { confidence_threshold: 0.0 })
            .await
            .unwrap();

        assert_eq!(backend.variant(), BackendVariant::RemoteLabeler);
        assert_eq!(registry.listener_count("birds"), 0);
    }

    #[tokio::test]
    async fn test_remote_labeler_waits_for_download() {
        let registry = Arc::new(FakeRemoteRegistry::new());
        registry.publish("birds", [("robin", 0.9), ("wren", 0.1)]);

        let manager = Arc::new(labeler_manager(registry.clone()));
        let id = ModelIdentifier::new("birds").unwrap();

        let task = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move {
                manager
                    .load(&id, &ModelSource::RemoteLabeler { confidence_threshold: 0.5 })
                    .await
            })
        };

        while registry.listener_count("birds") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(matches!(manager.state(&id), ModelLifecycleState::Fetching(_)));

        registry.complete("birds");
        let backend = task.await.unwrap().unwrap();

        assert_eq!(registry.listener_count("birds"), 0);
        assert_eq!(registry.download_count(), 1);

        let predictions = backend.recognize(&Frame::solid(1, 1, [0, 0, 0])).await.unwrap();
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].label, "robin");
    }

    #[tokio::test]
    async fn test_remote_labeler_download_failure_releases_listener() {
        let registry = Arc::new(FakeRemoteRegistry::new());
        registry.publish("birds", [("robin", 0.9)]);

        let manager = Arc::new(labeler_manager(registry.clone()));
        let id = ModelIdentifier::new("birds").unwrap();

        let task = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move {
                manager
                    .load(&id, &ModelSource::RemoteLabeler { confidence_threshold: 0.0 })
                    .await
            })
        };

        while registry.listener_count("birds") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        registry.fail("birds", "no network");

        let result = task.await.unwrap();
        assert!(matches!(result, Err(LoadError::FetchFailed { .. })));
        assert_eq!(registry.listener_count("birds"), 0);
    }

    #[tokio::test]
    async fn test_remote_labeler_without_registry() {
        let harness = Harness::new(ScriptedFetcher::serving(Vec::new()));
        let manager = harness.manager();

        let result = manager
            .load(&id(), &ModelSource::RemoteLabeler { confidence_threshold: 0.0 })
            .await;
        assert!(matches!(result, Err(LoadError::BackendUnavailable { .. })));
    }
}
