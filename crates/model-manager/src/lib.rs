//! Model lifecycle management for Image Recognizer
//!
//! This crate provides functionality for acquiring classification models: the
//! fetcher contract and its HTTP implementation, the remote labeler registry
//! contract, and the lifecycle manager that turns a model identifier into a
//! ready inference backend exactly once.

pub mod fetcher;
pub mod lifecycle;
pub mod registry;
pub mod state;

// Re-export commonly used types
pub use fetcher::{verify_sha256, HttpModelFetcher, ModelFetcher};
pub use lifecycle::{LoadOptions, ModelLifecycleManager};
pub use registry::{DownloadConditions, DownloadStatus, DownloadWatch, FakeRemoteRegistry, RemoteModelRegistry};
pub use state::ModelLifecycleState;
