//! Configuration management for Image Recognizer
//!
//! This crate provides the explicitly constructed settings object that is injected
//! into the recognition pipeline, layered from defaults, an optional file and
//! environment variables.

pub mod manager;
pub mod schema;

// Re-export commonly used types
pub use manager::{SettingsError, SettingsManager, ENV_PREFIX};
pub use schema::{
    AggregationSettings, BackendKind, CadenceSettings, FetchSettings, LoggingSettings,
    ModelSettings, RecognitionSettings, StorageSettings,
};
