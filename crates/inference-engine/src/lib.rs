//! Classification backends for Image Recognizer
//!
//! This crate provides the frame type, the local prototype-model runtime
//! (compile and instantiate), the on-device labeler contract and the
//! [`InferenceBackend`] sum type the pipeline classifies frames through.

pub mod backend;
pub mod frame;
pub mod prototype;
pub mod remote;
pub mod runtime;

// Re-export commonly used types
pub use backend::{BackendVariant, InferenceBackend, LocalBackend, DEFAULT_CONFIDENCE_FLOOR};
pub use frame::Frame;
pub use prototype::{PrototypeLabel, PrototypeModel, PrototypeModelSource};
pub use remote::{OnDeviceLabeler, RemoteLabelerBackend};
pub use runtime::{InstantiateError, LocalModel, LocalModelRuntime, PrototypeRuntime};
