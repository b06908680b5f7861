//! Model artifact storage for Image Recognizer
//!
//! This crate provides the blob store contract the model lifecycle manager
//! persists source and compiled artifacts through, with a filesystem and an
//! in-memory implementation.

pub mod filesystem;
pub mod memory;
pub mod store;

// Re-export commonly used types
pub use filesystem::FilesystemBlobStore;
pub use memory::InMemoryBlobStore;
pub use store::ModelBlobStore;
