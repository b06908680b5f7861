//! Common utilities and types for Image Recognizer
//!
//! This crate provides shared functionality used across the recognition workspace,
//! including error types, common data structures, and utility functions.

pub mod error;
pub mod models;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use models::*;
pub use types::*;
