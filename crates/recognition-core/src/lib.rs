//! Recognition pipeline for Image Recognizer
//!
//! This crate provides the temporal prediction aggregator, the update cadence
//! policy and the pipeline that drives a loaded model from a stream of frames.

pub mod aggregator;
pub mod cadence;
pub mod events;
pub mod pipeline;

// Re-export commonly used types
pub use aggregator::{AggregatorDecision, DisplayFilter, PredictionAggregator};
pub use cadence::UpdateCadence;
pub use events::RecognitionEvent;
pub use pipeline::{FrameOutcome, RecognitionPipeline};
