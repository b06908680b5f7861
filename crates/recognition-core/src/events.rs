//! Events emitted by the recognition pipeline

use std::fmt;

use common::AggregatedPrediction;
use model_manager::ModelLifecycleState;

/// Notification for the capture and display collaborators
#[derive(Debug, Clone)]
pub enum RecognitionEvent {
    /// The visible result set changed
    ResultsChanged(Vec<AggregatedPrediction>),
    /// A confident match was found; the capture loop should end
    AutoStopRequested,
    /// The model moved to a new lifecycle state
    LoadStateChanged(ModelLifecycleState),
}

impl RecognitionEvent {
    /// Gets the result set carried by a `ResultsChanged` event
    pub fn results(&self) -> Option<&[AggregatedPrediction]> {
        match self {
            RecognitionEvent::ResultsChanged(results) => Some(results),
            _ => None,
        }
    }
}

impl fmt::Display for RecognitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecognitionEvent::ResultsChanged(results) => write!(f, "results changed ({} labels)", results.len()),
            RecognitionEvent::AutoStopRequested => write!(f, "auto-stop requested"),
            RecognitionEvent::LoadStateChanged(state) => write!(f, "model {}", state),
        }
    }
}
