//! Temporal prediction aggregation
//!
//! This module provides the aggregator that folds the noisy per-frame output of
//! a backend into a stable, deduplicated, confidence-sorted result set. Entries
//! that are not sighted again within the retention window expire.
//!
//! The aggregator does no locking and no I/O; its owner serializes access.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::trace;

use common::utils::elapsed_between;
use common::{AggregatedPrediction, RawPrediction};
use settings::AggregationSettings;

/// Predicate deciding whether a newly sighted label may enter the result set
pub type DisplayFilter = Arc<dyn Fn(&RawPrediction) -> bool + Send + Sync>;

/// Outcome of folding one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorDecision {
    /// A label was added or moved by more than the hysteresis
    pub changed: bool,
    /// A prediction reached the auto-stop threshold
    pub should_auto_stop: bool,
    /// Number of entries purged by expiry
    pub expired: usize,
}

/// Running result set
pub struct PredictionAggregator {
    /// Entries sorted by descending confidence
    entries: Vec<AggregatedPrediction>,
    /// Gate for new labels
    filter: DisplayFilter,
}

impl PredictionAggregator {
    /// Creates an empty aggregator accepting every label
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            filter: Arc::new(|_: &RawPrediction| true),
        }
    }

    /// Creates an empty aggregator gating new labels through `filter`
    pub fn with_display_filter(filter: DisplayFilter) -> Self {
        Self {
            entries: Vec::new(),
            filter,
        }
    }

    /// Folds one batch of raw predictions observed at `now`
    pub fn fold(&mut self, batch: &[RawPrediction], now: DateTime<Utc>, settings: &AggregationSettings) -> AggregatorDecision {
        let mut decision = AggregatorDecision::default();

        for prediction in batch {
            if let Some(entry) = self.entries.iter_mut().find(|e| e.label == prediction.label) {
                if (prediction.confidence - entry.confidence).abs() > settings.hysteresis {
                    decision.changed = true;
                }
                entry.confidence = prediction.confidence;
                entry.last_seen_at = now;
            } else if (self.filter)(prediction) {
                self.entries.push(AggregatedPrediction {
                    label: prediction.label.clone(),
                    confidence: prediction.confidence,
                    last_seen_at: now,
                });
                decision.changed = true;
            }

            if prediction.confidence >= settings.auto_stop_threshold {
                decision.should_auto_stop = true;
            }
        }

        let retention = settings.retention_window();
        let before = self.entries.len();
        self.entries
            .retain(|entry| elapsed_between(entry.last_seen_at, now) <= retention);
        decision.expired = before - self.entries.len();

        if decision.expired > 0 {
            trace!("Expired {} aggregated predictions", decision.expired);
            if settings.purge_counts_as_change {
                decision.changed = true;
            }
        }

        // Stable, so equal confidences keep their insertion order
        self.entries
            .sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));

        decision
    }

    /// Gets the current result set, sorted by descending confidence
    pub fn snapshot(&self) -> Vec<AggregatedPrediction> {
        self.entries.clone()
    }

    /// Clears the result set
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Returns true if the result set is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Gets the number of labels in the result set
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for PredictionAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PredictionAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredictionAggregator")
            .field("entries", &self.entries)
            .finish()
    }
}
