//! Result push cadence
//!
//! A change to the result set stays pending until it is pushed. A pending
//! change is pushed once the minimum interval has passed since the last push,
//! or straight away when the push is marked fast or the fold requested an
//! auto-stop.

use std::time::Duration;

use chrono::{DateTime, Utc};

use common::utils::elapsed_between;
use settings::CadenceSettings;

use crate::aggregator::AggregatorDecision;

/// Decides when an aggregated result set is pushed to subscribers
#[derive(Debug, Clone)]
pub struct UpdateCadence {
    /// Minimum time between two ordinary pushes
    min_push_interval: Duration,
    /// Time of the last push in this session
    last_push: Option<DateTime<Utc>>,
    /// A change was folded that has not been pushed yet
    pending: bool,
}

impl UpdateCadence {
    /// Creates a cadence with the given minimum push interval
    pub fn new(min_push_interval: Duration) -> Self {
        Self {
            min_push_interval,
            last_push: None,
            pending: false,
        }
    }

    /// Creates a cadence from settings
    pub fn from_settings(settings: &CadenceSettings) -> Self {
        Self::new(settings.min_push_interval())
    }

    /// Records a fold and returns true if its result should be pushed now
    ///
    /// `fast` bypasses the interval, used when the set was empty before the
    /// fold or for one-shot still images.
    pub fn should_push(&mut self, decision: &AggregatorDecision, fast: bool, now: DateTime<Utc>) -> bool {
        self.pending |= decision.changed;
        if !self.pending {
            return false;
        }

        let due = match self.last_push {
            Some(last) => elapsed_between(last, now) > self.min_push_interval,
            None => true,
        };

        if due || fast || decision.should_auto_stop {
            self.last_push = Some(now);
            self.pending = false;
            true
        } else {
            false
        }
    }

    /// Gets the time of the last push
    pub fn last_push(&self) -> Option<DateTime<Utc>> {
        self.last_push
    }

    /// Returns true if a folded change is waiting to be pushed
    pub fn has_pending(&self) -> bool {
        self.pending
    }

    /// Forgets all bookkeeping
    pub fn reset(&mut self) {
        self.last_push = None;
        self.pending = false;
    }
}

impl Default for UpdateCadence {
    fn default() -> Self {
        Self::from_settings(&CadenceSettings::default())
    }
}
