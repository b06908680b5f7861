//! Recognition pipeline
//!
//! This module provides the orchestrator sitting between the capture layer and
//! the model: it loads the model through the lifecycle manager, classifies
//! frames one at a time, folds the results into the aggregator and decides
//! when to tell subscribers.
//!
//! Only one inference runs at a time. Live frames arriving while it is busy
//! are dropped, never queued. Stopping or resetting a session bumps its
//! generation; a result computed for an older generation is discarded.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use common::error::{InferError, LoadError};
use common::utils::{elapsed_between, Clock, SystemClock};
use common::{AggregatedPrediction, ModelIdentifier, ModelSource, RawPrediction};
use inference_engine::{Frame, InferenceBackend};
use model_manager::{ModelLifecycleManager, ModelLifecycleState};
use settings::{AggregationSettings, RecognitionSettings};

use crate::aggregator::{AggregatorDecision, DisplayFilter, PredictionAggregator};
use crate::cadence::UpdateCadence;
use crate::events::RecognitionEvent;

/// Capacity of the event channel
const EVENT_CAPACITY: usize = 64;

/// What happened to a live frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// No live session is running
    NotRunning,
    /// Arrived before the frame interval elapsed
    Skipped,
    /// Another inference was in flight
    Busy,
    /// The session was stopped or reset while the frame was classified
    Stale,
    /// The result was folded into the result set
    Processed {
        /// Aggregator decision for the frame
        decision: AggregatorDecision,
        /// Whether subscribers were sent the new result set
        pushed: bool,
    },
}

struct Session {
    aggregator: PredictionAggregator,
    cadence: UpdateCadence,
    running: bool,
    generation: u64,
    last_frame_at: Option<DateTime<Utc>>,
}

/// Orchestrates model loading, inference and aggregation for one model
pub struct RecognitionPipeline {
    /// Lifecycle manager owning the model
    manager: Arc<ModelLifecycleManager>,

    /// Model to recognize with
    model_id: ModelIdentifier,

    /// Where the model comes from
    source: ModelSource,

    /// Aggregation settings applied to every fold
    aggregation: AggregationSettings,

    /// Minimum time between two live frames sent to inference
    frame_interval: Duration,

    /// Backend once loaded
    backend: RwLock<Option<InferenceBackend>>,

    /// Aggregator and cadence bookkeeping
    session: Mutex<Session>,

    /// Held while an inference runs
    inference: tokio::sync::Mutex<()>,

    /// Time source
    clock: Arc<dyn Clock>,

    /// Event channel
    events: broadcast::Sender<RecognitionEvent>,
}

impl RecognitionPipeline {
    /// Creates a new pipeline
    pub fn new(
        manager: Arc<ModelLifecycleManager>,
        model_id: ModelIdentifier,
        source: ModelSource,
        settings: &RecognitionSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            manager,
            model_id,
            source,
            aggregation: settings.aggregation.clone(),
            frame_interval: settings.cadence.frame_interval(),
            backend: RwLock::new(None),
            session: Mutex::new(Session {
                aggregator: PredictionAggregator::new(),
                cadence: UpdateCadence::from_settings(&settings.cadence),
                running: false,
                generation: 0,
                last_frame_at: None,
            }),
            inference: tokio::sync::Mutex::new(()),
            clock: Arc::new(SystemClock),
            events,
        }
    }

    /// Replaces the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Gates new labels through `filter`
    pub fn with_display_filter(mut self, filter: DisplayFilter) -> Self {
        self.session.get_mut().aggregator = PredictionAggregator::with_display_filter(filter);
        self
    }

    /// Gets the model identifier
    pub fn model_id(&self) -> &ModelIdentifier {
        &self.model_id
    }

    /// Gets the model's lifecycle state
    pub fn model_state(&self) -> ModelLifecycleState {
        self.manager.state(&self.model_id)
    }

    /// Subscribes to pipeline events
    pub fn subscribe(&self) -> broadcast::Receiver<RecognitionEvent> {
        self.events.subscribe()
    }

    /// Loads the model, forwarding lifecycle changes as events
    pub async fn load(&self) -> Result<InferenceBackend, LoadError> {
        let mut states = self.manager.subscribe(&self.model_id);
        let load = self.manager.load(&self.model_id, &self.source);
        tokio::pin!(load);

        let mut final_state_sent = false;
        let result = loop {
            tokio::select! {
                result = &mut load => break result,
                changed = states.changed() => {
                    if changed.is_err() {
                        break (&mut load).await;
                    }
                    let state = states.borrow_and_update().clone();
                    final_state_sent = state.is_ready() || state.error().is_some();
                    self.emit(RecognitionEvent::LoadStateChanged(state));
                }
            }
        };

        if !final_state_sent {
            self.emit(RecognitionEvent::LoadStateChanged(self.model_state()));
        }

        match &result {
            Ok(backend) => {
                info!("Model {} ready for recognition ({})", self.model_id, backend.variant());
                *self.backend.write() = Some(backend.clone());
            }
            Err(e) => warn!("Model {} failed to load: {}", self.model_id, e),
        }

        result
    }

    /// Starts a live capture session
    pub fn start_session(&self) {
        let mut session = self.session.lock();
        session.running = true;
        session.last_frame_at = None;
        info!("Capture session started");
    }

    /// Stops the live capture session
    ///
    /// A frame still being classified is not interrupted, but its result is
    /// discarded.
    pub fn stop_session(&self) {
        let mut session = self.session.lock();
        if session.running {
            info!("Capture session stopped");
        }
        session.running = false;
        session.generation += 1;
    }

    /// Clears the result set and the cadence bookkeeping
    pub fn reset_session(&self) {
        let mut session = self.session.lock();
        session.aggregator.reset();
        session.cadence.reset();
        session.generation += 1;
        session.last_frame_at = None;
        debug!("Recognition session reset");
    }

    /// Returns true while a live session is running
    pub fn is_running(&self) -> bool {
        self.session.lock().running
    }

    /// Gets the current result set
    pub fn snapshot(&self) -> Vec<AggregatedPrediction> {
        self.session.lock().aggregator.snapshot()
    }

    /// Handles one live frame
    ///
    /// Returns `ModelNotReady` if the model has not been loaded. Other
    /// inference errors concern this frame only.
    pub async fn on_frame(&self, frame: &Frame) -> Result<FrameOutcome, InferError> {
        let now = self.clock.now();

        {
            let session = self.session.lock();
            if !session.running {
                return Ok(FrameOutcome::NotRunning);
            }
            if let Some(last) = session.last_frame_at {
                if elapsed_between(last, now) < self.frame_interval {
                    return Ok(FrameOutcome::Skipped);
                }
            }
        }

        let backend = self.current_backend()?;

        let _slot = match self.inference.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                trace!("Inference in flight; dropping frame");
                return Ok(FrameOutcome::Busy);
            }
        };

        let generation = {
            let mut session = self.session.lock();
            if !session.running {
                return Ok(FrameOutcome::NotRunning);
            }
            session.last_frame_at = Some(now);
            session.generation
        };

        let batch = backend.recognize(frame).await?;
        Ok(self.apply(&batch, generation, false))
    }

    /// Classifies one still image
    ///
    /// Stops any live session and clears the result set first. Unlike live
    /// frames, a still image waits for an in-flight inference to finish.
    pub async fn on_still_image(&self, frame: &Frame) -> Result<Vec<AggregatedPrediction>, InferError> {
        self.stop_session();
        self.reset_session();

        let generation = self.session.lock().generation;
        let backend = self.current_backend()?;

        let _slot = self.inference.lock().await;
        let batch = backend.recognize(frame).await?;

        if self.apply(&batch, generation, true) == FrameOutcome::Stale {
            debug!("Still image superseded before its result arrived");
        }

        Ok(self.snapshot())
    }

    fn current_backend(&self) -> Result<InferenceBackend, InferError> {
        self.backend.read().clone().ok_or(InferError::ModelNotReady)
    }

    fn apply(&self, batch: &[RawPrediction], generation: u64, fast: bool) -> FrameOutcome {
        let now = self.clock.now();
        let mut events = Vec::new();

        let outcome = {
            let mut session = self.session.lock();
            if session.generation != generation {
                debug!("Discarding result of a stopped or reset session");
                return FrameOutcome::Stale;
            }

            let was_empty = session.aggregator.is_empty();
            let decision = session.aggregator.fold(batch, now, &self.aggregation);
            let pushed = session.cadence.should_push(&decision, fast || was_empty, now);

            if pushed {
                events.push(RecognitionEvent::ResultsChanged(session.aggregator.snapshot()));
            } else if session.cadence.has_pending() {
                trace!("Result change held back until the push interval passes");
            }

            if decision.should_auto_stop && session.running {
                info!("Confident match found; requesting capture stop");
                session.running = false;
                session.generation += 1;
                events.push(RecognitionEvent::AutoStopRequested);
            }

            FrameOutcome::Processed { decision, pushed }
        };

        for event in events {
            self.emit(event);
        }

        outcome
    }

    fn emit(&self, event: RecognitionEvent) {
        trace!("Pipeline event: {}", event);
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
