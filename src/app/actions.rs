use crate::detection::{Classification, DetectionState, DetectionStateMachine, Transition};
use crate::error::{AuthError, PredictionError};
use crate::events::{CuewatchEvent, EventBus};
use crate::history::{HistoryRecord, HistorySink};
use crate::matcher::TriggerKind;
use crate::prediction::{
    outcome_index, PredictionClient, PredictionHandle, PredictionRequest, PredictionStatus,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Turns state-machine transitions into prediction lifecycle calls.
///
/// Transitions are consumed in order by one dispatcher task. Remote failures
/// end up in the status field and the log; they never touch the state
/// machine. No state-machine lock is held while a call is in flight.
pub struct ActionOrchestrator {
    inner: Arc<ActionInner>,
    receiver: Mutex<Option<broadcast::Receiver<Transition>>>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

struct Dispatcher {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct ActionInner {
    machine: Arc<DetectionStateMachine>,
    client: Option<PredictionClient>,
    history: Arc<dyn HistorySink>,
    events: EventBus,
    request: PredictionRequest,
    stop_cancel_timeout: Duration,
    live: Mutex<Option<PredictionHandle>>,
    status: Mutex<PredictionStatus>,
    /// Bumped by every operator stop so a create that straddles one is undone
    stop_generation: AtomicU64,
    /// Transition that opened the live prediction
    live_opened: AtomicU64,
    /// Latest result already acted on
    settled: AtomicU64,
}

impl ActionOrchestrator {
    /// Subscribes to `machine` immediately; transitions made before
    /// `start()` are still delivered.
    pub fn new(
        machine: Arc<DetectionStateMachine>,
        client: Option<PredictionClient>,
        history: Arc<dyn HistorySink>,
        events: EventBus,
        request: PredictionRequest,
        stop_cancel_timeout: Duration,
    ) -> Self {
        let receiver = machine.subscribe();
        Self {
            inner: Arc::new(ActionInner {
                machine,
                client,
                history,
                events,
                request,
                stop_cancel_timeout,
                live: Mutex::new(None),
                status: Mutex::new(PredictionStatus::None),
                stop_generation: AtomicU64::new(0),
                live_opened: AtomicU64::new(0),
                settled: AtomicU64::new(0),
            }),
            receiver: Mutex::new(Some(receiver)),
            dispatcher: Mutex::new(None),
        }
    }

    /// Spawn the dispatcher. Calling it twice is a no-op.
    pub fn start(&self) {
        let Some(mut receiver) = self.receiver.lock().take() else {
            debug!("Action dispatcher already started");
            return;
        };

        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let dispatch_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            info!("Action dispatcher started");
            loop {
                tokio::select! {
                    _ = dispatch_cancel.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(transition) => inner.handle_transition(transition, &dispatch_cancel).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            error!("Action dispatcher missed {} transitions", n);
                            inner.settle_after_lag().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            info!("Action dispatcher stopped");
        });

        *self.dispatcher.lock() = Some(Dispatcher { cancel, task });
    }

    /// Stop dispatching. A resolve or cancel already under way is given up
    /// to `wait` to finish; a pending create is abandoned.
    pub async fn shutdown(&self, wait: Duration) {
        let dispatcher = self.dispatcher.lock().take();
        let Some(dispatcher) = dispatcher else {
            return;
        };

        dispatcher.cancel.cancel();
        match tokio::time::timeout(wait, dispatcher.task).await {
            Ok(Ok(())) => debug!("Action dispatcher exited"),
            Ok(Err(e)) => error!("Action dispatcher failed: {}", e),
            Err(_) => warn!("Action dispatcher still busy after {:?}; leaving it to finish", wait),
        }
    }

    /// Operator stop: cancel the live prediction (bounded, best effort), then
    /// move the state machine to Stopped regardless of the outcome.
    pub async fn stop(&self) {
        self.inner.stop_generation.fetch_add(1, Ordering::SeqCst);

        let live = self.inner.live.lock().take();
        if let Some(handle) = live {
            info!("Canceling live prediction {} before stopping", handle.id);
            self.inner.cancel_remote(handle).await;
        }

        self.inner.machine.stop();
    }

    /// Close voting on the live prediction. The handle stays live so it can
    /// still be resolved.
    pub async fn lock_prediction(&self) -> Result<(), PredictionError> {
        let client = self
            .inner
            .client
            .as_ref()
            .ok_or(PredictionError::Auth(AuthError::NotAuthenticated))?;
        let handle = self
            .inner
            .live
            .lock()
            .clone()
            .ok_or(PredictionError::NoLivePrediction)?;

        if let Err(e) = client.lock(&handle.id, &CancellationToken::new()).await {
            self.inner.report_failure("lock", &e).await;
            return Err(e);
        }

        if let Some(live) = self.inner.live.lock().as_mut() {
            if live.id == handle.id {
                live.status = PredictionStatus::Locked;
            }
        }
        *self.inner.status.lock() = PredictionStatus::Locked;
        Ok(())
    }

    pub fn live_prediction(&self) -> Option<PredictionHandle> {
        self.inner.live.lock().clone()
    }

    /// Status of the most recent prediction operation
    pub fn status(&self) -> PredictionStatus {
        *self.inner.status.lock()
    }

    pub fn is_dispatching(&self) -> bool {
        self.dispatcher
            .lock()
            .as_ref()
            .map(|d| !d.task.is_finished())
            .unwrap_or(false)
    }
}

impl ActionInner {
    async fn handle_transition(&self, transition: Transition, cancel: &CancellationToken) {
        self.events
            .notify(CuewatchEvent::StateChanged {
                previous: transition.previous,
                state: transition.state,
                classification: transition.classification(),
                score: transition.detection.score,
                timestamp: SystemTime::now(),
            })
            .await;

        match transition.state {
            DetectionState::Voting => self.on_voting(&transition, cancel).await,
            DetectionState::Resolved => self.on_resolved(&transition).await,
            _ => {}
        }
    }

    async fn on_voting(&self, transition: &Transition, cancel: &CancellationToken) {
        *self.status.lock() = PredictionStatus::None;
        let generation = self.stop_generation.load(Ordering::SeqCst);

        let existing = self.live.lock().as_ref().map(|h| h.id.clone());
        let prediction_id = match (existing, &self.client) {
            (Some(id), _) => {
                warn!("Prediction {} is still live; not opening another", id);
                *self.status.lock() = PredictionStatus::Created;
                Some(id)
            }
            (None, Some(client)) if client.is_authenticated() => {
                self.create(client, generation, transition.seq, cancel).await
            }
            _ => {
                info!("Not authenticated; voting without a prediction");
                None
            }
        };

        if transition.classification() == Classification::Start {
            let status = *self.status.lock();
            self.history.record(HistoryRecord::new(
                TriggerKind::Start,
                transition.detection.score,
                prediction_id.as_deref(),
                status,
            ));
        }
    }

    async fn create(
        &self,
        client: &PredictionClient,
        generation: u64,
        opened_by: u64,
        cancel: &CancellationToken,
    ) -> Option<String> {
        match client.create(&self.request, cancel).await {
            Ok(handle) => {
                let id = handle.id.clone();
                self.events
                    .notify(CuewatchEvent::PredictionCreated {
                        prediction_id: id.clone(),
                        title: self.request.title.clone(),
                    })
                    .await;

                let stopped = self.stop_generation.load(Ordering::SeqCst) != generation
                    || self.machine.state() == DetectionState::Stopped;
                if stopped {
                    info!("Detection stopped while prediction {} was being created", id);
                    self.cancel_remote(handle).await;
                } else {
                    *self.status.lock() = PredictionStatus::Created;
                    self.live_opened.store(opened_by, Ordering::SeqCst);
                    *self.live.lock() = Some(handle);
                }
                Some(id)
            }
            Err(e) => {
                *self.status.lock() = PredictionStatus::Failed;
                self.report_failure("create", &e).await;
                None
            }
        }
    }

    async fn on_resolved(&self, transition: &Transition) {
        if self.settled.fetch_max(transition.seq, Ordering::SeqCst) >= transition.seq {
            debug!("Result {} was already settled", transition.seq);
            return;
        }

        let kind = match transition.classification() {
            Classification::Win => TriggerKind::Win,
            Classification::Lose => TriggerKind::Lose,
            other => {
                warn!("Resolved without a result classification ({:?})", other);
                return;
            }
        };

        let live = self.live.lock().take();
        let prediction_id = live.as_ref().map(|h| h.id.clone());

        if let (Some(handle), Some(client)) = (live, &self.client) {
            let status = self.resolve_remote(client, &handle, transition.classification()).await;
            *self.status.lock() = status;
        } else {
            debug!("No live prediction to resolve");
        }

        let status = *self.status.lock();
        self.history.record(HistoryRecord::new(
            kind,
            transition.detection.score,
            prediction_id.as_deref(),
            status,
        ));
    }

    /// Transitions were dropped from the feed. Settle the live prediction
    /// against the result of its own round if the machine logged one, or
    /// cancel it if that round is over without a known result.
    async fn settle_after_lag(&self) {
        let Some(id) = self.live.lock().as_ref().map(|h| h.id.clone()) else {
            return;
        };

        let opened_by = self.live_opened.load(Ordering::SeqCst);
        if let Some(result) = self.machine.result_after(opened_by) {
            warn!(
                "Settling prediction {} with missed {:?} result",
                id,
                result.classification()
            );
            self.on_resolved(&result).await;
            return;
        }

        if !self.machine.left_voting_after(opened_by) {
            debug!("Prediction {} still belongs to the current round", id);
            return;
        }

        let stale = self.live.lock().take();
        if let Some(handle) = stale {
            warn!("Round for prediction {} ended without a known result; canceling", id);
            self.cancel_remote(handle).await;
        }
    }

    /// One attempt; the handle is gone afterwards whatever the result
    async fn resolve_remote(
        &self,
        client: &PredictionClient,
        handle: &PredictionHandle,
        classification: Classification,
    ) -> PredictionStatus {
        let Some(index) = outcome_index(classification) else {
            return PredictionStatus::Failed;
        };

        // Not tied to shutdown: a dispatched resolve is allowed to finish
        let result = client
            .resolve_index(handle, index, &CancellationToken::new())
            .await;
        let success = result.is_ok();
        if let Err(e) = &result {
            self.report_failure("resolve", e).await;
        }

        self.events
            .notify(CuewatchEvent::PredictionResolved {
                prediction_id: handle.id.clone(),
                outcome: classification,
                success,
            })
            .await;

        if success {
            PredictionStatus::Resolved
        } else {
            PredictionStatus::Failed
        }
    }

    /// Best-effort cancel bounded by `stop_cancel_timeout`. On timeout the
    /// call keeps running in the background.
    async fn cancel_remote(&self, handle: PredictionHandle) {
        let Some(client) = self.client.clone() else {
            return;
        };

        let id = handle.id.clone();
        let call = tokio::spawn(async move { client.cancel(&id, &CancellationToken::new()).await });

        let success = match tokio::time::timeout(self.stop_cancel_timeout, call).await {
            Ok(Ok(Ok(()))) => true,
            Ok(Ok(Err(e))) => {
                self.report_failure("cancel", &e).await;
                false
            }
            Ok(Err(e)) => {
                error!("Cancel task failed: {}", e);
                false
            }
            Err(_) => {
                warn!(
                    "Cancel of prediction {} did not finish within {:?}; continuing in background",
                    handle.id, self.stop_cancel_timeout
                );
                false
            }
        };

        *self.status.lock() = if success {
            PredictionStatus::Canceled
        } else {
            PredictionStatus::Failed
        };
        self.events
            .notify(CuewatchEvent::PredictionCanceled {
                prediction_id: handle.id,
                success,
            })
            .await;
    }

    async fn report_failure(&self, operation: &str, error: &PredictionError) {
        self.events
            .notify(CuewatchEvent::PredictionFailed {
                operation: operation.to_string(),
                error: error.to_string(),
            })
            .await;
    }
}
