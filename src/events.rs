use crate::detection::{Classification, DetectionState};
use crate::error::EventBusError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Events that can occur in the cuewatch system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CuewatchEvent {
    /// The detection state machine executed a transition
    StateChanged {
        previous: DetectionState,
        state: DetectionState,
        classification: Classification,
        score: f32,
        timestamp: SystemTime,
    },
    /// A prediction was opened on the remote service
    PredictionCreated { prediction_id: String, title: String },
    /// A prediction was resolved (or the resolve attempt finished)
    PredictionResolved {
        prediction_id: String,
        outcome: Classification,
        success: bool,
    },
    /// A live prediction was canceled
    PredictionCanceled { prediction_id: String, success: bool },
    /// A prediction call failed; local state is unaffected
    PredictionFailed { operation: String, error: String },
    /// The remote session became (un)authenticated
    AuthStatusChanged {
        authenticated: bool,
        login: Option<String>,
        reason: String,
    },
    /// Capture started or stopped
    CaptureStatusChanged {
        running: bool,
        device_index: u32,
        timestamp: SystemTime,
    },
    /// An operator asked for a manual action
    OperatorCommand {
        command: OperatorCommand,
        timestamp: SystemTime,
    },
    /// A system error occurred in a component
    SystemError { component: String, error: String },
    /// System shutdown requested
    ShutdownRequested {
        timestamp: SystemTime,
        reason: String,
    },
}

impl CuewatchEvent {
    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            CuewatchEvent::StateChanged {
                previous,
                state,
                classification,
                score,
                ..
            } => format!(
                "State {} -> {} ({:?}, score {:.3})",
                previous, state, classification, score
            ),
            CuewatchEvent::PredictionCreated {
                prediction_id,
                title,
            } => format!("Prediction {} created: {}", prediction_id, title),
            CuewatchEvent::PredictionResolved {
                prediction_id,
                outcome,
                success,
            } => format!(
                "Prediction {} resolved as {:?}{}",
                prediction_id,
                outcome,
                if *success { "" } else { " (remote call failed)" }
            ),
            CuewatchEvent::PredictionCanceled {
                prediction_id,
                success,
            } => format!(
                "Prediction {} canceled{}",
                prediction_id,
                if *success { "" } else { " (remote call failed)" }
            ),
            CuewatchEvent::PredictionFailed { operation, error } => {
                format!("Prediction {} failed: {}", operation, error)
            }
            CuewatchEvent::AuthStatusChanged {
                authenticated,
                login,
                reason,
            } => {
                if *authenticated {
                    format!("Authenticated as {}", login.as_deref().unwrap_or("unknown"))
                } else {
                    format!("Not authenticated: {}", reason)
                }
            }
            CuewatchEvent::CaptureStatusChanged {
                running,
                device_index,
                ..
            } => format!(
                "Capture on device {} {}",
                device_index,
                if *running { "started" } else { "stopped" }
            ),
            CuewatchEvent::OperatorCommand { command, .. } => {
                format!("Operator command: {}", command)
            }
            CuewatchEvent::SystemError { component, error } => {
                format!("Error in {}: {}", component, error)
            }
            CuewatchEvent::ShutdownRequested { reason, .. } => {
                format!("Shutdown requested: {}", reason)
            }
        }
    }

    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            CuewatchEvent::StateChanged { .. } => "state_changed",
            CuewatchEvent::PredictionCreated { .. } => "prediction_created",
            CuewatchEvent::PredictionResolved { .. } => "prediction_resolved",
            CuewatchEvent::PredictionCanceled { .. } => "prediction_canceled",
            CuewatchEvent::PredictionFailed { .. } => "prediction_failed",
            CuewatchEvent::AuthStatusChanged { .. } => "auth_status_changed",
            CuewatchEvent::CaptureStatusChanged { .. } => "capture_status_changed",
            CuewatchEvent::OperatorCommand { .. } => "operator_command",
            CuewatchEvent::SystemError { .. } => "system_error",
            CuewatchEvent::ShutdownRequested { .. } => "shutdown_requested",
        }
    }
}

/// Manual actions available to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorCommand {
    Start,
    Stop,
    Reset,
    ToggleAlwaysVoting,
    LockPrediction,
    ForceWin,
    ForceLose,
    Quit,
}

impl fmt::Display for OperatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperatorCommand::Start => "start",
            OperatorCommand::Stop => "stop",
            OperatorCommand::Reset => "reset",
            OperatorCommand::ToggleAlwaysVoting => "toggle always-voting",
            OperatorCommand::LockPrediction => "lock prediction",
            OperatorCommand::ForceWin => "force win",
            OperatorCommand::ForceLose => "force lose",
            OperatorCommand::Quit => "quit",
        };
        f.write_str(name)
    }
}

/// Async event bus for component coordination using broadcast channels
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CuewatchEvent>,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CuewatchEvent> {
        self.sender.subscribe()
    }

    /// Subscribe with a filter
    pub fn receiver(&self, filter: EventFilter, name: &str) -> EventReceiver {
        EventReceiver::new(self.subscribe(), filter, name.to_string())
    }

    /// Publish an event to all subscribers. Fails only when nobody is
    /// subscribed.
    pub async fn publish(&self, event: CuewatchEvent) -> Result<usize, EventBusError> {
        match &event {
            CuewatchEvent::PredictionFailed { operation, error } => {
                warn!("Prediction {} failed: {}", operation, error);
            }
            CuewatchEvent::SystemError { component, error } => {
                error!("System error in {}: {}", component, error);
            }
            CuewatchEvent::AuthStatusChanged { authenticated, .. } => {
                if *authenticated {
                    info!("{}", event.description());
                } else {
                    warn!("{}", event.description());
                }
            }
            CuewatchEvent::ShutdownRequested { reason, .. } => {
                info!("Shutdown requested: {}", reason);
            }
            _ => {}
        }

        self.sender
            .send(event)
            .map_err(|e| EventBusError::PublishFailed {
                details: e.to_string(),
            })
    }

    /// Publish, ignoring the no-subscriber case
    pub async fn notify(&self, event: CuewatchEvent) {
        if let Err(e) = self.publish(event).await {
            debug!("Event not delivered: {}", e);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

/// Event filter for selective event handling
#[derive(Debug, Clone)]
pub enum EventFilter {
    /// Accept all events
    All,
    /// Accept only specific event types
    EventTypes(Vec<&'static str>),
    /// Accept events from specific components (for SystemError events)
    Components(Vec<String>),
    /// Custom filter function
    Custom(fn(&CuewatchEvent) -> bool),
}

impl EventFilter {
    pub fn matches(&self, event: &CuewatchEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::EventTypes(types) => types.contains(&event.event_type()),
            EventFilter::Components(components) => {
                if let CuewatchEvent::SystemError { component, .. } = event {
                    components.contains(component)
                } else {
                    false
                }
            }
            EventFilter::Custom(filter_fn) => filter_fn(event),
        }
    }
}

/// Event receiver with filtering
pub struct EventReceiver {
    receiver: broadcast::Receiver<CuewatchEvent>,
    filter: EventFilter,
    name: String,
}

impl EventReceiver {
    pub fn new(
        receiver: broadcast::Receiver<CuewatchEvent>,
        filter: EventFilter,
        name: String,
    ) -> Self {
        Self {
            receiver,
            filter,
            name,
        }
    }

    /// Receive the next matching event. Lagging skips the lost events and
    /// keeps receiving.
    pub async fn recv(&mut self) -> Result<CuewatchEvent, EventBusError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        debug!("Receiver '{}' received event: {}", self.name, event.description());
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Receiver '{}' lagged behind by {} events", self.name, n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed for receiver '{}'", self.name);
                    return Err(EventBusError::ChannelClosed);
                }
            }
        }
    }

    /// Try to receive a matching event without blocking
    pub fn try_recv(&mut self) -> Result<Option<CuewatchEvent>, EventBusError> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Ok(Some(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("Receiver '{}' lagged behind by {} events", self.name, n);
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn state_changed() -> CuewatchEvent {
        CuewatchEvent::StateChanged {
            previous: DetectionState::Idle,
            state: DetectionState::Voting,
            classification: Classification::Start,
            score: 0.95,
            timestamp: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_basic_operations() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        let subscriber_count = event_bus.publish(state_changed()).await.unwrap();
        assert_eq!(subscriber_count, 1);

        match receiver.recv().await.unwrap() {
            CuewatchEvent::StateChanged { state, score, .. } => {
                assert_eq!(state, DetectionState::Voting);
                assert_eq!(score, 0.95);
            }
            _ => panic!("Unexpected event type"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let event_bus = EventBus::new(4);
        assert!(!event_bus.has_subscribers());
        assert!(event_bus.publish(state_changed()).await.is_err());

        // notify swallows the same condition
        event_bus.notify(state_changed()).await;
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();
        assert_eq!(event_bus.subscriber_count(), 2);

        event_bus
            .publish(CuewatchEvent::PredictionCanceled {
                prediction_id: "p1".to_string(),
                success: true,
            })
            .await
            .unwrap();

        for receiver in [&mut receiver1, &mut receiver2] {
            let event = timeout(Duration::from_millis(100), receiver.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.event_type(), "prediction_canceled");
        }
    }

    #[tokio::test]
    async fn test_filtered_receiver() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.receiver(
            EventFilter::EventTypes(vec!["prediction_failed"]),
            "failures",
        );

        event_bus.publish(state_changed()).await.unwrap();
        event_bus
            .publish(CuewatchEvent::PredictionFailed {
                operation: "create".to_string(),
                error: "rate limited".to_string(),
            })
            .await
            .unwrap();

        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, CuewatchEvent::PredictionFailed { .. }));
        assert!(receiver.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_component_and_custom_filters() {
        let error = CuewatchEvent::SystemError {
            component: "poller".to_string(),
            error: "boom".to_string(),
        };
        assert!(EventFilter::Components(vec!["poller".to_string()]).matches(&error));
        assert!(!EventFilter::Components(vec!["poller".to_string()]).matches(&state_changed()));

        let voting_only = EventFilter::Custom(|event| {
            matches!(
                event,
                CuewatchEvent::StateChanged {
                    state: DetectionState::Voting,
                    ..
                }
            )
        });
        assert!(voting_only.matches(&state_changed()));
        assert!(!voting_only.matches(&error));
    }

    #[tokio::test]
    async fn test_receiver_survives_lag() {
        let event_bus = EventBus::new(2);
        let mut receiver = event_bus.receiver(EventFilter::All, "slow");

        for i in 0..5 {
            event_bus
                .publish(CuewatchEvent::PredictionCreated {
                    prediction_id: format!("p{}", i),
                    title: "Win?".to_string(),
                })
                .await
                .unwrap();
        }

        match receiver.recv().await.unwrap() {
            CuewatchEvent::PredictionCreated { prediction_id, .. } => {
                assert_eq!(prediction_id, "p3");
            }
            other => panic!("Unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_event_descriptions() {
        let event = CuewatchEvent::AuthStatusChanged {
            authenticated: true,
            login: Some("streamer".to_string()),
            reason: String::new(),
        };
        assert_eq!(event.description(), "Authenticated as streamer");
        assert_eq!(event.event_type(), "auth_status_changed");
        assert!(state_changed().description().contains("idle -> voting"));

        let command = CuewatchEvent::OperatorCommand {
            command: OperatorCommand::ToggleAlwaysVoting,
            timestamp: SystemTime::now(),
        };
        assert_eq!(command.description(), "Operator command: toggle always-voting");
        assert_eq!(command.event_type(), "operator_command");
    }
}
