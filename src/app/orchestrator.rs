use super::actions::ActionOrchestrator;
use super::poller::MatchPoller;
use super::types::{ComponentState, ShutdownReason};
use crate::auth::{CredentialManager, FileTokenStore, TokenStore};
use crate::camera::{capture_device, CaptureDevice, FrameSource, FrameSourceBuilder};
use crate::config::CuewatchConfig;
use crate::detection::DetectionStateMachine;
use crate::error::{AuthError, Result};
use crate::events::{EventBus, EventReceiver};
use crate::history::{HistorySink, TracingHistorySink};
use crate::keyboard_input::KeyboardInputHandler;
use crate::matcher::TriggerSet;
use crate::prediction::{PredictionClient, PredictionRequest};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Wires capture, matching, detection and prediction actions together and
/// owns their lifecycle.
pub struct CuewatchApp {
    pub(super) config: CuewatchConfig,
    pub(super) event_bus: EventBus,

    // Components
    pub(super) frame_source: Arc<FrameSource>,
    pub(super) machine: Arc<DetectionStateMachine>,
    pub(super) credentials: Option<Arc<CredentialManager>>,
    pub(super) actions: Arc<ActionOrchestrator>,
    pub(super) poller: Arc<MatchPoller>,
    pub(super) keyboard_handler: Option<KeyboardInputHandler>,
    pub(super) keyboard_enabled: bool,

    // Lifecycle management
    pub(super) component_states: Arc<Mutex<HashMap<String, ComponentState>>>,
    pub(super) background_tasks: Vec<(&'static str, JoinHandle<()>)>,
    pub(super) poller_cancel: Option<CancellationToken>,
    pub(super) command_receiver: Option<EventReceiver>,
    pub(super) shutdown_sender: Option<oneshot::Sender<ShutdownReason>>,
    pub(super) shutdown_receiver: Option<oneshot::Receiver<ShutdownReason>>,
    pub(super) cancellation_token: CancellationToken,
}

impl CuewatchApp {
    /// Create the application with the configured capture backend, the
    /// on-disk token store and log-based history.
    pub fn new(config: CuewatchConfig) -> Result<Self> {
        let device = capture_device(config.camera.backend)?;
        let store = Arc::new(FileTokenStore::new(&config.auth.token_path));
        Self::with_components(config, device, store, Arc::new(TracingHistorySink))
    }

    /// Create the application around explicit collaborators
    pub fn with_components(
        config: CuewatchConfig,
        device: Arc<dyn CaptureDevice>,
        store: Arc<dyn TokenStore>,
        history: Arc<dyn HistorySink>,
    ) -> Result<Self> {
        let event_bus = EventBus::new(config.system.event_bus_capacity);
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();

        let frame_source = Arc::new(
            FrameSourceBuilder::new()
                .config(config.camera.clone())
                .device(device)
                .build()?,
        );

        let machine = Arc::new(DetectionStateMachine::new(
            config.resolved_delay(),
            config.detection.always_voting,
        ));

        let credentials = match CredentialManager::new(
            &config.auth,
            &config.prediction.api_base_url,
            Duration::from_secs(config.prediction.request_timeout_seconds),
            store,
        ) {
            Ok(manager) => Some(Arc::new(manager)),
            Err(AuthError::MissingClientCredentials) => {
                warn!("No client credentials configured; running detection only");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let actions = Arc::new(ActionOrchestrator::new(
            Arc::clone(&machine),
            credentials.clone().map(PredictionClient::new),
            history,
            event_bus.clone(),
            PredictionRequest::from_config(&config.prediction),
            Duration::from_secs(config.system.stop_cancel_timeout_seconds),
        ));

        let poller = Arc::new(MatchPoller::new(
            Arc::clone(&frame_source),
            Arc::clone(&machine),
            TriggerSet::from_config(&config.triggers),
            config.poll_interval(),
        ));

        let keyboard_handler = Some(KeyboardInputHandler::new(event_bus.clone()));

        Ok(Self {
            config,
            event_bus,
            frame_source,
            machine,
            credentials,
            actions,
            poller,
            keyboard_handler,
            keyboard_enabled: false,
            component_states: Arc::new(Mutex::new(HashMap::new())),
            background_tasks: Vec::new(),
            poller_cancel: None,
            command_receiver: None,
            shutdown_sender: Some(shutdown_sender),
            shutdown_receiver: Some(shutdown_receiver),
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Enable or disable the keyboard input handler
    pub fn set_keyboard_enabled(&mut self, enabled: bool) {
        self.keyboard_enabled = enabled;
    }

    /// Replace the trigger profile while running
    pub fn set_triggers(&self, triggers: TriggerSet) {
        self.poller.set_triggers(triggers);
    }

    pub fn config(&self) -> &CuewatchConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn frame_source(&self) -> &Arc<FrameSource> {
        &self.frame_source
    }

    pub fn machine(&self) -> &Arc<DetectionStateMachine> {
        &self.machine
    }

    /// `None` when no client credentials are configured
    pub fn credentials(&self) -> Option<&Arc<CredentialManager>> {
        self.credentials.as_ref()
    }

    pub fn actions(&self) -> &Arc<ActionOrchestrator> {
        &self.actions
    }

    pub fn poller(&self) -> &Arc<MatchPoller> {
        &self.poller
    }
}
