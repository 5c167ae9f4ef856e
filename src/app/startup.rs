use super::{ComponentState, CuewatchApp};
use crate::error::Result;
use crate::events::{CuewatchEvent, EventFilter};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{error, info, warn};

/// How long startup waits for the first frame before reporting capture down
const CAPTURE_READY_TIMEOUT: Duration = Duration::from_secs(3);

impl CuewatchApp {
    /// Register all components as stopped
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing cuewatch components");

        let mut states = self.component_states.lock().await;
        for component in ["auth", "actions", "camera", "poller", "detection"] {
            states.insert(component.to_string(), ComponentState::Stopped);
        }
        if self.keyboard_enabled {
            states.insert("keyboard".to_string(), ComponentState::Stopped);
        }
        drop(states);

        Ok(())
    }

    /// Start all components. Capture and authentication failures are
    /// reported but do not abort startup.
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting cuewatch");

        self.spawn_event_log();
        self.command_receiver = Some(self.event_bus.receiver(
            EventFilter::EventTypes(vec!["operator_command", "shutdown_requested"]),
            "app-commands",
        ));

        self.start_auth().await;

        // Dispatcher first so no transition goes unhandled
        self.set_component_state("actions", ComponentState::Starting).await;
        self.actions.start();
        self.set_component_state("actions", ComponentState::Running).await;

        self.start_capture().await;

        self.set_component_state("poller", ComponentState::Starting).await;
        let poller = Arc::clone(&self.poller);
        let cancel = self.cancellation_token.child_token();
        self.poller_cancel = Some(cancel.clone());
        self.background_tasks
            .push(("poller", tokio::spawn(async move { poller.run(cancel).await })));
        self.set_component_state("poller", ComponentState::Running).await;

        self.machine.start();
        self.set_component_state("detection", ComponentState::Running).await;

        if self.keyboard_enabled {
            if let Some(keyboard_handler) = &self.keyboard_handler {
                self.set_component_state("keyboard", ComponentState::Starting).await;

                keyboard_handler.start().await.map_err(|e| {
                    error!("Failed to start keyboard handler: {}", e);
                    e
                })?;

                self.set_component_state("keyboard", ComponentState::Running).await;
                info!(
                    "Keyboard controls: s=start x=stop r=reset a=always-voting l=lock w=win d=lose q=quit"
                );
            }
        }

        info!("Cuewatch started");
        Ok(())
    }

    async fn start_auth(&self) {
        let Some(credentials) = &self.credentials else {
            self.set_component_state("auth", ComponentState::Disabled).await;
            self.event_bus
                .notify(CuewatchEvent::AuthStatusChanged {
                    authenticated: false,
                    login: None,
                    reason: "no client credentials configured".to_string(),
                })
                .await;
            return;
        };

        self.set_component_state("auth", ComponentState::Starting).await;
        let status = credentials.initialize().await;
        if status.authenticated {
            info!(
                "Authenticated as {}",
                status.identity.as_ref().map(|i| i.login.as_str()).unwrap_or("unknown")
            );
        } else {
            warn!("Not authenticated ({}); run with --login to sign in", status.reason);
        }

        self.event_bus
            .notify(CuewatchEvent::AuthStatusChanged {
                authenticated: status.authenticated,
                login: status.identity.map(|i| i.login),
                reason: status.reason,
            })
            .await;
        self.set_component_state("auth", ComponentState::Running).await;
    }

    async fn start_capture(&self) {
        let camera = &self.config.camera;
        self.set_component_state("camera", ComponentState::Starting).await;
        self.frame_source
            .start(camera.device_index, camera.resolution.0, camera.resolution.1)
            .await;

        let deadline = Instant::now() + CAPTURE_READY_TIMEOUT;
        while !self.frame_source.is_running() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let running = self.frame_source.is_running();
        if running {
            self.set_component_state("camera", ComponentState::Running).await;
        } else {
            warn!(
                "Capture device {} is not delivering frames; detection will idle",
                camera.device_index
            );
            self.set_component_state("camera", ComponentState::Failed).await;
        }

        self.event_bus
            .notify(CuewatchEvent::CaptureStatusChanged {
                running,
                device_index: camera.device_index,
                timestamp: SystemTime::now(),
            })
            .await;
    }

    /// Mirror every bus event into the log
    fn spawn_event_log(&mut self) {
        let mut receiver = self.event_bus.receiver(EventFilter::All, "event-log");
        let cancel = self.cancellation_token.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = receiver.recv() => match event {
                        Ok(CuewatchEvent::SystemError { component, error }) => {
                            error!(target: "cuewatch::events", "Error in {}: {}", component, error);
                        }
                        Ok(event) => info!(target: "cuewatch::events", "{}", event.description()),
                        Err(_) => break,
                    }
                }
            }
        });
        self.background_tasks.push(("event-log", task));
    }
}
