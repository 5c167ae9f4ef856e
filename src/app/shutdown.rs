use super::{ComponentState, CuewatchApp};
use crate::error::{CuewatchError, Result};
use crate::events::CuewatchEvent;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::timeout;
use tracing::{error, info};

const KEYBOARD_STOP_TIMEOUT: Duration = Duration::from_secs(2);
const POLLER_STOP_TIMEOUT: Duration = Duration::from_secs(2);
const CAMERA_STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Grace period for a resolve or cancel already under way
const DISPATCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

impl CuewatchApp {
    /// Stop everything in dependency order: input first, then matching,
    /// then the live prediction, then capture.
    pub async fn shutdown(&mut self) -> Result<i32> {
        info!("Beginning graceful shutdown");
        let mut exit_code = 0;

        if self.keyboard_enabled {
            if let Some(keyboard_handler) = &self.keyboard_handler {
                let stop = keyboard_handler.stop();
                if let Err(e) = self.stop_component("keyboard", KEYBOARD_STOP_TIMEOUT, stop).await {
                    error!("Error stopping keyboard: {}", e);
                    exit_code = 1;
                }
            }
        }

        if let Some(cancel) = self.poller_cancel.take() {
            cancel.cancel();
        }
        let poller_index = self
            .background_tasks
            .iter()
            .position(|(name, _)| *name == "poller");
        if let Some(index) = poller_index {
            let (_, task) = self.background_tasks.remove(index);
            let stop = async move {
                task.await
                    .map_err(|e| CuewatchError::component("poller".to_string(), e.to_string()))
            };
            if let Err(e) = self.stop_component("poller", POLLER_STOP_TIMEOUT, stop).await {
                error!("Error stopping poller: {}", e);
                exit_code = 1;
            }
        }

        // Cancels the live prediction (bounded) and moves detection to Stopped
        self.set_component_state("detection", ComponentState::Stopping).await;
        self.actions.stop().await;
        self.set_component_state("detection", ComponentState::Stopped).await;

        let frame_source = Arc::clone(&self.frame_source);
        let stop = async move {
            frame_source.stop().await;
            Ok(())
        };
        if let Err(e) = self.stop_component("camera", CAMERA_STOP_TIMEOUT, stop).await {
            error!("Error stopping camera: {}", e);
            exit_code = 1;
        }
        self.event_bus
            .notify(CuewatchEvent::CaptureStatusChanged {
                running: false,
                device_index: self.config.camera.device_index,
                timestamp: SystemTime::now(),
            })
            .await;

        self.set_component_state("actions", ComponentState::Stopping).await;
        self.actions.shutdown(DISPATCH_DRAIN_TIMEOUT).await;
        self.set_component_state("actions", ComponentState::Stopped).await;

        // Event log last so the shutdown itself is logged
        self.cancellation_token.cancel();
        for (name, task) in self.background_tasks.drain(..) {
            if timeout(Duration::from_secs(1), task).await.is_err() {
                error!("Background task '{}' did not exit", name);
            }
        }

        info!("Graceful shutdown completed with exit code: {}", exit_code);
        Ok(exit_code)
    }

    async fn stop_component<F>(&self, component: &str, limit: Duration, stop: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        info!("Stopping {} component", component);
        self.set_component_state(component, ComponentState::Stopping).await;

        match timeout(limit, stop).await {
            Ok(Ok(())) => {
                self.set_component_state(component, ComponentState::Stopped).await;
                info!("{} component stopped", component);
                Ok(())
            }
            Ok(Err(e)) => {
                self.set_component_state(component, ComponentState::Failed).await;
                Err(e)
            }
            Err(_) => {
                self.set_component_state(component, ComponentState::Failed).await;
                Err(CuewatchError::component(component, "stop timeout"))
            }
        }
    }
}
