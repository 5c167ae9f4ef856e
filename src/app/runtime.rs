use super::{CuewatchApp, ShutdownReason};
use crate::detection::Classification;
use crate::error::{CuewatchError, Result};
use crate::events::{CuewatchEvent, OperatorCommand};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::signal;
use tokio::sync::{oneshot, Mutex};
use tracing::{error, info, warn};

impl CuewatchApp {
    /// Run until a signal or an operator quit, then shut down gracefully
    pub async fn run(&mut self) -> Result<i32> {
        info!("Cuewatch is running");

        let shutdown_sender = self
            .shutdown_sender
            .take()
            .ok_or_else(|| CuewatchError::system("Shutdown sender already taken"))?;

        let mut shutdown_receiver = self
            .shutdown_receiver
            .take()
            .ok_or_else(|| CuewatchError::system("Shutdown receiver already taken"))?;

        let mut commands = self
            .command_receiver
            .take()
            .ok_or_else(|| CuewatchError::system("Application was not started"))?;

        self.setup_signal_handlers(shutdown_sender).await;

        let shutdown_reason = loop {
            tokio::select! {
                reason = &mut shutdown_receiver => {
                    break reason.map_err(|_| {
                        CuewatchError::system("Shutdown channel closed unexpectedly")
                    })?;
                }
                event = commands.recv() => match event {
                    Ok(CuewatchEvent::OperatorCommand { command, .. }) => {
                        if let Some(reason) = self.handle_command(command).await {
                            break reason;
                        }
                    }
                    Ok(CuewatchEvent::ShutdownRequested { reason, .. }) => {
                        break ShutdownReason::Requested(reason);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Command channel failed: {}", e);
                        break ShutdownReason::Error(e.to_string());
                    }
                }
            }
        };

        info!("Shutdown initiated: {:?}", shutdown_reason);

        let exit_code = self.shutdown().await?;

        info!("Cuewatch shutdown complete");
        Ok(exit_code)
    }

    /// Apply one operator command. Returns a shutdown reason for `Quit`.
    pub async fn handle_command(&self, command: OperatorCommand) -> Option<ShutdownReason> {
        info!("Operator command: {}", command);

        match command {
            OperatorCommand::Start => {
                if !self.frame_source.is_running() {
                    let camera = &self.config.camera;
                    self.frame_source
                        .start(camera.device_index, camera.resolution.0, camera.resolution.1)
                        .await;
                }
                self.machine.start();
            }
            OperatorCommand::Stop => self.actions.stop().await,
            OperatorCommand::Reset => {
                self.machine.reset();
            }
            OperatorCommand::ToggleAlwaysVoting => {
                self.machine.set_always_voting(!self.machine.always_voting());
            }
            OperatorCommand::LockPrediction => {
                if let Err(e) = self.actions.lock_prediction().await {
                    warn!("Lock failed: {}", e);
                }
            }
            OperatorCommand::ForceWin => {
                self.machine.feed(Classification::Win.into());
            }
            OperatorCommand::ForceLose => {
                self.machine.feed(Classification::Lose.into());
            }
            OperatorCommand::Quit => {
                self.event_bus
                    .notify(CuewatchEvent::ShutdownRequested {
                        timestamp: SystemTime::now(),
                        reason: "operator quit".to_string(),
                    })
                    .await;
                return Some(ShutdownReason::UserRequest);
            }
        }

        None
    }

    async fn setup_signal_handlers(&self, shutdown_sender: oneshot::Sender<ShutdownReason>) {
        let shutdown_sender = Arc::new(Mutex::new(Some(shutdown_sender)));

        // SIGTERM (systemd stop)
        #[cfg(unix)]
        {
            let shutdown_sender_sigterm = Arc::clone(&shutdown_sender);
            tokio::spawn(async move {
                let mut sigterm =
                    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                        Ok(sigterm) => sigterm,
                        Err(e) => {
                            error!("Failed to register SIGTERM handler: {}", e);
                            return;
                        }
                    };
                if sigterm.recv().await.is_some() {
                    info!("Received SIGTERM signal");
                    if let Some(sender) = shutdown_sender_sigterm.lock().await.take() {
                        let _ = sender.send(ShutdownReason::Signal("SIGTERM".to_string()));
                    }
                }
            });
        }

        let shutdown_sender_sigint = Arc::clone(&shutdown_sender);
        tokio::spawn(async move {
            if let Ok(()) = signal::ctrl_c().await {
                info!("Received SIGINT signal (Ctrl+C)");
                if let Some(sender) = shutdown_sender_sigint.lock().await.take() {
                    let _ = sender.send(ShutdownReason::Signal("SIGINT".to_string()));
                }
            }
        });
    }
}
