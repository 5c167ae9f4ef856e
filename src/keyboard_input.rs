use crate::error::Result;
use crate::events::{CuewatchEvent, EventBus, OperatorCommand};
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Operator key bindings
pub fn command_for_key(code: KeyCode) -> Option<OperatorCommand> {
    match code {
        KeyCode::Char('s') => Some(OperatorCommand::Start),
        KeyCode::Char('x') => Some(OperatorCommand::Stop),
        KeyCode::Char('r') => Some(OperatorCommand::Reset),
        KeyCode::Char('a') => Some(OperatorCommand::ToggleAlwaysVoting),
        KeyCode::Char('l') => Some(OperatorCommand::LockPrediction),
        KeyCode::Char('w') => Some(OperatorCommand::ForceWin),
        KeyCode::Char('d') => Some(OperatorCommand::ForceLose),
        KeyCode::Char('q') | KeyCode::Esc => Some(OperatorCommand::Quit),
        _ => None,
    }
}

/// Turns terminal key presses into operator commands on the event bus
pub struct KeyboardInputHandler {
    event_bus: EventBus,
    cancellation_token: CancellationToken,
}

impl KeyboardInputHandler {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            event_bus,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start listening for keyboard input
    pub async fn start(&self) -> Result<()> {
        info!("Starting keyboard input handler");

        let event_bus = self.event_bus.clone();
        let cancellation_token = self.cancellation_token.clone();
        let runtime_handle = Handle::current();

        task::spawn_blocking(move || {
            if let Err(e) = enable_raw_mode() {
                error!("Failed to enable raw mode for keyboard input: {}", e);
                return;
            }

            debug!("Raw mode enabled - keyboard handler active");

            while !cancellation_token.is_cancelled() {
                match event::poll(Duration::from_millis(100)) {
                    Ok(true) => {
                        let Ok(Event::Key(key_event)) = event::read() else {
                            continue;
                        };
                        if key_event.kind != KeyEventKind::Press {
                            continue;
                        }

                        let Some(command) = command_for_key(key_event.code) else {
                            debug!("Unbound key pressed: {:?}", key_event.code);
                            continue;
                        };

                        let event = CuewatchEvent::OperatorCommand {
                            command,
                            timestamp: SystemTime::now(),
                        };
                        let event_bus = event_bus.clone();
                        runtime_handle.spawn(async move {
                            if let Err(e) = event_bus.publish(event).await {
                                warn!("Failed to publish operator command: {}", e);
                            }
                        });

                        if command == OperatorCommand::Quit {
                            break;
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Error polling for keyboard events: {}", e);
                    }
                }
            }

            if let Err(e) = disable_raw_mode() {
                error!("Failed to disable raw mode: {}", e);
            } else {
                debug!("Raw mode disabled");
            }

            debug!("Keyboard input handler task exited");
        });

        Ok(())
    }

    /// Stop the keyboard input handler
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping keyboard input handler");
        self.cancellation_token.cancel();

        // Let the blocking task notice and restore the terminal
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = disable_raw_mode();

        Ok(())
    }
}
