use crate::matcher::{Roi, TriggerKind};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CuewatchConfig {
    pub camera: CameraConfig,
    pub detection: DetectionConfig,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    pub auth: AuthConfig,
    pub prediction: PredictionConfig,
    pub system: SystemConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Capture device index (e.g., 0 for /dev/video0)
    #[serde(default = "default_device_index")]
    pub device_index: u32,

    /// Requested capture resolution (width, height)
    #[serde(default = "default_camera_resolution")]
    pub resolution: (u32, u32),

    /// Target capture rate; the loop throttles itself to this
    #[serde(default = "default_camera_fps")]
    pub fps: u32,

    /// Number of device indices probed by enumeration
    #[serde(default = "default_probe_limit")]
    pub probe_limit: u32,

    #[serde(default)]
    pub backend: CaptureBackend,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CaptureBackend {
    Gstreamer,
    #[default]
    TestPattern,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DetectionConfig {
    /// Period of the matching loop in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Delay before a resolved round re-arms automatically
    #[serde(default = "default_resolved_delay_seconds")]
    pub resolved_delay_seconds: u64,

    /// Skip the idle phase and loop between voting and resolved
    #[serde(default)]
    pub always_voting: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TriggerConfig {
    pub kind: TriggerKind,
    pub roi: Roi,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// Path to the reference image; a trigger without one never matches
    pub reference: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AuthConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,

    /// Local port for the OAuth redirect listener
    #[serde(default = "default_redirect_port")]
    pub redirect_port: u16,

    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,

    #[serde(default = "default_auth_base_url")]
    pub auth_base_url: String,

    /// Where the token pair is persisted between runs
    #[serde(default = "default_token_path")]
    pub token_path: String,

    #[serde(default = "default_interactive_timeout_seconds")]
    pub interactive_timeout_seconds: u64,

    /// Tokens expiring within this window are refreshed before use
    #[serde(default = "default_refresh_margin_seconds")]
    pub refresh_margin_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PredictionConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    #[serde(default = "default_prediction_title")]
    pub title: String,

    #[serde(default = "default_win_label")]
    pub win_label: String,

    #[serde(default = "default_lose_label")]
    pub lose_label: String,

    #[serde(default = "default_prediction_duration")]
    pub duration_seconds: u32,

    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemConfig {
    /// Event bus capacity
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Upper bound on the cancel call issued by an operator stop
    #[serde(default = "default_stop_cancel_timeout")]
    pub stop_cancel_timeout_seconds: u64,
}

impl CuewatchConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("cuewatch.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("camera.device_index", default_device_index())?
            .set_default(
                "camera.resolution",
                vec![default_camera_resolution().0, default_camera_resolution().1],
            )?
            .set_default("camera.fps", default_camera_fps())?
            .set_default("camera.probe_limit", default_probe_limit())?
            .set_default("camera.backend", "test_pattern")?
            .set_default(
                "detection.poll_interval_ms",
                default_poll_interval_ms() as i64,
            )?
            .set_default(
                "detection.resolved_delay_seconds",
                default_resolved_delay_seconds() as i64,
            )?
            .set_default("detection.always_voting", false)?
            .set_default("auth.redirect_port", default_redirect_port())?
            .set_default("auth.scopes", default_scopes())?
            .set_default("auth.auth_base_url", default_auth_base_url())?
            .set_default("auth.token_path", default_token_path())?
            .set_default(
                "auth.interactive_timeout_seconds",
                default_interactive_timeout_seconds() as i64,
            )?
            .set_default(
                "auth.refresh_margin_seconds",
                default_refresh_margin_seconds() as i64,
            )?
            .set_default("prediction.api_base_url", default_api_base_url())?
            .set_default("prediction.title", default_prediction_title())?
            .set_default("prediction.win_label", default_win_label())?
            .set_default("prediction.lose_label", default_lose_label())?
            .set_default("prediction.duration_seconds", default_prediction_duration())?
            .set_default(
                "prediction.request_timeout_seconds",
                default_request_timeout_seconds() as i64,
            )?
            .set_default(
                "system.event_bus_capacity",
                default_event_bus_capacity() as i64,
            )?
            .set_default(
                "system.stop_cancel_timeout_seconds",
                default_stop_cancel_timeout() as i64,
            )?
            .add_source(File::with_name(&path_str).required(false))
            // CUEWATCH_AUTH__CLIENT_SECRET -> auth.client_secret
            .add_source(
                Environment::with_prefix("CUEWATCH")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: CuewatchConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config.redacted());

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera.resolution.0 == 0 || self.camera.resolution.1 == 0 {
            return Err(ConfigError::Message(
                "Camera resolution must be greater than 0".to_string(),
            ));
        }

        if self.camera.fps == 0 {
            return Err(ConfigError::Message(
                "Camera fps must be greater than 0".to_string(),
            ));
        }

        if !(50..=1000).contains(&self.detection.poll_interval_ms) {
            return Err(ConfigError::Message(
                "Detection poll_interval_ms must be between 50 and 1000".to_string(),
            ));
        }

        if self.detection.resolved_delay_seconds < 1 {
            return Err(ConfigError::Message(
                "Detection resolved_delay_seconds must be at least 1".to_string(),
            ));
        }

        for trigger in &self.triggers {
            if !(0.0..=1.0).contains(&trigger.threshold) {
                return Err(ConfigError::Message(format!(
                    "Trigger '{}' threshold must be within [0, 1]",
                    trigger.kind
                )));
            }
            if trigger.roi.width < 0 || trigger.roi.height < 0 {
                return Err(ConfigError::Message(format!(
                    "Trigger '{}' region must have non-negative size",
                    trigger.kind
                )));
            }
        }

        if self.system.event_bus_capacity == 0 {
            return Err(ConfigError::Message(
                "Event bus capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.detection.poll_interval_ms)
    }

    pub fn resolved_delay(&self) -> Duration {
        Duration::from_secs(self.detection.resolved_delay_seconds.max(1))
    }

    /// Copy of the configuration that is safe to log
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.auth.client_secret.is_some() {
            copy.auth.client_secret = Some("***".to_string());
        }
        copy
    }
}

impl Default for CuewatchConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig {
                device_index: default_device_index(),
                resolution: default_camera_resolution(),
                fps: default_camera_fps(),
                probe_limit: default_probe_limit(),
                backend: CaptureBackend::default(),
            },
            detection: DetectionConfig {
                poll_interval_ms: default_poll_interval_ms(),
                resolved_delay_seconds: default_resolved_delay_seconds(),
                always_voting: false,
            },
            triggers: Vec::new(),
            auth: AuthConfig {
                client_id: None,
                client_secret: None,
                redirect_port: default_redirect_port(),
                scopes: default_scopes(),
                auth_base_url: default_auth_base_url(),
                token_path: default_token_path(),
                interactive_timeout_seconds: default_interactive_timeout_seconds(),
                refresh_margin_seconds: default_refresh_margin_seconds(),
            },
            prediction: PredictionConfig {
                api_base_url: default_api_base_url(),
                title: default_prediction_title(),
                win_label: default_win_label(),
                lose_label: default_lose_label(),
                duration_seconds: default_prediction_duration(),
                request_timeout_seconds: default_request_timeout_seconds(),
            },
            system: SystemConfig {
                event_bus_capacity: default_event_bus_capacity(),
                stop_cancel_timeout_seconds: default_stop_cancel_timeout(),
            },
        }
    }
}

// Default value functions
fn default_device_index() -> u32 {
    0
}
fn default_camera_resolution() -> (u32, u32) {
    (1280, 720)
}
fn default_camera_fps() -> u32 {
    30
}
fn default_probe_limit() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    120
}
fn default_resolved_delay_seconds() -> u64 {
    5
}
fn default_threshold() -> f32 {
    0.8
}

fn default_redirect_port() -> u16 {
    7878
}
fn default_scopes() -> Vec<String> {
    vec![
        "channel:read:predictions".to_string(),
        "channel:manage:predictions".to_string(),
    ]
}
fn default_auth_base_url() -> String {
    "https://id.twitch.tv/oauth2".to_string()
}
fn default_token_path() -> String {
    "./cuewatch-token.json".to_string()
}
fn default_interactive_timeout_seconds() -> u64 {
    300
}
fn default_refresh_margin_seconds() -> u64 {
    60
}

fn default_api_base_url() -> String {
    "https://api.twitch.tv/helix".to_string()
}
fn default_prediction_title() -> String {
    "Will we win this match?".to_string()
}
fn default_win_label() -> String {
    "Win".to_string()
}
fn default_lose_label() -> String {
    "Lose".to_string()
}
fn default_prediction_duration() -> u32 {
    120
}
fn default_request_timeout_seconds() -> u64 {
    10
}

fn default_event_bus_capacity() -> usize {
    64
}
fn default_stop_cancel_timeout() -> u64 {
    5
}
