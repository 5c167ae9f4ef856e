use thiserror::Error;

#[derive(Error, Debug)]
pub enum CuewatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("Matching error: {0}")]
    Match(#[from] MatchError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Prediction error: {0}")]
    Prediction(#[from] PredictionError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl CuewatchError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }
}

/// Capture device failures. These never escape the capture loop; they are
/// reduced to `is_running() == false`.
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Failed to open capture device {device}: {details}")]
    DeviceOpen { device: u32, details: String },

    #[error("Frame read failed: {details}")]
    Read { details: String },

    #[error("Capture device configuration failed: {details}")]
    Configuration { details: String },

    #[error("Capture backend '{backend}' is not available in this build")]
    BackendUnavailable { backend: String },
}

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("Failed to load reference image {path}: {details}")]
    ReferenceLoad { path: String, details: String },
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Client credentials are not configured (client_id and client_secret are required)")]
    MissingClientCredentials,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Session must be re-authenticated: {reason}")]
    ReauthenticationRequired { reason: String },

    #[error("Token refresh failed: {reason}")]
    RefreshFailed { reason: String },

    #[error("Token service unavailable ({status}): {details}")]
    ServiceUnavailable { status: u16, details: String },

    #[error("Interactive authentication failed: {reason}")]
    Interactive { reason: String },

    #[error("Token store error: {details}")]
    Store { details: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum PredictionError {
    #[error("Prediction service rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Prediction service returned an unexpected response: {details}")]
    InvalidResponse { details: String },

    #[error("Prediction {id} has no outcome at index {index}")]
    MissingOutcome { id: String, index: usize },

    #[error("No authenticated identity available for the prediction service")]
    NoIdentity,

    #[error("No live prediction")]
    NoLivePrediction,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Failed to publish event: {details}")]
    PublishFailed { details: String },

    #[error("Event channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, CuewatchError>;
