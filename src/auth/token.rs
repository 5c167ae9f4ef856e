use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Account the token was issued for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub login: String,
}

/// Access/refresh token pair. Replaced wholesale on refresh.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub identity: Option<Identity>,
}

impl Token {
    pub fn from_response(response: TokenResponse, identity: Option<Identity>) -> Self {
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at: Utc::now() + Duration::seconds(response.expires_in.max(0)),
            scopes: response.scope,
            identity,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// True when the token expires within `margin` (or already has)
    pub fn expires_within(&self, margin: Duration) -> bool {
        self.expires_at <= Utc::now() + margin
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &mask(&self.access_token))
            .field(
                "refresh_token",
                &self.refresh_token.as_deref().map(mask),
            )
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .field("identity", &self.identity)
            .finish()
    }
}

/// First four characters followed by `***`
pub fn mask(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    format!("{}***", visible)
}

/// Token endpoint response (code exchange and refresh)
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub scope: Vec<String>,
}

/// Token validation endpoint response
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ValidateResponse {
    pub login: String,
    pub user_id: String,
}

/// Error body returned by the token service
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AuthErrorBody {
    pub message: Option<String>,
    pub error: Option<String>,
}

impl AuthErrorBody {
    pub fn describe(body: &str) -> String {
        match serde_json::from_str::<AuthErrorBody>(body) {
            Ok(parsed) => parsed
                .message
                .or(parsed.error)
                .unwrap_or_else(|| body.chars().take(200).collect()),
            Err(_) => body.chars().take(200).collect(),
        }
    }
}
