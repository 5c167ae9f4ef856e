use super::store::TokenStore;
use super::token::{AuthErrorBody, Identity, Token, TokenResponse, ValidateResponse};
use crate::config::AuthConfig;
use crate::error::AuthError;
use parking_lot::RwLock;
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of restoring a session at startup
#[derive(Debug, Clone, PartialEq)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub reason: String,
    pub identity: Option<Identity>,
}

impl AuthStatus {
    fn authenticated(identity: Option<Identity>) -> Self {
        Self {
            authenticated: true,
            reason: "authenticated".to_string(),
            identity,
        }
    }

    fn unauthenticated<S: Into<String>>(reason: S) -> Self {
        Self {
            authenticated: false,
            reason: reason.into(),
            identity: None,
        }
    }
}

/// Owns the single authenticated session.
///
/// The token lives behind a short-held lock and is replaced wholesale. A
/// separate async gate serializes refreshes; a caller that acquires the gate
/// after someone else already rotated the token returns without another
/// exchange.
pub struct CredentialManager {
    pub(super) http: Client,
    pub(super) client_id: String,
    pub(super) client_secret: String,
    pub(super) auth_base_url: String,
    api_base_url: String,
    pub(super) scopes: Vec<String>,
    pub(super) redirect_port: u16,
    pub(super) interactive_timeout: Duration,
    refresh_margin: chrono::Duration,
    pub(super) store: Arc<dyn TokenStore>,
    token: RwLock<Option<Token>>,
    refresh_gate: Mutex<()>,
    pub(super) interactive_gate: Mutex<()>,
}

impl CredentialManager {
    /// Fails with `MissingClientCredentials` when the client id or secret is
    /// not configured.
    pub fn new(
        config: &AuthConfig,
        api_base_url: &str,
        request_timeout: Duration,
        store: Arc<dyn TokenStore>,
    ) -> Result<Self, AuthError> {
        let client_id = non_empty(&config.client_id).ok_or(AuthError::MissingClientCredentials)?;
        let client_secret =
            non_empty(&config.client_secret).ok_or(AuthError::MissingClientCredentials)?;

        let http = Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            http,
            client_id,
            client_secret,
            auth_base_url: config.auth_base_url.trim_end_matches('/').to_string(),
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            scopes: config.scopes.clone(),
            redirect_port: config.redirect_port,
            interactive_timeout: Duration::from_secs(config.interactive_timeout_seconds),
            refresh_margin: chrono::Duration::seconds(config.refresh_margin_seconds as i64),
            store,
            token: RwLock::new(None),
            refresh_gate: Mutex::new(()),
            interactive_gate: Mutex::new(()),
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.read().is_some()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.token.read().as_ref().and_then(|t| t.identity.clone())
    }

    pub fn current_token(&self) -> Option<Token> {
        self.token.read().clone()
    }

    /// Restore the persisted session. Never fails: an absent, expired or
    /// rejected token resolves to an unauthenticated status with a reason.
    pub async fn initialize(&self) -> AuthStatus {
        let stored = match self.store.load().await {
            Ok(token) => token,
            Err(e) => {
                warn!("Could not read stored token: {}", e);
                None
            }
        };

        let Some(token) = stored else {
            *self.token.write() = None;
            return AuthStatus::unauthenticated("no stored session");
        };

        let access_token = token.access_token.clone();
        let expired = token.is_expired();
        *self.token.write() = Some(token);

        if expired {
            debug!("Stored token has expired");
        } else {
            match self.validate(&access_token).await {
                Ok(identity) => {
                    self.update_identity(&access_token, identity.clone()).await;
                    info!("Restored session for {}", identity.login);
                    return AuthStatus::authenticated(Some(identity));
                }
                Err(e) => debug!("Stored token did not validate: {}", e),
            }
        }

        match self.refresh_if_current(Some(access_token)).await {
            Ok(()) => AuthStatus::authenticated(self.identity()),
            Err(e) => AuthStatus::unauthenticated(format!("stored session could not be refreshed: {}", e)),
        }
    }

    /// Rotate the token pair. Concurrent callers collapse into one exchange.
    /// Failure clears the session.
    pub async fn refresh(&self) -> Result<(), AuthError> {
        let observed = self.current_token().map(|t| t.access_token);
        self.refresh_if_current(observed).await
    }

    async fn refresh_if_current(&self, observed: Option<String>) -> Result<(), AuthError> {
        let _gate = self.refresh_gate.lock().await;

        let current = self.current_token().ok_or(AuthError::NotAuthenticated)?;
        if observed.as_deref() != Some(current.access_token.as_str())
            && !current.expires_within(self.refresh_margin)
        {
            debug!("Token already refreshed by a concurrent caller");
            return Ok(());
        }

        let Some(refresh_token) = current.refresh_token.clone() else {
            self.clear_session(true).await;
            return Err(AuthError::RefreshFailed {
                reason: "no refresh token available".to_string(),
            });
        };

        debug!("Refreshing access token");
        let grant = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];
        match self.request_token(&grant).await {
            Ok(response) => {
                let identity = match current.identity.clone() {
                    Some(identity) => Some(identity),
                    None => self.validate(&response.access_token).await.ok(),
                };
                let mut token = Token::from_response(response, identity);
                if token.refresh_token.is_none() {
                    token.refresh_token = Some(refresh_token);
                }

                if let Err(e) = self.store.save(&token).await {
                    warn!("Refreshed token could not be persisted: {}", e);
                }
                info!("Access token refreshed (expires {})", token.expires_at);
                *self.token.write() = Some(token);
                Ok(())
            }
            Err(e) => {
                // A rejected refresh token is gone for good; a transport
                // failure keeps the stored pair for the next run.
                let rejected = matches!(e, AuthError::RefreshFailed { .. });
                warn!("Token refresh failed: {}", e);
                self.clear_session(rejected).await;
                Err(match e {
                    AuthError::RefreshFailed { .. } => e,
                    other => AuthError::RefreshFailed {
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    /// Send a request to the API with the current token. A near-expiry token
    /// is refreshed first; an unauthorized response triggers exactly one
    /// refresh and retry. Other failures are returned unchanged.
    pub async fn call_authenticated(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        cancel: &CancellationToken,
    ) -> Result<Response, AuthError> {
        let access_token = self.usable_token().await?;
        let response = self
            .send(method.clone(), path, body, &access_token, cancel)
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!("{} {} was unauthorized; refreshing token and retrying once", method, path);
        self.refresh_if_current(Some(access_token))
            .await
            .map_err(|e| AuthError::ReauthenticationRequired {
                reason: e.to_string(),
            })?;

        let access_token = self
            .current_token()
            .map(|t| t.access_token)
            .ok_or(AuthError::NotAuthenticated)?;
        let response = self
            .send(method.clone(), path, body, &access_token, cancel)
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(AuthError::ReauthenticationRequired {
                reason: format!("{} {} still unauthorized after token refresh", method, path),
            });
        }
        Ok(response)
    }

    /// Revoke the token remotely (best effort) and forget the session
    pub async fn logout(&self) {
        let token = self.token.write().take();
        if let Some(token) = token {
            let form = [
                ("client_id", self.client_id.as_str()),
                ("token", token.access_token.as_str()),
            ];
            match self
                .http
                .post(format!("{}/revoke", self.auth_base_url))
                .form(&form)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => info!("Token revoked"),
                Ok(response) => warn!("Token revocation returned {}", response.status()),
                Err(e) => warn!("Token revocation failed: {}", e),
            }
        }

        if let Err(e) = self.store.delete().await {
            warn!("Stored token could not be deleted: {}", e);
        }
        info!("Logged out");
    }

    async fn usable_token(&self) -> Result<String, AuthError> {
        let token = self.current_token().ok_or(AuthError::NotAuthenticated)?;
        if !token.expires_within(self.refresh_margin) {
            return Ok(token.access_token);
        }

        debug!("Access token is near expiry; refreshing before use");
        self.refresh_if_current(Some(token.access_token)).await?;
        self.current_token()
            .map(|t| t.access_token)
            .ok_or(AuthError::NotAuthenticated)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        access_token: &str,
        cancel: &CancellationToken,
    ) -> Result<Response, AuthError> {
        let url = format!("{}/{}", self.api_base_url, path.trim_start_matches('/'));
        let mut request = self
            .http
            .request(method, url)
            .header("Client-Id", self.client_id.as_str())
            .bearer_auth(access_token);
        if let Some(body) = body {
            request = request.json(body);
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(AuthError::Cancelled),
            response = request.send() => Ok(response?),
        }
    }

    /// POST to the token endpoint with client credentials plus `grant`.
    /// 4xx responses are reported as `RefreshFailed`.
    pub(super) async fn request_token(
        &self,
        grant: &[(&str, &str)],
    ) -> Result<TokenResponse, AuthError> {
        let mut form = vec![
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        form.extend_from_slice(grant);

        let response = self
            .http
            .post(format!("{}/token", self.auth_base_url))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let details = AuthErrorBody::describe(&body);
            return Err(if status.is_client_error() {
                AuthError::RefreshFailed {
                    reason: format!("token endpoint returned {}: {}", status.as_u16(), details),
                }
            } else {
                AuthError::ServiceUnavailable {
                    status: status.as_u16(),
                    details,
                }
            });
        }

        Ok(response.json().await?)
    }

    pub(super) async fn validate(&self, access_token: &str) -> Result<Identity, AuthError> {
        let response = self
            .http
            .get(format!("{}/validate", self.auth_base_url))
            .header(reqwest::header::AUTHORIZATION, format!("OAuth {}", access_token))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::ReauthenticationRequired {
                reason: format!(
                    "token validation returned {}: {}",
                    status.as_u16(),
                    AuthErrorBody::describe(&body)
                ),
            });
        }

        let validated: ValidateResponse = response.json().await?;
        Ok(Identity {
            user_id: validated.user_id,
            login: validated.login,
        })
    }

    /// Install a freshly issued token and persist it
    pub(super) async fn install(&self, token: Token) {
        if let Err(e) = self.store.save(&token).await {
            warn!("Token could not be persisted: {}", e);
        }
        *self.token.write() = Some(token);
    }

    async fn update_identity(&self, access_token: &str, identity: Identity) {
        let changed = {
            let mut guard = self.token.write();
            match guard.as_mut() {
                Some(token)
                    if token.access_token == access_token
                        && token.identity.as_ref() != Some(&identity) =>
                {
                    token.identity = Some(identity);
                    Some(token.clone())
                }
                _ => None,
            }
        };

        if let Some(token) = changed {
            if let Err(e) = self.store.save(&token).await {
                warn!("Token identity could not be persisted: {}", e);
            }
        }
    }

    async fn clear_session(&self, forget: bool) {
        *self.token.write() = None;
        if forget {
            if let Err(e) = self.store.delete().await {
                warn!("Stored token could not be deleted: {}", e);
            }
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
