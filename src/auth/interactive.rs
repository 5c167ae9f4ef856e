use super::manager::CredentialManager;
use super::token::{Identity, Token};
use crate::error::AuthError;
use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

const LISTENER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Query parameters delivered to the redirect listener
#[derive(Debug, Clone, Default, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Clone)]
struct CallbackState {
    sender: Arc<Mutex<Option<oneshot::Sender<CallbackParams>>>>,
}

async fn callback_handler(
    State(state): State<CallbackState>,
    Query(params): Query<CallbackParams>,
) -> Html<&'static str> {
    let sender = state.sender.lock().take();
    match sender {
        Some(sender) => {
            let _ = sender.send(params);
            Html("<html><body><h3>cuewatch: authorization received.</h3><p>You can close this window.</p></body></html>")
        }
        None => Html("<html><body><p>cuewatch: authorization already handled.</p></body></html>"),
    }
}

impl CredentialManager {
    /// Run the browser consent flow: listen for the redirect on
    /// `127.0.0.1:<redirect_port>`, hand the authorization URL to `open`,
    /// wait (bounded) for the one-time code and exchange it for a token.
    /// Only one flow may run at a time. The listener is torn down on every
    /// exit path.
    pub async fn authenticate_interactive<F>(
        &self,
        cancel: &CancellationToken,
        open: F,
    ) -> Result<Identity, AuthError>
    where
        F: FnOnce(&Url),
    {
        let _flow = self
            .interactive_gate
            .try_lock()
            .map_err(|_| AuthError::Interactive {
                reason: "another interactive authentication is in progress".to_string(),
            })?;

        let listener = TcpListener::bind(("127.0.0.1", self.redirect_port))
            .await
            .map_err(|e| AuthError::Interactive {
                reason: format!("cannot listen on port {}: {}", self.redirect_port, e),
            })?;
        let port = listener
            .local_addr()
            .map_err(|e| AuthError::Interactive {
                reason: e.to_string(),
            })?
            .port();

        let redirect_uri = format!("http://localhost:{}", port);
        let state = Uuid::new_v4().simple().to_string();
        let authorize_url = self.authorize_url(&redirect_uri, &state)?;

        let (sender, receiver) = oneshot::channel();
        let app = Router::new()
            .route("/", get(callback_handler))
            .with_state(CallbackState {
                sender: Arc::new(Mutex::new(Some(sender))),
            });

        let stop = CancellationToken::new();
        let server_stop = stop.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_stop.cancelled().await })
                .await
        });

        info!("Waiting for authorization on {}", redirect_uri);
        open(&authorize_url);

        let received = tokio::select! {
            _ = cancel.cancelled() => Err(AuthError::Cancelled),
            _ = tokio::time::sleep(self.interactive_timeout) => Err(AuthError::Interactive {
                reason: format!("no authorization received within {:?}", self.interactive_timeout),
            }),
            params = receiver => params.map_err(|_| AuthError::Interactive {
                reason: "redirect listener closed".to_string(),
            }),
        };

        stop.cancel();
        match tokio::time::timeout(LISTENER_SHUTDOWN_TIMEOUT, server).await {
            Ok(Ok(Ok(()))) => debug!("Redirect listener closed"),
            Ok(Ok(Err(e))) => warn!("Redirect listener error: {}", e),
            Ok(Err(e)) => warn!("Redirect listener task failed: {}", e),
            Err(_) => warn!("Redirect listener did not close within {:?}", LISTENER_SHUTDOWN_TIMEOUT),
        }

        let params = received?;
        if let Some(error) = params.error {
            return Err(AuthError::Interactive {
                reason: format!(
                    "authorization denied: {}",
                    params.error_description.unwrap_or(error)
                ),
            });
        }
        if params.state.as_deref() != Some(state.as_str()) {
            return Err(AuthError::Interactive {
                reason: "state mismatch in authorization redirect".to_string(),
            });
        }
        let code = params.code.ok_or_else(|| AuthError::Interactive {
            reason: "authorization redirect carried no code".to_string(),
        })?;

        let grant = [
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
        ];
        let response = self
            .request_token(&grant)
            .await
            .map_err(|e| AuthError::Interactive {
                reason: format!("code exchange failed: {}", e),
            })?;
        let identity = self.validate(&response.access_token).await?;

        self.install(Token::from_response(response, Some(identity.clone())))
            .await;
        info!("Authenticated as {}", identity.login);
        Ok(identity)
    }

    fn authorize_url(&self, redirect_uri: &str, state: &str) -> Result<Url, AuthError> {
        let scopes = self.scopes.join(" ");
        Url::parse_with_params(
            &format!("{}/authorize", self.auth_base_url),
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", scopes.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| AuthError::Interactive {
            reason: format!("invalid authorization URL: {}", e),
        })
    }
}
