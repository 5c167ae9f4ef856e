//! In-process stand-in for the token and prediction services.

use crate::auth::{CredentialManager, MemoryTokenStore, Token, TokenResponse};
use crate::config::AuthConfig;
use axum::extract::{Form, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const USER_ID: &str = "1234";
pub const LOGIN: &str = "streamer";

/// Knobs and counters shared with the handlers
#[derive(Default)]
pub struct MockState {
    pub token_requests: AtomicUsize,
    pub validate_requests: AtomicUsize,
    pub revoke_requests: AtomicUsize,
    pub api_requests: AtomicUsize,
    pub creates: AtomicUsize,
    pub fetches: AtomicUsize,
    pub patches: Mutex<Vec<String>>,
    pub last_create: Mutex<Option<Value>>,
    /// Decoded query of the latest prediction lookup
    pub last_query: Mutex<HashMap<String, String>>,
    issued: AtomicUsize,

    /// Number of upcoming API requests answered with 401
    pub unauthorized_remaining: AtomicUsize,
    pub reject_refresh: AtomicBool,
    pub reject_validation: AtomicBool,
    pub fail_predictions: AtomicBool,
    pub token_delay_ms: AtomicU64,
    pub api_delay_ms: AtomicU64,
    /// Lifetime of issued tokens
    pub expires_in: AtomicU64,
}

impl MockState {
    pub fn patch_statuses(&self) -> Vec<String> {
        self.patches.lock().clone()
    }

    fn issue(&self) -> usize {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub struct MockService {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
    shutdown: CancellationToken,
}

impl MockService {
    pub async fn start() -> Self {
        let state = Arc::new(MockState {
            expires_in: AtomicU64::new(14_400),
            ..MockState::default()
        });

        let app = Router::new()
            .route("/oauth2/token", post(token_handler))
            .route("/oauth2/validate", get(validate_handler))
            .route("/oauth2/revoke", post(revoke_handler))
            .route("/helix/ping", get(ping_handler))
            .route(
                "/helix/predictions",
                post(create_handler).patch(patch_handler).get(get_handler),
            )
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                .await;
        });

        Self {
            addr,
            state,
            shutdown,
        }
    }

    pub fn auth_base_url(&self) -> String {
        format!("http://{}/oauth2", self.addr)
    }

    pub fn api_base_url(&self) -> String {
        format!("http://{}/helix", self.addr)
    }

    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            client_id: Some("test-client".to_string()),
            client_secret: Some("test-secret".to_string()),
            redirect_port: 0,
            scopes: vec!["channel:manage:predictions".to_string()],
            auth_base_url: self.auth_base_url(),
            token_path: String::new(),
            interactive_timeout_seconds: 5,
            refresh_margin_seconds: 60,
        }
    }

    /// Credential manager backed by a memory store holding `token`
    pub fn credentials(&self, token: Option<Token>) -> (Arc<CredentialManager>, Arc<MemoryTokenStore>) {
        let store = Arc::new(match token {
            Some(token) => MemoryTokenStore::with_token(token),
            None => MemoryTokenStore::new(),
        });
        let manager = CredentialManager::new(
            &self.auth_config(),
            &self.api_base_url(),
            Duration::from_secs(5),
            store.clone(),
        )
        .unwrap();
        (Arc::new(manager), store)
    }

    /// Credential manager already holding a valid session
    pub async fn authenticated(&self) -> Arc<CredentialManager> {
        let (manager, _) = self.credentials(Some(token_expiring_in(3600)));
        assert!(manager.initialize().await.authenticated);
        manager
    }
}

impl Drop for MockService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn token_expiring_in(seconds: i64) -> Token {
    Token::from_response(
        TokenResponse {
            access_token: "stored-access".to_string(),
            refresh_token: Some("stored-refresh".to_string()),
            expires_in: seconds,
            scope: Vec::new(),
        },
        Some(crate::auth::Identity {
            user_id: USER_ID.to_string(),
            login: LOGIN.to_string(),
        }),
    )
}

/// Poll `condition` for up to two seconds
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "status": status.as_u16(), "message": message })),
    )
        .into_response()
}

async fn delay(ms: &AtomicU64) {
    let ms = ms.load(Ordering::SeqCst);
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

async fn token_handler(
    State(state): State<Arc<MockState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.token_requests.fetch_add(1, Ordering::SeqCst);
    delay(&state.token_delay_ms).await;

    let grant = form.get("grant_type").map(String::as_str).unwrap_or("");
    if grant == "refresh_token" && state.reject_refresh.load(Ordering::SeqCst) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid refresh token");
    }
    if grant == "authorization_code" && form.get("code").map(String::as_str) != Some("good-code") {
        return error_response(StatusCode::BAD_REQUEST, "Invalid authorization code");
    }

    let n = state.issue();
    Json(json!({
        "access_token": format!("access-{}", n),
        "refresh_token": format!("refresh-{}", n),
        "expires_in": state.expires_in.load(Ordering::SeqCst),
        "scope": ["channel:manage:predictions"],
        "token_type": "bearer",
    }))
    .into_response()
}

async fn validate_handler(State(state): State<Arc<MockState>>) -> Response {
    state.validate_requests.fetch_add(1, Ordering::SeqCst);
    if state.reject_validation.load(Ordering::SeqCst) {
        return error_response(StatusCode::UNAUTHORIZED, "invalid access token");
    }
    Json(json!({
        "client_id": "test-client",
        "login": LOGIN,
        "user_id": USER_ID,
        "scopes": ["channel:manage:predictions"],
        "expires_in": 3600,
    }))
    .into_response()
}

async fn revoke_handler(State(state): State<Arc<MockState>>) -> StatusCode {
    state.revoke_requests.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

/// Common API gate: counts the request and applies 401/failure knobs
async fn api_gate(state: &MockState) -> Option<Response> {
    state.api_requests.fetch_add(1, Ordering::SeqCst);
    delay(&state.api_delay_ms).await;

    let remaining = state.unauthorized_remaining.load(Ordering::SeqCst);
    if remaining > 0 {
        if remaining != usize::MAX {
            state.unauthorized_remaining.fetch_sub(1, Ordering::SeqCst);
        }
        return Some(error_response(StatusCode::UNAUTHORIZED, "Invalid OAuth token"));
    }
    None
}

fn prediction(status: &str, title: &str) -> Value {
    json!({
        "data": [{
            "id": "pred-1",
            "broadcaster_id": USER_ID,
            "title": title,
            "status": status,
            "outcomes": [
                { "id": "outcome-win", "title": "Win", "color": "BLUE" },
                { "id": "outcome-lose", "title": "Lose", "color": "PINK" }
            ]
        }]
    })
}

async fn ping_handler(State(state): State<Arc<MockState>>) -> Response {
    if let Some(rejection) = api_gate(&state).await {
        return rejection;
    }
    Json(json!({ "ok": true })).into_response()
}

async fn create_handler(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    if let Some(rejection) = api_gate(&state).await {
        return rejection;
    }
    state.creates.fetch_add(1, Ordering::SeqCst);
    if state.fail_predictions.load(Ordering::SeqCst) {
        return error_response(StatusCode::BAD_REQUEST, "prediction already active");
    }
    let title = body["title"].as_str().unwrap_or_default().to_string();
    *state.last_create.lock() = Some(body);
    Json(prediction("ACTIVE", &title)).into_response()
}

async fn patch_handler(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    if let Some(rejection) = api_gate(&state).await {
        return rejection;
    }
    let status = body["status"].as_str().unwrap_or_default().to_string();
    let recorded = match body["winning_outcome_id"].as_str() {
        Some(outcome) => format!("{}:{}", status, outcome),
        None => status.clone(),
    };
    state.patches.lock().push(recorded);
    if state.fail_predictions.load(Ordering::SeqCst) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "prediction service unavailable");
    }
    Json(prediction(&status, "Will we win?")).into_response()
}

async fn get_handler(
    State(state): State<Arc<MockState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Some(rejection) = api_gate(&state).await {
        return rejection;
    }
    state.fetches.fetch_add(1, Ordering::SeqCst);
    *state.last_query.lock() = query;
    Json(prediction("ACTIVE", "Will we win?")).into_response()
}
