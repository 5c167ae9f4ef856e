use super::types::{
    CreatePredictionBody, EndPredictionBody, OutcomeTitle, PredictionEnvelope, PredictionHandle,
    PredictionRequest, PredictionStatus, ServiceErrorBody,
};
use crate::auth::{CredentialManager, Identity};
use crate::error::PredictionError;
use reqwest::{Method, Response};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::form_urlencoded;

const PREDICTIONS_PATH: &str = "predictions";

/// Prediction lifecycle calls. Every request goes through the credential
/// manager and inherits its refresh/retry handling.
#[derive(Clone)]
pub struct PredictionClient {
    credentials: Arc<CredentialManager>,
}

impl PredictionClient {
    pub fn new(credentials: Arc<CredentialManager>) -> Self {
        Self { credentials }
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_authenticated()
    }

    /// Open a two-outcome prediction
    pub async fn create(
        &self,
        request: &PredictionRequest,
        cancel: &CancellationToken,
    ) -> Result<PredictionHandle, PredictionError> {
        let identity = self.identity()?;
        let body = CreatePredictionBody {
            broadcaster_id: &identity.user_id,
            title: &request.title,
            outcomes: request
                .outcomes
                .iter()
                .map(|title| OutcomeTitle { title })
                .collect(),
            prediction_window: request.window_seconds,
        };

        let response = self.send(Method::POST, PREDICTIONS_PATH, Some(&body), cancel).await?;
        let mut handle: PredictionHandle = read_prediction(response).await?.into();
        if handle.outcome_ids.len() < 2 {
            return Err(PredictionError::InvalidResponse {
                details: format!("prediction {} has {} outcomes", handle.id, handle.outcome_ids.len()),
            });
        }
        handle.status = PredictionStatus::Created;

        info!("Created prediction {} ({})", handle.id, request.title);
        Ok(handle)
    }

    /// Close voting; the prediction can still be resolved
    pub async fn lock(&self, id: &str, cancel: &CancellationToken) -> Result<(), PredictionError> {
        self.end(id, "LOCKED", None, cancel).await
    }

    pub async fn resolve(
        &self,
        id: &str,
        winning_outcome_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), PredictionError> {
        self.end(id, "RESOLVED", Some(winning_outcome_id), cancel).await
    }

    /// Cancel and refund
    pub async fn cancel(&self, id: &str, cancel: &CancellationToken) -> Result<(), PredictionError> {
        self.end(id, "CANCELED", None, cancel).await
    }

    /// Fetch a prediction's current outcome list and status
    pub async fn get(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<PredictionHandle, PredictionError> {
        let identity = self.identity()?;
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("broadcaster_id", &identity.user_id)
            .append_pair("id", id)
            .finish();
        let path = format!("{}?{}", PREDICTIONS_PATH, query);
        let response = self.send::<()>(Method::GET, &path, None, cancel).await?;
        Ok(read_prediction(response).await?.into())
    }

    /// Resolve by outcome index, using cached outcome ids when present and
    /// fetching them otherwise.
    pub async fn resolve_index(
        &self,
        handle: &PredictionHandle,
        index: usize,
        cancel: &CancellationToken,
    ) -> Result<(), PredictionError> {
        let outcome_id = match handle.outcome_ids.get(index) {
            Some(id) => id.clone(),
            None => {
                debug!("Outcome ids for {} not cached; fetching", handle.id);
                let fetched = self.get(&handle.id, cancel).await?;
                fetched
                    .outcome_ids
                    .get(index)
                    .cloned()
                    .ok_or_else(|| PredictionError::MissingOutcome {
                        id: handle.id.clone(),
                        index,
                    })?
            }
        };
        self.resolve(&handle.id, &outcome_id, cancel).await
    }

    async fn end(
        &self,
        id: &str,
        status: &str,
        winning_outcome_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), PredictionError> {
        let identity = self.identity()?;
        let body = EndPredictionBody {
            broadcaster_id: &identity.user_id,
            id,
            status,
            winning_outcome_id,
        };
        let response = self.send(Method::PATCH, PREDICTIONS_PATH, Some(&body), cancel).await?;
        read_prediction(response).await?;
        info!("Prediction {} -> {}", id, status);
        Ok(())
    }

    fn identity(&self) -> Result<Identity, PredictionError> {
        self.credentials.identity().ok_or(PredictionError::NoIdentity)
    }

    async fn send<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        cancel: &CancellationToken,
    ) -> Result<Response, PredictionError> {
        let body = body
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| PredictionError::InvalidResponse {
                details: format!("request encoding failed: {}", e),
            })?;
        Ok(self
            .credentials
            .call_authenticated(method, path, body.as_ref(), cancel)
            .await?)
    }
}

async fn read_prediction(
    response: Response,
) -> Result<super::types::PredictionData, PredictionError> {
    let status = response.status();
    let text = response.text().await?;

    if !status.is_success() {
        let message = serde_json::from_str::<ServiceErrorBody>(&text)
            .ok()
            .and_then(|body| body.message)
            .unwrap_or_else(|| text.chars().take(200).collect());
        return Err(PredictionError::Rejected {
            status: status.as_u16(),
            message,
        });
    }

    let envelope: PredictionEnvelope =
        serde_json::from_str(&text).map_err(|e| PredictionError::InvalidResponse {
            details: e.to_string(),
        })?;
    envelope
        .data
        .into_iter()
        .next()
        .ok_or_else(|| PredictionError::InvalidResponse {
            details: "response contained no prediction".to_string(),
        })
}
