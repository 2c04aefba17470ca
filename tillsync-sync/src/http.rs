//! HTTP implementation of the remote backend.
//!
//! Speaks a plain REST layout:
//!
//! - `GET {base}/catalog/{entity_type}?limit=N[&updated_after=MS]` returns a
//!   JSON array of flat rows ordered by `updated_at`
//! - `POST {base}/mutations` accepts one queued mutation

use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteBackend;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tillsync_types::{EntityRecord, EntityType, QueuedMutation, Timestamp};
use tracing::debug;

/// Connection settings for the hosted backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpRemoteConfig {
    /// Base URL of the backend API (e.g. `https://pos.example.com/api`).
    pub base_url: String,
    /// Bearer token sent with every request.
    pub api_token: Option<String>,
    /// Per-request timeout (ms).
    pub timeout_ms: u64,
}

impl Default for HttpRemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_token: None,
            timeout_ms: 30_000,
        }
    }
}

#[derive(Serialize)]
struct MutationBody<'a> {
    local_id: i64,
    idempotency_key: String,
    kind: &'a str,
    payload: &'a serde_json::Value,
    created_at: Timestamp,
}

/// Remote backend reached over HTTP.
pub struct HttpRemote {
    config: HttpRemoteConfig,
    client: Client,
}

impl HttpRemote {
    /// Creates an HTTP remote.
    pub fn new(config: HttpRemoteConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| SyncError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl RemoteBackend for HttpRemote {
    async fn fetch_page(
        &self,
        entity_type: EntityType,
        since: Option<Timestamp>,
        page_size: usize,
    ) -> SyncResult<Vec<EntityRecord>> {
        let mut query = vec![("limit", page_size.to_string())];
        if let Some(since) = since {
            query.push(("updated_after", since.as_millis().to_string()));
        }

        let url = self.url(&format!("catalog/{entity_type}"));
        debug!(%entity_type, ?since, page_size, "fetching page");

        let response = self
            .authorize(self.client.get(&url).query(&query))
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;

        let rows: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| SyncError::Protocol(format!("invalid {entity_type} page: {e}")))?;

        rows.into_iter()
            .map(|row| {
                EntityRecord::from_json(entity_type, row)
                    .map_err(|e| SyncError::Protocol(e.to_string()))
            })
            .collect()
    }

    async fn submit_mutation(&self, mutation: &QueuedMutation) -> SyncResult<()> {
        let body = MutationBody {
            local_id: mutation.local_id,
            idempotency_key: mutation.idempotency_key.to_string(),
            kind: mutation.kind.as_str(),
            payload: &mutation.payload,
            created_at: mutation.created_at,
        };

        let response = self
            .authorize(self.client.post(self.url("mutations")))
            .header("Idempotency-Key", body.idempotency_key.as_str())
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await?;

        debug!(local_id = mutation.local_id, kind = %mutation.kind, "mutation accepted");
        Ok(())
    }
}

fn transport_error(e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::Timeout
    } else {
        SyncError::Network(e.to_string())
    }
}

/// Maps non-success statuses: client errors are rejections, except the ones
/// that ask the client to come back later.
async fn check_status(response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };

    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => Err(SyncError::Network(detail)),
        s if s.is_client_error() => Err(SyncError::Rejected(detail)),
        _ => Err(SyncError::Network(detail)),
    }
}
