use reqwest::StatusCode;
use std::time::Duration;
use tally_core::{ProgressEntry, ProgressMap, SyncError};
use tally_proto::{ProgressSnapshot, UpsertRequest, WriteAck};

/// HTTP client for the tally progress API.
///
/// Every request carries the bearer token and a bounded timeout; a hung
/// request must fail closed so the drain loop cannot stall on one item.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    pub fn new(server_url: &str, token: &str, timeout: Duration) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        Ok(ApiClient {
            http,
            base_url: server_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn progress_url(&self) -> String {
        format!("{}/api/progress", self.base_url)
    }

    /// Pull the authoritative snapshot for the current user
    pub async fn fetch_progress(&self) -> Result<ProgressMap, SyncError> {
        let response = self
            .http
            .get(self.progress_url())
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        match response.status() {
            StatusCode::OK => {
                let snapshot: ProgressSnapshot = response
                    .json()
                    .await
                    .map_err(|e| SyncError::Protocol(e.to_string()))?;
                Ok(snapshot.into_map())
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SyncError::Unauthorized),
            other => Err(SyncError::Protocol(format!("fetch returned {other}"))),
        }
    }

    /// Conditional single-item write. A 409 means the server holds a newer
    /// version; the caller reconciles and retries later.
    pub async fn push_entry(&self, item_id: &str, entry: &ProgressEntry) -> Result<(), SyncError> {
        let body = UpsertRequest {
            item_id: item_id.to_string(),
            done: entry.done,
            note: entry.note.clone(),
            updated_at: entry.version,
        };
        let response = self
            .http
            .post(self.progress_url())
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::CONFLICT => Err(SyncError::StaleWrite),
            StatusCode::BAD_REQUEST => {
                let text = response.text().await.unwrap_or_default();
                Err(SyncError::Validation(text))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SyncError::Unauthorized),
            other => Err(SyncError::Protocol(format!("upsert returned {other}"))),
        }
    }

    /// Batch-replace the whole snapshot (import re-push). A partial conflict
    /// is an answer, not an error: the ack says how many entries landed.
    pub async fn push_snapshot(&self, map: ProgressMap) -> Result<WriteAck, SyncError> {
        let response = self
            .http
            .put(self.progress_url())
            .bearer_auth(&self.token)
            .json(&ProgressSnapshot::from_map(map))
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        match response.status() {
            StatusCode::OK | StatusCode::CONFLICT => response
                .json()
                .await
                .map_err(|e| SyncError::Protocol(e.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SyncError::Unauthorized),
            other => Err(SyncError::Protocol(format!("replace returned {other}"))),
        }
    }

    /// Wipe the user's server-side progress (deliberate reset, no version
    /// check)
    pub async fn delete_all(&self) -> Result<(), SyncError> {
        let response = self
            .http
            .delete(self.progress_url())
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SyncError::Unauthorized),
            other => Err(SyncError::Protocol(format!("delete returned {other}"))),
        }
    }
}
