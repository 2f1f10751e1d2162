use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::board::{Project, Task};
use crate::config::EngineConfig;
use crate::error::{classify_api_error, Result, SyncError};

use super::api_models::{ApiEnvelope, CreateTaskRequest, MoveTaskRequest, UpdateTaskRequest};

const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Request-style client for the authority's HTTP interface.
///
/// Server-class failures are retried up to `server_retry_limit` times with a
/// doubling delay; every other class surfaces immediately. Mutations are
/// never retried across a transport failure, since the write may have landed
/// and the broadcast channel will reconcile it either way.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    credential: String,
    retry_limit: u32,
}

impl ApiClient {
    pub fn new(config: &EngineConfig, credential: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            credential,
            retry_limit: config.server_retry_limit,
        })
    }

    pub async fn list_tasks(&self, project_id: Uuid) -> Result<Vec<Task>> {
        self.get(&format!("/projects/{project_id}/tasks")).await
    }

    pub async fn get_project(&self, project_id: Uuid) -> Result<Project> {
        self.get(&format!("/projects/{project_id}")).await
    }

    pub async fn create_task(&self, req: &CreateTaskRequest) -> Result<Task> {
        self.send_json(reqwest::Method::POST, "/tasks", req).await
    }

    pub async fn update_task(&self, task_id: Uuid, patch: &UpdateTaskRequest) -> Result<Task> {
        self.send_json(reqwest::Method::PATCH, &format!("/tasks/{task_id}"), patch)
            .await
    }

    /// Move a task; the response carries the authoritative task including the
    /// server-recomputed position, which may differ from the client's guess
    /// under concurrent moves.
    pub async fn move_task(&self, task_id: Uuid, req: &MoveTaskRequest) -> Result<Task> {
        self.send_json(
            reqwest::Method::PUT,
            &format!("/tasks/{task_id}/position"),
            req,
        )
        .await
    }

    /// Deletion returns a bare success envelope; any data payload is ignored.
    pub async fn delete_task(&self, task_id: Uuid) -> Result<()> {
        self.request_raw::<(), serde_json::Value>(
            reqwest::Method::DELETE,
            &format!("/tasks/{task_id}"),
            None,
        )
        .await?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request::<(), T>(reqwest::Method::GET, path, None).await
    }

    async fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.request(method, path, Some(body)).await
    }

    async fn request<B: Serialize, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        self.request_raw(method, path, body)
            .await?
            .ok_or_else(|| SyncError::Server("success envelope without data".to_string()))
    }

    async fn request_raw<B: Serialize, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Option<T>> {
        let mut attempt = 0;
        loop {
            match self.request_once(method.clone(), path, body).await {
                Err(err) if err.is_retryable() && attempt < self.retry_limit => {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                    tracing::warn!(
                        "Server error on {method} {path} (attempt {}): {err}, retrying in {:?}",
                        attempt + 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn request_once<B: Serialize, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Option<T>> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .request(method, &url)
            .bearer_auth(&self.credential);
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req.send().await?;
        let status = response.status();
        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|e| status_error(status, &format!("malformed response: {e}")))?;

        if envelope.success {
            Ok(envelope.data)
        } else if let Some(err) = envelope.error {
            Err(classify_api_error(&err.code, &err.message))
        } else {
            Err(status_error(status, "error envelope without detail"))
        }
    }
}

fn status_error(status: StatusCode, message: &str) -> SyncError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::Auth(message.to_string()),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            SyncError::Validation(message.to_string())
        }
        StatusCode::NOT_FOUND => SyncError::NotFound(message.to_string()),
        StatusCode::CONFLICT => SyncError::Conflict(message.to_string()),
        _ => SyncError::Server(message.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(status_error(StatusCode::UNAUTHORIZED, "x").is_auth());
        assert!(status_error(StatusCode::NOT_FOUND, "x").is_stale());
        assert!(status_error(StatusCode::INTERNAL_SERVER_ERROR, "x").is_retryable());
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, "x"),
            SyncError::Validation(_)
        ));
    }
}
