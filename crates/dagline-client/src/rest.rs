use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use dagline_core::error::{DaglineError, Result};
use dagline_core::status::RunStatus;
use dagline_core::types::{DagRun, EngineType, RunId, RunSummary};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One page of `GET /api/dag-runs`.
#[derive(Debug, Deserialize)]
pub struct RunPage {
    pub items: Vec<RunSummary>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

/// Response of `POST /api/dag-runs`.
#[derive(Debug, Deserialize)]
pub struct CreatedRun {
    pub run_id: RunId,
    pub status: RunStatus,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

/// REST client for the dagline gateway.
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DaglineError::Connection(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn error_from(resp: reqwest::Response) -> DaglineError {
        let status = resp.status();
        let body: ErrorBody = resp.json().await.unwrap_or(ErrorBody {
            error: String::new(),
            message: String::new(),
        });
        let message = if body.message.is_empty() {
            format!("gateway returned {status}")
        } else {
            format!("{}: {}", body.error, body.message)
        };
        if status.as_u16() == 400 {
            DaglineError::Validation(message)
        } else if status.as_u16() == 409 {
            DaglineError::InvalidTransition {
                from: "terminal".to_string(),
                to: "cancelled".to_string(),
            }
        } else {
            DaglineError::Gateway(message)
        }
    }

    pub async fn health(&self) -> Result<serde_json::Value> {
        let resp = self
            .http
            .get(self.url("/api/health"))
            .send()
            .await
            .map_err(|e| DaglineError::Connection(e.to_string()))?;
        resp.json()
            .await
            .map_err(|e| DaglineError::Connection(e.to_string()))
    }

    pub async fn list_runs(
        &self,
        limit: usize,
        offset: usize,
        status: Option<RunStatus>,
    ) -> Result<RunPage> {
        let mut req = self
            .http
            .get(self.url("/api/dag-runs"))
            .query(&[("limit", limit), ("offset", offset)]);
        if let Some(status) = status {
            req = req.query(&[("status", status.as_str())]);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| DaglineError::Connection(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::error_from(resp).await);
        }
        resp.json()
            .await
            .map_err(|e| DaglineError::Connection(e.to_string()))
    }

    /// Fetch a full run. A 404 is not an error: unknown runs yield `None`.
    pub async fn get_run(&self, id: &RunId) -> Result<Option<DagRun>> {
        let resp = self
            .http
            .get(self.url(&format!("/api/dag-runs/{id}")))
            .send()
            .await
            .map_err(|e| DaglineError::Connection(e.to_string()))?;
        if resp.status().as_u16() == 404 {
            debug!(run_id = %id, "Run not found");
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::error_from(resp).await);
        }
        let run = resp
            .json()
            .await
            .map_err(|e| DaglineError::Connection(e.to_string()))?;
        Ok(Some(run))
    }

    pub async fn create_run(
        &self,
        workflow_path: &str,
        engine_type: Option<EngineType>,
        persist: bool,
    ) -> Result<CreatedRun> {
        let body = serde_json::json!({
            "workflow_path": workflow_path,
            "engine_type": engine_type.map(|e| e.to_string()),
            "persist": persist,
        });
        let resp = self
            .http
            .post(self.url("/api/dag-runs"))
            .json(&body)
            .send()
            .await
            .map_err(|e| DaglineError::Connection(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::error_from(resp).await);
        }
        resp.json()
            .await
            .map_err(|e| DaglineError::Connection(e.to_string()))
    }

    /// Request cancellation via `PATCH .../status`.
    pub async fn cancel_run(&self, id: &RunId) -> Result<DagRun> {
        let resp = self
            .http
            .patch(self.url(&format!("/api/dag-runs/{id}/status")))
            .json(&serde_json::json!({ "status": "cancelled" }))
            .send()
            .await
            .map_err(|e| DaglineError::Connection(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::error_from(resp).await);
        }
        resp.json()
            .await
            .map_err(|e| DaglineError::Connection(e.to_string()))
    }
}
