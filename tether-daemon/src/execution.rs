//! Execution service client.
//!
//! The execution service is the out-of-process component that actually spawns
//! and kills executables. The tracker only needs three calls from it, captured
//! by [`ExecutionService`]; [`HttpExecutionService`] speaks its HTTP API:
//!
//! ```text
//! POST   /api/execute                      {"application_id": "…"} → {"pid": 900, …}
//! DELETE /api/process/<application_id>/stop
//! GET    /api/process/<application_id>/status → {"status": "Running", "pid": 900, "exit_code": null}
//! ```

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether_core::{ApplicationId, ProcessId, TrackerConfig};

use crate::error::ExecutionError;

pub const SESSION_HEADER: &str = "x-session-id";

/// What the execution service knows about an application's process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited { exit_code: Option<i32> },
    /// The service has no process for this application.
    NotFound,
}

impl ProcessStatus {
    pub fn is_gone(&self) -> bool {
        !matches!(self, ProcessStatus::Running)
    }
}

#[async_trait]
pub trait ExecutionService: Send + Sync {
    /// Launch the application's executable and return the new process id.
    async fn launch(&self, application_id: &ApplicationId) -> Result<ProcessId, ExecutionError>;

    /// Terminate the application's process (and its children).
    async fn terminate(&self, application_id: &ApplicationId) -> Result<(), ExecutionError>;

    /// Current process status, used by the liveness audit.
    async fn status(&self, application_id: &ApplicationId)
        -> Result<ProcessStatus, ExecutionError>;
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    application_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    exit_code: Option<i32>,
}

/// [`ExecutionService`] over the service's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpExecutionService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpExecutionService {
    pub fn new(config: &TrackerConfig) -> Result<Self, ExecutionError> {
        let mut headers = HeaderMap::new();
        if let Some(session_id) = config.session_id.as_deref() {
            let value = HeaderValue::from_str(session_id).map_err(|err| {
                ExecutionError::InvalidResponse(format!("session id is not a valid header: {err}"))
            })?;
            headers.insert(SESSION_HEADER, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.execution_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl ExecutionService for HttpExecutionService {
    async fn launch(&self, application_id: &ApplicationId) -> Result<ProcessId, ExecutionError> {
        let response = self
            .client
            .post(self.url("/api/execute"))
            .json(&ExecuteRequest {
                application_id: application_id.as_str(),
            })
            .send()
            .await?;
        let body = expect_success(response).await?;
        parse_launch_response(&body)
    }

    async fn terminate(&self, application_id: &ApplicationId) -> Result<(), ExecutionError> {
        let response = self
            .client
            .delete(self.url(&format!("/api/process/{}/stop", application_id)))
            .send()
            .await?;
        expect_success(response).await.map(|_| ())
    }

    async fn status(
        &self,
        application_id: &ApplicationId,
    ) -> Result<ProcessStatus, ExecutionError> {
        let response = self
            .client
            .get(self.url(&format!("/api/process/{}/status", application_id)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(ProcessStatus::NotFound);
        }
        let body = expect_success(response).await?;
        parse_status_response(&body)
    }
}

async fn expect_success(response: reqwest::Response) -> Result<String, ExecutionError> {
    let status = response.status();
    let body = response.text().await?;
    if status.is_success() {
        return Ok(body);
    }
    Err(ExecutionError::Rejected {
        status: status.as_u16(),
        message: rejection_message(status, &body),
    })
}

/// Prefer the service's own `message` field, then the raw body, then the reason phrase.
fn rejection_message(status: StatusCode, body: &str) -> String {
    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(body) {
        if let Some(Value::String(message)) = object.get("message") {
            return message.clone();
        }
    }
    let trimmed = body.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    status
        .canonical_reason()
        .unwrap_or("request rejected")
        .to_string()
}

/// Extract the process id from a launch response: `pid` as a number or string.
pub(crate) fn parse_launch_response(body: &str) -> Result<ProcessId, ExecutionError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|err| ExecutionError::InvalidResponse(format!("launch response: {err}")))?;
    let process_id = match value.get("pid").or_else(|| value.get("process_id")) {
        Some(Value::Number(n)) if n.is_u64() => ProcessId::from(n.to_string()),
        Some(Value::String(s)) => ProcessId::from(s.clone()),
        _ => {
            return Err(ExecutionError::InvalidResponse(
                "launch response has no pid".to_string(),
            ))
        }
    };
    if process_id.is_empty() {
        return Err(ExecutionError::InvalidResponse(
            "launch response has an empty pid".to_string(),
        ));
    }
    Ok(process_id)
}

pub(crate) fn parse_status_response(body: &str) -> Result<ProcessStatus, ExecutionError> {
    let response: StatusResponse = serde_json::from_str(body)
        .map_err(|err| ExecutionError::InvalidResponse(format!("status response: {err}")))?;
    match response.status.to_ascii_lowercase().as_str() {
        "running" => Ok(ProcessStatus::Running),
        "exited" | "stopped" => Ok(ProcessStatus::Exited {
            exit_code: response.exit_code,
        }),
        other => Err(ExecutionError::InvalidResponse(format!(
            "unknown process status '{other}'"
        ))),
    }
}
