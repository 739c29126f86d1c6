//! Typed client for the remote resource-orchestration admin API.

use crate::context::OperationContext;
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub status: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskStatus {
    pub fn running() -> Self {
        Self {
            status: TaskState::Running,
            error: None,
        }
    }

    pub fn success() -> Self {
        Self {
            status: TaskState::Success,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: TaskState::Failed,
            error: Some(message.into()),
        }
    }
}

/// Response of `POST /{collection}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedResource {
    pub uuid: String,
    #[serde(default, rename = "taskid", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// Response of `PUT` and `DELETE`: either finished immediately or a task to poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    #[serde(default, rename = "taskid", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// The remote operations the lifecycle core depends on.
///
/// `delete` treats `404 Not Found` as confirmation that the resource is already
/// gone and returns `Accepted` without a task. `get` maps `404` to `None`.
#[async_trait]
pub trait ResourceGateway: Send + Sync {
    async fn create(
        &self,
        ctx: &OperationContext,
        collection: &str,
        descriptor: &Value,
    ) -> Result<CreatedResource>;

    async fn get(
        &self,
        ctx: &OperationContext,
        collection: &str,
        uuid: &str,
    ) -> Result<Option<Value>>;

    async fn update(
        &self,
        ctx: &OperationContext,
        collection: &str,
        uuid: &str,
        descriptor: &Value,
    ) -> Result<Accepted>;

    async fn delete(&self, ctx: &OperationContext, collection: &str, uuid: &str)
        -> Result<Accepted>;

    async fn task_status(&self, ctx: &OperationContext, task_id: &str) -> Result<TaskStatus>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_admin_token")]
    pub admin_token: Option<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    std::env::var("CATALOG_REMOTE_URL").unwrap_or_else(|_| "http://127.0.0.1:9090".to_string())
}

fn default_admin_token() -> Option<String> {
    std::env::var("CATALOG_REMOTE_TOKEN").ok()
}

fn default_request_timeout() -> u64 {
    std::env::var("CATALOG_REMOTE_TIMEOUT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30)
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            admin_token: default_admin_token(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// `ResourceGateway` over the admin HTTP API.
pub struct HttpResourceGateway {
    client: Client,
    base_url: String,
    admin_token: Option<String>,
}

impl HttpResourceGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("catalog-orchestrator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                OrchestratorError::RemoteCallFailed(format!("Failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            admin_token: config.admin_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, ctx: &OperationContext, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(REQUEST_ID_HEADER, &ctx.request_id);
        match &self.admin_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, what: &str, request: RequestBuilder) -> Result<Response> {
        request
            .send()
            .await
            .map_err(|e| OrchestratorError::RemoteCallFailed(format!("{what}: {e}")))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(what: &str, response: Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::RemoteCallFailed(format!(
                "{what}: {status} - {error_text}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| OrchestratorError::RemoteCallFailed(format!("{what}: {e}")))?;

        // Some admin endpoints answer 202/204 with no body when nothing is left to poll.
        let body: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
            b"{}"
        } else {
            &body
        };

        serde_json::from_slice(body).map_err(|e| {
            OrchestratorError::RemoteCallFailed(format!("{what}: malformed response: {e}"))
        })
    }
}

#[async_trait]
impl ResourceGateway for HttpResourceGateway {
    #[instrument(skip(self, ctx, descriptor), fields(request_id = %ctx.request_id))]
    async fn create(
        &self,
        ctx: &OperationContext,
        collection: &str,
        descriptor: &Value,
    ) -> Result<CreatedResource> {
        let what = format!("POST /{collection}");
        let request = self.authorize(ctx, self.client.post(self.url(collection)).json(descriptor));
        let response = self.send(&what, request).await?;
        let created: CreatedResource = Self::read_json(&what, response).await?;

        debug!(uuid = %created.uuid, task_id = ?created.task_id, "Remote resource accepted");
        Ok(created)
    }

    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    async fn get(
        &self,
        ctx: &OperationContext,
        collection: &str,
        uuid: &str,
    ) -> Result<Option<Value>> {
        let what = format!("GET /{collection}/{uuid}");
        let request = self.authorize(ctx, self.client.get(self.url(&format!("{collection}/{uuid}"))));
        let response = self.send(&what, request).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        Self::read_json(&what, response).await.map(Some)
    }

    #[instrument(skip(self, ctx, descriptor), fields(request_id = %ctx.request_id))]
    async fn update(
        &self,
        ctx: &OperationContext,
        collection: &str,
        uuid: &str,
        descriptor: &Value,
    ) -> Result<Accepted> {
        let what = format!("PUT /{collection}/{uuid}");
        let request = self.authorize(
            ctx,
            self.client
                .put(self.url(&format!("{collection}/{uuid}")))
                .json(descriptor),
        );
        let response = self.send(&what, request).await?;

        Self::read_json(&what, response).await
    }

    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    async fn delete(
        &self,
        ctx: &OperationContext,
        collection: &str,
        uuid: &str,
    ) -> Result<Accepted> {
        let what = format!("DELETE /{collection}/{uuid}");
        let request =
            self.authorize(ctx, self.client.delete(self.url(&format!("{collection}/{uuid}"))));
        let response = self.send(&what, request).await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("Remote resource already gone");
            return Ok(Accepted::default());
        }

        Self::read_json(&what, response).await
    }

    async fn task_status(&self, ctx: &OperationContext, task_id: &str) -> Result<TaskStatus> {
        let what = format!("GET /tasks/{task_id}");
        let request = self.authorize(ctx, self.client.get(self.url(&format!("tasks/{task_id}"))));
        let response = self.send(&what, request).await?;

        Self::read_json(&what, response).await
    }
}
