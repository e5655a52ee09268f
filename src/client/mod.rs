//! HTTP client for the workflow service.

pub mod transcript;


pub use transcript::{Direction, NewEntry, TranscriptEntry, TranscriptLog, TRANSCRIPT_CAPACITY};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use std::sync::{Arc, RwLock};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::core::error::ClientError;
use crate::core::workflow::*;
use crate::stream::{decode_stream, EventStream, StreamEvent};

const EXECUTE_PATH: &str = "/api/execute";
const STREAM_PATH: &str = "/api/stream";
const WORKFLOWS_PATH: &str = "/api/workflows";

/// The two ways of running a workflow. The chat engine only needs this much,
/// which keeps it testable without a server.
#[async_trait]
pub trait WorkflowApi: Send + Sync {
    async fn execute(&self, request: WorkflowRequest) -> Result<WorkflowResponse, ClientError>;

    async fn stream(
        &self,
        request: WorkflowRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, ClientError>;
}

pub struct WorkflowClient {
    http: Client,
    base_url: RwLock<String>,
    tenant: RwLock<Option<TenantInfo>>,
    transcript: Arc<TranscriptLog>,
}

impl WorkflowClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_transcript(base_url, Arc::new(TranscriptLog::new()))
    }

    pub fn with_transcript(base_url: impl Into<String>, transcript: Arc<TranscriptLog>) -> Self {
        Self {
            http: Client::new(),
            base_url: RwLock::new(base_url.into()),
            tenant: RwLock::new(None),
            transcript,
        }
    }

    pub fn base_url(&self) -> String {
        self.base_url
            .read()
            .map(|b| b.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn set_base_url(&self, base_url: impl Into<String>) {
        let mut guard = self.base_url.write().unwrap_or_else(|e| e.into_inner());
        *guard = base_url.into();
    }

    pub fn tenant(&self) -> Option<TenantInfo> {
        self.tenant
            .read()
            .map(|t| t.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn set_tenant(&self, tenant: Option<TenantInfo>) {
        let mut guard = self.tenant.write().unwrap_or_else(|e| e.into_inner());
        *guard = tenant;
    }

    pub fn transcript(&self) -> &Arc<TranscriptLog> {
        &self.transcript
    }

    pub async fn list_workflows(&self) -> Result<WorkflowList, ClientError> {
        let url = self.endpoint(&["api", "workflows"])?;
        self.transcript
            .record(NewEntry::request("GET", WORKFLOWS_PATH, "list workflows"));

        let resp = self.send(self.with_headers(self.http.get(url))).await?;
        self.handle_response(resp, WORKFLOWS_PATH).await
    }

    pub async fn workflow_info(&self, name: &str) -> Result<WorkflowInfo, ClientError> {
        let url = self.endpoint(&["api", "workflows", name])?;
        let path = url.path().to_string();
        self.transcript
            .record(NewEntry::request("GET", &path, format!("workflow info: {name}")));

        let resp = self.send(self.with_headers(self.http.get(url))).await?;
        self.handle_response(resp, &path).await
    }

    /// Build a URL under the base, percent-encoding each segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let base = self.base_url();
        let mut url = Url::parse(&base).map_err(|e| ClientError::InvalidUrl(format!("{base}: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(base.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn with_headers(&self, builder: RequestBuilder) -> RequestBuilder {
        let (user_id, archive_id) = match self.tenant() {
            Some(t) => (t.user_id, t.archive_id),
            None => (DEFAULT_USER_ID.to_string(), DEFAULT_ARCHIVE_ID.to_string()),
        };
        builder
            .header("Content-Type", "application/json")
            .header("X-User-ID", user_id)
            .header("X-Archive-ID", archive_id)
    }

    /// Configured tenants are also sent in the body for older services.
    fn with_tenant_fields(&self, mut request: WorkflowRequest) -> WorkflowRequest {
        if let Some(tenant) = self.tenant() {
            request.user_id = Some(tenant.user_id);
            request.archive_id = Some(tenant.archive_id);
        }
        request
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ClientError> {
        builder.send().await.map_err(|e| {
            tracing::warn!(error = %e, "request failed");
            ClientError::Network(e.to_string())
        })
    }

    /// Non-2xx responses are read fully and reported with their body.
    async fn reject_failed(&self, resp: Response, path: &str) -> Result<Response, ClientError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let status = status.as_u16();
        let body = resp.text().await.unwrap_or_default();
        self.transcript.record(
            NewEntry::response(path, status, format!("HTTP {status}: {body}"))
                .with_details(serde_json::json!({ "error": body })),
        );
        tracing::debug!(path, status, "request rejected");
        Err(ClientError::Http { status, body })
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        resp: Response,
        path: &str,
    ) -> Result<T, ClientError> {
        let resp = self.reject_failed(resp, path).await?;
        let status = resp.status().as_u16();

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        self.transcript.record(
            NewEntry::response(path, status, format!("ok ({status})")).with_details(data.clone()),
        );

        // Business-level failure inside a 2xx response
        if data["status"].as_str() == Some("error") {
            let message = data["error"]
                .as_str()
                .filter(|m| !m.is_empty())
                .unwrap_or("unknown error");
            return Err(ClientError::Business(message.to_string()));
        }

        serde_json::from_value(data).map_err(|e| ClientError::Decode(e.to_string()))
    }
}

#[async_trait]
impl WorkflowApi for WorkflowClient {
    async fn execute(&self, request: WorkflowRequest) -> Result<WorkflowResponse, ClientError> {
        let url = self.endpoint(&["api", "execute"])?;
        let body = self.with_tenant_fields(request);
        self.transcript.record(
            NewEntry::request(
                "POST",
                EXECUTE_PATH,
                format!("execute workflow: {}", body.workflow),
            )
            .with_details(serde_json::to_value(&body).unwrap_or_default()),
        );
        tracing::debug!(workflow = %body.workflow, "executing workflow");

        let resp = self
            .send(self.with_headers(self.http.post(url)).json(&body))
            .await?;
        self.handle_response(resp, EXECUTE_PATH).await
    }

    async fn stream(
        &self,
        request: WorkflowRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, ClientError> {
        let url = self.endpoint(&["api", "stream"])?;
        let body = self.with_tenant_fields(request);
        self.transcript.record(
            NewEntry::request(
                "POST",
                STREAM_PATH,
                format!("stream workflow: {}", body.workflow),
            )
            .with_details(serde_json::to_value(&body).unwrap_or_default()),
        );
        tracing::debug!(workflow = %body.workflow, "opening workflow stream");

        let builder = self
            .with_headers(self.http.post(url))
            .header("Accept", "text/event-stream")
            .json(&body);

        // A cancel before the response headers arrive aborts the request
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(Box::pin(tokio_stream::empty::<Result<StreamEvent, ClientError>>()));
            }
            resp = self.send(builder) => resp?,
        };
        let resp = self.reject_failed(resp, STREAM_PATH).await?;

        let transcript = Arc::clone(&self.transcript);
        let events = decode_stream(resp.bytes_stream(), cancel).map(move |item| {
            let entry = match &item {
                Ok(event) => NewEntry::event(STREAM_PATH, event.kind().as_str())
                    .with_details(serde_json::to_value(event).unwrap_or_default()),
                Err(e) => NewEntry::event(STREAM_PATH, "transport_error")
                    .with_details(serde_json::json!({ "error": e.to_string() })),
            };
            transcript.record(entry);
            item
        });

        Ok(Box::pin(events))
    }
}
