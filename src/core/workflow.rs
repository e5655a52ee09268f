use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_ID: &str = "default_user";
pub const DEFAULT_ARCHIVE_ID: &str = "default_archive";

/// Body of `POST /api/execute` and `POST /api/stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub workflow: String,
    pub input: String,
    /// Seconds; forwarded to the service, never enforced locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_id: Option<String>,
}

impl WorkflowRequest {
    pub fn new(workflow: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            input: input.into(),
            timeout: None,
            user_id: None,
            archive_id: None,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResponse {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowList {
    pub workflows: Vec<String>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub status: String,
}

/// User/archive pair attached to every request for tenant isolation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantInfo {
    pub user_id: String,
    pub archive_id: String,
}

impl TenantInfo {
    pub fn new(user_id: impl Into<String>, archive_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            archive_id: archive_id.into(),
        }
    }
}
