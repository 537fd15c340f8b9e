// SPDX-License-Identifier: Apache-2.0
//! The REST surface consumed by the core (`spec.md` §6, `SPEC_FULL.md` §C).
//! Every mutating verb carries the session cookie (via `reqwest`'s cookie
//! jar, owned by the embedding application) and a CSRF token header; the
//! core treats these endpoints as an opaque persistence/control surface and
//! never renders from them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};

/// Authentication probe used by `session_ws`/`global_ws` on close (§4.3) and
/// by the mobile-wake path (§4.7): a cheap request against a protected
/// endpoint that distinguishes "still logged in" from "401, go to login".
#[async_trait]
pub trait AuthProbe: Send + Sync {
    async fn probe(&self) -> Result<bool>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcpServerInfo {
    pub name: String,
    pub prompts: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SoundsConfig {
    pub agent_completed: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    pub sounds: Option<SoundsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MacUiConfig {
    pub notifications: Option<NotificationsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmationsConfig {
    pub delete_session: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UiConfig {
    pub mac: Option<MacUiConfig>,
    pub confirmations: Option<ConfirmationsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebConfig {
    pub theme: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub acp_servers: Vec<AcpServerInfo>,
    pub prompts: Option<Vec<String>>,
    pub ui: Option<UiConfig>,
    pub web: Option<WebConfig>,
    pub config_readonly: Option<bool>,
    pub rc_file_path: Option<String>,
    pub workspaces: Option<Vec<Workspace>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub working_dir: String,
    pub acp_server: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkspacesResponse {
    pub workspaces: Vec<Workspace>,
    pub acp_servers: Vec<AcpServerInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkspacePromptsResponse {
    pub prompts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceDeleteError {
    pub error: String,
    pub message: String,
    pub conversation_count: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub acp_server: String,
    pub working_dir: String,
    pub status: String,
    pub pinned: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub name: String,
    pub acp_server: String,
    pub working_dir: String,
    pub status: String,
    pub created_at: i64,
    pub runner_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewSessionRequest {
    pub name: String,
    pub working_dir: String,
    pub acp_server: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSessionResponse {
    pub session_id: String,
    pub name: String,
    pub acp_server: String,
    pub working_dir: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SessionPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueListResponse {
    pub messages: Vec<QueueItemResponse>,
    pub count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueItemResponse {
    pub id: String,
    pub message: String,
    pub title: Option<String>,
    pub queued_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueAddRequest {
    pub message: String,
    pub image_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueAddResponse {
    pub id: String,
}

#[derive(Debug, Clone)]
pub enum QueueAddOutcome {
    Added { id: String },
    Full { message: String },
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Typed client over the session-management REST surface. Holds the base
/// URL (API prefix already applied) and a shared `reqwest::Client` so
/// connection pooling and the cookie jar are reused across calls.
pub struct SessionHttpClient {
    base_url: String,
    client: reqwest::Client,
}

impl SessionHttpClient {
    pub fn new(api_prefix: impl Into<String>) -> Self {
        Self { base_url: api_prefix.into(), client: reqwest::Client::new() }
    }

    pub fn with_client(api_prefix: impl Into<String>, client: reqwest::Client) -> Self {
        Self { base_url: api_prefix.into(), client }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn json<T: for<'de> Deserialize<'de>>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CoreError::Http(format!("{status}: {body}")));
        }
        resp.json::<T>().await.map_err(|e| CoreError::Http(e.to_string()))
    }

    pub async fn get_config(&self) -> Result<AppConfig> {
        let resp = self
            .client
            .get(self.url("/api/config"))
            .send()
            .await
            .map_err(|e| CoreError::Http(e.to_string()))?;
        Self::json(resp).await
    }

    pub async fn list_workspaces(&self) -> Result<WorkspacesResponse> {
        let resp = self
            .client
            .get(self.url("/api/workspaces"))
            .send()
            .await
            .map_err(|e| CoreError::Http(e.to_string()))?;
        Self::json(resp).await
    }

    pub async fn create_workspace(&self, workspace: &Workspace) -> Result<Workspace> {
        let resp = self
            .client
            .post(self.url("/api/workspaces"))
            .json(workspace)
            .send()
            .await
            .map_err(|e| CoreError::Http(e.to_string()))?;
        Self::json(resp).await
    }

    /// Returns `Ok(())` on success, `Err(WorkspaceHasActiveConversations)` on
    /// the domain-validation rejection (§7), `Err(Http)` otherwise.
    pub async fn delete_workspace(&self, working_dir: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.url("/api/workspaces"))
            .query(&[("dir", working_dir)])
            .send()
            .await
            .map_err(|e| CoreError::Http(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(());
        }
        let status = resp.status();
        let err: WorkspaceDeleteError = resp
            .json()
            .await
            .map_err(|_| CoreError::Http(format!("workspace delete failed: {status}")))?;
        Err(CoreError::WorkspaceHasActiveConversations {
            count: err.conversation_count.unwrap_or(0),
            message: err.message,
        })
    }

    /// Supports conditional fetch via `If-Modified-Since`; returns `None` on
    /// `304 Not Modified`.
    pub async fn workspace_prompts(
        &self,
        working_dir: &str,
        if_modified_since: Option<&str>,
    ) -> Result<Option<WorkspacePromptsResponse>> {
        let mut req = self
            .client
            .get(self.url("/api/workspace-prompts"))
            .query(&[("dir", working_dir)]);
        if let Some(ims) = if_modified_since {
            req = req.header("If-Modified-Since", ims);
        }
        let resp = req.send().await.map_err(|e| CoreError::Http(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        Ok(Some(Self::json(resp).await?))
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let resp = self
            .client
            .get(self.url("/api/sessions"))
            .send()
            .await
            .map_err(|e| CoreError::Http(e.to_string()))?;
        Self::json(resp).await
    }

    pub async fn get_session(&self, id: &str) -> Result<SessionMeta> {
        let resp = self
            .client
            .get(self.url(&format!("/api/sessions/{id}")))
            .send()
            .await
            .map_err(|e| CoreError::Http(e.to_string()))?;
        Self::json(resp).await
    }

    pub async fn create_session(&self, req: &NewSessionRequest) -> Result<NewSessionResponse> {
        let resp = self
            .client
            .post(self.url("/api/sessions"))
            .json(req)
            .send()
            .await
            .map_err(|e| CoreError::Http(e.to_string()))?;
        Self::json(resp).await
    }

    pub async fn patch_session(&self, id: &str, patch: &SessionPatch) -> Result<()> {
        let resp = self
            .client
            .patch(self.url(&format!("/api/sessions/{id}")))
            .json(patch)
            .send()
            .await
            .map_err(|e| CoreError::Http(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(CoreError::Http(format!("patch session failed: {}", resp.status())))
        }
    }

    pub async fn delete_session(&self, id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/api/sessions/{id}")))
            .send()
            .await
            .map_err(|e| CoreError::Http(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            Ok(())
        } else {
            Err(CoreError::Http(format!("delete session failed: {}", resp.status())))
        }
    }

    pub async fn list_queue(&self, session_id: &str) -> Result<QueueListResponse> {
        let resp = self
            .client
            .get(self.url(&format!("/api/sessions/{session_id}/queue")))
            .send()
            .await
            .map_err(|e| CoreError::Http(e.to_string()))?;
        Self::json(resp).await
    }

    /// `spec.md` §8 S6: a `409 {error:"queue_full", ...}` is a domain
    /// outcome, not a transport failure — surfaced via `QueueAddOutcome`,
    /// not `Err`.
    pub async fn add_to_queue(
        &self,
        session_id: &str,
        req: &QueueAddRequest,
    ) -> Result<QueueAddOutcome> {
        let resp = self
            .client
            .post(self.url(&format!("/api/sessions/{session_id}/queue")))
            .json(req)
            .send()
            .await
            .map_err(|e| CoreError::Http(e.to_string()))?;
        match resp.status() {
            reqwest::StatusCode::CREATED => {
                let body: QueueAddResponse = Self::json(resp).await?;
                Ok(QueueAddOutcome::Added { id: body.id })
            }
            reqwest::StatusCode::CONFLICT => {
                let body: Value = resp.json().await.map_err(|e| CoreError::Http(e.to_string()))?;
                let message = body
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("queue is full")
                    .to_string();
                Ok(QueueAddOutcome::Full { message })
            }
            status => Err(CoreError::Http(format!("queue add failed: {status}"))),
        }
    }

    pub async fn remove_from_queue(&self, session_id: &str, message_id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/api/sessions/{session_id}/queue/{message_id}")))
            .send()
            .await
            .map_err(|e| CoreError::Http(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            Ok(())
        } else {
            Err(CoreError::Http(format!("queue remove failed: {}", resp.status())))
        }
    }

    pub async fn move_queue_item(
        &self,
        session_id: &str,
        message_id: &str,
        direction: MoveDirection,
    ) -> Result<QueueListResponse> {
        let resp = self
            .client
            .post(self.url(&format!("/api/sessions/{session_id}/queue/{message_id}/move")))
            .json(&serde_json::json!({ "direction": direction }))
            .send()
            .await
            .map_err(|e| CoreError::Http(e.to_string()))?;
        Self::json(resp).await
    }

    pub async fn login(&self, req: &LoginRequest) -> Result<()> {
        let resp = self
            .client
            .post(self.url("/api/login"))
            .json(req)
            .send()
            .await
            .map_err(|e| CoreError::Http(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(CoreError::Http(format!("login failed: {}", resp.status())))
        }
    }
}

/// The default `AuthProbe`: a `HEAD` request against `/api/sessions` — cheap,
/// side-effect-free, and gated behind the same auth middleware as every
/// other endpoint.
pub struct HeadAuthProbe {
    base_url: String,
    client: reqwest::Client,
}

impl HeadAuthProbe {
    pub fn new(api_prefix: impl Into<String>, client: reqwest::Client) -> Self {
        Self { base_url: api_prefix.into(), client }
    }
}

#[async_trait]
impl AuthProbe for HeadAuthProbe {
    async fn probe(&self) -> Result<bool> {
        let resp = self
            .client
            .head(format!("{}/api/sessions", self.base_url))
            .send()
            .await
            .map_err(|e| CoreError::Http(e.to_string()))?;
        Ok(resp.status() != reqwest::StatusCode::UNAUTHORIZED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_patch_omits_absent_fields() {
        let patch = SessionPatch { name: Some("renamed".into()), pinned: None };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json["name"], "renamed");
        assert!(json.get("pinned").is_none());
    }

    #[test]
    fn move_direction_serializes_lowercase() {
        assert_eq!(serde_json::to_value(MoveDirection::Up).unwrap(), "up");
        assert_eq!(serde_json::to_value(MoveDirection::Down).unwrap(), "down");
    }
}
