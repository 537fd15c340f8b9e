// SPDX-License-Identifier: Apache-2.0
//! The WebSocket wire contract (`spec.md` §4.3, §4.4, §6). Every frame is a
//! JSON object `{type, data}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::ToolStatus;

fn default_true() -> bool {
    true
}

// ── Client → server (per-session socket) ───────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Prompt {
        message: String,
        image_ids: Vec<String>,
        prompt_id: String,
    },
    Cancel,
    ForceReset,
    LoadEvents {
        #[serde(skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        before_seq: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        after_seq: Option<u64>,
    },
    /// Deprecated; accepted server-side for compatibility (`spec.md` §9).
    SyncSession {
        session_id: String,
        after_seq: u64,
    },
    Keepalive {
        client_time: i64,
    },
}

// ── Server → client (per-session socket) ───────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectedData {
    pub working_dir: String,
    pub name: String,
    pub acp_server: String,
    pub created_at: i64,
    pub status: String,
    #[serde(default = "default_true")]
    pub is_prompting: bool,
    #[serde(default)]
    pub queue_length: u32,
    pub queue_config: QueueConfigData,
    pub runner_type: Option<String>,
    #[serde(default)]
    pub runner_restricted: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfigData {
    pub enabled: bool,
    pub max_size: u32,
    pub delay_seconds: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentMessageData {
    pub html: String,
    #[serde(default = "default_true")]
    pub is_prompting: bool,
    pub seq: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentThoughtData {
    pub text: String,
    #[serde(default = "default_true")]
    pub is_prompting: bool,
    pub seq: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallData {
    pub id: String,
    pub title: String,
    pub status: ToolStatus,
    #[serde(default = "default_true")]
    pub is_prompting: bool,
    pub seq: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolUpdateData {
    pub id: String,
    pub status: ToolStatus,
    #[serde(default = "default_true")]
    pub is_prompting: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionButton {
    pub label: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionButtonsData {
    pub buttons: Vec<ActionButton>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptCompleteData {
    pub event_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserPromptData {
    pub seq: u64,
    pub is_mine: bool,
    pub prompt_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub image_ids: Vec<String>,
    pub sender_id: Option<String>,
    #[serde(default = "default_true")]
    pub is_prompting: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptReceivedData {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub message: String,
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    pub seq: Option<u64>,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsLoadedData {
    pub events: Vec<RawEvent>,
    pub prepend: bool,
    pub has_more: bool,
    pub first_seq: Option<u64>,
    pub last_seq: Option<u64>,
    #[serde(default = "default_true")]
    pub is_prompting: bool,
    pub total_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionRenamedData {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueUpdatedData {
    pub queue_length: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerFallbackData {
    pub runner_type: String,
    pub message: Option<String>,
}

/// Server→client events on the per-session socket. Unknown `type`s classify
/// to `Unknown` and are dropped by the caller, never treated as fatal
/// (`spec.md` §4.1 `classify`).
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Connected(ConnectedData),
    AgentMessage(AgentMessageData),
    AgentThought(AgentThoughtData),
    ToolCall(ToolCallData),
    ToolUpdate(ToolUpdateData),
    ActionButtons(ActionButtonsData),
    PromptComplete(PromptCompleteData),
    UserPrompt(UserPromptData),
    PromptReceived(PromptReceivedData),
    Error(ErrorData),
    KeepaliveAck,
    EventsLoaded(EventsLoadedData),
    SessionSync(Value),
    SessionRenamed(SessionRenamedData),
    SessionReset,
    QueueUpdated(QueueUpdatedData),
    QueueMessageSending,
    QueueMessageSent,
    QueueMessageTitled,
    QueueReordered,
    RunnerFallback(RunnerFallbackData),
    Unknown(String),
}

impl ServerEvent {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let envelope: RawEvent = serde_json::from_str(raw)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: RawEvent) -> Result<Self, serde_json::Error> {
        let data = envelope.data;
        Ok(match envelope.kind.as_str() {
            "connected" => ServerEvent::Connected(serde_json::from_value(data)?),
            "agent_message" => ServerEvent::AgentMessage(serde_json::from_value(data)?),
            "agent_thought" => ServerEvent::AgentThought(serde_json::from_value(data)?),
            "tool_call" => ServerEvent::ToolCall(serde_json::from_value(data)?),
            "tool_update" => ServerEvent::ToolUpdate(serde_json::from_value(data)?),
            "action_buttons" => ServerEvent::ActionButtons(serde_json::from_value(data)?),
            "prompt_complete" => ServerEvent::PromptComplete(serde_json::from_value(data)?),
            "user_prompt" => ServerEvent::UserPrompt(serde_json::from_value(data)?),
            "prompt_received" => ServerEvent::PromptReceived(serde_json::from_value(data)?),
            "error" => ServerEvent::Error(serde_json::from_value(data)?),
            "keepalive_ack" => ServerEvent::KeepaliveAck,
            "events_loaded" => ServerEvent::EventsLoaded(serde_json::from_value(data)?),
            "session_sync" => ServerEvent::SessionSync(data),
            "session_renamed" => ServerEvent::SessionRenamed(serde_json::from_value(data)?),
            "session_reset" => ServerEvent::SessionReset,
            "queue_updated" => ServerEvent::QueueUpdated(serde_json::from_value(data)?),
            "queue_message_sending" => ServerEvent::QueueMessageSending,
            "queue_message_sent" => ServerEvent::QueueMessageSent,
            "queue_message_titled" => ServerEvent::QueueMessageTitled,
            "queue_reordered" => ServerEvent::QueueReordered,
            "runner_fallback" => ServerEvent::RunnerFallback(serde_json::from_value(data)?),
            other => ServerEvent::Unknown(other.to_string()),
        })
    }
}

// ── Global events socket (`spec.md` §4.4) ──────────────────────────────────

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

#[derive(Debug, Clone)]
pub enum GlobalEvent {
    SessionCreated(SessionSummary),
    SessionRenamed { session_id: String, name: String },
    SessionDeleted { session_id: String },
    SessionPinned { session_id: String, pinned: bool },
    Unknown(String),
}

impl GlobalEvent {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let envelope: RawEvent = serde_json::from_str(raw)?;
        let data = envelope.data;
        Ok(match envelope.kind.as_str() {
            "session_created" => GlobalEvent::SessionCreated(serde_json::from_value(data)?),
            "session_renamed" => {
                #[derive(Deserialize)]
                struct D {
                    session_id: String,
                    name: String,
                }
                let d: D = serde_json::from_value(data)?;
                GlobalEvent::SessionRenamed { session_id: d.session_id, name: d.name }
            }
            "session_deleted" => {
                #[derive(Deserialize)]
                struct D {
                    session_id: String,
                }
                let d: D = serde_json::from_value(data)?;
                GlobalEvent::SessionDeleted { session_id: d.session_id }
            }
            "session_pinned" => {
                #[derive(Deserialize)]
                struct D {
                    session_id: String,
                    pinned: bool,
                }
                let d: D = serde_json::from_value(data)?;
                GlobalEvent::SessionPinned { session_id: d.session_id, pinned: d.pinned }
            }
            other => GlobalEvent::Unknown(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_event_type_classifies_as_unknown_not_error() {
        let raw = r#"{"type":"some_future_event","data":{}}"#;
        let ev = ServerEvent::parse(raw).unwrap();
        matches!(ev, ServerEvent::Unknown(_));
    }

    #[test]
    fn agent_message_defaults_is_prompting_true_when_absent() {
        let raw = r#"{"type":"agent_message","data":{"html":"hi","seq":3}}"#;
        match ServerEvent::parse(raw).unwrap() {
            ServerEvent::AgentMessage(d) => {
                assert!(d.is_prompting);
                assert_eq!(d.seq, 3);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn client_message_prompt_serializes_to_spec_shape() {
        let msg = ClientMessage::Prompt {
            message: "hi".into(),
            image_ids: vec![],
            prompt_id: "p_1".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "prompt");
        assert_eq!(json["data"]["prompt_id"], "p_1");
    }

    #[test]
    fn load_events_omits_absent_fields() {
        let msg = ClientMessage::LoadEvents { limit: Some(50), before_seq: None, after_seq: None };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json["data"].get("before_seq").is_none());
        assert_eq!(json["data"]["limit"], 50);
    }
}
