// SPDX-License-Identifier: Apache-2.0
//! The transcript `Message` variant (`spec.md` §3) and content-hash
//! deduplication (`spec.md` §4.1).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageRef {
    pub id: String,
    pub url: String,
    pub name: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One entry in a session transcript.
///
/// `seq` is `None` for optimistic local echoes that have not yet been
/// stamped with the server-assigned sequence number (`spec.md` §3, §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    User {
        text: String,
        #[serde(default)]
        images: Vec<ImageRef>,
        timestamp: i64,
        seq: Option<u64>,
        #[serde(default)]
        from_other_client: bool,
    },
    Agent {
        html: String,
        complete: bool,
        timestamp: i64,
        seq: Option<u64>,
    },
    Thought {
        text: String,
        complete: bool,
        timestamp: i64,
        seq: Option<u64>,
    },
    Tool {
        id: String,
        title: String,
        status: ToolStatus,
        timestamp: i64,
        seq: Option<u64>,
    },
    Error {
        text: String,
        timestamp: i64,
        seq: Option<u64>,
    },
    System {
        text: String,
        timestamp: i64,
    },
}

impl Message {
    /// The `seq` carried by this message, if any. `System` never has one.
    pub fn seq(&self) -> Option<u64> {
        match self {
            Message::User { seq, .. }
            | Message::Agent { seq, .. }
            | Message::Thought { seq, .. }
            | Message::Tool { seq, .. }
            | Message::Error { seq, .. } => *seq,
            Message::System { .. } => None,
        }
    }

    pub fn set_seq(&mut self, new_seq: u64) {
        match self {
            Message::User { seq, .. }
            | Message::Agent { seq, .. }
            | Message::Thought { seq, .. }
            | Message::Tool { seq, .. }
            | Message::Error { seq, .. } => *seq = Some(new_seq),
            Message::System { .. } => {}
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Message::User { timestamp, .. }
            | Message::Agent { timestamp, .. }
            | Message::Thought { timestamp, .. }
            | Message::Tool { timestamp, .. }
            | Message::Error { timestamp, .. }
            | Message::System { timestamp, .. } => *timestamp,
        }
    }

    /// Whether this is an in-flight streaming message (`spec.md` §3
    /// invariant: only the tail agent/thought message may be incomplete).
    pub fn is_incomplete(&self) -> bool {
        match self {
            Message::Agent { complete, .. } | Message::Thought { complete, .. } => !*complete,
            _ => false,
        }
    }

    /// True if this and `other` are the same logical message kind and could
    /// be coalesced (same `kind` discriminant; tool messages never coalesce
    /// by kind alone — they also require matching `id`, handled separately
    /// in `store::upsert_tool_status`).
    pub fn same_kind(&self, other: &Message) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Append streaming body content to an incomplete agent/thought message.
    /// Panics if called on a non-streaming variant — callers must check
    /// `is_incomplete()` first (mirrors the teacher's narrow, precondition-
    /// checked helpers rather than silently no-op'ing on misuse).
    pub fn append_chunk(&mut self, chunk: &str) {
        match self {
            Message::Agent { html, .. } => html.push_str(chunk),
            Message::Thought { text, .. } => text.push_str(chunk),
            other => panic!("append_chunk called on non-streaming message {other:?}"),
        }
    }

    pub fn mark_complete(&mut self) {
        match self {
            Message::Agent { complete, .. } | Message::Thought { complete, .. } => {
                *complete = true;
            }
            _ => {}
        }
    }

    /// `spec.md` §4.1 `contentHash`: role-prefixed digest over the first 200
    /// characters of `text`/`html`; tool messages hash `tool:{id}:{title}`
    /// since they carry no body text. This is the sole dedup key when `seq`
    /// is absent.
    pub fn content_hash(&self) -> String {
        fn prefix(role: &str, body: &str) -> String {
            let clipped: String = body.chars().take(200).collect();
            format!("{role}:{clipped}")
        }
        match self {
            Message::User { text, .. } => prefix("user", text),
            Message::Agent { html, .. } => prefix("agent", html),
            Message::Thought { text, .. } => prefix("thought", text),
            Message::Tool { id, title, .. } => format!("tool:{id}:{title}"),
            Message::Error { text, .. } => prefix("error", text),
            Message::System { text, .. } => prefix("system", text),
        }
    }

    /// Relative "completeness" ordering used by replay merge (`spec.md`
    /// §4.7 step 2): complete beats incomplete, then longer body wins.
    pub fn more_complete_than(&self, other: &Message) -> bool {
        let complete_rank = |m: &Message| match m {
            Message::Agent { complete, .. } | Message::Thought { complete, .. } => *complete,
            _ => true,
        };
        let body_len = |m: &Message| match m {
            Message::Agent { html, .. } => html.len(),
            Message::Thought { text, .. } => text.len(),
            Message::User { text, .. } => text.len(),
            Message::Error { text, .. } => text.len(),
            Message::System { text, .. } => text.len(),
            Message::Tool { .. } => 0,
        };
        match (complete_rank(self), complete_rank(other)) {
            (true, false) => true,
            (false, true) => false,
            _ => body_len(self) >= body_len(other),
        }
    }
}

/// `spec.md` §4.1 `classify`: turn a raw replayed event envelope into a
/// transcript `Message`. Unknown types return `None` (never fatal).
/// Replayed events are historical and committed, so streaming variants
/// classify as already-complete.
pub fn classify(raw: &crate::wire::RawEvent) -> Option<Message> {
    let timestamp = raw.timestamp.unwrap_or(0);
    let seq = raw.seq;
    match raw.kind.as_str() {
        "agent_message" => Some(Message::Agent {
            html: raw.data.get("html")?.as_str()?.to_string(),
            complete: true,
            timestamp,
            seq,
        }),
        "agent_thought" => Some(Message::Thought {
            text: raw.data.get("text")?.as_str()?.to_string(),
            complete: true,
            timestamp,
            seq,
        }),
        "tool_call" | "tool_update" => Some(Message::Tool {
            id: raw.data.get("id")?.as_str()?.to_string(),
            title: raw.data.get("title").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            status: serde_json::from_value(raw.data.get("status")?.clone()).ok()?,
            timestamp,
            seq,
        }),
        "user_prompt" => Some(Message::User {
            text: raw.data.get("message")?.as_str()?.to_string(),
            images: vec![],
            timestamp,
            seq,
            from_other_client: !raw.data.get("is_mine").and_then(|v| v.as_bool()).unwrap_or(true),
        }),
        "error" => Some(Message::Error {
            text: raw.data.get("message")?.as_str()?.to_string(),
            timestamp,
            seq,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::RawEvent;

    fn raw(kind: &str, data: serde_json::Value, seq: Option<u64>) -> RawEvent {
        RawEvent { kind: kind.into(), data, seq, timestamp: Some(0) }
    }

    #[test]
    fn classify_maps_agent_message_to_complete_message() {
        let ev = raw("agent_message", serde_json::json!({"html": "hi"}), Some(5));
        match classify(&ev).unwrap() {
            Message::Agent { html, complete, seq, .. } => {
                assert_eq!(html, "hi");
                assert!(complete);
                assert_eq!(seq, Some(5));
            }
            _ => panic!(),
        }
    }

    #[test]
    fn classify_drops_unknown_event_types() {
        let ev = raw("some_future_type", serde_json::json!({}), None);
        assert!(classify(&ev).is_none());
    }

    #[test]
    fn classify_user_prompt_sets_from_other_client_when_not_mine() {
        let ev = raw(
            "user_prompt",
            serde_json::json!({"message": "hi", "is_mine": false}),
            Some(9),
        );
        match classify(&ev).unwrap() {
            Message::User { from_other_client, .. } => assert!(from_other_client),
            _ => panic!(),
        }
    }


    fn agent(html: &str, complete: bool, seq: Option<u64>) -> Message {
        Message::Agent { html: html.into(), complete, timestamp: 0, seq }
    }

    #[test]
    fn content_hash_prefixes_by_role() {
        let a = Message::User { text: "hi".into(), images: vec![], timestamp: 0, seq: None, from_other_client: false };
        let b = agent("hi", true, None);
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn content_hash_tool_never_collides_with_text_message() {
        let tool = Message::Tool { id: "1".into(), title: "ls".into(), status: ToolStatus::Completed, timestamp: 0, seq: None };
        let text = Message::System { text: "tool:1:ls".into(), timestamp: 0 };
        assert_ne!(tool.content_hash(), text.content_hash());
    }

    #[test]
    fn content_hash_distinguishes_tool_id_and_title() {
        let a = Message::Tool { id: "1".into(), title: "ls".into(), status: ToolStatus::Pending, timestamp: 0, seq: None };
        let b = Message::Tool { id: "2".into(), title: "ls".into(), status: ToolStatus::Pending, timestamp: 0, seq: None };
        let c = Message::Tool { id: "1".into(), title: "cat".into(), status: ToolStatus::Pending, timestamp: 0, seq: None };
        assert_ne!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn content_hash_clips_at_200_chars() {
        let long = "x".repeat(500);
        let short_equivalent = "x".repeat(200);
        let a = Message::System { text: long, timestamp: 0 };
        let b = Message::System { text: short_equivalent, timestamp: 0 };
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn append_chunk_accumulates_on_agent() {
        let mut m = agent("Hel", false, Some(15));
        m.append_chunk("lo ");
        m.append_chunk("world");
        match &m {
            Message::Agent { html, complete, .. } => {
                assert_eq!(html, "Hello world");
                assert!(!complete);
            }
            _ => panic!(),
        }
        m.mark_complete();
        assert!(!m.is_incomplete());
    }

    #[test]
    fn more_complete_than_prefers_complete_flag() {
        let done = agent("short", true, Some(1));
        let streaming = agent("much much longer body", false, Some(1));
        assert!(done.more_complete_than(&streaming));
        assert!(!streaming.more_complete_than(&done));
    }

    #[test]
    fn more_complete_than_prefers_longer_body_when_tied() {
        let a = agent("short", true, Some(1));
        let b = agent("much longer", true, Some(1));
        assert!(b.more_complete_than(&a));
    }

    #[test]
    fn set_seq_stamps_optimistic_echo() {
        let mut m = Message::User { text: "hi".into(), images: vec![], timestamp: 0, seq: None, from_other_client: false };
        m.set_seq(11);
        assert_eq!(m.seq(), Some(11));
    }
}
