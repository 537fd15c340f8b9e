// SPDX-License-Identifier: Apache-2.0
//! The session state store (`spec.md` §4.5). All mutations produce a new
//! `SessionRecord` value for the affected id; unrelated sessions are never
//! touched.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::seq::SeqTracker;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: String,
    pub acp_server: String,
    pub working_dir: String,
    pub created_at: i64,
    pub status: SessionStatus,
    pub runner_type: Option<String>,
    pub runner_restricted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionButton {
    pub label: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub message: String,
    pub title: Option<String>,
    pub queued_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub enabled: bool,
    pub max_size: u32,
    pub delay_seconds: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { enabled: false, max_size: 0, delay_seconds: 0 }
    }
}

/// Per-session state (`spec.md` §3 `SessionRecord`).
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub info: SessionInfo,
    pub messages: Vec<Message>,
    pub is_streaming: bool,
    pub last_seq: u64,
    pub first_loaded_seq: Option<u64>,
    pub has_more_messages: bool,
    pub action_buttons: Vec<ActionButton>,
    pub queue: Vec<QueueItem>,
    /// Server-reported count (`queue_updated`), independent of whatever
    /// subset of `queue` items happen to be fetched locally.
    pub queue_length: u32,
    pub queue_config: QueueConfig,
    #[doc(hidden)]
    pub seq_tracker: SeqTracker,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>, info: SessionInfo) -> Self {
        Self {
            id: id.into(),
            info,
            messages: Vec::new(),
            is_streaming: false,
            last_seq: 0,
            first_loaded_seq: None,
            has_more_messages: false,
            action_buttons: Vec::new(),
            queue: Vec::new(),
            queue_length: 0,
            queue_config: QueueConfig::default(),
            seq_tracker: SeqTracker::default(),
        }
    }
}

/// Owns every `SessionRecord`, keyed by session id (`spec.md` §4.5, §3
/// Ownership & lifecycle).
#[derive(Debug, Default)]
pub struct SessionStateStore {
    sessions: HashMap<String, SessionRecord>,
}

impl SessionStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&SessionRecord> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SessionRecord> {
        self.sessions.get_mut(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.sessions.keys()
    }

    /// Created when the controller calls new-session, a `session_created`
    /// global event arrives, or the user switches to a stored session.
    pub fn insert(&mut self, record: SessionRecord) {
        self.sessions.insert(record.id.clone(), record);
    }

    /// Destroyed when the server confirms deletion or `remove-session`
    /// completes.
    pub fn remove(&mut self, id: &str) -> Option<SessionRecord> {
        self.sessions.remove(id)
    }

    /// `spec.md` §4.5 `appendMessage`: append, then truncate head to
    /// `max_messages`.
    pub fn append_message(&mut self, id: &str, msg: Message, max_messages: usize) {
        if let Some(rec) = self.sessions.get_mut(id) {
            if let Some(seq) = msg.seq() {
                rec.seq_tracker.mark_seen(seq);
                if seq > rec.last_seq {
                    rec.last_seq = seq;
                }
            }
            rec.messages.push(msg);
            if rec.messages.len() > max_messages {
                let overflow = rec.messages.len() - max_messages;
                rec.messages.drain(0..overflow);
            }
        }
    }

    /// `spec.md` §4.5 `coalesceTail` for `agent_message` / `agent_thought`.
    /// `kind_matches` identifies whether a candidate tail message is of the
    /// streaming kind being appended (agent vs thought); callers pass a
    /// constructor for the "new message" case.
    pub fn coalesce_tail(
        &mut self,
        id: &str,
        seq: Option<u64>,
        chunk: &str,
        is_same_kind: impl Fn(&Message) -> bool,
        new_message: impl FnOnce(Option<u64>) -> Message,
        max_messages: usize,
    ) {
        let Some(rec) = self.sessions.get_mut(id) else { return };

        let tail_matches = rec
            .messages
            .last()
            .map(|m| is_same_kind(m) && m.is_incomplete() && m.seq() == seq)
            .unwrap_or(false);

        if tail_matches {
            if let Some(tail) = rec.messages.last_mut() {
                tail.append_chunk(chunk);
            }
            if let Some(s) = seq {
                rec.seq_tracker.mark_seen(s);
                if s > rec.last_seq {
                    rec.last_seq = s;
                }
            }
            return;
        }

        drop(rec);
        self.append_message(id, new_message(seq), max_messages);
    }

    /// `spec.md` §4.5 `completeTail`.
    pub fn complete_tail(&mut self, id: &str) {
        if let Some(rec) = self.sessions.get_mut(id) {
            if let Some(tail) = rec.messages.last_mut() {
                if tail.is_incomplete() {
                    tail.mark_complete();
                }
            }
        }
    }

    /// `spec.md` §4.5 `upsertToolStatus`: find the *last* tool message with
    /// that id; replace its status.
    pub fn upsert_tool_status(&mut self, id: &str, tool_id: &str, status: crate::message::ToolStatus) {
        if let Some(rec) = self.sessions.get_mut(id) {
            for m in rec.messages.iter_mut().rev() {
                if let Message::Tool { id: tid, status: s, .. } = m {
                    if tid == tool_id {
                        *s = status;
                        return;
                    }
                }
            }
        }
    }

    pub fn set_streaming(&mut self, id: &str, value: bool) {
        if let Some(rec) = self.sessions.get_mut(id) {
            rec.is_streaming = value;
        }
    }

    pub fn set_info(&mut self, id: &str, patch: impl FnOnce(&mut SessionInfo)) {
        if let Some(rec) = self.sessions.get_mut(id) {
            patch(&mut rec.info);
        }
    }

    pub fn set_action_buttons(&mut self, id: &str, buttons: Vec<ActionButton>) {
        if let Some(rec) = self.sessions.get_mut(id) {
            rec.action_buttons = buttons;
        }
    }

    pub fn set_queue(&mut self, id: &str, items: Vec<QueueItem>) {
        if let Some(rec) = self.sessions.get_mut(id) {
            rec.queue = items;
        }
    }

    pub fn set_queue_length(&mut self, id: &str, length: u32) {
        if let Some(rec) = self.sessions.get_mut(id) {
            rec.queue_length = length;
        }
    }

    /// Wholesale replacement of the transcript, used by the reconciliation
    /// engine's stale-state recovery (`spec.md` §4.7 step 7) and
    /// `session_reset`.
    pub fn replace_messages(&mut self, id: &str, messages: Vec<Message>) {
        if let Some(rec) = self.sessions.get_mut(id) {
            rec.seq_tracker.reset();
            for m in &messages {
                if let Some(seq) = m.seq() {
                    rec.seq_tracker.mark_seen(seq);
                }
            }
            rec.last_seq = messages.iter().filter_map(|m| m.seq()).max().unwrap_or(0);
            rec.messages = messages;
        }
    }

    /// "Load earlier" prepend (`spec.md` §4.7 step 6).
    pub fn prepend_messages(&mut self, id: &str, mut batch: Vec<Message>, first_loaded_seq: Option<u64>) {
        if let Some(rec) = self.sessions.get_mut(id) {
            batch.extend(std::mem::take(&mut rec.messages));
            rec.messages = batch;
            rec.first_loaded_seq = first_loaded_seq;
        }
    }

    pub fn set_pagination_cursors(&mut self, id: &str, first_loaded_seq: Option<u64>, has_more: bool) {
        if let Some(rec) = self.sessions.get_mut(id) {
            rec.first_loaded_seq = first_loaded_seq;
            rec.has_more_messages = has_more;
        }
    }

    /// Eagerly advance `last_seq` from any event-bearing seq (`spec.md`
    /// §4.7: "`lastSeenSeq` is updated eagerly on every event").
    pub fn note_seq_seen(&mut self, id: &str, seq: u64) {
        if let Some(rec) = self.sessions.get_mut(id) {
            rec.seq_tracker.mark_seen(seq);
            if seq > rec.last_seq {
                rec.last_seq = seq;
            }
        }
    }

    /// Explicit stale-reset path (`spec.md` §8 property 4, §4.7 step 7).
    pub fn reset_last_seq(&mut self, id: &str) {
        if let Some(rec) = self.sessions.get_mut(id) {
            rec.last_seq = 0;
            rec.seq_tracker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolStatus;

    fn info() -> SessionInfo {
        SessionInfo {
            name: "s".into(),
            acp_server: "acp".into(),
            working_dir: "/tmp".into(),
            created_at: 0,
            status: SessionStatus::Active,
            runner_type: None,
            runner_restricted: false,
        }
    }

    fn user(text: &str, seq: Option<u64>) -> Message {
        Message::User { text: text.into(), images: vec![], timestamp: 0, seq, from_other_client: false }
    }

    fn store_with_session(id: &str) -> SessionStateStore {
        let mut store = SessionStateStore::new();
        store.insert(SessionRecord::new(id, info()));
        store
    }

    #[test]
    fn append_message_truncates_head_at_max_messages() {
        let mut store = store_with_session("s1");
        for i in 0..5 {
            store.append_message("s1", user(&format!("m{i}"), None), 3);
        }
        let rec = store.get("s1").unwrap();
        assert_eq!(rec.messages.len(), 3);
        assert_eq!(rec.messages[0].as_user_text(), Some("m2"));
    }

    #[test]
    fn append_message_on_unrelated_session_is_noop() {
        let mut store = SessionStateStore::new();
        store.insert(SessionRecord::new("s1", info()));
        store.insert(SessionRecord::new("s2", info()));
        store.append_message("s1", user("hi", None), 100);
        assert!(store.get("s2").unwrap().messages.is_empty());
    }

    #[test]
    fn coalesce_tail_appends_to_matching_incomplete_tail() {
        let mut store = store_with_session("s1");
        let mk = |seq: Option<u64>| Message::Agent { html: String::new(), complete: false, timestamp: 0, seq };
        let is_agent = |m: &Message| matches!(m, Message::Agent { .. });
        store.coalesce_tail("s1", Some(15), "Hel", is_agent, mk, 100);
        store.coalesce_tail("s1", Some(15), "lo ", is_agent, mk, 100);
        store.coalesce_tail("s1", Some(15), "world", is_agent, mk, 100);
        let rec = store.get("s1").unwrap();
        assert_eq!(rec.messages.len(), 1);
        match &rec.messages[0] {
            Message::Agent { html, .. } => assert_eq!(html, "Hello world"),
            _ => panic!(),
        }
    }

    #[test]
    fn coalesce_tail_starts_new_message_when_seq_differs() {
        let mut store = store_with_session("s1");
        let mk = |seq: Option<u64>| Message::Agent { html: String::new(), complete: false, timestamp: 0, seq };
        let is_agent = |m: &Message| matches!(m, Message::Agent { .. });
        store.coalesce_tail("s1", Some(1), "a", is_agent, mk, 100);
        store.complete_tail("s1");
        store.coalesce_tail("s1", Some(2), "b", is_agent, mk, 100);
        assert_eq!(store.get("s1").unwrap().messages.len(), 2);
    }

    #[test]
    fn complete_tail_marks_incomplete_streaming_message_done() {
        let mut store = store_with_session("s1");
        let mk = |seq: Option<u64>| Message::Thought { text: String::new(), complete: false, timestamp: 0, seq };
        let is_thought = |m: &Message| matches!(m, Message::Thought { .. });
        store.coalesce_tail("s1", Some(1), "thinking", is_thought, mk, 100);
        store.complete_tail("s1");
        match &store.get("s1").unwrap().messages[0] {
            Message::Thought { complete, .. } => assert!(complete),
            _ => panic!(),
        }
    }

    #[test]
    fn upsert_tool_status_updates_last_matching_tool_by_id() {
        let mut store = store_with_session("s1");
        store.append_message("s1", Message::Tool { id: "t1".into(), title: "ls".into(), status: ToolStatus::Pending, timestamp: 0, seq: None }, 100);
        store.upsert_tool_status("s1", "t1", ToolStatus::Completed);
        match &store.get("s1").unwrap().messages[0] {
            Message::Tool { status, .. } => assert_eq!(*status, ToolStatus::Completed),
            _ => panic!(),
        }
    }

    #[test]
    fn reset_last_seq_drops_tracker_to_zero() {
        let mut store = store_with_session("s1");
        store.note_seq_seen("s1", 42);
        assert_eq!(store.get("s1").unwrap().last_seq, 42);
        store.reset_last_seq("s1");
        assert_eq!(store.get("s1").unwrap().last_seq, 0);
    }
}

impl Message {
    #[cfg(test)]
    fn as_user_text(&self) -> Option<&str> {
        match self {
            Message::User { text, .. } => Some(text),
            _ => None,
        }
    }
}
