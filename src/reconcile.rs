// SPDX-License-Identifier: Apache-2.0
//! The reconciliation engine (`spec.md` §4.7): applies live-append events to
//! the store, merges replayed event batches with existing state, and drives
//! the mobile-wake staleness/authentication gate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::CoreConfig;
use crate::http::AuthProbe;
use crate::message::{self, Message};
use crate::pending::PendingPromptStore;
use crate::send::PendingSendRegistry;
use crate::session_ws::SessionSocketHandle;
use crate::store::{ActionButton, QueueConfig, SessionStateStore};
use crate::wire::{EventsLoadedData, ServerEvent};

/// Applies one server→client event from the live stream to the store,
/// resolving any pending send it implies (`spec.md` §4.7 "Live append":
/// `lastSeenSeq` is advanced eagerly on every event carrying one).
pub fn apply_live_event(
    store: &Mutex<SessionStateStore>,
    registry: &PendingSendRegistry,
    socket: &SessionSocketHandle,
    session_id: &str,
    config: &CoreConfig,
    pending_prompts: &PendingPromptStore,
    event: ServerEvent,
) {
    let max_messages = config.max_messages;
    match event {
        ServerEvent::Connected(d) => {
            let status = if d.status == "completed" {
                crate::store::SessionStatus::Completed
            } else {
                crate::store::SessionStatus::Active
            };
            let mut guard = store.lock().unwrap();
            guard.set_info(session_id, |info| {
                info.name = d.name;
                info.acp_server = d.acp_server;
                info.working_dir = d.working_dir;
                info.created_at = d.created_at;
                info.status = status;
                info.runner_type = d.runner_type;
                info.runner_restricted = d.runner_restricted;
            });
            guard.set_queue_length(session_id, d.queue_length);
            if let Some(rec) = guard.get_mut(session_id) {
                rec.queue_config = QueueConfig {
                    enabled: d.queue_config.enabled,
                    max_size: d.queue_config.max_size,
                    delay_seconds: d.queue_config.delay_seconds,
                };
            }
        }
        ServerEvent::AgentMessage(d) => {
            socket.note_seq(d.seq);
            let seq = Some(d.seq);
            store.lock().unwrap().coalesce_tail(
                session_id,
                seq,
                &d.html,
                |m| matches!(m, Message::Agent { .. }),
                |seq| Message::Agent { html: String::new(), complete: false, timestamp: 0, seq },
                max_messages,
            );
            registry.resolve_all_for_session(session_id);
        }
        ServerEvent::AgentThought(d) => {
            socket.note_seq(d.seq);
            let seq = Some(d.seq);
            store.lock().unwrap().coalesce_tail(
                session_id,
                seq,
                &d.text,
                |m| matches!(m, Message::Thought { .. }),
                |seq| Message::Thought { text: String::new(), complete: false, timestamp: 0, seq },
                max_messages,
            );
            registry.resolve_all_for_session(session_id);
        }
        ServerEvent::ToolCall(d) => {
            socket.note_seq(d.seq);
            store.lock().unwrap().append_message(
                session_id,
                Message::Tool {
                    id: d.id,
                    title: d.title,
                    status: d.status,
                    timestamp: 0,
                    seq: Some(d.seq),
                },
                max_messages,
            );
        }
        ServerEvent::ToolUpdate(d) => {
            store.lock().unwrap().upsert_tool_status(session_id, &d.id, d.status);
        }
        ServerEvent::ActionButtons(d) => {
            let buttons = d
                .buttons
                .into_iter()
                .map(|b| ActionButton { label: b.label, payload: b.payload })
                .collect();
            store.lock().unwrap().set_action_buttons(session_id, buttons);
        }
        ServerEvent::PromptComplete(_) => {
            let mut guard = store.lock().unwrap();
            guard.complete_tail(session_id);
            guard.set_streaming(session_id, false);
        }
        ServerEvent::UserPrompt(d) => {
            socket.note_seq(d.seq);
            if let Some(prompt_id) = &d.prompt_id {
                registry.resolve(prompt_id);
            }
            if d.is_mine {
                stamp_optimistic_echo(store, session_id, &d.message, d.seq);
            } else {
                store.lock().unwrap().append_message(
                    session_id,
                    Message::User {
                        text: d.message,
                        images: vec![],
                        timestamp: 0,
                        seq: Some(d.seq),
                        from_other_client: true,
                    },
                    max_messages,
                );
            }
        }
        ServerEvent::PromptReceived(d) => {
            registry.resolve(&d.prompt_id);
        }
        ServerEvent::Error(d) => {
            if let Some(prompt_id) = &d.prompt_id {
                if registry.reject(prompt_id, d.message.clone()) {
                    return;
                }
            }
            store.lock().unwrap().append_message(
                session_id,
                Message::Error { text: d.message, timestamp: 0, seq: None },
                max_messages,
            );
        }
        ServerEvent::KeepaliveAck => {}
        ServerEvent::EventsLoaded(data) => {
            let _ = pending_prompts.clear_from_events(&data.events);
            if let StaleAction::ResetAndReloadFresh = replay_merge(store, session_id, data) {
                socket.reset_seq();
                let _ = socket.send(crate::wire::ClientMessage::LoadEvents {
                    limit: Some(config.initial_events_limit),
                    before_seq: None,
                    after_seq: None,
                });
            }
        }
        ServerEvent::SessionSync(raw) => {
            if let Ok(data) = serde_json::from_value::<EventsLoadedData>(raw) {
                let _ = pending_prompts.clear_from_events(&data.events);
                replay_merge(store, session_id, data);
            }
        }
        ServerEvent::SessionRenamed(d) => {
            store.lock().unwrap().set_info(session_id, |info| info.name = d.name);
        }
        ServerEvent::SessionReset => {
            store.lock().unwrap().replace_messages(session_id, vec![]);
        }
        ServerEvent::QueueUpdated(d) => {
            store.lock().unwrap().set_queue_length(session_id, d.queue_length);
        }
        ServerEvent::QueueMessageSending
        | ServerEvent::QueueMessageSent
        | ServerEvent::QueueMessageTitled
        | ServerEvent::QueueReordered => {
            tracing::debug!(session_id = %session_id, "queue lifecycle event observed");
        }
        ServerEvent::RunnerFallback(d) => {
            store.lock().unwrap().set_info(session_id, |info| info.runner_type = Some(d.runner_type));
        }
        ServerEvent::Unknown(kind) => {
            tracing::debug!(session_id = %session_id, kind = %kind, "dropping unknown event type");
        }
    }
}

/// Finds the seq-less optimistic local echo matching this prompt's text and
/// stamps it with the server-assigned seq (`spec.md` §9 "Optimistic local
/// echo stamped later by server seq").
fn stamp_optimistic_echo(
    store: &Mutex<SessionStateStore>,
    session_id: &str,
    message_text: &str,
    seq: u64,
) {
    let mut guard = store.lock().unwrap();
    if let Some(rec) = guard.get_mut(session_id) {
        if let Some(m) = rec.messages.iter_mut().rev().find(|m| {
            matches!(m, Message::User { seq: None, text, .. } if text == message_text)
        }) {
            m.set_seq(seq);
        }
    }
}

enum StaleAction {
    None,
    ResetAndReloadFresh,
}

/// `spec.md` §4.7 "Replay merge", steps 1-7.
fn replay_merge(store: &Mutex<SessionStateStore>, session_id: &str, data: EventsLoadedData) -> StaleAction {
    let mut guard = store.lock().unwrap();
    let Some(rec) = guard.get(session_id) else { return StaleAction::None };

    if data.events.is_empty() {
        if data.total_count > 0 && rec.last_seq > 0 {
            return StaleAction::ResetAndReloadFresh;
        }
        return StaleAction::None;
    }

    let replayed: Vec<Message> = data.events.iter().filter_map(message::classify).collect();

    if data.prepend {
        guard.prepend_messages(session_id, replayed, data.first_seq);
        return StaleAction::None;
    }

    let existing = guard.get(session_id).map(|r| r.messages.clone()).unwrap_or_default();
    let merged = merge_messages_with_sync(existing, replayed);
    guard.replace_messages(session_id, merged);
    if let Some(rec) = guard.get_mut(session_id) {
        rec.has_more_messages = data.has_more;
        if let Some(first) = data.first_seq {
            rec.first_loaded_seq = Some(first);
        }
    }
    StaleAction::None
}

/// Pure merge step (`spec.md` §8 round-trip property `mergeMessagesWithSync`):
/// neither input is mutated, `(existing, []) ≡ existing`, `([], new) ≡ new`.
pub fn merge_messages_with_sync(existing: Vec<Message>, replayed: Vec<Message>) -> Vec<Message> {
    if replayed.is_empty() {
        return existing;
    }
    if existing.is_empty() {
        return replayed;
    }

    let mut result = existing;
    let mut by_seq: HashMap<u64, usize> = HashMap::new();
    let mut by_hash: HashMap<String, usize> = HashMap::new();
    for (i, m) in result.iter().enumerate() {
        if let Some(seq) = m.seq() {
            by_seq.insert(seq, i);
        }
        by_hash.insert(m.content_hash(), i);
    }

    for rep in replayed {
        if let Some(seq) = rep.seq() {
            if let Some(&idx) = by_seq.get(&seq) {
                if rep.more_complete_than(&result[idx]) {
                    result[idx] = rep;
                }
                continue;
            }
        }
        let hash = rep.content_hash();
        if by_hash.contains_key(&hash) {
            continue;
        }
        let idx = result.len();
        by_hash.insert(hash, idx);
        if let Some(seq) = rep.seq() {
            by_seq.insert(seq, idx);
        }
        result.push(rep);
    }

    result.sort_by(|a, b| match (a.seq(), b.seq()) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.timestamp().cmp(&b.timestamp()),
    });

    result
}

#[derive(Debug, PartialEq, Eq)]
pub enum MobileWakeOutcome {
    Proceed,
    AuthRequired,
}

/// `spec.md` §4.7 "Mobile wake". Reaps expired pending prompts unconditionally;
/// re-authenticates only if the hidden duration exceeded the stale threshold.
pub async fn mobile_wake(
    hidden_duration: Duration,
    config: &CoreConfig,
    auth: &Arc<dyn AuthProbe>,
    pending_prompts: &PendingPromptStore,
) -> MobileWakeOutcome {
    let _ = pending_prompts.reap_expired();

    if hidden_duration < config.stale_wake_threshold {
        return MobileWakeOutcome::Proceed;
    }

    for attempt in 0..config.wake_auth_retries {
        match auth.probe().await {
            Ok(true) => return MobileWakeOutcome::Proceed,
            Ok(false) => return MobileWakeOutcome::AuthRequired,
            Err(_) if attempt + 1 < config.wake_auth_retries => {
                tokio::time::sleep(config.wake_auth_retry_backoff).await;
            }
            Err(_) => return MobileWakeOutcome::AuthRequired,
        }
    }
    MobileWakeOutcome::AuthRequired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SessionInfo, SessionRecord, SessionStatus};

    fn agent(html: &str, complete: bool, seq: Option<u64>) -> Message {
        Message::Agent { html: html.into(), complete, timestamp: seq.unwrap_or(0) as i64, seq }
    }

    #[test]
    fn merge_with_empty_replayed_returns_existing_unchanged() {
        let existing = vec![agent("a", true, Some(1))];
        let merged = merge_messages_with_sync(existing.clone(), vec![]);
        assert_eq!(merged.len(), existing.len());
    }

    #[test]
    fn merge_with_empty_existing_returns_replayed() {
        let replayed = vec![agent("a", true, Some(1))];
        let merged = merge_messages_with_sync(vec![], replayed.clone());
        assert_eq!(merged.len(), replayed.len());
    }

    #[test]
    fn merge_drops_duplicate_by_seq_without_doubling() {
        let existing = vec![agent("abc", true, Some(7))];
        let replayed = vec![agent("abc", true, Some(7))];
        let merged = merge_messages_with_sync(existing, replayed);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn merge_prefers_complete_representative_on_seq_match() {
        let existing = vec![agent("partial", false, Some(3))];
        let replayed = vec![agent("partial and done", true, Some(3))];
        let merged = merge_messages_with_sync(existing, replayed);
        assert_eq!(merged.len(), 1);
        match &merged[0] {
            Message::Agent { html, complete, .. } => {
                assert_eq!(html, "partial and done");
                assert!(complete);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn merge_is_idempotent_under_repeated_application() {
        let existing = vec![agent("a", true, Some(1)), agent("b", true, Some(2))];
        let replayed = vec![agent("a", true, Some(1)), agent("b", true, Some(2))];
        let once = merge_messages_with_sync(existing.clone(), replayed.clone());
        let twice = merge_messages_with_sync(once.clone(), replayed);
        assert_eq!(once.len(), twice.len());
    }

    #[test]
    fn merge_sorts_by_seq_when_both_sides_have_one() {
        let existing = vec![agent("first", true, Some(5))];
        let replayed = vec![agent("earlier", true, Some(1))];
        let merged = merge_messages_with_sync(existing, replayed);
        assert_eq!(merged[0].seq(), Some(1));
        assert_eq!(merged[1].seq(), Some(5));
    }

    fn store_with(id: &str) -> Mutex<SessionStateStore> {
        let mut store = SessionStateStore::new();
        store.insert(SessionRecord::new(
            id,
            SessionInfo {
                name: "n".into(),
                acp_server: "a".into(),
                working_dir: "/tmp".into(),
                created_at: 0,
                status: SessionStatus::Active,
                runner_type: None,
                runner_restricted: false,
            },
        ));
        Mutex::new(store)
    }

    #[tokio::test]
    async fn mobile_wake_skips_auth_when_hidden_duration_under_threshold() {
        struct Unreachable;
        #[async_trait::async_trait]
        impl AuthProbe for Unreachable {
            async fn probe(&self) -> crate::error::Result<bool> {
                panic!("should not be called")
            }
        }
        let config = CoreConfig { stale_wake_threshold: Duration::from_secs(3600), ..CoreConfig::default() };
        let pending = PendingPromptStore::new(Arc::new(crate::persist::MemoryStore::default()), Duration::from_secs(300));
        let outcome =
            mobile_wake(Duration::from_secs(10), &config, &(Arc::new(Unreachable) as Arc<dyn AuthProbe>), &pending).await;
        assert_eq!(outcome, MobileWakeOutcome::Proceed);
    }

    #[tokio::test]
    async fn mobile_wake_requires_auth_when_probe_returns_unauthenticated() {
        struct Rejects;
        #[async_trait::async_trait]
        impl AuthProbe for Rejects {
            async fn probe(&self) -> crate::error::Result<bool> {
                Ok(false)
            }
        }
        let config = CoreConfig { stale_wake_threshold: Duration::from_millis(1), ..CoreConfig::default() };
        let pending = PendingPromptStore::new(Arc::new(crate::persist::MemoryStore::default()), Duration::from_secs(300));
        let outcome =
            mobile_wake(Duration::from_secs(10), &config, &(Arc::new(Rejects) as Arc<dyn AuthProbe>), &pending).await;
        assert_eq!(outcome, MobileWakeOutcome::AuthRequired);
    }

    #[test]
    fn replay_merge_stale_reset_when_zero_events_but_nonzero_total() {
        let store = store_with("s1");
        {
            let mut guard = store.lock().unwrap();
            guard.append_message("s1", agent("old", true, Some(42)), 100);
        }
        let data = EventsLoadedData {
            events: vec![],
            prepend: false,
            has_more: false,
            first_seq: None,
            last_seq: None,
            is_prompting: true,
            total_count: 30,
        };
        assert!(matches!(replay_merge(&store, "s1", data), StaleAction::ResetAndReloadFresh));
    }
}
