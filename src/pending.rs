// SPDX-License-Identifier: Apache-2.0
//! Durable queue of unacknowledged outbound prompts (`spec.md` §4.2).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::persist::{LocalStore, LocalStoreExt, KEY_PENDING_PROMPTS};
use crate::wire::RawEvent;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPendingPrompt {
    pub prompt_id: String,
    pub session_id: String,
    pub message: String,
    pub image_ids: Vec<String>,
    pub file_ids: Vec<String>,
    pub created_at: i64,
}

impl PersistedPendingPrompt {
    pub fn is_expired(&self, ttl: Duration, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.created_at) as u64 > ttl.as_millis() as u64
    }
}

/// `promptId` format: `prompt_{epochMs}_{random9}` (`spec.md` §4.2) —
/// monotone-ish, sortable, collision-free for practical loads.
pub fn new_prompt_id() -> String {
    let epoch_ms = now_ms();
    let mut rng = rand::thread_rng();
    let random9: String = (0..9)
        .map(|_| std::char::from_digit(rng.gen_range(0..36), 36).unwrap())
        .collect();
    format!("prompt_{epoch_ms}_{random9}")
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

pub struct PendingPromptStore {
    store: Arc<dyn LocalStore>,
    ttl: Duration,
    cache: Mutex<HashMap<String, PersistedPendingPrompt>>,
}

impl PendingPromptStore {
    pub fn new(store: Arc<dyn LocalStore>, ttl: Duration) -> Self {
        let cache = store.load::<HashMap<String, PersistedPendingPrompt>>(KEY_PENDING_PROMPTS)
            .ok()
            .flatten()
            .unwrap_or_default();
        Self { store, ttl, cache: Mutex::new(cache) }
    }

    fn flush(&self, cache: &HashMap<String, PersistedPendingPrompt>) -> Result<()> {
        self.store.save(KEY_PENDING_PROMPTS, cache)
    }

    /// `spec.md` §4.2 `save`: atomic write to durable local storage.
    pub fn save(
        &self,
        session_id: &str,
        prompt_id: &str,
        message: &str,
        image_ids: Vec<String>,
        file_ids: Vec<String>,
    ) -> Result<()> {
        let mut cache = self.cache.lock().unwrap();
        cache.insert(
            prompt_id.to_string(),
            PersistedPendingPrompt {
                prompt_id: prompt_id.to_string(),
                session_id: session_id.to_string(),
                message: message.to_string(),
                image_ids,
                file_ids,
                created_at: now_ms(),
            },
        );
        self.flush(&cache)
    }

    /// `spec.md` §4.2 `remove`: idempotent.
    pub fn remove(&self, prompt_id: &str) -> Result<()> {
        let mut cache = self.cache.lock().unwrap();
        cache.remove(prompt_id);
        self.flush(&cache)
    }

    /// `spec.md` §4.2 `forSession`: oldest first, excludes expired.
    pub fn for_session(&self, session_id: &str) -> Vec<PersistedPendingPrompt> {
        let cache = self.cache.lock().unwrap();
        let now = now_ms();
        let mut entries: Vec<_> = cache
            .values()
            .filter(|p| p.session_id == session_id && !p.is_expired(self.ttl, now))
            .cloned()
            .collect();
        entries.sort_by_key(|p| p.created_at);
        entries
    }

    /// `spec.md` §4.2 `reapExpired`: purge entries beyond TTL.
    pub fn reap_expired(&self) -> Result<usize> {
        let mut cache = self.cache.lock().unwrap();
        let now = now_ms();
        let before = cache.len();
        cache.retain(|_, p| !p.is_expired(self.ttl, now));
        let removed = before - cache.len();
        if removed > 0 {
            self.flush(&cache)?;
        }
        Ok(removed)
    }

    /// `spec.md` §4.2 `clearFromEvents`: for each `user_prompt` event
    /// carrying a `prompt_id`, remove that pending prompt — it was persisted
    /// server-side.
    pub fn clear_from_events(&self, events: &[RawEvent]) -> Result<()> {
        let mut cache = self.cache.lock().unwrap();
        let mut changed = false;
        for ev in events {
            if ev.kind == "user_prompt" {
                if let Some(prompt_id) = ev.data.get("prompt_id").and_then(|v| v.as_str()) {
                    if cache.remove(prompt_id).is_some() {
                        changed = true;
                    }
                }
            }
        }
        if changed {
            self.flush(&cache)?;
        }
        Ok(())
    }

    pub fn contains(&self, prompt_id: &str) -> bool {
        self.cache.lock().unwrap().contains_key(prompt_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStore;

    fn store() -> PendingPromptStore {
        PendingPromptStore::new(Arc::new(MemoryStore::default()), Duration::from_secs(300))
    }

    #[test]
    fn new_prompt_id_has_expected_shape() {
        let id = new_prompt_id();
        assert!(id.starts_with("prompt_"));
        let parts: Vec<_> = id.splitn(3, '_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 9);
    }

    #[test]
    fn save_then_remove_is_not_present() {
        let s = store();
        s.save("sess-1", "p_1", "hi", vec![], vec![]).unwrap();
        assert!(s.contains("p_1"));
        s.remove("p_1").unwrap();
        assert!(!s.contains("p_1"));
    }

    #[test]
    fn remove_is_idempotent() {
        let s = store();
        s.remove("missing").unwrap();
        s.remove("missing").unwrap();
    }

    #[test]
    fn for_session_filters_by_session_and_orders_oldest_first() {
        let s = store();
        s.save("sess-1", "p_2", "second", vec![], vec![]).unwrap();
        s.save("sess-1", "p_1", "first", vec![], vec![]).unwrap();
        s.save("sess-2", "p_3", "other session", vec![], vec![]).unwrap();
        let list = s.for_session("sess-1");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].prompt_id, "p_2");
        assert_eq!(list[1].prompt_id, "p_1");
    }

    #[test]
    fn expired_entries_excluded_from_for_session() {
        let s = PendingPromptStore::new(Arc::new(MemoryStore::default()), Duration::from_millis(0));
        s.save("sess-1", "p_1", "hi", vec![], vec![]).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(s.for_session("sess-1").is_empty());
    }

    #[test]
    fn reap_expired_purges_and_reports_count() {
        let s = PendingPromptStore::new(Arc::new(MemoryStore::default()), Duration::from_millis(0));
        s.save("sess-1", "p_1", "hi", vec![], vec![]).unwrap();
        s.save("sess-1", "p_2", "hi", vec![], vec![]).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let removed = s.reap_expired().unwrap();
        assert_eq!(removed, 2);
        assert!(!s.contains("p_1"));
    }

    #[test]
    fn clear_from_events_removes_matching_prompt_id() {
        let s = store();
        s.save("sess-1", "p_7", "hi", vec![], vec![]).unwrap();
        let events = vec![RawEvent {
            kind: "user_prompt".into(),
            data: serde_json::json!({"prompt_id": "p_7", "seq": 99}),
            seq: Some(99),
            timestamp: None,
        }];
        s.clear_from_events(&events).unwrap();
        assert!(!s.contains("p_7"));
    }

    #[test]
    fn clear_from_events_ignores_events_without_prompt_id() {
        let s = store();
        s.save("sess-1", "p_7", "hi", vec![], vec![]).unwrap();
        let events = vec![RawEvent {
            kind: "agent_message".into(),
            data: serde_json::json!({"html": "hi", "seq": 5}),
            seq: Some(5),
            timestamp: None,
        }];
        s.clear_from_events(&events).unwrap();
        assert!(s.contains("p_7"));
    }

    #[test]
    fn persists_across_store_instances_sharing_backend() {
        let backend = Arc::new(MemoryStore::default());
        {
            let s = PendingPromptStore::new(backend.clone(), Duration::from_secs(300));
            s.save("sess-1", "p_1", "hi", vec![], vec![]).unwrap();
        }
        let s2 = PendingPromptStore::new(backend, Duration::from_secs(300));
        assert!(s2.contains("p_1"));
    }
}
