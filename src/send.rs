// SPDX-License-Identifier: Apache-2.0
//! The send pipeline (`spec.md` §4.6): request/ACK with timeout,
//! reconnect-before-send, mobile-aware timeout, pending-queue retry.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::message::{ImageRef, Message};
use crate::pending::{new_prompt_id, PendingPromptStore};
use crate::session_ws::SessionSocketHandle;
use crate::store::SessionStateStore;
use crate::wire::ClientMessage;

#[derive(Debug, Clone)]
pub enum SendOutcome {
    Delivered,
    Rejected(String),
}

struct Entry {
    session_id: String,
    tx: oneshot::Sender<SendOutcome>,
}

/// Promise-style registry mapping `promptId` to its one-shot completer
/// (`spec.md` §9 "Pending-send promise registry": single-producer/
/// single-consumer, always completed exactly once, dropped as soon as
/// completed).
#[derive(Default)]
pub struct PendingSendRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl PendingSendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, session_id: &str, prompt_id: &str) -> oneshot::Receiver<SendOutcome> {
        let (tx, rx) = oneshot::channel();
        self.entries
            .lock()
            .unwrap()
            .insert(prompt_id.to_string(), Entry { session_id: session_id.to_string(), tx });
        rx
    }

    /// `prompt_received` / `user_prompt` resolution (§4.6 step 9). Returns
    /// `true` if a pending send was found (idempotent: a second resolve of
    /// an already-removed id is a no-op).
    pub fn resolve(&self, prompt_id: &str) -> bool {
        if let Some(entry) = self.entries.lock().unwrap().remove(prompt_id) {
            let _ = entry.tx.send(SendOutcome::Delivered);
            true
        } else {
            false
        }
    }

    pub fn reject(&self, prompt_id: &str, message: String) -> bool {
        if let Some(entry) = self.entries.lock().unwrap().remove(prompt_id) {
            let _ = entry.tx.send(SendOutcome::Rejected(message));
            true
        } else {
            false
        }
    }

    /// Any streaming event implicitly proves delivery for every pending
    /// send on that session (§4.6 step 9, compensates for dropped ACKs).
    pub fn resolve_all_for_session(&self, session_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        let ids: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.session_id == session_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Some(entry) = entries.remove(&id) {
                let _ = entry.tx.send(SendOutcome::Delivered);
            }
        }
    }

    fn cancel(&self, prompt_id: &str) {
        self.entries.lock().unwrap().remove(prompt_id);
    }
}

pub struct SendOptions {
    pub is_mobile: bool,
    /// Skip the optimistic local echo — set when retrying a prompt already
    /// present in the transcript (§4.6 step 4).
    pub skip_message_add: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self { is_mobile: false, skip_message_add: false }
    }
}

pub struct SendResult {
    pub prompt_id: String,
}

/// `spec.md` §4.6 `sendPrompt`.
pub async fn send_prompt(
    session_id: &str,
    message: &str,
    images: Vec<ImageRef>,
    options: SendOptions,
    socket: &SessionSocketHandle,
    store: &Mutex<SessionStateStore>,
    pending_prompts: &PendingPromptStore,
    registry: &PendingSendRegistry,
    config: &CoreConfig,
    now_ms: i64,
) -> Result<SendResult> {
    if !socket.is_connected() {
        socket.force_close();
        let connect_wait = config.connect_wait_timeout;
        if !socket.wait_connected(connect_wait).await {
            return Err(CoreError::ConnectionTimeout);
        }
    }

    let image_ids: Vec<String> = images.iter().map(|i| i.id.clone()).collect();

    {
        let mut store = store.lock().unwrap();
        store.set_action_buttons(session_id, vec![]);
        if !options.skip_message_add {
            store.append_message(
                session_id,
                Message::User {
                    text: message.to_string(),
                    images,
                    timestamp: now_ms,
                    seq: None,
                    from_other_client: false,
                },
                config.max_messages,
            );
        }
    }

    let prompt_id = new_prompt_id();
    pending_prompts.save(session_id, &prompt_id, message, image_ids.clone(), vec![])?;

    let rx = registry.register(session_id, &prompt_id);

    let client_msg = ClientMessage::Prompt {
        message: message.to_string(),
        image_ids,
        prompt_id: prompt_id.clone(),
    };
    if let Err(e) = socket.send(client_msg) {
        registry.cancel(&prompt_id);
        let _ = pending_prompts.remove(&prompt_id);
        return Err(CoreError::TransportSendFailed(e.to_string()));
    }

    let timeout = if options.is_mobile { config.send_timeout_mobile } else { config.send_timeout_desktop };

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(SendOutcome::Delivered)) => {
            let _ = pending_prompts.remove(&prompt_id);
            Ok(SendResult { prompt_id })
        }
        Ok(Ok(SendOutcome::Rejected(msg))) => {
            let _ = pending_prompts.remove(&prompt_id);
            Err(CoreError::ServerRejected(msg))
        }
        Ok(Err(_canceled)) => {
            // sender dropped without resolving: treat like an unconfirmed
            // delivery, the persisted prompt survives for replay/TTL.
            Err(CoreError::DeliveryUnconfirmed)
        }
        Err(_elapsed) => {
            registry.cancel(&prompt_id);
            socket.force_close();
            Err(CoreError::DeliveryUnconfirmed)
        }
    }
}

pub fn cancel_prompt(socket: &SessionSocketHandle) -> Result<()> {
    socket.send(ClientMessage::Cancel).map_err(|e| CoreError::TransportSendFailed(e.to_string()))
}

pub fn force_reset(socket: &SessionSocketHandle) -> Result<()> {
    socket.send(ClientMessage::ForceReset).map_err(|e| CoreError::TransportSendFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_is_idempotent_second_call_is_noop() {
        let registry = PendingSendRegistry::new();
        let _rx = registry.register("s1", "p1");
        assert!(registry.resolve("p1"));
        assert!(!registry.resolve("p1"));
    }

    #[tokio::test]
    async fn resolve_completes_the_registered_receiver() {
        let registry = PendingSendRegistry::new();
        let rx = registry.register("s1", "p1");
        registry.resolve("p1");
        assert!(matches!(rx.await.unwrap(), SendOutcome::Delivered));
    }

    #[tokio::test]
    async fn reject_delivers_server_message() {
        let registry = PendingSendRegistry::new();
        let rx = registry.register("s1", "p1");
        registry.reject("p1", "bad things".into());
        match rx.await.unwrap() {
            SendOutcome::Rejected(msg) => assert_eq!(msg, "bad things"),
            _ => panic!(),
        }
    }

    #[tokio::test]
    async fn resolve_all_for_session_only_touches_that_session() {
        let registry = PendingSendRegistry::new();
        let rx1 = registry.register("s1", "p1");
        let rx2 = registry.register("s2", "p2");
        registry.resolve_all_for_session("s1");
        assert!(matches!(rx1.await.unwrap(), SendOutcome::Delivered));
        drop(rx2); // s2 left untouched; dropping here just releases the receiver
    }
}
