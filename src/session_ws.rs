// SPDX-License-Identifier: Apache-2.0
//! The per-session WebSocket actor (`spec.md` §4.3). One actor per active
//! session, spawned as its own task so session state mutations stay
//! serialized behind a single owner (`spec.md` §9).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use crate::backoff::Backoff;
use crate::config::CoreConfig;
use crate::http::AuthProbe;
use crate::pending::PendingPromptStore;
use crate::transport::{Connector, Transport, WsEvent};
use crate::wire::{ClientMessage, ServerEvent};

/// What the actor reports to its owner (the controller / reconciliation
/// path). Carries enough to drive both the store and the send pipeline.
#[derive(Debug)]
pub enum SessionOutcome {
    Opened,
    Event(ServerEvent),
    /// The socket closed; `will_reconnect` is false only when the actor has
    /// given up (auth rejected, or an explicit shutdown).
    Closed { will_reconnect: bool },
    AuthRequired,
}

pub enum SessionCommand {
    Send(ClientMessage),
    ForceClose,
    Shutdown,
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// A handle to a running session actor. Cheap to clone: the command channel
/// sender and the health/seq state are all `Clone`, so callers that need
/// their own copy (e.g. the event-reconciliation driver) can hold one
/// alongside the copy the owner keeps for sends.
#[derive(Clone)]
pub struct SessionSocketHandle {
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    connected: Arc<AtomicBool>,
    connected_notify: Arc<tokio::sync::Notify>,
    last_seen_seq: Arc<AtomicU64>,
}

impl SessionSocketHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Waits until the socket is connected or `timeout` elapses
    /// (`spec.md` §4.6 step 2, bounded ≤ 5 s).
    pub async fn wait_connected(&self, timeout: std::time::Duration) -> bool {
        if self.is_connected() {
            return true;
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.connected_notify.notified();
            if self.is_connected() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return false;
            }
        }
    }

    pub fn send(&self, msg: ClientMessage) -> Result<(), crate::error::CoreError> {
        self.cmd_tx
            .send(SessionCommand::Send(msg))
            .map_err(|_| crate::error::CoreError::TransportClosed)
    }

    pub fn force_close(&self) {
        let _ = self.cmd_tx.send(SessionCommand::ForceClose);
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown);
    }

    /// The eagerly-updated high-water mark (`spec.md` §4.7); the owner
    /// should call `note_seq` whenever an event with a seq is applied so a
    /// later reconnect's `load_events` starts from the right place.
    pub fn note_seq(&self, seq: u64) {
        let mut cur = self.last_seen_seq.load(Ordering::Relaxed);
        while seq > cur {
            match self.last_seen_seq.compare_exchange_weak(
                cur,
                seq,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn reset_seq(&self) {
        self.last_seen_seq.store(0, Ordering::Relaxed);
    }

    pub fn last_seen_seq(&self) -> u64 {
        self.last_seen_seq.load(Ordering::Relaxed)
    }
}

async fn send(transport: &mut Box<dyn Transport>, msg: &ClientMessage) -> crate::error::Result<()> {
    let text = serde_json::to_string(msg)?;
    transport.send_text(text).await
}

/// Spawns the actor and returns a handle plus the outcome stream.
/// `initial_last_seen_seq` seeds the high-water mark (e.g. restored from
/// durable local state on process start).
pub fn spawn(
    session_id: String,
    connector: Arc<dyn Connector>,
    auth: Arc<dyn AuthProbe>,
    pending_prompts: Arc<PendingPromptStore>,
    config: CoreConfig,
    initial_last_seen_seq: u64,
) -> (SessionSocketHandle, mpsc::UnboundedReceiver<SessionOutcome>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(false));
    let connected_notify = Arc::new(tokio::sync::Notify::new());
    let last_seen_seq = Arc::new(AtomicU64::new(initial_last_seen_seq));

    let handle = SessionSocketHandle {
        cmd_tx,
        connected: connected.clone(),
        connected_notify: connected_notify.clone(),
        last_seen_seq: last_seen_seq.clone(),
    };

    tokio::spawn(run(
        session_id,
        connector,
        auth,
        pending_prompts,
        config,
        cmd_rx,
        out_tx,
        connected,
        connected_notify,
        last_seen_seq,
    ));

    (handle, out_rx)
}

async fn run(
    session_id: String,
    connector: Arc<dyn Connector>,
    auth: Arc<dyn AuthProbe>,
    pending_prompts: Arc<PendingPromptStore>,
    config: CoreConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    out_tx: mpsc::UnboundedSender<SessionOutcome>,
    connected: Arc<AtomicBool>,
    connected_notify: Arc<tokio::sync::Notify>,
    last_seen_seq: Arc<AtomicU64>,
) {
    let mut backoff = Backoff::new(config.reconnect_base_delay, config.reconnect_max_delay);

    loop {
        let mut transport = match connector.connect().await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "session socket connect failed");
                if !sleep_or_shutdown(backoff.next_delay(), &mut cmd_rx).await {
                    return;
                }
                continue;
            }
        };

        connected.store(true, Ordering::Relaxed);
        connected_notify.notify_waiters();
        backoff.reset();
        tracing::debug!(session_id = %session_id, "session socket connected");
        let _ = out_tx.send(SessionOutcome::Opened);

        let after = last_seen_seq.load(Ordering::Relaxed);
        let initial_load = if after > 0 {
            ClientMessage::LoadEvents { limit: None, before_seq: None, after_seq: Some(after) }
        } else {
            ClientMessage::LoadEvents {
                limit: Some(config.initial_events_limit),
                before_seq: None,
                after_seq: None,
            }
        };
        if send(&mut transport, &initial_load).await.is_err() {
            connected.store(false, Ordering::Relaxed);
            if !sleep_or_shutdown(backoff.next_delay(), &mut cmd_rx).await {
                return;
            }
            continue;
        }

        let retry_timer = tokio::time::sleep(config.retry_pending_delay);
        tokio::pin!(retry_timer);
        let mut pending_retry_fired = false;

        let mut keepalive_interval = tokio::time::interval(config.keepalive_interval);
        keepalive_interval.tick().await; // first tick fires immediately; discard
        let mut pending_keepalive = false;
        let mut missed_keepalives = 0u32;

        let mut shutting_down = false;
        'session: loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::Send(msg)) => {
                            if send(&mut transport, &msg).await.is_err() {
                                break 'session;
                            }
                        }
                        Some(SessionCommand::ForceClose) => break 'session,
                        Some(SessionCommand::Shutdown) | None => {
                            shutting_down = true;
                            break 'session;
                        }
                    }
                }
                _ = &mut retry_timer, if !pending_retry_fired => {
                    pending_retry_fired = true;
                    for prompt in pending_prompts.for_session(&session_id) {
                        let retry = ClientMessage::Prompt {
                            message: prompt.message,
                            image_ids: prompt.image_ids,
                            prompt_id: prompt.prompt_id,
                        };
                        let _ = send(&mut transport, &retry).await;
                    }
                }
                _ = keepalive_interval.tick() => {
                    if pending_keepalive {
                        missed_keepalives += 1;
                        if missed_keepalives >= config.keepalive_miss_limit {
                            tracing::warn!(session_id = %session_id, "keepalive missed, force-closing zombie socket");
                            break 'session;
                        }
                    }
                    let ka = ClientMessage::Keepalive { client_time: now_ms() };
                    if send(&mut transport, &ka).await.is_err() {
                        break 'session;
                    }
                    pending_keepalive = true;
                }
                ev = transport.recv() => {
                    match ev {
                        WsEvent::Text(text) => match ServerEvent::parse(&text) {
                            Ok(ServerEvent::KeepaliveAck) => {
                                pending_keepalive = false;
                                missed_keepalives = 0;
                            }
                            Ok(parsed) => {
                                let _ = out_tx.send(SessionOutcome::Event(parsed));
                            }
                            Err(e) => {
                                tracing::warn!(session_id = %session_id, error = %e, "malformed event envelope, dropping");
                            }
                        },
                        WsEvent::Closed => break 'session,
                    }
                }
            }
        }

        transport.close().await;
        connected.store(false, Ordering::Relaxed);

        if shutting_down {
            let _ = out_tx.send(SessionOutcome::Closed { will_reconnect: false });
            return;
        }

        match probe_auth(&auth, &config).await {
            AuthOutcome::Authenticated => {
                let _ = out_tx.send(SessionOutcome::Closed { will_reconnect: true });
                if !sleep_or_shutdown(backoff.next_delay(), &mut cmd_rx).await {
                    return;
                }
            }
            AuthOutcome::Unauthenticated => {
                let _ = out_tx.send(SessionOutcome::AuthRequired);
                return;
            }
            AuthOutcome::TransientError => {
                let _ = out_tx.send(SessionOutcome::Closed { will_reconnect: true });
                if !sleep_or_shutdown(backoff.next_delay(), &mut cmd_rx).await {
                    return;
                }
            }
        }
    }
}

enum AuthOutcome {
    Authenticated,
    Unauthenticated,
    TransientError,
}

async fn probe_auth(auth: &Arc<dyn AuthProbe>, config: &CoreConfig) -> AuthOutcome {
    for attempt in 0..config.wake_auth_retries {
        match auth.probe().await {
            Ok(true) => return AuthOutcome::Authenticated,
            Ok(false) => return AuthOutcome::Unauthenticated,
            Err(_) if attempt + 1 < config.wake_auth_retries => {
                tokio::time::sleep(config.wake_auth_retry_backoff).await;
            }
            Err(_) => return AuthOutcome::TransientError,
        }
    }
    AuthOutcome::TransientError
}

/// Sleeps for `delay`, but returns early (with `false`) if a `Shutdown`
/// command arrives first so a held handle can stop a backing-off actor
/// without waiting out the full delay.
async fn sleep_or_shutdown(
    delay: std::time::Duration,
    cmd_rx: &mut mpsc::UnboundedReceiver<SessionCommand>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        cmd = cmd_rx.recv() => !matches!(cmd, Some(SessionCommand::Shutdown) | None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::{pair, FakeConnector};
    use std::time::Duration;

    struct AlwaysAuthed;

    #[async_trait::async_trait]
    impl AuthProbe for AlwaysAuthed {
        async fn probe(&self) -> crate::error::Result<bool> {
            Ok(true)
        }
    }

    fn test_config() -> CoreConfig {
        CoreConfig {
            keepalive_interval: Duration::from_millis(50),
            keepalive_miss_limit: 2,
            retry_pending_delay: Duration::from_millis(10),
            reconnect_base_delay: Duration::from_millis(5),
            reconnect_max_delay: Duration::from_millis(20),
            ..CoreConfig::default()
        }
    }

    #[tokio::test]
    async fn sends_load_events_with_limit_on_fresh_connect() {
        let (transport, mut fake) = pair();
        let connector = Arc::new(FakeConnector::new(vec![transport]));
        let pending = Arc::new(PendingPromptStore::new(
            Arc::new(crate::persist::MemoryStore::default()),
            Duration::from_secs(300),
        ));
        let (_handle, mut outcomes) =
            spawn("s1".into(), connector, Arc::new(AlwaysAuthed), pending, test_config(), 0);

        assert!(matches!(outcomes.recv().await, Some(SessionOutcome::Opened)));
        let sent = fake.sent.recv().await.unwrap();
        assert!(sent.contains("\"load_events\""));
        assert!(sent.contains("\"limit\":50"));
    }

    #[tokio::test]
    async fn sends_load_events_after_seq_when_last_seen_seq_nonzero() {
        let (transport, mut fake) = pair();
        let connector = Arc::new(FakeConnector::new(vec![transport]));
        let pending = Arc::new(PendingPromptStore::new(
            Arc::new(crate::persist::MemoryStore::default()),
            Duration::from_secs(300),
        ));
        let (_handle, mut outcomes) =
            spawn("s1".into(), connector, Arc::new(AlwaysAuthed), pending, test_config(), 42);

        assert!(matches!(outcomes.recv().await, Some(SessionOutcome::Opened)));
        let sent = fake.sent.recv().await.unwrap();
        assert!(sent.contains("\"after_seq\":42"));
    }

    #[tokio::test]
    async fn forwards_server_events_and_swallows_keepalive_ack() {
        let (transport, mut fake) = pair();
        let connector = Arc::new(FakeConnector::new(vec![transport]));
        let pending = Arc::new(PendingPromptStore::new(
            Arc::new(crate::persist::MemoryStore::default()),
            Duration::from_secs(300),
        ));
        let (_handle, mut outcomes) =
            spawn("s1".into(), connector, Arc::new(AlwaysAuthed), pending, test_config(), 0);

        assert!(matches!(outcomes.recv().await, Some(SessionOutcome::Opened)));
        let _ = fake.sent.recv().await; // initial load_events

        fake.to_core
            .send(crate::transport::WsEvent::Text(r#"{"type":"keepalive_ack","data":{}}"#.into()))
            .unwrap();
        fake.to_core
            .send(crate::transport::WsEvent::Text(
                r#"{"type":"agent_message","data":{"html":"hi","seq":1}}"#.into(),
            ))
            .unwrap();

        match outcomes.recv().await {
            Some(SessionOutcome::Event(ServerEvent::AgentMessage(d))) => assert_eq!(d.html, "hi"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn shutdown_command_stops_actor_without_reconnect() {
        let (transport, _fake) = pair();
        let connector = Arc::new(FakeConnector::new(vec![transport]));
        let pending = Arc::new(PendingPromptStore::new(
            Arc::new(crate::persist::MemoryStore::default()),
            Duration::from_secs(300),
        ));
        let (handle, mut outcomes) =
            spawn("s1".into(), connector, Arc::new(AlwaysAuthed), pending, test_config(), 0);

        assert!(matches!(outcomes.recv().await, Some(SessionOutcome::Opened)));
        handle.shutdown();
        assert!(matches!(
            outcomes.recv().await,
            Some(SessionOutcome::Closed { will_reconnect: false })
        ));
        assert!(outcomes.recv().await.is_none());
    }
}
