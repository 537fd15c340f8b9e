// SPDX-License-Identifier: Apache-2.0
//! The global events WebSocket actor (`spec.md` §4.4): one connection for
//! session-lifecycle broadcasts, sharing the session socket's reconnect
//! policy but without keepalive or pending-prompt retry (§4.4 "identical
//! lifecycle to §4.3 but for session-lifecycle events").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::backoff::Backoff;
use crate::config::CoreConfig;
use crate::http::AuthProbe;
use crate::transport::{Connector, WsEvent};
use crate::wire::GlobalEvent;

#[derive(Debug)]
pub enum GlobalOutcome {
    /// First successful open since the actor started.
    OpenedFresh,
    /// A later open after at least one disconnect (`wasConnected`, §4.4) —
    /// the owner should refresh the stored-session list without switching.
    Reopened,
    Event(GlobalEvent),
    Closed { will_reconnect: bool },
    AuthRequired,
}

pub enum GlobalCommand {
    Shutdown,
}

pub struct GlobalSocketHandle {
    cmd_tx: mpsc::UnboundedSender<GlobalCommand>,
    connected: Arc<AtomicBool>,
}

impl GlobalSocketHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(GlobalCommand::Shutdown);
    }
}

pub fn spawn(
    connector: Arc<dyn Connector>,
    auth: Arc<dyn AuthProbe>,
    config: CoreConfig,
) -> (GlobalSocketHandle, mpsc::UnboundedReceiver<GlobalOutcome>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(false));
    let handle = GlobalSocketHandle { cmd_tx, connected: connected.clone() };

    tokio::spawn(run(connector, auth, config, cmd_rx, out_tx, connected));

    (handle, out_rx)
}

async fn run(
    connector: Arc<dyn Connector>,
    auth: Arc<dyn AuthProbe>,
    config: CoreConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<GlobalCommand>,
    out_tx: mpsc::UnboundedSender<GlobalOutcome>,
    connected: Arc<AtomicBool>,
) {
    let mut backoff = Backoff::new(config.reconnect_base_delay, config.reconnect_max_delay);
    let mut was_connected = false;

    loop {
        let mut transport = match connector.connect().await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "global socket connect failed");
                if !sleep_or_shutdown(backoff.next_delay(), &mut cmd_rx).await {
                    return;
                }
                continue;
            }
        };

        connected.store(true, Ordering::Relaxed);
        backoff.reset();
        let outcome = if was_connected { GlobalOutcome::Reopened } else { GlobalOutcome::OpenedFresh };
        was_connected = true;
        let _ = out_tx.send(outcome);

        let mut shutting_down = false;
        'session: loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(GlobalCommand::Shutdown) | None => {
                            shutting_down = true;
                            break 'session;
                        }
                    }
                }
                ev = transport.recv() => {
                    match ev {
                        WsEvent::Text(text) => match GlobalEvent::parse(&text) {
                            Ok(parsed) => { let _ = out_tx.send(GlobalOutcome::Event(parsed)); }
                            Err(e) => tracing::warn!(error = %e, "malformed global event, dropping"),
                        },
                        WsEvent::Closed => break 'session,
                    }
                }
            }
        }

        transport.close().await;
        connected.store(false, Ordering::Relaxed);

        if shutting_down {
            let _ = out_tx.send(GlobalOutcome::Closed { will_reconnect: false });
            return;
        }

        match probe_auth(&auth, &config).await {
            Ok(true) => {
                let _ = out_tx.send(GlobalOutcome::Closed { will_reconnect: true });
                if !sleep_or_shutdown(backoff.next_delay(), &mut cmd_rx).await {
                    return;
                }
            }
            Ok(false) => {
                let _ = out_tx.send(GlobalOutcome::AuthRequired);
                return;
            }
            Err(_) => {
                let _ = out_tx.send(GlobalOutcome::Closed { will_reconnect: true });
                if !sleep_or_shutdown(backoff.next_delay(), &mut cmd_rx).await {
                    return;
                }
            }
        }
    }
}

async fn probe_auth(auth: &Arc<dyn AuthProbe>, config: &CoreConfig) -> crate::error::Result<bool> {
    let mut last_err = None;
    for attempt in 0..config.wake_auth_retries {
        match auth.probe().await {
            Ok(ok) => return Ok(ok),
            Err(e) if attempt + 1 < config.wake_auth_retries => {
                last_err = Some(e);
                tokio::time::sleep(config.wake_auth_retry_backoff).await;
            }
            Err(e) => {
                last_err = Some(e);
                break;
            }
        }
    }
    Err(last_err.unwrap_or(crate::error::CoreError::TransportClosed))
}

async fn sleep_or_shutdown(
    delay: std::time::Duration,
    cmd_rx: &mut mpsc::UnboundedReceiver<GlobalCommand>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        cmd = cmd_rx.recv() => !matches!(cmd, Some(GlobalCommand::Shutdown) | None),
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
            reconnect_base_delay: Duration::from_millis(5),
            reconnect_max_delay: Duration::from_millis(20),
            ..CoreConfig::default()
        }
    }

    #[tokio::test]
    async fn first_open_reports_opened_fresh() {
        let (transport, _fake) = pair();
        let connector = Arc::new(FakeConnector::new(vec![transport]));
        let (_handle, mut outcomes) = spawn(connector, Arc::new(AlwaysAuthed), test_config());
        assert!(matches!(outcomes.recv().await, Some(GlobalOutcome::OpenedFresh)));
    }

    #[tokio::test]
    async fn reconnect_after_drop_reports_reopened() {
        let (t1, fake1) = pair();
        let (t2, _fake2) = pair();
        let connector = Arc::new(FakeConnector::new(vec![t1, t2]));
        let (_handle, mut outcomes) = spawn(connector, Arc::new(AlwaysAuthed), test_config());
        assert!(matches!(outcomes.recv().await, Some(GlobalOutcome::OpenedFresh)));
        drop(fake1);
        assert!(matches!(outcomes.recv().await, Some(GlobalOutcome::Closed { will_reconnect: true })));
        assert!(matches!(outcomes.recv().await, Some(GlobalOutcome::Reopened)));
    }

    #[tokio::test]
    async fn forwards_session_created_event() {
        let (transport, fake) = pair();
        let connector = Arc::new(FakeConnector::new(vec![transport]));
        let (_handle, mut outcomes) = spawn(connector, Arc::new(AlwaysAuthed), test_config());
        assert!(matches!(outcomes.recv().await, Some(GlobalOutcome::OpenedFresh)));

        fake.to_core
            .send(crate::transport::WsEvent::Text(
                r#"{"type":"session_created","data":{"id":"s1","name":"n","acp_server":"a","working_dir":"/tmp","status":"active","pinned":false,"created_at":0}}"#.into(),
            ))
            .unwrap();

        match outcomes.recv().await {
            Some(GlobalOutcome::Event(GlobalEvent::SessionCreated(s))) => assert_eq!(s.id, "s1"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
