// SPDX-License-Identifier: Apache-2.0
//! The WebSocket transport seam. `session_ws` and `global_ws` depend only on
//! `Transport`, never on `tokio_tungstenite` directly, so the reconnect,
//! keepalive and reconciliation logic can be driven deterministically in
//! tests without a real network (`SPEC_FULL.md` §B test tooling).

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::{CoreError, Result};

/// One inbound occurrence on a transport.
#[derive(Debug)]
pub enum WsEvent {
    Text(String),
    Closed,
}

#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;
    /// Waits for the next event. Returns `Closed` once and then keeps
    /// returning it (never panics on a drained socket).
    async fn recv(&mut self) -> WsEvent;
    async fn close(&mut self);
}

/// Produces a fresh `Transport` on each (re)connect attempt. Boxed so
/// `session_ws`/`global_ws` can hold one without a generic parameter.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}

pub struct TungsteniteConnector {
    pub url: String,
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let t = TungsteniteTransport::connect(&self.url).await?;
        Ok(Box::new(t))
    }
}

/// Real transport backed by `tokio-tungstenite`.
pub struct TungsteniteTransport {
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    closed: bool,
}

impl TungsteniteTransport {
    pub async fn connect(url: &str) -> Result<Self> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| CoreError::TransportSendFailed(e.to_string()))?;
        Ok(Self { stream, closed: false })
    }
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| CoreError::TransportSendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> WsEvent {
        if self.closed {
            return WsEvent::Closed;
        }
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(t))) => return WsEvent::Text(t),
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Close(_))) | None => {
                    self.closed = true;
                    return WsEvent::Closed;
                }
                Some(Ok(WsMessage::Binary(_))) | Some(Ok(WsMessage::Frame(_))) => continue,
                Some(Err(_)) => {
                    self.closed = true;
                    return WsEvent::Closed;
                }
            }
        }
    }

    async fn close(&mut self) {
        self.closed = true;
        let _ = self.stream.close(None).await;
    }
}

/// An in-process fake transport driven by test code via the two queues it
/// returns from `fake::pair()`. Exists so `session_ws`/`global_ws` can be
/// exercised deterministically (`SPEC_FULL.md` §B).
pub mod fake {
    use super::*;
    use tokio::sync::mpsc;

    pub struct FakeTransport {
        outbox: mpsc::UnboundedSender<String>,
        inbox: mpsc::UnboundedReceiver<WsEvent>,
        closed: bool,
    }

    /// A handle test code uses to inspect what the core sent and to inject
    /// server events.
    pub struct FakeHandle {
        pub sent: mpsc::UnboundedReceiver<String>,
        pub to_core: mpsc::UnboundedSender<WsEvent>,
    }

    pub fn pair() -> (FakeTransport, FakeHandle) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            FakeTransport { outbox: out_tx, inbox: in_rx, closed: false },
            FakeHandle { sent: out_rx, to_core: in_tx },
        )
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send_text(&mut self, text: String) -> Result<()> {
            self.outbox
                .send(text)
                .map_err(|_| CoreError::TransportClosed)
        }

        async fn recv(&mut self) -> WsEvent {
            if self.closed {
                return WsEvent::Closed;
            }
            match self.inbox.recv().await {
                Some(WsEvent::Closed) | None => {
                    self.closed = true;
                    WsEvent::Closed
                }
                Some(ev) => ev,
            }
        }

        async fn close(&mut self) {
            self.closed = true;
        }
    }

    /// A connector that hands out a queue of pre-built transports, one per
    /// connect attempt, then errors once exhausted. Lets tests script
    /// reconnect scenarios (§8 S2/S4).
    pub struct FakeConnector {
        transports: std::sync::Mutex<std::collections::VecDeque<FakeTransport>>,
    }

    impl FakeConnector {
        pub fn new(transports: Vec<FakeTransport>) -> Self {
            Self { transports: std::sync::Mutex::new(transports.into_iter().collect()) }
        }
    }

    #[async_trait]
    impl super::Connector for FakeConnector {
        async fn connect(&self) -> Result<Box<dyn Transport>> {
            let mut q = self.transports.lock().unwrap();
            match q.pop_front() {
                Some(t) => Ok(Box::new(t)),
                None => Err(CoreError::TransportClosed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::*;
    use super::*;

    #[tokio::test]
    async fn fake_transport_roundtrips_text() {
        let (mut transport, mut handle) = pair();
        transport.send_text("hello".into()).await.unwrap();
        assert_eq!(handle.sent.recv().await, Some("hello".to_string()));

        handle.to_core.send(WsEvent::Text("world".into())).unwrap();
        match transport.recv().await {
            WsEvent::Text(t) => assert_eq!(t, "world"),
            _ => panic!(),
        }
    }

    #[tokio::test]
    async fn fake_transport_reports_closed_after_handle_drop() {
        let (mut transport, handle) = pair();
        drop(handle);
        assert!(matches!(transport.recv().await, WsEvent::Closed));
    }
}
