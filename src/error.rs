// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// The error taxonomy surfaced across the session-state engine (see
/// `SPEC_FULL.md` §7 Error Handling Design).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no active session")]
    NoSession,

    #[error("transport closed")]
    TransportClosed,

    #[error("transport send failed: {0}")]
    TransportSendFailed(String),

    #[error("timed out waiting for a live connection")]
    ConnectionTimeout,

    #[error("delivery unconfirmed — the message may have been sent; check after reconnect")]
    DeliveryUnconfirmed,

    #[error("server rejected the request: {0}")]
    ServerRejected(String),

    #[error("authentication required")]
    AuthenticationRequired,

    #[error("queue is full")]
    QueueFull { message: String },

    #[error("workspace has active conversations: {count}")]
    WorkspaceHasActiveConversations { count: u64, message: String },

    #[error("http request failed: {0}")]
    Http(String),

    #[error("malformed event envelope: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("local persistence error: {0}")]
    Persistence(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
