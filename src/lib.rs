// SPDX-License-Identifier: Apache-2.0
//! Client-side session-state engine for a multi-tenant chat-style frontend
//! driving long-running agent conversations over WebSocket.
//!
//! [`controller::SessionController`] is the entry point: it owns the
//! per-session and global WebSocket actors, the transcript store, the send
//! pipeline, and the reconciliation engine, and exposes a single façade for
//! an embedding UI to drive.

pub mod backoff;
pub mod config;
pub mod controller;
pub mod error;
pub mod global_ws;
pub mod http;
pub mod message;
pub mod pending;
pub mod persist;
pub mod reconcile;
pub mod send;
pub mod seq;
pub mod session_ws;
pub mod store;
pub mod transport;
pub mod wire;

pub use config::CoreConfig;
pub use controller::{ConnectorFactory, SessionController};
pub use error::{CoreError, Result};
pub use message::{ImageRef, Message, ToolStatus};
pub use store::{SessionInfo, SessionRecord, SessionStatus};
