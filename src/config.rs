// SPDX-License-Identifier: Apache-2.0
//! Typed configuration for the session-state engine.
//!
//! Mirrors the teacher's config-struct shape (a plain `Default`-able struct
//! plus a free `load()` function) rather than scattering magic numbers through
//! the modules that use them.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// API prefix for mounting under a reverse proxy, e.g. `/app`.
    pub api_prefix: String,
    /// Origin to derive the `ws://`/`wss://` URL from. `None` uses the page
    /// origin (left to the embedding environment to supply).
    pub origin: Option<String>,

    /// §3 `MAX_MESSAGES`.
    pub max_messages: usize,
    /// §4.3 `INITIAL_EVENTS_LIMIT`.
    pub initial_events_limit: u32,
    /// §4.3 keepalive period.
    pub keepalive_interval: Duration,
    /// §4.3: force-close after this many consecutive missed keepalives.
    pub keepalive_miss_limit: u32,
    /// §4.3: delay after open before retrying pending prompts.
    pub retry_pending_delay: Duration,

    /// §4.6 send timeout, desktop.
    pub send_timeout_desktop: Duration,
    /// §4.6 send timeout, mobile.
    pub send_timeout_mobile: Duration,
    /// §4.6 connection-wait bound before `connection-timeout`.
    pub connect_wait_timeout: Duration,

    /// §4.2 pending-prompt TTL.
    pub pending_prompt_ttl: Duration,

    /// §4.3/§4.4 backoff bounds.
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,

    /// §4.7 mobile-wake staleness threshold.
    pub stale_wake_threshold: Duration,
    /// §4.7 auth-retry count/backoff on wake.
    pub wake_auth_retries: u32,
    pub wake_auth_retry_backoff: Duration,
    /// §4.7 delay before force-reconnecting on wake.
    pub wake_reconnect_delay: Duration,

    /// §4.1 `SeqTracker::recentSeqs` bound (Open Question, resolved in
    /// `SPEC_FULL.md` §D.3).
    pub recent_seq_cap: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            api_prefix: String::new(),
            origin: None,
            max_messages: 100,
            initial_events_limit: 50,
            keepalive_interval: Duration::from_secs(25),
            keepalive_miss_limit: 2,
            retry_pending_delay: Duration::from_millis(500),
            send_timeout_desktop: Duration::from_secs(15),
            send_timeout_mobile: Duration::from_secs(30),
            connect_wait_timeout: Duration::from_secs(5),
            pending_prompt_ttl: Duration::from_secs(5 * 60),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            stale_wake_threshold: Duration::from_secs(60 * 60),
            wake_auth_retries: 3,
            wake_auth_retry_backoff: Duration::from_millis(500),
            wake_reconnect_delay: Duration::from_millis(300),
            recent_seq_cap: 1024,
        }
    }
}

/// Load configuration, applying environment overrides for the API prefix and
/// origin. There is no user-editable config file in this domain — the
/// embedding frontend injects these two values at startup.
pub fn load(api_prefix: impl Into<String>, origin: Option<String>) -> CoreConfig {
    CoreConfig {
        api_prefix: api_prefix.into(),
        origin,
        ..CoreConfig::default()
    }
}
