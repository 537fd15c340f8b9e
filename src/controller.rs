// SPDX-License-Identifier: Apache-2.0
//! The external controller API (`spec.md` §4.8): the single façade an
//! embedding UI drives. Owns every per-session actor, the global events
//! actor, and the shared store; every other module in this crate is wired
//! together here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::global_ws::{self, GlobalOutcome, GlobalSocketHandle};
use crate::http::{
    AuthProbe, MoveDirection, NewSessionRequest, QueueAddOutcome, QueueAddRequest, SessionHttpClient,
    SessionPatch, Workspace,
};
use crate::message::{ImageRef, Message};
use crate::pending::PendingPromptStore;
use crate::persist::{LocalStore, LocalStoreExt, KEY_LAST_ACTIVE_SESSION};
use crate::reconcile::{self, MobileWakeOutcome};
use crate::send::{self, PendingSendRegistry, SendOptions, SendResult};
use crate::session_ws::{self, SessionOutcome, SessionSocketHandle};
use crate::store::{QueueItem, SessionInfo, SessionRecord, SessionStateStore, SessionStatus};
use crate::transport::Connector;
use crate::wire::GlobalEvent;

/// Builds the transport-level `Connector` for each socket the controller
/// owns. Separated from `SessionController` so the embedding app supplies
/// the actual `ws://`/`wss://` URL construction (origin + API prefix are
/// environment-specific, §6 "Environment & configuration").
pub trait ConnectorFactory: Send + Sync {
    fn session_connector(&self, session_id: &str) -> Arc<dyn Connector>;
    fn global_connector(&self) -> Arc<dyn Connector>;
}

struct SessionHandles {
    socket: SessionSocketHandle,
    driver: JoinHandle<()>,
}

/// The external controller API façade (`spec.md` §4.8).
pub struct SessionController {
    store: Arc<Mutex<SessionStateStore>>,
    registry: Arc<PendingSendRegistry>,
    pending_prompts: Arc<PendingPromptStore>,
    local: Arc<dyn LocalStore>,
    http: Arc<SessionHttpClient>,
    auth: Arc<dyn AuthProbe>,
    connectors: Arc<dyn ConnectorFactory>,
    config: CoreConfig,

    active_session: Arc<Mutex<Option<String>>>,
    sessions: Mutex<HashMap<String, SessionHandles>>,
    global: Mutex<Option<(GlobalSocketHandle, JoinHandle<()>)>>,
    workspaces: Mutex<Vec<Workspace>>,

    changed: Arc<tokio::sync::Notify>,
    background_completion: Arc<Mutex<Option<String>>>,
    auth_required: Arc<AtomicBool>,
}

impl SessionController {
    pub fn new(
        local: Arc<dyn LocalStore>,
        http: Arc<SessionHttpClient>,
        auth: Arc<dyn AuthProbe>,
        connectors: Arc<dyn ConnectorFactory>,
        config: CoreConfig,
    ) -> Arc<Self> {
        let pending_prompts = Arc::new(PendingPromptStore::new(local.clone(), config.pending_prompt_ttl));
        let active_session = local.load::<String>(KEY_LAST_ACTIVE_SESSION).ok().flatten();

        let this = Arc::new(Self {
            store: Arc::new(Mutex::new(SessionStateStore::new())),
            registry: Arc::new(PendingSendRegistry::new()),
            pending_prompts,
            local,
            http,
            auth,
            connectors,
            config,
            active_session: Arc::new(Mutex::new(active_session)),
            sessions: Mutex::new(HashMap::new()),
            global: Mutex::new(None),
            workspaces: Mutex::new(Vec::new()),
            changed: Arc::new(tokio::sync::Notify::new()),
            background_completion: Arc::new(Mutex::new(None)),
            auth_required: Arc::new(AtomicBool::new(false)),
        });
        this.clone().spawn_global();
        this
    }

    /// Fires whenever the store, queue, workspaces, or connection state
    /// changes (`spec.md` §4.8 "mutations on the store notify subscribers").
    pub fn subscribe(&self) -> Arc<tokio::sync::Notify> {
        self.changed.clone()
    }

    fn notify_changed(&self) {
        self.changed.notify_waiters();
    }

    // ---- read side ---------------------------------------------------

    pub fn active_session_id(&self) -> Option<String> {
        self.active_session.lock().unwrap().clone()
    }

    pub fn stored_session_ids(&self) -> Vec<String> {
        self.store.lock().unwrap().ids().cloned().collect()
    }

    pub fn messages(&self, session_id: &str) -> Vec<Message> {
        self.store.lock().unwrap().get(session_id).map(|r| r.messages.clone()).unwrap_or_default()
    }

    pub fn is_streaming(&self, session_id: &str) -> bool {
        self.store.lock().unwrap().get(session_id).map(|r| r.is_streaming).unwrap_or(false)
    }

    pub fn has_more_messages(&self, session_id: &str) -> bool {
        self.store.lock().unwrap().get(session_id).map(|r| r.has_more_messages).unwrap_or(false)
    }

    pub fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        self.store.lock().unwrap().get(session_id).map(|r| r.info.clone())
    }

    pub fn queue_items(&self, session_id: &str) -> Vec<QueueItem> {
        self.store.lock().unwrap().get(session_id).map(|r| r.queue.clone()).unwrap_or_default()
    }

    pub fn queue_length(&self, session_id: &str) -> u32 {
        self.store.lock().unwrap().get(session_id).map(|r| r.queue_length).unwrap_or(0)
    }

    pub fn action_buttons(&self, session_id: &str) -> Vec<crate::store::ActionButton> {
        self.store.lock().unwrap().get(session_id).map(|r| r.action_buttons.clone()).unwrap_or_default()
    }

    pub fn is_connected(&self, session_id: &str) -> bool {
        self.sessions.lock().unwrap().get(session_id).map(|h| h.socket.is_connected()).unwrap_or(false)
    }

    pub fn workspaces(&self) -> Vec<Workspace> {
        self.workspaces.lock().unwrap().clone()
    }

    pub fn auth_required(&self) -> bool {
        self.auth_required.load(Ordering::Relaxed)
    }

    /// Consumes the pending background-completion notification, if any
    /// (`spec.md` §4.8 "single background-completion event surfaced when a
    /// non-active session finishes streaming").
    pub fn clear_background_completion(&self) -> Option<String> {
        self.background_completion.lock().unwrap().take()
    }

    // ---- session lifecycle --------------------------------------------

    fn ensure_socket(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(session_id) {
            return;
        }
        let initial_seq = self
            .local
            .load::<u64>(&format!("{}{session_id}", crate::persist::KEY_LAST_SEEN_SEQ_PREFIX))
            .ok()
            .flatten()
            .unwrap_or(0);
        let connector = self.connectors.session_connector(session_id);
        let (socket, mut outcomes) = session_ws::spawn(
            session_id.to_string(),
            connector,
            self.auth.clone(),
            self.pending_prompts.clone(),
            self.config.clone(),
            initial_seq,
        );

        let store = self.store.clone();
        let registry = self.registry.clone();
        let pending_prompts = self.pending_prompts.clone();
        let config = self.config.clone();
        let changed = self.changed.clone();
        let auth_required = self.auth_required.clone();
        let sid = session_id.to_string();
        let active_session = self.active_session.clone();
        let background_completion = self.background_completion.clone();
        let socket_for_driver = socket.clone();
        let local = self.local.clone();

        let driver = tokio::spawn(async move {
            while let Some(outcome) = outcomes.recv().await {
                match outcome {
                    SessionOutcome::Opened => {}
                    SessionOutcome::Event(ev) => {
                        let is_complete = matches!(ev, crate::wire::ServerEvent::PromptComplete(_));
                        let seq_before = socket_for_driver.last_seen_seq();
                        reconcile::apply_live_event(
                            &store,
                            &registry,
                            &socket_for_driver,
                            &sid,
                            &config,
                            &pending_prompts,
                            ev,
                        );
                        let seq_after = socket_for_driver.last_seen_seq();
                        if seq_after != seq_before {
                            let _ = local
                                .save(&format!("{}{sid}", crate::persist::KEY_LAST_SEEN_SEQ_PREFIX), &seq_after);
                        }
                        if is_complete {
                            let active = active_session.lock().unwrap().clone();
                            if active.as_deref() != Some(sid.as_str()) {
                                *background_completion.lock().unwrap() = Some(sid.clone());
                            }
                        }
                        changed.notify_waiters();
                    }
                    SessionOutcome::Closed { .. } => {
                        changed.notify_waiters();
                    }
                    SessionOutcome::AuthRequired => {
                        auth_required.store(true, Ordering::Relaxed);
                        changed.notify_waiters();
                    }
                }
            }
        });

        sessions.insert(session_id.to_string(), SessionHandles { socket, driver });
    }

    pub async fn new_session(&self, name: &str, working_dir: &str, acp_server: &str) -> Result<String> {
        let resp = self
            .http
            .create_session(&NewSessionRequest {
                name: name.to_string(),
                working_dir: working_dir.to_string(),
                acp_server: acp_server.to_string(),
            })
            .await?;

        let mut store = self.store.lock().unwrap();
        store.insert(SessionRecord::new(
            resp.session_id.clone(),
            SessionInfo {
                name: resp.name,
                acp_server: resp.acp_server,
                working_dir: resp.working_dir,
                created_at: 0,
                status: SessionStatus::Active,
                runner_type: None,
                runner_restricted: false,
            },
        ));
        drop(store);

        self.ensure_socket(&resp.session_id);
        self.switch_session(&resp.session_id).await?;
        Ok(resp.session_id)
    }

    /// `spec.md` §4.8 `switchSession`: awaits session-metadata fetch, ensures
    /// the socket exists, and marks the session active.
    pub async fn switch_session(&self, session_id: &str) -> Result<()> {
        let meta = self.http.get_session(session_id).await?;
        {
            let mut store = self.store.lock().unwrap();
            if store.get(session_id).is_none() {
                store.insert(SessionRecord::new(
                    session_id,
                    SessionInfo {
                        name: meta.name.clone(),
                        acp_server: meta.acp_server.clone(),
                        working_dir: meta.working_dir.clone(),
                        created_at: meta.created_at,
                        status: SessionStatus::Active,
                        runner_type: meta.runner_type.clone(),
                        runner_restricted: false,
                    },
                ));
            } else {
                store.set_info(session_id, |info| {
                    info.name = meta.name;
                    info.acp_server = meta.acp_server;
                    info.working_dir = meta.working_dir;
                    info.runner_type = meta.runner_type;
                });
            }
        }
        self.ensure_socket(session_id);
        *self.active_session.lock().unwrap() = Some(session_id.to_string());
        let _ = self.local.save(KEY_LAST_ACTIVE_SESSION, &session_id.to_string());
        self.notify_changed();
        Ok(())
    }

    /// Ensures a session's store record and socket exist without switching
    /// the active session (e.g. warming a stored-session entry).
    pub fn load_session(&self, session_id: &str, info: SessionInfo) {
        {
            let mut store = self.store.lock().unwrap();
            if store.get(session_id).is_none() {
                store.insert(SessionRecord::new(session_id, info));
            }
        }
        self.ensure_socket(session_id);
    }

    /// `spec.md` §4.5/§4.7 "load earlier": requests the page preceding
    /// `firstLoadedSeq`.
    pub fn load_more_messages(&self, session_id: &str) -> Result<()> {
        let first = self.store.lock().unwrap().get(session_id).and_then(|r| r.first_loaded_seq);
        let sessions = self.sessions.lock().unwrap();
        let handle = sessions.get(session_id).ok_or(CoreError::NoSession)?;
        handle
            .socket
            .send(crate::wire::ClientMessage::LoadEvents {
                limit: Some(self.config.initial_events_limit),
                before_seq: first,
                after_seq: None,
            })
            .map_err(|e| CoreError::TransportSendFailed(e.to_string()))
    }

    pub async fn rename_session(&self, session_id: &str, name: &str) -> Result<()> {
        self.http
            .patch_session(session_id, &SessionPatch { name: Some(name.to_string()), pinned: None })
            .await?;
        self.store.lock().unwrap().set_info(session_id, |info| info.name = name.to_string());
        self.notify_changed();
        Ok(())
    }

    pub async fn pin_session(&self, session_id: &str, pinned: bool) -> Result<()> {
        self.http
            .patch_session(session_id, &SessionPatch { name: None, pinned: Some(pinned) })
            .await?;
        self.notify_changed();
        Ok(())
    }

    pub async fn remove_session(&self, session_id: &str) -> Result<()> {
        self.http.delete_session(session_id).await?;
        if let Some(handle) = self.sessions.lock().unwrap().remove(session_id) {
            handle.socket.shutdown();
            handle.driver.abort();
        }
        self.store.lock().unwrap().remove(session_id);
        let mut active = self.active_session.lock().unwrap();
        if active.as_deref() == Some(session_id) {
            *active = None;
        }
        self.notify_changed();
        Ok(())
    }

    // ---- send pipeline --------------------------------------------------

    pub async fn send_prompt(
        &self,
        session_id: &str,
        message: &str,
        images: Vec<ImageRef>,
        is_mobile: bool,
    ) -> Result<SendResult> {
        let socket = {
            let sessions = self.sessions.lock().unwrap();
            sessions.get(session_id).ok_or(CoreError::NoSession)?.socket.clone()
        };

        send::send_prompt(
            session_id,
            message,
            images,
            SendOptions { is_mobile, skip_message_add: false },
            &socket,
            &self.store,
            &self.pending_prompts,
            &self.registry,
            &self.config,
            now_ms(),
        )
        .await
    }

    pub fn cancel_prompt(&self, session_id: &str) -> Result<()> {
        let sessions = self.sessions.lock().unwrap();
        let handle = sessions.get(session_id).ok_or(CoreError::NoSession)?;
        send::cancel_prompt(&handle.socket)
    }

    pub fn force_reset(&self, session_id: &str) -> Result<()> {
        let sessions = self.sessions.lock().unwrap();
        let handle = sessions.get(session_id).ok_or(CoreError::NoSession)?;
        send::force_reset(&handle.socket)
    }

    pub fn force_reconnect_active_session(&self) -> Result<()> {
        let active = self.active_session.lock().unwrap().clone().ok_or(CoreError::NoSession)?;
        let sessions = self.sessions.lock().unwrap();
        let handle = sessions.get(&active).ok_or(CoreError::NoSession)?;
        handle.socket.force_close();
        Ok(())
    }

    // ---- queue mutations --------------------------------------------------

    pub async fn add_queue_item(&self, session_id: &str, message: &str, image_ids: Vec<String>) -> Result<QueueAddOutcome> {
        let outcome = self
            .http
            .add_to_queue(session_id, &QueueAddRequest { message: message.to_string(), image_ids })
            .await?;
        self.refresh_queue(session_id).await?;
        Ok(outcome)
    }

    pub async fn remove_queue_item(&self, session_id: &str, message_id: &str) -> Result<()> {
        self.http.remove_from_queue(session_id, message_id).await?;
        self.refresh_queue(session_id).await
    }

    pub async fn move_queue_item(&self, session_id: &str, message_id: &str, up: bool) -> Result<()> {
        let direction = if up { MoveDirection::Up } else { MoveDirection::Down };
        let resp = self.http.move_queue_item(session_id, message_id, direction).await?;
        self.apply_queue_response(session_id, resp);
        Ok(())
    }

    async fn refresh_queue(&self, session_id: &str) -> Result<()> {
        let resp = self.http.list_queue(session_id).await?;
        self.apply_queue_response(session_id, resp);
        Ok(())
    }

    fn apply_queue_response(&self, session_id: &str, resp: crate::http::QueueListResponse) {
        let items = resp
            .messages
            .into_iter()
            .map(|m| QueueItem { id: m.id, message: m.message, title: m.title, queued_at: m.queued_at })
            .collect();
        let mut store = self.store.lock().unwrap();
        store.set_queue(session_id, items);
        store.set_queue_length(session_id, resp.count);
        drop(store);
        self.notify_changed();
    }

    // ---- workspaces --------------------------------------------------

    pub async fn refresh_workspaces(&self) -> Result<()> {
        let resp = self.http.list_workspaces().await?;
        *self.workspaces.lock().unwrap() = resp.workspaces;
        self.notify_changed();
        Ok(())
    }

    pub async fn create_workspace(&self, working_dir: &str, acp_server: &str) -> Result<()> {
        let ws = Workspace { working_dir: working_dir.to_string(), acp_server: acp_server.to_string() };
        self.http.create_workspace(&ws).await?;
        self.refresh_workspaces().await
    }

    pub async fn delete_workspace(&self, working_dir: &str) -> Result<()> {
        self.http.delete_workspace(working_dir).await?;
        self.refresh_workspaces().await
    }

    // ---- mobile wake --------------------------------------------------

    /// `spec.md` §4.7 "Mobile wake". Reaps stale prompts, re-authenticates
    /// if the app was hidden long enough, refreshes the stored-session list,
    /// and force-reconnects the active session after a short delay.
    pub async fn handle_visibility_visible(&self, hidden_duration: Duration) -> Result<()> {
        match reconcile::mobile_wake(hidden_duration, &self.config, &self.auth, &self.pending_prompts).await {
            MobileWakeOutcome::AuthRequired => {
                self.auth_required.store(true, Ordering::Relaxed);
                self.notify_changed();
                return Err(CoreError::AuthenticationRequired);
            }
            MobileWakeOutcome::Proceed => {}
        }

        let remote_sessions = self.http.list_sessions().await?;
        let known: std::collections::HashSet<String> =
            remote_sessions.iter().map(|s| s.id.clone()).collect();
        let mut active = self.active_session.lock().unwrap();
        if let Some(id) = active.as_ref() {
            if !known.contains(id) {
                *active = remote_sessions.first().map(|s| s.id.clone());
            }
        }
        drop(active);

        tokio::time::sleep(self.config.wake_reconnect_delay).await;
        let _ = self.force_reconnect_active_session();
        self.notify_changed();
        Ok(())
    }

    // ---- global events --------------------------------------------------

    /// `spec.md` §4.4: on first open, fetch the stored-session list and
    /// resume the last-active session (durable storage) or the most
    /// recent stored session; on reconnect, refresh the list without
    /// switching the active session.
    async fn sync_stored_sessions(&self, resume: bool) -> Result<()> {
        let remote = self.http.list_sessions().await?;
        {
            let mut store = self.store.lock().unwrap();
            for s in &remote {
                if store.get(&s.id).is_none() {
                    store.insert(SessionRecord::new(
                        s.id.clone(),
                        SessionInfo {
                            name: s.name.clone(),
                            acp_server: s.acp_server.clone(),
                            working_dir: s.working_dir.clone(),
                            created_at: s.created_at,
                            status: if s.status == "completed" {
                                SessionStatus::Completed
                            } else {
                                SessionStatus::Active
                            },
                            runner_type: None,
                            runner_restricted: false,
                        },
                    ));
                } else {
                    store.set_info(&s.id, |info| {
                        info.name = s.name.clone();
                        info.acp_server = s.acp_server.clone();
                        info.working_dir = s.working_dir.clone();
                    });
                }
            }
        }

        if resume {
            let resume_id = self
                .active_session
                .lock()
                .unwrap()
                .clone()
                .filter(|id| remote.iter().any(|s| &s.id == id))
                .or_else(|| remote.iter().max_by_key(|s| s.created_at).map(|s| s.id.clone()));
            if let Some(id) = resume_id {
                self.ensure_socket(&id);
                *self.active_session.lock().unwrap() = Some(id.clone());
                let _ = self.local.save(KEY_LAST_ACTIVE_SESSION, &id);
            }
        }

        self.notify_changed();
        Ok(())
    }

    fn spawn_global(self: Arc<Self>) {
        let connector = self.connectors.global_connector();
        let (handle, mut outcomes) = global_ws::spawn(connector, self.auth.clone(), self.config.clone());

        let this = self.clone();
        let driver = tokio::spawn(async move {
            while let Some(outcome) = outcomes.recv().await {
                match outcome {
                    GlobalOutcome::OpenedFresh => {
                        let _ = this.sync_stored_sessions(true).await;
                        let _ = this.refresh_workspaces().await;
                        this.notify_changed();
                    }
                    GlobalOutcome::Reopened => {
                        let _ = this.sync_stored_sessions(false).await;
                        let _ = this.refresh_workspaces().await;
                        this.notify_changed();
                    }
                    GlobalOutcome::Event(GlobalEvent::SessionDeleted { session_id }) => {
                        this.store.lock().unwrap().remove(&session_id);
                        this.notify_changed();
                    }
                    GlobalOutcome::Event(GlobalEvent::SessionRenamed { session_id, name }) => {
                        this.store.lock().unwrap().set_info(&session_id, |info| info.name = name);
                        this.notify_changed();
                    }
                    GlobalOutcome::Event(_) => {
                        this.notify_changed();
                    }
                    GlobalOutcome::Closed { .. } => {}
                    GlobalOutcome::AuthRequired => {
                        this.auth_required.store(true, Ordering::Relaxed);
                        this.notify_changed();
                    }
                }
            }
        });

        *self.global.lock().unwrap() = Some((handle, driver));
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}
