//! The document manager.
//!
//! Owns the single engine document of this worker, mediates view
//! lifetimes across sessions, carries the password state machine, and
//! drives the render pump: a dedicated thread consuming the tile queue,
//! painting tiles, and demultiplexing engine callbacks to the session
//! that owns the view.
//!
//! Lock ordering: the document mutex may be taken before an engine
//! mutex, never after one. The office mutex is acquired independently.
//! Callbacks reach the pump through the queue instead of re-entering any
//! lock they might already transit.

use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Instant;

use loolkit_core::png;
use loolkit_core::protocol;
use loolkit_core::queue::{CursorPosition, TileQueue};
use loolkit_core::tile::{TileCombined, TileDesc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, trace, warn};

use crate::callback::{router, CallbackId, CallbackTarget, BROADCAST_VIEW_ID};
use crate::channel::ChannelWriter;
use crate::engine::{ffi, EngineDocument, Office};
use crate::session::{ChildSession, Purge, SessionRegistry};
use crate::worker;

/// What a document password protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordKind {
    /// The password gates viewing.
    ToView,
    /// The password gates modification.
    ToModify,
}

impl fmt::Display for PasswordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToView => write!(f, "to-view"),
            Self::ToModify => write!(f, "to-modify"),
        }
    }
}

/// The password state machine, driven by the engine's password callback
/// and the result of the load call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PasswordState {
    /// No password demand observed.
    #[default]
    Unprotected,
    /// The engine asked for a password; the stored one (or a refusal)
    /// was forwarded and the load outcome is pending.
    Awaiting(PasswordKind),
    /// The engine asked twice with a password stored: the stored one was
    /// wrong, and the load was aborted.
    Rejected(PasswordKind),
}

impl PasswordState {
    /// Whether a password demand has been observed.
    #[must_use]
    pub const fn is_protected(&self) -> bool {
        !matches!(self, Self::Unprotected)
    }
}

/// Errors from loading a view.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The initiating session vanished.
    #[error("no session {0}")]
    SessionNotFound(String),

    /// The document is protected and no password was supplied.
    #[error("password required ({0})")]
    PasswordRequired(PasswordKind),

    /// The supplied password does not match.
    #[error("wrong password")]
    WrongPassword,

    /// The engine rejected the document.
    #[error("engine failed to load the document: {}", reason.as_deref().unwrap_or("no engine error"))]
    LoadFailed {
        /// The engine's error string, if it reported one.
        reason: Option<String>,
    },

    /// The engine binding failed.
    #[error(transparent)]
    Engine(#[from] crate::engine::EngineError),

    /// The recorded render options are not valid JSON.
    #[error("render options: {0}")]
    RenderOpts(#[from] serde_json::Error),
}

#[derive(Default)]
struct DocState {
    engine_doc: Option<Arc<EngineDocument>>,
    jailed_url: String,
    render_opts: String,
    password_provided: Option<String>,
    password_state: PasswordState,
    load_in_flight: usize,
    client_views: usize,
    view_descriptors: HashMap<i32, CallbackId>,
    global_callback: Option<CallbackId>,
}

/// The one document this worker hosts.
pub struct Document {
    jail_id: String,
    doc_key: String,
    url: String,
    office: Arc<Office>,
    queue: Arc<TileQueue>,
    chan: Arc<ChannelWriter>,
    sessions: SessionRegistry,
    state: Mutex<DocState>,
    load_done: Condvar,
    stop: AtomicBool,
    pump: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Document {
    /// Creates the document and starts its pump thread.
    pub fn spawn(
        office: Arc<Office>,
        jail_id: impl Into<String>,
        doc_key: impl Into<String>,
        url: impl Into<String>,
        queue: Arc<TileQueue>,
        chan: Arc<ChannelWriter>,
    ) -> Arc<Self> {
        let jail_id = jail_id.into();
        let doc_key = doc_key.into();
        let url = url.into();
        info!(%url, jail = %jail_id, %doc_key, "hosting document");

        let document = Arc::new(Self {
            jail_id,
            doc_key,
            url,
            office,
            queue: Arc::clone(&queue),
            chan,
            sessions: SessionRegistry::new(),
            state: Mutex::new(DocState::default()),
            load_done: Condvar::new(),
            stop: AtomicBool::new(false),
            pump: Mutex::new(None),
        });

        let weak = Arc::downgrade(&document);
        match thread::Builder::new()
            .name("lokit_pump".to_string())
            .spawn(move || pump_loop(queue, weak))
        {
            Ok(handle) => {
                *document
                    .pump
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
            Err(err) => error!(error = %err, "failed to start pump thread"),
        }
        document
    }

    fn state_lock(&self) -> MutexGuard<'_, DocState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The document URL; fixed for the process lifetime.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The URL-encoded document key the supervisor routes by.
    #[must_use]
    pub fn doc_key(&self) -> &str {
        &self.doc_key
    }

    /// The tile queue feeding this document's pump.
    #[must_use]
    pub fn queue(&self) -> &Arc<TileQueue> {
        &self.queue
    }

    /// Number of sessions whose view is registered and not destroyed.
    #[must_use]
    pub fn client_views(&self) -> usize {
        self.state_lock().client_views
    }

    /// Number of live view callback descriptors.
    #[must_use]
    pub fn view_descriptor_count(&self) -> usize {
        self.state_lock().view_descriptors.len()
    }

    /// Whether a session with this id is registered.
    #[must_use]
    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.contains(session_id)
    }

    fn engine_doc(&self) -> Option<Arc<EngineDocument>> {
        self.state_lock().engine_doc.clone()
    }

    /// Registers a session; idempotent for duplicate ids.
    pub fn create_session(self: &Arc<Self>, session_id: &str) -> bool {
        if self.sessions.contains(session_id) {
            warn!(session = session_id, "session is already running");
            return true;
        }
        info!(
            session = session_id,
            url = %self.url,
            jail = %self.jail_id,
            first = self.sessions.is_empty(),
            "creating view session"
        );
        let session = ChildSession::new(
            session_id,
            self.jail_id.clone(),
            Arc::downgrade(self),
            Arc::clone(&self.chan),
        );
        self.sessions.insert(session);
        debug!(sessions = self.sessions.len());
        true
    }

    /// Loads the document (first call) or a new view of it, assigning a
    /// view id to the initiating session.
    ///
    /// Loads are strictly serialized: concurrent callers wait until the
    /// in-flight load finishes.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`]; password failures have already produced
    /// their `error:` frame on the initiating session.
    pub fn on_load(
        self: &Arc<Self>,
        session_id: &str,
        uri: &str,
        user_name: &str,
        password: Option<String>,
        render_opts: Option<String>,
    ) -> Result<i32, LoadError> {
        info!(
            session = session_id,
            views = self.client_views(),
            "session is loading"
        );
        {
            let mut state = self.state_lock();
            while state.load_in_flight > 0 {
                state = self
                    .load_done
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            state.load_in_flight += 1;
        }

        let result = self.load_view(session_id, uri, user_name, password, render_opts);

        {
            let mut state = self.state_lock();
            if result.is_ok() {
                state.client_views += 1;
            }
            state.load_in_flight -= 1;
        }
        self.load_done.notify_one();
        result
    }

    fn load_view(
        self: &Arc<Self>,
        session_id: &str,
        uri: &str,
        user_name: &str,
        password: Option<String>,
        render_opts: Option<String>,
    ) -> Result<i32, LoadError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| LoadError::SessionNotFound(session_id.to_string()))?;

        let (engine_doc, is_new_view) = match self.engine_doc() {
            None => (self.first_load(&session, uri, password, render_opts)?, false),
            Some(engine_doc) => {
                self.check_password(&session, password.as_deref())?;
                info!(session = session_id, uri, "loading new view");
                (engine_doc, true)
            }
        };

        let options = self.merged_render_opts(user_name)?;

        // One continuous hold across create, initialize, view query, and
        // callback registration: a concurrent unload calls setView on
        // its own view, and releasing in between would let it change the
        // current view under us.
        let guard = engine_doc.lock();
        if is_new_view {
            guard.create_view();
            trace!("view created");
        }
        // initializeForRendering can itself create a view in
        // presentation documents; register the callback only after.
        guard.initialize_for_rendering(&options)?;
        let view_id = guard.view();
        let descriptor = router().register(CallbackTarget {
            document: Arc::downgrade(self),
            view_id,
        });
        guard.register_callback(Some(view_callback), descriptor.as_user_data());
        let view_ids = guard.view_ids();
        drop(guard);

        session.set_view(view_id, protocol::url_decode_utf8(user_name));
        self.state_lock().view_descriptors.insert(view_id, descriptor);

        info!(
            url = %self.url,
            view_id,
            views = self.client_views() + 1,
            "view loaded"
        );

        self.notify_view_info(&engine_doc, &view_ids);
        Ok(view_id)
    }

    fn first_load(
        self: &Arc<Self>,
        session: &Arc<ChildSession>,
        uri: &str,
        password: Option<String>,
        render_opts: Option<String>,
    ) -> Result<Arc<EngineDocument>, LoadError> {
        info!(uri, "loading new document");
        let global = {
            let mut state = self.state_lock();
            state.password_provided = password;
            state.password_state = PasswordState::Unprotected;
            state.jailed_url = uri.to_string();
            match state.global_callback {
                Some(id) => id,
                None => {
                    let id = router().register(CallbackTarget {
                        document: Arc::downgrade(self),
                        view_id: BROADCAST_VIEW_ID,
                    });
                    state.global_callback = Some(id);
                    id
                }
            }
        };

        let office = self.office.lock();
        office.register_callback(Some(global_callback), global.as_user_data());
        office.set_optional_features(
            ffi::FEATURE_DOCUMENT_PASSWORD
                | ffi::FEATURE_DOCUMENT_PASSWORD_TO_MODIFY
                | ffi::FEATURE_PART_IN_INVALIDATION_CALLBACK,
        );

        debug!("calling engine document load");
        // The password callback may fire synchronously on this thread
        // before the call returns.
        let loaded = office.document_load(uri)?;
        debug!("engine document load returned");

        let Some(engine_doc) = loaded else {
            let reason = office.last_error();
            drop(office);
            return Err(self.classify_load_failure(session, reason));
        };
        drop(office);

        let mut state = self.state_lock();
        state.engine_doc = Some(Arc::clone(&engine_doc));
        // Render options are fixed at first load; later views reuse
        // them.
        state.render_opts = render_opts.unwrap_or_default();
        Ok(engine_doc)
    }

    fn classify_load_failure(&self, session: &ChildSession, reason: Option<String>) -> LoadError {
        let (password_state, provided) = {
            let state = self.state_lock();
            (state.password_state, state.password_provided.is_some())
        };
        match (password_state, provided) {
            (PasswordState::Awaiting(kind), false) => {
                info!(%kind, url = %self.url, "document is password protected");
                session.send_text_frame(&format!("error: cmd=load kind=passwordrequired:{kind}"));
                LoadError::PasswordRequired(kind)
            }
            (PasswordState::Awaiting(_) | PasswordState::Rejected(_), _) => {
                info!(url = %self.url, "wrong password for protected document");
                session.send_text_frame("error: cmd=load kind=wrongpassword");
                LoadError::WrongPassword
            }
            (PasswordState::Unprotected, _) => {
                error!(
                    url = %self.url,
                    reason = reason.as_deref().unwrap_or("none"),
                    "document load failed"
                );
                self.alert_all_users("load", "faileddocloading");
                LoadError::LoadFailed { reason }
            }
        }
    }

    fn check_password(
        &self,
        session: &ChildSession,
        password: Option<&str>,
    ) -> Result<(), LoadError> {
        let (password_state, stored) = {
            let state = self.state_lock();
            (state.password_state, state.password_provided.clone())
        };
        let kind = match password_state {
            PasswordState::Unprotected => return Ok(()),
            PasswordState::Awaiting(kind) | PasswordState::Rejected(kind) => kind,
        };
        match password {
            None => {
                session.send_text_frame(&format!("error: cmd=load kind=passwordrequired:{kind}"));
                Err(LoadError::PasswordRequired(kind))
            }
            Some(supplied) if stored.as_deref() == Some(supplied) => Ok(()),
            Some(_) => {
                session.send_text_frame("error: cmd=load kind=wrongpassword");
                Err(LoadError::WrongPassword)
            }
        }
    }

    /// Handles the engine's password callback during a load.
    pub(crate) fn on_password_callback(&self, callback_type: i32) {
        let kind = if callback_type == ffi::CALLBACK_DOCUMENT_PASSWORD_TO_MODIFY {
            PasswordKind::ToModify
        } else {
            PasswordKind::ToView
        };
        let (url, reply) = {
            let mut state = self.state_lock();
            info!(
                protected = state.password_state.is_protected(),
                provided = state.password_provided.is_some(),
                "document password callback"
            );
            let url = state.jailed_url.clone();
            if state.password_state.is_protected() && state.password_provided.is_some() {
                // Second prompt with a stored password: it was wrong.
                // Refuse so the engine aborts the load.
                let stored_kind = match state.password_state {
                    PasswordState::Awaiting(kind) | PasswordState::Rejected(kind) => kind,
                    PasswordState::Unprotected => kind,
                };
                state.password_state = PasswordState::Rejected(stored_kind);
                debug!("aborting load after wrong password");
                (url, None)
            } else {
                state.password_state = PasswordState::Awaiting(kind);
                (url, state.password_provided.clone())
            }
        };
        self.office
            .reply_password_from_callback(&url, reply.as_deref());
    }

    /// Enqueues a broadcast callback for every view.
    pub(crate) fn broadcast_callback(&self, callback_type: i32, payload: &str) {
        self.queue
            .put(format!("callback {BROADCAST_VIEW_ID} {callback_type} {payload}"));
    }

    /// Records cursor movement in the queue's side-index and enqueues
    /// the callback for the pump.
    pub(crate) fn view_callback_event(&self, view_id: i32, callback_type: i32, payload: &str) {
        match callback_type {
            ffi::CALLBACK_INVALIDATE_VISIBLE_CURSOR | ffi::CALLBACK_CELL_CURSOR => {
                if let Some(rect) = parse_cursor_rectangle(payload) {
                    self.queue.update_cursor_position(0, 0, rect);
                }
            }
            ffi::CALLBACK_INVALIDATE_VIEW_CURSOR | ffi::CALLBACK_CELL_VIEW_CURSOR => {
                if let Some((view, part, rect)) = parse_view_cursor(payload) {
                    self.queue.update_cursor_position(view, part, rect);
                }
            }
            _ => {}
        }
        self.queue
            .put(format!("callback {view_id} {callback_type} {payload}"));
    }

    /// Destroys the session's view inside the engine and broadcasts the
    /// updated view roster. Idempotent: the first call consumes the
    /// session's view id.
    pub(crate) fn on_unload(&self, session: &ChildSession) {
        let session_id = session.id();
        let Some(view_id) = session.take_view() else {
            debug!(session = %session_id, "unload without a view");
            return;
        };
        info!(session = %session_id, view_id, "unloading");
        self.queue.remove_cursor_position(view_id);

        let Some(engine_doc) = self.engine_doc() else {
            error!(session = %session_id, "unload without an engine document");
            return;
        };

        let descriptor = {
            let mut state = self.state_lock();
            state.client_views = state.client_views.saturating_sub(1);
            state.view_descriptors.remove(&view_id)
        };

        let view_ids = {
            let guard = engine_doc.lock();
            guard.set_view(view_id);
            guard.register_callback(None, std::ptr::null_mut());
            guard.destroy_view(view_id);
            guard.view_ids()
        };
        if let Some(descriptor) = descriptor {
            router().unregister(descriptor);
        }
        debug!(view_id, "destroyed view");
        info!(
            url = %self.url,
            session = %session_id,
            views = self.client_views(),
            "session unloaded"
        );

        self.notify_view_info(&engine_doc, &view_ids);
    }

    fn view_info(&self) -> HashMap<i32, String> {
        self.sessions
            .snapshot()
            .into_iter()
            .filter(|session| !session.is_close_frame())
            .filter_map(|session| {
                session
                    .view_id()
                    .map(|view_id| (view_id, session.view_user_name()))
            })
            .collect()
    }

    fn view_colors(&self, engine_doc: &EngineDocument) -> HashMap<String, i32> {
        let raw = engine_doc.lock().command_values(".uno:TrackedChangeAuthors");
        let Some(raw) = raw else {
            return HashMap::new();
        };
        if raw.is_empty() {
            return HashMap::new();
        }
        match serde_json::from_str::<TrackedChangeAuthors>(&raw) {
            Ok(parsed) => parsed
                .authors
                .into_iter()
                .map(|author| (author.name, author.color))
                .collect(),
            Err(err) => {
                warn!(error = %err, "unparsable tracked-change author colors");
                HashMap::new()
            }
        }
    }

    /// Sends the `[{id, username, color}]` roster to every active
    /// session.
    pub(crate) fn notify_view_info(&self, engine_doc: &EngineDocument, view_ids: &[i32]) {
        let names = self.view_info();
        let colors = self.view_colors(engine_doc);
        let roster: Vec<ViewInfo> = view_ids
            .iter()
            .map(|&id| match names.get(&id) {
                Some(username) => ViewInfo {
                    id,
                    username: username.clone(),
                    color: colors.get(username).copied().unwrap_or(0),
                },
                None => {
                    error!(view_id = id, "no username found for view");
                    ViewInfo {
                        id,
                        username: "Unknown".to_string(),
                        color: 0,
                    }
                }
            })
            .collect();

        let json = match serde_json::to_string(&roster) {
            Ok(json) => json,
            Err(err) => {
                error!(error = %err, "failed to serialize view info");
                return;
            }
        };
        let message = format!("viewinfo: {json}");
        for session in self.sessions.snapshot() {
            if session.is_active() {
                session.send_text_frame(&message);
            }
        }
    }

    fn merged_render_opts(&self, user_name: &str) -> Result<String, LoadError> {
        let base = self.state_lock().render_opts.clone();
        let mut options = if base.trim().is_empty() {
            serde_json::Map::new()
        } else {
            match serde_json::from_str::<Value>(&base)? {
                Value::Object(map) => map,
                _ => {
                    warn!("render options are not a JSON object; ignoring them");
                    serde_json::Map::new()
                }
            }
        };
        merge_author(&mut options, user_name);
        Ok(Value::Object(options).to_string())
    }

    /// Broadcasts `errortoall:` to every client through the supervisor.
    pub fn alert_all_users(&self, cmd: &str, kind: &str) {
        let message = format!("errortoall: cmd={cmd} kind={kind}");
        if let Err(err) = self.chan.send_text_frame(&message) {
            error!(error = %err, "failed to broadcast {message}");
        }
    }

    /// Reaps close-framed sessions; `None` when the registry was busy.
    ///
    /// A purge observing zero running sessions terminates the process
    /// with success before any session destructor runs.
    pub fn purge_sessions(&self) -> Option<usize> {
        match self.sessions.purge() {
            Purge::Busy => None,
            Purge::Empty => {
                info!("no more sessions, exiting bluntly");
                worker::fast_exit(worker::EXIT_OK);
            }
            Purge::Running(count) => Some(count),
        }
    }

    /// Whether at least one live session exists (busy counts as live).
    pub fn has_sessions(&self) -> bool {
        self.purge_sessions() != Some(0)
    }

    /// Whether the worker can discard this document and exit.
    pub fn can_discard(&self) -> bool {
        // TODO: add an inactivity timeout on top of session liveness.
        !self.has_sessions()
    }

    fn dispatch(&self, command: &str, tokens: &[&str], message: &str) {
        match command {
            "tile" => self.render_tile(&tokens[1..]),
            "tilecombine" => self.render_combined_tiles(&tokens[1..]),
            "callback" => self.route_callback(tokens, message),
            _ if protocol::parse_name_value(command, '-')
                .is_some_and(|(name, _)| name == "child") =>
            {
                self.forward_to_child(command, message);
            }
            _ => error!(
                message = %protocol::abbreviate(message),
                "unexpected pump message"
            ),
        }
    }

    fn render_tile(&self, tokens: &[&str]) {
        let tile = match TileDesc::parse(tokens) {
            Ok(tile) => tile,
            Err(err) => {
                error!(error = %err, "bad tile request");
                return;
            }
        };
        let Some(engine_doc) = self.engine_doc() else {
            error!("tile rendering requested before loading document");
            return;
        };

        let mut output = tile.serialize("tile:").into_bytes();
        output.push(b'\n');

        let mut pixmap = vec![0u8; 4 * tile.width as usize * tile.height as usize];
        let mode = {
            let guard = engine_doc.lock();
            if guard.views_count() <= 0 {
                error!("tile rendering requested without views");
                return;
            }
            let started = Instant::now();
            guard.paint_part_tile(
                &mut pixmap,
                tile.part,
                tile.width,
                tile.height,
                tile.tile_pos_x,
                tile.tile_pos_y,
                tile.tile_width,
                tile.tile_height,
            );
            trace!(
                part = tile.part,
                x = tile.tile_pos_x,
                y = tile.tile_pos_y,
                ver = tile.version,
                elapsed = ?started.elapsed(),
                "painted tile"
            );
            guard.tile_mode()
        };

        if let Err(err) = png::encode_buffer(&pixmap, tile.width, tile.height, mode, &mut output) {
            error!(error = %err, "failed to encode tile into PNG");
            return;
        }
        trace!(bytes = output.len(), "sending render-tile response");
        if let Err(err) = self.chan.send_binary_frame(&output) {
            error!(error = %err, "failed to send tile reply");
        }
    }

    fn render_combined_tiles(&self, tokens: &[&str]) {
        let mut combined = match TileCombined::parse(tokens) {
            Ok(combined) => combined,
            Err(err) => {
                error!(error = %err, "bad combined tile request");
                return;
            }
        };
        let Some(engine_doc) = self.engine_doc() else {
            error!("tile rendering requested before loading document");
            return;
        };

        let area = combined.render_area();
        let tiles_by_x = (area.width / combined.tile_width) as u32;
        let tiles_by_y = (area.height / combined.tile_height) as u32;
        let pixmap_width = tiles_by_x * combined.width;
        let pixmap_height = tiles_by_y * combined.height;
        let mut pixmap = vec![0u8; 4 * pixmap_width as usize * pixmap_height as usize];

        let mode = {
            let guard = engine_doc.lock();
            if guard.views_count() <= 0 {
                error!("tile rendering requested without views");
                return;
            }
            let started = Instant::now();
            guard.paint_part_tile(
                &mut pixmap,
                combined.part,
                pixmap_width,
                pixmap_height,
                area.left(),
                area.top(),
                area.width,
                area.height,
            );
            debug!(
                left = area.left(),
                top = area.top(),
                width = area.width,
                height = area.height,
                ver = combined.version,
                elapsed = ?started.elapsed(),
                "painted combined tiles"
            );
            guard.tile_mode()
        };

        let mut encoded = Vec::new();
        for (index, tile) in combined.tiles.iter_mut().enumerate() {
            let position_x = ((tile.tile_pos_x - area.left()) / tile.tile_width) as u32;
            let position_y = ((tile.tile_pos_y - area.top()) / tile.tile_height) as u32;
            let before = encoded.len();
            if let Err(err) = png::encode_sub_buffer(
                &pixmap,
                pixmap_width,
                position_x * tile.width,
                position_y * tile.height,
                tile.width,
                tile.height,
                mode,
                &mut encoded,
            ) {
                error!(error = %err, tile = index, "failed to encode tile into PNG");
                return;
            }
            tile.img_size = encoded.len() - before;
            trace!(tile = index, bytes = tile.img_size, "encoded tile");
        }

        let mut response = combined.serialize("tilecombine:").into_bytes();
        response.push(b'\n');
        response.extend_from_slice(&encoded);
        trace!(bytes = response.len(), "sending combined tile response");
        if let Err(err) = self.chan.send_binary_frame(&response) {
            error!(error = %err, "failed to send combined tile reply");
        }
    }

    fn route_callback(&self, tokens: &[&str], message: &str) {
        let (Some(view_token), Some(type_token)) = (tokens.get(1), tokens.get(2)) else {
            error!(
                message = %protocol::abbreviate(message),
                "malformed callback entry"
            );
            return;
        };
        let (Ok(view_id), Ok(callback_type)) =
            (view_token.parse::<i32>(), type_token.parse::<i32>())
        else {
            error!(
                message = %protocol::abbreviate(message),
                "malformed callback entry"
            );
            return;
        };
        let payload = message.splitn(4, ' ').nth(3).unwrap_or("");

        let mut delivered = false;
        for session in self.sessions.snapshot() {
            let matches =
                view_id == BROADCAST_VIEW_ID || session.view_id() == Some(view_id);
            if !matches {
                continue;
            }
            if session.is_close_frame() {
                error!(
                    session = %session.id(),
                    view_id,
                    callback_type,
                    "session is closing; dropping callback"
                );
                continue;
            }
            delivered = true;
            session.handle_callback(callback_type, payload);
            if view_id != BROADCAST_VIEW_ID {
                break;
            }
        }
        if !delivered {
            warn!(
                view_id,
                callback_type,
                payload = %protocol::abbreviate(payload),
                "callback with no matching session"
            );
        }
    }

    fn forward_to_child(&self, prefix: &str, message: &str) {
        let rest = message[prefix.len()..].trim_start();
        let Some(("child", session_id)) = protocol::parse_name_value(prefix, '-') else {
            error!(prefix, "failed to parse forward-to-child prefix");
            return;
        };
        trace!(
            session = session_id,
            message = %protocol::abbreviate(rest),
            "forwarding to child session"
        );

        if rest == "disconnect" {
            debug!(session = session_id, "removing child session");
            // Dropping the session unloads its view.
            if self.sessions.remove(session_id).is_none() {
                warn!(session = session_id, "disconnect for unknown session");
            }
            return;
        }

        match self.sessions.get(session_id) {
            Some(session) => {
                session.handle_input(rest);
            }
            None => warn!(
                session = session_id,
                message = %protocol::abbreviate(rest),
                "child session not found to forward message"
            ),
        }
    }
}

impl Drop for Document {
    fn drop(&mut self) {
        info!(
            url = %self.url,
            views = self.state_lock().client_views,
            "document tearing down"
        );
        self.stop.store(true, Ordering::SeqCst);
        self.queue.put_eof();
        let handle = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("pump thread panicked");
            }
        }
    }
}

#[derive(Serialize)]
struct ViewInfo {
    id: i32,
    username: String,
    color: i32,
}

#[derive(Deserialize)]
struct TrackedChangeAuthors {
    #[serde(default)]
    authors: Vec<AuthorColor>,
}

#[derive(Deserialize)]
struct AuthorColor {
    name: String,
    #[serde(default)]
    color: i32,
}

fn merge_author(options: &mut serde_json::Map<String, Value>, user_name: &str) {
    if user_name.is_empty() {
        return;
    }
    options.insert(
        ".uno:Author".to_string(),
        json!({
            "type": "string",
            "value": protocol::url_decode_utf8(user_name),
        }),
    );
}

/// Parses `x,y,w,h`; anything else (notably `EMPTY`) yields no update.
fn parse_cursor_rectangle(payload: &str) -> Option<CursorPosition> {
    let fields: Vec<i32> = payload
        .split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    let [x, y, width, height] = fields.as_slice() else {
        return None;
    };
    Some(CursorPosition {
        x: *x,
        y: *y,
        width: *width,
        height: *height,
    })
}

/// Parses the `{viewId, part, rectangle}` JSON of view-cursor callbacks;
/// numbers may arrive as strings.
fn parse_view_cursor(payload: &str) -> Option<(i32, i32, CursorPosition)> {
    let value: Value = serde_json::from_str(payload).ok()?;
    let view_id = json_int(value.get("viewId")?)?;
    let part = json_int(value.get("part")?)?;
    let rect = parse_cursor_rectangle(value.get("rectangle")?.as_str()?)?;
    Some((view_id as i32, part as i32, rect))
}

fn json_int(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str()?.trim().parse().ok())
}

fn pump_loop(queue: Arc<TileQueue>, document: Weak<Document>) {
    debug!("pump thread started");
    loop {
        let payload = queue.get();
        if worker::termination_requested() {
            break;
        }
        let Some(document) = document.upgrade() else {
            break;
        };
        if document.stop.load(Ordering::SeqCst) {
            break;
        }

        let raw = String::from_utf8_lossy(&payload).into_owned();
        // Child-lane slicing below assumes the command starts the line.
        let message = raw.trim();
        let tokens = protocol::tokenize(message);
        let Some(&command) = tokens.first() else {
            continue;
        };
        if command == "eof" {
            info!("pump received eof, finishing");
            break;
        }
        document.dispatch(command, &tokens, message);
    }
    debug!("pump thread finished");
}

/// Office-global callback trampoline: password negotiation and broadcast
/// status events.
pub(crate) extern "C" fn global_callback(
    callback_type: c_int,
    payload: *const c_char,
    data: *mut c_void,
) {
    if worker::termination_requested() {
        return;
    }
    let Some(target) = router().resolve(CallbackId::from_user_data(data)) else {
        return;
    };
    let Some(document) = target.document.upgrade() else {
        return;
    };
    let payload = cstr_payload(payload);
    trace!(
        callback_type,
        payload = %protocol::abbreviate(&payload),
        "global engine callback"
    );
    if callback_type == ffi::CALLBACK_DOCUMENT_PASSWORD
        || callback_type == ffi::CALLBACK_DOCUMENT_PASSWORD_TO_MODIFY
    {
        document.on_password_callback(callback_type);
        return;
    }
    document.broadcast_callback(callback_type, &payload);
}

/// Per-view callback trampoline: cursor side-index updates plus
/// verbatim enqueueing for the pump.
pub(crate) extern "C" fn view_callback(
    callback_type: c_int,
    payload: *const c_char,
    data: *mut c_void,
) {
    if worker::termination_requested() {
        return;
    }
    let Some(target) = router().resolve(CallbackId::from_user_data(data)) else {
        return;
    };
    let Some(document) = target.document.upgrade() else {
        return;
    };
    let payload = cstr_payload(payload);
    trace!(
        view_id = target.view_id,
        callback_type,
        payload = %protocol::abbreviate(&payload),
        "view engine callback"
    );
    document.view_callback_event(target.view_id, callback_type, &payload);
}

fn cstr_payload(payload: *const c_char) -> String {
    if payload.is_null() {
        return "(nil)".to_string();
    }
    unsafe { CStr::from_ptr(payload) }
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_kind_display() {
        assert_eq!(PasswordKind::ToView.to_string(), "to-view");
        assert_eq!(PasswordKind::ToModify.to_string(), "to-modify");
    }

    #[test]
    fn test_password_state_protection() {
        assert!(!PasswordState::Unprotected.is_protected());
        assert!(PasswordState::Awaiting(PasswordKind::ToView).is_protected());
        assert!(PasswordState::Rejected(PasswordKind::ToModify).is_protected());
    }

    #[test]
    fn test_parse_cursor_rectangle() {
        let rect = parse_cursor_rectangle("100, 200, 30, 40").unwrap();
        assert_eq!(
            rect,
            CursorPosition {
                x: 100,
                y: 200,
                width: 30,
                height: 40
            }
        );
        assert!(parse_cursor_rectangle("EMPTY").is_none());
        assert!(parse_cursor_rectangle("1,2,3").is_none());
        assert!(parse_cursor_rectangle("1,2,3,4,5").is_none());
    }

    #[test]
    fn test_parse_view_cursor_accepts_numbers_and_strings() {
        let (view, part, rect) =
            parse_view_cursor(r#"{"viewId": 2, "part": 0, "rectangle": "1,2,3,4"}"#).unwrap();
        assert_eq!((view, part), (2, 0));
        assert_eq!(rect.x, 1);

        let (view, part, _) =
            parse_view_cursor(r#"{"viewId": "7", "part": "3", "rectangle": "9,9,1,1"}"#).unwrap();
        assert_eq!((view, part), (7, 3));

        assert!(parse_view_cursor(r#"{"viewId": 2, "part": 0, "rectangle": "EMPTY"}"#).is_none());
        assert!(parse_view_cursor("not json").is_none());
    }

    #[test]
    fn test_merge_author_decodes_user_name() {
        let mut options = serde_json::Map::new();
        merge_author(&mut options, "J%C3%BCrgen%20M");
        let author = options.get(".uno:Author").unwrap();
        assert_eq!(author["type"], "string");
        assert_eq!(author["value"], "J\u{fc}rgen M");

        let mut untouched = serde_json::Map::new();
        merge_author(&mut untouched, "");
        assert!(untouched.is_empty());
    }
}
