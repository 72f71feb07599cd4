//! Client sessions and the session registry.
//!
//! A `ChildSession` is the control-plane handle for one client view: the
//! pump delegates `child-<id>` commands to it, routes engine callbacks
//! through it, and the document broadcasts view info over it. The
//! registry owns the id-to-session map; purging is its sole deletion
//! path besides explicit `disconnect`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, TryLockError, Weak};

use loolkit_core::protocol;
use tracing::{debug, error, info, warn};

use crate::channel::ChannelWriter;
use crate::document::Document;

#[derive(Default)]
struct SessionState {
    view_id: Option<i32>,
    user_name: String,
    active: bool,
    close_frame: bool,
}

/// One client's control-plane session.
pub struct ChildSession {
    id: String,
    jail_id: String,
    document: Weak<Document>,
    chan: Arc<ChannelWriter>,
    state: Mutex<SessionState>,
}

impl ChildSession {
    /// Creates a session bound to its document and the control channel.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        jail_id: impl Into<String>,
        document: Weak<Document>,
        chan: Arc<ChannelWriter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            jail_id: jail_id.into(),
            document,
            chan,
            state: Mutex::new(SessionState::default()),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The engine view id, once a load assigned one.
    #[must_use]
    pub fn view_id(&self) -> Option<i32> {
        self.state().view_id
    }

    /// The display name of the user owning this view.
    #[must_use]
    pub fn view_user_name(&self) -> String {
        self.state().user_name.clone()
    }

    /// Whether the client's close frame has been observed.
    #[must_use]
    pub fn is_close_frame(&self) -> bool {
        self.state().close_frame
    }

    /// Whether the session has a live view.
    #[must_use]
    pub fn is_active(&self) -> bool {
        let state = self.state();
        state.active && !state.close_frame
    }

    /// Records the view id assigned by the engine and activates the
    /// session.
    pub fn set_view(&self, view_id: i32, user_name: String) {
        let mut state = self.state();
        state.view_id = Some(view_id);
        state.user_name = user_name;
        state.active = true;
    }

    /// Consumes the view id, deactivating the session; the view is
    /// unloaded exactly once.
    pub(crate) fn take_view(&self) -> Option<i32> {
        let mut state = self.state();
        state.active = false;
        state.view_id.take()
    }

    /// Sends a text frame to this session's client; returns whether the
    /// transport accepted it.
    pub fn send_text_frame(&self, message: &str) -> bool {
        match self.chan.send_text_frame(message) {
            Ok(()) => true,
            Err(err) => {
                error!(
                    session = %self.id,
                    error = %err,
                    "failed to send [{}]",
                    protocol::abbreviate(message)
                );
                false
            }
        }
    }

    /// Forwards an engine callback to the client verbatim.
    pub fn handle_callback(&self, kind: i32, payload: &str) {
        self.send_text_frame(&format!("callback: type={kind} payload={payload}"));
    }

    /// Handles one session command from the supervisor.
    pub fn handle_input(&self, message: &str) -> bool {
        let tokens = protocol::tokenize(message);
        match tokens.first().copied() {
            Some("load") => self.handle_load(&tokens),
            Some("closeframe") => {
                debug!(session = %self.id, "close frame observed");
                let mut state = self.state();
                state.close_frame = true;
                state.active = false;
                true
            }
            Some(command) => {
                warn!(session = %self.id, command, "unexpected session command");
                false
            }
            None => false,
        }
    }

    fn handle_load(&self, tokens: &[&str]) -> bool {
        let Some(url) = protocol::token_value(tokens, "url") else {
            error!(session = %self.id, "load command without url");
            self.send_text_frame("error: cmd=load kind=syntax");
            return false;
        };
        let user_name = protocol::token_value(tokens, "user").unwrap_or("");
        let password = protocol::token_value(tokens, "password").map(str::to_string);
        let render_opts = protocol::token_value(tokens, "renderopts").map(str::to_string);

        let Some(document) = self.document.upgrade() else {
            error!(session = %self.id, "load for a session with no document");
            return false;
        };

        info!(
            session = %self.id,
            jail = %self.jail_id,
            "session is loading"
        );
        match document.on_load(&self.id, url, user_name, password, render_opts) {
            Ok(view_id) => {
                self.send_text_frame(&format!("status: viewid={view_id}"));
                true
            }
            Err(err) => {
                debug!(session = %self.id, error = %err, "load failed");
                false
            }
        }
    }
}

impl Drop for ChildSession {
    fn drop(&mut self) {
        // Leaving the registry (disconnect or purge) unloads the view;
        // take_view makes this a no-op if unload already happened.
        if let Some(document) = self.document.upgrade() {
            document.on_unload(self);
        }
    }
}

/// Outcome of a purge attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Purge {
    /// The registry lock was contended; try again later.
    Busy,
    /// No session is running. The caller terminates the process without
    /// touching the registry further; tearing down the last view inside
    /// the engine is known to crash.
    Empty,
    /// Close-framed sessions were reaped; this many remain.
    Running(usize),
}

/// Thread-safe id-to-session map.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<ChildSession>>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ChildSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a session with this id exists.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Registers a session under its id.
    pub fn insert(&self, session: Arc<ChildSession>) {
        self.lock().insert(session.id().to_string(), session);
    }

    /// Looks up a session by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<ChildSession>> {
        self.lock().get(id).cloned()
    }

    /// Removes and returns a session by id.
    pub fn remove(&self, id: &str) -> Option<Arc<ChildSession>> {
        self.lock().remove(id)
    }

    /// All sessions at this instant, in no particular order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<ChildSession>> {
        self.lock().values().cloned().collect()
    }

    /// Reaps close-framed sessions.
    ///
    /// Takes the lock in try-lock mode so the control loop can poll
    /// without blocking the pump. When no session is running the
    /// registry is left untouched and [`Purge::Empty`] tells the caller
    /// to exit instead.
    pub fn purge(&self) -> Purge {
        let mut sessions = match self.sessions.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Purge::Busy,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let running = sessions
            .values()
            .filter(|session| !session.is_close_frame())
            .count();
        if running == 0 {
            return Purge::Empty;
        }

        let dead_ids: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| session.is_close_frame())
            .map(|(id, _)| id.clone())
            .collect();
        let mut dead = Vec::with_capacity(dead_ids.len());
        for id in dead_ids {
            if let Some(session) = sessions.remove(&id) {
                dead.push(session);
            }
        }
        let remaining = sessions.len();
        drop(sessions);
        // Session teardown may block on the document; never run it under
        // the registry lock.
        drop(dead);
        Purge::Running(remaining)
    }

    #[cfg(test)]
    fn lock_for_test(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ChildSession>>> {
        self.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session(id: &str) -> Arc<ChildSession> {
        let chan = Arc::new(ChannelWriter::from_writer(Box::new(Vec::<u8>::new())));
        ChildSession::new(id, "jail-1", Weak::new(), chan)
    }

    #[test]
    fn test_close_frame_marking() {
        let session = test_session("a1");
        assert!(!session.is_close_frame());
        assert!(session.handle_input("closeframe"));
        assert!(session.is_close_frame());
        assert!(!session.is_active());
    }

    #[test]
    fn test_set_view_activates() {
        let session = test_session("a1");
        assert!(!session.is_active());
        session.set_view(7, "Alice".to_string());
        assert!(session.is_active());
        assert_eq!(session.view_id(), Some(7));
        assert_eq!(session.view_user_name(), "Alice");
    }

    #[test]
    fn test_unknown_command_is_dropped() {
        let session = test_session("a1");
        assert!(!session.handle_input("selecttext from=0"));
    }

    #[test]
    fn test_load_without_document_fails() {
        let session = test_session("a1");
        assert!(!session.handle_input("load url=file:///test.odt user=Alice"));
    }

    #[test]
    fn test_purge_partitions_sessions() {
        let registry = SessionRegistry::new();
        let open = test_session("open");
        let closing = test_session("closing");
        closing.handle_input("closeframe");
        registry.insert(Arc::clone(&open));
        registry.insert(closing);

        assert_eq!(registry.purge(), Purge::Running(1));
        assert!(registry.contains("open"));
        assert!(!registry.contains("closing"));
    }

    #[test]
    fn test_purge_empty_leaves_registry_untouched() {
        let registry = SessionRegistry::new();
        let only = test_session("only");
        only.handle_input("closeframe");
        registry.insert(only);

        assert_eq!(registry.purge(), Purge::Empty);
        // The doomed session is still present; the caller exits instead
        // of tearing it down.
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_purge_reports_busy_under_contention() {
        let registry = SessionRegistry::new();
        registry.insert(test_session("a1"));
        let guard = registry.lock_for_test();
        assert_eq!(registry.purge(), Purge::Busy);
        drop(guard);
        assert_eq!(registry.purge(), Purge::Running(1));
    }
}
