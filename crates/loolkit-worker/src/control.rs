//! The supervisor control loop.
//!
//! Reads framed messages from the supervisor, constructs the document on
//! the first `session` message, enqueues render and child commands for
//! the pump, and polls the discard condition on every iteration so an
//! idle worker still notices its last session leaving.

use std::sync::Arc;
use std::time::Duration;

use loolkit_core::protocol;
use loolkit_core::queue::TileQueue;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelError, ChannelReader, ChannelWriter, FrameKind, ReadOutcome};
use crate::document::Document;
use crate::engine::Office;
use crate::worker;

/// How often an idle control loop wakes up to poll the discard
/// condition.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Dispatches supervisor frames for the lifetime of the connection.
pub struct ControlLoop {
    office: Arc<Office>,
    chan: Arc<ChannelWriter>,
    queue: Arc<TileQueue>,
    jail_id: String,
    document: Option<Arc<Document>>,
}

impl ControlLoop {
    /// Creates the loop; the document appears with the first `session`
    /// message.
    #[must_use]
    pub fn new(
        office: Arc<Office>,
        chan: Arc<ChannelWriter>,
        queue: Arc<TileQueue>,
        jail_id: String,
    ) -> Self {
        Self {
            office,
            chan,
            queue,
            jail_id,
            document: None,
        }
    }

    /// The hosted document, once one exists.
    #[must_use]
    pub fn document(&self) -> Option<&Arc<Document>> {
        self.document.as_ref()
    }

    /// Runs until the supervisor closes the connection or termination is
    /// requested.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport failure.
    pub fn run(&mut self, reader: &mut ChannelReader) -> Result<(), ChannelError> {
        reader.set_idle_timeout(Some(IDLE_POLL))?;
        loop {
            if worker::termination_requested() {
                info!("termination requested, leaving control loop");
                break;
            }
            match reader.read_frame()? {
                ReadOutcome::Closed => {
                    info!("supervisor closed the control connection");
                    break;
                }
                ReadOutcome::TimedOut => {}
                ReadOutcome::Frame(frame) => {
                    if frame.kind != FrameKind::Text {
                        warn!("binary frame from supervisor dropped");
                    } else {
                        match std::str::from_utf8(&frame.payload) {
                            Ok(text) => self.dispatch(text),
                            Err(err) => {
                                warn!(error = %err, "non-UTF-8 control frame dropped");
                            }
                        }
                    }
                }
            }
            self.poll_discard();
        }
        Ok(())
    }

    fn dispatch(&mut self, message: &str) {
        debug!(message = %protocol::abbreviate(message), "control recv");
        let tokens = protocol::tokenize(message);
        let Some(&command) = tokens.first() else {
            return;
        };
        if worker::termination_requested() {
            debug!("too late, we're going down");
            return;
        }
        match command {
            "session" => self.open_session(&tokens),
            "tile" | "tilecombine" | "canceltiles" => self.enqueue(message),
            _ if protocol::parse_name_value(command, '-')
                .is_some_and(|(name, _)| name == "child") =>
            {
                self.enqueue(message);
            }
            _ => {
                if let Some(document) = &self.document {
                    if document.can_discard() {
                        info!("last session discarded, terminating");
                        worker::request_termination();
                        return;
                    }
                }
                error!(token = command, "bad or unknown control token");
            }
        }
    }

    fn open_session(&mut self, tokens: &[&str]) {
        let (Some(&session_id), Some(&doc_key)) = (tokens.get(1), tokens.get(2)) else {
            error!("malformed session command");
            return;
        };
        let url = protocol::url_decode_utf8(doc_key);
        info!(session = session_id, url, "new session request");

        if self.document.is_none() {
            self.document = Some(Document::spawn(
                Arc::clone(&self.office),
                self.jail_id.clone(),
                doc_key,
                url.clone(),
                Arc::clone(&self.queue),
                Arc::clone(&self.chan),
            ));
        }
        let Some(document) = self.document.as_ref() else {
            return;
        };
        // The worker hosts one document; every session must name it.
        if url != document.url() || !document.create_session(session_id) {
            debug!(session = session_id, "create session failed");
        }
    }

    fn enqueue(&self, message: &str) {
        if self.document.is_some() {
            self.queue.put(message);
        } else {
            warn!(
                message = %protocol::abbreviate(message),
                "no document while processing request"
            );
        }
    }

    fn poll_discard(&self) {
        if let Some(document) = &self.document {
            if document.can_discard() {
                info!("last session discarded, terminating");
                worker::request_termination();
            }
        }
    }
}
