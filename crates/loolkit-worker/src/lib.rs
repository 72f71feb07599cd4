//! # loolkit-worker
//!
//! The per-document worker process of the collaborative editing service.
//!
//! A supervisor forks one worker per editing session. The worker builds a
//! chroot jail from donor template trees, surrenders the capabilities the
//! construction needed, loads the native document engine, and then serves
//! exactly one document over a framed control connection back to the
//! supervisor: sessions come and go, tiles are rendered and shipped as
//! PNGs, engine callbacks are demultiplexed to the view that caused them.
//!
//! The process exits when the last session closes or the supervisor drops
//! the connection; the supervisor owns jail cleanup and replacement.

#![warn(clippy::all)]

pub mod callback;
pub mod channel;
pub mod control;
pub mod document;
pub mod engine;
pub mod jail;
pub mod logging;
pub mod session;
pub mod worker;
