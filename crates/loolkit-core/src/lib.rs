//! # loolkit-core
//!
//! Core library for the loolkit per-document worker: the control-channel
//! message grammar, tile descriptors, the render queue, and PNG tile
//! encoding.
//!
//! This crate is deliberately free of process concerns. Everything that
//! touches the filesystem, the native document engine, or process
//! privileges lives in `loolkit-worker`; what remains here is pure data
//! and can be tested without a jail or an engine.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod png;
pub mod protocol;
pub mod queue;
pub mod rect;
pub mod tile;

pub use queue::TileQueue;
pub use rect::Rect;
pub use tile::{TileCombined, TileDesc};
