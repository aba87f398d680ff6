//! Local sync daemon for a remote editor's object tree.
//!
//! The daemon mirrors the editor-side tree into a directory of script
//! files, keeps an external sourcemap index current, and pushes local
//! edits back to the editor. One-shot `push`/`build` modes reverse the
//! direction to seed an editor session from disk.

pub mod config;
pub mod error;
pub mod projector;
pub mod protocol;
pub mod push;
pub mod reconciler;
pub mod server;
pub mod sourcemap;
pub mod watcher;

pub use crate::config::{Config, ScriptExtension};
pub use crate::error::{Result, SyncError};
pub use crate::projector::Projector;
pub use crate::protocol::{Incoming, Outgoing};
pub use crate::reconciler::{Event, Reconciler};
pub use crate::server::{Endpoint, OutboundSender};
pub use crate::sourcemap::SourcemapWriter;
