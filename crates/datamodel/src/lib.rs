//! In-memory model of the editor's object tree.
//!
//! This crate holds the pure, I/O-free core of the sync daemon: stable
//! instance identifiers, the wire entry / stored node types, the filename
//! codec that maps script nodes to and from disk names, and the tree store
//! with its secondary indexes.

pub mod codec;
pub mod error;
pub mod id;
pub mod instance;
pub mod tree;

pub use crate::codec::{classify_file_name, file_name_for, init_file_name, sanitize_name};
pub use crate::error::{Result, TreeError};
pub use crate::id::InstanceId;
pub use crate::instance::{InstanceEntry, InstanceNode, ScriptKind};
pub use crate::tree::{InstanceTree, InstanceUpdate, SnapshotStats};
