use serde::{Deserialize, Serialize};

use crate::id::InstanceId;

/// The three script classes that carry a source body.
///
/// Everything else in the tree is structural: it may materialize as a
/// directory on disk but never as a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    /// Server-run `Script`.
    Server,
    /// Client-run `LocalScript`.
    Client,
    /// `ModuleScript`.
    Module,
}

impl ScriptKind {
    /// Maps an open-set class tag to a script kind, if it is one.
    pub fn from_class(class_name: &str) -> Option<Self> {
        match class_name {
            "Script" => Some(Self::Server),
            "LocalScript" => Some(Self::Client),
            "ModuleScript" => Some(Self::Module),
            _ => None,
        }
    }

    pub fn class_name(self) -> &'static str {
        match self {
            Self::Server => "Script",
            Self::Client => "LocalScript",
            Self::Module => "ModuleScript",
        }
    }

    /// Filename suffix encoding this kind. Module scripts are the unmarked
    /// case and carry no suffix.
    pub fn file_suffix(self) -> &'static str {
        match self {
            Self::Server => ".server",
            Self::Client => ".client",
            Self::Module => "",
        }
    }
}

/// One tree node as it crosses the wire.
///
/// `path` is the logical path from the root service down to and including
/// this node, so root services have a single segment. `source` is present
/// only for the script classes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceEntry {
    pub id: InstanceId,
    pub class_name: String,
    pub name: String,
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl InstanceEntry {
    pub fn script_kind(&self) -> Option<ScriptKind> {
        ScriptKind::from_class(&self.class_name)
    }
}

/// One tree node as stored.
///
/// Children are held by id on the parent; the reverse edge lives in the
/// tree's `id -> parent id` index rather than on the node, so nodes never
/// form reference cycles.
#[derive(Debug, Clone)]
pub struct InstanceNode {
    pub id: InstanceId,
    pub class_name: String,
    pub name: String,
    pub path: Vec<String>,
    pub source: Option<String>,
    pub children: Vec<InstanceId>,
}

impl InstanceNode {
    pub fn from_entry(entry: InstanceEntry) -> Self {
        Self {
            id: entry.id,
            class_name: entry.class_name,
            name: entry.name,
            path: entry.path,
            source: entry.source,
            children: Vec::new(),
        }
    }

    pub fn script_kind(&self) -> Option<ScriptKind> {
        ScriptKind::from_class(&self.class_name)
    }

    pub fn is_script(&self) -> bool {
        self.script_kind().is_some()
    }

    /// Logical path of this node's parent (empty for a root service).
    pub fn parent_path(&self) -> &[String] {
        let len = self.path.len();
        &self.path[..len.saturating_sub(1)]
    }

    pub fn to_entry(&self) -> InstanceEntry {
        InstanceEntry {
            id: self.id.clone(),
            class_name: self.class_name.clone(),
            name: self.name.clone(),
            path: self.path.clone(),
            source: self.source.clone(),
        }
    }
}
