//! Filesystem projection of script nodes.
//!
//! Owns the canonical `id -> absolute file path` mapping (and its reverse,
//! so watcher events resolve in O(1)). Paths are built segment by segment
//! from the logical path with each segment sanitized; the terminal filename
//! encodes the script kind, collapsing into `init<suffix>` when the node
//! acts as a container for children.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use datamodel::codec;
use datamodel::{InstanceId, InstanceNode};

use crate::config::ScriptExtension;
use crate::error::{Result, SyncError};

pub struct Projector {
    sync_dir: PathBuf,
    extension: ScriptExtension,
    file_map: HashMap<InstanceId, PathBuf>,
    path_map: HashMap<PathBuf, InstanceId>,
}

impl Projector {
    /// Creates the sync directory if needed and canonicalizes it so that
    /// watcher event paths and projected paths compare equal.
    pub fn new(sync_dir: &Path, extension: ScriptExtension) -> Result<Self> {
        fs::create_dir_all(sync_dir).map_err(|source| SyncError::Write {
            path: sync_dir.to_path_buf(),
            source,
        })?;
        let sync_dir = fs::canonicalize(sync_dir)?;
        Ok(Self {
            sync_dir,
            extension,
            file_map: HashMap::new(),
            path_map: HashMap::new(),
        })
    }

    pub fn sync_dir(&self) -> &Path {
        &self.sync_dir
    }

    pub fn path_for(&self, id: &InstanceId) -> Option<&Path> {
        self.file_map.get(id).map(PathBuf::as_path)
    }

    pub fn id_at(&self, path: &Path) -> Option<&InstanceId> {
        self.path_map.get(path)
    }

    pub fn mapped_file_count(&self) -> usize {
        self.file_map.len()
    }

    /// Forgets every mapping. Used when a full snapshot replaces the tree,
    /// so files from the previous tree count as orphans again.
    pub fn reset_mappings(&mut self) {
        self.file_map.clear();
        self.path_map.clear();
    }

    /// Computes the on-disk path for a script node. `as_container` selects
    /// the collapsed `Name/init<suffix>` form over `Name<suffix>`.
    pub fn script_path(&self, node: &InstanceNode, as_container: bool) -> Option<PathBuf> {
        let kind = node.script_kind()?;
        let mut path = self.sync_dir.clone();
        for segment in node.parent_path() {
            path.push(codec::sanitize_name(segment));
        }
        if as_container {
            path.push(codec::sanitize_name(&node.name));
            path.push(codec::init_file_name(kind, self.extension.as_str()));
        } else {
            path.push(codec::file_name_for(
                &node.name,
                kind,
                self.extension.as_str(),
            ));
        }
        Some(path)
    }

    /// Writes a script node's source to its computed path, creating
    /// intermediate directories on demand and updating the file mapping.
    ///
    /// When the computed path differs from the previously mapped one, only
    /// the mapping moves; the old file stays on disk until the caller has
    /// seen every affected write succeed and removes it. Deleting up front
    /// would leave the source nowhere if this write then failed.
    pub fn write_script(&mut self, node: &InstanceNode, as_container: bool) -> Result<PathBuf> {
        let path = self
            .script_path(node, as_container)
            .ok_or_else(|| SyncError::Project(format!("{} is not a script", node.id)))?;

        if let Some(previous) = self.file_map.get(&node.id).cloned() {
            if previous != path {
                self.path_map.remove(&previous);
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| SyncError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let body = node.source.as_deref().unwrap_or("");
        fs::write(&path, body).map_err(|source| SyncError::Write {
            path: path.clone(),
            source,
        })?;

        self.file_map.insert(node.id.clone(), path.clone());
        self.path_map.insert(path.clone(), node.id.clone());
        Ok(path)
    }

    /// Removes the mapped file for a script id, pruning now-empty parent
    /// directories up to (but never including) the sync dir.
    pub fn remove_script(&mut self, id: &InstanceId) -> Option<PathBuf> {
        let path = self.file_map.remove(id)?;
        self.path_map.remove(&path);
        self.delete_and_prune(&path);
        Some(path)
    }

    /// Direct path deletion, for when the mapping has already evaporated.
    pub fn remove_file_at(&mut self, path: &Path) {
        if let Some(id) = self.path_map.remove(path) {
            self.file_map.remove(&id);
        }
        self.delete_and_prune(path);
    }

    /// Deletes a file left behind at a superseded path. Skipped when the
    /// mapping has since handed that path to another script.
    pub fn remove_stale_file(&self, path: &Path) {
        if self.path_map.contains_key(path) {
            return;
        }
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "failed to remove stale script file");
            }
        }
    }

    /// Deletes every now-empty directory under the sync dir, bottom-up.
    /// Returns the number of directories removed.
    pub fn sweep_empty_dirs(&self) -> usize {
        let mut removed = 0;
        sweep_dir(&self.sync_dir, false, &mut removed);
        removed
    }

    /// Opt-in orphan cleanup: deletes script files under the sync dir that
    /// the current mapping does not account for. Non-script files are never
    /// touched. Returns the number of files deleted.
    pub fn clean_orphans(&mut self) -> usize {
        let mut orphans = Vec::new();
        collect_orphans(&self.sync_dir, &self.path_map, &mut orphans);
        let count = orphans.len();
        for path in orphans {
            tracing::info!(path = %path.display(), "removing orphaned script file");
            if let Err(error) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), %error, "failed to remove orphan");
            }
        }
        self.sweep_empty_dirs();
        count
    }

    fn delete_and_prune(&self, path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "failed to remove script file");
                return;
            }
        }
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.sync_dir || !dir.starts_with(&self.sync_dir) {
                break;
            }
            // remove_dir only succeeds on empty directories.
            if fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

/// Post-order sweep; `removable` is false for the root itself.
fn sweep_dir(dir: &Path, removable: bool, removed: &mut usize) -> bool {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return false,
    };
    let mut empty = true;
    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path();
        if path.is_dir() {
            if !sweep_dir(&path, true, removed) {
                empty = false;
            }
        } else {
            empty = false;
        }
    }
    if empty && removable && fs::remove_dir(dir).is_ok() {
        *removed += 1;
        return true;
    }
    empty && removable
}

fn collect_orphans(dir: &Path, mapped: &HashMap<PathBuf, InstanceId>, out: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path();
        if path.is_dir() {
            collect_orphans(&path, mapped, out);
        } else if codec::is_script_file(&path) && !mapped.contains_key(&path) {
            out.push(path);
        }
    }
}
