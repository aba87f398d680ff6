//! Plain-mode directory walk for the one-shot projectors.
//!
//! A directory becomes a script node when it holds an init script (its
//! class decided by the init file's suffix) and a folder node otherwise;
//! every other script file becomes a node named and classed by the filename
//! codec. Children are visited in lexical order.

use std::fs;
use std::path::{Path, PathBuf};

use globset::GlobSet;

use datamodel::{codec, InstanceEntry, InstanceId, ScriptKind};

use crate::error::{Result, SyncError};

/// An init script found directly inside a directory.
pub struct InitScript {
    pub kind: ScriptKind,
    pub source: String,
    pub file_path: PathBuf,
}

/// Looks for `init[.server|.client|.module]?.luau|.lua` in `dir`.
pub fn detect_init(dir: &Path) -> Result<Option<InitScript>> {
    for entry in sorted_entries(dir)? {
        if !entry.is_file() || !codec::is_script_file(&entry) {
            continue;
        }
        let Some(file_name) = entry.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if let Some((kind, name)) = codec::classify_file_name(file_name) {
            if codec::is_init_name(&name) {
                let source = fs::read_to_string(&entry).map_err(|error| {
                    SyncError::Project(format!("failed to read {}: {error}", entry.display()))
                })?;
                return Ok(Some(InitScript {
                    kind,
                    source,
                    file_path: entry,
                }));
            }
        }
    }
    Ok(None)
}

/// Walks the contents of `dir` into entries rooted at `prefix`.
///
/// The node for `dir` itself (if any) is the caller's business; this only
/// emits children. Entries come out in walk order; callers sort the final
/// list shallow-first.
pub fn walk_children(
    dir: &Path,
    prefix: &[String],
    ignore: &GlobSet,
    out: &mut Vec<InstanceEntry>,
) -> Result<()> {
    for entry in sorted_entries(dir)? {
        if ignore.is_match(&entry) {
            continue;
        }
        if entry.is_dir() {
            let Some(dir_name) = entry.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let mut child_path = prefix.to_vec();
            child_path.push(dir_name.to_string());

            let init = detect_init(&entry)?;
            let node = match &init {
                Some(init) => InstanceEntry {
                    id: InstanceId::generate(),
                    class_name: init.kind.class_name().to_string(),
                    name: dir_name.to_string(),
                    path: child_path.clone(),
                    source: Some(init.source.clone()),
                },
                None => InstanceEntry {
                    id: InstanceId::generate(),
                    class_name: "Folder".to_string(),
                    name: dir_name.to_string(),
                    path: child_path.clone(),
                    source: None,
                },
            };
            out.push(node);
            walk_children(&entry, &child_path, ignore, out)?;
        } else if entry.is_file() && codec::is_script_file(&entry) {
            let Some(file_name) = entry.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Some((kind, name)) = codec::classify_file_name(file_name) else {
                continue;
            };
            if codec::is_init_name(&name) {
                // Belongs to the directory node, already emitted.
                continue;
            }
            let source = fs::read_to_string(&entry).map_err(|error| {
                SyncError::Project(format!("failed to read {}: {error}", entry.display()))
            })?;
            let mut path = prefix.to_vec();
            path.push(name.clone());
            out.push(InstanceEntry {
                id: InstanceId::generate(),
                class_name: kind.class_name().to_string(),
                name,
                path,
                source: Some(source),
            });
        }
    }
    Ok(())
}

/// Shallow-first, then lexical by path: the stable order for snapshots.
pub fn sort_entries(entries: &mut [InstanceEntry]) {
    entries.sort_by(|a, b| {
        a.path
            .len()
            .cmp(&b.path.len())
            .then_with(|| a.path.cmp(&b.path))
    });
}

pub(crate) fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let reader = fs::read_dir(dir).map_err(|error| {
        SyncError::Project(format!("failed to read directory {}: {error}", dir.display()))
    })?;
    let mut entries: Vec<PathBuf> = reader
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    entries.sort();
    Ok(entries)
}
