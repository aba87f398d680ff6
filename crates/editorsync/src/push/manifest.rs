//! Project-manifest (rojo-compatible) mode for the one-shot projectors.
//!
//! A manifest is a JSON file whose `tree` mirrors the editor hierarchy.
//! Keys starting with `$` are metadata (`$className`, `$path`, `$ignore`);
//! every other key declares a child node. A `$path` mounts a filesystem
//! directory whose contents merge in under plain-mode rules, except that
//! nodes the manifest declares at that level win over the walk, and a
//! subdirectory holding its own manifest is a nested project boundary.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;

use datamodel::{codec, InstanceEntry, InstanceId};

use crate::error::{Result, SyncError};
use crate::push::walk;

pub const DEFAULT_PROJECT_FILE: &str = "default.project.json";

/// Absolute-path globs always excluded from filesystem merges.
const DEFAULT_IGNORE_GLOBS: [&str; 5] = [
    "**/.git",
    "**/.git/**",
    "**/sourcemap.json",
    "**/*.lock",
    "**/~$*",
];

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectManifest {
    #[serde(default)]
    pub name: Option<String>,
    pub tree: ManifestNode,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestNode {
    #[serde(rename = "$className")]
    pub class_name: Option<String>,
    #[serde(rename = "$path")]
    pub path: Option<String>,
    #[serde(rename = "$ignore", default)]
    pub ignore: Vec<String>,
    #[serde(flatten)]
    rest: BTreeMap<String, serde_json::Value>,
}

impl ManifestNode {
    /// Child declarations: every non-`$` key, in lexical order. Metadata
    /// keys this daemon does not model are skipped, not errors.
    pub fn children(&self) -> Vec<(String, ManifestNode)> {
        self.rest
            .iter()
            .filter(|(key, _)| !key.starts_with('$'))
            .filter_map(|(key, value)| {
                match serde_json::from_value::<ManifestNode>(value.clone()) {
                    Ok(node) => Some((key.clone(), node)),
                    Err(error) => {
                        tracing::warn!(key, %error, "unreadable manifest node; skipping");
                        None
                    }
                }
            })
            .collect()
    }
}

pub fn load_manifest(path: &Path) -> Result<ProjectManifest> {
    let data = fs::read_to_string(path).map_err(|error| {
        SyncError::Project(format!("failed to read manifest {}: {error}", path.display()))
    })?;
    serde_json::from_str(&data).map_err(|error| {
        SyncError::Project(format!("failed to parse manifest {}: {error}", path.display()))
    })
}

/// Builds the full entry list a manifest describes.
///
/// Also returns every filesystem directory the manifest mounted, so callers
/// can find loose scripts the manifest does not cover.
pub fn build_from_manifest(
    manifest_path: &Path,
) -> Result<(Vec<InstanceEntry>, Vec<PathBuf>)> {
    let manifest = load_manifest(manifest_path)?;
    let base_dir = manifest_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut out = Vec::new();
    let mut mounted = Vec::new();
    for (name, node) in manifest.tree.children() {
        emit_node(
            &base_dir,
            vec![name],
            &node,
            &manifest.tree.ignore,
            &mut out,
            &mut mounted,
        )?;
    }
    walk::sort_entries(&mut out);
    Ok((out, mounted))
}

/// Emits one manifest node (and, transitively, its children and any
/// mounted filesystem contents).
fn emit_node(
    base_dir: &Path,
    path: Vec<String>,
    node: &ManifestNode,
    inherited_ignore: &[String],
    out: &mut Vec<InstanceEntry>,
    mounted: &mut Vec<PathBuf>,
) -> Result<()> {
    let name = path.last().cloned().unwrap_or_default();

    // Root services without an explicit class are classed by their own
    // name; deeper unclassed nodes are folders.
    let default_class = if path.len() == 1 {
        name.clone()
    } else {
        "Folder".to_string()
    };

    let mut ignore_patterns: Vec<String> = inherited_ignore.to_vec();
    ignore_patterns.extend(node.ignore.iter().cloned());

    let mut class_name = node.class_name.clone();
    let mut source = None;

    let fs_path = node.path.as_ref().map(|p| base_dir.join(p));
    if let Some(fs_path) = &fs_path {
        if fs_path.is_dir() {
            // An init script in the mounted directory gives the node its
            // class and body, unless the manifest pinned a class.
            if let Some(init) = walk::detect_init(fs_path)? {
                if class_name.is_none() {
                    class_name = Some(init.kind.class_name().to_string());
                }
                source = Some(init.source);
            }
        } else if fs_path.is_file() {
            if let Some((kind, _)) = fs_path
                .file_name()
                .and_then(|file_name| file_name.to_str())
                .and_then(codec::classify_file_name)
            {
                if class_name.is_none() {
                    class_name = Some(kind.class_name().to_string());
                }
                source = Some(fs::read_to_string(fs_path).map_err(|error| {
                    SyncError::Project(format!(
                        "failed to read {}: {error}",
                        fs_path.display()
                    ))
                })?);
            }
        } else {
            return Err(SyncError::Project(format!(
                "manifest path does not exist: {}",
                fs_path.display()
            )));
        }
    }

    out.push(InstanceEntry {
        id: InstanceId::generate(),
        class_name: class_name.unwrap_or(default_class),
        name,
        path: path.clone(),
        source,
    });

    let declared: Vec<(String, ManifestNode)> = node.children();

    if let Some(fs_path) = &fs_path {
        if fs_path.is_dir() {
            mounted.push(fs_path.clone());
            let declared_names: HashSet<&str> =
                declared.iter().map(|(name, _)| name.as_str()).collect();
            merge_directory(
                fs_path,
                &path,
                &ignore_patterns,
                &declared_names,
                out,
                mounted,
            )?;
        }
    }

    for (child_name, child_node) in declared {
        let mut child_path = path.clone();
        child_path.push(child_name);
        emit_node(base_dir, child_path, &child_node, &ignore_patterns, out, mounted)?;
    }

    Ok(())
}

/// Merges a mounted directory's contents under `prefix`, skipping names the
/// manifest declares at this level and honoring nested project boundaries.
fn merge_directory(
    dir: &Path,
    prefix: &[String],
    ignore_patterns: &[String],
    declared_names: &HashSet<&str>,
    out: &mut Vec<InstanceEntry>,
    mounted: &mut Vec<PathBuf>,
) -> Result<()> {
    let ignore = compile_ignore(ignore_patterns)?;
    let reader = fs::read_dir(dir).map_err(|error| {
        SyncError::Project(format!("failed to read directory {}: {error}", dir.display()))
    })?;
    let mut children: Vec<PathBuf> = reader
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    children.sort();

    for child in children {
        if ignore.is_match(&child) {
            continue;
        }
        if child.is_dir() {
            let Some(dir_name) = child.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if declared_names.contains(dir_name) {
                continue;
            }
            let mut child_path = prefix.to_vec();
            child_path.push(dir_name.to_string());

            let nested_manifest = child.join(DEFAULT_PROJECT_FILE);
            if nested_manifest.is_file() {
                // Nested project: its own tree supplies this node; the
                // parent walk does not descend further.
                let nested = load_manifest(&nested_manifest)?;
                emit_node(&child, child_path, &nested.tree, ignore_patterns, out, mounted)?;
                continue;
            }

            let init = walk::detect_init(&child)?;
            let entry = match &init {
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
            out.push(entry);
            merge_directory(&child, &child_path, ignore_patterns, &HashSet::new(), out, mounted)?;
        } else if child.is_file() && codec::is_script_file(&child) {
            let Some(file_name) = child.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Some((kind, name)) = codec::classify_file_name(file_name) else {
                continue;
            };
            if codec::is_init_name(&name) || declared_names.contains(name.as_str()) {
                continue;
            }
            let source = fs::read_to_string(&child).map_err(|error| {
                SyncError::Project(format!("failed to read {}: {error}", child.display()))
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

/// Default ignore set plus manifest `$ignore` patterns, matched against
/// absolute paths.
pub fn compile_ignore(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in DEFAULT_IGNORE_GLOBS.iter().copied() {
        builder.add(
            Glob::new(pattern)
                .map_err(|error| SyncError::Project(format!("bad ignore glob: {error}")))?,
        );
    }
    for pattern in patterns {
        let absolute = if pattern.starts_with("**") || pattern.starts_with('/') {
            pattern.clone()
        } else {
            format!("**/{pattern}")
        };
        builder.add(Glob::new(&absolute).map_err(|error| {
            SyncError::Project(format!("bad $ignore glob {pattern}: {error}"))
        })?);
    }
    builder
        .build()
        .map_err(|error| SyncError::Project(format!("failed to build ignore set: {error}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn paths(entries: &[InstanceEntry]) -> Vec<String> {
        entries.iter().map(|entry| entry.path.join("/")).collect()
    }

    fn by_path<'a>(entries: &'a [InstanceEntry], path: &str) -> &'a InstanceEntry {
        entries
            .iter()
            .find(|entry| entry.path.join("/") == path)
            .unwrap_or_else(|| panic!("no entry at {path}"))
    }

    #[test]
    fn manifest_tree_emits_services_and_mounted_files() {
        let dir = tempdir().expect("tempdir");
        let packages = dir.path().join("Packages");
        fs::create_dir(&packages).expect("mkdir");
        fs::write(packages.join("Util.lua"), "return {}\n").expect("write");

        let manifest_path = dir.path().join(DEFAULT_PROJECT_FILE);
        fs::write(
            &manifest_path,
            r#"{
                "name": "demo",
                "tree": {
                    "ReplicatedStorage": {
                        "$className": "ReplicatedStorage",
                        "Packages": { "$path": "Packages" }
                    }
                }
            }"#,
        )
        .expect("write manifest");

        let (entries, mounted) = build_from_manifest(&manifest_path).expect("build");
        assert_eq!(
            paths(&entries),
            vec![
                "ReplicatedStorage",
                "ReplicatedStorage/Packages",
                "ReplicatedStorage/Packages/Util",
            ]
        );
        assert_eq!(by_path(&entries, "ReplicatedStorage").class_name, "ReplicatedStorage");
        assert_eq!(by_path(&entries, "ReplicatedStorage/Packages").class_name, "Folder");
        let util = by_path(&entries, "ReplicatedStorage/Packages/Util");
        assert_eq!(util.class_name, "ModuleScript");
        assert_eq!(util.source.as_deref(), Some("return {}\n"));
        assert_eq!(mounted, vec![packages]);
    }

    #[test]
    fn root_without_class_uses_its_own_name() {
        let dir = tempdir().expect("tempdir");
        let manifest_path = dir.path().join(DEFAULT_PROJECT_FILE);
        fs::write(
            &manifest_path,
            r#"{ "tree": { "ServerScriptService": {}, "Workspace": { "Deep": {} } } }"#,
        )
        .expect("write manifest");

        let (entries, _) = build_from_manifest(&manifest_path).expect("build");
        assert_eq!(by_path(&entries, "ServerScriptService").class_name, "ServerScriptService");
        assert_eq!(by_path(&entries, "Workspace/Deep").class_name, "Folder");
    }

    #[test]
    fn declared_nodes_win_over_the_filesystem_walk() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("src");
        fs::create_dir(&src).expect("mkdir");
        fs::write(src.join("Config.lua"), "-- from disk\n").expect("write");

        let manifest_path = dir.path().join(DEFAULT_PROJECT_FILE);
        fs::write(
            &manifest_path,
            r#"{
                "tree": {
                    "ReplicatedStorage": {
                        "$className": "ReplicatedStorage",
                        "$path": "src",
                        "Config": { "$className": "Configuration" }
                    }
                }
            }"#,
        )
        .expect("write manifest");

        let (entries, _) = build_from_manifest(&manifest_path).expect("build");
        let configs: Vec<&InstanceEntry> = entries
            .iter()
            .filter(|entry| entry.path.join("/") == "ReplicatedStorage/Config")
            .collect();
        assert_eq!(configs.len(), 1, "declared entry must not be re-emitted");
        assert_eq!(configs[0].class_name, "Configuration");
    }

    #[test]
    fn mounted_init_script_classes_the_node() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("src");
        fs::create_dir(&src).expect("mkdir");
        fs::write(src.join("init.server.luau"), "boot()\n").expect("write");

        let manifest_path = dir.path().join(DEFAULT_PROJECT_FILE);
        fs::write(
            &manifest_path,
            r#"{ "tree": { "Workspace": { "Boot": { "$path": "src" } } } }"#,
        )
        .expect("write manifest");

        let (entries, _) = build_from_manifest(&manifest_path).expect("build");
        let boot = by_path(&entries, "Workspace/Boot");
        assert_eq!(boot.class_name, "Script");
        assert_eq!(boot.source.as_deref(), Some("boot()\n"));
    }

    #[test]
    fn ignore_globs_filter_mounted_content() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("vendor")).expect("mkdir");
        fs::write(src.join("Keep.lua"), "k\n").expect("write");
        fs::write(src.join("vendor/Skip.lua"), "s\n").expect("write");

        let manifest_path = dir.path().join(DEFAULT_PROJECT_FILE);
        fs::write(
            &manifest_path,
            r#"{
                "tree": {
                    "S": {
                        "$className": "Folder",
                        "$path": "src",
                        "$ignore": ["vendor"]
                    }
                }
            }"#,
        )
        .expect("write manifest");

        let (entries, _) = build_from_manifest(&manifest_path).expect("build");
        assert_eq!(paths(&entries), vec!["S", "S/Keep"]);
    }

    #[test]
    fn nested_project_cuts_off_the_parent_walk() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("src");
        let sub = src.join("Subproj");
        fs::create_dir_all(&sub).expect("mkdir");
        fs::write(src.join("Top.lua"), "t\n").expect("write");
        fs::write(sub.join("Hidden.lua"), "h\n").expect("write");
        fs::write(
            sub.join(DEFAULT_PROJECT_FILE),
            r#"{ "tree": { "$className": "Folder", "Inner": { "$className": "Configuration" } } }"#,
        )
        .expect("write nested manifest");

        let manifest_path = dir.path().join(DEFAULT_PROJECT_FILE);
        fs::write(
            &manifest_path,
            r#"{ "tree": { "S": { "$className": "Folder", "$path": "src" } } }"#,
        )
        .expect("write manifest");

        let (entries, _) = build_from_manifest(&manifest_path).expect("build");
        assert_eq!(
            paths(&entries),
            vec!["S", "S/Subproj", "S/Top", "S/Subproj/Inner"]
        );
        // The nested tree defines the node, not the parent's walk.
        assert!(entries.iter().all(|entry| entry.path.join("/") != "S/Subproj/Hidden"));
        assert_eq!(by_path(&entries, "S/Subproj/Inner").class_name, "Configuration");
    }

    #[test]
    fn default_ignores_cover_tooling_files() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("src");
        fs::create_dir_all(src.join(".git")).expect("mkdir");
        fs::write(src.join(".git/HEAD.lua"), "x\n").expect("write");
        fs::write(src.join("Real.lua"), "r\n").expect("write");

        let manifest_path = dir.path().join(DEFAULT_PROJECT_FILE);
        fs::write(
            &manifest_path,
            r#"{ "tree": { "S": { "$className": "Folder", "$path": "src" } } }"#,
        )
        .expect("write manifest");

        let (entries, _) = build_from_manifest(&manifest_path).expect("build");
        assert_eq!(paths(&entries), vec!["S", "S/Real"]);
    }
}
