//! The external index ("sourcemap") consumed by language tooling.
//!
//! A JSON document mirroring the tree: every entry carries the logical name
//! and class, script entries carry their file path relative to the working
//! directory, containers carry children. Supports full regeneration from the
//! tree plus incremental upsert/prune so routine edits do not rewrite the
//! world; any incremental failure falls back to regeneration at the caller.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use datamodel::{InstanceNode, InstanceTree};

use crate::error::{Result, SyncError};
use crate::projector::Projector;

/// One node of the index document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcemapEntry {
    pub name: String,
    pub class_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_paths: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<SourcemapEntry>>,
}

impl SourcemapEntry {
    /// The synthetic document root.
    fn game_root() -> Self {
        Self {
            name: "Game".to_string(),
            class_name: "DataModel".to_string(),
            file_paths: None,
            children: Some(Vec::new()),
        }
    }

    fn children_mut(&mut self) -> &mut Vec<SourcemapEntry> {
        self.children.get_or_insert_with(Vec::new)
    }

    fn has_children(&self) -> bool {
        self.children.as_ref().is_some_and(|c| !c.is_empty())
    }

    fn has_file_paths(&self) -> bool {
        self.file_paths.as_ref().is_some_and(|p| !p.is_empty())
    }
}

pub struct SourcemapWriter {
    output_path: PathBuf,
    /// Base for relativizing file paths; the working directory in the
    /// daemon, injected in tests.
    base_dir: PathBuf,
}

impl SourcemapWriter {
    pub fn new(output_path: PathBuf, base_dir: PathBuf) -> Self {
        let base_dir = fs::canonicalize(&base_dir).unwrap_or(base_dir);
        Self {
            output_path,
            base_dir,
        }
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Regenerates the whole document from the tree.
    ///
    /// Children are found through a single-pass `parent path -> nodes`
    /// grouping rather than per-node scans; a visited-path set drops (and
    /// logs) any cycle a bad update may have introduced.
    pub fn generate(&self, tree: &InstanceTree, projector: &Projector) -> Result<()> {
        let mut by_parent: HashMap<&[String], Vec<&InstanceNode>> = HashMap::new();
        for node in tree.nodes() {
            if node.path.len() > 1 {
                by_parent.entry(node.parent_path()).or_default().push(node);
            }
        }
        for group in by_parent.values_mut() {
            group.sort_by(|a, b| (&a.name, &a.class_name).cmp(&(&b.name, &b.class_name)));
        }

        let mut root = SourcemapEntry::game_root();
        let mut visited = HashSet::new();
        let mut services: Vec<&InstanceNode> = tree.roots().collect();
        services.sort_by(|a, b| (&a.name, &a.class_name).cmp(&(&b.name, &b.class_name)));
        for service in services {
            if let Some(entry) = self.build_entry(service, &by_parent, projector, &mut visited) {
                root.children_mut().push(entry);
            }
        }
        self.write_document(&root)
    }

    /// Upserts the subtree rooted at `node` into the on-disk document.
    ///
    /// `old_path` prunes the node's previous location first (rename or
    /// reparent). Missing intermediate ancestors get placeholder entries;
    /// at the leaf an entry of the same name and class is replaced, while
    /// `is_new` always appends so same-named siblings survive.
    pub fn upsert(
        &self,
        tree: &InstanceTree,
        projector: &Projector,
        node: &InstanceNode,
        old_path: Option<&[String]>,
        is_new: bool,
    ) -> Result<()> {
        let mut root = self.read_document()?;

        if let Some(old) = old_path {
            if old != node.path.as_slice() {
                prune_path(&mut root, old, None);
            }
        }

        let entry = self.build_subtree(node, tree, projector, &mut HashSet::new());

        // Descend to the parent level, creating placeholders as needed.
        let classes = ancestor_classes(tree, node);
        let parent = descend_to_parent(&mut root, tree, &classes, &node.path, 0);
        let children = parent.children_mut();
        let replace_at = if is_new {
            None
        } else {
            children
                .iter()
                .position(|c| c.name == entry.name && c.class_name == entry.class_name)
        };
        match replace_at {
            Some(index) => children[index] = entry,
            None => children.push(entry),
        }

        self.write_document(&root)
    }

    /// Removes the subtree at `path`, matching the terminal entry by name
    /// and (when given) class, then unwinds now-childless ancestors that
    /// carry no file paths. Returns whether anything was removed.
    pub fn prune(&self, path: &[String], class_name: Option<&str>) -> Result<bool> {
        let mut root = self.read_document()?;
        let found = prune_path(&mut root, path, class_name);
        if found {
            // The document root always keeps a children array, even empty.
            if root.children.is_none() {
                root.children = Some(Vec::new());
            }
            self.write_document(&root)?;
        }
        Ok(found)
    }

    fn build_entry(
        &self,
        node: &InstanceNode,
        by_parent: &HashMap<&[String], Vec<&InstanceNode>>,
        projector: &Projector,
        visited: &mut HashSet<Vec<String>>,
    ) -> Option<SourcemapEntry> {
        if !visited.insert(node.path.clone()) {
            tracing::warn!(path = ?node.path, "cycle in tree while generating sourcemap; dropping");
            return None;
        }
        let mut entry = self.leaf_entry(node, projector);
        if let Some(group) = by_parent.get(node.path.as_slice()) {
            let children: Vec<SourcemapEntry> = group
                .iter()
                .filter_map(|child| self.build_entry(child, by_parent, projector, visited))
                .collect();
            if !children.is_empty() {
                entry.children = Some(children);
            }
        }
        Some(entry)
    }

    fn build_subtree(
        &self,
        node: &InstanceNode,
        tree: &InstanceTree,
        projector: &Projector,
        visited: &mut HashSet<Vec<String>>,
    ) -> SourcemapEntry {
        let mut entry = self.leaf_entry(node, projector);
        if !visited.insert(node.path.clone()) {
            return entry;
        }
        let children: Vec<SourcemapEntry> = node
            .children
            .iter()
            .filter_map(|id| tree.get(id))
            .map(|child| self.build_subtree(child, tree, projector, visited))
            .collect();
        if !children.is_empty() {
            entry.children = Some(children);
        }
        entry
    }

    fn leaf_entry(&self, node: &InstanceNode, projector: &Projector) -> SourcemapEntry {
        let file_paths = node
            .is_script()
            .then(|| projector.path_for(&node.id))
            .flatten()
            .map(|path| vec![self.relativize(path)]);
        SourcemapEntry {
            name: node.name.clone(),
            class_name: node.class_name.clone(),
            file_paths,
            children: None,
        }
    }

    fn relativize(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.base_dir).unwrap_or(path);
        let segments: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        segments.join("/")
    }

    fn read_document(&self) -> Result<SourcemapEntry> {
        let data = match fs::read_to_string(&self.output_path) {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SourcemapEntry::game_root());
            }
            Err(error) => return Err(error.into()),
        };
        serde_json::from_str(&data)
            .map_err(|error| SyncError::Sourcemap(format!("unreadable index document: {error}")))
    }

    /// Atomic replace: pretty-printed two-space JSON with a trailing
    /// newline, written to a temp file and renamed into place.
    fn write_document(&self, root: &SourcemapEntry) -> Result<()> {
        let mut data = serde_json::to_string_pretty(root)?;
        data.push('\n');
        let tmp_path = self.output_path.with_extension("tmp");
        fs::write(&tmp_path, data).map_err(|source| SyncError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        fs::rename(&tmp_path, &self.output_path).map_err(|source| SyncError::Write {
            path: self.output_path.clone(),
            source,
        })?;
        Ok(())
    }
}

/// Classes of a node's ancestors, indexed by depth along its path, resolved
/// through the id parent chain. A path lookup cannot disambiguate
/// same-named siblings, so it is never used for ancestors the chain covers;
/// gaps (an orphaned node) stay `None`.
fn ancestor_classes(tree: &InstanceTree, node: &InstanceNode) -> Vec<Option<String>> {
    let mut classes = vec![None; node.path.len().saturating_sub(1)];
    let mut depth = classes.len();
    let mut current = tree.parent_of(&node.id);
    while let Some(parent_id) = current {
        if depth == 0 {
            break;
        }
        depth -= 1;
        match tree.get(parent_id) {
            Some(parent) => {
                classes[depth] = Some(parent.class_name.clone());
                current = tree.parent_of(parent_id);
            }
            None => break,
        }
    }
    classes
}

/// Walks `root` down to the entry that should parent the node at
/// `full_path`, creating placeholder entries for missing intermediate
/// ancestors. Placeholder classes come from the node's resolved ancestor
/// chain; only where the chain has a gap does a path lookup fill in, and
/// "Folder" covers whatever remains unknown.
fn descend_to_parent<'a>(
    cursor: &'a mut SourcemapEntry,
    tree: &InstanceTree,
    ancestor_classes: &[Option<String>],
    full_path: &[String],
    depth: usize,
) -> &'a mut SourcemapEntry {
    if depth + 1 >= full_path.len() {
        return cursor;
    }
    let segment = &full_path[depth];
    let children = cursor.children_mut();
    let index = match children.iter().position(|child| child.name == *segment) {
        Some(index) => index,
        None => {
            let class_name = ancestor_classes
                .get(depth)
                .and_then(|class| class.clone())
                .or_else(|| {
                    tree.find_by_path(&full_path[..=depth])
                        .map(|ancestor| ancestor.class_name.clone())
                })
                .unwrap_or_else(|| "Folder".to_string());
            children.push(SourcemapEntry {
                name: segment.clone(),
                class_name,
                file_paths: None,
                children: Some(Vec::new()),
            });
            children.len() - 1
        }
    };
    descend_to_parent(&mut children[index], tree, ancestor_classes, full_path, depth + 1)
}

/// Removes the entry at `path` under `root`; unwinds empty ancestors.
fn prune_path(root: &mut SourcemapEntry, path: &[String], class_name: Option<&str>) -> bool {
    let Some((head, rest)) = path.split_first() else {
        return false;
    };
    let Some(children) = root.children.as_mut() else {
        return false;
    };

    if rest.is_empty() {
        let position = children.iter().position(|child| {
            child.name == *head && class_name.is_none_or(|class| child.class_name == class)
        });
        match position {
            Some(index) => {
                children.remove(index);
                if children.is_empty() {
                    root.children = None;
                }
                true
            }
            None => false,
        }
    } else {
        let Some(index) = children.iter().position(|child| child.name == *head) else {
            return false;
        };
        let found = prune_path(&mut children[index], rest, class_name);
        if found && !children[index].has_children() && !children[index].has_file_paths() {
            children.remove(index);
            if children.is_empty() {
                root.children = None;
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScriptExtension;
    use datamodel::{InstanceEntry, InstanceId};
    use tempfile::tempdir;

    fn entry(id: &str, class: &str, path: &[&str], source: Option<&str>) -> InstanceEntry {
        InstanceEntry {
            id: InstanceId::from(id),
            class_name: class.to_string(),
            name: path.last().map(|s| s.to_string()).unwrap_or_default(),
            path: path.iter().map(|s| s.to_string()).collect(),
            source: source.map(|s| s.to_string()),
        }
    }

    fn setup(dir: &Path) -> (InstanceTree, Projector, SourcemapWriter) {
        let mut tree = InstanceTree::new();
        tree.apply_full_snapshot(vec![
            entry("a0", "ReplicatedStorage", &["ReplicatedStorage"], None),
            entry("b0", "ModuleScript", &["ReplicatedStorage", "Foo"], Some("return 1\n")),
        ]);
        let mut projector =
            Projector::new(&dir.join("sync"), ScriptExtension::Luau).expect("projector");
        for node_id in ["b0"] {
            let node = tree.get(&InstanceId::from(node_id)).expect("node").clone();
            projector.write_script(&node, false).expect("write");
        }
        let writer = SourcemapWriter::new(dir.join("sourcemap.json"), dir.to_path_buf());
        (tree, projector, writer)
    }

    fn read(writer: &SourcemapWriter) -> serde_json::Value {
        let data = fs::read_to_string(writer.output_path()).expect("read sourcemap");
        assert!(data.ends_with('\n'), "missing trailing newline");
        serde_json::from_str(&data).expect("parse sourcemap")
    }

    #[test]
    fn generate_emits_game_root_with_relative_paths() {
        let dir = tempdir().expect("tempdir");
        let (tree, projector, writer) = setup(dir.path());
        writer.generate(&tree, &projector).expect("generate");

        let doc = read(&writer);
        assert_eq!(doc["name"], "Game");
        assert_eq!(doc["className"], "DataModel");
        let service = &doc["children"][0];
        assert_eq!(service["name"], "ReplicatedStorage");
        let foo = &service["children"][0];
        assert_eq!(foo["name"], "Foo");
        assert_eq!(foo["filePaths"][0], "sync/ReplicatedStorage/Foo.luau");
        assert!(service.get("filePaths").is_none());
    }

    #[test]
    fn generate_round_trips_through_its_own_output() {
        let dir = tempdir().expect("tempdir");
        let (tree, projector, writer) = setup(dir.path());
        writer.generate(&tree, &projector).expect("generate");
        let first = fs::read_to_string(writer.output_path()).expect("read");
        writer.generate(&tree, &projector).expect("regenerate");
        let second = fs::read_to_string(writer.output_path()).expect("read");
        assert_eq!(first, second);
    }

    #[test]
    fn upsert_into_missing_document_creates_placeholder_ancestors() {
        let dir = tempdir().expect("tempdir");
        let (mut tree, mut projector, writer) = setup(dir.path());
        tree.update_instance(entry(
            "c0",
            "Script",
            &["ReplicatedStorage", "Deep", "Leaf"],
            Some("x"),
        ));
        let node = tree.get(&InstanceId::from("c0")).expect("node").clone();
        projector.write_script(&node, false).expect("write");

        writer
            .upsert(&tree, &projector, &node, None, true)
            .expect("upsert");

        let doc = read(&writer);
        let service = &doc["children"][0];
        let deep = &service["children"][0];
        // Deep has no tree node, so the placeholder class falls back.
        assert_eq!(deep["name"], "Deep");
        assert_eq!(deep["className"], "Folder");
        assert_eq!(deep["children"][0]["name"], "Leaf");
    }

    #[test]
    fn placeholder_class_follows_the_id_parent_chain_past_twins() {
        let dir = tempdir().expect("tempdir");
        let mut tree = InstanceTree::new();
        tree.apply_full_snapshot(vec![entry("a0", "Folder", &["S"], None)]);
        tree.update_instance(entry("t0", "Configuration", &["S", "Twin"], None));
        tree.update_instance(entry("c0", "ModuleScript", &["S", "Twin", "Leaf"], Some("l")));
        // A same-named sibling arrives with a different class.
        tree.update_instance(entry("t1", "Folder", &["S", "Twin"], None));

        let mut projector =
            Projector::new(&dir.path().join("sync"), ScriptExtension::Luau).expect("projector");
        let leaf = tree.get(&InstanceId::from("c0")).expect("leaf").clone();
        projector.write_script(&leaf, false).expect("write");

        let writer = SourcemapWriter::new(dir.path().join("sourcemap.json"), dir.path().to_path_buf());
        writer
            .upsert(&tree, &projector, &leaf, None, true)
            .expect("upsert");

        // The placeholder is classed after the leaf's actual parent (t0),
        // not whatever a by-path lookup would pick.
        let doc = read(&writer);
        let twin = &doc["children"][0]["children"][0];
        assert_eq!(twin["name"], "Twin");
        assert_eq!(twin["className"], "Configuration");
    }

    #[test]
    fn upsert_replaces_matching_leaf_in_place() {
        let dir = tempdir().expect("tempdir");
        let (tree, projector, writer) = setup(dir.path());
        writer.generate(&tree, &projector).expect("generate");

        let node = tree.get(&InstanceId::from("b0")).expect("node");
        writer
            .upsert(&tree, &projector, node, None, false)
            .expect("upsert");

        let doc = read(&writer);
        let service = &doc["children"][0];
        let children = service["children"].as_array().expect("children");
        assert_eq!(children.len(), 1, "replace must not duplicate the entry");
    }

    #[test]
    fn upsert_with_old_path_moves_the_subtree() {
        let dir = tempdir().expect("tempdir");
        let (mut tree, mut projector, writer) = setup(dir.path());
        writer.generate(&tree, &projector).expect("generate");

        let mut renamed = entry("b0", "ModuleScript", &["ReplicatedStorage", "Bar"], Some("return 1\n"));
        renamed.name = "Bar".to_string();
        let update = tree.update_instance(renamed);
        let node = tree.get(&InstanceId::from("b0")).expect("node").clone();
        projector.write_script(&node, false).expect("write");

        writer
            .upsert(
                &tree,
                &projector,
                &node,
                update.prev_path.as_deref(),
                false,
            )
            .expect("upsert");

        let doc = read(&writer);
        let service = &doc["children"][0];
        let children = service["children"].as_array().expect("children");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0]["name"], "Bar");
    }

    #[test]
    fn is_new_appends_even_when_a_same_name_sibling_exists() {
        let dir = tempdir().expect("tempdir");
        let (mut tree, projector, writer) = setup(dir.path());
        writer.generate(&tree, &projector).expect("generate");

        tree.update_instance(entry("b1", "ModuleScript", &["ReplicatedStorage", "Foo"], Some("two")));
        let twin = tree.get(&InstanceId::from("b1")).expect("node").clone();
        writer
            .upsert(&tree, &projector, &twin, None, true)
            .expect("upsert");

        let doc = read(&writer);
        let children = doc["children"][0]["children"].as_array().expect("children");
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn prune_removes_leaf_and_unwinds_empty_ancestors() {
        let dir = tempdir().expect("tempdir");
        let (mut tree, mut projector, writer) = setup(dir.path());
        tree.update_instance(entry("f0", "Folder", &["ReplicatedStorage", "Pack"], None));
        tree.update_instance(entry(
            "c0",
            "ModuleScript",
            &["ReplicatedStorage", "Pack", "Util"],
            Some("u"),
        ));
        let util = tree.get(&InstanceId::from("c0")).expect("node").clone();
        projector.write_script(&util, false).expect("write");
        writer.generate(&tree, &projector).expect("generate");

        let path: Vec<String> = vec!["ReplicatedStorage".into(), "Pack".into(), "Util".into()];
        let found = writer.prune(&path, Some("ModuleScript")).expect("prune");
        assert!(found);

        let doc = read(&writer);
        let service_children = doc["children"][0]["children"].as_array().expect("children");
        // Pack became childless with no filePaths and unwound; Foo remains.
        assert_eq!(service_children.len(), 1);
        assert_eq!(service_children[0]["name"], "Foo");
    }

    #[test]
    fn prune_with_wrong_class_is_a_miss() {
        let dir = tempdir().expect("tempdir");
        let (tree, projector, writer) = setup(dir.path());
        writer.generate(&tree, &projector).expect("generate");

        let path: Vec<String> = vec!["ReplicatedStorage".into(), "Foo".into()];
        let found = writer.prune(&path, Some("Script")).expect("prune");
        assert!(!found);
    }

    #[test]
    fn corrupt_document_surfaces_as_error_for_regen_fallback() {
        let dir = tempdir().expect("tempdir");
        let (tree, projector, writer) = setup(dir.path());
        fs::write(writer.output_path(), "not json").expect("corrupt");

        let node = tree.get(&InstanceId::from("b0")).expect("node");
        let result = writer.upsert(&tree, &projector, node, None, false);
        assert!(result.is_err());
    }
}
