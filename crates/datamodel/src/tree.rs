//! The canonical in-memory forest.
//!
//! One primary map keyed by stable id, plus secondary indexes: logical path
//! -> id (so path lookup is O(1), never a scan), and id -> parent id (so
//! reparent detachment is O(1) without back-references on the nodes).
//! All mutation goes through the operations here; each one restores the
//! invariant that a node's path is its parent's path plus its own name.

use std::collections::{HashMap, HashSet};

use crate::error::{Result, TreeError};
use crate::id::InstanceId;
use crate::instance::{InstanceEntry, InstanceNode};

/// Counts for a full snapshot apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    pub applied: usize,
    pub dropped: usize,
}

/// Outcome of an instance upsert, as the reconciler needs to see it.
#[derive(Debug, Clone)]
pub struct InstanceUpdate {
    pub id: InstanceId,
    pub is_new: bool,
    /// The node's previous logical path, when the upsert moved it.
    pub prev_path: Option<Vec<String>>,
    pub path_changed: bool,
    pub name_changed: bool,
}

#[derive(Debug, Default)]
pub struct InstanceTree {
    nodes: HashMap<InstanceId, InstanceNode>,
    /// Occupants per logical path, in first-seen order. Siblings may share
    /// a name, so a path can hold several ids; disambiguation is always by
    /// identifier and a later arrival never displaces an earlier one.
    path_index: HashMap<Vec<String>, Vec<InstanceId>>,
    parents: HashMap<InstanceId, InstanceId>,
    roots: Vec<InstanceId>,
    /// Nodes whose parent has not arrived yet. They stay indexed by path so
    /// descendants can chain onto them; the whole chain attaches when the
    /// missing ancestor shows up.
    orphans: HashSet<InstanceId>,
}

impl InstanceTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &InstanceId) -> Option<&InstanceNode> {
        self.nodes.get(id)
    }

    pub fn parent_of(&self, id: &InstanceId) -> Option<&InstanceId> {
        self.parents.get(id)
    }

    pub fn has_children(&self, id: &InstanceId) -> bool {
        self.nodes
            .get(id)
            .is_some_and(|node| !node.children.is_empty())
    }

    /// O(1) lookup through the secondary path index. When same-named
    /// siblings occupy the path, the first-seen one is returned.
    pub fn find_by_path(&self, path: &[String]) -> Option<&InstanceNode> {
        self.path_index
            .get(path)?
            .iter()
            .find_map(|id| self.nodes.get(id))
    }

    /// Root services in first-seen order.
    pub fn roots(&self) -> impl Iterator<Item = &InstanceNode> {
        self.roots.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &InstanceNode> {
        self.nodes.values()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.path_index.clear();
        self.parents.clear();
        self.roots.clear();
        self.orphans.clear();
    }

    /// Replaces the entire forest from a snapshot.
    ///
    /// Entries are processed shallow-first so parents exist before their
    /// children regardless of wire order. An entry whose parent is absent
    /// (including transitively, via a dropped ancestor) is logged and
    /// dropped.
    pub fn apply_full_snapshot(&mut self, entries: Vec<InstanceEntry>) -> SnapshotStats {
        self.clear();

        let mut entries = entries;
        entries.sort_by_key(|entry| entry.path.len());

        // Pass 1: create every node and index it by path.
        let mut order: Vec<InstanceId> = Vec::with_capacity(entries.len());
        for entry in entries {
            let node = InstanceNode::from_entry(entry);
            self.index_path(node.path.clone(), node.id.clone());
            order.push(node.id.clone());
            self.nodes.insert(node.id.clone(), node);
        }

        // Pass 2: attach each node to the parent matching its path prefix.
        let mut stats = SnapshotStats::default();
        for id in order {
            let Some(node) = self.nodes.get(&id) else {
                // Same id appeared twice in the snapshot; the later entry won.
                continue;
            };
            if node.path.len() == 1 {
                self.roots.push(id);
                stats.applied += 1;
                continue;
            }
            let parent_path = node.parent_path().to_vec();
            match self.parent_candidate(&parent_path, &id) {
                Some(pid) => {
                    self.link_child(&pid, &id);
                    stats.applied += 1;
                }
                None => {
                    log::warn!(
                        "snapshot entry {} has no parent at {:?}; dropping",
                        id,
                        parent_path
                    );
                    self.remove_single(&id);
                    stats.dropped += 1;
                }
            }
        }
        stats
    }

    /// Upserts one instance by id.
    ///
    /// An existing node has its name, class, path, and (when supplied)
    /// source replaced; a path or name change detaches it and re-attaches
    /// under the parent matching the new path prefix, reindexing every
    /// descendant. A missing parent leaves the node orphaned until the
    /// parent arrives; implicit ancestors are never created here.
    pub fn update_instance(&mut self, entry: InstanceEntry) -> InstanceUpdate {
        let id = entry.id.clone();

        let Some(existing) = self.nodes.get(&id) else {
            let node = InstanceNode::from_entry(entry);
            self.index_path(node.path.clone(), id.clone());
            self.nodes.insert(id.clone(), node);
            self.attach(&id);
            self.reattach_orphans();
            return InstanceUpdate {
                id,
                is_new: true,
                prev_path: None,
                path_changed: false,
                name_changed: false,
            };
        };

        let (prev_path, prev_name) = (existing.path.clone(), existing.name.clone());
        let path_changed = prev_path != entry.path;
        let name_changed = prev_name != entry.name;

        if path_changed {
            self.unindex_subtree(&id);
            self.detach(&id);
        }

        if let Some(node) = self.nodes.get_mut(&id) {
            node.class_name = entry.class_name;
            node.name = entry.name;
            // A rename/reparent message may omit the body; never let it
            // erase a source the tree already holds.
            if entry.source.is_some() {
                node.source = entry.source;
            }
        }

        if path_changed {
            self.reindex_subtree(&id, entry.path);
            self.attach(&id);
            self.reattach_orphans();
        }

        InstanceUpdate {
            id,
            is_new: false,
            prev_path: path_changed.then_some(prev_path),
            path_changed,
            name_changed,
        }
    }

    /// Replaces a script node's source body. No reparenting.
    pub fn update_script_source(&mut self, id: &InstanceId, source: String) -> Result<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| TreeError::UnknownInstance(id.clone()))?;
        if !node.is_script() {
            return Err(TreeError::NotAScript(id.clone()));
        }
        node.source = Some(source);
        Ok(())
    }

    /// Removes a node and all its descendants, returning the removed node.
    pub fn delete_instance(&mut self, id: &InstanceId) -> Option<InstanceNode> {
        if !self.nodes.contains_key(id) {
            return None;
        }
        self.detach(id);

        let subtree = self.subtree_ids(id);
        let mut removed_root = None;
        for member in subtree {
            if let Some(node) = self.nodes.remove(&member) {
                self.unindex_path(&node.path, &member);
                if member == *id {
                    removed_root = Some(node);
                }
            }
            self.parents.remove(&member);
            self.orphans.remove(&member);
        }
        removed_root
    }

    /// Script nodes in the subtree rooted at `id`, pre-order, the root
    /// itself included when it is a script.
    pub fn descendant_scripts(&self, id: &InstanceId) -> Vec<&InstanceNode> {
        let mut scripts = Vec::new();
        for member in self.subtree_ids(id) {
            if let Some(node) = self.nodes.get(&member) {
                if node.is_script() {
                    scripts.push(node);
                }
            }
        }
        scripts
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Pre-order id list of the subtree rooted at `id` (root first).
    fn subtree_ids(&self, id: &InstanceId) -> Vec<InstanceId> {
        let mut out = Vec::new();
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                // Reverse so the stack pops children in declared order.
                for child in node.children.iter().rev() {
                    stack.push(child.clone());
                }
                out.push(current);
            }
        }
        out
    }

    fn link_child(&mut self, parent: &InstanceId, child: &InstanceId) {
        self.parents.insert(child.clone(), parent.clone());
        if let Some(node) = self.nodes.get_mut(parent) {
            if !node.children.contains(child) {
                node.children.push(child.clone());
            }
        }
    }

    /// Records one occupant for a path; earlier occupants are kept.
    fn index_path(&mut self, path: Vec<String>, id: InstanceId) {
        let occupants = self.path_index.entry(path).or_default();
        if !occupants.contains(&id) {
            occupants.push(id);
        }
    }

    /// Drops one occupant from a path, removing the slot when it empties.
    fn unindex_path(&mut self, path: &[String], id: &InstanceId) {
        let Some(occupants) = self.path_index.get_mut(path) else {
            return;
        };
        occupants.retain(|occupant| occupant != id);
        if occupants.is_empty() {
            self.path_index.remove(path);
        }
    }

    /// First live occupant of `parent_path` other than `child` itself.
    fn parent_candidate(&self, parent_path: &[String], child: &InstanceId) -> Option<InstanceId> {
        self.path_index
            .get(parent_path)?
            .iter()
            .find(|occupant| *occupant != child && self.nodes.contains_key(*occupant))
            .cloned()
    }

    /// Attaches a node under the parent matching its path prefix, or records
    /// it as a root / orphan.
    fn attach(&mut self, id: &InstanceId) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        if node.path.len() == 1 {
            if !self.roots.contains(id) {
                self.roots.push(id.clone());
            }
            self.orphans.remove(id);
            return;
        }
        let parent_path = node.parent_path().to_vec();
        match self.parent_candidate(&parent_path, id) {
            Some(pid) => {
                self.link_child(&pid, id);
                self.orphans.remove(id);
            }
            None => {
                log::warn!(
                    "no parent at {:?} for instance {}; holding as orphan",
                    parent_path,
                    id
                );
                self.orphans.insert(id.clone());
            }
        }
    }

    /// Detaches a node from its parent (or the root list) without touching
    /// its subtree.
    fn detach(&mut self, id: &InstanceId) {
        if let Some(parent) = self.parents.remove(id) {
            if let Some(node) = self.nodes.get_mut(&parent) {
                node.children.retain(|child| child != id);
            }
        } else {
            self.roots.retain(|root| root != id);
        }
    }

    /// Removes the subtree's entries from the path index (old paths).
    fn unindex_subtree(&mut self, id: &InstanceId) {
        for member in self.subtree_ids(id) {
            let path = match self.nodes.get(&member) {
                Some(node) => node.path.clone(),
                None => continue,
            };
            self.unindex_path(&path, &member);
        }
    }

    /// Rewrites the subtree's paths from a new root path and reindexes them.
    fn reindex_subtree(&mut self, id: &InstanceId, new_path: Vec<String>) {
        let children = match self.nodes.get_mut(id) {
            Some(node) => {
                node.path = new_path.clone();
                node.children.clone()
            }
            None => return,
        };
        self.index_path(new_path.clone(), id.clone());
        for child in children {
            let child_name = match self.nodes.get(&child) {
                Some(node) => node.name.clone(),
                None => continue,
            };
            let mut child_path = new_path.clone();
            child_path.push(child_name);
            self.reindex_subtree(&child, child_path);
        }
    }

    /// Attaches any orphans whose parent path now resolves; chains until no
    /// further orphan can be placed.
    fn reattach_orphans(&mut self) {
        loop {
            let mut candidates: Vec<InstanceId> = Vec::new();
            for id in &self.orphans {
                let Some(node) = self.nodes.get(id) else {
                    continue;
                };
                let attachable =
                    node.path.len() == 1 || self.parent_candidate(node.parent_path(), id).is_some();
                if attachable {
                    candidates.push(id.clone());
                }
            }
            if candidates.is_empty() {
                return;
            }
            for id in candidates {
                self.attach(&id);
            }
        }
    }

    /// Drops one node from every structure (snapshot pass 2 rejection).
    fn remove_single(&mut self, id: &InstanceId) {
        if let Some(node) = self.nodes.remove(id) {
            self.unindex_path(&node.path, id);
        }
        self.parents.remove(id);
        self.orphans.remove(id);
    }
}
