//! The reconciliation engine.
//!
//! A single actor task owns the tree, the projector, the sourcemap writer,
//! and the watcher, and consumes one queue of events: inbound editor
//! messages and debounced local file changes. All mutation happens
//! sequentially here — reparenting and index upserts are not idempotent
//! under interleaving — and no error escapes the loop; failures become log
//! lines and, where applicable, `error` replies.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;

use datamodel::{InstanceEntry, InstanceId, InstanceNode, InstanceTree};

use crate::config::Config;
use crate::projector::Projector;
use crate::protocol::{Incoming, Outgoing};
use crate::server::OutboundSender;
use crate::sourcemap::SourcemapWriter;
use crate::watcher::{ScriptWatcher, WatchedChange};

/// Everything the reconciler reacts to, in arrival order.
#[derive(Debug)]
pub enum Event {
    Editor(Incoming),
    FileChanged(WatchedChange),
    Shutdown,
}

pub struct Reconciler {
    config: Config,
    tree: InstanceTree,
    projector: Projector,
    sourcemap: SourcemapWriter,
    watcher: Option<ScriptWatcher>,
    outbound: OutboundSender,
    event_rx: mpsc::UnboundedReceiver<Event>,
    event_tx: mpsc::UnboundedSender<Event>,
    /// Set when a sourcemap write failed; flushed on shutdown.
    sourcemap_dirty: bool,
}

impl Reconciler {
    pub fn new(
        config: Config,
        projector: Projector,
        sourcemap: SourcemapWriter,
        outbound: OutboundSender,
        event_rx: mpsc::UnboundedReceiver<Event>,
        event_tx: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            config,
            tree: InstanceTree::new(),
            projector,
            sourcemap,
            watcher: None,
            outbound,
            event_rx,
            event_tx,
            sourcemap_dirty: false,
        }
    }

    /// Runs until shutdown or until every event sender is gone.
    pub async fn run(mut self) {
        while let Some(event) = self.event_rx.recv().await {
            match event {
                Event::Editor(message) => self.handle_editor(message).await,
                Event::FileChanged(change) => self.handle_file_changed(change).await,
                Event::Shutdown => break,
            }
        }
        self.watcher = None;
        if self.sourcemap_dirty {
            self.regenerate_sourcemap();
        }
        tracing::info!("reconciler stopped");
    }

    async fn handle_editor(&mut self, message: Incoming) {
        match message {
            Incoming::FullSnapshot { data } => self.on_full_snapshot(data),
            Incoming::InstanceUpdated { data } => self.on_instance_updated(data),
            Incoming::ScriptChanged {
                id,
                path,
                class_name,
                source,
            } => self.on_script_changed(id, path, class_name, source),
            Incoming::Deleted { id } => self.on_deleted(id),
            Incoming::Ping => self.outbound.send(&Outgoing::Pong).await,
            Incoming::ClientDisconnect => {
                tracing::info!("editor requested disconnect");
                self.outbound.disconnect_all().await;
            }
            Incoming::PushConfig { .. } => {
                tracing::debug!("ignoring push config outside push mode");
            }
        }
    }

    fn on_full_snapshot(&mut self, mut data: Vec<InstanceEntry>) {
        data.retain(|entry| !self.entry_is_excluded(entry));
        let stats = self.tree.apply_full_snapshot(data);
        self.projector.reset_mappings();

        let scripts = self.collect_scripts_for_write(None);
        let script_count = scripts.len();
        for (node, as_container) in scripts {
            self.project_script(&node, as_container);
        }

        if self.config.delete_orphans_on_connect {
            let removed = self.projector.clean_orphans();
            if removed > 0 {
                tracing::info!(removed, "removed orphaned script files");
            }
        }

        self.ensure_watcher();
        self.regenerate_sourcemap();
        tracing::info!(
            applied = stats.applied,
            dropped = stats.dropped,
            scripts = script_count,
            "applied full snapshot"
        );
    }

    fn on_script_changed(
        &mut self,
        id: InstanceId,
        path: Vec<String>,
        class_name: String,
        source: String,
    ) {
        if path.first().is_some_and(|service| {
            self.config.is_service_excluded(service)
        }) {
            tracing::debug!(%id, "dropping script change in excluded service");
            return;
        }

        if self.tree.update_script_source(&id, source.clone()).is_err() {
            // First sighting of this script; upsert it from the message.
            let name = path.last().cloned().unwrap_or_default();
            self.tree.update_instance(InstanceEntry {
                id: id.clone(),
                class_name,
                name,
                path,
                source: Some(source),
            });
        }

        let Some((node, as_container)) = self.script_for_write(&id) else {
            return;
        };
        self.project_script(&node, as_container);

        // Path and class are unchanged, so this is an in-place index update.
        if let Err(error) = self
            .sourcemap
            .upsert(&self.tree, &self.projector, &node, None, false)
        {
            tracing::warn!(%error, "incremental sourcemap update failed; regenerating");
            self.regenerate_sourcemap();
        }
    }

    fn on_instance_updated(&mut self, entry: InstanceEntry) {
        if self.entry_is_excluded(&entry) {
            tracing::debug!(id = %entry.id, "dropping update in excluded service");
            return;
        }

        let update = self.tree.update_instance(entry);
        let moved = update.path_changed || update.name_changed;

        // The node itself when it is a script, plus every script descendant
        // when the subtree moved.
        let scripts = if moved {
            self.collect_scripts_for_write(Some(&update.id))
        } else {
            self.script_for_write(&update.id).into_iter().collect()
        };

        // Project the batch first; files left behind at superseded paths
        // are deleted only for scripts whose new write succeeded, and only
        // after the whole batch is on disk.
        let mut stale: Vec<PathBuf> = Vec::new();
        for (node, as_container) in scripts {
            let previous = self.projector.path_for(&node.id).map(PathBuf::from);
            if !self.project_script(&node, as_container) {
                continue;
            }
            if let Some(previous) = previous {
                if self.projector.path_for(&node.id) != Some(previous.as_path()) {
                    stale.push(previous);
                }
            }
        }
        for path in &stale {
            self.projector.remove_stale_file(path);
        }

        let is_script = self
            .tree
            .get(&update.id)
            .is_some_and(InstanceNode::is_script);
        if update.is_new || moved || is_script {
            let node = self.tree.get(&update.id).cloned();
            if let Some(node) = node {
                if let Err(error) = self.sourcemap.upsert(
                    &self.tree,
                    &self.projector,
                    &node,
                    update.prev_path.as_deref(),
                    update.is_new,
                ) {
                    tracing::warn!(%error, "incremental sourcemap update failed; regenerating");
                    self.regenerate_sourcemap();
                }
            }
        }

        // A new child can flip its script parent into container form; this
        // runs after the index upsert so the rebuilt parent subtree is not
        // duplicated by the append above.
        if update.is_new {
            self.reproject_parent(&update.id);
        }

        self.projector.sweep_empty_dirs();
    }

    fn on_deleted(&mut self, id: InstanceId) {
        // Capture affected script files before the tree forgets them.
        let captured: Vec<(InstanceId, Option<PathBuf>)> = self
            .tree
            .descendant_scripts(&id)
            .into_iter()
            .map(|node| {
                let mapped = self.projector.path_for(&node.id).map(PathBuf::from);
                (node.id.clone(), mapped)
            })
            .collect();

        let Some(removed) = self.tree.delete_instance(&id) else {
            tracing::debug!(%id, "delete for unknown instance");
            return;
        };
        let parent_id = self.tree.find_by_path(removed.parent_path()).map(|n| n.id.clone());

        for (script_id, mapped) in captured {
            if self.projector.remove_script(&script_id).is_none() {
                if let Some(path) = mapped {
                    self.projector.remove_file_at(&path);
                }
            }
        }

        match self.sourcemap.prune(&removed.path, Some(&removed.class_name)) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(path = ?removed.path, "sourcemap prune missed; regenerating");
                self.regenerate_sourcemap();
            }
            Err(error) => {
                tracing::warn!(%error, "sourcemap prune failed; regenerating");
                self.regenerate_sourcemap();
            }
        }

        // Losing its last child can flip a script parent back to file form.
        if let Some(parent_id) = parent_id {
            self.reproject_node(&parent_id);
        }
        self.projector.sweep_empty_dirs();
    }

    async fn handle_file_changed(&mut self, change: WatchedChange) {
        let Some(id) = self.projector.id_at(&change.path).cloned() else {
            tracing::debug!(path = %change.path.display(), "unmapped file changed; ignoring");
            return;
        };
        if let Err(error) = self.tree.update_script_source(&id, change.source.clone()) {
            tracing::warn!(%id, %error, "local edit for stale instance");
            return;
        }
        tracing::debug!(%id, path = %change.path.display(), "pushing local edit to editor");
        self.outbound
            .send(&Outgoing::PatchScript {
                id,
                source: change.source,
            })
            .await;
    }

    // -----------------------------------------------------------------------
    // Projection helpers
    // -----------------------------------------------------------------------

    /// Arms echo suppression and writes one script file. Returns whether
    /// the write landed, so callers know when a superseded path is safe to
    /// clean up.
    fn project_script(&mut self, node: &InstanceNode, as_container: bool) -> bool {
        if let Some(path) = self.projector.script_path(node, as_container) {
            if let Some(watcher) = &self.watcher {
                watcher.suppress_next_change(&path);
            }
        }
        match self.projector.write_script(node, as_container) {
            Ok(_) => true,
            Err(error) => {
                tracing::warn!(id = %node.id, %error, "failed to project script");
                false
            }
        }
    }

    /// Clones the scripts to (re)write: the whole forest, or one subtree.
    fn collect_scripts_for_write(&self, root: Option<&InstanceId>) -> Vec<(InstanceNode, bool)> {
        let collect = |node: &InstanceNode| (node.clone(), !node.children.is_empty());
        match root {
            Some(id) => self
                .tree
                .descendant_scripts(id)
                .into_iter()
                .map(collect)
                .collect(),
            None => self
                .tree
                .nodes()
                .filter(|node| node.is_script())
                .map(collect)
                .collect(),
        }
    }

    fn script_for_write(&self, id: &InstanceId) -> Option<(InstanceNode, bool)> {
        let node = self.tree.get(id)?;
        node.is_script()
            .then(|| (node.clone(), !node.children.is_empty()))
    }

    /// Re-projects the parent of `id` when that parent is a script whose
    /// computed path may have flipped between file and container form.
    fn reproject_parent(&mut self, id: &InstanceId) {
        let parent_id = self.tree.parent_of(id).cloned();
        if let Some(parent_id) = parent_id {
            self.reproject_node(&parent_id);
        }
    }

    fn reproject_node(&mut self, id: &InstanceId) {
        let Some((node, as_container)) = self.script_for_write(id) else {
            return;
        };
        let computed = self.projector.script_path(&node, as_container);
        let mapped = self.projector.path_for(id).map(PathBuf::from);
        if computed.as_deref() == mapped.as_deref() {
            return;
        }
        if !self.project_script(&node, as_container) {
            return;
        }
        // The new form is on disk; the superseded file can go.
        if let Some(previous) = mapped {
            self.projector.remove_stale_file(&previous);
        }
        // The entry's filePaths changed with the flip; refresh it.
        if let Err(error) = self
            .sourcemap
            .upsert(&self.tree, &self.projector, &node, None, false)
        {
            tracing::warn!(%error, "incremental sourcemap update failed; regenerating");
            self.regenerate_sourcemap();
        }
    }

    fn regenerate_sourcemap(&mut self) {
        match self.sourcemap.generate(&self.tree, &self.projector) {
            Ok(()) => self.sourcemap_dirty = false,
            Err(error) => {
                self.sourcemap_dirty = true;
                tracing::warn!(%error, "failed to write sourcemap");
            }
        }
    }

    fn entry_is_excluded(&self, entry: &InstanceEntry) -> bool {
        entry
            .path
            .first()
            .is_some_and(|service| self.config.is_service_excluded(service))
    }

    /// Starts the watcher on the sync dir if it is not already running; a
    /// dead watcher is replaced on the next full snapshot.
    fn ensure_watcher(&mut self) {
        if self.watcher.is_some() {
            return;
        }
        let (change_tx, mut change_rx) = mpsc::unbounded_channel::<WatchedChange>();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(change) = change_rx.recv().await {
                if event_tx.send(Event::FileChanged(change)).is_err() {
                    break;
                }
            }
        });
        match ScriptWatcher::spawn(
            self.projector.sync_dir(),
            Duration::from_millis(self.config.file_watch_debounce),
            change_tx,
        ) {
            Ok(watcher) => {
                tracing::info!(dir = %self.projector.sync_dir().display(), "watching for local edits");
                self.watcher = Some(watcher);
            }
            Err(error) => {
                tracing::warn!(%error, "failed to start file watcher");
            }
        }
    }
}
