//! One-shot direction reversal: local disk -> editor.
//!
//! `push` solicits a push config from the editor (with a deadline), merges
//! it with CLI-supplied mappings, synthesizes a snapshot per mapping, sends
//! it, and exits after a short drain. `build` walks the sync dir (or a
//! project manifest) and seeds the editor with a `buildSnapshot`.

pub mod manifest;
pub mod walk;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use globset::GlobSet;
use tokio::sync::mpsc;
use tokio::time::timeout;

use datamodel::{codec, InstanceEntry, InstanceId};

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::protocol::{Incoming, Outgoing, PushMapping, PushSnapshotMapping};
use crate::reconciler::Event;
use crate::server::Endpoint;

/// How long to wait for the editor to connect and answer the config
/// solicitation before proceeding with CLI mappings only.
const EDITOR_WAIT: Duration = Duration::from_secs(8);
/// Grace period for the editor to drain the queued snapshot before exit.
const DRAIN_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub source: Option<PathBuf>,
    /// Dotted destination path, e.g. `ReplicatedStorage.Packages`.
    pub destination: Option<String>,
    pub destructive: bool,
    pub rojo: bool,
    pub rojo_project: Option<PathBuf>,
    /// Skip soliciting a push config from the editor.
    pub no_place_config: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub rojo: bool,
    pub rojo_project: Option<PathBuf>,
}

pub async fn run_push(config: &Config, options: PushOptions) -> Result<()> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
    let endpoint = Endpoint::bind(
        config.port,
        Some(Outgoing::RequestPushConfig),
        event_tx,
    )
    .await?;
    let outbound = endpoint.outbound();

    let mut mappings: Vec<PushMapping> = Vec::new();
    if let Some(destination) = &options.destination {
        mappings.push(PushMapping {
            source: options
                .source
                .clone()
                .unwrap_or_else(|| PathBuf::from("."))
                .display()
                .to_string(),
            destination: split_destination(destination),
            destructive: options.destructive,
            rojo_mode: options.rojo,
        });
    }

    if timeout(EDITOR_WAIT, endpoint.wait_for_client()).await.is_err() {
        tracing::warn!("no editor connected; queueing the push blind");
    } else if !options.no_place_config {
        match timeout(EDITOR_WAIT, wait_for_push_config(&mut event_rx)).await {
            Ok(Some(push_config)) => {
                tracing::info!(
                    mappings = push_config.mappings.len(),
                    "received push config from editor"
                );
                mappings.extend(push_config.mappings);
            }
            Ok(None) => {
                return Err(SyncError::Transport(
                    "editor connection lost while waiting for push config".to_string(),
                ));
            }
            Err(_) => {
                tracing::info!("no push config from editor; using CLI mappings only");
            }
        }
    }

    if mappings.is_empty() {
        return Err(SyncError::Project(
            "nothing to push: no -d destination and no editor push config".to_string(),
        ));
    }

    let mut resolved = Vec::with_capacity(mappings.len());
    for mapping in &mappings {
        resolved.push(resolve_mapping(mapping, &options)?);
    }
    let total: usize = resolved.iter().map(|mapping| mapping.instances.len()).sum();
    tracing::info!(mappings = resolved.len(), instances = total, "sending push snapshot");

    outbound
        .send(&Outgoing::PushSnapshot { mappings: resolved })
        .await;
    tokio::time::sleep(DRAIN_INTERVAL).await;
    endpoint.shutdown().await;
    Ok(())
}

pub async fn run_build(config: &Config, options: BuildOptions) -> Result<()> {
    let data = if options.rojo {
        let manifest_path = options
            .rojo_project
            .clone()
            .unwrap_or_else(|| PathBuf::from(manifest::DEFAULT_PROJECT_FILE));
        let (entries, _) = manifest::build_from_manifest(&manifest_path)?;
        entries
    } else {
        build_from_sync_dir(&config.sync_dir)?
    };
    tracing::info!(instances = data.len(), "built snapshot");

    let (event_tx, _event_rx) = mpsc::unbounded_channel::<Event>();
    let endpoint = Endpoint::bind(config.port, None, event_tx).await?;
    let outbound = endpoint.outbound();

    if timeout(EDITOR_WAIT, endpoint.wait_for_client()).await.is_err() {
        tracing::warn!("no editor connected; queueing the build blind");
    }
    outbound.send(&Outgoing::BuildSnapshot { data }).await;
    tokio::time::sleep(DRAIN_INTERVAL).await;
    endpoint.shutdown().await;
    Ok(())
}

/// Resolves one mapping into its instance list.
fn resolve_mapping(mapping: &PushMapping, options: &PushOptions) -> Result<PushSnapshotMapping> {
    let destination = mapping.destination.clone();
    let mut instances = Vec::new();

    if mapping.rojo_mode {
        let manifest_path = options
            .rojo_project
            .clone()
            .unwrap_or_else(|| default_manifest_for(&mapping.source));
        let (entries, mounted) = manifest::build_from_manifest(&manifest_path)?;
        instances.extend(
            entries
                .into_iter()
                .filter(|entry| entry.path.starts_with(&destination)),
        );

        // Script files under the source root that no manifest mount covers
        // come along as loose scripts, folder ancestors included.
        if let Some(source) = &options.source {
            let mounted: Vec<PathBuf> = mounted
                .iter()
                .map(|path| fs::canonicalize(path).unwrap_or_else(|_| path.clone()))
                .collect();
            let ignore = manifest::compile_ignore(&[])?;
            collect_loose(source, &destination, &mounted, &ignore, &mut instances)?;
        }
        walk::sort_entries(&mut instances);
    } else {
        let source_dir = PathBuf::from(&mapping.source);
        let ignore = manifest::compile_ignore(&[])?;
        // An init script in the source root classes the destination itself.
        if let Some(init) = walk::detect_init(&source_dir)? {
            instances.push(InstanceEntry {
                id: InstanceId::generate(),
                class_name: init.kind.class_name().to_string(),
                name: destination.last().cloned().unwrap_or_default(),
                path: destination.clone(),
                source: Some(init.source),
            });
        }
        walk::walk_children(&source_dir, &destination, &ignore, &mut instances)?;
        walk::sort_entries(&mut instances);
    }

    Ok(PushSnapshotMapping {
        destination,
        destructive: mapping.destructive,
        instances,
    })
}

/// Build-mode source: the sync dir itself, with top-level directories
/// classed by their own name (services) rather than as folders.
fn build_from_sync_dir(sync_dir: &Path) -> Result<Vec<InstanceEntry>> {
    let ignore = manifest::compile_ignore(&[])?;
    let mut entries = Vec::new();
    walk::walk_children(sync_dir, &[], &ignore, &mut entries)?;
    for entry in &mut entries {
        if entry.path.len() == 1 && entry.class_name == "Folder" {
            entry.class_name = entry.name.clone();
        }
    }
    walk::sort_entries(&mut entries);
    Ok(entries)
}

/// Emits scripts under `dir` that are outside every mounted directory.
/// Folder entries materialize only for directories that contain loose
/// scripts. Returns whether anything was emitted at this level.
fn collect_loose(
    dir: &Path,
    prefix: &[String],
    mounted: &[PathBuf],
    ignore: &GlobSet,
    out: &mut Vec<InstanceEntry>,
) -> Result<bool> {
    let mut emitted = false;
    for entry in walk::sorted_entries(dir)? {
        if ignore.is_match(&entry) {
            continue;
        }
        let canonical = fs::canonicalize(&entry).unwrap_or_else(|_| entry.clone());
        if mounted.iter().any(|mount| canonical.starts_with(mount)) {
            continue;
        }
        if entry.is_dir() {
            let Some(dir_name) = entry.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let mut child_prefix = prefix.to_vec();
            child_prefix.push(dir_name.to_string());
            let mut sub = Vec::new();
            if collect_loose(&entry, &child_prefix, mounted, ignore, &mut sub)? {
                out.push(InstanceEntry {
                    id: InstanceId::generate(),
                    class_name: "Folder".to_string(),
                    name: dir_name.to_string(),
                    path: child_prefix,
                    source: None,
                });
                out.extend(sub);
                emitted = true;
            }
        } else if entry.is_file() && codec::is_script_file(&entry) {
            let Some(file_name) = entry.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Some((kind, name)) = codec::classify_file_name(file_name) else {
                continue;
            };
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
            emitted = true;
        }
    }
    Ok(emitted)
}

async fn wait_for_push_config(
    event_rx: &mut mpsc::UnboundedReceiver<Event>,
) -> Option<crate::protocol::PushConfig> {
    while let Some(event) = event_rx.recv().await {
        match event {
            Event::Editor(Incoming::PushConfig { config }) => return Some(config),
            Event::Editor(Incoming::Ping) => {}
            other => {
                tracing::debug!(?other, "ignoring event while waiting for push config");
            }
        }
    }
    None
}

fn split_destination(dotted: &str) -> Vec<String> {
    dotted
        .split('.')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_manifest_for(source: &str) -> PathBuf {
    let candidate = Path::new(source).join(manifest::DEFAULT_PROJECT_FILE);
    if candidate.is_file() {
        candidate
    } else {
        PathBuf::from(manifest::DEFAULT_PROJECT_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn destination_splitting() {
        assert_eq!(
            split_destination("ReplicatedStorage.Packages"),
            vec!["ReplicatedStorage".to_string(), "Packages".to_string()]
        );
        assert_eq!(split_destination("Workspace"), vec!["Workspace".to_string()]);
        assert!(split_destination("").is_empty());
    }

    #[test]
    fn plain_mapping_prefixes_the_destination() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("Util.lua"), "return {}\n").expect("write");

        let mapping = PushMapping {
            source: dir.path().display().to_string(),
            destination: split_destination("ReplicatedStorage.Packages"),
            destructive: true,
            rojo_mode: false,
        };
        let resolved = resolve_mapping(&mapping, &PushOptions::default()).expect("resolve");

        assert!(resolved.destructive);
        assert_eq!(resolved.destination, vec!["ReplicatedStorage", "Packages"]);
        assert_eq!(resolved.instances.len(), 1);
        let util = &resolved.instances[0];
        assert_eq!(util.class_name, "ModuleScript");
        assert_eq!(
            util.path,
            vec!["ReplicatedStorage", "Packages", "Util"]
        );
        assert!(util.id.is_well_formed());
    }

    #[test]
    fn plain_mapping_with_root_init_classes_the_destination() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("init.luau"), "return {}\n").expect("write");
        fs::write(dir.path().join("Sub.luau"), "return 1\n").expect("write");

        let mapping = PushMapping {
            source: dir.path().display().to_string(),
            destination: split_destination("ReplicatedStorage.Lib"),
            destructive: false,
            rojo_mode: false,
        };
        let resolved = resolve_mapping(&mapping, &PushOptions::default()).expect("resolve");

        assert_eq!(resolved.instances[0].path, vec!["ReplicatedStorage", "Lib"]);
        assert_eq!(resolved.instances[0].class_name, "ModuleScript");
        assert_eq!(resolved.instances[1].path, vec!["ReplicatedStorage", "Lib", "Sub"]);
    }

    #[test]
    fn rojo_mapping_filters_to_the_destination_subtree() {
        let dir = tempdir().expect("tempdir");
        let packages = dir.path().join("Packages");
        fs::create_dir(&packages).expect("mkdir");
        fs::write(packages.join("Util.lua"), "return {}\n").expect("write");
        let manifest_path = dir.path().join(manifest::DEFAULT_PROJECT_FILE);
        fs::write(
            &manifest_path,
            r#"{
                "tree": {
                    "ReplicatedStorage": {
                        "$className": "ReplicatedStorage",
                        "Packages": { "$path": "Packages" }
                    },
                    "Workspace": { "$className": "Workspace" }
                }
            }"#,
        )
        .expect("write manifest");

        let mapping = PushMapping {
            source: dir.path().display().to_string(),
            destination: split_destination("ReplicatedStorage.Packages"),
            destructive: false,
            rojo_mode: true,
        };
        let options = PushOptions {
            rojo: true,
            rojo_project: Some(manifest_path),
            ..PushOptions::default()
        };
        let resolved = resolve_mapping(&mapping, &options).expect("resolve");

        assert_eq!(resolved.destination, vec!["ReplicatedStorage", "Packages"]);
        let paths: Vec<String> = resolved
            .instances
            .iter()
            .map(|entry| entry.path.join("/"))
            .collect();
        assert_eq!(
            paths,
            vec!["ReplicatedStorage/Packages", "ReplicatedStorage/Packages/Util"]
        );
        let util = resolved
            .instances
            .iter()
            .find(|entry| entry.name == "Util")
            .expect("Util");
        assert_eq!(util.class_name, "ModuleScript");
    }

    #[test]
    fn loose_scripts_materialize_folder_ancestors() {
        let dir = tempdir().expect("tempdir");
        let extra = dir.path().join("extra/nested");
        fs::create_dir_all(&extra).expect("mkdir");
        fs::write(extra.join("Loose.lua"), "l\n").expect("write");
        fs::create_dir_all(dir.path().join("empty")).expect("mkdir");

        let mut out = Vec::new();
        let ignore = manifest::compile_ignore(&[]).expect("ignore");
        let emitted = collect_loose(
            dir.path(),
            &["S".to_string()],
            &[],
            &ignore,
            &mut out,
        )
        .expect("collect");

        assert!(emitted);
        let paths: Vec<String> = out.iter().map(|entry| entry.path.join("/")).collect();
        assert_eq!(paths, vec!["S/extra", "S/extra/nested", "S/extra/nested/Loose"]);
        // Directories without loose scripts stay invisible.
        assert!(!paths.iter().any(|path| path.contains("empty")));
    }

    #[test]
    fn build_mode_classes_roots_by_name() {
        let dir = tempdir().expect("tempdir");
        let service = dir.path().join("ServerScriptService");
        fs::create_dir(&service).expect("mkdir");
        fs::write(service.join("Main.server.lua"), "main()\n").expect("write");

        let entries = build_from_sync_dir(dir.path()).expect("build");
        assert_eq!(entries[0].class_name, "ServerScriptService");
        assert_eq!(entries[1].class_name, "Script");
        assert_eq!(
            entries[1].path,
            vec!["ServerScriptService", "Main"]
        );
    }
}
