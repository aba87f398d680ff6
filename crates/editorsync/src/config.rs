//! Daemon configuration.
//!
//! Loaded from `editorsync.json` in the working directory when present;
//! every field has a default so partial files parse. The file is never
//! created by the daemon — it runs inside arbitrary project directories and
//! must not litter them. CLI flags override the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

pub const CONFIG_FILENAME: &str = "editorsync.json";

/// Script file extension used for projected files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptExtension {
    #[serde(rename = ".lua")]
    Lua,
    #[serde(rename = ".luau")]
    Luau,
}

impl ScriptExtension {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lua => ".lua",
            Self::Luau => ".luau",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub port: u16,
    pub sync_dir: PathBuf,
    pub sourcemap_path: PathBuf,
    pub script_extension: ScriptExtension,
    /// Root services the editor agent is told to skip. The daemon also
    /// filters inbound entries against this set, so a non-conforming agent
    /// cannot leak excluded services into the mirror.
    pub excluded_services: Vec<String>,
    /// Opt-in: on a full snapshot, delete script files under the sync dir
    /// that no tree node accounts for.
    pub delete_orphans_on_connect: bool,
    /// Stability window for the file watcher, in milliseconds.
    pub file_watch_debounce: u64,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            sync_dir: PathBuf::from("./sync"),
            sourcemap_path: PathBuf::from("./sourcemap.json"),
            script_extension: ScriptExtension::Luau,
            excluded_services: Vec::new(),
            delete_orphans_on_connect: false,
            file_watch_debounce: 100,
            debug: false,
        }
    }
}

impl Config {
    /// Loads the config file from `dir`, or defaults when it is absent.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILENAME);
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(error) => {
                return Err(SyncError::Config(format!(
                    "failed to read {}: {error}",
                    path.display()
                )));
            }
        };
        serde_json::from_str(&data).map_err(|error| {
            SyncError::Config(format!("failed to parse {}: {error}", path.display()))
        })
    }

    pub fn is_service_excluded(&self, service: &str) -> bool {
        self.excluded_services.iter().any(|name| name == service)
    }
}
