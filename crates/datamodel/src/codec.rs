//! Filename codec for script nodes.
//!
//! Classification splits a script filename into its kind and logical name;
//! encoding is the inverse. Any `.lua` extension is normalized to `.luau`
//! before classification, so the two spellings classify identically.

use std::path::Path;

use crate::instance::ScriptKind;

/// Extensions the daemon treats as script sources (without the dot).
pub const SCRIPT_EXTENSIONS: [&str; 2] = ["lua", "luau"];

/// Characters that cannot appear in on-disk names and are replaced by `_`.
const ILLEGAL_NAME_CHARS: [char; 7] = ['<', '>', ':', '"', '|', '?', '*'];

/// Whether a path names a script source file by extension.
pub fn is_script_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SCRIPT_EXTENSIONS.contains(&ext))
}

/// Classifies a script filename into `(kind, logical name)`.
///
/// Returns `None` when the filename does not carry a script extension.
/// Recognized kind suffixes on the stem are `.server`, `.client`, and
/// `.module`; a bare stem is a module script.
pub fn classify_file_name(file_name: &str) -> Option<(ScriptKind, String)> {
    let stem = file_name
        .strip_suffix(".luau")
        .or_else(|| file_name.strip_suffix(".lua"))?;

    if let Some(base) = stem.strip_suffix(".server") {
        Some((ScriptKind::Server, base.to_string()))
    } else if let Some(base) = stem.strip_suffix(".client") {
        Some((ScriptKind::Client, base.to_string()))
    } else if let Some(base) = stem.strip_suffix(".module") {
        Some((ScriptKind::Module, base.to_string()))
    } else {
        Some((ScriptKind::Module, stem.to_string()))
    }
}

/// Encodes a script node's filename: sanitized name, kind suffix, extension.
///
/// `extension` includes the leading dot (".luau" or ".lua").
pub fn file_name_for(name: &str, kind: ScriptKind, extension: &str) -> String {
    format!("{}{}{}", sanitize_name(name), kind.file_suffix(), extension)
}

/// Filename for a container-collapsed script: `init<suffix>.<ext>`, placed
/// inside the directory that carries the node's logical name.
pub fn init_file_name(kind: ScriptKind, extension: &str) -> String {
    format!("init{}{}", kind.file_suffix(), extension)
}

/// Whether a classified logical name denotes a collapsed container script.
pub fn is_init_name(logical_name: &str) -> bool {
    logical_name == "init"
}

/// Replaces filesystem-illegal characters with `_`.
///
/// One-way: the canonical logical name keeps the original characters and the
/// tree, sourcemap, and wire messages all use it unchanged.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if ILLEGAL_NAME_CHARS.contains(&c) { '_' } else { c })
        .collect()
}
