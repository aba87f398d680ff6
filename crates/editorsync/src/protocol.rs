//! Wire protocol between the daemon and the editor agent.
//!
//! Both transport variants carry the same tagged JSON messages. The tag set
//! is closed; class tags inside entries stay open-ended strings so the
//! editor can introduce node classes without a daemon release.

use serde::{Deserialize, Serialize};

use datamodel::{InstanceEntry, InstanceId};

/// Messages the editor sends to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Incoming {
    FullSnapshot {
        data: Vec<InstanceEntry>,
    },
    InstanceUpdated {
        data: InstanceEntry,
    },
    #[serde(rename_all = "camelCase")]
    ScriptChanged {
        id: InstanceId,
        path: Vec<String>,
        class_name: String,
        source: String,
    },
    Deleted {
        id: InstanceId,
    },
    Ping,
    ClientDisconnect,
    PushConfig {
        config: PushConfig,
    },
}

/// Messages the daemon sends to the editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Outgoing {
    PatchScript {
        id: InstanceId,
        source: String,
    },
    RequestSnapshot,
    RequestPushConfig,
    BuildSnapshot {
        data: Vec<InstanceEntry>,
    },
    PushSnapshot {
        mappings: Vec<PushSnapshotMapping>,
    },
    Pong,
    Error {
        message: String,
    },
}

/// Push manifest supplied by the editor during push mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushConfig {
    pub mappings: Vec<PushMapping>,
}

/// One source-to-destination mapping for a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMapping {
    /// Local source directory (or project manifest root in rojo mode).
    pub source: String,
    /// Dotted destination path inside the editor tree, pre-split.
    pub destination: Vec<String>,
    #[serde(default)]
    pub destructive: bool,
    #[serde(default)]
    pub rojo_mode: bool,
}

/// One resolved mapping in the outbound push payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushSnapshotMapping {
    pub destination: Vec<String>,
    pub destructive: bool,
    pub instances: Vec<InstanceEntry>,
}

impl Outgoing {
    /// Serialized form sent over either transport variant.
    pub fn to_json(&self) -> String {
        // The enum has no non-serializable states; failure here would be a
        // programming error, so fall back to a plain error message.
        serde_json::to_string(self).unwrap_or_else(|error| {
            format!("{{\"type\":\"error\",\"message\":\"encode failure: {error}\"}}")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_tags_round_trip() {
        let raw = r#"{"type":"scriptChanged","id":"0c3ac4a09e1c4f3a8f524b2f7a1d9e00","path":["ReplicatedStorage","Foo"],"className":"ModuleScript","source":"return 3\n"}"#;
        let message: Incoming = serde_json::from_str(raw).expect("decode");
        match &message {
            Incoming::ScriptChanged { path, source, .. } => {
                assert_eq!(path[1], "Foo");
                assert_eq!(source, "return 3\n");
            }
            other => panic!("wrong variant: {other:?}"),
        }
        let encoded = serde_json::to_string(&message).expect("encode");
        let again: Incoming = serde_json::from_str(&encoded).expect("redecode");
        assert_eq!(message, again);
    }

    #[test]
    fn unit_tags_have_no_payload() {
        let ping: Incoming = serde_json::from_str(r#"{"type":"ping"}"#).expect("decode");
        assert_eq!(ping, Incoming::Ping);
        assert_eq!(Outgoing::Pong.to_json(), r#"{"type":"pong"}"#);
    }

    #[test]
    fn unknown_tag_is_a_parse_error() {
        let result: Result<Incoming, _> = serde_json::from_str(r#"{"type":"selfDestruct"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn push_mapping_defaults() {
        let raw = r#"{"source":"./Packages","destination":["ReplicatedStorage","Packages"]}"#;
        let mapping: PushMapping = serde_json::from_str(raw).expect("decode");
        assert!(!mapping.destructive);
        assert!(!mapping.rojo_mode);
    }

    #[test]
    fn outbound_patch_carries_id_and_source() {
        let json = Outgoing::PatchScript {
            id: InstanceId::from("0c3ac4a09e1c4f3a8f524b2f7a1d9e00"),
            source: "return 2\n".to_string(),
        }
        .to_json();
        let value: serde_json::Value = serde_json::from_str(&json).expect("decode");
        assert_eq!(value["type"], "patchScript");
        assert_eq!(value["source"], "return 2\n");
    }
}
