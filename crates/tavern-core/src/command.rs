//! Tagged commands exchanged over the Command channel.
//!
//! A command is a tag naming the operation plus an ordered list of opaque
//! JSON values. The protocol layer never looks inside campaign objects; only
//! handlers interpret `params`.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

// ── Tags ──────────────────────────────────────────────────────────────────────

macro_rules! command_tags {
    ($($variant:ident => $wire:literal,)*) => {
        /// Every command the host and clients understand.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum CommandTag {
            $($variant,)*
        }

        impl CommandTag {
            pub const ALL: &'static [CommandTag] = &[$(CommandTag::$variant,)*];

            /// Name used on the wire.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(CommandTag::$variant => $wire,)*
                }
            }
        }

        impl FromStr for CommandTag {
            type Err = CommandError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok(CommandTag::$variant),)*
                    other => Err(CommandError::UnknownTag(other.to_string())),
                }
            }
        }
    };
}

command_tags! {
    BootPlayer => "bootPlayer",
    SetCampaign => "setCampaign",
    GetZone => "getZone",
    PutZone => "putZone",
    RemoveZone => "removeZone",
    RenameZone => "renameZone",
    PutAsset => "putAsset",
    GetAsset => "getAsset",
    RemoveAsset => "removeAsset",
    PutToken => "putToken",
    RemoveToken => "removeToken",
    Draw => "draw",
    UndoDraw => "undoDraw",
    ClearAllDrawings => "clearAllDrawings",
    SetZoneGridSize => "setZoneGridSize",
    SetZoneVisibility => "setZoneVisibility",
    SetZoneHasFoW => "setZoneHasFoW",
    ExposeFoW => "exposeFoW",
    HideFoW => "hideFoW",
    PutLabel => "putLabel",
    RemoveLabel => "removeLabel",
    PlayerConnected => "playerConnected",
    PlayerDisconnected => "playerDisconnected",
    Message => "message",
    ShowPointer => "showPointer",
    HidePointer => "hidePointer",
    MovePointer => "movePointer",
    StartTokenMove => "startTokenMove",
    UpdateTokenMove => "updateTokenMove",
    StopTokenMove => "stopTokenMove",
    ToggleTokenMoveWaypoint => "toggleTokenMoveWaypoint",
    EnforceZoneView => "enforceZoneView",
    EnforceZone => "enforceZone",
    SetServerPolicy => "setServerPolicy",
    StartAssetTransfer => "startAssetTransfer",
    UpdateAssetTransfer => "updateAssetTransfer",
    Heartbeat => "heartbeat",
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CommandTag {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CommandTag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Command ───────────────────────────────────────────────────────────────────

/// One-way message: `{"tag": "...", "params": [...]}` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub tag: CommandTag,
    pub params: Vec<Value>,
}

/// Wire shape before the tag is resolved, so an unknown tag is
/// distinguishable from a malformed body.
#[derive(Deserialize)]
struct RawCommand {
    tag: String,
    #[serde(default)]
    params: Vec<Value>,
}

impl Command {
    pub fn new(tag: CommandTag, params: Vec<Value>) -> Self {
        Self { tag, params }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CommandError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CommandError> {
        let raw: RawCommand = serde_json::from_slice(bytes)?;
        let tag = raw.tag.parse()?;
        Ok(Self {
            tag,
            params: raw.params,
        })
    }

    /// Deserialize parameter `index` into `T`.
    pub fn param<T: DeserializeOwned>(&self, index: usize) -> Result<T, CommandError> {
        let value = self.params.get(index).ok_or(CommandError::MissingParam {
            tag: self.tag,
            index,
        })?;
        T::deserialize(value).map_err(|e| CommandError::BadParam {
            tag: self.tag,
            index,
            reason: e.to_string(),
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("malformed command: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown command tag: {0}")]
    UnknownTag(String),

    #[error("{tag}: missing parameter {index}")]
    MissingParam { tag: CommandTag, index: usize },

    #[error("{tag}: parameter {index} invalid: {reason}")]
    BadParam {
        tag: CommandTag,
        index: usize,
        reason: String,
    },
}
