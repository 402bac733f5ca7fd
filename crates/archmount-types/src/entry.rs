//! Archive entry metadata.
//!
//! These types travel both ways across the engine boundary and out to the
//! host provider, so they are plain serde structs with no behavior beyond
//! constructors.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Metadata of one entry inside a mounted archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Entry name (last path component; empty for the archive root).
    pub name: String,
    /// True for directories.
    pub is_directory: bool,
    /// Uncompressed size in bytes.
    pub size: u64,
    /// Last modification time, Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_ms: Option<u64>,
}

impl EntryMetadata {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            is_directory: false,
            size,
            modified_ms: None,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_directory: true,
            size: 0,
            modified_ms: None,
        }
    }

    pub fn with_modified_ms(mut self, ms: u64) -> Self {
        self.modified_ms = Some(ms);
        self
    }
}

/// How a file inside an archive was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum OpenMode {
    Read,
    Write,
}

/// Opaque per-volume session data owned by the codec engine.
///
/// The orchestrator stores it and never looks inside.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineSession(pub serde_json::Value);
