//! Codec-engine wire messages.
//!
//! The engine channel is one-directional in each direction: the orchestrator
//! posts [`EngineRequest`]s and the engine posts [`EngineMessage`]s back.
//! Both are tagged unions over the two operation families (unpack and pack),
//! and every message carries the owning entity id plus a per-entity request
//! id so replies can be correlated regardless of arrival order.
//!
//! On the subprocess transport each message is one JSON object per line:
//!
//! ```text
//! → {"family":"unpack","volume_id":"…","request_id":3,"op":{"type":"read_directory","path":"/"}}
//! ← {"family":"unpack","volume_id":"…","request_id":3,"event":{"type":"directory_page","entries":[…],"has_more":false}}
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::entry::{EngineSession, EntryMetadata, OpenMode};
use crate::ids::{CompressorId, CorrelationKey, OpenRequestId, RequestId, VolumeId};

// ============================================================================
// Requests (orchestrator → engine)
// ============================================================================

/// A request posted to the codec engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum EngineRequest {
    Unpack {
        volume_id: VolumeId,
        request_id: RequestId,
        op: UnpackOp,
    },
    Pack {
        compressor_id: CompressorId,
        request_id: RequestId,
        op: PackOp,
    },
}

impl EngineRequest {
    pub fn correlation(&self) -> CorrelationKey {
        match self {
            EngineRequest::Unpack {
                volume_id,
                request_id,
                ..
            } => CorrelationKey::volume(volume_id.clone(), *request_id),
            EngineRequest::Pack {
                compressor_id,
                request_id,
                ..
            } => CorrelationKey::compressor(*compressor_id, *request_id),
        }
    }
}

/// Unpack-family operations, scoped to one volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnpackOp {
    /// Open the archive behind `source` and start a session.
    OpenArchive {
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
    /// Release the session.
    CloseArchive,
    GetMetadata {
        path: String,
    },
    ReadDirectory {
        path: String,
    },
    OpenFile {
        open_request_id: OpenRequestId,
        path: String,
        mode: OpenMode,
    },
    CloseFile {
        open_request_id: OpenRequestId,
    },
    ReadFile {
        open_request_id: OpenRequestId,
        offset: u64,
        length: u64,
    },
    /// Answer to an engine-initiated [`UnpackEvent::PassphraseRequired`].
    /// `None` means the user declined.
    PassphraseReply {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
}

/// Pack-family operations, scoped to one compressor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PackOp {
    /// Write a new archive at `output` containing `items`, in order.
    Create { output: PathBuf, items: Vec<PathBuf> },
    /// Abandon the job after an error and release its resources.
    Abort,
    /// Release resources after a clean completion.
    Close,
}

// ============================================================================
// Messages (engine → orchestrator)
// ============================================================================

/// A message posted by the codec engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum EngineMessage {
    Unpack {
        volume_id: VolumeId,
        request_id: RequestId,
        event: UnpackEvent,
    },
    Pack {
        compressor_id: CompressorId,
        request_id: RequestId,
        event: PackEvent,
    },
}

impl EngineMessage {
    pub fn correlation(&self) -> CorrelationKey {
        match self {
            EngineMessage::Unpack {
                volume_id,
                request_id,
                ..
            } => CorrelationKey::volume(volume_id.clone(), *request_id),
            EngineMessage::Pack {
                compressor_id,
                request_id,
                ..
            } => CorrelationKey::compressor(*compressor_id, *request_id),
        }
    }
}

/// Unpack-family events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnpackEvent {
    ArchiveOpened {
        #[serde(default)]
        session: EngineSession,
    },
    ArchiveClosed,
    Metadata {
        entry: EntryMetadata,
    },
    DirectoryPage {
        entries: Vec<EntryMetadata>,
        has_more: bool,
    },
    FileOpened,
    FileClosed,
    FileChunk {
        data: Vec<u8>,
        has_more: bool,
    },
    /// Engine-initiated: the archive is encrypted and needs a passphrase.
    /// Answered with [`UnpackOp::PassphraseReply`] under the same request id.
    PassphraseRequired,
    /// Opaque engine failure, forwarded verbatim.
    Error {
        message: String,
    },
}

impl UnpackEvent {
    /// True when no further events will arrive for the same request.
    pub fn is_final(&self) -> bool {
        match self {
            UnpackEvent::DirectoryPage { has_more, .. } | UnpackEvent::FileChunk { has_more, .. } => {
                !has_more
            }
            UnpackEvent::PassphraseRequired => false,
            _ => true,
        }
    }
}

/// Pack-family events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PackEvent {
    /// Fraction of the job completed, in `[0, 1]`.
    Progress {
        fraction: f64,
    },
    Done,
    Aborted,
    Closed,
    Error {
        message: String,
    },
}

impl PackEvent {
    pub fn is_final(&self) -> bool {
        !matches!(self, PackEvent::Progress { .. })
    }
}
