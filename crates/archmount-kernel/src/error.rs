//! Error taxonomy for the orchestrator.
//!
//! Errors that can be observed by several awaiters of one coalesced future
//! (engine load, mount, restore) are `Clone` and carry string reasons.

use std::path::PathBuf;

use archmount_types::{CompressorId, OpenRequestId, VolumeId};
use thiserror::Error;

use crate::provider::ProviderError;

/// Errors from the codec engine or its channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The engine could not be started.
    #[error("codec engine failed to start: {0}")]
    Launch(String),

    /// A message was posted while the engine was not loaded.
    #[error("codec engine is not loaded")]
    NotLoaded,

    /// The engine went away (process exited, channel dropped).
    #[error("codec engine channel closed")]
    Closed,

    /// The engine reported a failure; the message is not interpreted.
    #[error("{0}")]
    Rejected(String),
}

/// Errors from a fresh mount.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MountError {
    /// A volume with the same id is already mounted or mounting.
    #[error("EXISTS: volume {0} is already mounted")]
    Exists(VolumeId),

    #[error("cannot resolve archive {path}: {reason}")]
    Source { path: PathBuf, reason: String },

    #[error("engine rejected mount: {0}")]
    Engine(#[from] EngineError),

    #[error("archive is encrypted and no passphrase was given")]
    PassphraseDeclined,

    #[error("host refused mount: {0}")]
    Provider(#[from] ProviderError),

    /// The volume was force-unmounted while it was still loading.
    #[error("mount of {0} was cancelled")]
    Cancelled(VolumeId),
}

/// A restore from a persisted record failed. The volume has already been
/// force-unmounted when this is returned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RestoreError {
    #[error("restore of volume {id} failed: {reason}")]
    Failed { id: VolumeId, reason: String },
}

impl RestoreError {
    pub fn failed(id: &VolumeId, reason: impl ToString) -> Self {
        Self::Failed {
            id: id.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Errors from an unmount request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UnmountError {
    #[error("volume {id} has {open_files} open file(s)")]
    InUse { id: VolumeId, open_files: usize },
}

/// Errors from per-call volume operations (metadata, directory, file I/O).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VolumeError {
    #[error("volume not mounted: {0}")]
    NotMounted(VolumeId),

    #[error("volume {0} is not ready")]
    NotReady(VolumeId),

    #[error("open request {open} is not known on volume {volume}")]
    UnknownOpenRequest {
        volume: VolumeId,
        open: OpenRequestId,
    },

    #[error("open request {open} is already in use on volume {volume}")]
    DuplicateOpenRequest {
        volume: VolumeId,
        open: OpenRequestId,
    },

    /// The volume was unmounted while the request was in flight.
    #[error("request on volume {0} was cancelled")]
    Cancelled(VolumeId),

    #[error("unexpected engine reply: {0}")]
    Protocol(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The volume was still being mounted and the mount failed.
    #[error(transparent)]
    Mount(#[from] MountError),

    #[error(transparent)]
    Restore(#[from] RestoreError),
}

/// Errors from a pack job.
#[derive(Debug, Error)]
pub enum PackError {
    #[error("nothing to pack")]
    Empty,

    #[error("pack job {0} not found")]
    NotFound(CompressorId),

    #[error("pack job {0} was cancelled")]
    Cancelled(CompressorId),

    #[error("unexpected engine reply: {0}")]
    Protocol(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("no persisted record for volume {0}")]
    NotFound(VolumeId),

    #[error("state database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("state encoding error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

// ============================================================================
// Host-facing conversions
// ============================================================================

impl From<VolumeError> for ProviderError {
    fn from(e: VolumeError) -> Self {
        match e {
            VolumeError::NotMounted(id) => ProviderError::NotFound(id.to_string()),
            VolumeError::NotReady(_) => ProviderError::Failed(e.to_string()),
            VolumeError::UnknownOpenRequest { .. } => ProviderError::InvalidOperation(e.to_string()),
            VolumeError::DuplicateOpenRequest { .. } => ProviderError::InUse,
            VolumeError::Cancelled(_) => ProviderError::Aborted,
            VolumeError::Protocol(msg) => ProviderError::Failed(msg),
            VolumeError::Engine(EngineError::Rejected(msg)) => ProviderError::Failed(msg),
            VolumeError::Engine(e) => ProviderError::Failed(e.to_string()),
            VolumeError::Mount(e) => e.into(),
            VolumeError::Restore(e) => ProviderError::Failed(e.to_string()),
        }
    }
}

impl From<MountError> for ProviderError {
    fn from(e: MountError) -> Self {
        match e {
            MountError::Exists(_) => ProviderError::Exists,
            MountError::Provider(p) => p,
            MountError::Cancelled(_) => ProviderError::Aborted,
            other => ProviderError::Failed(other.to_string()),
        }
    }
}

impl From<UnmountError> for ProviderError {
    fn from(e: UnmountError) -> Self {
        match e {
            UnmountError::InUse { .. } => ProviderError::InUse,
        }
    }
}

impl From<RestoreError> for ProviderError {
    fn from(e: RestoreError) -> Self {
        ProviderError::Failed(e.to_string())
    }
}
