//! Host filesystem-provider contract.
//!
//! The host owns the virtual-filesystem registration and the user-facing
//! surface. The orchestrator consumes it through [`FileSystemProvider`]
//! (register/detach volumes, read back what the host remembers about a
//! volume after a restart, prompt for passphrases) and exposes the host's
//! `on*Requested` callbacks as async methods on
//! [`MountOrchestrator`](crate::MountOrchestrator), each taking one of the
//! option structs below. Success is `Ok`, the host's `onError` is `Err`.

use std::path::PathBuf;

use archmount_types::{OpenMode, OpenRequestId, VolumeId};
use async_trait::async_trait;
use thiserror::Error;

/// Error codes understood by the host provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("NOT_FOUND: {0}")]
    NotFound(String),

    #[error("EXISTS")]
    Exists,

    #[error("IN_USE")]
    InUse,

    #[error("FAILED: {0}")]
    Failed(String),

    #[error("INVALID_OPERATION: {0}")]
    InvalidOperation(String),

    #[error("ABORTED")]
    Aborted,
}

/// What the orchestrator asks the host to register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub id: VolumeId,
    pub display_name: String,
    pub opened_files_limit: u32,
    pub writable: bool,
}

/// A file the host still considers open on a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedFile {
    pub open_request_id: OpenRequestId,
    pub path: String,
    pub mode: OpenMode,
}

/// The host's record of a registered volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemInfo {
    pub id: VolumeId,
    pub display_name: String,
    pub opened_files_limit: u32,
    pub writable: bool,
    pub opened_files: Vec<OpenedFile>,
}

/// Host-side virtual filesystem provider.
#[async_trait]
pub trait FileSystemProvider: Send + Sync {
    /// Register a freshly mounted volume.
    async fn mount(&self, request: &MountRequest) -> Result<(), ProviderError>;

    /// Detach a volume. Must tolerate ids the host no longer knows.
    async fn unmount(&self, id: &VolumeId) -> Result<(), ProviderError>;

    /// What the host remembers about `id`, or `None` if it is not registered.
    async fn file_system_info(&self, id: &VolumeId) -> Option<FileSystemInfo>;

    /// Ask the user for the passphrase of an encrypted archive.
    /// `None` means the user declined.
    async fn request_passphrase(&self, id: &VolumeId, display_name: &str) -> Option<String>;
}

// ============================================================================
// Callback options
// ============================================================================

/// `onMount`: the user picked an archive to mount.
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub source: PathBuf,
}

#[derive(Debug, Clone)]
pub struct UnmountOptions {
    pub file_system_id: VolumeId,
}

#[derive(Debug, Clone)]
pub struct GetMetadataOptions {
    pub file_system_id: VolumeId,
    pub entry_path: String,
}

#[derive(Debug, Clone)]
pub struct ReadDirectoryOptions {
    pub file_system_id: VolumeId,
    pub directory_path: String,
}

#[derive(Debug, Clone)]
pub struct OpenFileOptions {
    pub file_system_id: VolumeId,
    pub request_id: OpenRequestId,
    pub file_path: String,
    pub mode: OpenMode,
}

#[derive(Debug, Clone)]
pub struct CloseFileOptions {
    pub file_system_id: VolumeId,
    pub open_request_id: OpenRequestId,
}

#[derive(Debug, Clone)]
pub struct ReadFileOptions {
    pub file_system_id: VolumeId,
    pub open_request_id: OpenRequestId,
    pub offset: u64,
    pub length: u64,
}
