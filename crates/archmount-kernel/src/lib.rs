//! # archmount-kernel
//!
//! Archive mount orchestrator.
//!
//! Archives are exposed to a host as read-only virtual filesystems, and
//! files can be packed into new archives. All decoding and encoding is done
//! by one shared codec engine, which is:
//! - Loaded lazily, on the first mount or pack job
//! - Shared by every mounted volume and every pack job
//! - Torn down as soon as no volume, pack job or in-flight mount needs it
//!
//! Mounted volumes survive process restarts: each one leaves a small
//! recovery record, and the first host request that touches a volume not
//! in memory rebuilds it from that record.

pub mod compressor;
pub mod config;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod persist;
pub mod provider;
pub mod router;
pub mod volume;

#[cfg(any(test, feature = "test-mock"))]
pub mod testing;

pub use compressor::{Compressor, CompressorRegistry, CompressorState, derive_output_path};
pub use config::{EngineConfig, OrchestratorConfig, Retention};
pub use engine::{
    CodecEngineManager, EngineChannel, EngineHandle, EngineLauncher, EngineStatus, Inbound, InboundSender,
    Liveness, ProcessEngine,
};
pub use error::{
    ConfigError, EngineError, MountError, PackError, PersistError, RestoreError, UnmountError,
    VolumeError,
};
pub use orchestrator::{MountAttemptState, MountOrchestrator};
pub use persist::{KeyValueStore, MemoryStore, PersistedVolumeRecord, PersistenceStore, SqliteStore};
pub use provider::{
    CloseFileOptions, FileSystemInfo, FileSystemProvider, GetMetadataOptions, MountOptions,
    MountRequest, OpenFileOptions, OpenedFile, ProviderError, ReadDirectoryOptions,
    ReadFileOptions, UnmountOptions,
};
pub use router::{EntityLookup, Reply, RequestRouter, Routed};
pub use volume::{OpenFileEntry, SourceHandle, Volume, VolumeRegistry, VolumeSnapshot, VolumeState};
