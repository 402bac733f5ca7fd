//! The mount orchestrator.
//!
//! [`MountOrchestrator`] is the single entry point the host talks to. It
//! owns the codec engine, the volume and compressor registries, the request
//! router, and the persistence store, and decides when the engine may be
//! torn down.
//!
//! ```text
//!   host callbacks ─┐
//!   launches ───────┼─► MountOrchestrator ──► Inner ─┬─ Tables (volumes, compressors,
//!   suspend ────────┘        (Clone)          │      │          in-flight, loads)
//!                                             │      ├─ CodecEngineManager ──► engine
//!                                             │      ├─ RequestRouter
//!                                             │      └─ PersistenceStore
//!                                             │
//!   engine ── inbound mpsc ──► pump task ─────┘ (Weak, dispatches replies)
//! ```
//!
//! # Engine liveness
//!
//! The engine stays loaded while any volume or compressor exists or any
//! mount is in flight. Mounts and restores hold an [`InFlightMount`] guard
//! from the moment they start, so the engine cannot be torn down between
//! "engine loaded" and "volume registered". Every place that removes an
//! owner (unmount, failed mount, finished pack job, dropped guard) re-runs
//! the check.
//!
//! # Coalescing
//!
//! All loads of one volume (the fresh mount, or a lazy restore) go through
//! a shared future in `Tables::loads`. Concurrent requests for a volume that
//! is still loading await the same future instead of starting another.
//!
//! # Engine death
//!
//! If the engine goes away on its own, every pending request ends with no
//! reply and the engine slot goes back to unloaded. Volumes still loading
//! fail their mount. Ready volumes are dropped from memory only: the host
//! keeps them registered and their records stay, so the next host request
//! restores them on a fresh engine.
//!
//! The tables mutex is never held across an await. The lock order is
//! tables, then engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use archmount_types::{CompressorId, EngineMessage, EntryMetadata, VolumeId};
use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use parking_lot::Mutex;
use strum::Display;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::compressor::{CompressorRegistry, derive_output_path};
use crate::config::OrchestratorConfig;
use crate::engine::{CodecEngineManager, EngineLauncher, EngineStatus, Inbound, Liveness};
use crate::error::{MountError, PackError, PersistError, RestoreError, UnmountError, VolumeError};
use crate::persist::{KeyValueStore, PersistedVolumeRecord, PersistenceStore};
use crate::provider::{
    CloseFileOptions, FileSystemProvider, GetMetadataOptions, MountOptions, OpenFileOptions,
    ProviderError, ReadDirectoryOptions, ReadFileOptions, UnmountOptions,
};
use crate::router::{EntityLookup, RequestRouter, Routed};
use crate::volume::{MountOrigin, SourceHandle, VolumeRegistry, VolumeSnapshot, VolumeState};

/// A volume load several callers may await.
pub(crate) type VolumeLoad = Shared<BoxFuture<'static, Result<(), VolumeError>>>;

pub(crate) struct PendingLoad {
    generation: u64,
    future: VolumeLoad,
}

/// Everything guarded by the orchestrator's one lock.
#[derive(Default)]
pub(crate) struct Tables {
    pub(crate) volumes: VolumeRegistry,
    pub(crate) compressors: CompressorRegistry,
    pub(crate) in_flight_mounts: usize,
    pub(crate) loads: HashMap<VolumeId, PendingLoad>,
    next_load: u64,
}

impl Tables {
    pub(crate) fn liveness(&self) -> Liveness {
        Liveness {
            volumes: self.volumes.len(),
            compressors: self.compressors.len(),
            in_flight_mounts: self.in_flight_mounts,
        }
    }
}

impl EntityLookup for Tables {
    fn has_volume(&self, id: &VolumeId) -> bool {
        self.volumes.contains(id)
    }

    fn has_compressor(&self, id: CompressorId) -> bool {
        self.compressors.contains(id)
    }
}

/// State shared by the façade, the pump task and in-flight loads.
pub(crate) struct Inner {
    pub(crate) config: OrchestratorConfig,
    pub(crate) engine: CodecEngineManager,
    pub(crate) store: PersistenceStore,
    pub(crate) router: RequestRouter,
    pub(crate) provider: Arc<dyn FileSystemProvider>,
    pub(crate) tables: Mutex<Tables>,
}

impl Inner {
    /// Unload the engine if nothing owns it.
    pub(crate) fn maybe_unload(&self) -> bool {
        let tables = self.tables.lock();
        self.engine.maybe_unload(tables.liveness())
    }

    /// The engine of `generation` died on its own.
    fn engine_lost(&self, generation: u64, reason: &str) {
        if !self.engine.handle_disconnect(generation) {
            debug!(generation, reason, "ignoring disconnect of a retired codec engine");
            return;
        }
        warn!(generation, reason, "codec engine went away");

        let dropped = self
            .tables
            .lock()
            .volumes
            .remove_where(|v| v.state() != VolumeState::Unmounting);
        let cancelled = self.router.fail_all();
        for volume in &dropped {
            info!(
                volume = %volume.id(),
                state = %volume.state(),
                "volume dropped with the codec engine"
            );
        }
        info!(volumes = dropped.len(), cancelled, "codec engine state cleared");
        self.maybe_unload();
    }

    fn dispatch_inbound(self: &Arc<Self>, message: EngineMessage) {
        let routed = {
            let tables = self.tables.lock();
            self.router.dispatch_inbound(message, &*tables)
        };
        if let Routed::PassphraseRequested { volume, request } = routed {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.answer_passphrase(volume, request).await });
        }
    }

    fn finish_load(&self, id: &VolumeId, generation: u64) {
        let finished = {
            let mut tables = self.tables.lock();
            let current = tables
                .loads
                .get(id)
                .is_some_and(|pending| pending.generation == generation);
            if current {
                tables.loads.remove(id)
            } else {
                None
            }
        };
        drop(finished);
    }

    /// Reserve the load slot for a fresh mount of `source`.
    fn start_fresh_load(
        self: &Arc<Self>,
        source: SourceHandle,
        passphrase: Option<String>,
    ) -> Result<(VolumeId, VolumeLoad), MountError> {
        let id = VolumeId::for_source(&source.token());
        let mut tables = self.tables.lock();
        if tables.loads.contains_key(&id) || tables.volumes.contains(&id) {
            return Err(MountError::Exists(id));
        }
        tables.next_load += 1;
        let generation = tables.next_load;

        let inner = Arc::clone(self);
        let load_id = id.clone();
        let future = async move {
            let mut attempt = MountAttempt::begin(&inner, &load_id);
            let result = inner
                .mount_volume(
                    load_id.clone(),
                    source,
                    passphrase,
                    Vec::new(),
                    MountOrigin::Fresh,
                    &mut attempt,
                )
                .await;
            inner.finish_load(&load_id, generation);
            result.map_err(VolumeError::from)
        }
        .boxed()
        .shared();

        tables.loads.insert(
            id.clone(),
            PendingLoad {
                generation,
                future: future.clone(),
            },
        );
        Ok((id, future))
    }

    fn start_restore(self: &Arc<Self>, tables: &mut Tables, id: &VolumeId) -> VolumeLoad {
        tables.next_load += 1;
        let generation = tables.next_load;

        let inner = Arc::clone(self);
        let load_id = id.clone();
        let future = async move {
            let mut attempt = MountAttempt::begin(&inner, &load_id);
            let result = inner.restore_volume(&load_id, &mut attempt).await;
            inner.finish_load(&load_id, generation);
            result.map_err(VolumeError::from)
        }
        .boxed()
        .shared();

        tables.loads.insert(
            id.clone(),
            PendingLoad {
                generation,
                future: future.clone(),
            },
        );
        future
    }

    /// Make sure `id` is `Ready`, restoring it from its persisted record if
    /// it is not in memory. Joins a load already in progress.
    pub(crate) async fn ensure_volume_loaded(self: &Arc<Self>, id: &VolumeId) -> Result<(), VolumeError> {
        let load = {
            let mut tables = self.tables.lock();
            let existing = tables.loads.get(id).map(|pending| pending.future.clone());
            match existing {
                Some(future) => future,
                None => match tables.volumes.get(id).map(|v| v.state()) {
                    Some(VolumeState::Ready) => return Ok(()),
                    Some(_) => return Err(VolumeError::NotReady(id.clone())),
                    None => {
                        debug!(volume = %id, "volume not in memory, restoring");
                        self.start_restore(&mut tables, id)
                    }
                },
            }
        };
        let _in_flight = InFlightMount::begin(self);
        load.await
    }
}

async fn pump(inner: Weak<Inner>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(item) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match item {
            Inbound::Message(message) => inner.dispatch_inbound(message),
            Inbound::Disconnected { generation, reason } => inner.engine_lost(generation, &reason),
        }
    }
    debug!("engine message pump stopped");
}

// ============================================================================
// In-flight mounts
// ============================================================================

/// Counts as an engine owner for as long as it lives.
pub(crate) struct InFlightMount {
    inner: Arc<Inner>,
}

impl InFlightMount {
    pub(crate) fn begin(inner: &Arc<Inner>) -> Self {
        inner.tables.lock().in_flight_mounts += 1;
        Self {
            inner: Arc::clone(inner),
        }
    }
}

impl Drop for InFlightMount {
    fn drop(&mut self) {
        {
            let mut tables = self.inner.tables.lock();
            tables.in_flight_mounts = tables.in_flight_mounts.saturating_sub(1);
        }
        self.inner.maybe_unload();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MountAttemptState {
    Requested,
    EngineLoading,
    VolumeLoading,
    Mounted,
    Failed,
}

/// One mount or restore, from request to outcome.
pub(crate) struct MountAttempt {
    volume: VolumeId,
    state: MountAttemptState,
    _in_flight: InFlightMount,
}

impl MountAttempt {
    pub(crate) fn begin(inner: &Arc<Inner>, volume: &VolumeId) -> Self {
        debug!(volume = %volume, state = %MountAttemptState::Requested, "mount attempt");
        Self {
            volume: volume.clone(),
            state: MountAttemptState::Requested,
            _in_flight: InFlightMount::begin(inner),
        }
    }

    pub(crate) fn advance(&mut self, next: MountAttemptState) {
        debug!(volume = %self.volume, from = %self.state, to = %next, "mount attempt");
        self.state = next;
    }
}

impl Drop for MountAttempt {
    fn drop(&mut self) {
        if self.state != MountAttemptState::Mounted {
            self.advance(MountAttemptState::Failed);
        }
    }
}

// ============================================================================
// Public façade
// ============================================================================

/// Coordinates volumes, pack jobs and the shared codec engine.
///
/// Cheap to clone. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct MountOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MountOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountOrchestrator")
            .field("engine", &self.engine_status())
            .field("liveness", &self.liveness())
            .finish()
    }
}

impl MountOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        launcher: Arc<dyn EngineLauncher>,
        kv: Arc<dyn KeyValueStore>,
        provider: Arc<dyn FileSystemProvider>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let store = PersistenceStore::new(kv, config.retention);
        info!(
            retention = %config.retention,
            opened_files_limit = config.opened_files_limit,
            "mount orchestrator starting"
        );
        let inner = Arc::new(Inner {
            engine: CodecEngineManager::new(launcher, inbound_tx),
            store,
            router: RequestRouter::new(),
            provider,
            tables: Mutex::new(Tables::default()),
            config,
        });
        tokio::spawn(pump(Arc::downgrade(&inner), inbound_rx));
        Self { inner }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    // ── Launch entry points ────────────────────────────────────────────────

    /// The app was launched to open archives. Each item is mounted
    /// independently; the results line up with `items`.
    pub async fn on_launched_with_unpack(&self, items: Vec<PathBuf>) -> Vec<Result<VolumeId, MountError>> {
        info!(count = items.len(), "launched to unpack");
        join_all(items.iter().map(|item| self.mount(item, None))).await
    }

    /// The app was launched to pack items into a new archive. Returns the
    /// archive path. `on_progress` receives whole percentages.
    pub async fn on_launched_with_pack(
        &self,
        items: Vec<PathBuf>,
        on_progress: impl FnMut(u8) + Send,
    ) -> Result<PathBuf, PackError> {
        info!(count = items.len(), "launched to pack");
        let output = derive_output_path(&items, &self.inner.config.archive_extension).await?;
        let id = self.create_compressor(items, output).await?;
        self.compress(id, on_progress).await
    }

    /// The process is about to be suspended: persist every mounted volume.
    pub async fn on_suspend(&self) -> Result<(), PersistError> {
        let ids = self.inner.tables.lock().volumes.ready_ids();
        info!(count = ids.len(), "suspending, saving mounted volumes");
        self.inner.save_volumes(&ids).await
    }

    // ── Volumes ────────────────────────────────────────────────────────────

    /// Mount the archive at `source`. A passphrase given here is used for
    /// the first open attempt and remembered.
    pub async fn mount(&self, source: impl AsRef<Path>, passphrase: Option<String>) -> Result<VolumeId, MountError> {
        let _in_flight = InFlightMount::begin(&self.inner);
        let handle = SourceHandle::resolve(source.as_ref()).await?;
        let (id, load) = self.inner.start_fresh_load(handle, passphrase)?;
        match load.await {
            Ok(()) => Ok(id),
            Err(VolumeError::Mount(e)) => Err(e),
            Err(_) => Err(MountError::Cancelled(id)),
        }
    }

    /// Unmount `id`. Without `force`, refuses while files are open.
    pub async fn unmount(&self, id: &VolumeId, force: bool) -> Result<(), UnmountError> {
        self.inner.unmount_volume(id, force).await
    }

    /// Make sure `id` is loaded, restoring it if needed.
    pub async fn ensure_volume_loaded(&self, id: &VolumeId) -> Result<(), VolumeError> {
        self.inner.ensure_volume_loaded(id).await
    }

    /// Rebuild `id` from its persisted record and the host's metadata.
    /// On failure the volume has been force-unmounted.
    pub async fn restore_from_persisted(&self, id: &VolumeId) -> Result<(), RestoreError> {
        match self.inner.ensure_volume_loaded(id).await {
            Ok(()) => Ok(()),
            Err(VolumeError::Restore(e)) => Err(e),
            Err(other) => Err(RestoreError::failed(id, other)),
        }
    }

    // ── Host provider callbacks ────────────────────────────────────────────

    pub async fn on_mount_requested(&self, options: MountOptions) -> Result<VolumeId, ProviderError> {
        Ok(self.mount(&options.source, None).await?)
    }

    pub async fn on_unmount_requested(&self, options: UnmountOptions) -> Result<(), ProviderError> {
        Ok(self.unmount(&options.file_system_id, false).await?)
    }

    pub async fn on_get_metadata_requested(
        &self,
        options: GetMetadataOptions,
    ) -> Result<EntryMetadata, ProviderError> {
        let id = &options.file_system_id;
        self.inner.ensure_volume_loaded(id).await?;
        Ok(self.inner.get_metadata(id, &options.entry_path).await?)
    }

    /// `on_page` gets each page of entries and whether more follow.
    pub async fn on_read_directory_requested(
        &self,
        options: ReadDirectoryOptions,
        mut on_page: impl FnMut(Vec<EntryMetadata>, bool) + Send,
    ) -> Result<(), ProviderError> {
        let id = &options.file_system_id;
        self.inner.ensure_volume_loaded(id).await?;
        Ok(self
            .inner
            .read_directory(id, &options.directory_path, &mut on_page)
            .await?)
    }

    pub async fn on_open_file_requested(&self, options: OpenFileOptions) -> Result<(), ProviderError> {
        let id = &options.file_system_id;
        self.inner.ensure_volume_loaded(id).await?;
        Ok(self
            .inner
            .open_file(id, options.request_id, &options.file_path, options.mode)
            .await?)
    }

    pub async fn on_close_file_requested(&self, options: CloseFileOptions) -> Result<(), ProviderError> {
        let id = &options.file_system_id;
        self.inner.ensure_volume_loaded(id).await?;
        Ok(self.inner.close_file(id, options.open_request_id).await?)
    }

    /// `on_chunk` gets each chunk of data and whether more follow.
    pub async fn on_read_file_requested(
        &self,
        options: ReadFileOptions,
        mut on_chunk: impl FnMut(Vec<u8>, bool) + Send,
    ) -> Result<(), ProviderError> {
        let id = &options.file_system_id;
        self.inner.ensure_volume_loaded(id).await?;
        Ok(self
            .inner
            .read_file(id, options.open_request_id, options.offset, options.length, &mut on_chunk)
            .await?)
    }

    // ── Pack jobs ──────────────────────────────────────────────────────────

    pub async fn create_compressor(&self, items: Vec<PathBuf>, output: PathBuf) -> Result<CompressorId, PackError> {
        self.inner.create_compressor(items, output).await
    }

    /// Run a created job. The job is cleaned up when this returns.
    pub async fn compress(
        &self,
        id: CompressorId,
        mut on_progress: impl FnMut(u8) + Send,
    ) -> Result<PathBuf, PackError> {
        self.inner.compress(id, &mut on_progress).await
    }

    /// Abandon a job that will not be run.
    pub async fn cleanup_compressor(&self, id: CompressorId, had_error: bool) {
        self.inner.cleanup_compressor(id, had_error).await
    }

    // ── Introspection ──────────────────────────────────────────────────────

    pub fn engine_status(&self) -> EngineStatus {
        self.inner.engine.status()
    }

    pub fn liveness(&self) -> Liveness {
        self.inner.tables.lock().liveness()
    }

    pub fn in_flight_mounts(&self) -> usize {
        self.inner.tables.lock().in_flight_mounts
    }

    /// Ids of volumes serving requests, sorted.
    pub fn mounted_volumes(&self) -> Vec<VolumeId> {
        self.inner.tables.lock().volumes.ready_ids()
    }

    pub fn volume(&self, id: &VolumeId) -> Option<VolumeSnapshot> {
        self.inner.tables.lock().volumes.get(id).map(|v| v.snapshot())
    }

    pub fn compressor_count(&self) -> usize {
        self.inner.tables.lock().compressors.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.router.pending_len()
    }

    pub async fn persisted_records(&self) -> Result<Vec<PersistedVolumeRecord>, PersistError> {
        self.inner.store.records().await
    }

    /// Re-run the engine liveness check. Returns true if the engine was
    /// torn down.
    pub fn maybe_unload(&self) -> bool {
        self.inner.maybe_unload()
    }
}
