//! Mounted archives.
//!
//! A [`Volume`] is one archive exposed to the host as a read-only
//! filesystem. The registry holds a volume from the moment its mount starts
//! (as a `Loading` reservation, so engine replies can be routed and a second
//! mount of the same archive is refused) until it is unmounted. Only `Ready`
//! volumes serve requests or get persisted.
//!
//! The flows here are methods on the orchestrator's shared state:
//!
//! | Flow                    | Entry point                                |
//! |-------------------------|--------------------------------------------|
//! | fresh mount             | `mount_volume` with `MountOrigin::Fresh`   |
//! | crash recovery          | `restore_volume`                           |
//! | unmount                 | `unmount_volume`                           |
//! | metadata, listing, I/O  | `get_metadata`, `read_directory`, `open_file`, `close_file`, `read_file` |

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use archmount_types::{
    EngineRequest, EngineSession, EntityId, EntryMetadata, OpenMode, OpenRequestId, RequestId,
    UnpackEvent, UnpackOp, VolumeId,
};
use strum::Display;
use tracing::{debug, info, warn};

use crate::engine::EngineStatus;
use crate::error::{EngineError, MountError, PersistError, RestoreError, UnmountError, VolumeError};
use crate::orchestrator::{Inner, MountAttempt, MountAttemptState};
use crate::persist::PersistedVolumeRecord;
use crate::provider::{FileSystemInfo, MountRequest, OpenedFile};
use crate::router::Reply;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum VolumeState {
    Loading,
    Ready,
    Unmounting,
}

/// A durable reference to an archive on disk.
///
/// The token is the canonical path, stable across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceHandle {
    path: PathBuf,
}

impl SourceHandle {
    /// Canonicalize `path` and check it names a regular file.
    pub async fn resolve(path: &Path) -> Result<Self, MountError> {
        let source_error = |reason: String| MountError::Source {
            path: path.to_path_buf(),
            reason,
        };
        let canonical = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| source_error(e.to_string()))?;
        let meta = tokio::fs::metadata(&canonical)
            .await
            .map_err(|e| source_error(e.to_string()))?;
        if !meta.is_file() {
            return Err(source_error("not a regular file".into()));
        }
        Ok(Self { path: canonical })
    }

    pub fn from_token(token: &str) -> Self {
        Self {
            path: PathBuf::from(token),
        }
    }

    pub fn token(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.token())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFileEntry {
    pub path: String,
    pub mode: OpenMode,
}

#[derive(Debug)]
pub struct Volume {
    id: VolumeId,
    source: SourceHandle,
    display_name: String,
    pub(crate) state: VolumeState,
    pub(crate) session: Option<EngineSession>,
    pub(crate) open_files: HashMap<OpenRequestId, OpenFileEntry>,
    pub(crate) passphrase: Option<String>,
    /// Request the remembered passphrase was last offered to.
    pub(crate) passphrase_offered: Option<RequestId>,
    pub(crate) passphrase_declined: bool,
    next_request: RequestId,
}

impl Volume {
    pub fn new(id: VolumeId, source: SourceHandle, passphrase: Option<String>) -> Self {
        let display_name = source.display_name();
        Self {
            id,
            source,
            display_name,
            state: VolumeState::Loading,
            session: None,
            open_files: HashMap::new(),
            passphrase,
            passphrase_offered: None,
            passphrase_declined: false,
            next_request: RequestId::new(1),
        }
    }

    pub fn id(&self) -> &VolumeId {
        &self.id
    }

    pub fn source(&self) -> &SourceHandle {
        &self.source
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn state(&self) -> VolumeState {
        self.state
    }

    pub(crate) fn next_request_id(&mut self) -> RequestId {
        let id = self.next_request;
        self.next_request = id.next();
        id
    }

    pub fn record(&self) -> PersistedVolumeRecord {
        PersistedVolumeRecord {
            id: self.id.clone(),
            source_token: self.source.token(),
            passphrase: self.passphrase.clone(),
        }
    }

    pub fn snapshot(&self) -> VolumeSnapshot {
        let mut open_files: Vec<_> = self
            .open_files
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();
        open_files.sort_by_key(|(id, _)| *id);
        VolumeSnapshot {
            id: self.id.clone(),
            source: self.source.clone(),
            state: self.state,
            passphrase: self.passphrase.clone(),
            session: self.session.clone(),
            open_files,
        }
    }
}

/// Point-in-time copy of a volume for callers outside the lock.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeSnapshot {
    pub id: VolumeId,
    pub source: SourceHandle,
    pub state: VolumeState,
    pub passphrase: Option<String>,
    pub session: Option<EngineSession>,
    pub open_files: Vec<(OpenRequestId, OpenFileEntry)>,
}

#[derive(Debug, Default)]
pub struct VolumeRegistry {
    volumes: HashMap<VolumeId, Volume>,
}

impl VolumeRegistry {
    pub fn contains(&self, id: &VolumeId) -> bool {
        self.volumes.contains_key(id)
    }

    pub fn get(&self, id: &VolumeId) -> Option<&Volume> {
        self.volumes.get(id)
    }

    pub fn get_mut(&mut self, id: &VolumeId) -> Option<&mut Volume> {
        self.volumes.get_mut(id)
    }

    /// Insert unless the id is taken.
    pub fn insert(&mut self, volume: Volume) -> Result<(), MountError> {
        if self.volumes.contains_key(volume.id()) {
            return Err(MountError::Exists(volume.id().clone()));
        }
        self.volumes.insert(volume.id().clone(), volume);
        Ok(())
    }

    pub fn remove(&mut self, id: &VolumeId) -> Option<Volume> {
        self.volumes.remove(id)
    }

    /// Remove and return every volume matching `pred`.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&Volume) -> bool) -> Vec<Volume> {
        let ids: Vec<_> = self
            .volumes
            .values()
            .filter(|v| pred(v))
            .map(|v| v.id.clone())
            .collect();
        ids.iter().filter_map(|id| self.volumes.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    /// Ids of volumes that are serving requests, sorted.
    pub fn ready_ids(&self) -> Vec<VolumeId> {
        let mut ids: Vec<_> = self
            .volumes
            .values()
            .filter(|v| v.state == VolumeState::Ready)
            .map(|v| v.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// How a mount was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MountOrigin {
    /// User-initiated: the host does not know the volume yet.
    Fresh,
    /// Rebuilt after a restart: the host already has it registered.
    Restore,
}

/// Host metadata must describe the volume exactly as it was registered.
pub(crate) fn check_restorable(info: &FileSystemInfo, opened_files_limit: u32) -> Result<(), String> {
    if info.writable {
        return Err("host registered the volume as writable".into());
    }
    if info.opened_files_limit != opened_files_limit {
        return Err(format!(
            "host open-file limit {} does not match {}",
            info.opened_files_limit, opened_files_limit
        ));
    }
    if info.opened_files.len() > opened_files_limit as usize {
        return Err(format!(
            "host reports {} open files, limit is {}",
            info.opened_files.len(),
            opened_files_limit
        ));
    }
    Ok(())
}

fn unexpected_reply(id: &VolumeId, event: Option<UnpackEvent>) -> VolumeError {
    match event {
        None => VolumeError::Cancelled(id.clone()),
        Some(UnpackEvent::Error { message }) => VolumeError::Engine(EngineError::Rejected(message)),
        Some(other) => VolumeError::Protocol(format!("{other:?}")),
    }
}

fn mount_failure(id: &VolumeId, e: VolumeError) -> MountError {
    match e {
        VolumeError::Engine(e) => MountError::Engine(e),
        VolumeError::Protocol(msg) => MountError::Engine(EngineError::Rejected(msg)),
        _ => MountError::Cancelled(id.clone()),
    }
}

impl Inner {
    /// Post an unpack op for `id` and register for its replies.
    ///
    /// Allocation and send happen without yielding, so requests of one
    /// volume reach the engine in allocation order.
    pub(crate) fn post_unpack(
        &self,
        id: &VolumeId,
        op: UnpackOp,
        require_ready: bool,
    ) -> Result<Reply<UnpackEvent>, VolumeError> {
        let request_id = {
            let mut tables = self.tables.lock();
            let volume = tables
                .volumes
                .get_mut(id)
                .ok_or_else(|| VolumeError::NotMounted(id.clone()))?;
            if require_ready && volume.state != VolumeState::Ready {
                return Err(VolumeError::NotReady(id.clone()));
            }
            volume.next_request_id()
        };
        let reply = self.router.expect_unpack(id, request_id);
        let request = EngineRequest::Unpack {
            volume_id: id.clone(),
            request_id,
            op,
        };
        if let Err(e) = self.engine.send(request) {
            self.router.cancel(reply.key());
            return Err(e.into());
        }
        Ok(reply)
    }

    /// Re-check after an await that `id` is still serving.
    fn still_ready(&self, id: &VolumeId) -> Result<(), VolumeError> {
        match self.tables.lock().volumes.get(id) {
            Some(v) if v.state == VolumeState::Ready => Ok(()),
            Some(_) => Err(VolumeError::NotReady(id.clone())),
            None => Err(VolumeError::Cancelled(id.clone())),
        }
    }

    /// Post `CloseArchive` for a volume leaving the registry. Fire and forget.
    fn close_session(&self, volume: &mut Volume) {
        if self.engine.status() != EngineStatus::Loaded {
            return;
        }
        let request = EngineRequest::Unpack {
            volume_id: volume.id.clone(),
            request_id: volume.next_request_id(),
            op: UnpackOp::CloseArchive,
        };
        if let Err(e) = self.engine.send(request) {
            debug!(volume = %volume.id, error = %e, "could not close engine session");
        }
    }

    // ========================================================================
    // Mount
    // ========================================================================

    /// Open `source` in the engine and bring the volume to `Ready`.
    ///
    /// For a restore, `reopen` lists files the host still holds open; each
    /// is opened again under its original open-request id.
    pub(crate) async fn mount_volume(
        self: &Arc<Self>,
        id: VolumeId,
        source: SourceHandle,
        passphrase: Option<String>,
        reopen: Vec<OpenedFile>,
        origin: MountOrigin,
        attempt: &mut MountAttempt,
    ) -> Result<(), MountError> {
        self.tables
            .lock()
            .volumes
            .insert(Volume::new(id.clone(), source.clone(), passphrase.clone()))?;

        let result = self
            .open_volume(&id, &source, passphrase, reopen, origin, attempt)
            .await;
        if let Err(e) = &result {
            debug!(volume = %id, error = %e, "abandoning volume reservation");
            self.abandon_loading(&id);
        }
        result
    }

    async fn open_volume(
        self: &Arc<Self>,
        id: &VolumeId,
        source: &SourceHandle,
        passphrase: Option<String>,
        reopen: Vec<OpenedFile>,
        origin: MountOrigin,
        attempt: &mut MountAttempt,
    ) -> Result<(), MountError> {
        attempt.advance(MountAttemptState::EngineLoading);
        self.engine.ensure_loaded().await?;

        attempt.advance(MountAttemptState::VolumeLoading);
        let open = UnpackOp::OpenArchive {
            source: source.token(),
            passphrase,
        };
        let mut reply = self
            .post_unpack(id, open, false)
            .map_err(|e| mount_failure(id, e))?;
        let session = match reply.next().await {
            Some(UnpackEvent::ArchiveOpened { session }) => session,
            Some(UnpackEvent::Error { message }) => {
                let declined = self
                    .tables
                    .lock()
                    .volumes
                    .get(id)
                    .is_some_and(|v| v.passphrase_declined);
                return Err(if declined {
                    MountError::PassphraseDeclined
                } else {
                    EngineError::Rejected(message).into()
                });
            }
            other => return Err(mount_failure(id, unexpected_reply(id, other))),
        };
        {
            let mut tables = self.tables.lock();
            let volume = tables
                .volumes
                .get_mut(id)
                .filter(|v| v.state == VolumeState::Loading)
                .ok_or_else(|| MountError::Cancelled(id.clone()))?;
            volume.session = Some(session);
        }

        let mut reopened = HashMap::new();
        for file in reopen {
            let op = UnpackOp::OpenFile {
                open_request_id: file.open_request_id,
                path: file.path.clone(),
                mode: file.mode,
            };
            let mut reply = self.post_unpack(id, op, false).map_err(|e| mount_failure(id, e))?;
            match reply.next().await {
                Some(UnpackEvent::FileOpened) => {
                    debug!(volume = %id, open = %file.open_request_id, path = %file.path, "reopened file");
                    reopened.insert(
                        file.open_request_id,
                        OpenFileEntry {
                            path: file.path,
                            mode: file.mode,
                        },
                    );
                }
                other => return Err(mount_failure(id, unexpected_reply(id, other))),
            }
        }

        let registered = origin == MountOrigin::Fresh;
        if registered {
            let request = MountRequest {
                id: id.clone(),
                display_name: source.display_name(),
                opened_files_limit: self.config.opened_files_limit,
                writable: false,
            };
            self.provider.mount(&request).await?;
        }

        let (ready, replaced) = {
            let mut tables = self.tables.lock();
            match tables.volumes.get_mut(id) {
                Some(volume) if volume.state == VolumeState::Loading => {
                    volume.state = VolumeState::Ready;
                    volume.open_files = reopened;
                    (true, false)
                }
                Some(volume) => (false, volume.state != VolumeState::Unmounting),
                None => (false, false),
            }
        };
        if !ready {
            // Unmounted while the host was registering us. Only our own
            // registration is undone, never one a newer mount made.
            if registered && !replaced {
                debug!(volume = %id, "mount cancelled after host registration, detaching");
                if let Err(e) = self.provider.unmount(id).await {
                    warn!(volume = %id, error = %e, "host failed to detach cancelled volume");
                }
            }
            return Err(MountError::Cancelled(id.clone()));
        }

        if let Err(e) = self.save_volumes(std::slice::from_ref(id)).await {
            warn!(volume = %id, error = %e, "could not persist volume record");
        }
        attempt.advance(MountAttemptState::Mounted);
        info!(volume = %id, source = %source.token(), ?origin, "volume mounted");
        Ok(())
    }

    /// Drop a reservation whose mount failed. Leaves volumes another flow
    /// already took over (unmounting) alone.
    fn abandon_loading(&self, id: &VolumeId) {
        let removed = {
            let mut tables = self.tables.lock();
            let loading = tables
                .volumes
                .get(id)
                .is_some_and(|v| v.state == VolumeState::Loading);
            if loading {
                tables.volumes.remove(id)
            } else {
                None
            }
        };
        if let Some(mut volume) = removed {
            self.router.forget_entity(&EntityId::Volume(id.clone()));
            if volume.session.is_some() {
                self.close_session(&mut volume);
            }
        }
    }

    // ========================================================================
    // Restore
    // ========================================================================

    /// Rebuild a volume the host still has registered from its persisted
    /// record. On any failure the volume is force-unmounted.
    pub(crate) async fn restore_volume(
        self: &Arc<Self>,
        id: &VolumeId,
        attempt: &mut MountAttempt,
    ) -> Result<(), RestoreError> {
        let result = self.try_restore(id, attempt).await;
        if let Err(e) = &result {
            warn!(volume = %id, error = %e, "restore failed, force-unmounting");
            if let Err(e) = self.unmount_volume(id, true).await {
                warn!(volume = %id, error = %e, "forced unmount after failed restore did not complete");
            }
        }
        result
    }

    async fn try_restore(
        self: &Arc<Self>,
        id: &VolumeId,
        attempt: &mut MountAttempt,
    ) -> Result<(), RestoreError> {
        let record = self
            .store
            .restore(id)
            .await
            .map_err(|e| RestoreError::failed(id, e))?;
        let info = self
            .provider
            .file_system_info(id)
            .await
            .ok_or_else(|| RestoreError::failed(id, "host does not have this volume registered"))?;
        check_restorable(&info, self.config.opened_files_limit)
            .map_err(|reason| RestoreError::failed(id, reason))?;

        info!(volume = %id, source = %record.source_token, reopen = info.opened_files.len(), "restoring volume");
        self.mount_volume(
            id.clone(),
            SourceHandle::from_token(&record.source_token),
            record.passphrase,
            info.opened_files,
            MountOrigin::Restore,
            attempt,
        )
        .await
        .map_err(|e| RestoreError::failed(id, e))
    }

    // ========================================================================
    // Unmount
    // ========================================================================

    /// Detach a volume. Unforced unmounts refuse while files are open.
    /// Unmounting an unknown id still clears host and persisted state.
    ///
    /// A volume that is not in memory (not restored since a restart) has no
    /// open-file table of its own; the host's list decides instead.
    pub(crate) async fn unmount_volume(&self, id: &VolumeId, force: bool) -> Result<(), UnmountError> {
        let in_memory = self.tables.lock().volumes.contains(id);
        if !force && !in_memory {
            if let Some(info) = self.provider.file_system_info(id).await {
                if !info.opened_files.is_empty() {
                    return Err(UnmountError::InUse {
                        id: id.clone(),
                        open_files: info.opened_files.len(),
                    });
                }
            }
        }

        let (known, stale_load) = {
            let mut tables = self.tables.lock();
            let known = match tables.volumes.get_mut(id) {
                Some(volume) => {
                    if !force && !volume.open_files.is_empty() {
                        return Err(UnmountError::InUse {
                            id: id.clone(),
                            open_files: volume.open_files.len(),
                        });
                    }
                    volume.state = VolumeState::Unmounting;
                    volume.open_files.clear();
                    if volume.session.take().is_some() {
                        self.close_session(volume);
                    }
                    true
                }
                None => false,
            };
            (known, tables.loads.remove(id))
        };
        // A dropped load may release its in-flight guard, which takes the lock.
        drop(stale_load);
        self.router.forget_entity(&EntityId::Volume(id.clone()));

        if known {
            info!(volume = %id, force, "unmounting volume");
        } else {
            debug!(volume = %id, force, "unmounting volume that is not in memory");
        }

        if let Err(e) = self.provider.unmount(id).await {
            warn!(volume = %id, error = %e, "host failed to detach volume");
        }

        {
            let mut tables = self.tables.lock();
            if tables
                .volumes
                .get(id)
                .is_some_and(|v| v.state == VolumeState::Unmounting)
            {
                tables.volumes.remove(id);
            }
        }

        if let Err(e) = self.store.remove(id).await {
            warn!(volume = %id, error = %e, "could not remove persisted record");
        }
        self.maybe_unload();
        Ok(())
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Persist records for every `Ready` volume among `ids`.
    pub(crate) async fn save_volumes(&self, ids: &[VolumeId]) -> Result<(), PersistError> {
        let records: Vec<_> = {
            let tables = self.tables.lock();
            ids.iter()
                .filter_map(|id| tables.volumes.get(id))
                .filter(|v| v.state == VolumeState::Ready)
                .map(Volume::record)
                .collect()
        };
        self.store.save(&records).await
    }

    // ========================================================================
    // Passphrase
    // ========================================================================

    /// Answer an engine passphrase request: the remembered passphrase first,
    /// otherwise ask the host.
    pub(crate) async fn answer_passphrase(&self, id: VolumeId, request: RequestId) {
        let (remembered, display_name) = {
            let mut tables = self.tables.lock();
            let Some(volume) = tables.volumes.get_mut(&id) else {
                return;
            };
            let remembered = match &volume.passphrase {
                Some(p) if volume.passphrase_offered != Some(request) => {
                    volume.passphrase_offered = Some(request);
                    Some(p.clone())
                }
                _ => None,
            };
            (remembered, volume.display_name.clone())
        };

        let passphrase = match remembered {
            Some(p) => {
                debug!(volume = %id, "answering passphrase request from memory");
                Some(p)
            }
            None => {
                let answer = self.provider.request_passphrase(&id, &display_name).await;
                let mut tables = self.tables.lock();
                let Some(volume) = tables.volumes.get_mut(&id) else {
                    debug!(volume = %id, "volume went away while prompting for passphrase");
                    return;
                };
                match &answer {
                    Some(p) => volume.passphrase = Some(p.clone()),
                    None => volume.passphrase_declined = true,
                }
                answer
            }
        };

        let reply = EngineRequest::Unpack {
            volume_id: id.clone(),
            request_id: request,
            op: UnpackOp::PassphraseReply { passphrase },
        };
        if let Err(e) = self.engine.send(reply) {
            warn!(volume = %id, error = %e, "could not answer passphrase request");
        }
    }

    // ========================================================================
    // Per-call operations
    // ========================================================================

    pub(crate) async fn get_metadata(&self, id: &VolumeId, path: &str) -> Result<EntryMetadata, VolumeError> {
        let op = UnpackOp::GetMetadata { path: path.to_string() };
        let mut reply = self.post_unpack(id, op, true)?;
        match reply.next().await {
            Some(UnpackEvent::Metadata { entry }) => Ok(entry),
            other => Err(unexpected_reply(id, other)),
        }
    }

    /// Stream a directory listing page by page. `on_page` gets each page
    /// and whether more follow.
    pub(crate) async fn read_directory(
        &self,
        id: &VolumeId,
        path: &str,
        on_page: &mut (dyn FnMut(Vec<EntryMetadata>, bool) + Send),
    ) -> Result<(), VolumeError> {
        let op = UnpackOp::ReadDirectory { path: path.to_string() };
        let mut reply = self.post_unpack(id, op, true)?;
        loop {
            match reply.next().await {
                Some(UnpackEvent::DirectoryPage { entries, has_more }) => {
                    if let Err(e) = self.still_ready(id) {
                        self.router.cancel(reply.key());
                        return Err(e);
                    }
                    on_page(entries, has_more);
                    if !has_more {
                        return Ok(());
                    }
                }
                other => {
                    self.router.cancel(reply.key());
                    return Err(unexpected_reply(id, other));
                }
            }
        }
    }

    pub(crate) async fn open_file(
        &self,
        id: &VolumeId,
        open_id: OpenRequestId,
        path: &str,
        mode: OpenMode,
    ) -> Result<(), VolumeError> {
        {
            let tables = self.tables.lock();
            let volume = tables
                .volumes
                .get(id)
                .ok_or_else(|| VolumeError::NotMounted(id.clone()))?;
            if volume.open_files.contains_key(&open_id) {
                return Err(VolumeError::DuplicateOpenRequest {
                    volume: id.clone(),
                    open: open_id,
                });
            }
        }

        let op = UnpackOp::OpenFile {
            open_request_id: open_id,
            path: path.to_string(),
            mode,
        };
        let mut reply = self.post_unpack(id, op, true)?;
        match reply.next().await {
            Some(UnpackEvent::FileOpened) => {
                let mut tables = self.tables.lock();
                let volume = tables
                    .volumes
                    .get_mut(id)
                    .filter(|v| v.state == VolumeState::Ready)
                    .ok_or_else(|| VolumeError::Cancelled(id.clone()))?;
                volume.open_files.insert(
                    open_id,
                    OpenFileEntry {
                        path: path.to_string(),
                        mode,
                    },
                );
                Ok(())
            }
            other => Err(unexpected_reply(id, other)),
        }
    }

    /// Close a file. The open request is forgotten even if the engine
    /// reports an error.
    pub(crate) async fn close_file(&self, id: &VolumeId, open_id: OpenRequestId) -> Result<(), VolumeError> {
        self.require_open(id, open_id)?;
        let mut reply = self.post_unpack(id, UnpackOp::CloseFile { open_request_id: open_id }, true)?;
        let event = reply.next().await;
        if let Some(volume) = self.tables.lock().volumes.get_mut(id) {
            volume.open_files.remove(&open_id);
        }
        match event {
            Some(UnpackEvent::FileClosed) => Ok(()),
            other => Err(unexpected_reply(id, other)),
        }
    }

    /// Stream `length` bytes from `offset` in chunks.
    pub(crate) async fn read_file(
        &self,
        id: &VolumeId,
        open_id: OpenRequestId,
        offset: u64,
        length: u64,
        on_chunk: &mut (dyn FnMut(Vec<u8>, bool) + Send),
    ) -> Result<(), VolumeError> {
        self.require_open(id, open_id)?;
        let op = UnpackOp::ReadFile {
            open_request_id: open_id,
            offset,
            length,
        };
        let mut reply = self.post_unpack(id, op, true)?;
        loop {
            match reply.next().await {
                Some(UnpackEvent::FileChunk { data, has_more }) => {
                    if let Err(e) = self.still_ready(id) {
                        self.router.cancel(reply.key());
                        return Err(e);
                    }
                    on_chunk(data, has_more);
                    if !has_more {
                        return Ok(());
                    }
                }
                other => {
                    self.router.cancel(reply.key());
                    return Err(unexpected_reply(id, other));
                }
            }
        }
    }

    fn require_open(&self, id: &VolumeId, open_id: OpenRequestId) -> Result<(), VolumeError> {
        let tables = self.tables.lock();
        let volume = tables
            .volumes
            .get(id)
            .ok_or_else(|| VolumeError::NotMounted(id.clone()))?;
        if !volume.open_files.contains_key(&open_id) {
            return Err(VolumeError::UnknownOpenRequest {
                volume: id.clone(),
                open: open_id,
            });
        }
        Ok(())
    }
}
