//! In-memory codec engine and recording host for tests.
//!
//! Enabled for this crate's own tests and, through the `test-mock` feature,
//! for integration tests and downstream crates.
//!
//! [`MemoryEngine`] serves archives registered with
//! [`add_archive`](MemoryEngine::add_archive) and writes pack output as a
//! plain listing of the packed item names. Every launch, shutdown and
//! request is counted so tests can assert on engine lifetime.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use archmount_types::{
    CompressorId, EngineMessage, EngineRequest, EngineSession, EntryMetadata, OpenRequestId,
    PackEvent, PackOp, RequestId, UnpackEvent, UnpackOp, VolumeId,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Semaphore;

use crate::engine::{EngineChannel, EngineHandle, EngineLauncher, InboundSender};
use crate::error::EngineError;
use crate::provider::{FileSystemInfo, FileSystemProvider, MountRequest, OpenedFile, ProviderError};

const DEFAULT_PAGE_SIZE: usize = 2;
const DEFAULT_CHUNK_SIZE: usize = 4;

/// Progress reported for every successful pack job. Includes a repeat and a
/// regression on purpose.
pub const PACK_PROGRESS: [f64; 7] = [0.0, 0.25, 0.25, 0.2, 0.5, 0.999, 1.0];

/// An archive the memory engine can open.
#[derive(Debug, Clone, Default)]
pub struct MemoryArchive {
    files: BTreeMap<String, Vec<u8>>,
    passphrase: Option<String>,
    corrupt: bool,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file at `path` (slash-separated, leading slash optional).
    pub fn with_file(mut self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        self.files.insert(normalize(path), data.into());
        self
    }

    pub fn with_passphrase(mut self, passphrase: &str) -> Self {
        self.passphrase = Some(passphrase.to_string());
        self
    }

    /// Every open attempt fails.
    pub fn corrupt(mut self) -> Self {
        self.corrupt = true;
        self
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[derive(Default)]
struct EngineShared {
    archives: Mutex<HashMap<String, MemoryArchive>>,
    launches: AtomicUsize,
    shutdowns: AtomicUsize,
    fail_launches: AtomicBool,
    gate: Mutex<Option<Arc<Semaphore>>>,
    requests: Mutex<Vec<EngineRequest>>,
    page_size: AtomicUsize,
    hold_opens: AtomicBool,
    held: Mutex<Vec<(InboundSender, EngineMessage)>>,
    channels: Mutex<Vec<Weak<MemoryChannel>>>,
}

/// Scriptable in-process codec engine.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    shared: Arc<EngineShared>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `archive` for the source token `token`.
    pub fn add_archive(&self, token: impl Into<String>, archive: MemoryArchive) {
        self.shared.archives.lock().insert(token.into(), archive);
    }

    /// Serve `archive` for the file at `path`, keyed by its canonical path.
    pub fn add_archive_at(&self, path: &Path, archive: MemoryArchive) {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.add_archive(canonical.to_string_lossy().into_owned(), archive);
    }

    pub fn launches(&self) -> usize {
        self.shared.launches.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shared.shutdowns.load(Ordering::SeqCst)
    }

    /// Everything posted so far, in order.
    pub fn requests(&self) -> Vec<EngineRequest> {
        self.shared.requests.lock().clone()
    }

    pub fn unpack_ops(&self) -> Vec<(VolumeId, UnpackOp)> {
        self.requests()
            .into_iter()
            .filter_map(|r| match r {
                EngineRequest::Unpack { volume_id, op, .. } => Some((volume_id, op)),
                EngineRequest::Pack { .. } => None,
            })
            .collect()
    }

    pub fn pack_ops(&self) -> Vec<(CompressorId, PackOp)> {
        self.requests()
            .into_iter()
            .filter_map(|r| match r {
                EngineRequest::Pack { compressor_id, op, .. } => Some((compressor_id, op)),
                EngineRequest::Unpack { .. } => None,
            })
            .collect()
    }

    pub fn fail_launches(&self, fail: bool) {
        self.shared.fail_launches.store(fail, Ordering::SeqCst);
    }

    /// Make launches wait until [`release_launches`](Self::release_launches).
    pub fn hold_launches(&self) {
        *self.shared.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_launches(&self) {
        if let Some(gate) = self.shared.gate.lock().take() {
            gate.close();
        }
    }

    pub fn set_page_size(&self, entries: usize) {
        self.shared.page_size.store(entries, Ordering::SeqCst);
    }

    /// Queue replies to `OpenArchive` until [`release_opens`](Self::release_opens).
    pub fn hold_opens(&self) {
        self.shared.hold_opens.store(true, Ordering::SeqCst);
    }

    pub fn release_opens(&self) {
        self.shared.hold_opens.store(false, Ordering::SeqCst);
        let held = std::mem::take(&mut *self.shared.held.lock());
        for (inbound, message) in held {
            let _ = inbound.send(message);
        }
    }

    /// Kill every running engine as if its process died. Queued replies
    /// are lost.
    pub fn crash(&self) {
        self.shared.held.lock().clear();
        let channels = std::mem::take(&mut *self.shared.channels.lock());
        for channel in channels.iter().filter_map(Weak::upgrade) {
            if channel.alive.swap(false, Ordering::SeqCst) {
                channel.inbound.disconnected("memory engine crashed");
            }
        }
    }
}

#[async_trait]
impl EngineLauncher for MemoryEngine {
    async fn launch(&self, inbound: InboundSender) -> Result<EngineHandle, EngineError> {
        self.shared.launches.fetch_add(1, Ordering::SeqCst);
        let gate = self.shared.gate.lock().clone();
        if let Some(gate) = gate {
            // Closing the semaphore is the release signal.
            let _ = gate.acquire().await;
        }
        if self.shared.fail_launches.load(Ordering::SeqCst) {
            return Err(EngineError::Launch("memory engine refused to start".into()));
        }
        let channel = Arc::new(MemoryChannel {
            shared: Arc::clone(&self.shared),
            inbound,
            alive: AtomicBool::new(true),
            sessions: Mutex::new(HashMap::new()),
            open_files: Mutex::new(HashMap::new()),
            awaiting_passphrase: Mutex::new(HashMap::new()),
        });
        self.shared.channels.lock().push(Arc::downgrade(&channel));
        Ok(channel)
    }
}

struct MemoryChannel {
    shared: Arc<EngineShared>,
    inbound: InboundSender,
    alive: AtomicBool,
    /// Volume → source token of its open session.
    sessions: Mutex<HashMap<VolumeId, String>>,
    open_files: Mutex<HashMap<(VolumeId, OpenRequestId), String>>,
    awaiting_passphrase: Mutex<HashMap<(VolumeId, RequestId), String>>,
}

fn error(message: impl Into<String>) -> UnpackEvent {
    UnpackEvent::Error {
        message: message.into(),
    }
}

impl MemoryChannel {
    fn page_size(&self) -> usize {
        match self.shared.page_size.load(Ordering::SeqCst) {
            0 => DEFAULT_PAGE_SIZE,
            n => n,
        }
    }

    fn archive_for(&self, volume: &VolumeId) -> Option<MemoryArchive> {
        let token = self.sessions.lock().get(volume).cloned()?;
        self.shared.archives.lock().get(&token).cloned()
    }

    fn unpack(&self, volume: &VolumeId, request: RequestId, op: UnpackOp) -> Vec<UnpackEvent> {
        match op {
            UnpackOp::OpenArchive { source, passphrase } => {
                self.open_archive(volume, request, source, passphrase)
            }
            UnpackOp::PassphraseReply { passphrase } => {
                let pending = self
                    .awaiting_passphrase
                    .lock()
                    .remove(&(volume.clone(), request));
                match (pending, passphrase) {
                    (None, _) => vec![error("no passphrase request pending")],
                    (Some(_), None) => vec![error("passphrase declined")],
                    (Some(source), Some(p)) => self.open_archive(volume, request, source, Some(p)),
                }
            }
            UnpackOp::CloseArchive => {
                self.sessions.lock().remove(volume);
                self.open_files.lock().retain(|(v, _), _| v != volume);
                vec![UnpackEvent::ArchiveClosed]
            }
            UnpackOp::GetMetadata { path } => match self.archive_for(volume) {
                Some(archive) => vec![metadata(&archive, &path)],
                None => vec![error("no open session")],
            },
            UnpackOp::ReadDirectory { path } => match self.archive_for(volume) {
                Some(archive) => list(&archive, &path, self.page_size()),
                None => vec![error("no open session")],
            },
            UnpackOp::OpenFile {
                open_request_id,
                path,
                ..
            } => {
                let Some(archive) = self.archive_for(volume) else {
                    return vec![error("no open session")];
                };
                let path = normalize(&path);
                if !archive.files.contains_key(&path) {
                    return vec![error(format!("no such file: {path}"))];
                }
                self.open_files
                    .lock()
                    .insert((volume.clone(), open_request_id), path);
                vec![UnpackEvent::FileOpened]
            }
            UnpackOp::CloseFile { open_request_id } => {
                match self.open_files.lock().remove(&(volume.clone(), open_request_id)) {
                    Some(_) => vec![UnpackEvent::FileClosed],
                    None => vec![error("file is not open")],
                }
            }
            UnpackOp::ReadFile {
                open_request_id,
                offset,
                length,
            } => {
                let path = self
                    .open_files
                    .lock()
                    .get(&(volume.clone(), open_request_id))
                    .cloned();
                let data = path.and_then(|p| self.archive_for(volume)?.files.get(&p).cloned());
                match data {
                    Some(data) => chunks(&data, offset, length),
                    None => vec![error("file is not open")],
                }
            }
        }
    }

    fn open_archive(
        &self,
        volume: &VolumeId,
        request: RequestId,
        source: String,
        passphrase: Option<String>,
    ) -> Vec<UnpackEvent> {
        let Some(archive) = self.shared.archives.lock().get(&source).cloned() else {
            return vec![error(format!("archive not found: {source}"))];
        };
        if archive.corrupt {
            return vec![error("archive is corrupt")];
        }
        match (&archive.passphrase, passphrase) {
            (Some(expected), Some(given)) if *expected != given => vec![error("wrong passphrase")],
            (Some(_), None) => {
                self.awaiting_passphrase
                    .lock()
                    .insert((volume.clone(), request), source);
                vec![UnpackEvent::PassphraseRequired]
            }
            _ => {
                self.sessions.lock().insert(volume.clone(), source.clone());
                vec![UnpackEvent::ArchiveOpened {
                    session: EngineSession(json!({
                        "source": source,
                        "entries": archive.files.len(),
                    })),
                }]
            }
        }
    }

    fn pack(&self, op: PackOp) -> Vec<PackEvent> {
        match op {
            PackOp::Create { output, items } => create_archive(&output, &items),
            PackOp::Abort => vec![PackEvent::Aborted],
            PackOp::Close => vec![PackEvent::Closed],
        }
    }
}

fn metadata(archive: &MemoryArchive, path: &str) -> UnpackEvent {
    let path = normalize(path);
    if path.is_empty() {
        return UnpackEvent::Metadata {
            entry: EntryMetadata::directory(""),
        };
    }
    if let Some(data) = archive.files.get(&path) {
        return UnpackEvent::Metadata {
            entry: EntryMetadata::file(basename(&path), data.len() as u64),
        };
    }
    let prefix = format!("{path}/");
    if archive.files.keys().any(|k| k.starts_with(&prefix)) {
        return UnpackEvent::Metadata {
            entry: EntryMetadata::directory(basename(&path)),
        };
    }
    error(format!("not found: {path}"))
}

fn list(archive: &MemoryArchive, path: &str, page_size: usize) -> Vec<UnpackEvent> {
    let path = normalize(path);
    let prefix = if path.is_empty() {
        String::new()
    } else {
        format!("{path}/")
    };

    let mut entries = BTreeMap::new();
    for (key, data) in &archive.files {
        let Some(rest) = key.strip_prefix(&prefix) else {
            continue;
        };
        match rest.split_once('/') {
            Some((dir, _)) => {
                entries.insert(dir.to_string(), EntryMetadata::directory(dir));
            }
            None => {
                entries.insert(rest.to_string(), EntryMetadata::file(rest, data.len() as u64));
            }
        }
    }
    if entries.is_empty() && !path.is_empty() {
        return vec![error(format!("not a directory: {path}"))];
    }

    let entries: Vec<_> = entries.into_values().collect();
    if entries.is_empty() {
        return vec![UnpackEvent::DirectoryPage {
            entries,
            has_more: false,
        }];
    }
    let pages = entries.chunks(page_size).count();
    entries
        .chunks(page_size)
        .enumerate()
        .map(|(i, page)| UnpackEvent::DirectoryPage {
            entries: page.to_vec(),
            has_more: i + 1 < pages,
        })
        .collect()
}

fn chunks(data: &[u8], offset: u64, length: u64) -> Vec<UnpackEvent> {
    let start = (offset as usize).min(data.len());
    let end = (offset.saturating_add(length) as usize).min(data.len());
    let slice = &data[start..end];
    if slice.is_empty() {
        return vec![UnpackEvent::FileChunk {
            data: Vec::new(),
            has_more: false,
        }];
    }
    let count = slice.chunks(DEFAULT_CHUNK_SIZE).count();
    slice
        .chunks(DEFAULT_CHUNK_SIZE)
        .enumerate()
        .map(|(i, chunk)| UnpackEvent::FileChunk {
            data: chunk.to_vec(),
            has_more: i + 1 < count,
        })
        .collect()
}

/// Items whose path contains `corrupt` fail midway after writing a partial
/// output.
fn create_archive(output: &Path, items: &[PathBuf]) -> Vec<PackEvent> {
    for item in items {
        if !item.exists() {
            return vec![PackEvent::Error {
                message: format!("cannot read {}", item.display()),
            }];
        }
    }
    if items.iter().any(|i| i.to_string_lossy().contains("corrupt")) {
        let _ = std::fs::write(output, b"partial");
        return vec![
            PackEvent::Progress { fraction: 0.3 },
            PackEvent::Error {
                message: "failed to compress".into(),
            },
        ];
    }

    let listing: Vec<String> = items
        .iter()
        .filter_map(|i| i.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .collect();
    if let Err(e) = std::fs::write(output, listing.join("\n")) {
        return vec![PackEvent::Error {
            message: e.to_string(),
        }];
    }

    let mut events: Vec<_> = PACK_PROGRESS
        .iter()
        .map(|&fraction| PackEvent::Progress { fraction })
        .collect();
    events.push(PackEvent::Done);
    events
}

impl EngineChannel for MemoryChannel {
    fn post(&self, request: EngineRequest) -> Result<(), EngineError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        self.shared.requests.lock().push(request.clone());

        let hold = matches!(
            request,
            EngineRequest::Unpack {
                op: UnpackOp::OpenArchive { .. },
                ..
            }
        ) && self.shared.hold_opens.load(Ordering::SeqCst);

        let messages: Vec<EngineMessage> = match request {
            EngineRequest::Unpack {
                volume_id,
                request_id,
                op,
            } => self
                .unpack(&volume_id, request_id, op)
                .into_iter()
                .map(|event| EngineMessage::Unpack {
                    volume_id: volume_id.clone(),
                    request_id,
                    event,
                })
                .collect(),
            EngineRequest::Pack {
                compressor_id,
                request_id,
                op,
            } => self
                .pack(op)
                .into_iter()
                .map(|event| EngineMessage::Pack {
                    compressor_id,
                    request_id,
                    event,
                })
                .collect(),
        };

        for message in messages {
            if hold {
                self.shared.held.lock().push((self.inbound.clone(), message));
            } else if self.inbound.send(message).is_err() {
                return Err(EngineError::Closed);
            }
        }
        Ok(())
    }

    fn shutdown(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.shared.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ============================================================================
// Host
// ============================================================================

#[derive(Default)]
struct HostState {
    registered: BTreeMap<VolumeId, FileSystemInfo>,
    mounts: Vec<VolumeId>,
    unmounts: Vec<VolumeId>,
    passphrase: Option<String>,
    prompts: usize,
    refuse_mounts: bool,
    mount_gate: Option<Arc<Semaphore>>,
}

/// Host provider that remembers registrations the way a real host does
/// across orchestrator restarts, and records every call.
#[derive(Default)]
pub struct RecordingHost {
    state: Mutex<HostState>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// What the simulated user types when prompted. `None` declines.
    pub fn answer_passphrase(&self, passphrase: Option<&str>) {
        self.state.lock().passphrase = passphrase.map(str::to_string);
    }

    pub fn refuse_mounts(&self, refuse: bool) {
        self.state.lock().refuse_mounts = refuse;
    }

    /// Make registrations wait until [`release_mounts`](Self::release_mounts).
    /// The call is recorded before it waits.
    pub fn hold_mounts(&self) {
        self.state.lock().mount_gate = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_mounts(&self) {
        if let Some(gate) = self.state.lock().mount_gate.take() {
            gate.close();
        }
    }

    /// Pretend the host remembers `info` from an earlier run.
    pub fn register(&self, info: FileSystemInfo) {
        self.state.lock().registered.insert(info.id.clone(), info);
    }

    /// Replace the files the host believes are open on `id`.
    pub fn set_opened_files(&self, id: &VolumeId, files: Vec<OpenedFile>) {
        if let Some(info) = self.state.lock().registered.get_mut(id) {
            info.opened_files = files;
        }
    }

    pub fn is_registered(&self, id: &VolumeId) -> bool {
        self.state.lock().registered.contains_key(id)
    }

    pub fn info(&self, id: &VolumeId) -> Option<FileSystemInfo> {
        self.state.lock().registered.get(id).cloned()
    }

    pub fn mount_calls(&self) -> Vec<VolumeId> {
        self.state.lock().mounts.clone()
    }

    pub fn unmount_calls(&self) -> Vec<VolumeId> {
        self.state.lock().unmounts.clone()
    }

    pub fn passphrase_prompts(&self) -> usize {
        self.state.lock().prompts
    }
}

#[async_trait]
impl FileSystemProvider for RecordingHost {
    async fn mount(&self, request: &MountRequest) -> Result<(), ProviderError> {
        let gate = {
            let mut state = self.state.lock();
            if state.refuse_mounts {
                return Err(ProviderError::Failed("host refused the mount".into()));
            }
            state.mounts.push(request.id.clone());
            state.mount_gate.clone()
        };
        if let Some(gate) = gate {
            // Closing the semaphore is the release signal.
            let _ = gate.acquire().await;
        }

        self.state.lock().registered.insert(
            request.id.clone(),
            FileSystemInfo {
                id: request.id.clone(),
                display_name: request.display_name.clone(),
                opened_files_limit: request.opened_files_limit,
                writable: request.writable,
                opened_files: Vec::new(),
            },
        );
        Ok(())
    }

    async fn unmount(&self, id: &VolumeId) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        state.unmounts.push(id.clone());
        state.registered.remove(id);
        Ok(())
    }

    async fn file_system_info(&self, id: &VolumeId) -> Option<FileSystemInfo> {
        self.state.lock().registered.get(id).cloned()
    }

    async fn request_passphrase(&self, _id: &VolumeId, _display_name: &str) -> Option<String> {
        let mut state = self.state.lock();
        state.prompts += 1;
        state.passphrase.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive() -> MemoryArchive {
        MemoryArchive::new()
            .with_file("/a.txt", "hello world")
            .with_file("/docs/b.md", "# b")
            .with_file("/docs/c.md", "# c")
            .with_file("/docs/deep/d.md", "# d")
    }

    #[test]
    fn lists_immediate_children_in_pages() {
        let events = list(&archive(), "/docs", 2);
        assert_eq!(
            events,
            vec![
                UnpackEvent::DirectoryPage {
                    entries: vec![EntryMetadata::file("b.md", 3), EntryMetadata::file("c.md", 3)],
                    has_more: true,
                },
                UnpackEvent::DirectoryPage {
                    entries: vec![EntryMetadata::directory("deep")],
                    has_more: false,
                },
            ]
        );
    }

    #[test]
    fn metadata_for_files_and_implied_directories() {
        let archive = archive();
        assert_eq!(
            metadata(&archive, "/a.txt"),
            UnpackEvent::Metadata {
                entry: EntryMetadata::file("a.txt", 11)
            }
        );
        assert_eq!(
            metadata(&archive, "/docs/deep"),
            UnpackEvent::Metadata {
                entry: EntryMetadata::directory("deep")
            }
        );
        assert!(matches!(metadata(&archive, "/nope"), UnpackEvent::Error { .. }));
    }

    #[test]
    fn reads_are_chunked_and_bounded() {
        let events = chunks(b"hello world", 6, 100);
        assert_eq!(
            events,
            vec![
                UnpackEvent::FileChunk {
                    data: b"worl".to_vec(),
                    has_more: true,
                },
                UnpackEvent::FileChunk {
                    data: b"d".to_vec(),
                    has_more: false,
                },
            ]
        );
        assert_eq!(
            chunks(b"abc", 10, 5),
            vec![UnpackEvent::FileChunk {
                data: vec![],
                has_more: false,
            }]
        );
    }
}
