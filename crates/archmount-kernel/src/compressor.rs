//! Pack jobs.
//!
//! A [`Compressor`] exists from `create` until its terminal event has been
//! delivered and `cleanup` has run. While it exists it keeps the codec
//! engine alive.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use archmount_types::{CompressorId, EngineRequest, EntityId, PackEvent, PackOp, RequestId};
use strum::Display;
use tracing::{debug, info, warn};

use crate::engine::EngineStatus;
use crate::error::{EngineError, PackError};
use crate::orchestrator::Inner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CompressorState {
    Compressing,
    Succeeded,
    Failed,
}

#[derive(Debug)]
pub struct Compressor {
    id: CompressorId,
    items: Vec<PathBuf>,
    output: PathBuf,
    state: CompressorState,
    progress: f64,
    last_percent: Option<u8>,
    next_request: RequestId,
}

impl Compressor {
    fn new(id: CompressorId, items: Vec<PathBuf>, output: PathBuf) -> Self {
        Self {
            id,
            items,
            output,
            state: CompressorState::Compressing,
            progress: 0.0,
            last_percent: None,
            next_request: RequestId::new(1),
        }
    }

    pub fn id(&self) -> CompressorId {
        self.id
    }

    pub fn items(&self) -> &[PathBuf] {
        &self.items
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn state(&self) -> CompressorState {
        self.state
    }

    /// Completed fraction, clamped to `[0, 1]` and never decreasing.
    pub fn progress(&self) -> f64 {
        self.progress
    }

    fn next_request_id(&mut self) -> RequestId {
        let id = self.next_request;
        self.next_request = id.next();
        id
    }

    /// Fold one progress report in. Returns the percentage to show when it
    /// changed, `None` otherwise.
    pub(crate) fn record_progress(&mut self, fraction: f64) -> Option<u8> {
        if !fraction.is_finite() {
            return None;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        if fraction > self.progress {
            self.progress = fraction;
        }
        let percent = (self.progress * 100.0).round() as u8;
        if self.last_percent.is_some_and(|last| last >= percent) {
            return None;
        }
        self.last_percent = Some(percent);
        Some(percent)
    }
}

#[derive(Debug)]
pub struct CompressorRegistry {
    compressors: HashMap<CompressorId, Compressor>,
    next_id: CompressorId,
}

impl Default for CompressorRegistry {
    fn default() -> Self {
        Self {
            compressors: HashMap::new(),
            next_id: CompressorId::new(1),
        }
    }
}

impl CompressorRegistry {
    /// Register a new job and return its id.
    pub fn allocate(&mut self, items: Vec<PathBuf>, output: PathBuf) -> CompressorId {
        let id = self.next_id;
        self.next_id = id.next();
        self.compressors.insert(id, Compressor::new(id, items, output));
        id
    }

    pub fn contains(&self, id: CompressorId) -> bool {
        self.compressors.contains_key(&id)
    }

    pub fn get(&self, id: CompressorId) -> Option<&Compressor> {
        self.compressors.get(&id)
    }

    pub fn get_mut(&mut self, id: CompressorId) -> Option<&mut Compressor> {
        self.compressors.get_mut(&id)
    }

    pub fn remove(&mut self, id: CompressorId) -> Option<Compressor> {
        self.compressors.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.compressors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compressors.is_empty()
    }
}

/// Pick a free output path next to the first item.
///
/// One item `photos/` packs to `photos.zip`; several items pack to
/// `Archive.zip`. Taken names get ` (1)`, ` (2)`, … appended.
pub async fn derive_output_path(items: &[PathBuf], extension: &str) -> Result<PathBuf, PackError> {
    let first = items.first().ok_or(PackError::Empty)?;
    let dir = first
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let stem = match (items.len(), first.file_stem()) {
        (1, Some(stem)) => stem.to_string_lossy().into_owned(),
        _ => "Archive".to_string(),
    };

    let mut n = 0u32;
    loop {
        let name = if n == 0 {
            format!("{stem}.{extension}")
        } else {
            format!("{stem} ({n}).{extension}")
        };
        let candidate = dir.join(name);
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
        n += 1;
    }
}

impl Inner {
    /// Register a pack job and make sure the engine is up.
    pub(crate) async fn create_compressor(
        self: &Arc<Self>,
        items: Vec<PathBuf>,
        output: PathBuf,
    ) -> Result<CompressorId, PackError> {
        if items.is_empty() {
            return Err(PackError::Empty);
        }
        let count = items.len();
        let id = self.tables.lock().compressors.allocate(items, output.clone());
        info!(compressor = %id, items = count, output = %output.display(), "pack job created");

        if let Err(e) = self.engine.ensure_loaded().await {
            self.cleanup_compressor(id, true).await;
            return Err(e.into());
        }
        Ok(id)
    }

    /// Run the job to completion. Cleanup always runs afterwards.
    pub(crate) async fn compress(
        self: &Arc<Self>,
        id: CompressorId,
        on_progress: &mut (dyn FnMut(u8) + Send),
    ) -> Result<PathBuf, PackError> {
        let result = self.run_compression(id, on_progress).await;
        match &result {
            Ok(output) => info!(compressor = %id, output = %output.display(), "pack job finished"),
            Err(e) => warn!(compressor = %id, error = %e, "pack job failed"),
        }
        self.cleanup_compressor(id, result.is_err()).await;
        result
    }

    async fn run_compression(
        &self,
        id: CompressorId,
        on_progress: &mut (dyn FnMut(u8) + Send),
    ) -> Result<PathBuf, PackError> {
        let (request_id, op, output) = {
            let mut tables = self.tables.lock();
            let compressor = tables
                .compressors
                .get_mut(id)
                .ok_or(PackError::NotFound(id))?;
            let op = PackOp::Create {
                output: compressor.output.clone(),
                items: compressor.items.clone(),
            };
            (compressor.next_request_id(), op, compressor.output.clone())
        };

        let mut reply = self.router.expect_pack(id, request_id);
        let request = EngineRequest::Pack {
            compressor_id: id,
            request_id,
            op,
        };
        if let Err(e) = self.engine.send(request) {
            self.router.cancel(reply.key());
            return Err(e.into());
        }

        while let Some(event) = reply.next().await {
            match event {
                PackEvent::Progress { fraction } => {
                    let percent = {
                        let mut tables = self.tables.lock();
                        let compressor = tables
                            .compressors
                            .get_mut(id)
                            .ok_or(PackError::Cancelled(id))?;
                        compressor.record_progress(fraction)
                    };
                    if let Some(percent) = percent {
                        debug!(compressor = %id, percent, "pack progress");
                        on_progress(percent);
                    }
                }
                PackEvent::Done => {
                    self.finish(id, CompressorState::Succeeded);
                    return Ok(output);
                }
                PackEvent::Error { message } => {
                    self.finish(id, CompressorState::Failed);
                    return Err(EngineError::Rejected(message).into());
                }
                other => {
                    self.finish(id, CompressorState::Failed);
                    return Err(PackError::Protocol(format!("{other:?}")));
                }
            }
        }
        Err(PackError::Cancelled(id))
    }

    fn finish(&self, id: CompressorId, state: CompressorState) {
        if let Some(compressor) = self.tables.lock().compressors.get_mut(id) {
            compressor.state = state;
            if state == CompressorState::Succeeded {
                compressor.progress = 1.0;
            }
        }
    }

    /// Tear a job down: tell the engine (abort after an error, close after
    /// success), delete a partial output, and release the engine.
    /// Cleaning up an id that is already gone does nothing.
    pub(crate) async fn cleanup_compressor(&self, id: CompressorId, had_error: bool) {
        let removed = self.tables.lock().compressors.remove(id);
        let Some(mut compressor) = removed else {
            return;
        };
        self.router.forget_entity(&EntityId::Compressor(id));

        if self.engine.status() == EngineStatus::Loaded {
            let op = if had_error { PackOp::Abort } else { PackOp::Close };
            let request = EngineRequest::Pack {
                compressor_id: id,
                request_id: compressor.next_request_id(),
                op,
            };
            if let Err(e) = self.engine.send(request) {
                debug!(compressor = %id, error = %e, "could not release pack job in engine");
            }
        }

        if had_error {
            match tokio::fs::remove_file(&compressor.output).await {
                Ok(()) => debug!(compressor = %id, output = %compressor.output.display(), "removed partial output"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(compressor = %id, error = %e, "could not remove partial output"),
            }
        }

        self.maybe_unload();
    }
}
