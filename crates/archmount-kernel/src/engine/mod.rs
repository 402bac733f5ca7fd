//! Codec engine lifecycle.
//!
//! One codec engine serves every mounted volume and every pack job. It is
//! expensive to start, so [`CodecEngineManager`] loads it on first need and
//! tears it down as soon as nothing owns it any more.
//!
//! ```text
//!   ensure_loaded() ──┐                 ┌── Loaded(handle) ── send()
//!   ensure_loaded() ──┼─► Loading(fut) ─┤
//!   ensure_loaded() ──┘   (shared)      └── launch error ──► Unloaded
//!
//!   maybe_unload(liveness) ── liveness == 0 ──► shutdown() ──► Unloaded
//!   handle_disconnect(generation) ── engine died ──────────► Unloaded
//! ```
//!
//! Concurrent first callers all await the same shared load future. A load
//! that completes after the engine was already given up (liveness dropped to
//! zero mid-load) shuts the fresh channel down instead of installing it.
//!
//! Every launch gets an [`InboundSender`] tagged with its load generation.
//! An engine that goes away on its own reports [`Inbound::Disconnected`]
//! for that generation; reports from engines we already retired are
//! ignored by [`CodecEngineManager::handle_disconnect`].

mod process;

pub use process::ProcessEngine;

use std::sync::Arc;

use archmount_types::{EngineMessage, EngineRequest};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use strum::Display;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;

/// What arrives from the engine side.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(EngineMessage),
    /// The engine launched for `generation` stopped talking.
    Disconnected { generation: u64, reason: String },
}

/// Where a running engine posts its messages.
#[derive(Debug, Clone)]
pub struct InboundSender {
    tx: mpsc::UnboundedSender<Inbound>,
    generation: u64,
}

impl InboundSender {
    pub fn new(tx: mpsc::UnboundedSender<Inbound>, generation: u64) -> Self {
        Self { tx, generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Fails once the orchestrator is gone.
    pub fn send(&self, message: EngineMessage) -> Result<(), EngineError> {
        self.tx
            .send(Inbound::Message(message))
            .map_err(|_| EngineError::Closed)
    }

    /// Report that the engine is gone. Nothing it posted after this counts.
    pub fn disconnected(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Inbound::Disconnected {
            generation: self.generation,
            reason: reason.into(),
        });
    }
}

/// The loaded engine, shared by every volume and compressor.
pub type EngineHandle = Arc<dyn EngineChannel>;

/// Starts a codec engine.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    /// Start the engine. Everything it sends must go to `inbound`, and it
    /// must call [`InboundSender::disconnected`] if it dies on its own.
    async fn launch(&self, inbound: InboundSender) -> Result<EngineHandle, EngineError>;
}

/// The orchestrator → engine half of a running engine.
pub trait EngineChannel: Send + Sync {
    /// Post one request. Never blocks.
    fn post(&self, request: EngineRequest) -> Result<(), EngineError>;

    /// Tear the engine down. Later posts fail with [`EngineError::Closed`].
    fn shutdown(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum EngineStatus {
    Unloaded,
    Loading,
    Loaded,
}

/// Everything that keeps the engine alive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Liveness {
    pub volumes: usize,
    pub compressors: usize,
    pub in_flight_mounts: usize,
}

impl Liveness {
    /// The engine may only be torn down when this is false.
    pub fn is_alive(&self) -> bool {
        self.volumes + self.compressors + self.in_flight_mounts > 0
    }
}

type LoadFuture = Shared<BoxFuture<'static, Result<EngineHandle, EngineError>>>;

enum Slot {
    Unloaded,
    Loading { generation: u64, future: LoadFuture },
    Loaded { generation: u64, handle: EngineHandle },
}

struct SlotState {
    slot: Slot,
    /// Bumped on every load so a stale load can tell it was abandoned.
    generation: u64,
}

/// Owns the single shared engine handle.
pub struct CodecEngineManager {
    launcher: Arc<dyn EngineLauncher>,
    inbound: mpsc::UnboundedSender<Inbound>,
    state: Arc<Mutex<SlotState>>,
}

impl std::fmt::Debug for CodecEngineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecEngineManager")
            .field("status", &self.status())
            .finish()
    }
}

impl CodecEngineManager {
    pub fn new(launcher: Arc<dyn EngineLauncher>, inbound: mpsc::UnboundedSender<Inbound>) -> Self {
        Self {
            launcher,
            inbound,
            state: Arc::new(Mutex::new(SlotState {
                slot: Slot::Unloaded,
                generation: 0,
            })),
        }
    }

    pub fn status(&self) -> EngineStatus {
        match self.state.lock().slot {
            Slot::Unloaded => EngineStatus::Unloaded,
            Slot::Loading { .. } => EngineStatus::Loading,
            Slot::Loaded { .. } => EngineStatus::Loaded,
        }
    }

    /// Return the loaded engine, starting it if needed.
    pub async fn ensure_loaded(&self) -> Result<EngineHandle, EngineError> {
        let future = {
            let mut state = self.state.lock();
            match &state.slot {
                Slot::Loaded { handle, .. } => return Ok(Arc::clone(handle)),
                Slot::Loading { future, .. } => future.clone(),
                Slot::Unloaded => {
                    state.generation += 1;
                    let generation = state.generation;
                    info!(generation, "loading codec engine");
                    let future = load(
                        Arc::clone(&self.launcher),
                        InboundSender::new(self.inbound.clone(), generation),
                        Arc::clone(&self.state),
                        generation,
                    )
                    .boxed()
                    .shared();
                    state.slot = Slot::Loading {
                        generation,
                        future: future.clone(),
                    };
                    future
                }
            }
        };
        future.await
    }

    /// Tear the engine down if `liveness` says nothing owns it.
    ///
    /// Returns true if a loaded or loading engine was given up.
    pub fn maybe_unload(&self, liveness: Liveness) -> bool {
        if liveness.is_alive() {
            return false;
        }
        let previous = std::mem::replace(&mut self.state.lock().slot, Slot::Unloaded);
        match previous {
            Slot::Unloaded => false,
            Slot::Loading { generation, .. } => {
                info!(generation, "abandoning codec engine load, nothing left to serve");
                true
            }
            Slot::Loaded { generation, handle } => {
                handle.shutdown();
                info!(generation, "codec engine unloaded");
                true
            }
        }
    }

    /// The engine of `generation` died. Drop it if it is still the current
    /// one.
    ///
    /// Returns false for engines that were already unloaded or replaced.
    pub fn handle_disconnect(&self, generation: u64) -> bool {
        let previous = {
            let mut state = self.state.lock();
            let current = match &state.slot {
                Slot::Unloaded => false,
                Slot::Loading { generation: g, .. } | Slot::Loaded { generation: g, .. } => *g == generation,
            };
            if !current {
                return false;
            }
            std::mem::replace(&mut state.slot, Slot::Unloaded)
        };
        if let Slot::Loaded { handle, .. } = previous {
            handle.shutdown();
        }
        warn!(generation, "codec engine disconnected");
        true
    }

    /// Post a request to the loaded engine.
    ///
    /// Posting while the engine is not loaded is a caller bug: every sender
    /// owns a volume or compressor that keeps the engine alive.
    pub fn send(&self, request: EngineRequest) -> Result<(), EngineError> {
        let handle = match &self.state.lock().slot {
            Slot::Loaded { handle, .. } => Arc::clone(handle),
            _ => {
                error!(key = %request.correlation(), "send while codec engine is not loaded");
                return Err(EngineError::NotLoaded);
            }
        };
        debug!(key = %request.correlation(), "posting engine request");
        handle.post(request)
    }
}

async fn load(
    launcher: Arc<dyn EngineLauncher>,
    inbound: InboundSender,
    state: Arc<Mutex<SlotState>>,
    generation: u64,
) -> Result<EngineHandle, EngineError> {
    let result = launcher.launch(inbound).await;

    let mut guard = state.lock();
    let current = matches!(guard.slot, Slot::Loading { generation: g, .. } if g == generation);
    match result {
        Ok(handle) if current => {
            guard.slot = Slot::Loaded {
                generation,
                handle: Arc::clone(&handle),
            };
            info!(generation, "codec engine loaded");
            Ok(handle)
        }
        Ok(handle) => {
            drop(guard);
            handle.shutdown();
            warn!(generation, "codec engine finished loading after it was given up");
            Err(EngineError::Closed)
        }
        Err(e) => {
            if current {
                guard.slot = Slot::Unloaded;
            }
            warn!(generation, error = %e, "codec engine failed to load");
            Err(e)
        }
    }
}
