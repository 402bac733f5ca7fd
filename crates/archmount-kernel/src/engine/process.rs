//! Codec engine running as a child process.
//!
//! Requests and messages are JSON lines: one [`EngineRequest`] per line on
//! the child's stdin, one [`EngineMessage`] per line on its stdout. The
//! child's stderr is inherited so its diagnostics land next to ours.
//!
//! When the child's stdout ends, for whatever reason, the reader reports the
//! engine as disconnected.

use std::process::Stdio;
use std::sync::Arc;

use archmount_types::{EngineMessage, EngineRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{EngineChannel, EngineHandle, EngineLauncher, InboundSender};
use crate::config::EngineConfig;
use crate::error::EngineError;

/// Launches the codec engine described by an [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    config: EngineConfig,
}

impl ProcessEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EngineLauncher for ProcessEngine {
    async fn launch(&self, inbound: InboundSender) -> Result<EngineHandle, EngineError> {
        if self.config.command.is_empty() {
            return Err(EngineError::Launch("no engine command configured".into()));
        }

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Launch(format!("{}: {e}", self.config.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Launch("engine stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Launch("engine stdout unavailable".into()))?;

        info!(command = %self.config.command, pid = ?child.id(), "codec engine process started");

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_requests(stdin, rx));
        tokio::spawn(read_messages(stdout, inbound));

        Ok(Arc::new(ProcessChannel {
            requests: tx,
            child: Mutex::new(Some(child)),
        }))
    }
}

struct ProcessChannel {
    requests: mpsc::UnboundedSender<EngineRequest>,
    child: Mutex<Option<Child>>,
}

impl EngineChannel for ProcessChannel {
    fn post(&self, request: EngineRequest) -> Result<(), EngineError> {
        self.requests.send(request).map_err(|_| EngineError::Closed)
    }

    fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().take() {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "failed to kill codec engine process");
            }
        }
    }
}

async fn write_requests(mut stdin: ChildStdin, mut requests: mpsc::UnboundedReceiver<EngineRequest>) {
    while let Some(request) = requests.recv().await {
        let mut line = match serde_json::to_vec(&request) {
            Ok(line) => line,
            Err(e) => {
                warn!(key = %request.correlation(), error = %e, "cannot encode engine request");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = stdin.write_all(&line).await {
            warn!(error = %e, "codec engine stdin closed");
            break;
        }
    }
    debug!("engine request writer stopped");
}

async fn read_messages(stdout: ChildStdout, inbound: InboundSender) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<EngineMessage>(&line) {
                    Ok(message) => {
                        if inbound.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "ignoring malformed engine message"),
                }
            }
            Ok(None) => {
                debug!(generation = inbound.generation(), "codec engine stdout closed");
                inbound.disconnected("engine stdout closed");
                break;
            }
            Err(e) => {
                warn!(generation = inbound.generation(), error = %e, "error reading codec engine stdout");
                inbound.disconnected(e.to_string());
                break;
            }
        }
    }
}
