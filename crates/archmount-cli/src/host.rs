//! In-process filesystem provider for the command line.
//!
//! The CLI has no virtual filesystem to register with, so registrations
//! only live for the life of the process. Passphrases come from
//! `--passphrase` or, on a terminal, a prompt on stderr.

use std::io::IsTerminal;

use archmount_kernel::{FileSystemInfo, FileSystemProvider, MountRequest, ProviderError};
use archmount_types::VolumeId;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

pub struct CliHost {
    registered: DashMap<VolumeId, FileSystemInfo>,
    passphrase: Option<String>,
}

impl CliHost {
    pub fn new(passphrase: Option<String>) -> Self {
        Self {
            registered: DashMap::new(),
            passphrase,
        }
    }
}

#[async_trait]
impl FileSystemProvider for CliHost {
    async fn mount(&self, request: &MountRequest) -> Result<(), ProviderError> {
        tracing::debug!(volume = %request.id, name = %request.display_name, "registering volume");
        self.registered.insert(
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
        self.registered.remove(id);
        Ok(())
    }

    async fn file_system_info(&self, id: &VolumeId) -> Option<FileSystemInfo> {
        self.registered.get(id).map(|info| info.clone())
    }

    async fn request_passphrase(&self, id: &VolumeId, display_name: &str) -> Option<String> {
        if let Some(passphrase) = &self.passphrase {
            return Some(passphrase.clone());
        }
        if !std::io::stdin().is_terminal() {
            tracing::warn!(volume = %id, "archive is encrypted and no passphrase was given");
            return None;
        }

        let mut stderr = tokio::io::stderr();
        let prompt = format!("passphrase for {display_name}: ");
        if stderr.write_all(prompt.as_bytes()).await.is_err() {
            return None;
        }
        let _ = stderr.flush().await;

        let mut line = String::new();
        match BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => {
                let passphrase = line.trim_end_matches(['\r', '\n']);
                (!passphrase.is_empty()).then(|| passphrase.to_string())
            }
        }
    }
}
