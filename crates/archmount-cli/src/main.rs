//! archmount command-line front end.
//!
//! Drives the mount orchestrator against a subprocess codec engine. Each
//! command mounts what it needs, does its work and unmounts again.
//!
//! ```bash
//! archmount ls photos.zip /2024
//! archmount cat photos.zip /2024/notes.txt
//! archmount pack notes.txt photos/
//! archmount records
//! archmount forget <volume-id>
//! ```

mod host;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use archmount_kernel::{
    CloseFileOptions, GetMetadataOptions, MountOrchestrator, OpenFileOptions, OrchestratorConfig,
    ProcessEngine, ReadDirectoryOptions, ReadFileOptions, SqliteStore,
};
use archmount_types::{OpenMode, OpenRequestId, VolumeId};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::host::CliHost;

/// Bytes requested from the engine per read.
const READ_BLOCK: u64 = 64 * 1024;

#[derive(Parser, Debug)]
#[command(name = "archmount")]
#[command(about = "Browse and create archives through a shared codec engine")]
struct Cli {
    /// Config file (default: <config dir>/archmount/config.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Passphrase for encrypted archives
    #[arg(long, global = true, env = "ARCHMOUNT_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a directory inside an archive
    Ls {
        archive: PathBuf,
        #[arg(default_value = "/")]
        path: String,
    },
    /// Write a file from inside an archive to stdout
    Cat { archive: PathBuf, path: String },
    /// Pack files and directories into a new archive next to the first item
    Pack {
        #[arg(required = true)]
        items: Vec<PathBuf>,
    },
    /// Show persisted volume records
    Records,
    /// Unmount a volume and drop its persisted record
    Forget { volume_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .as_deref()
        .map(|p| PathBuf::from(shellexpand::tilde(p).into_owned()));
    let config = OrchestratorConfig::load_or_default(config_path.as_deref())?;
    let orchestrator = build(config, cli.passphrase.clone())?;

    match cli.command {
        Command::Ls { archive, path } => cmd_ls(&orchestrator, &archive, cli.passphrase, path).await,
        Command::Cat { archive, path } => cmd_cat(&orchestrator, &archive, cli.passphrase, path).await,
        Command::Pack { items } => cmd_pack(&orchestrator, items).await,
        Command::Records => cmd_records(&orchestrator).await,
        Command::Forget { volume_id } => {
            orchestrator.unmount(&VolumeId::new(volume_id), true).await?;
            Ok(())
        }
    }
}

fn build(config: OrchestratorConfig, passphrase: Option<String>) -> Result<MountOrchestrator> {
    let state_path = config.state_path();
    if let Some(dir) = state_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create state directory {}", dir.display()))?;
    }
    let store = SqliteStore::open(&state_path)
        .with_context(|| format!("cannot open state database {}", state_path.display()))?;
    let engine = ProcessEngine::new(config.engine.clone());
    let host = CliHost::new(passphrase);
    Ok(MountOrchestrator::new(config, Arc::new(engine), Arc::new(store), Arc::new(host)))
}

async fn mount(
    orchestrator: &MountOrchestrator,
    archive: &Path,
    passphrase: Option<String>,
) -> Result<VolumeId> {
    orchestrator
        .mount(archive, passphrase)
        .await
        .with_context(|| format!("cannot mount {}", archive.display()))
}

async fn release(orchestrator: &MountOrchestrator, id: &VolumeId) {
    if let Err(e) = orchestrator.unmount(id, true).await {
        tracing::warn!(volume = %id, error = %e, "unmount failed");
    }
}

async fn cmd_ls(
    orchestrator: &MountOrchestrator,
    archive: &Path,
    passphrase: Option<String>,
    path: String,
) -> Result<()> {
    let id = mount(orchestrator, archive, passphrase).await?;
    let mut entries = Vec::new();
    let listed = orchestrator
        .on_read_directory_requested(
            ReadDirectoryOptions {
                file_system_id: id.clone(),
                directory_path: path,
            },
            |page, _| entries.extend(page),
        )
        .await;
    release(orchestrator, &id).await;
    listed?;

    for entry in entries {
        if entry.is_directory {
            println!("{:>12}  {}/", "-", entry.name);
        } else {
            println!("{:>12}  {}", entry.size, entry.name);
        }
    }
    Ok(())
}

async fn cmd_cat(
    orchestrator: &MountOrchestrator,
    archive: &Path,
    passphrase: Option<String>,
    path: String,
) -> Result<()> {
    let id = mount(orchestrator, archive, passphrase).await?;
    let result = copy_to_stdout(orchestrator, &id, path).await;
    release(orchestrator, &id).await;
    result
}

async fn copy_to_stdout(orchestrator: &MountOrchestrator, id: &VolumeId, path: String) -> Result<()> {
    let metadata = orchestrator
        .on_get_metadata_requested(GetMetadataOptions {
            file_system_id: id.clone(),
            entry_path: path.clone(),
        })
        .await?;
    anyhow::ensure!(!metadata.is_directory, "{path} is a directory");

    let open = OpenRequestId::new(1);
    orchestrator
        .on_open_file_requested(OpenFileOptions {
            file_system_id: id.clone(),
            request_id: open,
            file_path: path,
            mode: OpenMode::Read,
        })
        .await?;

    let mut stdout = tokio::io::stdout();
    let mut offset = 0;
    while offset < metadata.size {
        let length = READ_BLOCK.min(metadata.size - offset);
        let mut block = Vec::new();
        orchestrator
            .on_read_file_requested(
                ReadFileOptions {
                    file_system_id: id.clone(),
                    open_request_id: open,
                    offset,
                    length,
                },
                |chunk, _| block.extend(chunk),
            )
            .await?;
        if block.is_empty() {
            break;
        }
        offset += block.len() as u64;
        stdout.write_all(&block).await?;
    }
    stdout.flush().await?;

    orchestrator
        .on_close_file_requested(CloseFileOptions {
            file_system_id: id.clone(),
            open_request_id: open,
        })
        .await?;
    Ok(())
}

async fn cmd_pack(orchestrator: &MountOrchestrator, items: Vec<PathBuf>) -> Result<()> {
    let output = orchestrator
        .on_launched_with_pack(items, |percent| eprint!("\rpacking {percent:>3}%"))
        .await;
    eprintln!();
    println!("{}", output?.display());
    Ok(())
}

async fn cmd_records(orchestrator: &MountOrchestrator) -> Result<()> {
    let records = orchestrator.persisted_records().await?;
    if records.is_empty() {
        println!("no persisted volumes ({} retention)", orchestrator.config().retention);
        return Ok(());
    }
    for record in records {
        let lock = if record.passphrase.is_some() { " (passphrase)" } else { "" };
        println!("{}  {}{}", record.id, record.source_token, lock);
    }
    Ok(())
}
