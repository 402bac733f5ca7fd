//! End-to-end orchestrator behavior against the in-memory engine and host.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use archmount_kernel::testing::{MemoryArchive, MemoryEngine, RecordingHost};
use archmount_kernel::{
    CloseFileOptions, EngineError, EngineStatus, GetMetadataOptions, MemoryStore, MountError,
    MountOrchestrator, OpenFileOptions, OpenedFile, OrchestratorConfig, PackError, ProviderError,
    ReadDirectoryOptions, ReadFileOptions, RestoreError, Retention, UnmountError, UnmountOptions,
    VolumeState,
};
use archmount_types::{EntryMetadata, OpenMode, OpenRequestId, PackOp, UnpackOp, VolumeId};
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    engine: MemoryEngine,
    host: Arc<RecordingHost>,
    kv: Arc<MemoryStore>,
    config: OrchestratorConfig,
    orchestrator: MountOrchestrator,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(OrchestratorConfig::default())
    }

    fn with_config(config: OrchestratorConfig) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let engine = MemoryEngine::new();
        let host = Arc::new(RecordingHost::new());
        let kv = Arc::new(MemoryStore::new());
        let orchestrator =
            MountOrchestrator::new(config.clone(), Arc::new(engine.clone()), kv.clone(), host.clone());
        Self {
            dir: tempfile::tempdir().unwrap(),
            engine,
            host,
            kv,
            config,
            orchestrator,
        }
    }

    /// A fresh orchestrator sharing the store and host, as after a restart.
    fn restart(&self) -> MountOrchestrator {
        MountOrchestrator::new(
            self.config.clone(),
            Arc::new(self.engine.clone()),
            self.kv.clone(),
            self.host.clone(),
        )
    }

    /// Write a placeholder archive file and teach the engine its contents.
    fn archive(&self, name: &str, archive: MemoryArchive) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, b"PK\x03\x04").unwrap();
        self.engine.add_archive_at(&path, archive);
        path
    }

    fn item(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, name).unwrap();
        path
    }
}

fn volume_id(path: &Path) -> VolumeId {
    let canonical = std::fs::canonicalize(path).unwrap();
    VolumeId::for_source(&canonical.to_string_lossy())
}

fn docs() -> MemoryArchive {
    MemoryArchive::new()
        .with_file("/doc.txt", "the quick brown fox")
        .with_file("/img/a.png", "a")
        .with_file("/img/b.png", "bb")
        .with_file("/img/c.png", "ccc")
}

/// The engine is loaded exactly when something owns it.
fn assert_refcount(o: &MountOrchestrator) {
    let alive = o.liveness().is_alive();
    let loaded = o.engine_status() == EngineStatus::Loaded;
    assert_eq!(loaded, alive, "engine status disagrees with liveness: {o:?}");
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached");
}

fn open_options(id: &VolumeId, open: u64, path: &str) -> OpenFileOptions {
    OpenFileOptions {
        file_system_id: id.clone(),
        request_id: OpenRequestId::new(open),
        file_path: path.into(),
        mode: OpenMode::Read,
    }
}

async fn read_all(o: &MountOrchestrator, id: &VolumeId, open: u64, length: u64) -> Vec<u8> {
    let mut data = Vec::new();
    o.on_read_file_requested(
        ReadFileOptions {
            file_system_id: id.clone(),
            open_request_id: OpenRequestId::new(open),
            offset: 0,
            length,
        },
        |chunk, _| data.extend(chunk),
    )
    .await
    .unwrap();
    data
}

// ============================================================================
// Engine lifetime
// ============================================================================

#[tokio::test]
async fn engine_lifetime_follows_volumes_and_pack_jobs() {
    let h = Harness::new();
    let o = &h.orchestrator;
    assert_eq!(o.engine_status(), EngineStatus::Unloaded);
    assert_refcount(o);

    let path = h.archive("a.zip", docs());
    let id = o.mount(&path, None).await.unwrap();
    assert_eq!(o.engine_status(), EngineStatus::Loaded);
    assert_refcount(o);

    let output = o
        .on_launched_with_pack(vec![h.item("notes.txt")], |_| {})
        .await
        .unwrap();
    assert!(output.exists());
    assert_eq!(o.compressor_count(), 0);
    assert_eq!(o.engine_status(), EngineStatus::Loaded);
    assert_refcount(o);

    o.unmount(&id, false).await.unwrap();
    assert_eq!(o.engine_status(), EngineStatus::Unloaded);
    assert_refcount(o);
    assert_eq!(h.engine.launches(), 1);
    assert_eq!(h.engine.shutdowns(), 1);
    assert_eq!(o.in_flight_mounts(), 0);
}

#[tokio::test]
async fn engine_reloads_after_idle_teardown() {
    let h = Harness::new();
    let o = &h.orchestrator;
    let a = h.archive("a.zip", docs());
    let b = h.archive("b.zip", docs());

    let id = o.mount(&a, None).await.unwrap();
    o.unmount(&id, true).await.unwrap();
    assert_eq!(o.engine_status(), EngineStatus::Unloaded);

    o.mount(&b, None).await.unwrap();
    assert_eq!(o.engine_status(), EngineStatus::Loaded);
    assert_eq!(h.engine.launches(), 2);
    assert_refcount(o);
}

#[tokio::test]
async fn failed_engine_launch_fails_the_mount() {
    let h = Harness::new();
    h.engine.fail_launches(true);
    let path = h.archive("a.zip", docs());

    let err = h.orchestrator.mount(&path, None).await.unwrap_err();
    assert!(matches!(err, MountError::Engine(EngineError::Launch(_))));
    assert!(h.orchestrator.mounted_volumes().is_empty());
    assert_eq!(h.orchestrator.in_flight_mounts(), 0);
    assert_refcount(&h.orchestrator);
}

// ============================================================================
// Unmount
// ============================================================================

#[tokio::test]
async fn forced_unmount_twice_is_a_noop() {
    let h = Harness::new();
    let o = &h.orchestrator;
    let id = o.mount(h.archive("a.zip", docs()), None).await.unwrap();

    o.unmount(&id, true).await.unwrap();
    let after_first = (o.liveness(), o.engine_status(), h.engine.shutdowns());

    o.unmount(&id, true).await.unwrap();
    assert_eq!((o.liveness(), o.engine_status(), h.engine.shutdowns()), after_first);
    assert!(o.volume(&id).is_none());
    assert!(!h.host.is_registered(&id));
    assert_refcount(o);
}

#[tokio::test]
async fn unforced_unmount_waits_for_open_files() {
    let h = Harness::new();
    let o = &h.orchestrator;
    let id = o.mount(h.archive("a.zip", docs()), None).await.unwrap();
    assert_eq!(o.persisted_records().await.unwrap().len(), 1);

    o.on_open_file_requested(open_options(&id, 1, "/doc.txt")).await.unwrap();
    let err = o.unmount(&id, false).await.unwrap_err();
    assert_eq!(
        err,
        UnmountError::InUse {
            id: id.clone(),
            open_files: 1
        }
    );
    assert_eq!(
        o.on_unmount_requested(UnmountOptions {
            file_system_id: id.clone()
        })
        .await,
        Err(ProviderError::InUse)
    );

    o.on_close_file_requested(CloseFileOptions {
        file_system_id: id.clone(),
        open_request_id: OpenRequestId::new(1),
    })
    .await
    .unwrap();
    o.unmount(&id, false).await.unwrap();

    assert!(o.persisted_records().await.unwrap().is_empty());
    assert!(o.volume(&id).is_none());
    assert_eq!(h.host.unmount_calls(), vec![id.clone()]);
    assert!(
        h.engine
            .unpack_ops()
            .iter()
            .any(|(v, op)| v == &id && *op == UnpackOp::CloseArchive)
    );
    assert_refcount(o);
}

#[tokio::test]
async fn unmount_while_opening_cancels_the_mount() {
    let h = Harness::new();
    let path = h.archive("a.zip", docs());
    let id = volume_id(&path);
    h.engine.hold_opens();

    let mount = tokio::spawn({
        let o = h.orchestrator.clone();
        let path = path.clone();
        async move { o.mount(&path, None).await }
    });
    wait_until(|| {
        h.engine
            .unpack_ops()
            .iter()
            .any(|(_, op)| matches!(op, UnpackOp::OpenArchive { .. }))
    })
    .await;
    assert_eq!(h.orchestrator.volume(&id).map(|v| v.state), Some(VolumeState::Loading));

    h.orchestrator.unmount(&id, true).await.unwrap();
    assert!(matches!(mount.await.unwrap(), Err(MountError::Cancelled(_))));

    // The late reply is dropped: its volume no longer exists.
    h.engine.release_opens();
    tokio::task::yield_now().await;
    assert!(h.orchestrator.volume(&id).is_none());
    assert_eq!(h.orchestrator.pending_requests(), 0);
    assert_refcount(&h.orchestrator);
}

// ============================================================================
// Restore
// ============================================================================

#[tokio::test]
async fn restore_round_trip_after_restart() {
    let h = Harness::new();
    let path = h.archive("secret.zip", docs().with_passphrase("pw"));
    let id = h.orchestrator.mount(&path, Some("pw".into())).await.unwrap();
    let original = h.orchestrator.volume(&id).unwrap();
    h.orchestrator.on_suspend().await.unwrap();

    let restarted = h.restart();
    assert!(restarted.volume(&id).is_none());
    restarted.restore_from_persisted(&id).await.unwrap();

    let restored = restarted.volume(&id).unwrap();
    assert_eq!(restored.state, VolumeState::Ready);
    assert_eq!(restored.source, original.source);
    assert_eq!(restored.passphrase.as_deref(), Some("pw"));
    assert_eq!(h.host.passphrase_prompts(), 0);
    assert_refcount(&restarted);
}

#[tokio::test]
async fn host_requests_restore_volumes_lazily() {
    let h = Harness::new();
    let id = h.orchestrator.mount(h.archive("a.zip", docs()), None).await.unwrap();

    let restarted = h.restart();
    let launches = h.engine.launches();
    let metadata = |path: &str| GetMetadataOptions {
        file_system_id: id.clone(),
        entry_path: path.into(),
    };
    let (doc, img) = tokio::join!(
        restarted.on_get_metadata_requested(metadata("/doc.txt")),
        restarted.on_get_metadata_requested(metadata("/img")),
    );
    assert_eq!(doc.unwrap(), EntryMetadata::file("doc.txt", 19));
    assert_eq!(img.unwrap(), EntryMetadata::directory("img"));

    // One engine launch and one restore served both requests.
    assert_eq!(h.engine.launches(), launches + 1);
    let opens = h
        .engine
        .unpack_ops()
        .into_iter()
        .filter(|(_, op)| matches!(op, UnpackOp::OpenArchive { .. }))
        .count();
    assert_eq!(opens, 2);
    assert_eq!(restarted.mounted_volumes(), vec![id]);
}

#[tokio::test]
async fn restore_reopens_files_the_host_still_holds() {
    let h = Harness::new();
    let id = h.orchestrator.mount(h.archive("a.zip", docs()), None).await.unwrap();
    h.host.set_opened_files(
        &id,
        vec![OpenedFile {
            open_request_id: OpenRequestId::new(7),
            path: "/doc.txt".into(),
            mode: OpenMode::Read,
        }],
    );

    let restarted = h.restart();
    restarted.ensure_volume_loaded(&id).await.unwrap();
    let open: Vec<_> = restarted
        .volume(&id)
        .unwrap()
        .open_files
        .into_iter()
        .map(|(open, entry)| (open, entry.path))
        .collect();
    assert_eq!(open, vec![(OpenRequestId::new(7), "/doc.txt".to_string())]);

    assert_eq!(read_all(&restarted, &id, 7, 9).await, b"the quick");
}

#[tokio::test]
async fn restore_without_record_fails_and_leaves_nothing() {
    let h = Harness::new();
    let o = &h.orchestrator;
    let id = VolumeId::new("B");

    let err = o.restore_from_persisted(&id).await.unwrap_err();
    assert!(matches!(err, RestoreError::Failed { .. }));
    assert!(o.volume(&id).is_none());
    assert!(o.mounted_volumes().is_empty());
    assert_eq!(o.in_flight_mounts(), 0);
    assert_refcount(o);
}

#[tokio::test]
async fn restore_with_incompatible_host_metadata_unmounts() {
    let h = Harness::new();
    let id = h.orchestrator.mount(h.archive("a.zip", docs()), None).await.unwrap();
    let mut info = h.host.info(&id).unwrap();
    info.writable = true;
    h.host.register(info);

    let restarted = h.restart();
    let err = restarted
        .on_read_directory_requested(
            ReadDirectoryOptions {
                file_system_id: id.clone(),
                directory_path: "/".into(),
            },
            |_, _| {},
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Failed(_)));

    assert!(restarted.volume(&id).is_none());
    assert!(!h.host.is_registered(&id));
    assert!(restarted.persisted_records().await.unwrap().is_empty());
    assert_refcount(&restarted);
}

#[tokio::test]
async fn liveness_check_during_restore_keeps_engine() {
    let h = Harness::new();
    let id = h.orchestrator.mount(h.archive("a.zip", docs()), None).await.unwrap();

    let restarted = h.restart();
    h.engine.hold_launches();
    let load = tokio::spawn({
        let o = restarted.clone();
        let id = id.clone();
        async move { o.ensure_volume_loaded(&id).await }
    });
    wait_until(|| restarted.engine_status() == EngineStatus::Loading).await;

    assert!(restarted.in_flight_mounts() > 0);
    assert!(!restarted.maybe_unload());
    assert_eq!(restarted.engine_status(), EngineStatus::Loading);

    h.engine.release_launches();
    load.await.unwrap().unwrap();
    assert_eq!(restarted.engine_status(), EngineStatus::Loaded);
    assert_eq!(restarted.in_flight_mounts(), 0);
    assert_refcount(&restarted);
}

// ============================================================================
// Fresh mounts
// ============================================================================

#[tokio::test]
async fn concurrent_mounts_of_one_archive_yield_exists() {
    let h = Harness::new();
    let o = &h.orchestrator;
    let path = h.archive("c.zip", docs());

    let (first, second) = tokio::join!(o.mount(&path, None), o.mount(&path, None));
    let results = [first, second];
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let exists = results
        .iter()
        .filter(|r| matches!(r, Err(MountError::Exists(_))))
        .count();
    assert_eq!((ok, exists), (1, 1));

    assert_eq!(o.mounted_volumes(), vec![volume_id(&path)]);
    assert_eq!(o.liveness().volumes, 1);
    assert_eq!(h.host.mount_calls().len(), 1);
}

#[tokio::test]
async fn launch_with_unpack_mounts_each_item() {
    let h = Harness::new();
    let a = h.archive("a.zip", docs());
    let b = h.archive("b.zip", docs());
    let missing = h.dir.path().join("missing.zip");

    let results = h.orchestrator.on_launched_with_unpack(vec![a.clone(), b.clone(), missing]).await;
    assert_eq!(results[0].as_ref().unwrap(), &volume_id(&a));
    assert_eq!(results[1].as_ref().unwrap(), &volume_id(&b));
    assert!(matches!(results[2], Err(MountError::Source { .. })));

    assert_eq!(h.orchestrator.mounted_volumes().len(), 2);
    assert_eq!(h.orchestrator.persisted_records().await.unwrap().len(), 2);
}

#[tokio::test]
async fn corrupt_archive_fails_without_host_registration() {
    let h = Harness::new();
    let path = h.archive("bad.zip", docs().corrupt());

    let err = h.orchestrator.mount(&path, None).await.unwrap_err();
    assert_eq!(err, MountError::Engine(EngineError::Rejected("archive is corrupt".into())));
    assert!(h.host.mount_calls().is_empty());
    assert!(h.orchestrator.persisted_records().await.unwrap().is_empty());
    assert_refcount(&h.orchestrator);
}

#[tokio::test]
async fn host_refusal_closes_the_engine_session() {
    let h = Harness::new();
    h.host.refuse_mounts(true);
    let path = h.archive("a.zip", docs());
    let id = volume_id(&path);

    let err = h.orchestrator.mount(&path, None).await.unwrap_err();
    assert!(matches!(err, MountError::Provider(ProviderError::Failed(_))));
    assert!(
        h.engine
            .unpack_ops()
            .iter()
            .any(|(v, op)| v == &id && *op == UnpackOp::CloseArchive)
    );
    assert!(h.orchestrator.volume(&id).is_none());
    assert_refcount(&h.orchestrator);
}

#[tokio::test]
async fn ephemeral_retention_persists_nothing() {
    let h = Harness::with_config(OrchestratorConfig::default().with_retention(Retention::Ephemeral));
    h.orchestrator.mount(h.archive("a.zip", docs()), None).await.unwrap();
    h.orchestrator.on_suspend().await.unwrap();
    assert!(h.orchestrator.persisted_records().await.unwrap().is_empty());
}

// ============================================================================
// Passphrases
// ============================================================================

#[tokio::test]
async fn passphrase_from_host_is_remembered() {
    let h = Harness::new();
    h.host.answer_passphrase(Some("pw"));
    let id = h
        .orchestrator
        .mount(h.archive("secret.zip", docs().with_passphrase("pw")), None)
        .await
        .unwrap();

    assert_eq!(h.host.passphrase_prompts(), 1);
    assert_eq!(h.orchestrator.volume(&id).unwrap().passphrase.as_deref(), Some("pw"));
    let records = h.orchestrator.persisted_records().await.unwrap();
    assert_eq!(records[0].passphrase.as_deref(), Some("pw"));
}

#[tokio::test]
async fn declined_passphrase_fails_the_mount() {
    let h = Harness::new();
    h.host.answer_passphrase(None);
    let path = h.archive("secret.zip", docs().with_passphrase("pw"));

    let err = h.orchestrator.mount(&path, None).await.unwrap_err();
    assert_eq!(err, MountError::PassphraseDeclined);
    assert!(h.orchestrator.mounted_volumes().is_empty());
    assert_refcount(&h.orchestrator);
}

#[tokio::test]
async fn wrong_passphrase_is_an_engine_error() {
    let h = Harness::new();
    let path = h.archive("secret.zip", docs().with_passphrase("pw"));

    let err = h.orchestrator.mount(&path, Some("nope".into())).await.unwrap_err();
    assert_eq!(err, MountError::Engine(EngineError::Rejected("wrong passphrase".into())));
}

// ============================================================================
// Per-call operations
// ============================================================================

#[tokio::test]
async fn overlapping_request_ids_never_cross() {
    let h = Harness::new();
    let o = &h.orchestrator;
    let a = o
        .mount(h.archive("a.zip", MemoryArchive::new().with_file("/only-a.txt", "a")), None)
        .await
        .unwrap();
    let b = o
        .mount(h.archive("b.zip", MemoryArchive::new().with_file("/only-b.txt", "bb")), None)
        .await
        .unwrap();

    // Both volumes are now at the same request id.
    for _ in 0..3 {
        let (ra, rb) = tokio::join!(
            o.on_get_metadata_requested(GetMetadataOptions {
                file_system_id: a.clone(),
                entry_path: "/only-a.txt".into(),
            }),
            o.on_get_metadata_requested(GetMetadataOptions {
                file_system_id: b.clone(),
                entry_path: "/only-b.txt".into(),
            }),
        );
        assert_eq!(ra.unwrap(), EntryMetadata::file("only-a.txt", 1));
        assert_eq!(rb.unwrap(), EntryMetadata::file("only-b.txt", 2));
    }
    assert_eq!(o.pending_requests(), 0);
}

#[tokio::test]
async fn directory_listing_arrives_in_pages() {
    let h = Harness::new();
    h.engine.set_page_size(2);
    let id = h.orchestrator.mount(h.archive("a.zip", docs()), None).await.unwrap();

    let mut pages = Vec::new();
    h.orchestrator
        .on_read_directory_requested(
            ReadDirectoryOptions {
                file_system_id: id,
                directory_path: "/img".into(),
            },
            |entries, has_more| pages.push((entries.len(), has_more)),
        )
        .await
        .unwrap();
    assert_eq!(pages, vec![(2, true), (1, false)]);
}

#[tokio::test]
async fn file_reads_stream_in_chunks() {
    let h = Harness::new();
    let o = &h.orchestrator;
    let id = o.mount(h.archive("a.zip", docs()), None).await.unwrap();

    o.on_open_file_requested(open_options(&id, 3, "/doc.txt")).await.unwrap();
    assert_eq!(read_all(o, &id, 3, 1024).await, b"the quick brown fox");

    let dup = o.on_open_file_requested(open_options(&id, 3, "/doc.txt")).await;
    assert_eq!(dup, Err(ProviderError::InUse));

    let unknown = o
        .on_read_file_requested(
            ReadFileOptions {
                file_system_id: id.clone(),
                open_request_id: OpenRequestId::new(99),
                offset: 0,
                length: 1,
            },
            |_, _| {},
        )
        .await;
    assert!(matches!(unknown, Err(ProviderError::InvalidOperation(_))));
}

#[tokio::test]
async fn engine_errors_reach_the_host_verbatim() {
    let h = Harness::new();
    let id = h.orchestrator.mount(h.archive("a.zip", docs()), None).await.unwrap();

    let err = h
        .orchestrator
        .on_open_file_requested(open_options(&id, 1, "/nope.txt"))
        .await
        .unwrap_err();
    assert_eq!(err, ProviderError::Failed("no such file: nope.txt".into()));
}

// ============================================================================
// Pack jobs
// ============================================================================

#[tokio::test]
async fn pack_reports_monotonic_whole_percentages() {
    let h = Harness::new();
    let items = vec![h.item("a.txt"), h.item("b.txt")];

    let mut seen = Vec::new();
    let output = h
        .orchestrator
        .on_launched_with_pack(items, |p| seen.push(p))
        .await
        .unwrap();

    assert_eq!(seen, vec![0, 25, 50, 100]);
    assert_eq!(output, h.dir.path().join("Archive.zip"));
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "a.txt\nb.txt");
    assert!(matches!(h.engine.pack_ops().last(), Some((_, PackOp::Close))));
    assert_eq!(h.orchestrator.compressor_count(), 0);
    assert_refcount(&h.orchestrator);
}

#[tokio::test]
async fn failed_pack_aborts_and_removes_partial_output() {
    let h = Harness::new();
    let items = vec![h.item("corrupt.bin")];

    let err = h.orchestrator.on_launched_with_pack(items, |_| {}).await.unwrap_err();
    assert!(matches!(err, PackError::Engine(EngineError::Rejected(_))));
    assert!(!h.dir.path().join("corrupt.zip").exists());
    assert!(matches!(h.engine.pack_ops().last(), Some((_, PackOp::Abort))));
    assert_eq!(h.orchestrator.compressor_count(), 0);
    assert_refcount(&h.orchestrator);
}

#[tokio::test]
async fn abandoned_pack_job_releases_the_engine() {
    let h = Harness::new();
    let o = &h.orchestrator;
    let output = h.dir.path().join("out.zip");
    let id = o.create_compressor(vec![h.item("a.txt")], output).await.unwrap();
    assert_eq!(o.engine_status(), EngineStatus::Loaded);

    o.cleanup_compressor(id, true).await;
    o.cleanup_compressor(id, true).await;
    assert_eq!(o.compressor_count(), 0);
    assert_eq!(o.engine_status(), EngineStatus::Unloaded);
    assert!(matches!(o.compress(id, |_| {}).await, Err(PackError::NotFound(_))));
}

#[tokio::test]
async fn unforced_unmount_after_restart_respects_host_open_files() {
    let h = Harness::new();
    let id = h.orchestrator.mount(h.archive("a.zip", docs()), None).await.unwrap();
    h.host.set_opened_files(
        &id,
        vec![OpenedFile {
            open_request_id: OpenRequestId::new(3),
            path: "/doc.txt".into(),
            mode: OpenMode::Read,
        }],
    );

    let restarted = h.restart();
    assert!(restarted.volume(&id).is_none());
    assert_eq!(
        restarted
            .on_unmount_requested(UnmountOptions {
                file_system_id: id.clone()
            })
            .await,
        Err(ProviderError::InUse)
    );
    assert!(h.host.is_registered(&id));
    assert!(h.host.unmount_calls().is_empty());
    assert_eq!(restarted.persisted_records().await.unwrap().len(), 1);

    // Forcing still detaches.
    restarted.unmount(&id, true).await.unwrap();
    assert!(!h.host.is_registered(&id));
    assert!(restarted.persisted_records().await.unwrap().is_empty());
    assert_refcount(&restarted);
}

#[tokio::test]
async fn unmount_during_host_registration_detaches_the_host() {
    let h = Harness::new();
    let path = h.archive("a.zip", docs());
    let id = volume_id(&path);
    h.host.hold_mounts();

    let mount = tokio::spawn({
        let o = h.orchestrator.clone();
        let path = path.clone();
        async move { o.mount(&path, None).await }
    });
    wait_until(|| h.host.mount_calls().len() == 1).await;

    h.orchestrator.unmount(&id, true).await.unwrap();
    h.host.release_mounts();
    assert!(matches!(mount.await.unwrap(), Err(MountError::Cancelled(_))));

    assert!(!h.host.is_registered(&id));
    assert_eq!(h.host.unmount_calls(), vec![id.clone(), id.clone()]);
    assert!(h.orchestrator.volume(&id).is_none());
    assert!(h.orchestrator.persisted_records().await.unwrap().is_empty());
    assert_eq!(h.orchestrator.in_flight_mounts(), 0);
    assert_refcount(&h.orchestrator);
}

// ============================================================================
// Engine death
// ============================================================================

#[tokio::test]
async fn engine_death_while_opening_fails_the_mount() {
    let h = Harness::new();
    let o = &h.orchestrator;
    let path = h.archive("a.zip", docs());
    let id = volume_id(&path);
    h.engine.hold_opens();

    let mount = tokio::spawn({
        let o = o.clone();
        let path = path.clone();
        async move { o.mount(&path, None).await }
    });
    wait_until(|| {
        h.engine
            .unpack_ops()
            .iter()
            .any(|(_, op)| matches!(op, UnpackOp::OpenArchive { .. }))
    })
    .await;

    h.engine.crash();
    assert!(matches!(mount.await.unwrap(), Err(MountError::Cancelled(_))));
    assert_eq!(o.engine_status(), EngineStatus::Unloaded);
    assert!(o.volume(&id).is_none());
    assert_eq!(o.in_flight_mounts(), 0);
    assert_eq!(o.pending_requests(), 0);
    assert!(!h.host.is_registered(&id));
    assert_refcount(o);

    // Nothing was left reserved: the same archive mounts on a new engine.
    h.engine.release_opens();
    assert_eq!(o.mount(&path, None).await.unwrap(), id);
    assert_eq!(h.engine.launches(), 2);
    assert_refcount(o);
}

#[tokio::test]
async fn engine_death_leaves_ready_volumes_to_lazy_restore() {
    let h = Harness::new();
    let o = &h.orchestrator;
    let id = o.mount(h.archive("a.zip", docs()), None).await.unwrap();

    h.engine.crash();
    wait_until(|| o.engine_status() == EngineStatus::Unloaded).await;
    assert!(o.volume(&id).is_none());
    assert!(h.host.is_registered(&id));
    assert_eq!(o.persisted_records().await.unwrap().len(), 1);
    assert_refcount(o);

    let metadata = o
        .on_get_metadata_requested(GetMetadataOptions {
            file_system_id: id.clone(),
            entry_path: "/doc.txt".into(),
        })
        .await
        .unwrap();
    assert_eq!(metadata, EntryMetadata::file("doc.txt", 19));
    assert_eq!(h.engine.launches(), 2);
    assert_eq!(o.volume(&id).map(|v| v.state), Some(VolumeState::Ready));
    assert_refcount(o);
}

#[tokio::test]
async fn engine_death_fails_a_pending_pack_job() {
    let h = Harness::new();
    let o = &h.orchestrator;
    let output = h.dir.path().join("out.zip");
    let id = o.create_compressor(vec![h.item("a.txt")], output.clone()).await.unwrap();

    h.engine.crash();
    wait_until(|| o.engine_status() == EngineStatus::Unloaded).await;
    assert!(o.compress(id, |_| {}).await.is_err());
    assert_eq!(o.compressor_count(), 0);
    assert!(!output.exists());
    assert_refcount(o);
}

#[cfg(unix)]
#[tokio::test]
async fn exiting_engine_process_does_not_hang_the_mount() {
    use archmount_kernel::{EngineConfig, ProcessEngine};

    let h = Harness::new();
    let engine = ProcessEngine::new(EngineConfig {
        command: "sh".into(),
        args: vec!["-c".into(), "exit 0".into()],
        env: Default::default(),
    });
    let o = MountOrchestrator::new(
        OrchestratorConfig::default(),
        Arc::new(engine),
        Arc::new(MemoryStore::new()),
        h.host.clone(),
    );
    let path = h.archive("a.zip", docs());

    let result = tokio::time::timeout(Duration::from_secs(5), o.mount(&path, None))
        .await
        .expect("mount must not hang when the engine exits");
    assert!(result.is_err());
    wait_until(|| o.engine_status() == EngineStatus::Unloaded).await;
    assert_eq!(o.in_flight_mounts(), 0);
    assert_eq!(o.pending_requests(), 0);
    assert!(o.volume(&volume_id(&path)).is_none());
}

// ============================================================================
// Mixed workloads
// ============================================================================

#[tokio::test]
async fn interleaved_lifecycle_keeps_engine_refcount() {
    let h = Harness::new();
    let o = &h.orchestrator;
    assert_refcount(o);

    let a = o.mount(h.archive("a.zip", docs()), None).await.unwrap();
    assert_refcount(o);

    let output = h.dir.path().join("job.zip");
    let job = o.create_compressor(vec![h.item("notes.txt")], output.clone()).await.unwrap();
    assert_refcount(o);

    assert!(o.restore_from_persisted(&VolumeId::new("missing")).await.is_err());
    assert_eq!(o.engine_status(), EngineStatus::Loaded);
    assert_refcount(o);

    let b = o.mount(h.archive("b.zip", docs()), None).await.unwrap();
    assert_refcount(o);

    o.unmount(&a, true).await.unwrap();
    assert_eq!(o.engine_status(), EngineStatus::Loaded);
    assert_refcount(o);

    o.compress(job, |_| {}).await.unwrap();
    assert!(output.exists());
    assert_eq!(o.compressor_count(), 0);
    assert_refcount(o);

    assert!(o.restore_from_persisted(&VolumeId::new("missing")).await.is_err());
    assert_refcount(o);

    o.unmount(&b, true).await.unwrap();
    assert_eq!(o.engine_status(), EngineStatus::Unloaded);
    assert_refcount(o);

    assert!(o.restore_from_persisted(&VolumeId::new("missing")).await.is_err());
    assert_eq!(o.engine_status(), EngineStatus::Unloaded);
    assert_refcount(o);
    assert_eq!(h.engine.launches(), 1);
    assert_eq!(o.in_flight_mounts(), 0);
}
