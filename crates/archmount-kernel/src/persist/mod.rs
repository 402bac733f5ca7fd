//! Crash-recovery records.
//!
//! Every mounted volume gets a small record (its durable source token and,
//! if one was used, its passphrase) so it can be reconstructed lazily after
//! the process is restarted. All records live in one JSON document under
//! the key [`VOLUMES_KEY`], keyed by volume id:
//!
//! ```json
//! { "volumes": { "<id>": { "source_token": "/home/amy/photos.zip" } } }
//! ```
//!
//! Under [`Retention::Ephemeral`] saving is a no-op.

mod kv;

pub use kv::{KeyValueStore, MemoryStore, SqliteStore};

use std::collections::BTreeMap;
use std::sync::Arc;

use archmount_types::VolumeId;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Retention;
use crate::error::PersistError;

pub const VOLUMES_KEY: &str = "volumes";

/// What is needed to rebuild one volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedVolumeRecord {
    pub id: VolumeId,
    pub source_token: String,
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredVolume {
    source_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    passphrase: Option<String>,
}

type VolumeMap = BTreeMap<String, StoredVolume>;

/// Reads and writes [`PersistedVolumeRecord`]s.
pub struct PersistenceStore {
    kv: Arc<dyn KeyValueStore>,
    retention: Retention,
    /// Serializes read-modify-write of the volumes document.
    write_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for PersistenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceStore")
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl PersistenceStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, retention: Retention) -> Self {
        Self {
            kv,
            retention,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn retention(&self) -> Retention {
        self.retention
    }

    async fn load(&self) -> Result<VolumeMap, PersistError> {
        match self.kv.get(VOLUMES_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(VolumeMap::new()),
        }
    }

    async fn store(&self, map: &VolumeMap) -> Result<(), PersistError> {
        self.kv.set(VOLUMES_KEY, serde_json::to_value(map)?).await
    }

    /// Merge `records` into the stored set, replacing records with the same id.
    pub async fn save(&self, records: &[PersistedVolumeRecord]) -> Result<(), PersistError> {
        if self.retention == Retention::Ephemeral {
            debug!(count = records.len(), "ephemeral retention, not saving volume records");
            return Ok(());
        }
        if records.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().await;
        let mut map = self.load().await?;
        for record in records {
            map.insert(
                record.id.to_string(),
                StoredVolume {
                    source_token: record.source_token.clone(),
                    passphrase: record.passphrase.clone(),
                },
            );
        }
        self.store(&map).await?;
        debug!(count = records.len(), total = map.len(), "saved volume records");
        Ok(())
    }

    /// Delete the record for `id`. A missing record is logged, not an error.
    pub async fn remove(&self, id: &VolumeId) -> Result<(), PersistError> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.load().await?;
        if map.remove(id.as_str()).is_none() {
            if self.retention == Retention::Durable {
                warn!(volume = %id, "no persisted record to remove");
            }
            return Ok(());
        }
        self.store(&map).await?;
        debug!(volume = %id, "removed volume record");
        Ok(())
    }

    /// Read back the record for `id`.
    pub async fn restore(&self, id: &VolumeId) -> Result<PersistedVolumeRecord, PersistError> {
        let map = self.load().await?;
        let stored = map
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| PersistError::NotFound(id.clone()))?;
        Ok(PersistedVolumeRecord {
            id: id.clone(),
            source_token: stored.source_token,
            passphrase: stored.passphrase,
        })
    }

    /// Every stored record, ordered by id.
    pub async fn records(&self) -> Result<Vec<PersistedVolumeRecord>, PersistError> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .map(|(id, stored)| PersistedVolumeRecord {
                id: VolumeId::new(id),
                source_token: stored.source_token,
                passphrase: stored.passphrase,
            })
            .collect())
    }
}
