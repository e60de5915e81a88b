//! Transactional metadata store.
//!
//! All metadata lives in one set of [`Tables`] behind an async lock. A
//! [`Transaction`] holds the write lock and works on a copy of the tables; the
//! copy replaces the live tables on [`Transaction::commit`] and is discarded if
//! the transaction is dropped. When opened over a storage bucket, every commit
//! also writes a JSON snapshot which is reloaded on the next start.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use camino::Utf8Path;
use storage::StorageBucket;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{RegistryError, RegistryResult};

mod rows;
mod tables;

pub use rows::{
    ArtifactRow, BlobRow, ImageRow, ManifestRow, RegistryKind, RegistryRow, RowId, TagRow,
};
pub use tables::Tables;

const SNAPSHOT_PATH: &str = "metadata/registry.json";

/// Shared handle to the metadata store.
#[derive(Debug, Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    tables: RwLock<Tables>,
    snapshot: Option<StorageBucket>,
}

impl Database {
    /// A store which is never persisted.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: RwLock::new(Tables::default()),
                snapshot: None,
            }),
        }
    }

    /// Load the snapshot from `bucket` (if there is one) and persist commits there.
    #[tracing::instrument(skip_all, fields(bucket = bucket.name()))]
    pub async fn open(bucket: StorageBucket) -> RegistryResult<Self> {
        let mut snapshot = Vec::new();
        let tables = match bucket
            .download(Utf8Path::new(SNAPSHOT_PATH), &mut snapshot)
            .await
        {
            Ok(()) => serde_json::from_slice(&snapshot).map_err(|error| {
                RegistryError::Internal(format!("metadata snapshot is corrupt: {error}"))
            })?,
            Err(error) if error.is_not_found() => {
                tracing::info!("no metadata snapshot, starting empty");
                Tables::default()
            }
            Err(error) => return Err(error.into()),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                tables: RwLock::new(tables),
                snapshot: Some(bucket),
            }),
        })
    }

    /// Shared read access to the committed tables.
    pub async fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.inner.tables.read().await
    }

    /// Start a write transaction. Waits for the previous writer to finish.
    pub async fn begin(&self) -> Transaction<'_> {
        let guard = self.inner.tables.write().await;
        let working = guard.clone();
        Transaction {
            guard,
            working,
            snapshot: self.inner.snapshot.as_ref(),
        }
    }
}

/// An open write transaction. Dropping it without committing discards its changes.
#[derive(Debug)]
pub struct Transaction<'db> {
    guard: RwLockWriteGuard<'db, Tables>,
    working: Tables,
    snapshot: Option<&'db StorageBucket>,
}

impl Transaction<'_> {
    /// Persist (if configured) and publish the changes.
    pub async fn commit(mut self) -> RegistryResult<()> {
        if let Some(bucket) = self.snapshot {
            let encoded = serde_json::to_vec(&self.working).map_err(|error| {
                RegistryError::Internal(format!("encode metadata snapshot: {error}"))
            })?;
            bucket
                .upload(Utf8Path::new(SNAPSHOT_PATH), &mut encoded.as_slice())
                .await?;
        }
        *self.guard = std::mem::take(&mut self.working);
        Ok(())
    }
}

impl Deref for Transaction<'_> {
    type Target = Tables;

    fn deref(&self) -> &Self::Target {
        &self.working
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.working
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use storage::{MemoryStorage, Storage};

    #[tokio::test]
    async fn dropped_transactions_roll_back() {
        let db = Database::in_memory();
        {
            let mut tx = db.begin().await;
            tx.create_registry("acme", "docker", RegistryKind::Virtual);
        }
        assert!(db.read().await.registry("acme", "docker").is_none());

        let mut tx = db.begin().await;
        tx.create_registry("acme", "docker", RegistryKind::Virtual);
        tx.commit().await.unwrap();
        assert!(db.read().await.registry("acme", "docker").is_some());
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let storage = Storage::new(MemoryStorage::with_buckets(&["registry"]));
        let db = Database::open(storage.bucket("registry")).await.unwrap();

        let digest = Digest::sha256(b"blob");
        let mut tx = db.begin().await;
        let registry = tx.create_registry("acme", "docker", RegistryKind::Virtual);
        let blob = tx.create_or_find_blob("acme", &digest, 4);
        tx.link_blob(registry, "app", blob);
        tx.commit().await.unwrap();
        drop(db);

        let reopened = Database::open(storage.bucket("registry")).await.unwrap();
        let tables = reopened.read().await;
        let registry = tables.registry("acme", "docker").unwrap().id;
        assert!(tables.find_repository_blob(registry, "app", &digest).is_some());
    }
}
