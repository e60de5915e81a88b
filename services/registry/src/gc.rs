//! Online garbage collection.
//!
//! Writes which could make content unreachable schedule a review of that
//! content. The collector later [`sweeps`](GcService::sweep) due reviews,
//! deleting manifests nothing tags or references and blobs nothing links or
//! uses as a layer.
//!
//! Each review carries its own lock. A writer about to depend on content that
//! may be under review takes that lock first (a [`ReviewLease`]), then opens its
//! database transaction; the sweep does the same, and skips reviews it cannot
//! lock immediately. Lock waits are bounded by [`lock_timeout`].
//!
//! Blob bytes are additionally guarded per digest: committing an upload and
//! deleting a collected blob's bytes both hold [`GcService::blob_bytes_lock`],
//! so a blob row is never left pointing at deleted bytes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::OwnedMutexGuard;

use crate::blobstore::BlobStore;
use crate::config::seconds;
use crate::db::{Database, RowId};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};

/// Lock timeouts and review delays.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GcSettings {
    /// Creating a manifest list (locks every child).
    #[serde(with = "seconds")]
    pub list_create_lock_timeout: Duration,
    /// Tagging a manifest.
    #[serde(with = "seconds")]
    pub tag_lock_timeout: Duration,
    /// Deleting a tag.
    #[serde(with = "seconds")]
    pub tag_delete_lock_timeout: Duration,
    /// Deleting a manifest.
    #[serde(with = "seconds")]
    pub manifest_delete_lock_timeout: Duration,
    /// Checking a blob before serving it.
    #[serde(with = "seconds")]
    pub blob_exists_lock_timeout: Duration,
    /// Reviews due within this window count as pending for writers.
    #[serde(with = "seconds")]
    pub review_window: Duration,
    /// How far a blob review is postponed when the blob is read.
    #[serde(with = "seconds")]
    pub blob_reschedule: Duration,
    /// Delay before newly scheduled content is reviewed.
    #[serde(with = "seconds")]
    pub review_delay: Duration,
}

impl Default for GcSettings {
    fn default() -> Self {
        Self {
            list_create_lock_timeout: Duration::from_secs(10),
            tag_lock_timeout: Duration::from_secs(30),
            tag_delete_lock_timeout: Duration::from_secs(10),
            manifest_delete_lock_timeout: Duration::from_secs(10),
            blob_exists_lock_timeout: Duration::from_secs(5),
            review_window: Duration::from_secs(60 * 60),
            blob_reschedule: Duration::from_secs(24 * 60 * 60),
            review_delay: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Bound a lock wait. A timeout becomes [`RegistryError::Unavailable`], so clients retry.
pub async fn lock_timeout<F: Future>(
    timeout: Duration,
    what: &str,
    fut: F,
) -> RegistryResult<F::Output> {
    tokio::time::timeout(timeout, fut).await.map_err(|_| {
        tracing::warn!(?timeout, "timed out waiting for {what} lock");
        RegistryError::Unavailable(format!("timed out waiting for {what} lock"))
    })
}

/// What a review is for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReviewKey {
    /// A manifest row.
    Manifest {
        /// Registry id.
        registry: RowId,
        /// Manifest id.
        manifest: RowId,
    },
    /// A blob row of a root.
    Blob {
        /// Root name.
        root: String,
        /// Blob id.
        blob: RowId,
    },
}

/// Why a review was scheduled, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ReviewEvent {
    ManifestUploaded,
    ManifestDeleted,
    ManifestListDeleted,
    TagSwitched,
    TagDeleted,
    BlobUploaded,
    BlobUnlinked,
    LayerReleased,
}

#[derive(Debug)]
struct ReviewTask {
    lock: Arc<tokio::sync::Mutex<()>>,
    review_after: DateTime<Utc>,
    event: ReviewEvent,
}

/// Exclusive hold on one review. Released on drop.
#[derive(Debug)]
pub struct ReviewLease {
    key: ReviewKey,
    _guard: OwnedMutexGuard<()>,
}

impl ReviewLease {
    /// The review this lease holds.
    pub fn key(&self) -> &ReviewKey {
        &self.key
    }
}

/// Exclusive hold on the stored bytes of one blob. Released on drop.
#[derive(Debug)]
pub struct BlobBytesLock {
    _guard: OwnedMutexGuard<()>,
}

type BlobBytesKey = (String, Digest);

/// Counts from one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Manifests deleted.
    pub manifests: usize,
    /// Blobs deleted.
    pub blobs: usize,
    /// Due reviews skipped because a writer held them.
    pub skipped: usize,
}

/// Review queues shared by writers and the collector.
#[derive(Debug, Clone)]
pub struct GcService {
    queues: Arc<Mutex<HashMap<ReviewKey, ReviewTask>>>,
    bytes: Arc<Mutex<HashMap<BlobBytesKey, Weak<tokio::sync::Mutex<()>>>>>,
    settings: Arc<GcSettings>,
}

impl GcService {
    /// An empty set of queues.
    pub fn new(settings: GcSettings) -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            bytes: Arc::new(Mutex::new(HashMap::new())),
            settings: Arc::new(settings),
        }
    }

    /// Timeouts and delays in effect.
    pub fn settings(&self) -> &GcSettings {
        &self.settings
    }

    /// End of the window in which pending reviews must be locked by writers.
    pub fn review_horizon(&self) -> DateTime<Utc> {
        Utc::now() + self.settings.review_window
    }

    fn pending_lock(&self, key: &ReviewKey, before: DateTime<Utc>) -> Option<Arc<tokio::sync::Mutex<()>>> {
        self.queues
            .lock()
            .get(key)
            .filter(|task| task.review_after < before)
            .map(|task| task.lock.clone())
    }

    async fn lock_key(&self, key: ReviewKey, before: DateTime<Utc>) -> Option<ReviewLease> {
        let lock = self.pending_lock(&key, before)?;
        let guard = lock.lock_owned().await;
        Some(ReviewLease { key, _guard: guard })
    }

    /// Lock the manifest's review if one is due before `before`.
    /// Returns `None` when no such review exists.
    pub async fn manifest_find_and_lock_before(
        &self,
        registry: RowId,
        manifest: RowId,
        before: DateTime<Utc>,
    ) -> Option<ReviewLease> {
        self.lock_key(ReviewKey::Manifest { registry, manifest }, before)
            .await
    }

    /// Lock the reviews of several manifests, in id order.
    pub async fn manifest_find_and_lock_n_before(
        &self,
        registry: RowId,
        manifests: &[RowId],
        before: DateTime<Utc>,
    ) -> Vec<ReviewLease> {
        let mut ids = manifests.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut leases = Vec::new();
        for manifest in ids {
            if let Some(lease) = self
                .manifest_find_and_lock_before(registry, manifest, before)
                .await
            {
                leases.push(lease);
            }
        }
        leases
    }

    /// Lock the blob's review if one is due before `before`.
    pub async fn blob_find_and_lock_before(
        &self,
        root: &str,
        blob: RowId,
        before: DateTime<Utc>,
    ) -> Option<ReviewLease> {
        self.lock_key(
            ReviewKey::Blob {
                root: root.to_owned(),
                blob,
            },
            before,
        )
        .await
    }

    /// Lock the bytes of `digest` in `root` against concurrent commit or deletion.
    pub async fn blob_bytes_lock(&self, root: &str, digest: &Digest) -> BlobBytesLock {
        let lock = {
            let mut bytes = self.bytes.lock();
            bytes.retain(|_, lock| lock.strong_count() > 0);
            let key = (root.to_owned(), digest.clone());
            match bytes.get(&key).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(tokio::sync::Mutex::new(()));
                    bytes.insert(key, Arc::downgrade(&lock));
                    lock
                }
            }
        };
        BlobBytesLock {
            _guard: lock.lock_owned().await,
        }
    }

    /// Push a locked blob review back by `delay`.
    pub fn blob_reschedule(&self, lease: &ReviewLease, delay: Duration) {
        if let Some(task) = self.queues.lock().get_mut(&lease.key) {
            task.review_after = Utc::now() + delay;
        }
    }

    fn schedule(&self, key: ReviewKey, event: ReviewEvent) {
        let review_after = Utc::now() + self.settings.review_delay;
        tracing::trace!(?key, ?event, %review_after, "scheduling review");

        let mut queues = self.queues.lock();
        queues
            .entry(key)
            .and_modify(|task| {
                task.review_after = task.review_after.max(review_after);
                task.event = event;
            })
            .or_insert_with(|| ReviewTask {
                lock: Arc::new(tokio::sync::Mutex::new(())),
                review_after,
                event,
            });
    }

    /// Queue a review of a manifest.
    pub fn schedule_manifest(&self, registry: RowId, manifest: RowId, event: ReviewEvent) {
        self.schedule(ReviewKey::Manifest { registry, manifest }, event);
    }

    /// Queue a review of a blob.
    pub fn schedule_blob(&self, root: &str, blob: RowId, event: ReviewEvent) {
        self.schedule(
            ReviewKey::Blob {
                root: root.to_owned(),
                blob,
            },
            event,
        );
    }

    /// Number of queued reviews.
    pub fn pending(&self) -> usize {
        self.queues.lock().len()
    }

    /// Process every review due at `now`.
    #[tracing::instrument(skip(self, db, blobs))]
    pub async fn sweep(
        &self,
        now: DateTime<Utc>,
        db: &Database,
        blobs: &BlobStore,
    ) -> RegistryResult<SweepReport> {
        let mut report = SweepReport::default();

        let mut due: Vec<(ReviewKey, Arc<tokio::sync::Mutex<()>>)> = self
            .queues
            .lock()
            .iter()
            .filter(|(_, task)| task.review_after <= now)
            .map(|(key, task)| (key.clone(), task.lock.clone()))
            .collect();
        // Manifests first: deleting them releases blobs reviewed in the same sweep.
        due.sort_by(|(a, _), (b, _)| a.cmp(b));

        for (key, lock) in due {
            let Ok(_guard) = lock.try_lock_owned() else {
                report.skipped += 1;
                continue;
            };

            match &key {
                ReviewKey::Manifest { registry, manifest } => {
                    if self.review_manifest(db, *registry, *manifest).await? {
                        report.manifests += 1;
                    }
                }
                ReviewKey::Blob { root, blob } => {
                    if self.review_blob(db, blobs, root, *blob).await? {
                        report.blobs += 1;
                    }
                }
            }

            let mut queues = self.queues.lock();
            if queues.get(&key).is_some_and(|task| task.review_after <= now) {
                queues.remove(&key);
            }
        }

        tracing::debug!(?report, "sweep finished");
        Ok(report)
    }

    async fn review_manifest(&self, db: &Database, registry: RowId, manifest: RowId) -> RegistryResult<bool> {
        let mut tx = db.begin().await;
        if tx.manifest(manifest).is_none() || tx.is_tagged(manifest) || tx.is_referenced(manifest) {
            return Ok(false);
        }

        let root = tx
            .registry_by_id(registry)
            .map(|r| r.root.clone())
            .unwrap_or_default();
        let children = tx.children(manifest);
        let blobs = tx.manifest_blobs(manifest);
        if let Some(row) = tx.delete_manifest(manifest) {
            tracing::info!(digest = %row.digest, image = %row.image, "deleting unreferenced manifest");
        }
        tx.commit().await?;

        for child in children {
            self.schedule_manifest(registry, child, ReviewEvent::ManifestListDeleted);
        }
        for blob in blobs {
            self.schedule_blob(&root, blob, ReviewEvent::LayerReleased);
        }
        Ok(true)
    }

    async fn review_blob(&self, db: &Database, blobs: &BlobStore, root: &str, blob: RowId) -> RegistryResult<bool> {
        let Some(digest) = db.read().await.blob_by_id(blob).map(|row| row.digest.clone()) else {
            return Ok(false);
        };
        // Taken before the transaction, as uploads do.
        let _bytes = self.blob_bytes_lock(root, &digest).await;

        let mut tx = db.begin().await;
        if tx.is_blob_referenced(blob) {
            return Ok(false);
        }
        let Some(row) = tx.delete_blob(blob) else {
            return Ok(false);
        };
        tx.commit().await?;

        tracing::info!(digest = %row.digest, %root, "deleting unreferenced blob");
        blobs.delete(root, &row.digest).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gc() -> GcService {
        GcService::new(GcSettings {
            review_delay: Duration::ZERO,
            ..GcSettings::default()
        })
    }

    #[tokio::test]
    async fn no_review_means_no_lease() {
        let gc = gc();
        assert!(gc
            .manifest_find_and_lock_before(1, 2, gc.review_horizon())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn leases_exclude_each_other() {
        let gc = gc();
        gc.schedule_manifest(1, 2, ReviewEvent::TagSwitched);

        let lease = gc
            .manifest_find_and_lock_before(1, 2, gc.review_horizon())
            .await
            .unwrap();
        assert_eq!(lease.key(), &ReviewKey::Manifest { registry: 1, manifest: 2 });

        let second = lock_timeout(
            Duration::from_millis(20),
            "manifest",
            gc.manifest_find_and_lock_before(1, 2, gc.review_horizon()),
        )
        .await;
        assert!(matches!(second, Err(RegistryError::Unavailable(_))));

        drop(lease);
        assert!(gc
            .manifest_find_and_lock_before(1, 2, gc.review_horizon())
            .await
            .is_some());
    }

    #[tokio::test]
    async fn reviews_outside_window_are_ignored() {
        let gc = GcService::new(GcSettings::default());
        gc.schedule_blob("acme", 7, ReviewEvent::BlobUploaded);
        // Review is a day out, beyond the one hour window.
        assert!(gc
            .blob_find_and_lock_before("acme", 7, gc.review_horizon())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn blob_bytes_lock_is_per_digest() {
        let gc = gc();
        let digest = Digest::sha256(b"layer");
        let held = gc.blob_bytes_lock("acme", &digest).await;

        let waiting = lock_timeout(
            Duration::from_millis(20),
            "blob bytes",
            gc.blob_bytes_lock("acme", &digest),
        )
        .await;
        assert!(matches!(waiting, Err(RegistryError::Unavailable(_))));

        let _other = gc.blob_bytes_lock("acme", &Digest::sha256(b"other")).await;
        let _other_root = gc.blob_bytes_lock("beta", &digest).await;

        drop(held);
        let _again = gc.blob_bytes_lock("acme", &digest).await;
    }

    #[tokio::test]
    async fn sweep_waits_for_blob_commit() {
        use storage::{MemoryStorage, Storage};

        let gc = gc();
        let db = Database::in_memory();
        let blobs = BlobStore::new(Storage::new(MemoryStorage::with_buckets(&["registry"])).bucket("registry"));
        let digest = Digest::sha256(b"layer");

        let mut upload = blobs.create("acme").await.unwrap();
        upload.write(&mut &b"layer"[..]).await.unwrap();
        upload.commit(&digest).await.unwrap();
        let mut tx = db.begin().await;
        let stale = tx.create_or_find_blob("acme", &digest, 5);
        tx.commit().await.unwrap();
        gc.schedule_blob("acme", stale, ReviewEvent::BlobUnlinked);

        // A second push of the same digest is committing while the sweep runs.
        let committing = gc.blob_bytes_lock("acme", &digest).await;
        let sweep = tokio::spawn({
            let (gc, db, blobs) = (gc.clone(), db.clone(), blobs.clone());
            async move { gc.sweep(Utc::now(), &db, &blobs).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sweep.is_finished());

        let mut tx = db.begin().await;
        let blob = tx.create_or_find_blob("acme", &digest, 5);
        tx.link_blob(1, "app", blob);
        tx.commit().await.unwrap();
        drop(committing);

        let report = sweep.await.unwrap().unwrap();
        assert_eq!(report.blobs, 0);
        assert_eq!(blobs.stat("acme", &digest).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn n_lock_deduplicates() {
        let gc = gc();
        gc.schedule_manifest(1, 3, ReviewEvent::ManifestUploaded);
        gc.schedule_manifest(1, 2, ReviewEvent::ManifestUploaded);
        let leases = gc
            .manifest_find_and_lock_n_before(1, &[3, 2, 3, 9], gc.review_horizon())
            .await;
        let keys: Vec<_> = leases.iter().map(|l| l.key().clone()).collect();
        assert_eq!(
            keys,
            vec![
                ReviewKey::Manifest { registry: 1, manifest: 2 },
                ReviewKey::Manifest { registry: 1, manifest: 3 },
            ]
        );
    }

    #[tokio::test]
    async fn reschedule_pushes_review_out_of_window() {
        let gc = gc();
        gc.schedule_blob("acme", 1, ReviewEvent::BlobUploaded);
        let lease = gc
            .blob_find_and_lock_before("acme", 1, gc.review_horizon())
            .await
            .unwrap();
        gc.blob_reschedule(&lease, gc.settings().blob_reschedule);
        drop(lease);

        assert!(gc
            .blob_find_and_lock_before("acme", 1, gc.review_horizon())
            .await
            .is_none());
    }
}
