//! Manifest persistence: rows, layer and child edges, tags.
//!
//! Every write that could race the garbage collector first leases the reviews
//! of the manifests it depends on, then opens its transaction.

use chrono::Utc;

use crate::db::{BlobRow, Database, ManifestRow, RegistryKind, RegistryRow, RowId};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::gc::{GcService, ReviewEvent, lock_timeout};
use crate::headers::{OCI_SUBJECT, ResponseHeaders};
use crate::info::RegistryInfo;
use crate::manifest::{Descriptor, Manifest, is_non_distributable};

/// Stores manifests and their associations.
#[derive(Debug, Clone)]
pub struct ManifestService {
    db: Database,
    gc: GcService,
}

/// How a manifest maps onto a row.
struct Shape<'m> {
    config: Option<&'m Descriptor>,
    layers: Vec<&'m Descriptor>,
    non_conformant: bool,
}

impl ManifestService {
    /// A service writing to `db`, coordinating with `gc`.
    pub fn new(db: Database, gc: GcService) -> Self {
        Self { db, gc }
    }

    /// The metadata store.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Store a manifest and its associations. Returns the manifest row id.
    ///
    /// Storing the same bytes twice is a no-op which returns the existing row.
    #[tracing::instrument(skip_all, fields(repository = %info.repository(), %digest))]
    pub async fn db_put(
        &self,
        manifest: &Manifest,
        digest: &Digest,
        registry: &RegistryRow,
        info: &RegistryInfo,
        headers: &mut ResponseHeaders,
    ) -> RegistryResult<RowId> {
        if let Some(subject) = manifest.subject() {
            headers.insert(OCI_SUBJECT, &subject.digest);
        }

        if manifest.is_list() {
            if let Some((config, layers)) = manifest.buildx_cache_parts() {
                tracing::debug!("storing buildx cache index as an image manifest");
                let shape = Shape {
                    config: Some(&config),
                    layers: layers.iter().collect(),
                    non_conformant: true,
                };
                return self.put_leaf(manifest, digest, registry, info, shape).await;
            }
            return self.put_list(manifest, digest, registry, info).await;
        }

        let shape = Shape {
            config: manifest.config(),
            layers: manifest.layers().iter().collect(),
            non_conformant: false,
        };
        self.put_leaf(manifest, digest, registry, info, shape).await
    }

    fn row(
        manifest: &Manifest,
        digest: &Digest,
        registry: &RegistryRow,
        info: &RegistryInfo,
        shape: &Shape<'_>,
    ) -> ManifestRow {
        let (media_type, payload) = manifest.payload();
        ManifestRow {
            id: 0,
            registry_id: registry.id,
            image: info.image.clone(),
            digest: digest.clone(),
            schema_version: manifest.versioned().schema_version,
            media_type: media_type.to_owned(),
            artifact_type: manifest.artifact_type().map(str::to_owned),
            config_media_type: shape.config.map(|c| c.media_type.clone()),
            config_digest: shape.config.map(|c| c.digest.clone()),
            config_size: shape.config.map(|c| c.size).unwrap_or_default(),
            total_size: manifest.total_size(),
            subject_digest: manifest.subject().map(|s| s.digest.clone()),
            annotations: manifest.annotations().cloned().unwrap_or_default(),
            non_conformant: shape.non_conformant,
            non_distributable_layers: shape
                .layers
                .iter()
                .any(|layer| is_non_distributable(&layer.media_type)),
            payload: payload.clone(),
            created_at: Utc::now(),
        }
    }

    async fn put_leaf(
        &self,
        manifest: &Manifest,
        digest: &Digest,
        registry: &RegistryRow,
        info: &RegistryInfo,
        shape: Shape<'_>,
    ) -> RegistryResult<RowId> {
        let row = Self::row(manifest, digest, registry, info, &shape);

        let mut tx = self.db.begin().await;
        let mut blobs = Vec::new();
        for descriptor in shape.config.into_iter().chain(shape.layers.iter().copied()) {
            if is_non_distributable(&descriptor.media_type) {
                continue;
            }
            let blob = tx
                .find_repository_blob(registry.id, &info.image, &descriptor.digest)
                .ok_or_else(|| RegistryError::ManifestBlobUnknown(descriptor.digest.clone()))?;
            blobs.push(blob.id);
        }

        let (id, created) = tx.create_or_find_manifest(row);
        if created {
            for blob in blobs {
                tx.add_layer(id, blob);
            }
        }
        let image = tx.upsert_image(registry.id, &info.image);
        tx.upsert_artifact(image, digest);
        tx.commit().await?;

        if created {
            tracing::debug!(id, "stored manifest");
            self.gc
                .schedule_manifest(registry.id, id, ReviewEvent::ManifestUploaded);
        }
        Ok(id)
    }

    async fn put_list(
        &self,
        manifest: &Manifest,
        digest: &Digest,
        registry: &RegistryRow,
        info: &RegistryInfo,
    ) -> RegistryResult<RowId> {
        let shape = Shape {
            config: None,
            layers: Vec::new(),
            non_conformant: false,
        };
        let row = Self::row(manifest, digest, registry, info, &shape);

        let known: Vec<RowId> = {
            let tables = self.db.read().await;
            manifest
                .children()
                .iter()
                .filter_map(|child| {
                    tables
                        .manifest_by_digest(registry.id, &info.image, &child.digest)
                        .map(|m| m.id)
                })
                .collect()
        };

        let _leases = lock_timeout(
            self.gc.settings().list_create_lock_timeout,
            "manifest list",
            self.gc
                .manifest_find_and_lock_n_before(registry.id, &known, self.gc.review_horizon()),
        )
        .await?;

        let mut tx = self.db.begin().await;
        let mut children = Vec::new();
        let mut missing = Vec::new();
        for child in manifest.children() {
            match tx.manifest_by_digest(registry.id, &info.image, &child.digest) {
                Some(found) => children.push(found.id),
                None if registry.kind == RegistryKind::Upstream => {
                    tracing::debug!(child = %child.digest, "list child not cached yet");
                    missing.push(child.digest.clone());
                }
                None => return Err(RegistryError::ManifestBlobUnknown(child.digest.clone())),
            }
        }

        let (id, created) = tx.create_or_find_manifest(row);
        if created {
            for child in children {
                tx.add_reference(id, child);
            }
            for child in &missing {
                tx.add_index_mapping(id, child);
            }
        }
        let image = tx.upsert_image(registry.id, &info.image);
        tx.upsert_artifact(image, digest);
        tx.commit().await?;

        if created {
            tracing::debug!(id, missing = missing.len(), "stored manifest list");
            self.gc
                .schedule_manifest(registry.id, id, ReviewEvent::ManifestUploaded);
        }
        Ok(id)
    }

    /// Point `tag` at the manifest, storing the manifest first if it is missing.
    ///
    /// The manifest can be collected between being stored and being tagged; in
    /// that case it is stored again and tagging is retried once.
    #[tracing::instrument(skip_all, fields(repository = %info.repository(), %digest, %tag))]
    pub async fn db_tag(
        &self,
        manifest: &Manifest,
        digest: &Digest,
        tag: &str,
        registry: &RegistryRow,
        info: &RegistryInfo,
        headers: &mut ResponseHeaders,
    ) -> RegistryResult<()> {
        let mut attempt = TagAttempt::First;
        loop {
            let existing = self
                .db
                .read()
                .await
                .manifest_by_digest(registry.id, &info.image, digest)
                .map(|m| m.id);
            let id = match existing {
                Some(id) => id,
                None => self.db_put(manifest, digest, registry, info, headers).await?,
            };

            let _lease = lock_timeout(
                self.gc.settings().tag_lock_timeout,
                "tag",
                self.gc
                    .manifest_find_and_lock_before(registry.id, id, self.gc.review_horizon()),
            )
            .await?;

            let mut tx = self.db.begin().await;
            if tx.manifest(id).is_none() {
                drop(tx);
                match attempt {
                    TagAttempt::First => {
                        tracing::info!("manifest was collected before tagging, storing it again");
                        attempt = TagAttempt::Recreated;
                        continue;
                    }
                    TagAttempt::Recreated => {
                        return Err(RegistryError::Unavailable(format!(
                            "manifest {digest} was collected while tagging"
                        )));
                    }
                }
            }

            let previous = tx.upsert_tag(registry.id, &info.image, tag, id);
            let image = tx.upsert_image(registry.id, &info.image);
            tx.upsert_artifact(image, digest);
            tx.commit().await?;

            if let Some(previous) = previous {
                self.gc
                    .schedule_manifest(registry.id, previous, ReviewEvent::TagSwitched);
            }
            return Ok(());
        }
    }

    /// Remove a tag. The manifest it pointed at is left in place.
    #[tracing::instrument(skip(self, registry, info), fields(repository = %info.repository()))]
    pub async fn delete_tag(
        &self,
        registry: &RegistryRow,
        info: &RegistryInfo,
        tag: &str,
    ) -> RegistryResult<()> {
        let target = self
            .db
            .read()
            .await
            .tag(registry.id, &info.image, tag)
            .map(|t| t.manifest_id)
            .ok_or_else(|| RegistryError::TagUnknown(tag.to_owned()))?;

        let _lease = lock_timeout(
            self.gc.settings().tag_delete_lock_timeout,
            "tag delete",
            self.gc
                .manifest_find_and_lock_before(registry.id, target, self.gc.review_horizon()),
        )
        .await?;

        let mut tx = self.db.begin().await;
        let manifest = tx
            .delete_tag(registry.id, &info.image, tag)
            .ok_or_else(|| RegistryError::TagUnknown(tag.to_owned()))?;
        tx.commit().await?;

        self.gc
            .schedule_manifest(registry.id, manifest, ReviewEvent::TagDeleted);
        Ok(())
    }

    /// Delete a manifest which nothing tags or references.
    #[tracing::instrument(skip(self, registry, info), fields(repository = %info.repository()))]
    pub async fn delete_manifest(
        &self,
        registry: &RegistryRow,
        info: &RegistryInfo,
        digest: &Digest,
    ) -> RegistryResult<()> {
        let id = self
            .db
            .read()
            .await
            .manifest_by_digest(registry.id, &info.image, digest)
            .map(|m| m.id)
            .ok_or_else(|| RegistryError::ManifestUnknown(digest.to_string()))?;

        let _lease = lock_timeout(
            self.gc.settings().manifest_delete_lock_timeout,
            "manifest delete",
            self.gc
                .manifest_find_and_lock_before(registry.id, id, self.gc.review_horizon()),
        )
        .await?;

        let mut tx = self.db.begin().await;
        if tx.manifest(id).is_none() {
            return Err(RegistryError::ManifestUnknown(digest.to_string()));
        }
        if tx.is_referenced(id) {
            return Err(RegistryError::ManifestReferencedInList(digest.clone()));
        }
        if tx.is_tagged(id) {
            return Err(RegistryError::ManifestTagged(digest.clone()));
        }

        let children = tx.children(id);
        let blobs = tx.manifest_blobs(id);
        tx.delete_manifest(id);
        tx.commit().await?;

        for child in children {
            self.gc
                .schedule_manifest(registry.id, child, ReviewEvent::ManifestListDeleted);
        }
        for blob in blobs {
            self.gc
                .schedule_blob(&registry.root, blob, ReviewEvent::ManifestDeleted);
        }
        Ok(())
    }

    /// Attach a newly cached child to the upstream lists which were waiting for it.
    #[tracing::instrument(skip(self, registry), fields(registry = %registry.name))]
    pub async fn add_manifest_association(
        &self,
        registry: &RegistryRow,
        image: &str,
        child: &Digest,
    ) -> RegistryResult<()> {
        if registry.kind != RegistryKind::Upstream {
            return Ok(());
        }

        let Some(id) = self
            .db
            .read()
            .await
            .manifest_by_digest(registry.id, image, child)
            .map(|m| m.id)
        else {
            return Ok(());
        };

        let _lease = lock_timeout(
            self.gc.settings().list_create_lock_timeout,
            "manifest association",
            self.gc
                .manifest_find_and_lock_before(registry.id, id, self.gc.review_horizon()),
        )
        .await?;

        let mut tx = self.db.begin().await;
        if tx.manifest(id).is_none() {
            return Ok(());
        }
        let parents = tx.take_index_mappings(registry.id, image, child);
        if parents.is_empty() {
            return Ok(());
        }
        for parent in &parents {
            tx.add_reference(*parent, id);
        }
        tx.commit().await?;
        tracing::debug!(lists = parents.len(), "associated cached child with lists");
        Ok(())
    }

    /// A blob linked into the repository.
    pub async fn find_repository_blob(
        &self,
        registry: &RegistryRow,
        image: &str,
        digest: &Digest,
    ) -> Option<BlobRow> {
        self.db
            .read()
            .await
            .find_repository_blob(registry.id, image, digest)
            .cloned()
    }
}

#[derive(Debug, Clone, Copy)]
enum TagAttempt {
    First,
    Recreated,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::GcSettings;
    use crate::manifest::tests::{image_manifest, list_manifest};
    use crate::manifest::{
        MEDIA_TYPE_BUILDKIT_CACHE_CONFIG, MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
        unmarshal_manifest,
    };

    struct Fixture {
        service: ManifestService,
        gc: GcService,
        registry: RegistryRow,
        info: RegistryInfo,
    }

    async fn fixture(kind: RegistryKind) -> Fixture {
        fixture_with(kind, GcSettings::default()).await
    }

    async fn fixture_with(kind: RegistryKind, settings: GcSettings) -> Fixture {
        let db = Database::in_memory();
        let gc = GcService::new(settings);
        let mut tx = db.begin().await;
        let id = tx.create_registry("acme", "docker", kind);
        let registry = tx.registry_by_id(id).unwrap().clone();
        tx.commit().await.unwrap();

        Fixture {
            service: ManifestService::new(db, gc.clone()),
            gc,
            registry,
            info: RegistryInfo::new("acme", "docker", "app").unwrap(),
        }
    }

    impl Fixture {
        async fn link(&self, blobs: &[&[u8]]) {
            let mut tx = self.service.db().begin().await;
            for blob in blobs {
                let id = tx.create_or_find_blob("acme", &Digest::sha256(blob), blob.len() as u64);
                tx.link_blob(self.registry.id, "app", id);
            }
            tx.commit().await.unwrap();
        }

        async fn put(&self, media_type: &str, bytes: Vec<u8>) -> RegistryResult<(Digest, RowId)> {
            let (manifest, descriptor) = unmarshal_manifest(media_type, bytes).unwrap();
            let mut headers = ResponseHeaders::default();
            let id = self
                .service
                .db_put(&manifest, &descriptor.digest, &self.registry, &self.info, &mut headers)
                .await?;
            Ok((descriptor.digest, id))
        }

        async fn tag(&self, media_type: &str, bytes: Vec<u8>, tag: &str) -> RegistryResult<()> {
            let (manifest, descriptor) = unmarshal_manifest(media_type, bytes).unwrap();
            let mut headers = ResponseHeaders::default();
            self.service
                .db_tag(&manifest, &descriptor.digest, tag, &self.registry, &self.info, &mut headers)
                .await
        }
    }

    #[tokio::test]
    async fn identical_pushes_share_a_row() {
        let f = fixture(RegistryKind::Virtual).await;
        f.link(&[b"{}", b"layer"]).await;
        let bytes = image_manifest(MEDIA_TYPE_OCI_MANIFEST, b"{}", &[b"layer"]);

        let (_, first) = f.put(MEDIA_TYPE_OCI_MANIFEST, bytes.clone()).await.unwrap();
        let (_, second) = f.put(MEDIA_TYPE_OCI_MANIFEST, bytes).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.service.db().read().await.manifests().count(), 1);
        assert_eq!(f.service.db().read().await.manifest_blobs(first).len(), 2);
    }

    #[tokio::test]
    async fn unlinked_layer_is_rejected() {
        let f = fixture(RegistryKind::Virtual).await;
        f.link(&[b"{}"]).await;
        let bytes = image_manifest(MEDIA_TYPE_OCI_MANIFEST, b"{}", &[b"layer"]);
        let err = f.put(MEDIA_TYPE_OCI_MANIFEST, bytes).await.unwrap_err();
        assert!(matches!(err, RegistryError::ManifestBlobUnknown(d) if d == Digest::sha256(b"layer")));
    }

    #[tokio::test]
    async fn list_requires_children_unless_upstream() {
        let child = image_manifest(MEDIA_TYPE_OCI_MANIFEST, b"{}", &[]);
        let list = list_manifest(MEDIA_TYPE_OCI_INDEX, &[(&child, "amd64", "linux")]);

        let f = fixture(RegistryKind::Virtual).await;
        let err = f.put(MEDIA_TYPE_OCI_INDEX, list.clone()).await.unwrap_err();
        assert!(matches!(err, RegistryError::ManifestBlobUnknown(_)));

        let f = fixture(RegistryKind::Upstream).await;
        let (_, parent) = f.put(MEDIA_TYPE_OCI_INDEX, list).await.unwrap();
        assert!(f.service.db().read().await.children(parent).is_empty());

        f.link(&[b"{}"]).await;
        let (child_digest, child_id) = f.put(MEDIA_TYPE_OCI_MANIFEST, child).await.unwrap();
        f.service
            .add_manifest_association(&f.registry, "app", &child_digest)
            .await
            .unwrap();
        assert_eq!(f.service.db().read().await.children(parent), vec![child_id]);
    }

    #[tokio::test]
    async fn buildx_cache_is_stored_as_image() {
        let f = fixture(RegistryKind::Virtual).await;
        f.link(&[b"cache-config", b"cache-layer"]).await;
        let bytes = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_INDEX,
            "manifests": [
                {
                    "mediaType": MEDIA_TYPE_BUILDKIT_CACHE_CONFIG,
                    "digest": Digest::sha256(b"cache-config").to_string(),
                    "size": 12,
                },
                {
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": Digest::sha256(b"cache-layer").to_string(),
                    "size": 11,
                },
            ],
        }))
        .unwrap();

        let (_, id) = f.put(MEDIA_TYPE_OCI_INDEX, bytes).await.unwrap();
        let tables = f.service.db().read().await;
        let row = tables.manifest(id).unwrap();
        assert!(row.non_conformant);
        assert_eq!(row.config_media_type.as_deref(), Some(MEDIA_TYPE_BUILDKIT_CACHE_CONFIG));
        assert_eq!(tables.manifest_blobs(id).len(), 2);
    }

    #[tokio::test]
    async fn tags_are_independent_of_manifests() {
        let f = fixture(RegistryKind::Virtual).await;
        f.link(&[b"{}"]).await;
        let bytes = image_manifest(MEDIA_TYPE_OCI_MANIFEST, b"{}", &[]);
        let digest = Digest::sha256(&bytes);
        f.tag(MEDIA_TYPE_OCI_MANIFEST, bytes, "latest").await.unwrap();

        let err = f
            .service
            .delete_manifest(&f.registry, &f.info, &digest)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ManifestTagged(_)));

        f.service.delete_tag(&f.registry, &f.info, "latest").await.unwrap();
        assert!(f
            .service
            .db()
            .read()
            .await
            .manifest_by_digest(f.registry.id, "app", &digest)
            .is_some());
        assert!(matches!(
            f.service.delete_tag(&f.registry, &f.info, "latest").await,
            Err(RegistryError::TagUnknown(_))
        ));

        f.service
            .delete_manifest(&f.registry, &f.info, &digest)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn referenced_manifest_cannot_be_deleted() {
        let f = fixture(RegistryKind::Virtual).await;
        f.link(&[b"{}"]).await;
        let child = image_manifest(MEDIA_TYPE_OCI_MANIFEST, b"{}", &[]);
        let (child_digest, _) = f.put(MEDIA_TYPE_OCI_MANIFEST, child.clone()).await.unwrap();
        let list = list_manifest(MEDIA_TYPE_OCI_INDEX, &[(&child, "amd64", "linux")]);
        f.put(MEDIA_TYPE_OCI_INDEX, list).await.unwrap();

        let err = f
            .service
            .delete_manifest(&f.registry, &f.info, &child_digest)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ManifestReferencedInList(_)));
    }

    #[tokio::test]
    async fn retagging_schedules_previous_manifest() {
        let f = fixture(RegistryKind::Virtual).await;
        f.link(&[b"{}", b"one", b"two"]).await;
        f.tag(MEDIA_TYPE_OCI_MANIFEST, image_manifest(MEDIA_TYPE_OCI_MANIFEST, b"{}", &[b"one"]), "v1")
            .await
            .unwrap();
        let before = f.gc.pending();
        f.tag(MEDIA_TYPE_OCI_MANIFEST, image_manifest(MEDIA_TYPE_OCI_MANIFEST, b"{}", &[b"two"]), "v1")
            .await
            .unwrap();
        // One review for the new manifest; the old one was already queued on upload.
        assert_eq!(f.gc.pending(), before + 1);
        assert_eq!(f.service.db().read().await.tags(f.registry.id, "app").len(), 1);
    }

    #[tokio::test]
    async fn tagging_recreates_collected_manifest() {
        let f = fixture(RegistryKind::Virtual).await;
        f.link(&[b"{}"]).await;
        let bytes = image_manifest(MEDIA_TYPE_OCI_MANIFEST, b"{}", &[]);
        let (digest, id) = f.put(MEDIA_TYPE_OCI_MANIFEST, bytes.clone()).await.unwrap();

        let mut tx = f.service.db().begin().await;
        tx.delete_manifest(id);
        tx.commit().await.unwrap();

        f.tag(MEDIA_TYPE_OCI_MANIFEST, bytes, "latest").await.unwrap();
        let tables = f.service.db().read().await;
        let tagged = tables.tag(f.registry.id, "app", "latest").unwrap();
        assert_eq!(tables.manifest(tagged.manifest_id).unwrap().digest, digest);
    }

    #[tokio::test]
    async fn tagging_retries_when_collected_under_lease() {
        let f = fixture_with(
            RegistryKind::Virtual,
            GcSettings {
                review_delay: std::time::Duration::ZERO,
                ..GcSettings::default()
            },
        )
        .await;
        f.link(&[b"{}"]).await;
        let bytes = image_manifest(MEDIA_TYPE_OCI_MANIFEST, b"{}", &[]);
        let (digest, id) = f.put(MEDIA_TYPE_OCI_MANIFEST, bytes.clone()).await.unwrap();

        // The collector holds the manifest's review while the tag request arrives.
        f.gc.schedule_manifest(f.registry.id, id, ReviewEvent::TagSwitched);
        let lease = f
            .gc
            .manifest_find_and_lock_before(f.registry.id, id, f.gc.review_horizon())
            .await
            .unwrap();
        let collect = async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let mut tx = f.service.db().begin().await;
            assert!(tx.delete_manifest(id).is_some());
            tx.commit().await.unwrap();
            drop(lease);
        };

        let (tagged, ()) = tokio::join!(f.tag(MEDIA_TYPE_OCI_MANIFEST, bytes, "latest"), collect);
        tagged.unwrap();

        let tables = f.service.db().read().await;
        let tag = tables.tag(f.registry.id, "app", "latest").unwrap();
        assert_ne!(tag.manifest_id, id);
        assert_eq!(tables.manifest(tag.manifest_id).unwrap().digest, digest);
    }
}
