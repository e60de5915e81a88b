use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::rows::{
    ArtifactRow, BlobRow, ImageRow, ManifestRow, RegistryKind, RegistryRow, RowId, TagRow,
};
use crate::digest::Digest;

/// Every metadata table. A transaction works on a copy and swaps it in on commit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    next_id: RowId,
    registries: BTreeMap<RowId, RegistryRow>,
    blobs: BTreeMap<RowId, BlobRow>,
    /// (registry, image, blob) links.
    registry_blobs: BTreeSet<(RowId, String, RowId)>,
    images: BTreeMap<RowId, ImageRow>,
    artifacts: BTreeMap<RowId, ArtifactRow>,
    manifests: BTreeMap<RowId, ManifestRow>,
    /// (manifest, blob)
    layers: BTreeSet<(RowId, RowId)>,
    /// (list, child manifest)
    manifest_references: BTreeSet<(RowId, RowId)>,
    /// Children of upstream lists which were not cached when the list was stored.
    index_mappings: BTreeSet<(RowId, Digest)>,
    tags: BTreeMap<RowId, TagRow>,
}

impl Tables {
    fn alloc_id(&mut self) -> RowId {
        self.next_id += 1;
        self.next_id
    }

    // Registries

    /// Find a registry by root and name.
    pub fn registry(&self, root: &str, name: &str) -> Option<&RegistryRow> {
        self.registries
            .values()
            .find(|r| r.root == root && r.name == name)
    }

    /// Look up a registry by id.
    pub fn registry_by_id(&self, id: RowId) -> Option<&RegistryRow> {
        self.registries.get(&id)
    }

    /// Create a registry, or return the existing one with the same name.
    pub fn create_registry(&mut self, root: &str, name: &str, kind: RegistryKind) -> RowId {
        if let Some(existing) = self.registry(root, name) {
            return existing.id;
        }
        let id = self.alloc_id();
        self.registries.insert(
            id,
            RegistryRow {
                id,
                root: root.to_owned(),
                name: name.to_owned(),
                kind,
            },
        );
        id
    }

    // Blobs

    /// Find a blob of a root by digest.
    pub fn blob(&self, root: &str, digest: &Digest) -> Option<&BlobRow> {
        self.blobs
            .values()
            .find(|b| b.root == root && &b.digest == digest)
    }

    /// Look up a blob by id.
    pub fn blob_by_id(&self, id: RowId) -> Option<&BlobRow> {
        self.blobs.get(&id)
    }

    /// Insert a blob row unless one exists for the digest.
    pub fn create_or_find_blob(&mut self, root: &str, digest: &Digest, size: u64) -> RowId {
        if let Some(existing) = self.blob(root, digest) {
            return existing.id;
        }
        let id = self.alloc_id();
        self.blobs.insert(
            id,
            BlobRow {
                id,
                root: root.to_owned(),
                digest: digest.clone(),
                size,
                created_at: Utc::now(),
            },
        );
        id
    }

    /// Remove a blob row. Callers check it is unreferenced first.
    pub fn delete_blob(&mut self, id: RowId) -> Option<BlobRow> {
        self.blobs.remove(&id)
    }

    /// Link a blob into a repository.
    pub fn link_blob(&mut self, registry: RowId, image: &str, blob: RowId) {
        self.registry_blobs
            .insert((registry, image.to_owned(), blob));
    }

    /// Unlink a blob from a repository. Returns false if it was not linked.
    pub fn unlink_blob(&mut self, registry: RowId, image: &str, blob: RowId) -> bool {
        self.registry_blobs
            .remove(&(registry, image.to_owned(), blob))
    }

    /// Whether the blob is linked into the repository.
    pub fn is_blob_linked(&self, registry: RowId, image: &str, blob: RowId) -> bool {
        self.registry_blobs
            .contains(&(registry, image.to_owned(), blob))
    }

    /// Whether anything still needs the blob: a repository link or a manifest layer.
    pub fn is_blob_referenced(&self, blob: RowId) -> bool {
        self.registry_blobs.iter().any(|(_, _, b)| *b == blob)
            || self.layers.iter().any(|(_, b)| *b == blob)
    }

    /// A blob by digest, if linked into the repository.
    pub fn find_repository_blob(
        &self,
        registry: RowId,
        image: &str,
        digest: &Digest,
    ) -> Option<&BlobRow> {
        let root = &self.registry_by_id(registry)?.root;
        self.blob(root, digest)
            .filter(|blob| self.is_blob_linked(registry, image, blob.id))
    }

    // Images and artifacts

    /// Find an image by name.
    pub fn image(&self, registry: RowId, name: &str) -> Option<&ImageRow> {
        self.images
            .values()
            .find(|i| i.registry_id == registry && i.name == name)
    }

    /// Create the image row if it is missing, returning its id.
    pub fn upsert_image(&mut self, registry: RowId, name: &str) -> RowId {
        if let Some(existing) = self.image(registry, name) {
            return existing.id;
        }
        let id = self.alloc_id();
        self.images.insert(
            id,
            ImageRow {
                id,
                registry_id: registry,
                name: name.to_owned(),
                enabled: true,
                created_at: Utc::now(),
            },
        );
        id
    }

    /// Create or touch the artifact row for an image version.
    pub fn upsert_artifact(&mut self, image: RowId, version: &Digest) -> RowId {
        let now = Utc::now();
        if let Some(existing) = self
            .artifacts
            .values_mut()
            .find(|a| a.image_id == image && &a.version == version)
        {
            existing.updated_at = now;
            return existing.id;
        }
        let id = self.alloc_id();
        self.artifacts.insert(
            id,
            ArtifactRow {
                id,
                image_id: image,
                version: version.clone(),
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    /// Artifact rows of an image.
    pub fn artifacts(&self, image: RowId) -> impl Iterator<Item = &ArtifactRow> {
        self.artifacts.values().filter(move |a| a.image_id == image)
    }

    // Manifests

    /// Look up a manifest by id.
    pub fn manifest(&self, id: RowId) -> Option<&ManifestRow> {
        self.manifests.get(&id)
    }

    /// Find a manifest of a repository by digest.
    pub fn manifest_by_digest(
        &self,
        registry: RowId,
        image: &str,
        digest: &Digest,
    ) -> Option<&ManifestRow> {
        self.manifests
            .values()
            .find(|m| m.registry_id == registry && m.image == image && &m.digest == digest)
    }

    /// Insert a manifest unless one with the same digest exists in the repository.
    /// Returns the id and whether a row was created.
    pub fn create_or_find_manifest(&mut self, mut row: ManifestRow) -> (RowId, bool) {
        if let Some(existing) = self.manifest_by_digest(row.registry_id, &row.image, &row.digest) {
            return (existing.id, false);
        }
        let id = self.alloc_id();
        row.id = id;
        self.manifests.insert(id, row);
        (id, true)
    }

    /// Remove a manifest with its layer, child and mapping edges.
    pub fn delete_manifest(&mut self, id: RowId) -> Option<ManifestRow> {
        let row = self.manifests.remove(&id)?;
        self.layers.retain(|(manifest, _)| *manifest != id);
        self.manifest_references
            .retain(|(parent, child)| *parent != id && *child != id);
        self.index_mappings.retain(|(parent, _)| *parent != id);
        self.tags.retain(|_, tag| tag.manifest_id != id);
        Some(row)
    }

    /// Record that a manifest uses a blob.
    pub fn add_layer(&mut self, manifest: RowId, blob: RowId) {
        self.layers.insert((manifest, blob));
    }

    /// Blobs used by a manifest.
    pub fn manifest_blobs(&self, manifest: RowId) -> Vec<RowId> {
        self.layers
            .iter()
            .filter(|(m, _)| *m == manifest)
            .map(|(_, blob)| *blob)
            .collect()
    }

    /// Record that a list references a child manifest.
    pub fn add_reference(&mut self, parent: RowId, child: RowId) {
        self.manifest_references.insert((parent, child));
    }

    /// Whether any list references the manifest.
    pub fn is_referenced(&self, child: RowId) -> bool {
        self.manifest_references.iter().any(|(_, c)| *c == child)
    }

    /// Children of a list.
    pub fn children(&self, parent: RowId) -> Vec<RowId> {
        self.manifest_references
            .iter()
            .filter(|(p, _)| *p == parent)
            .map(|(_, child)| *child)
            .collect()
    }

    /// Remember that a list wants a child which has not arrived yet.
    pub fn add_index_mapping(&mut self, parent: RowId, child: &Digest) {
        self.index_mappings.insert((parent, child.clone()));
    }

    /// Lists in the repository waiting for `child`, removing their mappings.
    pub fn take_index_mappings(&mut self, registry: RowId, image: &str, child: &Digest) -> Vec<RowId> {
        let parents: Vec<RowId> = self
            .index_mappings
            .iter()
            .filter(|(parent, digest)| {
                digest == child
                    && self
                        .manifest(*parent)
                        .is_some_and(|m| m.registry_id == registry && m.image == image)
            })
            .map(|(parent, _)| *parent)
            .collect();
        for parent in &parents {
            self.index_mappings.remove(&(*parent, child.clone()));
        }
        parents
    }

    /// Manifests in the repository whose subject is `subject`.
    pub fn referrers(&self, registry: RowId, image: &str, subject: &Digest) -> Vec<&ManifestRow> {
        self.manifests
            .values()
            .filter(|m| {
                m.registry_id == registry
                    && m.image == image
                    && m.subject_digest.as_ref() == Some(subject)
            })
            .collect()
    }

    /// Manifests of a repository, for garbage collection checks.
    pub fn manifests(&self) -> impl Iterator<Item = &ManifestRow> {
        self.manifests.values()
    }

    // Tags

    /// Find a tag.
    pub fn tag(&self, registry: RowId, image: &str, name: &str) -> Option<&TagRow> {
        self.tags
            .values()
            .find(|t| t.registry_id == registry && t.image == image && t.name == name)
    }

    /// Point a tag at a manifest. Returns the manifest it pointed at before, if different.
    pub fn upsert_tag(
        &mut self,
        registry: RowId,
        image: &str,
        name: &str,
        manifest: RowId,
    ) -> Option<RowId> {
        let now = Utc::now();
        if let Some(existing) = self
            .tags
            .values_mut()
            .find(|t| t.registry_id == registry && t.image == image && t.name == name)
        {
            let previous = existing.manifest_id;
            existing.manifest_id = manifest;
            existing.updated_at = now;
            return (previous != manifest).then_some(previous);
        }

        let id = self.alloc_id();
        self.tags.insert(
            id,
            TagRow {
                id,
                registry_id: registry,
                image: image.to_owned(),
                name: name.to_owned(),
                manifest_id: manifest,
                created_at: now,
                updated_at: now,
            },
        );
        None
    }

    /// Delete a tag, returning the manifest it pointed at.
    pub fn delete_tag(&mut self, registry: RowId, image: &str, name: &str) -> Option<RowId> {
        let id = self.tag(registry, image, name)?.id;
        self.tags.remove(&id).map(|tag| tag.manifest_id)
    }

    /// Tags of a repository in lexical order.
    pub fn tags(&self, registry: RowId, image: &str) -> Vec<&TagRow> {
        let mut tags: Vec<&TagRow> = self
            .tags
            .values()
            .filter(|t| t.registry_id == registry && t.image == image)
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        tags
    }

    /// Whether any tag points at the manifest.
    pub fn is_tagged(&self, manifest: RowId) -> bool {
        self.tags.values().any(|t| t.manifest_id == manifest)
    }
}
