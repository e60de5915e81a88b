//! The registry engine for content stored here.
//!
//! [`LocalRegistry`] implements every distribution endpoint against the
//! metadata store and the blob store. Virtual registries use it directly; the
//! pull-through [`proxy`](crate::proxy) uses it to serve and populate its cache.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::blobstore::BlobStore;
use crate::db::{Database, ManifestRow, RegistryKind, RegistryRow};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::gc::GcService;
use crate::headers::{DOCKER_CONTENT_DIGEST, OCI_FILTERS_APPLIED, ResponseHeaders};
use crate::info::RegistryInfo;
use crate::manifest::{
    Descriptor, ImageIndex, MEDIA_TYPE_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_SCHEMA2, unmarshal_manifest,
};
use crate::manifest_service::ManifestService;
use crate::upload::UploadTokens;

mod blobs;

pub use blobs::{BlobResponse, ChunkHeaders, Mount};

/// Platform served to clients which cannot read lists.
const DEFAULT_ARCHITECTURE: &str = "amd64";
const DEFAULT_OS: &str = "linux";

/// Switches for local registry behaviour.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LocalSettings {
    /// Allow clients to delete blobs.
    pub delete_enabled: bool,
}

/// Content negotiation for a manifest request.
#[derive(Debug, Clone, Default)]
pub struct ManifestRequest {
    /// Media types from `Accept`, without parameters.
    pub accept: Vec<String>,
    /// `If-None-Match`, unquoted.
    pub if_none_match: Option<String>,
}

impl ManifestRequest {
    /// Read `Accept` and `If-None-Match`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let accept = headers
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|v| v.split(';').next().unwrap_or_default().trim().to_owned())
            .filter(|v| !v.is_empty())
            .collect();
        let if_none_match = headers
            .get(header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().trim_matches('"').to_owned());
        Self {
            accept,
            if_none_match,
        }
    }

    /// Whether the client listed `media_type`.
    pub fn accepts(&self, media_type: &str) -> bool {
        self.accept.iter().any(|accepted| accepted == media_type)
    }

    /// Whether `If-None-Match` names `digest`.
    pub fn not_modified(&self, digest: &Digest) -> bool {
        self.if_none_match
            .as_deref()
            .is_some_and(|etag| etag == digest.to_string())
    }
}

/// A manifest ready to send.
#[derive(Debug, Clone)]
pub struct ManifestResponse {
    /// `Content-Type`
    pub media_type: String,
    /// Digest of the payload.
    pub digest: Digest,
    /// Exact stored bytes.
    pub payload: Bytes,
    /// `Content-Length` when `payload` is not held (a proxied `HEAD`).
    pub size: Option<u64>,
    /// The client already has this digest.
    pub not_modified: bool,
    /// Omit the body, keeping its headers.
    pub head: bool,
}

impl ManifestResponse {
    fn from_row(row: &ManifestRow) -> Self {
        Self {
            media_type: row.media_type.clone(),
            digest: row.digest.clone(),
            payload: row.payload.clone(),
            size: None,
            not_modified: false,
            head: false,
        }
    }

    /// Drop the body from the response.
    pub fn into_head(mut self) -> Self {
        self.head = true;
        self
    }
}

impl IntoResponse for ManifestResponse {
    fn into_response(self) -> Response {
        let mut headers = ResponseHeaders::new(StatusCode::OK);
        headers
            .insert(DOCKER_CONTENT_DIGEST, &self.digest)
            .insert(header::ETAG, format!("\"{}\"", self.digest));

        if self.not_modified {
            headers.status = StatusCode::NOT_MODIFIED;
            return headers.into_response();
        }

        headers
            .insert(header::CONTENT_TYPE, &self.media_type)
            .insert(
                header::CONTENT_LENGTH,
                self.size.unwrap_or(self.payload.len() as u64),
            );
        let body = if self.head {
            Body::empty()
        } else {
            Body::from(self.payload)
        };
        headers.with_body(body)
    }
}

/// `GET /v2/<name>/tags/list` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagList {
    /// Repository name.
    pub name: String,
    /// Tags, in lexical order.
    pub tags: Vec<String>,
}

/// A page of tags plus its `Link` header.
#[derive(Debug)]
pub struct TagsResponse {
    headers: ResponseHeaders,
    list: TagList,
}

impl TagsResponse {
    /// Cut one page from lexically sorted `tags`.
    pub fn paginate(repository: String, mut tags: Vec<String>, n: Option<usize>, last: Option<&str>) -> Self {
        tags.sort();
        if let Some(last) = last {
            tags.retain(|tag| tag.as_str() > last);
        }

        let mut headers = ResponseHeaders::new(StatusCode::OK);
        if let Some(n) = n {
            if tags.len() > n {
                tags.truncate(n);
                if let Some(last) = tags.last() {
                    headers.insert(
                        header::LINK,
                        format!("</v2/{repository}/tags/list?last={last}&n={n}>; rel=\"next\""),
                    );
                }
            }
        }

        Self {
            headers,
            list: TagList {
                name: repository,
                tags,
            },
        }
    }

    /// The page contents.
    pub fn list(&self) -> &TagList {
        &self.list
    }
}

impl IntoResponse for TagsResponse {
    fn into_response(self) -> Response {
        self.headers.with_body(Json(self.list))
    }
}

/// An OCI index of referrers.
#[derive(Debug)]
pub struct ReferrersResponse {
    headers: ResponseHeaders,
    index: ImageIndex,
}

impl ReferrersResponse {
    /// The index body.
    pub fn index(&self) -> &ImageIndex {
        &self.index
    }
}

impl IntoResponse for ReferrersResponse {
    fn into_response(self) -> Response {
        self.headers.with_body(Json(self.index))
    }
}

/// The registry engine over local storage.
#[derive(Debug, Clone)]
pub struct LocalRegistry {
    db: Database,
    gc: GcService,
    manifests: ManifestService,
    blobs: BlobStore,
    tokens: UploadTokens,
    settings: Arc<LocalSettings>,
}

impl LocalRegistry {
    /// Assemble the engine.
    pub fn new(
        db: Database,
        gc: GcService,
        blobs: BlobStore,
        tokens: UploadTokens,
        settings: LocalSettings,
    ) -> Self {
        Self {
            manifests: ManifestService::new(db.clone(), gc.clone()),
            db,
            gc,
            blobs,
            tokens,
            settings: Arc::new(settings),
        }
    }

    /// The metadata store.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// The garbage collector queues.
    pub fn gc(&self) -> &GcService {
        &self.gc
    }

    /// The blob store.
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Manifest persistence.
    pub fn manifests(&self) -> &ManifestService {
        &self.manifests
    }

    /// Create a registry (or find the existing one).
    #[tracing::instrument(skip(self))]
    pub async fn create_registry(
        &self,
        root: &str,
        name: &str,
        kind: RegistryKind,
    ) -> RegistryResult<RegistryRow> {
        let mut tx = self.db.begin().await;
        let id = tx.create_registry(root, name, kind);
        let row = tx
            .registry_by_id(id)
            .cloned()
            .ok_or_else(|| RegistryError::Internal(format!("registry {root}/{name} vanished")))?;
        tx.commit().await?;
        Ok(row)
    }

    /// The registry a request addresses.
    pub async fn registry(&self, info: &RegistryInfo) -> RegistryResult<RegistryRow> {
        self.db
            .read()
            .await
            .registry(&info.root, &info.registry)
            .cloned()
            .ok_or_else(|| RegistryError::NameUnknown(info.repository()))
    }

    /// The stored manifest a reference resolves to. Tags go through the tag table,
    /// digests never do.
    pub async fn resolve_manifest(&self, info: &RegistryInfo) -> RegistryResult<ManifestRow> {
        let registry = self.registry(info).await?;
        let tables = self.db.read().await;
        let row = match (&info.tag, &info.digest) {
            (Some(tag), _) => tables
                .tag(registry.id, &info.image, tag)
                .and_then(|tag| tables.manifest(tag.manifest_id)),
            (None, Some(digest)) => tables.manifest_by_digest(registry.id, &info.image, digest),
            (None, None) => None,
        };
        row.cloned()
            .ok_or_else(|| RegistryError::ManifestUnknown(info.reference()))
    }

    /// `GET /v2/<name>/manifests/<reference>`
    #[tracing::instrument(skip(self, request), fields(reference = %info))]
    pub async fn pull_manifest(
        &self,
        info: &RegistryInfo,
        request: &ManifestRequest,
    ) -> RegistryResult<ManifestResponse> {
        let row = self.resolve_manifest(info).await?;

        if row.media_type == MEDIA_TYPE_OCI_MANIFEST && !request.accepts(MEDIA_TYPE_OCI_MANIFEST) {
            return Err(RegistryError::ManifestUnknown(format!(
                "{}: OCI manifest found, but the client does not accept OCI manifests",
                info.reference()
            )));
        }

        if row.media_type == MEDIA_TYPE_OCI_INDEX
            && !row.non_conformant
            && !request.accepts(MEDIA_TYPE_OCI_INDEX)
        {
            return Err(RegistryError::ManifestUnknown(format!(
                "{}: OCI index found, but the client does not accept OCI indexes",
                info.reference()
            )));
        }

        let row = if row.media_type == MEDIA_TYPE_MANIFEST_LIST
            && !request.accepts(MEDIA_TYPE_MANIFEST_LIST)
            && info.tag.is_some()
        {
            let child = self.default_platform_child(info, &row).await?;
            if child.media_type == MEDIA_TYPE_SCHEMA2 && !request.accepts(MEDIA_TYPE_SCHEMA2) {
                return Err(RegistryError::ManifestInvalid(format!(
                    "{}: schema 2 manifest not supported by client",
                    child.digest
                )));
            }
            child
        } else {
            row
        };

        let mut response = ManifestResponse::from_row(&row);
        response.not_modified = request.not_modified(&row.digest);
        Ok(response)
    }

    /// The amd64/linux child of a list, for clients which cannot read lists.
    async fn default_platform_child(
        &self,
        info: &RegistryInfo,
        list: &ManifestRow,
    ) -> RegistryResult<ManifestRow> {
        let (manifest, _) = unmarshal_manifest(&list.media_type, list.payload.clone())?;
        let child = manifest
            .child_for_platform(DEFAULT_ARCHITECTURE, DEFAULT_OS)
            .ok_or_else(|| {
                RegistryError::ManifestUnknown(format!(
                    "{}: no {DEFAULT_OS}/{DEFAULT_ARCHITECTURE} manifest in list",
                    info.reference()
                ))
            })?;
        tracing::debug!(child = %child.digest, "rewriting list for a client without list support");

        self.db
            .read()
            .await
            .manifest_by_digest(list.registry_id, &info.image, &child.digest)
            .cloned()
            .ok_or_else(|| RegistryError::ManifestUnknown(child.digest.to_string()))
    }

    /// `PUT /v2/<name>/manifests/<reference>`
    #[tracing::instrument(skip(self, payload), fields(reference = %info))]
    pub async fn put_manifest(
        &self,
        info: &RegistryInfo,
        content_type: &str,
        payload: Bytes,
    ) -> RegistryResult<ResponseHeaders> {
        let registry = self.registry(info).await?;
        if info.tag.is_none() && info.digest.is_none() {
            return Err(RegistryError::TagInvalid("a tag or digest is required".into()));
        }

        let (manifest, descriptor) = unmarshal_manifest(content_type, payload)?;
        if let Some(expected) = &info.digest {
            if expected != &descriptor.digest {
                return Err(RegistryError::DigestInvalid(format!(
                    "manifest digest {} does not match reference {expected}",
                    descriptor.digest
                )));
            }
        }

        let mut headers = ResponseHeaders::new(StatusCode::CREATED);
        self.manifests
            .db_put(&manifest, &descriptor.digest, &registry, info, &mut headers)
            .await?;
        if let Some(tag) = &info.tag {
            self.manifests
                .db_tag(&manifest, &descriptor.digest, tag, &registry, info, &mut headers)
                .await?;
        }

        headers
            .insert(
                header::LOCATION,
                format!("/v2/{}/manifests/{}", info.repository(), descriptor.digest),
            )
            .insert(DOCKER_CONTENT_DIGEST, &descriptor.digest)
            .insert(header::CONTENT_LENGTH, 0);
        Ok(headers)
    }

    /// `DELETE /v2/<name>/manifests/<reference>`: a tag reference removes the tag,
    /// a digest reference removes the manifest.
    #[tracing::instrument(skip(self), fields(reference = %info))]
    pub async fn delete_manifest(&self, info: &RegistryInfo) -> RegistryResult<ResponseHeaders> {
        let registry = self.registry(info).await?;
        match (&info.tag, &info.digest) {
            (Some(tag), _) => self.manifests.delete_tag(&registry, info, tag).await?,
            (None, Some(digest)) => {
                self.manifests
                    .delete_manifest(&registry, info, digest)
                    .await?
            }
            (None, None) => return Err(RegistryError::ManifestUnknown(info.repository())),
        }
        Ok(ResponseHeaders::new(StatusCode::ACCEPTED))
    }

    /// Tag an already stored manifest. Returns `false` if it is not stored yet.
    pub async fn tag_manifest(
        &self,
        info: &RegistryInfo,
        tag: &str,
        digest: &Digest,
    ) -> RegistryResult<bool> {
        let registry = self.registry(info).await?;
        let Some(row) = self
            .db
            .read()
            .await
            .manifest_by_digest(registry.id, &info.image, digest)
            .cloned()
        else {
            return Ok(false);
        };

        let (manifest, _) = unmarshal_manifest(&row.media_type, row.payload.clone())?;
        let mut headers = ResponseHeaders::default();
        self.manifests
            .db_tag(&manifest, digest, tag, &registry, info, &mut headers)
            .await?;
        Ok(true)
    }

    /// `GET /v2/<name>/tags/list`
    #[tracing::instrument(skip(self), fields(repository = %info.repository()))]
    pub async fn list_tags(
        &self,
        info: &RegistryInfo,
        n: Option<usize>,
        last: Option<&str>,
    ) -> RegistryResult<TagsResponse> {
        let registry = self.registry(info).await?;
        let tables = self.db.read().await;
        if tables.image(registry.id, &info.image).is_none() {
            return Err(RegistryError::NameUnknown(info.repository()));
        }
        let tags = tables
            .tags(registry.id, &info.image)
            .into_iter()
            .map(|tag| tag.name.clone())
            .collect();
        Ok(TagsResponse::paginate(info.repository(), tags, n, last))
    }

    /// `GET /v2/<name>/referrers/<digest>`
    #[tracing::instrument(skip(self), fields(repository = %info.repository()))]
    pub async fn list_referrers(
        &self,
        info: &RegistryInfo,
        subject: &Digest,
        artifact_type: Option<&str>,
    ) -> RegistryResult<ReferrersResponse> {
        let registry = self.registry(info).await?;
        let tables = self.db.read().await;

        let manifests = tables
            .referrers(registry.id, &info.image, subject)
            .into_iter()
            .map(|row| {
                let mut descriptor =
                    Descriptor::new(&row.media_type, row.digest.clone(), row.payload.len() as u64);
                descriptor.artifact_type = row
                    .artifact_type
                    .clone()
                    .or_else(|| row.config_media_type.clone());
                descriptor.annotations = row.annotations.clone();
                descriptor
            })
            .filter(|descriptor| {
                artifact_type.is_none_or(|wanted| descriptor.artifact_type.as_deref() == Some(wanted))
            })
            .collect();

        let mut headers = ResponseHeaders::new(StatusCode::OK);
        headers.insert(header::CONTENT_TYPE, MEDIA_TYPE_OCI_INDEX);
        if artifact_type.is_some() {
            headers.insert(OCI_FILTERS_APPLIED, "artifactType");
        }
        Ok(ReferrersResponse {
            headers,
            index: ImageIndex::new(manifests),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::gc::GcSettings;
    use crate::manifest::tests::{image_manifest, list_manifest};
    use secret::Secret;
    use storage::{MemoryStorage, Storage};

    pub(crate) async fn local(delete_enabled: bool) -> (LocalRegistry, RegistryInfo) {
        let storage = Storage::new(MemoryStorage::with_buckets(&["registry"]));
        let local = LocalRegistry::new(
            Database::in_memory(),
            GcService::new(GcSettings::default()),
            BlobStore::new(storage.bucket("registry")),
            UploadTokens::new(Secret::from("test-key")),
            LocalSettings { delete_enabled },
        );
        local
            .create_registry("acme", "docker", RegistryKind::Virtual)
            .await
            .unwrap();
        (local, RegistryInfo::new("acme", "docker", "app").unwrap())
    }

    /// Upload a blob in one request.
    pub(crate) async fn push_blob(local: &LocalRegistry, info: &RegistryInfo, data: &[u8]) {
        local
            .init_blob_upload(info, None, Some(Digest::sha256(data)), &mut &data[..])
            .await
            .unwrap();
    }

    async fn push(local: &LocalRegistry, info: &RegistryInfo, reference: &str, media_type: &str, bytes: &[u8]) {
        local
            .put_manifest(
                &info.clone().with_reference(reference).unwrap(),
                media_type,
                Bytes::copy_from_slice(bytes),
            )
            .await
            .unwrap();
    }

    fn accepting(types: &[&str]) -> ManifestRequest {
        ManifestRequest {
            accept: types.iter().map(|t| t.to_string()).collect(),
            if_none_match: None,
        }
    }

    #[test]
    fn parses_accept_headers() {
        let mut headers = HeaderMap::new();
        headers.append(header::ACCEPT, "a/b; q=0.5, c/d".parse().unwrap());
        headers.append(header::ACCEPT, "e/f".parse().unwrap());
        headers.insert(header::IF_NONE_MATCH, "\"sha256:abc\"".parse().unwrap());

        let request = ManifestRequest::from_headers(&headers);
        assert_eq!(request.accept, vec!["a/b", "c/d", "e/f"]);
        assert_eq!(request.if_none_match.as_deref(), Some("sha256:abc"));
    }

    #[test]
    fn pages_tags() {
        let tags = vec!["c".into(), "a".into(), "b".into(), "d".into()];
        let page = TagsResponse::paginate("acme/docker/app".into(), tags.clone(), Some(2), None);
        assert_eq!(page.list().tags, vec!["a", "b"]);
        assert_eq!(
            page.headers.get(&header::LINK),
            Some("</v2/acme/docker/app/tags/list?last=b&n=2>; rel=\"next\"")
        );

        let page = TagsResponse::paginate("acme/docker/app".into(), tags, Some(2), Some("b"));
        assert_eq!(page.list().tags, vec!["c", "d"]);
        assert!(page.headers.get(&header::LINK).is_none());
    }

    #[tokio::test]
    async fn manifest_round_trip_and_conditional_get() {
        let (local, info) = local(false).await;
        push_blob(&local, &info, b"{}").await;
        let bytes = image_manifest(MEDIA_TYPE_SCHEMA2, b"{}", &[]);
        push(&local, &info, "latest", MEDIA_TYPE_SCHEMA2, &bytes).await;

        let tagged = info.clone().with_reference("latest").unwrap();
        let response = local.pull_manifest(&tagged, &accepting(&[MEDIA_TYPE_SCHEMA2])).await.unwrap();
        assert_eq!(response.payload, bytes);
        assert_eq!(response.digest, Digest::sha256(&bytes));

        let request = ManifestRequest {
            accept: vec![MEDIA_TYPE_SCHEMA2.into()],
            if_none_match: Some(response.digest.to_string()),
        };
        assert!(local.pull_manifest(&tagged, &request).await.unwrap().not_modified);
    }

    #[tokio::test]
    async fn oci_manifests_need_oci_clients() {
        let (local, info) = local(false).await;
        push_blob(&local, &info, b"{}").await;
        let bytes = image_manifest(MEDIA_TYPE_OCI_MANIFEST, b"{}", &[]);
        push(&local, &info, "v1", MEDIA_TYPE_OCI_MANIFEST, &bytes).await;

        let tagged = info.with_reference("v1").unwrap();
        let err = local
            .pull_manifest(&tagged, &accepting(&[MEDIA_TYPE_SCHEMA2]))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ManifestUnknown(_)));
    }

    #[tokio::test]
    async fn lists_rewrite_only_for_tags() {
        let (local, info) = local(false).await;
        push_blob(&local, &info, b"{}").await;
        push_blob(&local, &info, b"arm").await;
        let amd64 = image_manifest(MEDIA_TYPE_SCHEMA2, b"{}", &[]);
        let arm64 = image_manifest(MEDIA_TYPE_SCHEMA2, b"{}", &[b"arm"]);
        push(&local, &info, &Digest::sha256(&amd64).to_string(), MEDIA_TYPE_SCHEMA2, &amd64).await;
        push(&local, &info, &Digest::sha256(&arm64).to_string(), MEDIA_TYPE_SCHEMA2, &arm64).await;
        let list = list_manifest(
            MEDIA_TYPE_MANIFEST_LIST,
            &[(&arm64, "arm64", "linux"), (&amd64, "amd64", "linux")],
        );
        push(&local, &info, "multi", MEDIA_TYPE_MANIFEST_LIST, &list).await;

        let legacy = accepting(&[MEDIA_TYPE_SCHEMA2]);
        let tagged = info.clone().with_reference("multi").unwrap();
        assert_eq!(local.pull_manifest(&tagged, &legacy).await.unwrap().payload, amd64);

        let pinned = info.with_reference(&Digest::sha256(&list).to_string()).unwrap();
        assert_eq!(local.pull_manifest(&pinned, &legacy).await.unwrap().payload, list);
    }

    #[tokio::test]
    async fn oci_indexes_need_index_clients() {
        let (local, info) = local(false).await;
        push_blob(&local, &info, b"{}").await;
        let child = image_manifest(MEDIA_TYPE_OCI_MANIFEST, b"{}", &[]);
        push(&local, &info, &Digest::sha256(&child).to_string(), MEDIA_TYPE_OCI_MANIFEST, &child).await;
        let index = list_manifest(MEDIA_TYPE_OCI_INDEX, &[(&child, "amd64", "linux")]);
        push(&local, &info, "multi", MEDIA_TYPE_OCI_INDEX, &index).await;

        let legacy = accepting(&[MEDIA_TYPE_SCHEMA2, MEDIA_TYPE_OCI_MANIFEST]);
        let tagged = info.clone().with_reference("multi").unwrap();
        let err = local.pull_manifest(&tagged, &legacy).await.unwrap_err();
        assert!(matches!(err, RegistryError::ManifestUnknown(_)));

        let pinned = info.clone().with_reference(&Digest::sha256(&index).to_string()).unwrap();
        let err = local.pull_manifest(&pinned, &legacy).await.unwrap_err();
        assert!(matches!(err, RegistryError::ManifestUnknown(_)));

        let modern = accepting(&[MEDIA_TYPE_OCI_INDEX]);
        assert_eq!(local.pull_manifest(&tagged, &modern).await.unwrap().payload, index);
    }

    #[tokio::test]
    async fn rewritten_child_must_be_accepted() {
        let (local, info) = local(false).await;
        push_blob(&local, &info, b"{}").await;
        let amd64 = image_manifest(MEDIA_TYPE_SCHEMA2, b"{}", &[]);
        push(&local, &info, &Digest::sha256(&amd64).to_string(), MEDIA_TYPE_SCHEMA2, &amd64).await;
        let list = list_manifest(MEDIA_TYPE_MANIFEST_LIST, &[(&amd64, "amd64", "linux")]);
        push(&local, &info, "multi", MEDIA_TYPE_MANIFEST_LIST, &list).await;

        let tagged = info.with_reference("multi").unwrap();
        let err = local
            .pull_manifest(&tagged, &accepting(&[MEDIA_TYPE_OCI_MANIFEST]))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ManifestInvalid(_)));
    }

    #[tokio::test]
    async fn referrers_fall_back_to_config_type() {
        let (local, info) = local(false).await;
        push_blob(&local, &info, b"{}").await;
        let subject = image_manifest(MEDIA_TYPE_OCI_MANIFEST, b"{}", &[]);
        let subject_digest = Digest::sha256(&subject);
        push(&local, &info, "v1", MEDIA_TYPE_OCI_MANIFEST, &subject).await;

        let signature = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_MANIFEST,
            "config": {
                "mediaType": "application/vnd.example.signature",
                "digest": Digest::sha256(b"{}").to_string(),
                "size": 2,
            },
            "layers": [],
            "subject": {
                "mediaType": MEDIA_TYPE_OCI_MANIFEST,
                "digest": subject_digest.to_string(),
                "size": subject.len(),
            },
        }))
        .unwrap();
        let headers = local
            .put_manifest(
                &info.clone().with_reference(&Digest::sha256(&signature).to_string()).unwrap(),
                MEDIA_TYPE_OCI_MANIFEST,
                Bytes::from(signature),
            )
            .await
            .unwrap();
        assert_eq!(headers.get(&crate::headers::OCI_SUBJECT), Some(subject_digest.to_string().as_str()));

        let all = local.list_referrers(&info, &subject_digest, None).await.unwrap();
        assert_eq!(all.index().manifests.len(), 1);
        assert_eq!(
            all.index().manifests[0].artifact_type.as_deref(),
            Some("application/vnd.example.signature")
        );

        let filtered = local
            .list_referrers(&info, &subject_digest, Some("application/other"))
            .await
            .unwrap();
        assert!(filtered.index().manifests.is_empty());
        assert_eq!(filtered.headers.get(&OCI_FILTERS_APPLIED), Some("artifactType"));
    }

    #[tokio::test]
    async fn manifest_without_reference_is_rejected() {
        let (local, info) = local(false).await;
        let err = local
            .put_manifest(&info, MEDIA_TYPE_SCHEMA2, Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::TagInvalid(_)));
    }
}
