//! Pull-through caching for upstream registries.
//!
//! A request first checks the local cache. On a miss (or a stale tag) the
//! artifact is fetched from the upstream, returned to the client right away,
//! and written into the local registry by a background task on the
//! [`TaskPool`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::header;
use chrono::Utc;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};
use tracing::Instrument as _;
use url::Url;

use crate::blobstore::BlobReader;
use crate::config::seconds;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::headers::ResponseHeaders;
use crate::info::RegistryInfo;
use crate::local::{
    BlobResponse, ChunkHeaders, LocalRegistry, ManifestRequest, ManifestResponse, TagsResponse,
};
use crate::manifest::unmarshal_manifest;
use crate::remote::{RemoteError, RemoteRegistry};

mod cache;
mod inflight;
mod tasks;

pub use cache::{
    CacheHandlers, CacheJob, CacheOutcome, DefaultCacheHandler, ListCacheHandler,
    ManifestCacheHandler,
};
pub use inflight::{InflightGuard, InflightSet};
pub use tasks::TaskPool;

/// Size of the chunks proxied blobs are cached in.
const CACHE_CHUNK_SIZE: usize = 1024 * 1024;

/// Retry budgets for background work.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProxySettings {
    /// Attempts to cache an image manifest.
    pub manifest_attempts: u32,
    /// Attempts to cache a list or index.
    pub list_attempts: u32,
    /// Pause between caching attempts.
    #[serde(with = "seconds")]
    pub retry_interval: Duration,
    /// Attempts to tag a manifest after a proxied `HEAD`.
    pub tag_attempts: u32,
    /// Pause between tagging attempts.
    #[serde(with = "seconds")]
    pub tag_interval: Duration,
    /// Background tasks allowed to run at once.
    pub max_concurrent_tasks: usize,
    /// Wall clock cap for one background task.
    #[serde(with = "seconds")]
    pub max_task_duration: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            manifest_attempts: 10,
            list_attempts: 20,
            retry_interval: Duration::from_secs(20),
            tag_attempts: 60,
            tag_interval: Duration::from_secs(10),
            max_concurrent_tasks: 32,
            max_task_duration: Duration::from_secs(30 * 60),
        }
    }
}

/// Serves upstream registries through the local cache.
#[derive(Debug, Clone)]
pub struct ProxyController {
    local: LocalRegistry,
    /// Clients keyed by `<root>/<registry>`.
    upstreams: Arc<HashMap<String, Arc<dyn RemoteRegistry>>>,
    tasks: TaskPool,
    inflight: InflightSet,
    handlers: Arc<CacheHandlers>,
    settings: Arc<ProxySettings>,
}

impl ProxyController {
    /// A proxy caching into `local`. `upstreams` is keyed by `<root>/<registry>`.
    pub fn new(
        local: LocalRegistry,
        upstreams: HashMap<String, Arc<dyn RemoteRegistry>>,
        handlers: CacheHandlers,
        settings: ProxySettings,
    ) -> Self {
        Self {
            local,
            upstreams: Arc::new(upstreams),
            tasks: TaskPool::new(settings.max_concurrent_tasks, settings.max_task_duration),
            inflight: InflightSet::new(),
            handlers: Arc::new(handlers),
            settings: Arc::new(settings),
        }
    }

    /// The cache.
    pub fn local(&self) -> &LocalRegistry {
        &self.local
    }

    /// Background work started by proxied requests.
    pub fn tasks(&self) -> &TaskPool {
        &self.tasks
    }

    /// Artifacts being cached right now.
    pub fn inflight(&self) -> &InflightSet {
        &self.inflight
    }

    /// Whether an upstream client is configured for this registry.
    pub fn has_upstream(&self, info: &RegistryInfo) -> bool {
        self.upstreams.contains_key(&upstream_key(info))
    }

    fn remote(&self, info: &RegistryInfo) -> RegistryResult<Arc<dyn RemoteRegistry>> {
        self.upstreams
            .get(&upstream_key(info))
            .cloned()
            .ok_or_else(|| {
                RegistryError::Unavailable(format!("no upstream configured for {}/{}", info.root, info.registry))
            })
    }

    async fn use_local_blob(&self, info: &RegistryInfo, digest: &Digest, head: bool) -> Option<BlobResponse> {
        let result = if head {
            self.local.head_blob(info, digest).await
        } else {
            self.local.get_blob(info, digest).await
        };
        match result {
            Ok(response) => Some(response),
            Err(error) => {
                if !error.is_not_found() {
                    tracing::debug!(%error, %digest, "local blob unusable, proxying");
                }
                None
            }
        }
    }

    /// `HEAD /v2/<name>/blobs/<digest>`
    #[tracing::instrument(skip(self), fields(repository = %info.repository()))]
    pub async fn head_blob(&self, info: &RegistryInfo, digest: &Digest) -> RegistryResult<BlobResponse> {
        if let Some(response) = self.use_local_blob(info, digest, true).await {
            return Ok(response);
        }
        let remote = self.remote(info)?.blob_reader(&info.image, digest).await;
        let blob = remote.map_err(|error| blob_error(error, digest))?;
        Ok(BlobResponse {
            digest: digest.clone(),
            size: blob.size,
            body: None,
        })
    }

    /// `GET /v2/<name>/blobs/<digest>`
    #[tracing::instrument(skip(self), fields(repository = %info.repository()))]
    pub async fn get_blob(&self, info: &RegistryInfo, digest: &Digest) -> RegistryResult<BlobResponse> {
        if let Some(response) = self.use_local_blob(info, digest, false).await {
            return Ok(response);
        }
        self.proxy_blob(info, digest).await
    }

    /// Stream a blob from upstream to the client, caching the same bytes.
    async fn proxy_blob(&self, info: &RegistryInfo, digest: &Digest) -> RegistryResult<BlobResponse> {
        let remote = self.remote(info)?;
        let blob = remote
            .blob_reader(&info.image, digest)
            .await
            .map_err(|error| blob_error(error, digest))?;

        let (client_reader, client_writer) = tokio::io::duplex(CACHE_CHUNK_SIZE);
        let cache_writer = self.spawn_cache_blob(info, digest);
        tokio::spawn(
            tee(blob.reader, client_writer, cache_writer)
                .instrument(tracing::debug_span!("tee", %digest)),
        );

        Ok(BlobResponse {
            digest: digest.clone(),
            size: blob.size,
            body: Some(Box::new(client_reader)),
        })
    }

    /// Start caching a blob; returns where to write its bytes, or `None` when
    /// the blob is already being cached or there is no room for the task.
    fn spawn_cache_blob(&self, info: &RegistryInfo, digest: &Digest) -> Option<DuplexStream> {
        let guard = self.inflight.guard(format!("blob:{}/{digest}", info.root))?;
        let (reader, writer) = tokio::io::duplex(CACHE_CHUNK_SIZE);

        let local = self.local.clone();
        let info = info.clone();
        let digest = digest.clone();
        let spawned = self.tasks.try_spawn("cache-blob", async move {
            let _guard = guard;
            match cache_blob(&local, &info, &digest, reader).await {
                Ok(()) => tracing::debug!(%digest, "cached proxied blob"),
                Err(error) => tracing::warn!(%error, %digest, "caching proxied blob failed"),
            }
        });
        spawned.ok().map(|()| writer)
    }

    /// Serve a manifest from the local cache if it is there and still current.
    ///
    /// `Ok(None)` means the caller should proxy.
    async fn use_local_manifest(
        &self,
        info: &RegistryInfo,
        request: &ManifestRequest,
    ) -> RegistryResult<Option<ManifestResponse>> {
        let row = match self.local.resolve_manifest(info).await {
            Ok(row) => row,
            Err(error) if error.is_not_found() => return Ok(None),
            Err(error) => {
                tracing::debug!(%error, "local manifest unusable, proxying");
                return Ok(None);
            }
        };

        let remote = self.remote(info)?;
        match remote.manifest_exist(&info.image, &info.reference()).await {
            Ok(head) => match head.digest {
                Some(digest) if !info.is_digest_reference() && digest != row.digest => {
                    tracing::debug!(local = %row.digest, upstream = %digest, "cached tag is stale");
                    return Ok(None);
                }
                _ => {}
            },
            Err(RemoteError::NotFound(_)) => {
                self.spawn_forget_manifest(info, row.digest);
                return Err(RegistryError::ManifestUnknown(info.reference()));
            }
            Err(error @ (RemoteError::RateLimited | RemoteError::Transport(_))) => {
                tracing::debug!(%error, "upstream check failed, serving the cached manifest");
            }
            Err(error) => return Err(error.into()),
        }

        match self.local.pull_manifest(info, request).await {
            Ok(response) => Ok(Some(response)),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Forget a tag or manifest the upstream no longer has.
    fn spawn_forget_manifest(&self, info: &RegistryInfo, digest: Digest) {
        let local = self.local.clone();
        let info = info.clone();
        self.tasks.spawn("forget-manifest", async move {
            let result = async {
                let registry = local.registry(&info).await?;
                match &info.tag {
                    Some(tag) => local.manifests().delete_tag(&registry, &info, tag).await,
                    None => local.manifests().delete_manifest(&registry, &info, &digest).await,
                }
            }
            .await;
            match result {
                Ok(()) => tracing::debug!(reference = %info.reference(), "removed manifest gone upstream"),
                Err(error) => {
                    tracing::warn!(%error, reference = %info.reference(), "removing manifest gone upstream failed")
                }
            }
        });
    }

    /// `GET /v2/<name>/manifests/<reference>`
    #[tracing::instrument(skip(self, request), fields(reference = %info))]
    pub async fn get_manifest(
        &self,
        info: &RegistryInfo,
        request: &ManifestRequest,
    ) -> RegistryResult<ManifestResponse> {
        if let Some(response) = self.use_local_manifest(info, request).await? {
            return Ok(response);
        }
        self.proxy_manifest(info, request).await
    }

    /// Fetch a manifest from upstream, return it, and cache it in the background.
    async fn proxy_manifest(
        &self,
        info: &RegistryInfo,
        request: &ManifestRequest,
    ) -> RegistryResult<ManifestResponse> {
        let remote = self.remote(info)?;
        let fetched_at = Utc::now();
        let fetched = remote.manifest(&info.image, &info.reference()).await?;

        let (manifest, descriptor) = unmarshal_manifest(&fetched.media_type, fetched.payload.clone())
            .map_err(|error| RemoteError::Manifest(error.to_string()))?;
        if let Some(expected) = &info.digest {
            if expected != &descriptor.digest {
                return Err(RemoteError::Manifest(format!(
                    "requested {expected}, upstream sent {}",
                    descriptor.digest
                ))
                .into());
            }
        }
        if let Some(sent) = fetched.digest.as_ref().filter(|sent| **sent != descriptor.digest) {
            tracing::warn!(%sent, computed = %descriptor.digest, "upstream digest header disagrees with content");
        }

        let registry = self.local.registry(info).await?;
        self.spawn_cache_manifest(CacheJob {
            info: info.clone(),
            registry,
            manifest: manifest.clone(),
            digest: descriptor.digest.clone(),
            fetched_at,
        });

        Ok(ManifestResponse {
            media_type: manifest.media_type().to_owned(),
            not_modified: request.not_modified(&descriptor.digest),
            digest: descriptor.digest,
            payload: fetched.payload,
            size: None,
            head: false,
        })
    }

    fn spawn_cache_manifest(&self, job: CacheJob) {
        let Some(guard) = self.inflight.guard(format!("manifest:{}", job.info)) else {
            tracing::debug!(reference = %job.info, "manifest is already being cached");
            return;
        };
        let attempts = if job.manifest.is_list() {
            self.settings.list_attempts
        } else {
            self.settings.manifest_attempts
        };
        let interval = self.settings.retry_interval;
        let handler = self.handlers.for_media_type(job.manifest.media_type()).clone();
        let local = self.local.clone();

        self.tasks.spawn("cache-manifest", async move {
            let _guard = guard;
            for attempt in 1..=attempts {
                match handler.cache(&local, &job).await {
                    Ok(outcome) => {
                        tracing::debug!(?outcome, attempt, digest = %job.digest, "manifest cache finished");
                        return;
                    }
                    Err(error) => {
                        tracing::debug!(%error, attempt, digest = %job.digest, "caching manifest failed");
                    }
                }
                if attempt < attempts {
                    tokio::time::sleep(interval).await;
                }
            }
            tracing::warn!(attempts, digest = %job.digest, "gave up caching manifest");
        });
    }

    /// `HEAD /v2/<name>/manifests/<reference>`
    #[tracing::instrument(skip(self, request), fields(reference = %info))]
    pub async fn head_manifest(
        &self,
        info: &RegistryInfo,
        request: &ManifestRequest,
    ) -> RegistryResult<ManifestResponse> {
        if let Some(response) = self.use_local_manifest(info, request).await? {
            return Ok(response.into_head());
        }

        let head = self
            .remote(info)?
            .manifest_exist(&info.image, &info.reference())
            .await?;
        let Some(digest) = head.digest.filter(|_| !head.media_type.is_empty()) else {
            return self
                .proxy_manifest(info, request)
                .await
                .map(ManifestResponse::into_head);
        };

        if let Some(tag) = &info.tag {
            self.spawn_ensure_tag(info, tag, &digest);
        }
        Ok(ManifestResponse {
            media_type: head.media_type,
            not_modified: request.not_modified(&digest),
            digest,
            payload: Default::default(),
            size: head.size,
            head: true,
        })
    }

    /// Point `tag` at `digest` once the manifest is in the local cache.
    fn spawn_ensure_tag(&self, info: &RegistryInfo, tag: &str, digest: &Digest) {
        let Some(guard) = self.inflight.guard(format!("tag:{info}")) else {
            return;
        };
        let local = self.local.clone();
        let info = info.clone();
        let tag = tag.to_owned();
        let digest = digest.clone();
        let attempts = self.settings.tag_attempts;
        let interval = self.settings.tag_interval;

        self.tasks.spawn("ensure-tag", async move {
            let _guard = guard;
            for attempt in 1..=attempts {
                match local.tag_manifest(&info, &tag, &digest).await {
                    Ok(true) => {
                        tracing::debug!(%tag, %digest, attempt, "tagged cached manifest");
                        return;
                    }
                    Ok(false) => tracing::trace!(%digest, attempt, "manifest not cached yet"),
                    Err(error) => tracing::debug!(%error, %tag, attempt, "tagging cached manifest failed"),
                }
                if attempt < attempts {
                    tokio::time::sleep(interval).await;
                }
            }
            tracing::debug!(%tag, %digest, "gave up tagging cached manifest");
        });
    }

    /// `GET /v2/<name>/tags/list`, from upstream when it answers.
    #[tracing::instrument(skip(self), fields(repository = %info.repository()))]
    pub async fn list_tags(
        &self,
        info: &RegistryInfo,
        n: Option<usize>,
        last: Option<&str>,
    ) -> RegistryResult<TagsResponse> {
        match self.remote(info)?.list_tags(&info.image).await {
            Ok(tags) => Ok(TagsResponse::paginate(info.repository(), tags, n, last)),
            Err(error) => {
                tracing::debug!(%error, "upstream tag list failed, using cached tags");
                self.local.list_tags(info, n, last).await
            }
        }
    }
}

fn upstream_key(info: &RegistryInfo) -> String {
    format!("{}/{}", info.root, info.registry)
}

fn blob_error(error: RemoteError, digest: &Digest) -> RegistryError {
    match error {
        RemoteError::NotFound(_) => RegistryError::BlobUnknown(digest.clone()),
        other => other.into(),
    }
}

/// Copy `source` to the client and the cache. A client hanging up does not
/// stop the cache copy, and vice versa.
async fn tee(mut source: BlobReader, client: DuplexStream, cache: Option<DuplexStream>) {
    let mut client = Some(client);
    let mut cache = cache;
    let mut buffer = vec![0; 64 * 1024];

    loop {
        let n = match source.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(error) => {
                tracing::warn!(%error, "upstream blob stream failed");
                return;
            }
        };
        if let Some(writer) = client.as_mut() {
            if writer.write_all(&buffer[..n]).await.is_err() {
                tracing::debug!("client went away");
                client = None;
            }
        }
        if let Some(writer) = cache.as_mut() {
            if writer.write_all(&buffer[..n]).await.is_err() {
                cache = None;
            }
        }
        if client.is_none() && cache.is_none() {
            return;
        }
    }

    for writer in client.iter_mut().chain(cache.iter_mut()) {
        let _ = writer.shutdown().await;
    }
}

/// Push a blob into the local registry through the chunked upload protocol.
async fn cache_blob<R>(
    local: &LocalRegistry,
    info: &RegistryInfo,
    digest: &Digest,
    mut reader: R,
) -> RegistryResult<()>
where
    R: AsyncRead + Unpin + Send,
{
    let headers = local
        .init_blob_upload(info, None, None, &mut tokio::io::empty())
        .await?;
    let (uuid, mut token) = upload_location(&headers)?;

    let result = async {
        let mut offset = 0u64;
        loop {
            let mut chunk = Vec::with_capacity(CACHE_CHUNK_SIZE);
            (&mut reader)
                .take(CACHE_CHUNK_SIZE as u64)
                .read_to_end(&mut chunk)
                .await
                .map_err(|error| RegistryError::Internal(format!("reading proxied blob: {error}")))?;
            if chunk.is_empty() {
                break;
            }

            let length = chunk.len() as u64;
            let headers = ChunkHeaders {
                content_type: None,
                content_range: Some(format!("{offset}-{}", offset + length - 1)),
                content_length: Some(length),
            };
            let response = local
                .push_blob_chunk(info, &uuid, &token, &headers, &mut chunk.as_slice())
                .await?;
            (_, token) = upload_location(&response)?;
            offset += length;

            if length < CACHE_CHUNK_SIZE as u64 {
                break;
            }
        }

        local
            .push_blob(
                info,
                &uuid,
                &token,
                Some(digest.clone()),
                &ChunkHeaders::default(),
                &mut tokio::io::empty(),
            )
            .await
    }
    .await;

    if let Err(error) = result {
        match local.blobs().resume(&info.root, &uuid).await {
            Ok(upload) => {
                if let Err(cancel) = upload.cancel().await {
                    tracing::warn!(%cancel, "failed to cancel proxied blob upload");
                }
            }
            Err(missing) => tracing::trace!(%missing, "proxied blob upload already gone"),
        }
        return Err(error);
    }
    Ok(())
}

/// The upload uuid and `_state` token from an upload response's `Location`.
fn upload_location(headers: &ResponseHeaders) -> RegistryResult<(String, String)> {
    let invalid = || RegistryError::Internal("upload response has no usable location".into());
    let location = headers.get(&header::LOCATION).ok_or_else(invalid)?;
    let url = Url::parse("http://localhost")
        .and_then(|base| base.join(location))
        .map_err(|_| invalid())?;
    let uuid = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .ok_or_else(invalid)?
        .to_owned();
    let token = url
        .query_pairs()
        .find(|(key, _)| key == "_state")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(invalid)?;
    Ok((uuid, token))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::io::AsyncReadExt as _;

    use super::*;
    use crate::db::RegistryKind;
    use crate::manifest::tests::{image_manifest, list_manifest};
    use crate::manifest::{MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST, MEDIA_TYPE_SCHEMA2};
    use crate::remote::{ManifestHead, RemoteBlob, RemoteManifest};

    #[derive(Debug, Default)]
    struct FakeRemote {
        manifests: Mutex<HashMap<String, (String, Bytes)>>,
        blobs: Mutex<HashMap<Digest, Bytes>>,
        head_status: Mutex<Option<http::StatusCode>>,
        manifest_calls: AtomicUsize,
        blob_calls: AtomicUsize,
    }

    impl FakeRemote {
        fn put_manifest(&self, references: &[&str], media_type: &str, payload: &[u8]) -> Digest {
            let digest = Digest::sha256(payload);
            let mut manifests = self.manifests.lock();
            for reference in references.iter().copied().chain([digest.to_string().as_str()]) {
                manifests.insert(
                    reference.to_owned(),
                    (media_type.to_owned(), Bytes::copy_from_slice(payload)),
                );
            }
            digest
        }

        fn put_blob(&self, data: &[u8]) -> Digest {
            let digest = Digest::sha256(data);
            self.blobs.lock().insert(digest.clone(), Bytes::copy_from_slice(data));
            digest
        }
    }

    #[async_trait::async_trait]
    impl RemoteRegistry for FakeRemote {
        async fn manifest_exist(&self, _image: &str, reference: &str) -> Result<ManifestHead, RemoteError> {
            if let Some(status) = *self.head_status.lock() {
                return Err(RemoteError::from_status(status, reference, "refused".into()));
            }
            let manifests = self.manifests.lock();
            let (media_type, payload) = manifests
                .get(reference)
                .ok_or_else(|| RemoteError::NotFound(reference.to_owned()))?;
            Ok(ManifestHead {
                digest: Some(Digest::sha256(payload)),
                media_type: media_type.clone(),
                size: Some(payload.len() as u64),
            })
        }

        async fn manifest(&self, _image: &str, reference: &str) -> Result<RemoteManifest, RemoteError> {
            self.manifest_calls.fetch_add(1, Ordering::SeqCst);
            let manifests = self.manifests.lock();
            let (media_type, payload) = manifests
                .get(reference)
                .ok_or_else(|| RemoteError::NotFound(reference.to_owned()))?;
            Ok(RemoteManifest {
                media_type: media_type.clone(),
                digest: Some(Digest::sha256(payload)),
                payload: payload.clone(),
            })
        }

        async fn blob_reader(&self, _image: &str, digest: &Digest) -> Result<RemoteBlob, RemoteError> {
            self.blob_calls.fetch_add(1, Ordering::SeqCst);
            let data = self
                .blobs
                .lock()
                .get(digest)
                .cloned()
                .ok_or_else(|| RemoteError::NotFound(digest.to_string()))?;
            Ok(RemoteBlob {
                size: Some(data.len() as u64),
                reader: Box::new(std::io::Cursor::new(data)),
            })
        }

        async fn list_tags(&self, _image: &str) -> Result<Vec<String>, RemoteError> {
            Err(RemoteError::Status {
                status: http::StatusCode::BAD_GATEWAY,
                message: "down".into(),
            })
        }
    }

    async fn proxy() -> (ProxyController, Arc<FakeRemote>, RegistryInfo) {
        let (local, _) = crate::local::tests::local(false).await;
        local
            .create_registry("acme", "hub", RegistryKind::Upstream)
            .await
            .unwrap();

        let remote = Arc::new(FakeRemote::default());
        let mut upstreams: HashMap<String, Arc<dyn RemoteRegistry>> = HashMap::new();
        upstreams.insert("acme/hub".into(), remote.clone());
        let settings = ProxySettings {
            manifest_attempts: 3,
            list_attempts: 3,
            retry_interval: Duration::from_millis(5),
            tag_attempts: 3,
            tag_interval: Duration::from_millis(5),
            ..ProxySettings::default()
        };
        let proxy = ProxyController::new(local, upstreams, CacheHandlers::default(), settings);
        (proxy, remote, RegistryInfo::new("acme", "hub", "library/app").unwrap())
    }

    fn accept_all() -> ManifestRequest {
        ManifestRequest {
            accept: vec![MEDIA_TYPE_SCHEMA2.into(), MEDIA_TYPE_OCI_MANIFEST.into(), MEDIA_TYPE_OCI_INDEX.into()],
            if_none_match: None,
        }
    }

    async fn read_body(response: BlobResponse) -> Vec<u8> {
        let mut body = Vec::new();
        response.body.unwrap().read_to_end(&mut body).await.unwrap();
        body
    }

    /// Publish an image upstream and pull its blobs through the proxy.
    async fn image(
        proxy: &ProxyController,
        remote: &FakeRemote,
        info: &RegistryInfo,
        tag: &str,
        build: &str,
    ) -> (Vec<u8>, Digest) {
        let config = format!("config for {build}").into_bytes();
        let layer = format!("layer for {build}").into_bytes();
        for blob in [&config, &layer] {
            let digest = remote.put_blob(blob);
            assert_eq!(read_body(proxy.get_blob(info, &digest).await.unwrap()).await, *blob);
        }
        proxy.tasks().wait_idle().await;

        let payload = image_manifest(MEDIA_TYPE_SCHEMA2, &config, &[&layer]);
        let digest = remote.put_manifest(&[tag], MEDIA_TYPE_SCHEMA2, &payload);
        (payload, digest)
    }

    #[tokio::test]
    async fn proxied_blob_is_cached() {
        let (proxy, remote, info) = proxy().await;
        let data = vec![7u8; CACHE_CHUNK_SIZE + 10];
        let digest = remote.put_blob(&data);

        let first = proxy.get_blob(&info, &digest).await.unwrap();
        assert_eq!(first.size, Some(data.len() as u64));
        assert_eq!(read_body(first).await, data);
        proxy.tasks().wait_idle().await;

        let second = proxy.get_blob(&info, &digest).await.unwrap();
        assert_eq!(read_body(second).await, data);
        assert_eq!(remote.blob_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn blob_caching_survives_client_hangup() {
        let (proxy, remote, info) = proxy().await;
        let data = vec![3u8; 3 * CACHE_CHUNK_SIZE];
        let digest = remote.put_blob(&data);

        drop(proxy.get_blob(&info, &digest).await.unwrap());
        proxy.tasks().wait_idle().await;

        let cached = proxy.local().get_blob(&info, &digest).await.unwrap();
        assert_eq!(read_body(cached).await, data);
    }

    #[tokio::test]
    async fn unknown_upstream_blob() {
        let (proxy, _, info) = proxy().await;
        let err = proxy.get_blob(&info, &Digest::sha256(b"nope")).await.unwrap_err();
        assert!(matches!(err, RegistryError::BlobUnknown(_)));
    }

    #[tokio::test]
    async fn manifest_is_fetched_once() {
        let (proxy, remote, info) = proxy().await;
        let (payload, digest) = image(&proxy, &remote, &info, "latest", "one").await;

        let tagged = info.clone().with_reference("latest").unwrap();
        let response = proxy.get_manifest(&tagged, &accept_all()).await.unwrap();
        assert_eq!(response.payload, payload);
        assert_eq!(response.digest, digest);
        proxy.tasks().wait_idle().await;

        let by_digest = info.clone().with_digest(digest.clone());
        let again = proxy.get_manifest(&by_digest, &accept_all()).await.unwrap();
        assert_eq!(again.payload, payload);
        let retagged = proxy.get_manifest(&tagged, &accept_all()).await.unwrap();
        assert_eq!(retagged.digest, digest);
        assert_eq!(remote.manifest_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_tag_is_refetched() {
        let (proxy, remote, info) = proxy().await;
        let tagged = info.clone().with_reference("latest").unwrap();
        image(&proxy, &remote, &info, "latest", "one").await;
        proxy.get_manifest(&tagged, &accept_all()).await.unwrap();
        proxy.tasks().wait_idle().await;

        let (payload, digest) = image(&proxy, &remote, &info, "latest", "two").await;
        let response = proxy.get_manifest(&tagged, &accept_all()).await.unwrap();
        assert_eq!(response.payload, payload);
        assert_eq!(response.digest, digest);
        assert_eq!(remote.manifest_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rate_limited_check_serves_cache() {
        let (proxy, remote, info) = proxy().await;
        let tagged = info.clone().with_reference("latest").unwrap();
        let (payload, _) = image(&proxy, &remote, &info, "latest", "one").await;
        proxy.get_manifest(&tagged, &accept_all()).await.unwrap();
        proxy.tasks().wait_idle().await;

        *remote.head_status.lock() = Some(http::StatusCode::TOO_MANY_REQUESTS);
        let response = proxy.get_manifest(&tagged, &accept_all()).await.unwrap();
        assert_eq!(response.payload, payload);
        assert_eq!(remote.manifest_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refused_check_is_an_error() {
        let (proxy, remote, info) = proxy().await;
        let tagged = info.clone().with_reference("latest").unwrap();
        image(&proxy, &remote, &info, "latest", "one").await;
        proxy.get_manifest(&tagged, &accept_all()).await.unwrap();
        proxy.tasks().wait_idle().await;

        *remote.head_status.lock() = Some(http::StatusCode::UNAUTHORIZED);
        let err = proxy.get_manifest(&tagged, &accept_all()).await.unwrap_err();
        assert!(matches!(err, RegistryError::Remote(RemoteError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn digest_gone_upstream_is_removed() {
        let (proxy, remote, info) = proxy().await;
        let (_, digest) = image(&proxy, &remote, &info, "v1", "one").await;
        let by_digest = info.clone().with_digest(digest.clone());
        proxy.get_manifest(&by_digest, &accept_all()).await.unwrap();
        proxy.tasks().wait_idle().await;
        assert!(proxy.local().resolve_manifest(&by_digest).await.is_ok());

        remote.manifests.lock().remove(&digest.to_string());
        let err = proxy.get_manifest(&by_digest, &accept_all()).await.unwrap_err();
        assert!(matches!(err, RegistryError::ManifestUnknown(_)));
        proxy.tasks().wait_idle().await;

        let err = proxy.local().resolve_manifest(&by_digest).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn tag_gone_upstream_is_removed() {
        let (proxy, remote, info) = proxy().await;
        let tagged = info.clone().with_reference("latest").unwrap();
        image(&proxy, &remote, &info, "latest", "one").await;
        proxy.get_manifest(&tagged, &accept_all()).await.unwrap();
        proxy.tasks().wait_idle().await;

        remote.manifests.lock().remove("latest");
        let err = proxy.get_manifest(&tagged, &accept_all()).await.unwrap_err();
        assert!(matches!(err, RegistryError::ManifestUnknown(_)));
        proxy.tasks().wait_idle().await;

        let err = proxy.local().resolve_manifest(&tagged).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn head_by_tag_tags_cached_manifest() {
        let (proxy, remote, info) = proxy().await;
        let (_, digest) = image(&proxy, &remote, &info, "v1", "one").await;
        let by_digest = info.clone().with_digest(digest.clone());
        proxy.get_manifest(&by_digest, &accept_all()).await.unwrap();
        proxy.tasks().wait_idle().await;

        let tagged = info.clone().with_reference("v1").unwrap();
        let head = proxy.head_manifest(&tagged, &accept_all()).await.unwrap();
        assert!(head.head);
        assert_eq!(head.digest, digest);
        proxy.tasks().wait_idle().await;

        let row = proxy.local().resolve_manifest(&tagged).await.unwrap();
        assert_eq!(row.digest, digest);
    }

    #[tokio::test]
    async fn list_is_cached_before_its_children() {
        let (proxy, remote, info) = proxy().await;
        let payload = list_manifest(MEDIA_TYPE_OCI_INDEX, &[(b"child", "amd64", "linux")]);
        let digest = remote.put_manifest(&["multi"], MEDIA_TYPE_OCI_INDEX, &payload);

        let tagged = info.clone().with_reference("multi").unwrap();
        let response = proxy.get_manifest(&tagged, &accept_all()).await.unwrap();
        assert_eq!(response.digest, digest);
        proxy.tasks().wait_idle().await;

        let row = proxy.local().resolve_manifest(&tagged).await.unwrap();
        assert_eq!(row.digest, digest);
    }

    #[tokio::test]
    async fn tags_fall_back_to_cache() {
        let (proxy, remote, info) = proxy().await;
        let tagged = info.clone().with_reference("latest").unwrap();
        image(&proxy, &remote, &info, "latest", "one").await;
        proxy.get_manifest(&tagged, &accept_all()).await.unwrap();
        proxy.tasks().wait_idle().await;

        let tags = proxy.list_tags(&info, None, None).await.unwrap();
        assert_eq!(tags.list().tags, vec!["latest".to_owned()]);
    }

    #[test]
    fn location_is_parsed() {
        let mut headers = ResponseHeaders::default();
        headers.insert(header::LOCATION, "/v2/acme/hub/app/blobs/uploads/abc?_state=dG9rZW4=");
        let (uuid, token) = upload_location(&headers).unwrap();
        assert_eq!(uuid, "abc");
        assert_eq!(token, "dG9rZW4=");
    }
}
