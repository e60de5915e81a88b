//! Blob reads, deletes and the chunked upload protocol.

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tokio::io::AsyncBufRead;
use tokio_util::io::ReaderStream;

use super::LocalRegistry;
use crate::blobstore::{BlobReader, BlobUpload};
use crate::db::RegistryRow;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::gc::{ReviewEvent, lock_timeout};
use crate::headers::{DOCKER_CONTENT_DIGEST, DOCKER_UPLOAD_UUID, ResponseHeaders};
use crate::info::RegistryInfo;
use crate::upload::BlobUploadState;

const OCTET_STREAM: &str = "application/octet-stream";

/// Blob bytes with their headers. `body` is `None` for `HEAD`.
pub struct BlobResponse {
    /// Blob digest.
    pub digest: Digest,
    /// Blob size, when known.
    pub size: Option<u64>,
    /// Blob bytes.
    pub body: Option<BlobReader>,
}

impl std::fmt::Debug for BlobResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobResponse")
            .field("digest", &self.digest)
            .field("size", &self.size)
            .field("streaming", &self.body.is_some())
            .finish()
    }
}

impl IntoResponse for BlobResponse {
    fn into_response(self) -> Response {
        let mut headers = ResponseHeaders::new(StatusCode::OK);
        headers
            .insert(header::CONTENT_TYPE, OCTET_STREAM)
            .insert(DOCKER_CONTENT_DIGEST, &self.digest)
            .insert(header::ETAG, format!("\"{}\"", self.digest));
        if let Some(size) = self.size {
            headers.insert(header::CONTENT_LENGTH, size);
        }

        let body = match self.body {
            Some(reader) => Body::from_stream(ReaderStream::new(reader)),
            None => Body::empty(),
        };
        headers.with_body(body)
    }
}

/// Request headers which describe an upload chunk.
#[derive(Debug, Clone, Default)]
pub struct ChunkHeaders {
    /// `Content-Type`
    pub content_type: Option<String>,
    /// `Content-Range`, as `<start>-<end>`.
    pub content_range: Option<String>,
    /// `Content-Length`
    pub content_length: Option<u64>,
}

impl ChunkHeaders {
    /// Check the headers against the upload's current offset.
    fn validate(&self, offset: u64) -> RegistryResult<()> {
        if let Some(content_type) = self.content_type.as_deref() {
            if !content_type.is_empty() && content_type != OCTET_STREAM {
                return Err(RegistryError::BlobUploadInvalid(format!(
                    "chunks must be {OCTET_STREAM}, got {content_type}"
                )));
            }
        }

        let Some(range) = self.content_range.as_deref() else {
            return Ok(());
        };
        let (start, end) = parse_range(range)?;
        if start != offset {
            return Err(RegistryError::RangeInvalid(format!(
                "chunk starts at {start}, upload is at {offset}"
            )));
        }
        let expected = end - start + 1;
        if let Some(length) = self.content_length {
            if length != expected {
                return Err(RegistryError::SizeInvalid(format!(
                    "content length {length} does not cover range {range}"
                )));
            }
        }
        Ok(())
    }

    fn expected_length(&self) -> Option<u64> {
        self.content_range
            .as_deref()
            .and_then(|range| parse_range(range).ok())
            .map(|(start, end)| end - start + 1)
            .or(self.content_length)
    }
}

fn parse_range(range: &str) -> RegistryResult<(u64, u64)> {
    let invalid = || RegistryError::RangeInvalid(range.to_owned());
    let range = range.trim().trim_start_matches("bytes=");
    let (start, end) = range.split_once('-').ok_or_else(invalid)?;
    let start: u64 = start.trim().parse().map_err(|_| invalid())?;
    let end: u64 = end.trim().parse().map_err(|_| invalid())?;
    if start > end {
        return Err(invalid());
    }
    Ok((start, end))
}

/// `?mount=<digest>&from=<name>`
#[derive(Debug, Clone)]
pub struct Mount {
    /// Blob to mount.
    pub digest: Digest,
    /// Repository to mount from.
    pub from: String,
}

impl LocalRegistry {
    async fn lookup_blob(
        &self,
        info: &RegistryInfo,
        digest: &Digest,
    ) -> RegistryResult<RegistryRow> {
        let registry = self.registry(info).await?;
        let blob = self
            .manifests
            .find_repository_blob(&registry, &info.image, digest)
            .await
            .ok_or_else(|| RegistryError::BlobUnknown(digest.clone()))?;

        let settings = self.gc.settings();
        let lease = lock_timeout(
            settings.blob_exists_lock_timeout,
            "blob",
            self.gc
                .blob_find_and_lock_before(&registry.root, blob.id, self.gc.review_horizon()),
        )
        .await?;
        if let Some(lease) = lease {
            self.gc.blob_reschedule(&lease, settings.blob_reschedule);
        }
        Ok(registry)
    }

    /// `HEAD /v2/<name>/blobs/<digest>`
    #[tracing::instrument(skip(self), fields(repository = %info.repository()))]
    pub async fn head_blob(&self, info: &RegistryInfo, digest: &Digest) -> RegistryResult<BlobResponse> {
        let registry = self.lookup_blob(info, digest).await?;
        let size = self.blobs.stat(&registry.root, digest).await?;
        Ok(BlobResponse {
            digest: digest.clone(),
            size: Some(size),
            body: None,
        })
    }

    /// `GET /v2/<name>/blobs/<digest>`
    #[tracing::instrument(skip(self), fields(repository = %info.repository()))]
    pub async fn get_blob(&self, info: &RegistryInfo, digest: &Digest) -> RegistryResult<BlobResponse> {
        let registry = self.lookup_blob(info, digest).await?;
        let (size, reader) = self.blobs.open(&registry.root, digest).await?;
        Ok(BlobResponse {
            digest: digest.clone(),
            size: Some(size),
            body: Some(reader),
        })
    }

    /// `DELETE /v2/<name>/blobs/<digest>`: unlinks the blob from the repository.
    #[tracing::instrument(skip(self), fields(repository = %info.repository()))]
    pub async fn delete_blob(&self, info: &RegistryInfo, digest: &Digest) -> RegistryResult<ResponseHeaders> {
        if !self.settings.delete_enabled {
            return Err(RegistryError::Unsupported("blob deletes are disabled"));
        }
        let registry = self.registry(info).await?;

        let mut tx = self.db.begin().await;
        let blob = tx
            .find_repository_blob(registry.id, &info.image, digest)
            .map(|blob| blob.id)
            .ok_or_else(|| RegistryError::BlobUnknown(digest.clone()))?;
        tx.unlink_blob(registry.id, &info.image, blob);
        tx.commit().await?;

        self.gc
            .schedule_blob(&registry.root, blob, ReviewEvent::BlobUnlinked);
        Ok(ResponseHeaders::new(StatusCode::ACCEPTED))
    }

    fn upload_headers(
        &self,
        info: &RegistryInfo,
        upload: &BlobUpload,
        status: StatusCode,
    ) -> RegistryResult<ResponseHeaders> {
        let state = BlobUploadState {
            path: info.repository(),
            uuid: upload.id().to_owned(),
            offset: upload.size(),
        };
        let token = self.tokens.pack(&state)?;

        let mut headers = ResponseHeaders::new(status);
        headers
            .insert(
                header::LOCATION,
                format!(
                    "/v2/{}/blobs/uploads/{}?_state={token}",
                    state.path, state.uuid
                ),
            )
            .insert(DOCKER_UPLOAD_UUID, &state.uuid)
            .insert(header::RANGE, format!("0-{}", state.offset.saturating_sub(1)))
            .insert(header::CONTENT_LENGTH, 0);
        Ok(headers)
    }

    fn committed_headers(info: &RegistryInfo, digest: &Digest) -> ResponseHeaders {
        let mut headers = ResponseHeaders::new(StatusCode::CREATED);
        headers
            .insert(
                header::LOCATION,
                format!("/v2/{}/blobs/{digest}", info.repository()),
            )
            .insert(DOCKER_CONTENT_DIGEST, digest)
            .insert(header::CONTENT_LENGTH, 0);
        headers
    }

    /// Reopen an upload from the client's state token.
    ///
    /// The token is verified before anything in it is used; then the stored
    /// upload must match its repository, id and offset exactly.
    async fn resume(
        &self,
        info: &RegistryInfo,
        uuid: &str,
        token: &str,
    ) -> RegistryResult<BlobUpload> {
        let state = self.tokens.unpack(token)?;
        if state.path != info.repository() {
            return Err(RegistryError::BlobUploadInvalid(format!(
                "upload belongs to {}",
                state.path
            )));
        }
        if state.uuid != uuid {
            return Err(RegistryError::BlobUploadInvalid(format!(
                "upload state is for {}",
                state.uuid
            )));
        }

        let upload = self.blobs.resume(&info.root, uuid).await?;
        if upload.size() != state.offset {
            return Err(RegistryError::RangeInvalid(format!(
                "upload is at {}, state says {}",
                upload.size(),
                state.offset
            )));
        }
        Ok(upload)
    }

    async fn mount_blob(
        &self,
        registry: &RegistryRow,
        info: &RegistryInfo,
        mount: &Mount,
    ) -> RegistryResult<bool> {
        let Ok(source) = RegistryInfo::from_name(&mount.from) else {
            return Ok(false);
        };
        if source.root != info.root {
            return Ok(false);
        }

        let mut tx = self.db.begin().await;
        let Some(source_registry) = tx.registry(&source.root, &source.registry).map(|r| r.id) else {
            return Ok(false);
        };
        let Some(blob) = tx
            .find_repository_blob(source_registry, &source.image, &mount.digest)
            .map(|b| b.id)
        else {
            return Ok(false);
        };
        tx.link_blob(registry.id, &info.image, blob);
        tx.upsert_image(registry.id, &info.image);
        tx.commit().await?;
        tracing::debug!(digest = %mount.digest, from = %mount.from, "mounted blob");
        Ok(true)
    }

    async fn commit_upload(
        &self,
        registry: &RegistryRow,
        info: &RegistryInfo,
        upload: BlobUpload,
        digest: &Digest,
    ) -> RegistryResult<ResponseHeaders> {
        // Held until the row exists, so a collector cannot delete the bytes in between.
        let _bytes = self.gc.blob_bytes_lock(&registry.root, digest).await;
        let size = match upload.commit(digest).await {
            Ok(size) => size,
            Err(error) => {
                if let Err(cancel) = upload.cancel().await {
                    tracing::warn!(%cancel, "failed to cancel blob upload");
                }
                return Err(error);
            }
        };

        let mut tx = self.db.begin().await;
        let blob = tx.create_or_find_blob(&registry.root, digest, size);
        tx.link_blob(registry.id, &info.image, blob);
        tx.upsert_image(registry.id, &info.image);
        tx.commit().await?;

        self.gc
            .schedule_blob(&registry.root, blob, ReviewEvent::BlobUploaded);
        tracing::debug!(%digest, size, "committed blob");
        Ok(Self::committed_headers(info, digest))
    }

    /// `POST /v2/<name>/blobs/uploads/`
    ///
    /// Mounts `mount` if the source repository has it, stores `body` at once if
    /// `digest` is given, and otherwise opens an upload session.
    #[tracing::instrument(skip(self, body), fields(repository = %info.repository()))]
    pub async fn init_blob_upload<R>(
        &self,
        info: &RegistryInfo,
        mount: Option<Mount>,
        digest: Option<Digest>,
        body: &mut R,
    ) -> RegistryResult<ResponseHeaders>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let registry = self.registry(info).await?;

        if let Some(mount) = &mount {
            if self.mount_blob(&registry, info, mount).await? {
                return Ok(Self::committed_headers(info, &mount.digest));
            }
            tracing::debug!(digest = %mount.digest, "mount source not found, starting an upload");
        }

        let mut upload = self.blobs.create(&info.root).await?;
        match digest {
            Some(digest) => {
                if let Err(error) = upload.write(body).await {
                    if let Err(cancel) = upload.cancel().await {
                        tracing::warn!(%cancel, "failed to cancel blob upload");
                    }
                    return Err(error);
                }
                self.commit_upload(&registry, info, upload, &digest).await
            }
            None => self.upload_headers(info, &upload, StatusCode::ACCEPTED),
        }
    }

    /// `GET /v2/<name>/blobs/uploads/<uuid>`
    pub async fn get_blob_upload_status(
        &self,
        info: &RegistryInfo,
        uuid: &str,
        token: &str,
    ) -> RegistryResult<ResponseHeaders> {
        let upload = self.resume(info, uuid, token).await?;
        self.upload_headers(info, &upload, StatusCode::NO_CONTENT)
    }

    async fn write_chunk<R>(
        &self,
        upload: &mut BlobUpload,
        chunk: &ChunkHeaders,
        body: &mut R,
    ) -> RegistryResult<()>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        chunk.validate(upload.size())?;
        match chunk.expected_length() {
            Some(expected) => upload.write_exact(body, expected).await?,
            None => upload.write(body).await?,
        };
        Ok(())
    }

    /// `PATCH /v2/<name>/blobs/uploads/<uuid>`
    #[tracing::instrument(skip(self, token, chunk, body), fields(repository = %info.repository()))]
    pub async fn push_blob_chunk<R>(
        &self,
        info: &RegistryInfo,
        uuid: &str,
        token: &str,
        chunk: &ChunkHeaders,
        body: &mut R,
    ) -> RegistryResult<ResponseHeaders>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut upload = self.resume(info, uuid, token).await?;
        self.write_chunk(&mut upload, chunk, body).await?;
        self.upload_headers(info, &upload, StatusCode::ACCEPTED)
    }

    /// `PUT /v2/<name>/blobs/uploads/<uuid>?digest=<digest>`, with an optional final chunk.
    #[tracing::instrument(skip(self, token, chunk, body), fields(repository = %info.repository()))]
    pub async fn push_blob<R>(
        &self,
        info: &RegistryInfo,
        uuid: &str,
        token: &str,
        digest: Option<Digest>,
        chunk: &ChunkHeaders,
        body: &mut R,
    ) -> RegistryResult<ResponseHeaders>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut upload = self.resume(info, uuid, token).await?;
        let registry = self.registry(info).await?;
        let Some(digest) = digest else {
            return Err(RegistryError::DigestInvalid("digest parameter is required".into()));
        };

        if let Err(error) = self.write_chunk(&mut upload, chunk, body).await {
            if let Err(cancel) = upload.cancel().await {
                tracing::warn!(%cancel, "failed to cancel blob upload");
            }
            return Err(error);
        }
        self.commit_upload(&registry, info, upload, &digest).await
    }

    /// `DELETE /v2/<name>/blobs/uploads/<uuid>`
    pub async fn cancel_blob_upload(
        &self,
        info: &RegistryInfo,
        uuid: &str,
        token: &str,
    ) -> RegistryResult<ResponseHeaders> {
        let upload = self.resume(info, uuid, token).await?;
        upload.cancel().await?;
        Ok(ResponseHeaders::new(StatusCode::NO_CONTENT))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{local, push_blob};
    use super::*;
    use tokio::io::AsyncReadExt as _;

    fn location_state(headers: &ResponseHeaders) -> (String, String) {
        let location = headers.get(&header::LOCATION).unwrap();
        let url = url::Url::parse("http://registry.test").unwrap().join(location).unwrap();
        let uuid = url.path_segments().unwrap().next_back().unwrap().to_owned();
        let state = url
            .query_pairs()
            .find(|(k, _)| k == "_state")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        (uuid, state)
    }

    fn range(start: u64, end: u64) -> ChunkHeaders {
        ChunkHeaders {
            content_type: Some(OCTET_STREAM.into()),
            content_range: Some(format!("{start}-{end}")),
            content_length: Some(end - start + 1),
        }
    }

    async fn read_blob(local: &LocalRegistry, info: &RegistryInfo, digest: &Digest) -> Vec<u8> {
        let mut body = Vec::new();
        local
            .get_blob(info, digest)
            .await
            .unwrap()
            .body
            .unwrap()
            .read_to_end(&mut body)
            .await
            .unwrap();
        body
    }

    #[test]
    fn ranges() {
        assert_eq!(parse_range("0-99").unwrap(), (0, 99));
        assert_eq!(parse_range("bytes=5-5").unwrap(), (5, 5));
        assert!(matches!(parse_range("9-3"), Err(RegistryError::RangeInvalid(_))));
        assert!(matches!(parse_range("x"), Err(RegistryError::RangeInvalid(_))));
    }

    #[test]
    fn chunk_headers_must_agree() {
        assert!(range(0, 9).validate(0).is_ok());
        assert!(matches!(range(10, 19).validate(0), Err(RegistryError::RangeInvalid(_))));

        let mut short = range(0, 9);
        short.content_length = Some(5);
        assert!(matches!(short.validate(0), Err(RegistryError::SizeInvalid(_))));

        let mut json = range(0, 9);
        json.content_type = Some("application/json".into());
        assert!(matches!(json.validate(0), Err(RegistryError::BlobUploadInvalid(_))));
    }

    #[tokio::test]
    async fn resumed_chunks_equal_one_write() {
        let (local, info) = local(false).await;
        let data: Vec<u8> = (0..200u8).collect();
        let digest = Digest::sha256(&data);

        let started = local
            .init_blob_upload(&info, None, None, &mut tokio::io::empty())
            .await
            .unwrap();
        assert_eq!(started.status, StatusCode::ACCEPTED);
        assert_eq!(started.get(&header::RANGE), Some("0-0"));
        let (uuid, state) = location_state(&started);

        let first = local
            .push_blob_chunk(&info, &uuid, &state, &range(0, 99), &mut &data[..100])
            .await
            .unwrap();
        assert_eq!(first.get(&header::RANGE), Some("0-99"));
        let (_, state) = location_state(&first);

        let second = local
            .push_blob_chunk(&info, &uuid, &state, &range(100, 199), &mut &data[100..])
            .await
            .unwrap();
        let (_, state) = location_state(&second);

        let done = local
            .push_blob(&info, &uuid, &state, Some(digest.clone()), &ChunkHeaders::default(), &mut tokio::io::empty())
            .await
            .unwrap();
        assert_eq!(done.status, StatusCode::CREATED);
        assert_eq!(read_blob(&local, &info, &digest).await, data);
    }

    #[tokio::test]
    async fn short_chunk_leaves_upload_resumable() {
        let (local, info) = local(false).await;
        let data = b"0123456789";
        let started = local
            .init_blob_upload(&info, None, None, &mut tokio::io::empty())
            .await
            .unwrap();
        let (uuid, state) = location_state(&started);

        let mut short = range(0, 9);
        short.content_length = None;
        let err = local
            .push_blob_chunk(&info, &uuid, &state, &short, &mut &data[..5])
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::SizeInvalid(_)));

        let status = local.get_blob_upload_status(&info, &uuid, &state).await.unwrap();
        assert_eq!(status.get(&header::RANGE), Some("0-0"));

        let long = local
            .push_blob_chunk(&info, &uuid, &state, &short, &mut &b"0123456789abc"[..])
            .await
            .unwrap_err();
        assert!(matches!(long, RegistryError::SizeInvalid(_)));

        let retried = local
            .push_blob_chunk(&info, &uuid, &state, &range(0, 9), &mut &data[..])
            .await
            .unwrap();
        assert_eq!(retried.get(&header::RANGE), Some("0-9"));
        let (_, state) = location_state(&retried);

        let digest = Digest::sha256(data);
        local
            .push_blob(&info, &uuid, &state, Some(digest.clone()), &ChunkHeaders::default(), &mut tokio::io::empty())
            .await
            .unwrap();
        assert_eq!(read_blob(&local, &info, &digest).await, data);
    }

    #[tokio::test]
    async fn stale_or_foreign_state_is_rejected() {
        let (local, info) = local(false).await;
        let started = local
            .init_blob_upload(&info, None, None, &mut tokio::io::empty())
            .await
            .unwrap();
        let (uuid, initial) = location_state(&started);

        local
            .push_blob_chunk(&info, &uuid, &initial, &range(0, 3), &mut &b"abcd"[..])
            .await
            .unwrap();

        // Replaying the first token: offset no longer matches.
        let err = local
            .push_blob_chunk(&info, &uuid, &initial, &range(0, 3), &mut &b"abcd"[..])
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::RangeInvalid(_)));

        let other = RegistryInfo::new("acme", "docker", "other").unwrap();
        let err = local
            .get_blob_upload_status(&other, &uuid, &initial)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::BlobUploadInvalid(_)));

        let err = local
            .get_blob_upload_status(&info, "another-upload", &initial)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::BlobUploadInvalid(_)));

        let mut tampered = initial.into_bytes();
        tampered[4] = if tampered[4] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).unwrap();
        let err = local
            .push_blob_chunk(&info, &uuid, &tampered, &range(4, 7), &mut &b"efgh"[..])
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::BlobUploadInvalid(_)));
    }

    #[tokio::test]
    async fn wrong_digest_cancels_upload() {
        let (local, info) = local(false).await;
        let started = local
            .init_blob_upload(&info, None, None, &mut tokio::io::empty())
            .await
            .unwrap();
        let (uuid, state) = location_state(&started);

        let err = local
            .push_blob(&info, &uuid, &state, Some(Digest::sha256(b"other")), &ChunkHeaders::default(), &mut &b"data"[..])
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DigestInvalid(_)));

        let err = local.get_blob_upload_status(&info, &uuid, &state).await.unwrap_err();
        assert!(matches!(err, RegistryError::BlobUploadUnknown(_)));
    }

    #[tokio::test]
    async fn mount_links_or_falls_back() {
        let (local, info) = local(false).await;
        push_blob(&local, &info, b"shared").await;
        let digest = Digest::sha256(b"shared");

        let target = RegistryInfo::new("acme", "docker", "target").unwrap();
        let mounted = local
            .init_blob_upload(
                &target,
                Some(Mount { digest: digest.clone(), from: info.repository() }),
                None,
                &mut tokio::io::empty(),
            )
            .await
            .unwrap();
        assert_eq!(mounted.status, StatusCode::CREATED);
        assert_eq!(read_blob(&local, &target, &digest).await, b"shared");

        let fallback = local
            .init_blob_upload(
                &target,
                Some(Mount { digest: Digest::sha256(b"missing"), from: info.repository() }),
                None,
                &mut tokio::io::empty(),
            )
            .await
            .unwrap();
        assert_eq!(fallback.status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn delete_unlinks_only_when_enabled() {
        let (local, info) = local(false).await;
        push_blob(&local, &info, b"blob").await;
        let digest = Digest::sha256(b"blob");
        assert!(matches!(
            local.delete_blob(&info, &digest).await,
            Err(RegistryError::Unsupported(_))
        ));

        let (local, info) = super::super::tests::local(true).await;
        push_blob(&local, &info, b"blob").await;
        local.delete_blob(&info, &digest).await.unwrap();
        assert!(matches!(
            local.head_blob(&info, &digest).await,
            Err(RegistryError::BlobUnknown(_))
        ));
        // Bytes stay until the collector reviews the blob.
        assert_eq!(local.blobs().stat("acme", &digest).await.unwrap(), 4);
    }
}
