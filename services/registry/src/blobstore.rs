//! Content-addressed blob bytes on top of a storage bucket.
//!
//! Committed blobs live at `roots/<root>/blobs/<alg>/<xx>/<hex>/data`, where `xx`
//! is the first two hex characters of the digest. Uploads in progress live at
//! `roots/<root>/uploads/<id>/data` until they are committed or cancelled.

use camino::{Utf8Path, Utf8PathBuf};
use storage::{StorageBucket, StorageErrorKind};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt as _};
use tracing::Instrument as _;

use crate::digest::{Digest, DigestWriter};
use crate::error::{RegistryError, RegistryResult};

/// Stream of blob bytes handed to HTTP responses.
pub type BlobReader = Box<dyn AsyncRead + Unpin + Send>;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Blob storage shared by every registry of every root.
#[derive(Debug, Clone)]
pub struct BlobStore {
    bucket: StorageBucket,
}

/// Where a committed blob is stored.
pub fn blob_path(root: &str, digest: &Digest) -> Utf8PathBuf {
    let hex = digest.hex();
    Utf8PathBuf::from(format!(
        "roots/{root}/blobs/{}/{}/{hex}/data",
        digest.algorithm(),
        &hex[..2],
    ))
}

fn upload_path(root: &str, id: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("roots/{root}/uploads/{id}/data"))
}

impl BlobStore {
    /// Store blobs in `bucket`.
    pub fn new(bucket: StorageBucket) -> Self {
        Self { bucket }
    }

    /// Start a new, empty upload.
    #[tracing::instrument(skip(self))]
    pub async fn create(&self, root: &str) -> RegistryResult<BlobUpload> {
        let id = uuid::Uuid::new_v4().to_string();
        let path = upload_path(root, &id);
        self.bucket.upload(&path, &mut tokio::io::empty()).await?;
        tracing::debug!(%id, "created blob upload");

        Ok(BlobUpload {
            bucket: self.bucket.clone(),
            root: root.to_owned(),
            id,
            path,
            size: 0,
        })
    }

    /// Reopen an upload started earlier.
    #[tracing::instrument(skip(self))]
    pub async fn resume(&self, root: &str, id: &str) -> RegistryResult<BlobUpload> {
        let path = upload_path(root, id);
        let metadata = self.bucket.metadata(&path).await.map_err(|error| {
            if error.is_not_found() {
                RegistryError::BlobUploadUnknown(id.to_owned())
            } else {
                error.into()
            }
        })?;

        Ok(BlobUpload {
            bucket: self.bucket.clone(),
            root: root.to_owned(),
            id: id.to_owned(),
            path,
            size: metadata.size,
        })
    }

    /// Size of a committed blob.
    pub async fn stat(&self, root: &str, digest: &Digest) -> RegistryResult<u64> {
        match self.bucket.metadata(&blob_path(root, digest)).await {
            Ok(metadata) => Ok(metadata.size),
            Err(error) if error.is_not_found() => Err(RegistryError::BlobUnknown(digest.clone())),
            Err(error) => Err(error.into()),
        }
    }

    /// Stream a committed blob.
    ///
    /// The bytes are copied through a pipe by a background task, which stops
    /// as soon as the returned reader is dropped.
    pub async fn open(&self, root: &str, digest: &Digest) -> RegistryResult<(u64, BlobReader)> {
        let size = self.stat(root, digest).await?;
        let (reader, mut writer) = tokio::io::duplex(PIPE_CAPACITY);

        let bucket = self.bucket.clone();
        let path = blob_path(root, digest);
        let span = tracing::debug_span!("blob-download", %digest);
        tokio::spawn(
            async move {
                if let Err(error) = bucket.download(&path, &mut writer).await {
                    if error.kind() == StorageErrorKind::Io {
                        tracing::debug!(%error, "blob reader went away");
                    } else {
                        tracing::warn!(%error, "blob download failed");
                    }
                }
            }
            .instrument(span),
        );

        Ok((size, Box::new(reader)))
    }

    /// Remove a committed blob's bytes. Missing blobs are ignored.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, root: &str, digest: &Digest) -> RegistryResult<()> {
        match self.bucket.delete(&blob_path(root, digest)).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn exists(&self, path: &Utf8Path) -> RegistryResult<bool> {
        match self.bucket.metadata(path).await {
            Ok(_) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error.into()),
        }
    }
}

/// An upload in progress.
#[derive(Debug)]
pub struct BlobUpload {
    bucket: StorageBucket,
    root: String,
    id: String,
    path: Utf8PathBuf,
    size: u64,
}

impl BlobUpload {
    /// Upload id, also used as the client-visible upload UUID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bytes received so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Append bytes, returning how many were written.
    pub async fn write<R>(&mut self, reader: &mut R) -> RegistryResult<u64>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let size = self.bucket.append(&self.path, reader).await?;
        let written = size.saturating_sub(self.size);
        self.size = size;
        tracing::trace!(id = %self.id, written, size, "appended to blob upload");
        Ok(written)
    }

    /// Append exactly `expected` bytes.
    ///
    /// The chunk is staged next to the upload first, so a short or long body
    /// leaves the upload at its previous size.
    pub async fn write_exact<R>(&mut self, reader: &mut R, expected: u64) -> RegistryResult<u64>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let staging = self.path.with_file_name("chunk");
        self.bucket
            .upload(&staging, &mut reader.take(expected.saturating_add(1)))
            .await?;

        let received = self.bucket.metadata(&staging).await?.size;
        if received != expected {
            remove(&self.bucket, &staging).await?;
            return Err(RegistryError::SizeInvalid(format!(
                "received {received} bytes, expected {expected}"
            )));
        }

        let (pipe, mut sink) = tokio::io::duplex(PIPE_CAPACITY);
        let bucket = self.bucket.clone();
        let source = staging.clone();
        let mut pipe = tokio::io::BufReader::new(pipe);
        let (copied, written) = tokio::join!(
            async move { bucket.download(&source, &mut sink).await },
            self.write(&mut pipe),
        );
        copied?;
        let written = written?;
        remove(&self.bucket, &staging).await?;
        Ok(written)
    }

    /// Verify the upload against `expected` and move it into place.
    ///
    /// A mismatching upload is discarded. If the blob already exists the upload is
    /// dropped in favour of the stored copy.
    #[tracing::instrument(skip(self), fields(id = %self.id))]
    pub async fn commit(&self, expected: &Digest) -> RegistryResult<u64> {
        let mut hasher = DigestWriter::new(expected.algorithm());
        self.bucket.download(&self.path, &mut hasher).await?;
        let (actual, size) = hasher.finish();

        if &actual != expected {
            self.discard().await?;
            return Err(RegistryError::DigestInvalid(format!(
                "expected {expected}, uploaded content hashes to {actual}"
            )));
        }

        let store = BlobStore::new(self.bucket.clone());
        let target = blob_path(&self.root, expected);
        if store.exists(&target).await? {
            tracing::debug!(digest = %expected, "blob already stored");
            self.discard().await?;
        } else {
            self.bucket.rename(&self.path, &target).await?;
        }
        Ok(size)
    }

    async fn discard(&self) -> RegistryResult<()> {
        remove(&self.bucket, &self.path).await
    }

    /// Discard the upload.
    pub async fn cancel(self) -> RegistryResult<()> {
        self.discard().await
    }
}

async fn remove(bucket: &StorageBucket, path: &Utf8Path) -> RegistryResult<()> {
    match bucket.delete(path).await {
        Ok(()) => Ok(()),
        Err(error) if error.is_not_found() => Ok(()),
        Err(error) => Err(error.into()),
    }
}
