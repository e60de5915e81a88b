use std::fmt;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tokio::io::{self, AsyncReadExt};

use crate::error::{StorageError, StorageErrorKind};

/// A reader stream for object contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + 'r;

/// A writer stream for object contents.
pub type Writer<'w> = dyn io::AsyncWrite + Unpin + Send + Sync + 'w;

/// Object metadata common to every driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the object in bytes.
    pub size: u64,

    /// When the object was created (or last replaced).
    pub created: DateTime<Utc>,
}

/// A storage driver, which provides the ability to interact with a storage backend.
///
/// Objects are addressed by a bucket name and a relative path within that bucket.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver, used in errors and tracing fields.
    fn name(&self) -> &'static str;

    /// Delete an object.
    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError>;

    /// Get the metadata for an object.
    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Create or replace an object with the contents of `reader`.
    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError>;

    /// Stream an object into `writer`.
    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError>;

    /// List the object paths in a bucket, optionally filtered by a prefix.
    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError>;

    /// Append the contents of `reader` to an object, creating it if necessary,
    /// and return the new object size.
    ///
    /// The default implementation rewrites the whole object, drivers which can
    /// append natively should override it.
    async fn append(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        let mut contents = Vec::new();
        match self.download(bucket, remote, &mut contents).await {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error),
        }

        reader.read_to_end(&mut contents).await.map_err(|err| {
            StorageError::io(self.name(), err)
                .bucket(bucket)
                .path(remote.as_str())
                .context("append: read chunk")
                .build()
        })?;

        let size = contents.len() as u64;
        self.upload(bucket, remote, &mut contents.as_slice()).await?;
        Ok(size)
    }

    /// Move an object to a new path, replacing anything already there.
    ///
    /// The default implementation copies and deletes.
    async fn rename(&self, bucket: &str, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        let mut contents = Vec::new();
        self.download(bucket, from, &mut contents).await?;
        self.upload(bucket, to, &mut contents.as_slice()).await?;
        self.delete(bucket, from).await
    }
}

/// Error for an object which does not exist.
pub fn not_found(engine: &'static str, bucket: &str, remote: &Utf8Path) -> StorageError {
    StorageError::builder(
        engine,
        StorageErrorKind::NotFound,
        std::io::Error::new(std::io::ErrorKind::NotFound, format!("object not found: {remote}")),
    )
    .bucket(bucket)
    .path(remote.as_str())
    .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(Driver);
}
