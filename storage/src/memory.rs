use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::RwLock,
};

use storage_driver::{not_found, Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

const ENGINE: &str = "memory";

#[derive(Debug)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Vec<u8>,
}

impl From<Vec<u8>> for MemoryFileItem {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

type Bucket = HashMap<Utf8PathBuf, MemoryFileItem>;

fn missing_bucket(bucket: &str) -> StorageError {
    StorageError::builder(
        ENGINE,
        StorageErrorKind::NotFound,
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("bucket not found: {bucket}"),
        ),
    )
    .bucket(bucket)
    .build()
}

fn io_error(err: std::io::Error, bucket: &str, remote: &Utf8Path) -> StorageError {
    StorageError::io(ENGINE, err)
        .bucket(bucket)
        .path(remote.as_str())
        .build()
}

/// Storage driver that keeps every object in memory.
///
/// Used for tests and for running a throwaway registry.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` instance, with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` instance, with the given buckets.
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let map = buckets
            .iter()
            .map(|bucket| (bucket.to_string(), Bucket::new()))
            .collect();

        Self {
            buckets: RwLock::new(map),
        }
    }

    /// Create a new bucket in the storage.
    pub async fn create_bucket(&self, bucket: String) {
        let mut buckets = self.buckets.write().await;
        buckets.entry(bucket).or_default();
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let buckets = self.buckets.read().await;
        let objects = buckets.get(bucket).ok_or_else(|| missing_bucket(bucket))?;
        objects
            .get(remote)
            .map(Metadata::from)
            .ok_or_else(|| not_found(ENGINE, bucket, remote))
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| missing_bucket(bucket))?;
        objects
            .remove(remote)
            .map(|_| ())
            .ok_or_else(|| not_found(ENGINE, bucket, remote))
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let mut buf = Vec::new();
        local
            .read_to_end(&mut buf)
            .await
            .map_err(|err| io_error(err, bucket, remote))?;

        let mut buckets = self.buckets.write().await;
        let objects = buckets.entry(bucket.to_string()).or_default();
        objects.insert(remote.to_owned(), buf.into());

        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        // Copy out so the lock is not held while the writer applies backpressure.
        let data = {
            let buckets = self.buckets.read().await;
            let objects = buckets.get(bucket).ok_or_else(|| missing_bucket(bucket))?;
            objects
                .get(remote)
                .ok_or_else(|| not_found(ENGINE, bucket, remote))?
                .data
                .clone()
        };

        local
            .write_all(&data)
            .await
            .map_err(|err| io_error(err, bucket, remote))?;
        local
            .flush()
            .await
            .map_err(|err| io_error(err, bucket, remote))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory bucket");

        let buckets = self.buckets.read().await;
        let objects = buckets.get(bucket).ok_or_else(|| missing_bucket(bucket))?;

        let mut paths: Vec<String> = objects
            .keys()
            .filter(|path| prefix.is_none_or(|prefix| path.starts_with(prefix)))
            .map(|path| path.to_string())
            .collect();
        paths.sort();

        Ok(paths)
    }

    async fn append(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        let mut chunk = Vec::new();
        local
            .read_to_end(&mut chunk)
            .await
            .map_err(|err| io_error(err, bucket, remote))?;

        let mut buckets = self.buckets.write().await;
        let objects = buckets.entry(bucket.to_string()).or_default();
        let item = objects
            .entry(remote.to_owned())
            .or_insert_with(|| Vec::new().into());
        item.data.extend_from_slice(&chunk);
        Ok(item.data.len() as u64)
    }

    async fn rename(&self, bucket: &str, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| missing_bucket(bucket))?;
        let item = objects
            .remove(from)
            .ok_or_else(|| not_found(ENGINE, bucket, from))?;
        objects.insert(to.to_owned(), item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_extends_and_reports_size() {
        let storage = MemoryStorage::with_buckets(&["b"]);
        let path = Utf8Path::new("uploads/1/data");

        let size = storage.append("b", path, &mut &b"hello "[..]).await.unwrap();
        assert_eq!(size, 6);
        let size = storage.append("b", path, &mut &b"world"[..]).await.unwrap();
        assert_eq!(size, 11);

        let mut out = Vec::new();
        storage.download("b", path, &mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn rename_moves_object() {
        let storage = MemoryStorage::with_buckets(&["b"]);
        let from = Utf8Path::new("a");
        let to = Utf8Path::new("nested/b");
        storage.upload("b", from, &mut &b"data"[..]).await.unwrap();

        storage.rename("b", from, to).await.unwrap();

        assert!(storage.metadata("b", from).await.unwrap_err().is_not_found());
        assert_eq!(storage.metadata("b", to).await.unwrap().size, 4);
    }

    #[tokio::test]
    async fn missing_bucket_is_not_found() {
        let storage = MemoryStorage::new();
        let err = storage
            .metadata("nope", Utf8Path::new("x"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.object(), Some("nope"));
    }
}
