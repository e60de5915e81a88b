//! # Storage backends
//!
//! Object storage for registry content. A [`Storage`] wraps one [`Driver`];
//! the registry works through a [`StorageBucket`], which pins every call to a
//! single bucket and records the driver and bucket on each tracing span.

use std::sync::Arc;

use camino::Utf8Path;
#[cfg(feature = "local")]
use camino::Utf8PathBuf;
use serde::Deserialize;
use tokio::io;

#[cfg(feature = "local")]
pub(crate) mod local;

pub(crate) mod memory;
#[cfg(feature = "tmp")]
pub(crate) mod temp;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryStorage;

#[cfg(feature = "tmp")]
#[doc(inline)]
pub use temp::TempDriver;

#[doc(inline)]
pub use storage_driver::{Driver, Metadata, StorageError, StorageErrorKind};

/// Which backend to store objects in.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Keep everything in memory, lost on restart.
    Memory {
        /// The only bucket the backend serves.
        bucket: String,
    },

    /// Files below a local directory, one subdirectory per bucket.
    #[cfg(feature = "local")]
    Local {
        /// Root directory.
        path: Utf8PathBuf,
    },

    /// Files in a temporary directory, removed on shutdown.
    #[cfg(feature = "tmp")]
    Temp,
}

impl StorageConfig {
    /// Open the configured backend.
    #[tracing::instrument]
    pub async fn build(self) -> Result<Storage, StorageError> {
        let storage: Storage = match self {
            StorageConfig::Memory { bucket } => MemoryStorage::with_buckets(&[&bucket]).into(),
            #[cfg(feature = "local")]
            StorageConfig::Local { path } => LocalDriver::new(path).into(),
            #[cfg(feature = "tmp")]
            StorageConfig::Temp => TempDriver::new()
                .map_err(|err| StorageError::io("temp", err).context("create temp dir").build())?
                .into(),
        };
        tracing::debug!(driver = storage.name(), "storage ready");
        Ok(storage)
    }
}

type SharedDriver = Arc<dyn Driver + Send + Sync>;

/// A shared handle to a storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: SharedDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Share `driver`.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The driver's name, for logs.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// A handle scoped to a single bucket.
    pub fn bucket<S: Into<String>>(&self, bucket: S) -> StorageBucket {
        StorageBucket {
            driver: self.driver.clone(),
            bucket: bucket.into(),
        }
    }
}

/// A storage handle bound to one bucket.
#[derive(Debug, Clone)]
pub struct StorageBucket {
    bucket: String,
    driver: SharedDriver,
}

impl StorageBucket {
    /// The bucket this handle writes to.
    pub fn name(&self) -> &str {
        &self.bucket
    }

    /// Size and modification time of an object.
    #[tracing::instrument(level = "trace", skip(self), fields(driver = self.driver.name(), bucket = %self.bucket))]
    pub async fn metadata(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(&self.bucket, path).await
    }

    /// Copy an object into `writer`.
    #[tracing::instrument(level = "trace", skip(self, writer), fields(driver = self.driver.name(), bucket = %self.bucket))]
    pub async fn download<'d, W>(&'d self, path: &Utf8Path, writer: &mut W) -> Result<(), StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + Sync + 'd,
    {
        self.driver.download(&self.bucket, path, writer).await
    }

    /// Replace an object with everything `reader` yields.
    #[tracing::instrument(level = "trace", skip(self, reader), fields(driver = self.driver.name(), bucket = %self.bucket))]
    pub async fn upload<'d, R>(&'d self, path: &Utf8Path, reader: &mut R) -> Result<(), StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + 'd,
    {
        self.driver.upload(&self.bucket, path, reader).await
    }

    /// Append to an object, returning its new size.
    #[tracing::instrument(level = "trace", skip(self, reader), fields(driver = self.driver.name(), bucket = %self.bucket))]
    pub async fn append<'d, R>(&'d self, path: &Utf8Path, reader: &mut R) -> Result<u64, StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + 'd,
    {
        self.driver.append(&self.bucket, path, reader).await
    }

    /// Move an object, replacing any object at `to`.
    #[tracing::instrument(level = "trace", skip(self), fields(driver = self.driver.name(), bucket = %self.bucket))]
    pub async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        self.driver.rename(&self.bucket, from, to).await
    }

    /// Object paths below `prefix`.
    #[tracing::instrument(level = "trace", skip(self), fields(driver = self.driver.name(), bucket = %self.bucket))]
    pub async fn list(&self, prefix: Option<&Utf8Path>) -> Result<Vec<String>, StorageError> {
        self.driver.list(&self.bucket, prefix).await
    }

    /// Remove an object.
    #[tracing::instrument(level = "trace", skip(self), fields(driver = self.driver.name(), bucket = %self.bucket))]
    pub async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(&self.bucket, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buckets_share_a_driver() {
        let storage = Storage::new(MemoryStorage::with_buckets(&["blobs"]));
        let writer = storage.bucket("blobs");
        let reader = storage.bucket("blobs");
        assert_eq!(reader.name(), "blobs");

        writer
            .upload(Utf8Path::new("a/b"), &mut &b"layer"[..])
            .await
            .unwrap();
        let size = writer
            .append(Utf8Path::new("a/b"), &mut &b"!"[..])
            .await
            .unwrap();
        assert_eq!(size, 6);

        let mut out = Vec::new();
        reader.download(Utf8Path::new("a/b"), &mut out).await.unwrap();
        assert_eq!(out, b"layer!");
        assert_eq!(reader.list(Some(Utf8Path::new("a"))).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn memory_config_serves_its_bucket() {
        let config: StorageConfig =
            serde_json::from_str(r#"{"memory": {"bucket": "registry"}}"#).unwrap();
        let storage = config.build().await.unwrap();
        assert_eq!(storage.name(), "memory");

        let bucket = storage.bucket("registry");
        bucket
            .upload(Utf8Path::new("x"), &mut &b"1"[..])
            .await
            .unwrap();
        assert_eq!(bucket.metadata(Utf8Path::new("x")).await.unwrap().size, 1);
    }
}
