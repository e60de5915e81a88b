use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use crate::local::LocalDriver;
use storage_driver::{Driver, Metadata, Reader, StorageError, Writer};

/// Scratch storage: a [`LocalDriver`] in a fresh temporary directory which is
/// deleted, with everything stored in it, when the driver is dropped.
#[derive(Debug)]
pub struct TempDriver {
    inner: LocalDriver,
    root: Utf8PathBuf,
    _dir: TempDir,
}

impl TempDriver {
    /// Create the temporary directory.
    pub fn new() -> io::Result<Self> {
        let dir = TempDir::new()?;
        let root = Utf8PathBuf::from_path_buf(dir.path().to_owned())
            .map_err(|path| io::Error::new(io::ErrorKind::InvalidData, format!("{} is not utf-8", path.display())))?;
        tracing::debug!(%root, "scratch storage");

        Ok(Self {
            inner: LocalDriver::new(root.clone()),
            root,
            _dir: dir,
        })
    }

    /// Where objects are written.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }
}

#[async_trait::async_trait]
impl Driver for TempDriver {
    fn name(&self) -> &'static str {
        "temp"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.inner.metadata(bucket, remote).await
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.inner.delete(bucket, remote).await
    }

    async fn upload(&self, bucket: &str, remote: &Utf8Path, local: &mut Reader<'_>) -> Result<(), StorageError> {
        self.inner.upload(bucket, remote, local).await
    }

    async fn download(&self, bucket: &str, remote: &Utf8Path, local: &mut Writer<'_>) -> Result<(), StorageError> {
        self.inner.download(bucket, remote, local).await
    }

    async fn list(&self, bucket: &str, prefix: Option<&Utf8Path>) -> Result<Vec<String>, StorageError> {
        self.inner.list(bucket, prefix).await
    }

    async fn append(&self, bucket: &str, remote: &Utf8Path, local: &mut Reader<'_>) -> Result<u64, StorageError> {
        self.inner.append(bucket, remote, local).await
    }

    async fn rename(&self, bucket: &str, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        self.inner.rename(bucket, from, to).await
    }
}
