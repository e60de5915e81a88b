use camino::{Utf8Path, Utf8PathBuf};
use eyre::Context;
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

const ENGINE: &str = "local";

/// Stores objects as files below a root directory, at `<root>/<bucket>/b/<path>`.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn bucket_root(&self, bucket: &str) -> Utf8PathBuf {
        let mut path = self.root.join(bucket);
        path.push("b");
        path
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Utf8PathBuf {
        self.bucket_root(bucket).join(remote)
    }

    async fn create_parent(&self, bucket: &str, path: &Utf8Path) -> Result<(), StorageError> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        tokio::fs::create_dir_all(parent).await.map_err(|err| {
            StorageError::io(ENGINE, err)
                .bucket(bucket)
                .path(parent.as_str())
                .context("create parent directories")
                .build()
        })
    }
}

fn io_error(
    err: std::io::Error,
    bucket: &str,
    remote: &Utf8Path,
    context: &'static str,
) -> StorageError {
    StorageError::io(ENGINE, err)
        .bucket(bucket)
        .path(remote.as_str())
        .context(context)
        .build()
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(bucket, remote);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| io_error(err, bucket, remote, "metadata"))?;

        // Not every filesystem records creation time.
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(|err| io_error(err, bucket, remote, "timestamps"))?;

        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);
        tokio::fs::remove_file(path)
            .await
            .map_err(|err| io_error(err, bucket, remote, "remove file"))
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);
        self.create_parent(bucket, &path).await?;

        let mut writer = tokio::io::BufWriter::new(
            tokio::fs::File::create(&path)
                .await
                .map_err(|err| io_error(err, bucket, remote, "create file"))?,
        );

        tokio::io::copy_buf(local, &mut writer)
            .await
            .map_err(|err| io_error(err, bucket, remote, "write file"))?;

        writer
            .shutdown()
            .await
            .map_err(|err| io_error(err, bucket, remote, "flush file"))?;
        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .map_err(|err| io_error(err, bucket, remote, "open file"))?,
        );

        tokio::io::copy_buf(&mut reader, local)
            .await
            .map_err(|err| io_error(err, bucket, remote, "read file"))?;

        local
            .flush()
            .await
            .map_err(|err| io_error(err, bucket, remote, "flush writer"))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let root = self.bucket_root(bucket);
        let start = match prefix {
            Some(prefix) => root.join(prefix),
            None => root.clone(),
        };

        let items = tokio::task::spawn_blocking(move || collect_list(&root, &start))
            .in_current_span()
            .await
            .wrap_err("list task panicked")
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Other))?
            .map_err(|err| {
                StorageError::builder(ENGINE, StorageErrorKind::Io, err)
                    .bucket(bucket)
                    .context("list directory")
                    .build()
            })?;

        tracing::debug!("Found {} entries", items.len());
        Ok(items)
    }

    async fn append(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        let path = self.path(bucket, remote);
        self.create_parent(bucket, &path).await?;

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|err| io_error(err, bucket, remote, "open for append"))?;
        let mut writer = tokio::io::BufWriter::new(file);

        tokio::io::copy_buf(local, &mut writer)
            .await
            .map_err(|err| io_error(err, bucket, remote, "append"))?;
        writer
            .shutdown()
            .await
            .map_err(|err| io_error(err, bucket, remote, "flush file"))?;

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| io_error(err, bucket, remote, "metadata"))?;
        Ok(metadata.len())
    }

    async fn rename(&self, bucket: &str, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        let source = self.path(bucket, from);
        let target = self.path(bucket, to);
        self.create_parent(bucket, &target).await?;

        tokio::fs::rename(&source, &target)
            .await
            .map_err(|err| io_error(err, bucket, from, "rename"))
    }
}

/// Walk `start`, returning file paths relative to `root`. A missing directory is empty.
#[tracing::instrument]
fn collect_list(root: &Utf8Path, start: &Utf8Path) -> eyre::Result<Vec<String>> {
    let mut files = Vec::new();
    if start.is_file() {
        files.push(start.to_owned());
    } else if start.is_dir() {
        visit(start, &mut files)?;
    }

    let mut items: Vec<String> = files
        .into_iter()
        .filter_map(|p| p.strip_prefix(root).ok().map(|p| p.to_string()))
        .collect();
    items.sort();
    Ok(items)
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> eyre::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}
