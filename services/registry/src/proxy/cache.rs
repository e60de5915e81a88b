//! Persisting proxied manifests into the local registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::db::RegistryRow;
use crate::digest::Digest;
use crate::error::RegistryResult;
use crate::headers::ResponseHeaders;
use crate::info::RegistryInfo;
use crate::local::LocalRegistry;
use crate::manifest::{MEDIA_TYPE_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX, Manifest};

/// One manifest fetched from upstream, waiting to be stored.
#[derive(Debug, Clone)]
pub struct CacheJob {
    /// Coordinates of the request which fetched it.
    pub info: RegistryInfo,
    /// The upstream registry's row.
    pub registry: RegistryRow,
    /// The manifest as fetched.
    pub manifest: Manifest,
    /// Its digest.
    pub digest: Digest,
    /// When it was fetched.
    pub fetched_at: DateTime<Utc>,
}

/// What a handler did with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// The manifest is stored (and tagged, for tag requests).
    Cached,
    /// Nothing to do; the job should not be retried.
    Skipped,
}

/// Stores one kind of manifest. Errors are retried by the caller.
#[async_trait::async_trait]
pub trait ManifestCacheHandler: fmt::Debug + Send + Sync {
    /// Store `job` into `local`.
    async fn cache(&self, local: &LocalRegistry, job: &CacheJob) -> RegistryResult<CacheOutcome>;
}

/// Stores image manifests, then resolves lists which were waiting for them.
#[derive(Debug, Default)]
pub struct DefaultCacheHandler;

#[async_trait::async_trait]
impl ManifestCacheHandler for DefaultCacheHandler {
    async fn cache(&self, local: &LocalRegistry, job: &CacheJob) -> RegistryResult<CacheOutcome> {
        let manifests = local.manifests();
        let mut headers = ResponseHeaders::default();
        manifests
            .db_put(&job.manifest, &job.digest, &job.registry, &job.info, &mut headers)
            .await?;
        if let Some(tag) = &job.info.tag {
            manifests
                .db_tag(&job.manifest, &job.digest, tag, &job.registry, &job.info, &mut headers)
                .await?;
        }
        manifests
            .add_manifest_association(&job.registry, &job.info.image, &job.digest)
            .await?;
        Ok(CacheOutcome::Cached)
    }
}

/// Stores lists and indexes without clobbering a fresher local tag.
#[derive(Debug, Default)]
pub struct ListCacheHandler;

#[async_trait::async_trait]
impl ManifestCacheHandler for ListCacheHandler {
    async fn cache(&self, local: &LocalRegistry, job: &CacheJob) -> RegistryResult<CacheOutcome> {
        if job.manifest.children().is_empty() {
            tracing::warn!(digest = %job.digest, "not caching an empty list");
            return Ok(CacheOutcome::Skipped);
        }

        if let Some(tag) = &job.info.tag {
            let tables = local.db().read().await;
            let newer = tables
                .tag(job.registry.id, &job.info.image, tag)
                .filter(|row| row.updated_at > job.fetched_at)
                .and_then(|row| tables.manifest(row.manifest_id))
                .is_some_and(|current| current.digest != job.digest);
            drop(tables);
            if newer {
                tracing::debug!(%tag, "local tag changed after the fetch, keeping it");
                return Ok(CacheOutcome::Skipped);
            }
        }

        DefaultCacheHandler.cache(local, job).await
    }
}

/// Handlers by manifest media type.
#[derive(Debug, Clone)]
pub struct CacheHandlers {
    handlers: HashMap<String, Arc<dyn ManifestCacheHandler>>,
    fallback: Arc<dyn ManifestCacheHandler>,
}

impl Default for CacheHandlers {
    fn default() -> Self {
        let list: Arc<dyn ManifestCacheHandler> = Arc::new(ListCacheHandler);
        let mut handlers = HashMap::new();
        handlers.insert(MEDIA_TYPE_MANIFEST_LIST.to_owned(), list.clone());
        handlers.insert(MEDIA_TYPE_OCI_INDEX.to_owned(), list);
        Self {
            handlers,
            fallback: Arc::new(DefaultCacheHandler),
        }
    }
}

impl CacheHandlers {
    /// Use `handler` for `media_type`.
    pub fn register(&mut self, media_type: impl Into<String>, handler: Arc<dyn ManifestCacheHandler>) {
        self.handlers.insert(media_type.into(), handler);
    }

    /// The handler for `media_type`.
    pub fn for_media_type(&self, media_type: &str) -> &Arc<dyn ManifestCacheHandler> {
        self.handlers.get(media_type).unwrap_or(&self.fallback)
    }
}
