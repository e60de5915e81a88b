//! Registry builder and the distribution HTTP API.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderValue, Method};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use chrono::Utc;
use futures::TryStreamExt as _;
use secret::Secret;
use serde_json::json;
use storage::{MemoryStorage, Storage};
use tokio::io::AsyncBufRead;
use tokio_util::io::StreamReader;

use crate::auth::{AllowAll, Authorizer, Permission};
use crate::blobstore::BlobStore;
use crate::config::{RegistryConfig, RegistryEntry};
use crate::db::{Database, RegistryKind};
use crate::error::{RegistryError, RegistryResult};
use crate::gc::{GcService, GcSettings, SweepReport};
use crate::headers::DOCKER_DISTRIBUTION_API_VERSION;
use crate::info::{RegistryInfo, Session};
use crate::local::{LocalRegistry, LocalSettings};
use crate::proxy::{CacheHandlers, ManifestCacheHandler, ProxyController, ProxySettings};
use crate::remote::{HttpRemote, RemoteRegistry};
use crate::upload::UploadTokens;

mod blob;
mod manifest;
mod path;

use path::Endpoint;

const DEFAULT_BUCKET: &str = "registry";

/// Registry builder for configuring and creating the OCI registry service
#[derive(Debug)]
pub struct RegistryBuilder {
    storage: Option<Storage>,
    bucket: Option<String>,
    persist_metadata: bool,
    secret: Option<Secret>,
    local: LocalSettings,
    gc: GcSettings,
    proxy: ProxySettings,
    registries: Vec<RegistryEntry>,
    clients: HashMap<String, Arc<dyn RemoteRegistry>>,
    handlers: CacheHandlers,
    authorizer: Arc<dyn Authorizer>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self {
            storage: None,
            bucket: None,
            persist_metadata: false,
            secret: None,
            local: LocalSettings::default(),
            gc: GcSettings::default(),
            proxy: ProxySettings::default(),
            registries: Vec::new(),
            clients: HashMap::new(),
            handlers: CacheHandlers::default(),
            authorizer: Arc::new(AllowAll),
        }
    }

    /// Everything from a configuration file except the storage backend, which
    /// the caller builds.
    pub fn from_config(config: &RegistryConfig) -> Self {
        let mut builder = Self::new()
            .bucket(config.storage.bucket.clone())
            .persist_metadata(config.storage.persist_metadata)
            .local_settings(config.upload.local_settings())
            .gc_settings(config.gc.settings.clone())
            .proxy_settings(config.proxy.clone());
        builder.secret = config.upload.secret.clone();
        builder.registries = config.registries.clone();
        builder
    }

    /// Set the storage backend
    pub fn storage(mut self, storage: Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the bucket name for storage
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Keep the metadata snapshot in the bucket.
    pub fn persist_metadata(mut self, persist: bool) -> Self {
        self.persist_metadata = persist;
        self
    }

    /// Key for upload state tokens.
    pub fn secret(mut self, secret: Secret) -> Self {
        self.secret = Some(secret);
        self
    }

    /// Local registry switches.
    pub fn local_settings(mut self, settings: LocalSettings) -> Self {
        self.local = settings;
        self
    }

    /// Garbage collector timeouts.
    pub fn gc_settings(mut self, settings: GcSettings) -> Self {
        self.gc = settings;
        self
    }

    /// Proxy retry budgets.
    pub fn proxy_settings(mut self, settings: ProxySettings) -> Self {
        self.proxy = settings;
        self
    }

    /// Serve pushed content as `<root>/<name>`.
    pub fn registry(mut self, root: impl Into<String>, name: impl Into<String>) -> Self {
        self.registries.push(RegistryEntry {
            root: root.into(),
            name: name.into(),
            kind: RegistryKind::Virtual,
            upstream: None,
        });
        self
    }

    /// Serve `<root>/<name>` as a pull-through cache of `client`.
    pub fn upstream(
        mut self,
        root: impl Into<String>,
        name: impl Into<String>,
        client: Arc<dyn RemoteRegistry>,
    ) -> Self {
        let (root, name) = (root.into(), name.into());
        self.clients.insert(format!("{root}/{name}"), client);
        self.registries.push(RegistryEntry {
            root,
            name,
            kind: RegistryKind::Upstream,
            upstream: None,
        });
        self
    }

    /// Cache manifests of `media_type` with `handler`.
    pub fn cache_handler(
        mut self,
        media_type: impl Into<String>,
        handler: Arc<dyn ManifestCacheHandler>,
    ) -> Self {
        self.handlers.register(media_type, handler);
        self
    }

    /// Authorization policy.
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Build the registry service
    pub async fn build(self) -> RegistryResult<Registry> {
        let bucket_name = self.bucket.unwrap_or_else(|| DEFAULT_BUCKET.to_owned());
        let storage = match self.storage {
            Some(storage) => storage,
            None => MemoryStorage::with_buckets(&[bucket_name.as_str()]).into(),
        };
        let bucket = storage.bucket(bucket_name);

        let db = if self.persist_metadata {
            Database::open(bucket.clone()).await?
        } else {
            Database::in_memory()
        };
        let secret = self.secret.unwrap_or_else(|| {
            tracing::warn!("no upload secret configured, uploads will not survive a restart");
            Secret::generate()
        });

        let local = LocalRegistry::new(
            db,
            GcService::new(self.gc),
            BlobStore::new(bucket),
            UploadTokens::new(secret),
            self.local,
        );

        let mut clients = self.clients;
        for entry in &self.registries {
            local
                .create_registry(&entry.root, &entry.name, entry.kind)
                .await?;
            let key = format!("{}/{}", entry.root, entry.name);
            if let (RegistryKind::Upstream, Some(upstream)) = (entry.kind, &entry.upstream) {
                if !clients.contains_key(&key) {
                    tracing::info!(registry = %key, url = %upstream.url, "proxying upstream");
                    clients.insert(key, Arc::new(HttpRemote::new(upstream.clone())?));
                }
            }
        }

        let proxy = ProxyController::new(local.clone(), clients, self.handlers, self.proxy);
        Ok(Registry {
            local,
            proxy,
            authorizer: self.authorizer,
        })
    }
}

/// A running registry: local content, upstream caches and the HTTP API.
#[derive(Debug, Clone)]
pub struct Registry {
    local: LocalRegistry,
    proxy: ProxyController,
    authorizer: Arc<dyn Authorizer>,
}

impl Registry {
    /// The local registry engine.
    pub fn local(&self) -> &LocalRegistry {
        &self.local
    }

    /// The pull-through proxy.
    pub fn proxy(&self) -> &ProxyController {
        &self.proxy
    }

    /// Run one garbage collection sweep.
    pub async fn collect_garbage(&self) -> RegistryResult<SweepReport> {
        self.local
            .gc()
            .sweep(Utc::now(), self.local.db(), self.local.blobs())
            .await
    }

    /// The distribution API, ready to serve.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/v2/", get(api_version_check))
            .route("/v2", get(api_version_check))
            .route("/v2/{*path}", any(dispatch))
            .layer(axum::middleware::map_response(api_version_header))
            .with_state(self.clone())
    }

    fn authorize(&self, info: &RegistryInfo, permission: Permission) -> RegistryResult<()> {
        if self
            .authorizer
            .check(&info.session, &info.repository(), permission)
        {
            Ok(())
        } else {
            tracing::debug!(repository = %info.repository(), ?permission, "denied");
            Err(RegistryError::Denied)
        }
    }

    /// Whether the addressed registry is a pull-through cache.
    async fn is_upstream(&self, info: &RegistryInfo) -> RegistryResult<bool> {
        Ok(self.local.registry(info).await?.kind == RegistryKind::Upstream)
    }
}

/// API version check endpoint
async fn api_version_check() -> Json<serde_json::Value> {
    Json(json!({}))
}

async fn api_version_header(mut response: Response) -> Response {
    response.headers_mut().insert(
        DOCKER_DISTRIBUTION_API_VERSION,
        HeaderValue::from_static("registry/2.0"),
    );
    response
}

/// Route `/v2/<name>/...` to its endpoint.
async fn dispatch(
    State(registry): State<Registry>,
    Path(path): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    request: Request,
) -> RegistryResult<Response> {
    let endpoint = path::parse(&path).ok_or_else(|| RegistryError::NameInvalid(path.clone()))?;
    let session = request
        .extensions()
        .get::<Session>()
        .cloned()
        .unwrap_or_default();
    let method = request.method().clone();
    let info = |name: &str| RegistryInfo::from_name(name).map(|info| info.with_session(session.clone()));

    match endpoint {
        Endpoint::Manifest { name, reference } => {
            let info = info(name)?.with_reference(reference)?;
            manifest::manifest(&registry, info, request).await
        }
        Endpoint::Tags { name } if method == Method::GET => {
            manifest::tags(&registry, info(name)?, &params).await
        }
        Endpoint::Referrers { name, digest } if method == Method::GET => {
            manifest::referrers(&registry, info(name)?, digest, &params).await
        }
        Endpoint::Blob { name, digest } => {
            blob::blob(&registry, info(name)?, digest, &method).await
        }
        Endpoint::StartUpload { name } if method == Method::POST => {
            blob::start_upload(&registry, info(name)?, &params, request).await
        }
        Endpoint::Upload { name, uuid } => {
            blob::upload(&registry, info(name)?, uuid, &params, request).await
        }
        Endpoint::Tags { .. } | Endpoint::Referrers { .. } | Endpoint::StartUpload { .. } => {
            Err(RegistryError::Unsupported("method not allowed"))
        }
    }
}

/// The request body as a buffered reader.
fn body_reader(body: Body) -> impl AsyncBufRead + Unpin + Send {
    StreamReader::new(body.into_data_stream().map_err(io::Error::other))
}

/// Render any handler result.
fn respond<T: IntoResponse>(result: RegistryResult<T>) -> RegistryResult<Response> {
    result.map(IntoResponse::into_response)
}
