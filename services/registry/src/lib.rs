//! # OCI Container Registry
//!
//! An OCI distribution registry which serves pushed content and caches
//! upstream registries on demand.
//!
//! Repository names have the form `<root>/<registry>/<image>`. A *root* owns a
//! blob store shared by its registries. A registry is either *virtual* (clients
//! push to it) or *upstream* (a pull-through cache of another registry, see
//! [`proxy`]).
//!
//! ## Features
//!
//! - The distribution API: manifests, tags, blobs, chunked uploads, referrers
//! - Docker schema 2 and OCI manifests, lists and indexes
//! - Pull-through caching with background population
//! - Online garbage collection of unreferenced content
//! - Pluggable storage backend via the `storage` crate
//!
//! ## Example
//!
//! ```no_run
//! use oci_registry::RegistryBuilder;
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["registry"]);
//! let registry = RegistryBuilder::new()
//!     .storage(storage.into())
//!     .bucket("registry")
//!     .registry("acme", "docker")
//!     .build()
//!     .await?;
//!
//! // Serve with axum or any tower-compatible server
//! let app = registry.router();
//! # drop(app);
//! # Ok(())
//! # }
//! ```

mod api;
pub mod auth;
pub mod blobstore;
pub mod config;
pub mod db;
pub mod digest;
mod error;
pub mod gc;
pub mod headers;
pub mod info;
pub mod local;
pub mod manifest;
pub mod manifest_service;
pub mod proxy;
pub mod remote;
pub mod upload;

pub use api::{Registry, RegistryBuilder};
pub use error::{ErrorCode, RegistryError, RegistryResult};
