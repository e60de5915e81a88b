//! Server configuration, read from TOML.
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:5000"
//!
//! [storage]
//! bucket = "registry"
//! persist-metadata = true
//! backend = { local = { path = "/var/lib/registry" } }
//!
//! [upload]
//! secret = "change me"
//! delete-enabled = true
//!
//! [[registries]]
//! root = "acme"
//! name = "docker"
//! kind = "upstream"
//! upstream = { url = "https://registry-1.docker.io", docker-hub-library = true }
//! ```

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use secret::Secret;
use serde::Deserialize;
use storage::StorageConfig;

use crate::db::RegistryKind;
use crate::gc::GcSettings;
use crate::info::RegistryInfo;
use crate::local::LocalSettings;
use crate::proxy::ProxySettings;
use crate::remote::UpstreamConfig;

/// Problems loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading {}: {source}", .path.display())]
    Read {
        /// File we tried to read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML, or does not match the schema.
    #[error("parsing configuration: {0}")]
    Parse(#[from] toml_edit::de::Error),

    /// A registry root or name is not a valid repository component.
    #[error("invalid registry name {0}")]
    InvalidName(String),

    /// Two `[[registries]]` entries share a root and name.
    #[error("registry {0} is configured more than once")]
    Duplicate(String),

    /// An upstream registry has nowhere to pull from.
    #[error("upstream registry {0} has no upstream url")]
    MissingUpstream(String),
}

/// Everything `registry-server` needs to start.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// `[server]`
    pub server: ServerConfig,
    /// `[storage]`
    pub storage: StorageSection,
    /// `[upload]`
    pub upload: UploadConfig,
    /// `[gc]`
    pub gc: GcConfig,
    /// `[proxy]`
    pub proxy: ProxySettings,
    /// `[[registries]]`
    pub registries: Vec<RegistryEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
#[allow(missing_docs)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 5000)),
        }
    }
}

/// Where blobs and metadata live.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StorageSection {
    /// Storage backend.
    pub backend: StorageConfig,
    /// Bucket within the backend.
    pub bucket: String,
    /// Keep a metadata snapshot in the bucket, so restarts keep their content.
    pub persist_metadata: bool,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: StorageConfig::Memory {
                bucket: "registry".into(),
            },
            bucket: "registry".into(),
            persist_metadata: false,
        }
    }
}

/// `[upload]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct UploadConfig {
    /// Key which signs upload state tokens. Generated at startup if unset, which
    /// breaks uploads spanning restarts or replicas.
    pub secret: Option<Secret>,
    /// Allow clients to delete blobs.
    pub delete_enabled: bool,
}

impl UploadConfig {
    /// Settings for the local registry.
    pub fn local_settings(&self) -> LocalSettings {
        LocalSettings {
            delete_enabled: self.delete_enabled,
        }
    }
}

/// `[gc]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GcConfig {
    /// Run the periodic sweep.
    pub enabled: bool,
    /// Time between sweeps.
    #[serde(with = "seconds")]
    pub sweep_interval: Duration,
    /// Lock timeouts and review delays.
    #[serde(flatten)]
    pub settings: GcSettings,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval: Duration::from_secs(60 * 60),
            settings: GcSettings::default(),
        }
    }
}

/// One `[[registries]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryEntry {
    /// Tenant owning the registry's blobs.
    pub root: String,
    /// Registry name.
    pub name: String,
    /// Pushed content or a pull-through cache.
    #[serde(default = "default_kind")]
    pub kind: RegistryKind,
    /// Where an upstream registry pulls from.
    #[serde(default)]
    pub upstream: Option<UpstreamConfig>,
}

fn default_kind() -> RegistryKind {
    RegistryKind::Virtual
}

impl RegistryConfig {
    /// Read and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml_edit::de::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for entry in &self.registries {
            let key = format!("{}/{}", entry.root, entry.name);
            // Registry names share the repository component grammar.
            RegistryInfo::new(&entry.root, &entry.name, "probe")
                .map_err(|_| ConfigError::InvalidName(key.clone()))?;
            if entry.kind == RegistryKind::Upstream && entry.upstream.is_none() {
                return Err(ConfigError::MissingUpstream(key));
            }
            if !seen.insert(key.clone()) {
                return Err(ConfigError::Duplicate(key));
            }
        }
        Ok(())
    }
}

/// Serde adapter for durations written as whole seconds.
pub mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Write `duration` as seconds.
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    /// Read seconds into a duration.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
