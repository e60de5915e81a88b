use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Primary key of every table.
pub type RowId = u64;

/// Whether a registry holds pushed content or caches an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegistryKind {
    /// Content is pushed by clients.
    Virtual,
    /// Content is pulled through from an upstream registry.
    Upstream,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RegistryRow {
    pub id: RowId,
    pub root: String,
    pub name: String,
    pub kind: RegistryKind,
}

/// A blob, stored once per root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct BlobRow {
    pub id: RowId,
    pub root: String,
    pub digest: Digest,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ImageRow {
    pub id: RowId,
    pub registry_id: RowId,
    pub name: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// One version (manifest digest) of an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ArtifactRow {
    pub id: RowId,
    pub image_id: RowId,
    pub version: Digest,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored manifest. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ManifestRow {
    pub id: RowId,
    pub registry_id: RowId,
    pub image: String,
    pub digest: Digest,
    pub schema_version: u32,
    pub media_type: String,
    pub artifact_type: Option<String>,
    pub config_media_type: Option<String>,
    pub config_digest: Option<Digest>,
    pub config_size: u64,
    pub total_size: u64,
    pub subject_digest: Option<Digest>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// The wire media type was untrusted and re-derived from the payload.
    pub non_conformant: bool,
    pub non_distributable_layers: bool,
    #[serde(with = "base64_bytes")]
    pub payload: Bytes,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct TagRow {
    pub id: RowId,
    pub registry_id: RowId,
    pub image: String,
    pub name: String,
    pub manifest_id: RowId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
