//! # Manifest model
//!
//! Typed manifests for the four schemas the registry stores, and a process-wide
//! table of parsers keyed by media type.
//!
//! A parsed [`Manifest`] always keeps the exact bytes it was parsed from. Those
//! bytes are what the registry stores and serves; manifests are never
//! re-serialized, since the digest covers the bytes as received.

use std::{collections::HashMap, ops::Deref, sync::LazyLock};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{de::IgnoredAny, Deserialize};

use crate::digest::Digest;

mod descriptor;
pub mod manifestlist;
pub mod ocischema;
pub mod schema2;

pub use descriptor::{Descriptor, Platform, Versioned};
pub use manifestlist::ManifestList;
pub use ocischema::{ImageIndex, OciManifest};
pub use schema2::Schema2Manifest;

/// Docker image manifest, schema 2.
pub const MEDIA_TYPE_SCHEMA2: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker multi-platform manifest list.
pub const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// OCI image manifest.
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index.
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Docker image configuration blob.
pub const MEDIA_TYPE_SCHEMA2_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
/// OCI image configuration blob.
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
/// The cache config buildx pushes inside an index, in place of a platform manifest.
pub const MEDIA_TYPE_BUILDKIT_CACHE_CONFIG: &str = "application/vnd.buildkit.cacheconfig.v0";

const NON_DISTRIBUTABLE_LAYERS: &[&str] = &[
    "application/vnd.oci.image.layer.nondistributable.v1.tar",
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip",
    "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd",
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip",
];

/// Layers which registries must not store; clients fetch them from their `urls`.
pub fn is_non_distributable(media_type: &str) -> bool {
    NON_DISTRIBUTABLE_LAYERS.contains(&media_type)
}

/// Whether a media type names a manifest list or image index.
pub fn is_list_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_MANIFEST_LIST || media_type == MEDIA_TYPE_OCI_INDEX
}

/// Errors from parsing manifests or registering parsers.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// No parser for this media type.
    #[error("unsupported manifest media type {0:?}")]
    UnsupportedMediaType(String),

    /// A parser was registered twice.
    #[error("manifest media type {0:?} is already registered")]
    AlreadyRegistered(String),

    /// The payload is not JSON of the expected structure.
    #[error("malformed manifest: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload declares a different media type.
    #[error("manifest media type should be {expected:?}, not {found:?}")]
    MediaTypeMismatch {
        /// Media type the parser handles.
        expected: &'static str,
        /// Media type written in the payload.
        found: String,
    },

    /// The payload has a field belonging to another schema.
    #[error("{kind} manifest must not contain a {field:?} field")]
    UnexpectedField {
        /// The schema being parsed.
        kind: &'static str,
        /// The offending field.
        field: &'static str,
    },

    /// Only schema version 2 is supported.
    #[error("unsupported manifest schema version {0}")]
    SchemaVersion(u32),
}

/// A manifest parser: takes the raw payload, returns the manifest and its descriptor.
pub type UnmarshalFn = fn(Bytes) -> Result<(Manifest, Descriptor), ManifestError>;

/// Parsers keyed by media type.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, UnmarshalFn>,
}

impl SchemaRegistry {
    fn insert(&mut self, media_type: &str, unmarshal: UnmarshalFn) -> Result<(), ManifestError> {
        if self.schemas.contains_key(media_type) {
            return Err(ManifestError::AlreadyRegistered(media_type.to_owned()));
        }
        self.schemas.insert(media_type.to_owned(), unmarshal);
        Ok(())
    }

    fn builtin() -> Result<Self, ManifestError> {
        let mut schemas = SchemaRegistry::default();
        schema2::register(&mut schemas)?;
        manifestlist::register(&mut schemas)?;
        ocischema::register(&mut schemas)?;
        schemas.insert("", unmarshal_unlabelled)?;
        Ok(schemas)
    }
}

static SCHEMAS: LazyLock<RwLock<SchemaRegistry>> = LazyLock::new(|| {
    let schemas = SchemaRegistry::builtin().unwrap_or_else(|error| {
        tracing::error!(%error, "builtin manifest schemas conflict");
        SchemaRegistry::default()
    });
    RwLock::new(schemas)
});

/// Install a parser for a new media type.
pub fn register_manifest_schema(
    media_type: &str,
    unmarshal: UnmarshalFn,
) -> Result<(), ManifestError> {
    SCHEMAS.write().insert(media_type, unmarshal)
}

fn lookup(media_type: &str) -> Option<UnmarshalFn> {
    SCHEMAS.read().schemas.get(media_type).copied()
}

/// Parse `bytes` as a manifest of `media_type`.
///
/// Parameters after `;` in the media type are ignored. The returned descriptor's
/// digest is computed over exactly `bytes`.
pub fn unmarshal_manifest(
    media_type: &str,
    bytes: impl Into<Bytes>,
) -> Result<(Manifest, Descriptor), ManifestError> {
    let media_type = media_type
        .split_once(';')
        .map_or(media_type, |(essence, _)| essence)
        .trim();

    let unmarshal = lookup(media_type)
        .ok_or_else(|| ManifestError::UnsupportedMediaType(media_type.to_owned()))?;
    unmarshal(bytes.into())
}

/// Best effort for uploads without a usable content type: trust the payload's own
/// `mediaType` if it is one we know, otherwise treat anything with a `manifests`
/// array as an OCI index and everything else as an OCI manifest.
fn unmarshal_unlabelled(bytes: Bytes) -> Result<(Manifest, Descriptor), ManifestError> {
    let shape = Shape::probe(&bytes)?;

    if let Some(unmarshal) = shape
        .media_type
        .as_deref()
        .filter(|mt| !mt.is_empty())
        .and_then(lookup)
    {
        return unmarshal(bytes);
    }

    if shape.manifests.is_some() {
        ocischema::unmarshal_index(bytes)
    } else {
        ocischema::unmarshal_manifest(bytes)
    }
}

/// The top-level fields which decide which schema a payload is.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Shape {
    schema_version: Option<u32>,
    media_type: Option<String>,
    config: Option<IgnoredAny>,
    layers: Option<IgnoredAny>,
    manifests: Option<IgnoredAny>,
}

impl Shape {
    fn probe(bytes: &[u8]) -> Result<Self, ManifestError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn reject_field(
        &self,
        kind: &'static str,
        field: &'static str,
        present: bool,
    ) -> Result<(), ManifestError> {
        if present {
            Err(ManifestError::UnexpectedField { kind, field })
        } else {
            Ok(())
        }
    }

    fn require_schema_version(&self, version: u32) -> Result<(), ManifestError> {
        match self.schema_version {
            Some(found) if found == version => Ok(()),
            found => Err(ManifestError::SchemaVersion(found.unwrap_or_default())),
        }
    }

    fn require_media_type(
        &self,
        expected: &'static str,
        mandatory: bool,
    ) -> Result<(), ManifestError> {
        match self.media_type.as_deref() {
            Some(found) if found == expected => Ok(()),
            None | Some("") if !mandatory => Ok(()),
            found => Err(ManifestError::MediaTypeMismatch {
                expected,
                found: found.unwrap_or_default().to_owned(),
            }),
        }
    }
}

/// A parsed manifest together with the bytes it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deserialized<T> {
    inner: T,
    canonical: Bytes,
}

impl<T> Deserialized<T> {
    fn new(inner: T, canonical: Bytes, media_type: &str) -> (Self, Descriptor) {
        let descriptor = Descriptor::new(
            media_type,
            Digest::sha256(&canonical),
            canonical.len() as u64,
        );
        (Self { inner, canonical }, descriptor)
    }

    /// The bytes as received.
    pub fn canonical(&self) -> &Bytes {
        &self.canonical
    }
}

impl<T> Deref for Deserialized<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Any manifest the registry understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    /// Docker image manifest.
    Schema2(Deserialized<Schema2Manifest>),
    /// OCI image manifest.
    Oci(Deserialized<OciManifest>),
    /// Docker manifest list.
    List(Deserialized<ManifestList>),
    /// OCI image index.
    Index(Deserialized<ImageIndex>),
}

impl Manifest {
    /// The schema header.
    pub fn versioned(&self) -> &Versioned {
        match self {
            Manifest::Schema2(m) => &m.versioned,
            Manifest::Oci(m) => &m.versioned,
            Manifest::List(m) => &m.versioned,
            Manifest::Index(m) => &m.versioned,
        }
    }

    /// The media type this manifest is served as.
    pub fn media_type(&self) -> &'static str {
        match self {
            Manifest::Schema2(_) => MEDIA_TYPE_SCHEMA2,
            Manifest::Oci(_) => MEDIA_TYPE_OCI_MANIFEST,
            Manifest::List(_) => MEDIA_TYPE_MANIFEST_LIST,
            Manifest::Index(_) => MEDIA_TYPE_OCI_INDEX,
        }
    }

    /// Media type and canonical bytes.
    pub fn payload(&self) -> (&'static str, &Bytes) {
        let canonical = match self {
            Manifest::Schema2(m) => m.canonical(),
            Manifest::Oci(m) => m.canonical(),
            Manifest::List(m) => m.canonical(),
            Manifest::Index(m) => m.canonical(),
        };
        (self.media_type(), canonical)
    }

    /// Digest of the canonical bytes.
    pub fn digest(&self) -> Digest {
        Digest::sha256(self.payload().1)
    }

    /// Whether this is a list or index.
    pub fn is_list(&self) -> bool {
        matches!(self, Manifest::List(_) | Manifest::Index(_))
    }

    /// The configuration blob of an image manifest.
    pub fn config(&self) -> Option<&Descriptor> {
        match self {
            Manifest::Schema2(m) => Some(&m.config),
            Manifest::Oci(m) => Some(&m.config),
            Manifest::List(_) | Manifest::Index(_) => None,
        }
    }

    /// Layers of an image manifest; empty for lists.
    pub fn layers(&self) -> &[Descriptor] {
        match self {
            Manifest::Schema2(m) => &m.layers,
            Manifest::Oci(m) => &m.layers,
            Manifest::List(_) | Manifest::Index(_) => &[],
        }
    }

    /// Child manifests of a list; empty for images.
    pub fn children(&self) -> &[Descriptor] {
        match self {
            Manifest::List(m) => &m.manifests,
            Manifest::Index(m) => &m.manifests,
            Manifest::Schema2(_) | Manifest::Oci(_) => &[],
        }
    }

    /// Everything this manifest depends on: config and layers, or child manifests.
    pub fn references(&self) -> Vec<Descriptor> {
        match self.config() {
            Some(config) => std::iter::once(config)
                .chain(self.layers())
                .cloned()
                .collect(),
            None => self.children().to_vec(),
        }
    }

    /// The manifest this one refers to (OCI only).
    pub fn subject(&self) -> Option<&Descriptor> {
        match self {
            Manifest::Oci(m) => m.subject.as_ref(),
            Manifest::Index(m) => m.subject.as_ref(),
            Manifest::Schema2(_) | Manifest::List(_) => None,
        }
    }

    /// Declared artifact type (OCI only).
    pub fn artifact_type(&self) -> Option<&str> {
        match self {
            Manifest::Oci(m) => m.artifact_type.as_deref(),
            Manifest::Index(m) => m.artifact_type.as_deref(),
            Manifest::Schema2(_) | Manifest::List(_) => None,
        }
    }

    /// Manifest annotations (OCI only).
    pub fn annotations(&self) -> Option<&std::collections::BTreeMap<String, String>> {
        match self {
            Manifest::Oci(m) => Some(&m.annotations),
            Manifest::Index(m) => Some(&m.annotations),
            Manifest::Schema2(_) | Manifest::List(_) => None,
        }
    }

    /// Payload plus the sizes of everything it references.
    pub fn total_size(&self) -> u64 {
        let payload = self.payload().1.len() as u64;
        payload + self.references().iter().map(|d| d.size).sum::<u64>()
    }

    /// The child of a list matching a platform.
    pub fn child_for_platform(&self, architecture: &str, os: &str) -> Option<&Descriptor> {
        self.children()
            .iter()
            .find(|child| child.matches_platform(architecture, os))
    }

    /// The config and layers of a buildx cache index, which buildx pushes with an
    /// index media type although it describes blobs rather than manifests.
    pub fn buildx_cache_parts(&self) -> Option<(Descriptor, Vec<Descriptor>)> {
        let children = self.children();
        let config = children
            .iter()
            .find(|child| child.media_type == MEDIA_TYPE_BUILDKIT_CACHE_CONFIG)?;
        let layers = children
            .iter()
            .filter(|child| child.media_type != MEDIA_TYPE_BUILDKIT_CACHE_CONFIG)
            .cloned()
            .collect();
        Some((config.clone(), layers))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn descriptor_json(media_type: &str, digest: &Digest, size: u64) -> serde_json::Value {
        serde_json::json!({ "mediaType": media_type, "digest": digest.to_string(), "size": size })
    }

    pub(crate) fn image_manifest(media_type: &str, config: &[u8], layers: &[&[u8]]) -> Vec<u8> {
        let config_type = if media_type == MEDIA_TYPE_SCHEMA2 {
            MEDIA_TYPE_SCHEMA2_CONFIG
        } else {
            MEDIA_TYPE_OCI_CONFIG
        };
        let layers: Vec<_> = layers
            .iter()
            .map(|layer| {
                descriptor_json(
                    "application/vnd.oci.image.layer.v1.tar+gzip",
                    &Digest::sha256(layer),
                    layer.len() as u64,
                )
            })
            .collect();
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_type,
            "config": descriptor_json(config_type, &Digest::sha256(config), config.len() as u64),
            "layers": layers,
        }))
        .unwrap()
    }

    pub(crate) fn list_manifest(media_type: &str, children: &[(&[u8], &str, &str)]) -> Vec<u8> {
        let manifests: Vec<_> = children
            .iter()
            .map(|(payload, arch, os)| {
                let mut child = descriptor_json(
                    MEDIA_TYPE_OCI_MANIFEST,
                    &Digest::sha256(payload),
                    payload.len() as u64,
                );
                child["platform"] = serde_json::json!({ "architecture": arch, "os": os });
                child
            })
            .collect();
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_type,
            "manifests": manifests,
        }))
        .unwrap()
    }

    #[test]
    fn digest_covers_exact_bytes() {
        let bytes = image_manifest(MEDIA_TYPE_OCI_MANIFEST, b"{}", &[b"layer"]);
        let (manifest, descriptor) = unmarshal_manifest(MEDIA_TYPE_OCI_MANIFEST, bytes.clone()).unwrap();

        assert_eq!(descriptor.digest, Digest::sha256(&bytes));
        assert_eq!(descriptor.size, bytes.len() as u64);
        assert_eq!(manifest.payload().1.as_ref(), bytes.as_slice());

        // Extra whitespace is still valid JSON, but a different manifest.
        let mut altered = bytes.clone();
        altered.push(b' ');
        let (_, other) = unmarshal_manifest(MEDIA_TYPE_OCI_MANIFEST, altered).unwrap();
        assert_ne!(other.digest, descriptor.digest);
        assert!(other.digest.verify(&bytes).is_err());
    }

    #[test]
    fn list_payload_rejected_by_image_parser() {
        let list = list_manifest(MEDIA_TYPE_OCI_INDEX, &[(b"child", "amd64", "linux")]);
        let err = unmarshal_manifest(MEDIA_TYPE_OCI_MANIFEST, list).unwrap_err();
        assert!(matches!(
            err,
            ManifestError::UnexpectedField { field: "manifests", .. }
        ));
    }

    #[test]
    fn image_payload_rejected_by_list_parsers() {
        let image = image_manifest(MEDIA_TYPE_OCI_MANIFEST, b"{}", &[]);
        let err = unmarshal_manifest(MEDIA_TYPE_OCI_INDEX, image.clone()).unwrap_err();
        assert!(matches!(err, ManifestError::UnexpectedField { field: "config", .. }));

        let err = unmarshal_manifest(MEDIA_TYPE_MANIFEST_LIST, image).unwrap_err();
        assert!(matches!(err, ManifestError::UnexpectedField { .. }));
    }

    #[test]
    fn media_type_must_agree() {
        let oci = image_manifest(MEDIA_TYPE_OCI_MANIFEST, b"{}", &[]);
        let err = unmarshal_manifest(MEDIA_TYPE_SCHEMA2, oci).unwrap_err();
        assert!(matches!(err, ManifestError::MediaTypeMismatch { .. }));
    }

    #[test]
    fn docker_manifest_requires_media_type_field() {
        let bytes = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "config": descriptor_json(MEDIA_TYPE_SCHEMA2_CONFIG, &Digest::sha256(b"{}"), 2),
            "layers": [],
        }))
        .unwrap();
        assert!(unmarshal_manifest(MEDIA_TYPE_SCHEMA2, bytes.clone()).is_err());
        // OCI tolerates the missing field.
        let (manifest, _) = unmarshal_manifest(MEDIA_TYPE_OCI_MANIFEST, bytes).unwrap();
        assert!(matches!(manifest, Manifest::Oci(_)));
    }

    #[test]
    fn schema_version_checked() {
        let bytes = br#"{"schemaVersion":1,"mediaType":"application/vnd.oci.image.index.v1+json","manifests":[]}"#;
        let err = unmarshal_manifest(MEDIA_TYPE_OCI_INDEX, &bytes[..]).unwrap_err();
        assert!(matches!(err, ManifestError::SchemaVersion(1)));
    }

    #[test]
    fn unknown_media_type_and_parameters() {
        let image = image_manifest(MEDIA_TYPE_OCI_MANIFEST, b"{}", &[]);
        assert!(matches!(
            unmarshal_manifest("text/plain", image.clone()),
            Err(ManifestError::UnsupportedMediaType(_))
        ));
        let with_params = format!("{MEDIA_TYPE_OCI_MANIFEST}; charset=utf-8");
        assert!(unmarshal_manifest(&with_params, image).is_ok());
    }

    #[test]
    fn empty_media_type_sniffs_content() {
        let index = list_manifest(MEDIA_TYPE_OCI_INDEX, &[(b"child", "amd64", "linux")]);
        let (manifest, descriptor) = unmarshal_manifest("", index).unwrap();
        assert!(matches!(manifest, Manifest::Index(_)));
        assert_eq!(descriptor.media_type, MEDIA_TYPE_OCI_INDEX);

        let docker = image_manifest(MEDIA_TYPE_SCHEMA2, b"{}", &[]);
        let (manifest, _) = unmarshal_manifest("", docker).unwrap();
        assert!(matches!(manifest, Manifest::Schema2(_)));

        let bare = br#"{"schemaVersion":2,"manifests":[]}"#;
        let (manifest, _) = unmarshal_manifest("", &bare[..]).unwrap();
        assert!(matches!(manifest, Manifest::Index(_)));
    }

    #[test]
    fn duplicate_registration_fails() {
        let err = register_manifest_schema(MEDIA_TYPE_OCI_MANIFEST, ocischema::unmarshal_manifest)
            .unwrap_err();
        assert!(matches!(err, ManifestError::AlreadyRegistered(_)));
    }

    #[test]
    fn references_and_platform_lookup() {
        let image = image_manifest(MEDIA_TYPE_SCHEMA2, b"cfg", &[b"a", b"b"]);
        let (manifest, _) = unmarshal_manifest(MEDIA_TYPE_SCHEMA2, image).unwrap();
        let refs = manifest.references();
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].digest, Digest::sha256(b"cfg"));

        let list = list_manifest(
            MEDIA_TYPE_MANIFEST_LIST,
            &[(b"arm", "arm64", "linux"), (b"amd", "amd64", "linux")],
        );
        let (manifest, _) = unmarshal_manifest(MEDIA_TYPE_MANIFEST_LIST, list).unwrap();
        let child = manifest.child_for_platform("amd64", "linux").unwrap();
        assert_eq!(child.digest, Digest::sha256(b"amd"));
        assert!(manifest.child_for_platform("s390x", "linux").is_none());
    }

    #[test]
    fn buildx_cache_detection() {
        let config = Digest::sha256(b"cache");
        let layer = Digest::sha256(b"layer");
        let bytes = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_INDEX,
            "manifests": [
                descriptor_json("application/vnd.oci.image.layer.v1.tar+gzip", &layer, 5),
                descriptor_json(MEDIA_TYPE_BUILDKIT_CACHE_CONFIG, &config, 5),
            ],
        }))
        .unwrap();
        let (manifest, _) = unmarshal_manifest(MEDIA_TYPE_OCI_INDEX, bytes).unwrap();
        let (cfg, layers) = manifest.buildx_cache_parts().unwrap();
        assert_eq!(cfg.digest, config);
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].digest, layer);
    }
}
