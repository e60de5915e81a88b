//! OCI image manifests and image indexes.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{
    Deserialized, Descriptor, Manifest, ManifestError, SchemaRegistry, Shape, Versioned,
    MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
};

/// `application/vnd.oci.image.manifest.v1+json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciManifest {
    #[serde(flatten)]
    #[allow(missing_docs)]
    pub versioned: Versioned,

    /// Set for artifacts which are not container images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    /// The configuration blob.
    pub config: Descriptor,

    /// Layer blobs, base first.
    pub layers: Vec<Descriptor>,

    /// The manifest this one refers to, for referrers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[allow(missing_docs)]
    pub annotations: BTreeMap<String, String>,
}

/// `application/vnd.oci.image.index.v1+json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    #[serde(flatten)]
    #[allow(missing_docs)]
    pub versioned: Versioned,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[allow(missing_docs)]
    pub artifact_type: Option<String>,

    /// Child manifests.
    pub manifests: Vec<Descriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[allow(missing_docs)]
    pub subject: Option<Descriptor>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[allow(missing_docs)]
    pub annotations: BTreeMap<String, String>,
}

impl ImageIndex {
    /// An index over `manifests`, as returned by the referrers API.
    pub fn new(manifests: Vec<Descriptor>) -> Self {
        Self {
            versioned: Versioned {
                schema_version: 2,
                media_type: MEDIA_TYPE_OCI_INDEX.to_owned(),
            },
            artifact_type: None,
            manifests,
            subject: None,
            annotations: BTreeMap::new(),
        }
    }
}

pub(super) fn register(schemas: &mut SchemaRegistry) -> Result<(), ManifestError> {
    schemas.insert(MEDIA_TYPE_OCI_MANIFEST, unmarshal_manifest)?;
    schemas.insert(MEDIA_TYPE_OCI_INDEX, unmarshal_index)
}

/// Parse an OCI image manifest. A media type field, if present, must match.
pub fn unmarshal_manifest(bytes: Bytes) -> Result<(Manifest, Descriptor), ManifestError> {
    let shape = Shape::probe(&bytes)?;
    shape.reject_field("OCI image", "manifests", shape.manifests.is_some())?;
    shape.require_schema_version(2)?;
    shape.require_media_type(MEDIA_TYPE_OCI_MANIFEST, false)?;

    let manifest: OciManifest = serde_json::from_slice(&bytes)?;
    let (manifest, mut descriptor) = Deserialized::new(manifest, bytes, MEDIA_TYPE_OCI_MANIFEST);
    descriptor.artifact_type = manifest.artifact_type.clone();
    descriptor.annotations = manifest.annotations.clone();
    Ok((Manifest::Oci(manifest), descriptor))
}

/// Parse an OCI image index. A media type field, if present, must match.
pub fn unmarshal_index(bytes: Bytes) -> Result<(Manifest, Descriptor), ManifestError> {
    let shape = Shape::probe(&bytes)?;
    shape.reject_field("OCI index", "config", shape.config.is_some())?;
    shape.reject_field("OCI index", "layers", shape.layers.is_some())?;
    shape.require_schema_version(2)?;
    shape.require_media_type(MEDIA_TYPE_OCI_INDEX, false)?;

    let index: ImageIndex = serde_json::from_slice(&bytes)?;
    let (index, mut descriptor) = Deserialized::new(index, bytes, MEDIA_TYPE_OCI_INDEX);
    descriptor.artifact_type = index.artifact_type.clone();
    descriptor.annotations = index.annotations.clone();
    Ok((Manifest::Index(index), descriptor))
}
