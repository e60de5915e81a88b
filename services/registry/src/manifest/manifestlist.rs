//! Docker manifest lists (multi-platform images).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{
    Deserialized, Descriptor, Manifest, ManifestError, SchemaRegistry, Shape, Versioned,
    MEDIA_TYPE_MANIFEST_LIST,
};

/// `application/vnd.docker.distribution.manifest.list.v2+json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestList {
    #[serde(flatten)]
    #[allow(missing_docs)]
    pub versioned: Versioned,

    /// One image manifest per platform.
    pub manifests: Vec<Descriptor>,
}

pub(super) fn register(schemas: &mut SchemaRegistry) -> Result<(), ManifestError> {
    schemas.insert(MEDIA_TYPE_MANIFEST_LIST, unmarshal)
}

/// Parse a docker manifest list. The media type field is mandatory.
pub fn unmarshal(bytes: Bytes) -> Result<(Manifest, Descriptor), ManifestError> {
    let shape = Shape::probe(&bytes)?;
    shape.reject_field("manifest list", "config", shape.config.is_some())?;
    shape.reject_field("manifest list", "layers", shape.layers.is_some())?;
    shape.require_schema_version(2)?;
    shape.require_media_type(MEDIA_TYPE_MANIFEST_LIST, true)?;

    let list: ManifestList = serde_json::from_slice(&bytes)?;
    let (list, descriptor) = Deserialized::new(list, bytes, MEDIA_TYPE_MANIFEST_LIST);
    Ok((Manifest::List(list), descriptor))
}
