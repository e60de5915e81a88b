//! Docker image manifest, schema version 2.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{
    Deserialized, Descriptor, Manifest, ManifestError, SchemaRegistry, Shape, Versioned,
    MEDIA_TYPE_SCHEMA2,
};

/// `application/vnd.docker.distribution.manifest.v2+json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema2Manifest {
    #[serde(flatten)]
    #[allow(missing_docs)]
    pub versioned: Versioned,

    /// The image configuration blob.
    pub config: Descriptor,

    /// Filesystem layers, base first.
    pub layers: Vec<Descriptor>,
}

pub(super) fn register(schemas: &mut SchemaRegistry) -> Result<(), ManifestError> {
    schemas.insert(MEDIA_TYPE_SCHEMA2, unmarshal)
}

/// Parse a docker schema 2 manifest. The media type field is mandatory.
pub fn unmarshal(bytes: Bytes) -> Result<(Manifest, Descriptor), ManifestError> {
    let shape = Shape::probe(&bytes)?;
    shape.reject_field("docker image", "manifests", shape.manifests.is_some())?;
    shape.require_schema_version(2)?;
    shape.require_media_type(MEDIA_TYPE_SCHEMA2, true)?;

    let manifest: Schema2Manifest = serde_json::from_slice(&bytes)?;
    let (manifest, descriptor) = Deserialized::new(manifest, bytes, MEDIA_TYPE_SCHEMA2);
    Ok((Manifest::Schema2(manifest), descriptor))
}
