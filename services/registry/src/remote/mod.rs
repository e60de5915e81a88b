//! Clients for upstream registries.

use std::fmt;

use bytes::Bytes;
use http::StatusCode;

use crate::blobstore::BlobReader;
use crate::digest::Digest;

mod http_remote;

pub use http_remote::{HttpRemote, UpstreamConfig};

/// Failures talking to an upstream registry.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The upstream does not have the content.
    #[error("not found upstream: {0}")]
    NotFound(String),

    /// The upstream asked us to back off.
    #[error("upstream rate limit exceeded")]
    RateLimited,

    /// The upstream refused our credentials.
    #[error("upstream refused credentials: {0}")]
    Unauthorized(String),

    /// Any other unsuccessful response.
    #[error("upstream responded {status}: {message}")]
    Status {
        /// Response status.
        status: StatusCode,
        /// Response body, if it was text.
        message: String,
    },

    /// Connection or protocol failure.
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The upstream returned something which is not a usable manifest.
    #[error("upstream manifest is unusable: {0}")]
    Manifest(String),

    /// Configured upstream URL cannot address the request.
    #[error("invalid upstream url: {0}")]
    Url(#[from] url::ParseError),
}

impl RemoteError {
    /// Classify an unsuccessful response status.
    pub fn from_status(status: StatusCode, what: &str, message: String) -> Self {
        match status {
            StatusCode::NOT_FOUND => RemoteError::NotFound(what.to_owned()),
            StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                RemoteError::Unauthorized(what.to_owned())
            }
            status => RemoteError::Status { status, message },
        }
    }
}

/// A manifest fetched from upstream.
#[derive(Debug, Clone)]
pub struct RemoteManifest {
    /// `Content-Type` of the response, possibly empty.
    pub media_type: String,
    /// `Docker-Content-Digest` of the response, if sent.
    pub digest: Option<Digest>,
    /// Raw manifest bytes.
    pub payload: Bytes,
}

/// What a manifest `HEAD` reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestHead {
    /// `Docker-Content-Digest`, if sent.
    pub digest: Option<Digest>,
    /// `Content-Type`, possibly empty.
    pub media_type: String,
    /// `Content-Length`, if sent.
    pub size: Option<u64>,
}

/// A blob stream from upstream.
pub struct RemoteBlob {
    /// `Content-Length`, if sent.
    pub size: Option<u64>,
    /// The blob bytes.
    pub reader: BlobReader,
}

impl fmt::Debug for RemoteBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteBlob")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Read access to an upstream registry. Image names are as seen by our clients;
/// implementations apply any upstream naming rules.
#[async_trait::async_trait]
pub trait RemoteRegistry: fmt::Debug + Send + Sync {
    /// Check a manifest exists without fetching it.
    async fn manifest_exist(&self, image: &str, reference: &str) -> Result<ManifestHead, RemoteError>;

    /// Fetch a manifest by tag or digest.
    async fn manifest(&self, image: &str, reference: &str) -> Result<RemoteManifest, RemoteError>;

    /// Stream a blob.
    async fn blob_reader(&self, image: &str, digest: &Digest) -> Result<RemoteBlob, RemoteError>;

    /// Tags of an image.
    async fn list_tags(&self, image: &str) -> Result<Vec<String>, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(RemoteRegistry);

    #[test]
    fn statuses_are_classified() {
        assert!(matches!(
            RemoteError::from_status(StatusCode::NOT_FOUND, "app:latest", String::new()),
            RemoteError::NotFound(what) if what == "app:latest"
        ));
        assert!(matches!(
            RemoteError::from_status(StatusCode::TOO_MANY_REQUESTS, "x", String::new()),
            RemoteError::RateLimited
        ));
        assert!(matches!(
            RemoteError::from_status(StatusCode::FORBIDDEN, "x", String::new()),
            RemoteError::Unauthorized(_)
        ));
        assert!(matches!(
            RemoteError::from_status(StatusCode::BAD_GATEWAY, "x", "oops".into()),
            RemoteError::Status { status: StatusCode::BAD_GATEWAY, .. }
        ));
    }
}
