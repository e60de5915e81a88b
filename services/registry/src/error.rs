//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::digest::{Digest, DigestError};
use crate::manifest::ManifestError;
use crate::remote::RemoteError;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Distribution API error codes, as sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ErrorCode {
    Unknown,
    Unsupported,
    Denied,
    Unavailable,
    TooManyRequests,
    DigestInvalid,
    SizeInvalid,
    RangeInvalid,
    NameInvalid,
    TagInvalid,
    NameUnknown,
    ManifestUnknown,
    ManifestReferenced,
    ManifestInvalid,
    ManifestBlobUnknown,
    BlobUnknown,
    BlobUploadUnknown,
    BlobUploadInvalid,
}

impl ErrorCode {
    /// The code string used in the JSON error body.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unknown => "UNKNOWN",
            ErrorCode::Unsupported => "UNSUPPORTED",
            ErrorCode::Denied => "DENIED",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::TooManyRequests => "TOOMANYREQUESTS",
            ErrorCode::DigestInvalid => "DIGEST_INVALID",
            ErrorCode::SizeInvalid => "SIZE_INVALID",
            ErrorCode::RangeInvalid => "RANGE_INVALID",
            ErrorCode::NameInvalid => "NAME_INVALID",
            ErrorCode::TagInvalid => "TAG_INVALID",
            ErrorCode::NameUnknown => "NAME_UNKNOWN",
            ErrorCode::ManifestUnknown => "MANIFEST_UNKNOWN",
            ErrorCode::ManifestReferenced => "MANIFEST_REFERENCED",
            ErrorCode::ManifestInvalid => "MANIFEST_INVALID",
            ErrorCode::ManifestBlobUnknown => "MANIFEST_BLOB_UNKNOWN",
            ErrorCode::BlobUnknown => "BLOB_UNKNOWN",
            ErrorCode::BlobUploadUnknown => "BLOB_UPLOAD_UNKNOWN",
            ErrorCode::BlobUploadInvalid => "BLOB_UPLOAD_INVALID",
        }
    }

    /// The HTTP status each code is sent with.
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::Unsupported => StatusCode::METHOD_NOT_ALLOWED,
            ErrorCode::Denied => StatusCode::FORBIDDEN,
            ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::DigestInvalid
            | ErrorCode::SizeInvalid
            | ErrorCode::NameInvalid
            | ErrorCode::TagInvalid
            | ErrorCode::ManifestInvalid
            | ErrorCode::ManifestBlobUnknown => StatusCode::BAD_REQUEST,
            ErrorCode::RangeInvalid => StatusCode::RANGE_NOT_SATISFIABLE,
            ErrorCode::NameUnknown
            | ErrorCode::ManifestUnknown
            | ErrorCode::BlobUnknown
            | ErrorCode::BlobUploadUnknown
            | ErrorCode::BlobUploadInvalid => StatusCode::NOT_FOUND,
            ErrorCode::ManifestReferenced => StatusCode::CONFLICT,
        }
    }
}

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Blob not found, or not linked into the repository.
    #[error("blob unknown to registry: {0}")]
    BlobUnknown(Digest),

    /// Upload state does not belong to this upload.
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    /// No such upload session.
    #[error("blob upload unknown: {0}")]
    BlobUploadUnknown(String),

    /// Missing, malformed or mismatched digest.
    #[error("provided digest did not match uploaded content: {0}")]
    DigestInvalid(String),

    /// A manifest references a blob the repository does not have.
    #[error("blob unknown to registry: {0}")]
    ManifestBlobUnknown(Digest),

    /// A manifest failed to parse or validate.
    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    /// No manifest with this digest.
    #[error("manifest unknown: {0}")]
    ManifestUnknown(String),

    /// No tag with this name.
    #[error("manifest tagged {0:?} is unknown")]
    TagUnknown(String),

    /// A list still references the manifest.
    #[error("manifest {0} is referenced by a manifest list")]
    ManifestReferencedInList(Digest),

    /// A tag still points at the manifest.
    #[error("manifest {0} is still tagged")]
    ManifestTagged(Digest),

    /// Repository name is malformed.
    #[error("invalid repository name: {0}")]
    NameInvalid(String),

    /// Repository or registry does not exist.
    #[error("repository name not known to registry: {0}")]
    NameUnknown(String),

    /// Content length does not match the chunk range.
    #[error("provided length did not match content length: {0}")]
    SizeInvalid(String),

    /// Chunk range is malformed or out of order.
    #[error("requested range not satisfiable: {0}")]
    RangeInvalid(String),

    /// Tag is malformed, or a manifest was pushed without a reference.
    #[error("manifest tag invalid: {0}")]
    TagInvalid(String),

    /// The operation is disabled or not offered here.
    #[error("the operation is unsupported: {0}")]
    Unsupported(&'static str),

    /// The session may not perform this operation.
    #[error("requested access to the resource is denied")]
    Denied,

    /// A lock could not be acquired in time; retry later.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The upstream registry rate limited us.
    #[error("too many requests")]
    TooManyRequests,

    /// Storage backend error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// Upstream registry error
    #[error("upstream registry: {0}")]
    Remote(RemoteError),

    /// Anything else which is our fault.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ManifestError> for RegistryError {
    fn from(error: ManifestError) -> Self {
        RegistryError::ManifestInvalid(error.to_string())
    }
}

impl From<DigestError> for RegistryError {
    fn from(error: DigestError) -> Self {
        RegistryError::DigestInvalid(error.to_string())
    }
}

impl From<RemoteError> for RegistryError {
    fn from(error: RemoteError) -> Self {
        match error {
            RemoteError::RateLimited => RegistryError::TooManyRequests,
            other => RegistryError::Remote(other),
        }
    }
}

impl RegistryError {
    /// The distribution error code for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RegistryError::BlobUnknown(_) => ErrorCode::BlobUnknown,
            RegistryError::BlobUploadInvalid(_) => ErrorCode::BlobUploadInvalid,
            RegistryError::BlobUploadUnknown(_) => ErrorCode::BlobUploadUnknown,
            RegistryError::DigestInvalid(_) => ErrorCode::DigestInvalid,
            RegistryError::ManifestBlobUnknown(_) => ErrorCode::ManifestBlobUnknown,
            RegistryError::ManifestInvalid(_) => ErrorCode::ManifestInvalid,
            RegistryError::ManifestUnknown(_) | RegistryError::TagUnknown(_) => {
                ErrorCode::ManifestUnknown
            }
            RegistryError::ManifestReferencedInList(_) | RegistryError::ManifestTagged(_) => {
                ErrorCode::ManifestReferenced
            }
            RegistryError::NameInvalid(_) => ErrorCode::NameInvalid,
            RegistryError::NameUnknown(_) => ErrorCode::NameUnknown,
            RegistryError::SizeInvalid(_) => ErrorCode::SizeInvalid,
            RegistryError::RangeInvalid(_) => ErrorCode::RangeInvalid,
            RegistryError::TagInvalid(_) => ErrorCode::TagInvalid,
            RegistryError::Unsupported(_) => ErrorCode::Unsupported,
            RegistryError::Denied => ErrorCode::Denied,
            RegistryError::Unavailable(_) => ErrorCode::Unavailable,
            RegistryError::TooManyRequests => ErrorCode::TooManyRequests,
            RegistryError::Remote(RemoteError::NotFound(_)) => ErrorCode::ManifestUnknown,
            RegistryError::Remote(RemoteError::Unauthorized(_)) => ErrorCode::Denied,
            RegistryError::Remote(_) => ErrorCode::Unavailable,
            RegistryError::Storage(_) | RegistryError::Internal(_) => ErrorCode::Unknown,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        self.error_code().status()
    }

    /// Whether this is a not-found error of any kind.
    pub fn is_not_found(&self) -> bool {
        self.status_code() == StatusCode::NOT_FOUND
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let code = self.error_code();
        let status = code.status();

        let message = if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
            match code {
                ErrorCode::Unavailable => "service unavailable, retry later".to_owned(),
                _ => "internal server error".to_owned(),
            }
        } else {
            self.to_string()
        };

        let body = ErrorResponse {
            errors: vec![ErrorDetail {
                code: code.as_str(),
                message,
            }],
        };

        (status, axum::Json(body)).into_response()
    }
}
