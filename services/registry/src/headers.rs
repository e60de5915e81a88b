//! Response headers shared by the registry endpoints.

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

/// `Docker-Content-Digest`
pub const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");
/// `Docker-Upload-UUID`
pub const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");
/// `OCI-Subject`
pub const OCI_SUBJECT: HeaderName = HeaderName::from_static("oci-subject");
/// `OCI-Filters-Applied`
pub const OCI_FILTERS_APPLIED: HeaderName = HeaderName::from_static("oci-filters-applied");
/// `Docker-Distribution-API-Version`
pub const DOCKER_DISTRIBUTION_API_VERSION: HeaderName =
    HeaderName::from_static("docker-distribution-api-version");

/// A status plus headers, for responses without a body.
#[derive(Debug, Clone)]
pub struct ResponseHeaders {
    /// Response status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
}

impl ResponseHeaders {
    /// Empty headers with the given status.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }

    /// Set a header. Values which are not valid header text are logged and dropped.
    pub fn insert(&mut self, name: HeaderName, value: impl ToString) -> &mut Self {
        let value = value.to_string();
        match HeaderValue::try_from(value) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(error) => tracing::warn!(header = %name, %error, "dropping invalid header value"),
        }
        self
    }

    /// Look up a header as text.
    pub fn get(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl Default for ResponseHeaders {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

impl ResponseHeaders {
    /// Finish a response with `body`, keeping this status.
    pub fn with_body(self, body: impl IntoResponse) -> Response {
        (self.status, self.headers, body).into_response()
    }
}

impl IntoResponse for ResponseHeaders {
    fn into_response(self) -> Response {
        (self.status, self.headers).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_values_are_skipped() {
        let mut headers = ResponseHeaders::new(StatusCode::CREATED);
        headers
            .insert(DOCKER_UPLOAD_UUID, "abc")
            .insert(OCI_SUBJECT, "bad\nvalue");
        assert_eq!(headers.get(&DOCKER_UPLOAD_UUID), Some("abc"));
        assert!(headers.get(&OCI_SUBJECT).is_none());
    }

    #[test]
    fn body_keeps_status_and_headers() {
        let mut headers = ResponseHeaders::new(StatusCode::PARTIAL_CONTENT);
        headers.insert(DOCKER_UPLOAD_UUID, "abc");
        let response = headers.with_body("partial");
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[&DOCKER_UPLOAD_UUID], "abc");
    }
}
