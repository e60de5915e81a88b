//! Manifest, tag and referrer endpoints.

use std::collections::HashMap;

use axum::extract::Request;
use axum::http::{Method, header};
use axum::response::{IntoResponse, Response};

use super::{Registry, respond};
use crate::auth::Permission;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::info::RegistryInfo;
use crate::local::ManifestRequest;

/// Manifests larger than this are refused.
const MAX_MANIFEST_SIZE: usize = 4 * 1024 * 1024;

/// `/v2/<name>/manifests/<reference>`
pub(super) async fn manifest(
    registry: &Registry,
    info: RegistryInfo,
    request: Request,
) -> RegistryResult<Response> {
    let method = request.method().clone();
    let negotiation = ManifestRequest::from_headers(request.headers());

    match method {
        Method::GET | Method::HEAD => {
            registry.authorize(&info, Permission::Pull)?;
            let head = method == Method::HEAD;
            let response = if registry.is_upstream(&info).await? {
                if head {
                    registry.proxy.head_manifest(&info, &negotiation).await
                } else {
                    registry.proxy.get_manifest(&info, &negotiation).await
                }
            } else {
                let response = registry.local.pull_manifest(&info, &negotiation).await;
                if head {
                    response.map(|r| r.into_head())
                } else {
                    response
                }
            };
            respond(response)
        }
        Method::PUT => {
            registry.authorize(&info, Permission::Push)?;
            if registry.is_upstream(&info).await? {
                return Err(RegistryError::Unsupported("pushing to a pull-through cache"));
            }
            let content_type = request
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_owned();
            let payload = axum::body::to_bytes(request.into_body(), MAX_MANIFEST_SIZE)
                .await
                .map_err(|error| RegistryError::ManifestInvalid(format!("reading manifest: {error}")))?;
            respond(registry.local.put_manifest(&info, &content_type, payload).await)
        }
        Method::DELETE => {
            registry.authorize(&info, Permission::Delete)?;
            if registry.is_upstream(&info).await? {
                return Err(RegistryError::Unsupported("deleting from a pull-through cache"));
            }
            respond(registry.local.delete_manifest(&info).await)
        }
        _ => Err(RegistryError::Unsupported("method not allowed")),
    }
}

/// `GET /v2/<name>/tags/list?n=<n>&last=<last>`
pub(super) async fn tags(
    registry: &Registry,
    info: RegistryInfo,
    params: &HashMap<String, String>,
) -> RegistryResult<Response> {
    registry.authorize(&info, Permission::Pull)?;
    let n = params.get("n").and_then(|n| n.parse().ok());
    let last = params.get("last").map(String::as_str);

    let tags = if registry.is_upstream(&info).await? {
        registry.proxy.list_tags(&info, n, last).await?
    } else {
        registry.local.list_tags(&info, n, last).await?
    };
    Ok(tags.into_response())
}

/// `GET /v2/<name>/referrers/<digest>?artifactType=<type>`
pub(super) async fn referrers(
    registry: &Registry,
    info: RegistryInfo,
    digest: &str,
    params: &HashMap<String, String>,
) -> RegistryResult<Response> {
    registry.authorize(&info, Permission::Pull)?;
    let subject: Digest = digest.parse()?;
    let artifact_type = params.get("artifactType").map(String::as_str);
    respond(
        registry
            .local
            .list_referrers(&info, &subject, artifact_type)
            .await,
    )
}
