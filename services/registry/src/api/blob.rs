//! Blob and upload endpoints.

use std::collections::HashMap;

use axum::extract::Request;
use axum::http::{HeaderMap, Method, header};
use axum::response::Response;

use super::{Registry, body_reader, respond};
use crate::auth::Permission;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::info::RegistryInfo;
use crate::local::{ChunkHeaders, Mount};

/// `/v2/<name>/blobs/<digest>`
pub(super) async fn blob(
    registry: &Registry,
    info: RegistryInfo,
    digest: &str,
    method: &Method,
) -> RegistryResult<Response> {
    let digest: Digest = digest.parse()?;
    let upstream = registry.is_upstream(&info).await?;

    match *method {
        Method::GET => {
            registry.authorize(&info, Permission::Pull)?;
            if upstream {
                respond(registry.proxy.get_blob(&info, &digest).await)
            } else {
                respond(registry.local.get_blob(&info, &digest).await)
            }
        }
        Method::HEAD => {
            registry.authorize(&info, Permission::Pull)?;
            if upstream {
                respond(registry.proxy.head_blob(&info, &digest).await)
            } else {
                respond(registry.local.head_blob(&info, &digest).await)
            }
        }
        Method::DELETE => {
            registry.authorize(&info, Permission::Delete)?;
            if upstream {
                return Err(RegistryError::Unsupported("deleting from a pull-through cache"));
            }
            respond(registry.local.delete_blob(&info, &digest).await)
        }
        _ => Err(RegistryError::Unsupported("method not allowed")),
    }
}

fn push_target(registry: &Registry, info: &RegistryInfo, upstream: bool) -> RegistryResult<()> {
    registry.authorize(info, Permission::Push)?;
    if upstream {
        return Err(RegistryError::Unsupported("pushing to a pull-through cache"));
    }
    Ok(())
}

fn digest_param(params: &HashMap<String, String>) -> RegistryResult<Option<Digest>> {
    params
        .get("digest")
        .map(|digest| digest.parse())
        .transpose()
        .map_err(RegistryError::from)
}

/// `POST /v2/<name>/blobs/uploads/`
pub(super) async fn start_upload(
    registry: &Registry,
    info: RegistryInfo,
    params: &HashMap<String, String>,
    request: Request,
) -> RegistryResult<Response> {
    push_target(registry, &info, registry.is_upstream(&info).await?)?;

    let mount = match (params.get("mount"), params.get("from")) {
        (Some(digest), Some(from)) => Some(Mount {
            digest: digest.parse()?,
            from: from.clone(),
        }),
        _ => None,
    };
    let digest = digest_param(params)?;

    let mut body = body_reader(request.into_body());
    respond(
        registry
            .local
            .init_blob_upload(&info, mount, digest, &mut body)
            .await,
    )
}

fn chunk_headers(headers: &HeaderMap) -> ChunkHeaders {
    let text = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    };
    ChunkHeaders {
        content_type: text(header::CONTENT_TYPE),
        content_range: text(header::CONTENT_RANGE),
        content_length: text(header::CONTENT_LENGTH).and_then(|length| length.parse().ok()),
    }
}

/// `/v2/<name>/blobs/uploads/<uuid>?_state=<token>`
pub(super) async fn upload(
    registry: &Registry,
    info: RegistryInfo,
    uuid: &str,
    params: &HashMap<String, String>,
    request: Request,
) -> RegistryResult<Response> {
    push_target(registry, &info, registry.is_upstream(&info).await?)?;
    let token = params
        .get("_state")
        .ok_or_else(|| RegistryError::BlobUploadInvalid("missing upload state".into()))?;
    let method = request.method().clone();
    let chunk = chunk_headers(request.headers());
    let local = &registry.local;

    match method {
        Method::GET => respond(local.get_blob_upload_status(&info, uuid, token).await),
        Method::PATCH => {
            let mut body = body_reader(request.into_body());
            respond(
                local
                    .push_blob_chunk(&info, uuid, token, &chunk, &mut body)
                    .await,
            )
        }
        Method::PUT => {
            let digest = digest_param(params)?;
            let mut body = body_reader(request.into_body());
            respond(
                local
                    .push_blob(&info, uuid, token, digest, &chunk, &mut body)
                    .await,
            )
        }
        Method::DELETE => respond(local.cancel_blob_upload(&info, uuid, token).await),
        _ => Err(RegistryError::Unsupported("method not allowed")),
    }
}
