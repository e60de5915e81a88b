//! Splitting `/v2/<name>/...` paths.
//!
//! Repository names may themselves contain `manifests` or `blobs` components,
//! so the endpoint is found at the last marker in the path.

/// A distribution endpoint with its repository name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Endpoint<'p> {
    Manifest { name: &'p str, reference: &'p str },
    Blob { name: &'p str, digest: &'p str },
    StartUpload { name: &'p str },
    Upload { name: &'p str, uuid: &'p str },
    Tags { name: &'p str },
    Referrers { name: &'p str, digest: &'p str },
}

const UPLOADS: &str = "/blobs/uploads/";
const BLOBS: &str = "/blobs/";
const MANIFESTS: &str = "/manifests/";
const REFERRERS: &str = "/referrers/";
const TAGS: &str = "/tags/list";

/// Parse the part of the path after `/v2/`.
pub(crate) fn parse(path: &str) -> Option<Endpoint<'_>> {
    let path = path.trim_start_matches('/');
    if let Some(name) = path.strip_suffix(UPLOADS.trim_end_matches('/')) {
        return (!name.is_empty()).then_some(Endpoint::StartUpload { name });
    }

    let mut best: Option<(usize, &str)> = None;
    for marker in [UPLOADS, BLOBS, MANIFESTS, REFERRERS] {
        if let Some(index) = path.rfind(marker) {
            if best.is_none_or(|(found, _)| index > found) {
                best = Some((index, marker));
            }
        }
    }
    if let Some(name) = path.strip_suffix(TAGS) {
        if best.is_none_or(|(found, _)| name.len() > found) {
            return (!name.is_empty()).then_some(Endpoint::Tags { name });
        }
    }

    let (index, marker) = best?;
    let name = &path[..index];
    let rest = &path[index + marker.len()..];
    if name.is_empty() {
        return None;
    }

    let endpoint = match marker {
        UPLOADS if rest.is_empty() => Endpoint::StartUpload { name },
        UPLOADS => Endpoint::Upload { name, uuid: rest },
        _ if rest.is_empty() || rest.contains('/') => return None,
        BLOBS => Endpoint::Blob { name, digest: rest },
        MANIFESTS => Endpoint::Manifest {
            name,
            reference: rest,
        },
        REFERRERS => Endpoint::Referrers { name, digest: rest },
        _ => return None,
    };
    Some(endpoint)
}
