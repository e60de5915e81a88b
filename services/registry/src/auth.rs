//! Authorization hook.
//!
//! The registry asks an [`Authorizer`] before every operation. Deployments plug
//! in their own policy; [`AllowAll`] is the default.

use std::fmt;

use crate::info::Session;

/// What a request wants to do to a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Read manifests, blobs and tags.
    Pull,
    /// Upload blobs and manifests.
    Push,
    /// Delete manifests, tags and blob links.
    Delete,
}

/// Decides whether a session may act on a resource (`<root>/<registry>/<image>`).
pub trait Authorizer: fmt::Debug + Send + Sync {
    /// Return true to allow the operation.
    fn check(&self, session: &Session, resource: &str, permission: Permission) -> bool;
}

/// Allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn check(&self, _session: &Session, _resource: &str, _permission: Permission) -> bool {
        true
    }
}
