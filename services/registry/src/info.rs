//! Request coordinates: which repository, which reference, and who is asking.

use std::fmt;

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};

/// The caller's identity, captured once per request.
///
/// Background tasks receive a clone, so they act as the request that started them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Authenticated principal, if any.
    pub subject: Option<String>,
}

impl Session {
    /// A session with no principal.
    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// Repository coordinates for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryInfo {
    /// Tenant which owns the blobs.
    pub root: String,
    /// Registry name within the root.
    pub registry: String,
    /// Image name, possibly with `/` separators.
    pub image: String,
    /// Tag, when the reference was a tag.
    pub tag: Option<String>,
    /// Digest, when the reference was a digest (or once a tag was resolved).
    pub digest: Option<Digest>,
    /// Caller identity.
    pub session: Session,
}

impl RegistryInfo {
    /// Validated coordinates with no reference.
    pub fn new(
        root: impl Into<String>,
        registry: impl Into<String>,
        image: impl Into<String>,
    ) -> RegistryResult<Self> {
        let info = Self {
            root: root.into(),
            registry: registry.into(),
            image: image.into(),
            tag: None,
            digest: None,
            session: Session::anonymous(),
        };

        let valid = is_valid_component(&info.root)
            && is_valid_component(&info.registry)
            && !info.image.is_empty()
            && info.image.split('/').all(is_valid_component);
        if !valid {
            return Err(RegistryError::NameInvalid(info.repository()));
        }
        Ok(info)
    }

    /// Split `<root>/<registry>/<image...>`.
    pub fn from_name(name: &str) -> RegistryResult<Self> {
        let mut parts = name.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(root), Some(registry), Some(image)) => Self::new(root, registry, image),
            _ => Err(RegistryError::NameInvalid(name.to_owned())),
        }
    }

    /// Attach a reference: a digest if it contains `:`, a tag otherwise.
    pub fn with_reference(self, reference: &str) -> RegistryResult<Self> {
        if reference.contains(':') {
            Ok(self.with_digest(reference.parse()?))
        } else {
            self.with_tag(reference)
        }
    }

    /// Attach a validated tag.
    pub fn with_tag(mut self, tag: &str) -> RegistryResult<Self> {
        if !is_valid_tag(tag) {
            return Err(RegistryError::TagInvalid(tag.to_owned()));
        }
        self.tag = Some(tag.to_owned());
        Ok(self)
    }

    /// Attach a digest.
    pub fn with_digest(mut self, digest: Digest) -> Self {
        self.digest = Some(digest);
        self
    }

    /// Attach the caller's session.
    pub fn with_session(mut self, session: Session) -> Self {
        self.session = session;
        self
    }

    /// `<root>/<registry>/<image>`
    pub fn repository(&self) -> String {
        format!("{}/{}/{}", self.root, self.registry, self.image)
    }

    /// The reference as the client wrote it: the tag if there is one, else the digest.
    pub fn reference(&self) -> String {
        match (&self.tag, &self.digest) {
            (Some(tag), _) => tag.clone(),
            (None, Some(digest)) => digest.to_string(),
            (None, None) => String::new(),
        }
    }

    /// Whether the request addressed content by digest.
    pub fn is_digest_reference(&self) -> bool {
        self.tag.is_none() && self.digest.is_some()
    }
}

impl fmt::Display for RegistryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repository())?;
        match (&self.tag, &self.digest) {
            (Some(tag), _) => write!(f, ":{tag}"),
            (None, Some(digest)) => write!(f, "@{digest}"),
            (None, None) => Ok(()),
        }
    }
}

/// `[a-z0-9]+` runs joined by `.`, `_`, `__` or any number of `-`.
fn is_valid_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    if bytes.is_empty() || !is_alnum(bytes[0]) || !is_alnum(bytes[bytes.len() - 1]) {
        return false;
    }

    let mut separator = String::new();
    for &b in bytes {
        if is_alnum(b) {
            if !(separator.is_empty()
                || separator == "."
                || separator == "_"
                || separator == "__"
                || separator.bytes().all(|c| c == b'-'))
            {
                return false;
            }
            separator.clear();
        } else if matches!(b, b'.' | b'_' | b'-') {
            separator.push(b as char);
        } else {
            return false;
        }
    }
    true
}

fn is_alnum(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit()
}

/// `[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`
fn is_valid_tag(tag: &str) -> bool {
    let bytes = tag.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 128
        && (bytes[0].is_ascii_alphanumeric() || bytes[0] == b'_')
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}
