use std::error::Error as StdError;
use std::fmt;
use std::io;

use tracing_error::SpanTrace;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// What went wrong with a storage operation, independent of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageErrorKind {
    /// The object or bucket does not exist.
    NotFound,

    /// The backend refused access to the object.
    PermissionDenied,

    /// Reading or writing bytes failed.
    Io,

    /// The object path is not usable by this backend.
    InvalidPath,

    /// Anything else.
    Other,
}

impl From<io::ErrorKind> for StorageErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            io::ErrorKind::InvalidInput => StorageErrorKind::InvalidPath,
            _ => StorageErrorKind::Io,
        }
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageErrorKind::NotFound => "not found",
            StorageErrorKind::PermissionDenied => "permission denied",
            StorageErrorKind::Io => "i/o failure",
            StorageErrorKind::InvalidPath => "invalid path",
            StorageErrorKind::Other => "failure",
        })
    }
}

/// An error from a storage driver, with the object it concerned.
///
/// ```rust
/// use storage_driver::{StorageError, StorageErrorKind};
///
/// let error = StorageError::builder(
///     "memory",
///     StorageErrorKind::NotFound,
///     std::io::Error::new(std::io::ErrorKind::NotFound, "no such object"),
/// )
/// .bucket("registry")
/// .path("roots/acme/blobs/sha256/ab/abcd/data")
/// .build();
///
/// assert!(error.is_not_found());
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,
    engine: &'static str,
    object: Option<String>,
    context: Option<String>,
    source: BoxError,
    spans: SpanTrace,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// An error without an object attached.
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::builder(engine, kind, error).build()
    }

    /// An I/O failure, classified by its [`io::ErrorKind`].
    pub fn io(engine: &'static str, error: io::Error) -> StorageErrorBuilder {
        Self::builder(engine, error.kind().into(), error)
    }

    /// Start an error which names its bucket and path.
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<BoxError>,
    {
        StorageErrorBuilder {
            engine,
            kind,
            source: error.into(),
            bucket: None,
            path: None,
            context: None,
        }
    }

    /// For `.map_err()`.
    pub fn with<E>(engine: &'static str, kind: StorageErrorKind) -> impl FnOnce(E) -> StorageError
    where
        E: Into<BoxError>,
    {
        move |error: E| StorageError::new(engine, kind, error)
    }

    /// The error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Shorthand for `kind() == NotFound`.
    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    /// `bucket/path` of the object involved, if known.
    pub fn object(&self) -> Option<&str> {
        self.object.as_deref()
    }

    /// Tracing spans active when the error was built.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.spans
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.engine, self.kind)?;
        if let Some(object) = &self.object {
            write!(f, " at {object}")?;
        }
        if let Some(context) = &self.context {
            write!(f, " during {context}")?;
        }
        write!(f, ": {}", self.source)
    }
}

/// Attaches the object and operation to a [`StorageError`].
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    source: BoxError,
    bucket: Option<String>,
    path: Option<String>,
    context: Option<String>,
}

impl StorageErrorBuilder {
    /// Set the bucket name.
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the object path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Name the operation which failed.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Finish the error, capturing the active spans.
    pub fn build(self) -> StorageError {
        let object = match (self.bucket, self.path) {
            (Some(bucket), Some(path)) => Some(format!("{bucket}/{path}")),
            (bucket, path) => bucket.or(path),
        };
        StorageError {
            kind: self.kind,
            engine: self.engine,
            object,
            context: self.context,
            source: self.source,
            spans: SpanTrace::capture(),
        }
    }
}
