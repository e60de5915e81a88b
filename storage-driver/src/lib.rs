//! # Storage drivers
//!
//! The [`Driver`] trait implemented by every storage backend, and the
//! [`StorageError`] type they share.

mod driver;
mod error;

pub use driver::not_found;
pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Reader;
pub use driver::Writer;
pub use error::StorageError;
pub use error::StorageErrorBuilder;
pub use error::StorageErrorKind;
