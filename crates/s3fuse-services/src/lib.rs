#![warn(missing_docs)]

//! Provider adapters: everything about the wire that differs between AWS S3
//! and Google Cloud Storage lives here.

/// Access key / secret key pairs.
pub mod credentials;
/// The provider adapter consumed by the request layer.
pub mod service;

pub use credentials::Credentials;
pub use service::Service;
