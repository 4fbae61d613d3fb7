#![warn(missing_docs)]

//! s3fuse base layer: HTTP request execution, worker pools, configuration.

/// Daemon configuration, tunables, defaults.
pub mod config;
/// Error type and POSIX errno mapping.
pub mod error;
/// Reusable HTTP request handle with retry loop and provider hook.
pub mod request;
/// Worker pools (foreground/background) and the pooled request handles they lend out.
pub mod pool;
/// Per-tag request statistics registry.
pub mod statistics;
/// HTTP timestamp formatting and parsing.
pub mod timer;
/// Percent-encoding for object keys.
pub mod url;
/// Minimal XML scanning and building, enough for the S3 API surface.
pub mod xml;

pub use config::Config;
pub use error::{Error, Result};
pub use request::{HttpMethod, Request, RequestHook};
