use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which storage provider the daemon talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Amazon S3.
    Aws,
    /// Google Cloud Storage (XML API).
    Gcs,
}

/// Daemon configuration.
///
/// Loaded once at startup and shared read-only with every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bucket to mount.
    pub bucket_name: String,
    /// Storage provider.
    pub provider: ProviderKind,
    /// Provider endpoint host, e.g. `s3.amazonaws.com`.
    pub service_endpoint: String,
    /// Use https when talking to the endpoint.
    pub use_ssl: bool,
    /// Path to the credentials file (must be mode 0600).
    pub secret_file: String,

    /// Mode bits for objects that carry no mode header.
    pub default_mode: u32,
    /// Uid for objects that carry no uid header; `u32::MAX` means the process euid.
    pub default_uid: u32,
    /// Gid for objects that carry no gid header; `u32::MAX` means the process egid.
    pub default_gid: u32,
    /// Content type assigned to newly created files.
    pub default_content_type: String,

    /// Seconds a cached object stays valid.
    pub cache_expiry_in_s: u64,
    /// Bounded object-cache capacity.
    pub cache_capacity: usize,

    /// Transfer retry budget per request.
    pub max_transfer_retries: u32,
    /// Per-attempt request deadline, seconds.
    pub request_timeout_in_s: u64,

    /// Threshold and chunk size for ranged downloads.
    pub download_chunk_size: u64,
    /// Threshold and part size for multipart uploads.
    pub upload_chunk_size: u64,

    /// Foreground worker count.
    pub fg_worker_count: usize,
    /// Background worker count.
    pub bg_worker_count: usize,

    /// Encrypt newly created files.
    pub use_encryption: bool,
    /// Path to the volume password file (must be mode 0600); empty disables encryption.
    pub volume_password_file: String,

    /// Log raw request/response traffic at debug level.
    pub verbose_requests: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket_name: String::new(),
            provider: ProviderKind::Aws,
            service_endpoint: "s3.amazonaws.com".to_string(),
            use_ssl: true,
            secret_file: String::new(),
            default_mode: 0o644,
            default_uid: u32::MAX,
            default_gid: u32::MAX,
            default_content_type: "binary/octet-stream".to_string(),
            cache_expiry_in_s: 30,
            cache_capacity: 1000,
            max_transfer_retries: 5,
            request_timeout_in_s: 30,
            download_chunk_size: 128 * 1024 * 1024, // 128 MiB
            upload_chunk_size: 128 * 1024 * 1024,   // 128 MiB
            fg_worker_count: 8,
            bg_worker_count: 8,
            use_encryption: false,
            volume_password_file: String::new(),
            verbose_requests: false,
        }
    }
}

impl Config {
    /// Loads configuration from a JSON file, filling unset fields with defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&data)
            .map_err(|e| Error::InvalidArgument(format!("bad config file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_name.is_empty() {
            return Err(Error::InvalidArgument("bucket_name is required".to_string()));
        }
        if self.max_transfer_retries == 0 {
            return Err(Error::InvalidArgument(
                "max_transfer_retries must be at least 1".to_string(),
            ));
        }
        if self.fg_worker_count == 0 || self.bg_worker_count == 0 {
            return Err(Error::InvalidArgument(
                "worker counts must be at least 1".to_string(),
            ));
        }
        if self.use_encryption && self.volume_password_file.is_empty() {
            return Err(Error::InvalidArgument(
                "use_encryption requires volume_password_file".to_string(),
            ));
        }
        Ok(())
    }

    /// Default uid with the euid fallback applied.
    pub fn resolved_uid(&self) -> u32 {
        if self.default_uid == u32::MAX {
            // SAFETY: geteuid has no failure modes.
            unsafe { libc::geteuid() }
        } else {
            self.default_uid
        }
    }

    /// Default gid with the egid fallback applied.
    pub fn resolved_gid(&self) -> u32 {
        if self.default_gid == u32::MAX {
            // SAFETY: getegid has no failure modes.
            unsafe { libc::getegid() }
        } else {
            self.default_gid
        }
    }
}
