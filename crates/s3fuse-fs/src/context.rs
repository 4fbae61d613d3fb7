use std::path::Path;
use std::sync::Arc;

use s3fuse_base::config::Config;
use s3fuse_base::error::Result;
use s3fuse_crypto::{private_file, VolumeKey};
use s3fuse_services::Service;

/// Read-only state shared by every task: configuration, the provider
/// adapter, and the volume key when encryption is enabled.
///
/// Loaded once at startup; nothing here mutates afterwards, so tasks carry a
/// cheap `Arc` instead of reaching for globals.
pub struct FsContext {
    /// Daemon configuration.
    pub config: Arc<Config>,
    /// Provider adapter.
    pub service: Arc<Service>,
    /// Volume key; present only when encryption is enabled.
    pub volume_key: Option<VolumeKey>,
}

impl FsContext {
    /// Builds the context, loading credentials and (optionally) deriving the
    /// volume key from the password file.
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let service = Arc::new(Service::new(&config)?);
        let volume_key = Self::load_volume_key(&config)?;

        Ok(Self {
            config,
            service,
            volume_key,
        })
    }

    /// Builds a context from parts; used where credentials are supplied
    /// directly rather than read from the secret file.
    pub fn with_service(
        config: Arc<Config>,
        service: Arc<Service>,
        volume_key: Option<VolumeKey>,
    ) -> Self {
        Self {
            config,
            service,
            volume_key,
        }
    }

    fn load_volume_key(config: &Config) -> Result<Option<VolumeKey>> {
        if !config.use_encryption {
            return Ok(None);
        }

        let password = private_file::read(Path::new(&config.volume_password_file))?;
        // the bucket name salts the derivation, so one password file can
        // serve several volumes without sharing keys
        Ok(Some(VolumeKey::derive(
            password.trim_end(),
            config.bucket_name.as_bytes(),
        )))
    }
}

/// Context against a never-contacted endpoint, shared by unit tests across
/// the crate.
#[cfg(test)]
pub(crate) fn test_context() -> Arc<FsContext> {
    test_context_with(|_| {})
}

/// Like [`test_context`], with a configuration tweak applied first.
#[cfg(test)]
pub(crate) fn test_context_with(tweak: impl FnOnce(&mut Config)) -> Arc<FsContext> {
    use s3fuse_services::Credentials;

    let mut config = Config {
        bucket_name: "test-bucket".to_string(),
        ..Config::default()
    };
    tweak(&mut config);
    let config = Arc::new(config);

    let service = Arc::new(Service::with_credentials(
        &config,
        Credentials {
            key: "ACCESS".to_string(),
            secret: "SECRET".to_string(),
        },
    ));
    let volume_key = if config.use_encryption {
        Some(VolumeKey::derive("test-password", config.bucket_name.as_bytes()))
    } else {
        None
    };

    Arc::new(FsContext::with_service(config, service, volume_key))
}
