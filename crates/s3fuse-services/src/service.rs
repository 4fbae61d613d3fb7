use std::path::Path;

use s3fuse_base::config::{Config, ProviderKind};
use s3fuse_base::error::Result;
use s3fuse_base::request::{Request, RequestHook};
use s3fuse_base::{timer, url};

use crate::credentials::Credentials;

/// Provider adapter: endpoint, header prefixes, signing, and capability
/// flags, plus the hook entry points the request retry loop calls.
pub struct Service {
    provider: ProviderKind,
    endpoint: String,
    bucket_url: String,
    credentials: Credentials,
}

impl Service {
    /// Builds the adapter for the configured provider, loading credentials
    /// from the secret file.
    pub fn new(config: &Config) -> Result<Self> {
        let credentials = Credentials::load(Path::new(&config.secret_file))?;
        Ok(Self::with_credentials(config, credentials))
    }

    /// Builds the adapter with credentials supplied directly.
    pub fn with_credentials(config: &Config, credentials: Credentials) -> Self {
        let scheme = if config.use_ssl { "https" } else { "http" };
        Self {
            provider: config.provider,
            endpoint: format!("{scheme}://{}", config.service_endpoint),
            bucket_url: format!("/{}", url::encode(&config.bucket_name)),
            credentials,
        }
    }

    /// Provider header prefix, e.g. `x-amz-`.
    pub fn header_prefix(&self) -> &'static str {
        match self.provider {
            ProviderKind::Aws => "x-amz-",
            ProviderKind::Gcs => "x-goog-",
        }
    }

    /// Provider metadata header prefix, e.g. `x-amz-meta-`.
    pub fn header_meta_prefix(&self) -> &'static str {
        match self.provider {
            ProviderKind::Aws => "x-amz-meta-",
            ProviderKind::Gcs => "x-goog-meta-",
        }
    }

    /// Path-style bucket URL: `/` plus the percent-encoded bucket name.
    pub fn bucket_url(&self) -> &str {
        &self.bucket_url
    }

    /// Whether the provider's XML API supports multipart uploads.
    pub fn is_multipart_upload_supported(&self) -> bool {
        match self.provider {
            ProviderKind::Aws => true,
            // the GCS XML API has no initiate/complete-multipart surface
            ProviderKind::Gcs => false,
        }
    }

    /// Whether ranged GETs may be used for parallel downloads.
    pub fn is_multipart_download_supported(&self) -> bool {
        true
    }

    fn auth_scheme(&self) -> &'static str {
        match self.provider {
            ProviderKind::Aws => "AWS",
            ProviderKind::Gcs => "GOOG1",
        }
    }

    /// The canonical string for one attempt: method, content headers, date,
    /// canonicalised provider headers, resource.
    fn string_to_sign(&self, req: &Request, date: &str) -> String {
        let mut to_sign = format!(
            "{}\n{}\n{}\n{date}\n",
            req.method().as_str(),
            req.header("Content-MD5"),
            req.header("Content-Type"),
        );

        // outgoing headers are kept in an ordered map, so provider headers
        // arrive here already in lexicographic order
        for (key, value) in req.headers() {
            if !value.is_empty() && key.starts_with(self.header_prefix()) {
                to_sign.push_str(key);
                to_sign.push(':');
                to_sign.push_str(value);
                to_sign.push('\n');
            }
        }

        to_sign.push_str(req.url());
        to_sign
    }

    /// Writes `Date` and `Authorization` for the current attempt.
    pub fn sign(&self, req: &mut Request) {
        let date = timer::http_time();
        req.set_header("Date", &date);

        let mac =
            s3fuse_crypto::sign::hmac_sha1_base64(&self.credentials.secret, &self.string_to_sign(req, &date));
        req.set_header(
            "Authorization",
            &format!("{} {}:{mac}", self.auth_scheme(), self.credentials.key),
        );
    }
}

impl Service {
    // the store answers 5xx transiently under load; those re-sign and go again
    fn is_retryable_status(code: u16) -> bool {
        code >= 500
    }
}

impl RequestHook for Service {
    fn adjust_url(&self, url: &str) -> String {
        format!("{}{url}", self.endpoint)
    }

    fn pre_run(&self, req: &mut Request, _attempt: u32) {
        self.sign(req);
    }

    fn should_retry(&self, req: &Request, _attempt: u32) -> bool {
        Self::is_retryable_status(req.response_code())
    }
}
