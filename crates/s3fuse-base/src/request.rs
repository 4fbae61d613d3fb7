use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::statistics::{Statistics, TransferStats};
use crate::timer;

/// Outgoing and incoming header maps.
///
/// Ordered so the signing hook sees canonical headers in lexicographic order
/// without sorting on every attempt.
pub type HeaderMap = BTreeMap<String, String>;

/// HTTP methods the store API uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// DELETE
    Delete,
    /// GET
    Get,
    /// HEAD
    Head,
    /// POST
    Post,
    /// PUT
    Put,
}

impl HttpMethod {
    /// Wire name of the method.
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Delete => "DELETE",
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
        }
    }

    fn to_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
        }
    }
}

/// Provider hook consumed by the retry loop.
///
/// `pre_run` runs before every attempt; `Date` and `Authorization` are set
/// there so each attempt carries a fresh signature.
pub trait RequestHook: Send + Sync {
    /// Turns a bucket-relative URL into a full endpoint URL.
    fn adjust_url(&self, url: &str) -> String;
    /// Signs (or otherwise prepares) the request for one attempt.
    fn pre_run(&self, req: &mut Request, attempt: u32);
    /// After a completed transport round, may ask for another attempt.
    fn should_retry(&self, req: &Request, attempt: u32) -> bool;
}

enum BodySource {
    None,
    Buffer(Vec<u8>),
    File { file: File, offset: u64, len: u64 },
}

enum OutputSink {
    Buffer,
    File { file: File, offset: u64 },
}

enum AttemptError {
    /// Transport-level failure from the HTTP client.
    Transport(reqwest::Error),
    /// Failure while streaming the response body.
    Read(std::io::Error),
    /// Local file I/O failure; never retried.
    Local(std::io::Error),
}

/// Reads a `[offset, offset + len)` window of a file without touching the
/// file's own cursor, so one scratch fd can back concurrent part uploads.
struct FileSlice {
    file: File,
    pos: u64,
    remaining: u64,
}

impl Read for FileSlice {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }

        let want = buf.len().min(self.remaining as usize);
        let n = self.file.read_at(&mut buf[..want], self.pos)?;
        self.pos += n as u64;
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// One reusable HTTP transaction handle.
///
/// A handle lives in the [`crate::pool::RequestPool`] and is lent to exactly
/// one worker at a time. `init` resets it between transactions; a handle
/// whose deadline fired is permanently cancelled and gets replaced on
/// check-in.
pub struct Request {
    client: reqwest::blocking::Client,
    config: Arc<Config>,
    hook: Option<Arc<dyn RequestHook>>,
    statistics: Arc<Statistics>,
    tag: String,

    method: HttpMethod,
    url: String,
    full_url: String,
    headers: HeaderMap,
    input: BodySource,
    output: OutputSink,

    response_code: u16,
    response_headers: HeaderMap,
    response_body: Vec<u8>,
    last_modified: i64,

    cancelled: bool,
    run_count: u64,
    stats: TransferStats,
}

impl Request {
    /// Builds a fresh handle.
    pub fn new(
        tag: &str,
        config: Arc<Config>,
        hook: Option<Arc<dyn RequestHook>>,
        statistics: Arc<Statistics>,
    ) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(None)
            .build()
            .map_err(|e| Error::InvalidArgument(format!("http client: {e}")))?;

        Ok(Self {
            client,
            config,
            hook,
            statistics,
            tag: tag.to_string(),
            method: HttpMethod::Get,
            url: String::new(),
            full_url: String::new(),
            headers: HeaderMap::new(),
            input: BodySource::None,
            output: OutputSink::Buffer,
            response_code: 0,
            response_headers: HeaderMap::new(),
            response_body: Vec::new(),
            last_modified: 0,
            cancelled: false,
            run_count: 0,
            stats: TransferStats::default(),
        })
    }

    /// Resets the handle for a new transaction.
    pub fn init(&mut self, method: HttpMethod) -> Result<()> {
        if self.cancelled {
            return Err(Error::InvalidArgument(
                "cannot reuse a cancelled request handle".to_string(),
            ));
        }

        self.method = method;
        self.url.clear();
        self.full_url.clear();
        self.headers.clear();
        self.input = BodySource::None;
        self.output = OutputSink::Buffer;
        self.response_code = 0;
        self.response_headers.clear();
        self.response_body.clear();
        self.last_modified = 0;

        Ok(())
    }

    /// True once the handle's deadline has fired; the handle is unusable.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    #[cfg(test)]
    pub(crate) fn force_cancel(&mut self) {
        self.cancelled = true;
    }

    /// Records the caller-visible URL (used for signing) and derives the
    /// transport URL through the hook.
    pub fn set_url(&mut self, url: &str, query: &str) {
        let mut full = match &self.hook {
            Some(hook) => hook.adjust_url(url),
            None => url.to_string(),
        };

        if !query.is_empty() {
            full.push(if full.contains('?') { '&' } else { '?' });
            full.push_str(query);
        }

        self.url = url.to_string();
        self.full_url = full;
    }

    /// Sets an outgoing header, replacing any previous value.
    pub fn set_header(&mut self, key: &str, value: &str) {
        self.headers.insert(key.to_string(), value.to_string());
    }

    /// Uses an in-memory body. Overrides any previously set body source.
    pub fn set_input_buffer(&mut self, data: Vec<u8>) {
        self.input = BodySource::Buffer(data);
    }

    /// Streams the body from a window of a local file. Overrides any
    /// previously set body source.
    pub fn set_input_file(&mut self, file: File, offset: u64, len: u64) {
        self.input = BodySource::File { file, offset, len };
    }

    /// Streams a successful response body into a local file at `offset`.
    /// Error bodies are still buffered for logging.
    pub fn set_output_file(&mut self, file: File, offset: u64) {
        self.output = OutputSink::File { file, offset };
    }

    /// HTTP method of the current transaction.
    pub fn method(&self) -> HttpMethod {
        self.method
    }

    /// The caller-visible (signing) URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Outgoing headers, for the signing hook.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Outgoing header value, empty when unset.
    pub fn header(&self, key: &str) -> &str {
        self.headers.get(key).map(String::as_str).unwrap_or("")
    }

    /// Response status code of the last attempt; 0 before any attempt.
    pub fn response_code(&self) -> u16 {
        self.response_code
    }

    /// Response header value, empty when absent.
    ///
    /// Lookup is case-insensitive: the transport normalises header names to
    /// lower case, while callers use the documented mixed-case names.
    pub fn response_header(&self, key: &str) -> &str {
        if let Some(v) = self.response_headers.get(key) {
            return v;
        }

        self.response_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    /// All response headers, as received.
    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    /// Buffered response body.
    pub fn response_body(&self) -> &[u8] {
        &self.response_body
    }

    /// Buffered response body as text.
    pub fn response_string(&self) -> String {
        String::from_utf8_lossy(&self.response_body).into_owned()
    }

    /// Server `Last-Modified`, seconds since the epoch; 0 when absent.
    pub fn last_modified(&self) -> i64 {
        self.last_modified
    }

    /// Executes the transaction, retrying transport failures up to the
    /// configured budget. Each attempt is re-signed by the hook.
    pub fn run(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.cancelled {
            return Err(Error::InvalidArgument(
                "cannot reuse a cancelled request handle".to_string(),
            ));
        }
        if self.full_url.is_empty() {
            return Err(Error::InvalidArgument("set_url() not called".to_string()));
        }

        let deadline = timeout
            .unwrap_or_else(|| Duration::from_secs(self.config.request_timeout_in_s));
        let attempts = self.config.max_transfer_retries;

        for attempt in 0..attempts {
            self.response_code = 0;
            self.response_headers.clear();
            self.response_body.clear();

            if let Some(hook) = self.hook.clone() {
                hook.pre_run(self, attempt);
            }

            let started = Instant::now();

            match self.perform(deadline) {
                Ok(transferred) => {
                    let elapsed = started.elapsed();

                    // the first request on a handle pays connection setup;
                    // leave it out of the timing totals
                    if self.run_count > 0 {
                        self.stats.total_time += elapsed;
                        self.stats.bytes_transferred += transferred;
                    }
                    self.run_count += 1;
                    self.stats.request_count += 1;

                    if let Some(hook) = self.hook.clone() {
                        if attempt + 1 < attempts && hook.should_retry(self, attempt) {
                            debug!(
                                url = %self.url,
                                code = self.response_code,
                                attempt,
                                "hook requested retry"
                            );
                            continue;
                        }
                    }

                    if self.response_code >= 300 && self.response_code != 404 {
                        warn!(
                            url = %self.url,
                            code = self.response_code,
                            body = %self.response_string(),
                            "request failed"
                        );
                    }

                    return Ok(());
                }
                Err(AttemptError::Transport(e)) if e.is_timeout() => {
                    warn!(url = %self.url, "request timed out");
                    self.cancelled = true;
                    return Err(Error::Timeout);
                }
                Err(AttemptError::Transport(e)) => {
                    if attempt + 1 < attempts {
                        warn!(url = %self.url, error = %e, attempt, "transport error, retrying");
                        continue;
                    }
                    warn!(url = %self.url, error = %e, "transport error, retries exhausted");
                    return Err(Error::RequestFailed { status: 0 });
                }
                Err(AttemptError::Read(e)) => {
                    if attempt + 1 < attempts {
                        warn!(url = %self.url, error = %e, attempt, "response read error, retrying");
                        continue;
                    }
                    warn!(url = %self.url, error = %e, "response read error, retries exhausted");
                    return Err(Error::RequestFailed { status: 0 });
                }
                Err(AttemptError::Local(e)) => {
                    return Err(Error::Io(e));
                }
            }
        }

        Err(Error::RequestFailed { status: 0 })
    }

    fn perform(&mut self, timeout: Duration) -> std::result::Result<u64, AttemptError> {
        let mut builder = self
            .client
            .request(self.method.to_reqwest(), &self.full_url)
            .timeout(timeout);

        let mut transferred: u64 = 0;

        for (key, value) in &self.headers {
            builder = builder.header(key.as_str(), value.as_str());
            transferred += (key.len() + value.len()) as u64;
        }

        match &self.input {
            BodySource::None => {
                if matches!(self.method, HttpMethod::Put | HttpMethod::Post) {
                    builder = builder.body(Vec::new());
                }
            }
            BodySource::Buffer(data) => {
                transferred += data.len() as u64;
                builder = builder.body(data.clone());
            }
            BodySource::File { file, offset, len } => {
                let file = file.try_clone().map_err(AttemptError::Local)?;
                transferred += len;
                builder = builder.body(reqwest::blocking::Body::sized(
                    FileSlice {
                        file,
                        pos: *offset,
                        remaining: *len,
                    },
                    *len,
                ));
            }
        }

        if self.config.verbose_requests {
            debug!(method = self.method.as_str(), url = %self.full_url, "sending");
        }

        let mut response = builder.send().map_err(AttemptError::Transport)?;

        self.response_code = response.status().as_u16();
        for (key, value) in response.headers() {
            self.response_headers.insert(
                key.as_str().to_string(),
                value.to_str().unwrap_or("").to_string(),
            );
        }
        self.last_modified = timer::parse_http_time(self.response_header("Last-Modified"));

        let success = response.status().is_success();
        match &mut self.output {
            OutputSink::File { file, offset } if success => {
                let mut buf = vec![0u8; 64 * 1024];
                let mut written: u64 = 0;
                loop {
                    let n = response.read(&mut buf).map_err(AttemptError::Read)?;
                    if n == 0 {
                        break;
                    }
                    file.write_all_at(&buf[..n], *offset + written)
                        .map_err(AttemptError::Local)?;
                    written += n as u64;
                }
                transferred += written;
            }
            _ => {
                response
                    .read_to_end(&mut self.response_body)
                    .map_err(AttemptError::Read)?;
                transferred += self.response_body.len() as u64;
            }
        }

        Ok(transferred)
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        self.statistics.post(&self.tag, &self.stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_request() -> Request {
        Request::new(
            "test",
            Arc::new(Config::default()),
            None,
            Arc::new(Statistics::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_init_resets_state() {
        let mut req = test_request();
        req.set_url("/bucket/key", "");
        req.set_header("x-amz-meta-s3fuse-mode", "0644");
        req.response_code = 200;
        req.response_headers
            .insert("etag".to_string(), "\"abc\"".to_string());

        req.init(HttpMethod::Put).unwrap();
        assert_eq!(req.url(), "");
        assert_eq!(req.header("x-amz-meta-s3fuse-mode"), "");
        assert_eq!(req.response_code(), 0);
        assert_eq!(req.response_header("ETag"), "");
    }

    #[test]
    fn test_cancelled_handle_rejects_reuse() {
        let mut req = test_request();
        req.cancelled = true;
        assert!(matches!(
            req.init(HttpMethod::Get),
            Err(Error::InvalidArgument(_))
        ));
        assert!(req.run(None).is_err());
    }

    #[test]
    fn test_response_header_is_case_insensitive() {
        let mut req = test_request();
        req.response_headers
            .insert("etag".to_string(), "\"abc\"".to_string());
        assert_eq!(req.response_header("ETag"), "\"abc\"");
        assert_eq!(req.response_header("etag"), "\"abc\"");
        assert_eq!(req.response_header("missing"), "");
    }

    #[test]
    fn test_set_url_appends_query() {
        let mut req = test_request();
        req.set_url("/bucket/key", "uploads");
        assert_eq!(req.url(), "/bucket/key");
        assert_eq!(req.full_url, "/bucket/key?uploads");

        req.set_url("/bucket/key?partNumber=1", "uploadId=x");
        assert_eq!(req.full_url, "/bucket/key?partNumber=1&uploadId=x");
    }

    #[test]
    fn test_run_without_url_is_invalid() {
        let mut req = test_request();
        req.init(HttpMethod::Get).unwrap();
        assert!(matches!(req.run(None), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_file_slice_reads_window() {
        use std::io::Write;

        let mut f = tempfile::tempfile().unwrap();
        f.write_all(b"0123456789").unwrap();

        let mut slice = FileSlice {
            file: f,
            pos: 2,
            remaining: 5,
        };
        let mut out = Vec::new();
        slice.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"23456");
    }
}
