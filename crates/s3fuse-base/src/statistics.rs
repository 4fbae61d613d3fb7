//! Per-tag request statistics.
//!
//! Each pooled request handle accumulates counters locally and posts them to
//! the process-wide registry when it is dropped; `summary()` is written to
//! the log on shutdown.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

/// Counters for one tag (one request handle's lifetime, or their sum).
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferStats {
    /// Completed requests.
    pub request_count: u64,
    /// Wall time across requests, excluding each handle's warmup request.
    pub total_time: Duration,
    /// Header + body bytes moved, both directions.
    pub bytes_transferred: u64,
}

impl TransferStats {
    fn merge(&mut self, other: &TransferStats) {
        self.request_count += other.request_count;
        self.total_time += other.total_time;
        self.bytes_transferred += other.bytes_transferred;
    }
}

/// Process-wide statistics registry.
#[derive(Debug, Default)]
pub struct Statistics {
    tags: Mutex<BTreeMap<String, TransferStats>>,
}

impl Statistics {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a handle's counters into the tag's running totals.
    pub fn post(&self, tag: &str, stats: &TransferStats) {
        if stats.request_count == 0 {
            return;
        }

        let mut tags = self.tags.lock().unwrap();
        tags.entry(tag.to_string()).or_default().merge(stats);
    }

    /// Renders one line per tag, suitable for the shutdown log.
    pub fn summary(&self) -> String {
        let tags = self.tags.lock().unwrap();
        let mut out = String::new();

        for (tag, stats) in tags.iter() {
            let secs = stats.total_time.as_secs_f64();
            let avg_ms = if stats.request_count > 0 {
                secs / stats.request_count as f64 * 1e3
            } else {
                0.0
            };
            out.push_str(&format!(
                "{tag}: requests={} total_time_s={secs:.3} avg_ms={avg_ms:.2} bytes={}\n",
                stats.request_count, stats.bytes_transferred
            ));
        }

        out
    }
}
