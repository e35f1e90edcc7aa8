use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Runtime configuration, from flags or `LOGWELL_*` environment variables.
#[derive(Debug, Clone, Parser)]
#[command(name = "logwell", about = "Durable log ingest pipeline with an embedded analytics store")]
pub struct Config {
    /// Database file path. Empty uses an in-memory store (snapshot disabled).
    #[arg(long, env = "LOGWELL_DB_PATH", default_value = "")]
    pub db_path: String,

    /// Unix socket path for the JSON-RPC read surface.
    #[arg(long, env = "LOGWELL_SOCKET_PATH", default_value = "/tmp/logwell.sock")]
    pub socket_path: PathBuf,

    /// TCP line-ingest listen address.
    #[arg(long, env = "LOGWELL_TCP_LISTEN", default_value = "127.0.0.1:5140")]
    pub tcp_listen: String,

    /// Also read log lines from stdin.
    #[arg(long, env = "LOGWELL_STDIN", default_value_t = false)]
    pub stdin_ingest: bool,

    /// Write-ahead journal path. Empty disables journaling.
    #[arg(long, env = "LOGWELL_JOURNAL_PATH", default_value = "")]
    pub journal_path: String,

    /// Processor mode: "parse" or "passthrough".
    #[arg(long, env = "LOGWELL_MODE", default_value = "parse")]
    pub processor_mode: String,

    /// Source tag applied to envelopes that carry none.
    #[arg(long, env = "LOGWELL_DEFAULT_SOURCE", default_value = "stdin")]
    pub default_source: String,

    /// Application bucket for ingested records.
    #[arg(long, env = "LOGWELL_APP", default_value = "default")]
    pub app: String,

    /// Per-read query deadline, in seconds.
    #[arg(long, env = "LOGWELL_QUERY_TIMEOUT_SECS", default_value_t = 30)]
    pub query_timeout_secs: u64,

    /// Insert buffer target batch size.
    #[arg(long, env = "LOGWELL_BATCH_SIZE", default_value_t = 2000)]
    pub batch_size: usize,

    /// Insert buffer periodic drain interval, in milliseconds.
    #[arg(long, env = "LOGWELL_FLUSH_INTERVAL_MS", default_value_t = 100)]
    pub flush_interval_ms: u64,

    /// Bounded flush handoff queue depth.
    #[arg(long, env = "LOGWELL_FLUSH_QUEUE_SIZE", default_value_t = 64)]
    pub flush_queue_size: usize,

    /// Retention horizon in days; 0 or less disables the cleaner.
    #[arg(long, env = "LOGWELL_RETENTION_DAYS", default_value_t = 0)]
    pub retention_days: i64,

    /// Global read-slot cap; 0 disables the throttle.
    #[arg(long, env = "LOGWELL_MAX_CONCURRENT_QUERIES", default_value_t = 0)]
    pub max_concurrent_queries: usize,
}

impl Config {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn db_path_opt(&self) -> Option<PathBuf> {
        if self.db_path.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.db_path))
        }
    }
}
