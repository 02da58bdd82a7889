//! Archiver Configuration
//!
//! `ArchiverConfig` controls how chunks are cut, how payloads are rendered,
//! where objects go and how hard the uploader tries before giving up.
//!
//! ## Configuration
//!
//! | Key                          | Description                                        | Default    |
//! |------------------------------|----------------------------------------------------|------------|
//! | `s3.bucket`                  | Bucket name                                        | required   |
//! | `s3.prefix`                  | Key prefix for all objects                         | required   |
//! | `s3.region`                  | Region                                             | `us-east-1`|
//! | `s3.endpoint`                | Custom endpoint (MinIO, localstack)                | none       |
//! | `s3.allow_http`              | Allow plain HTTP endpoints                         | `false`    |
//! | `chunk.max_bytes`            | Seal once the buffered lines reach this size       | 64 MiB     |
//! | `chunk.max_records`          | Seal once this many records are buffered           | `1000000`  |
//! | `chunk.max_age_ms`           | Seal once the first buffered record is this old    | `60000`    |
//! | `group.max_chunks`           | Chunks sharing one payload object                  | `1`        |
//! | `format`                     | Line rendering: `value`, `json`                    | `value`    |
//! | `on_render_error`            | Unrenderable records: `fail`, `skip`               | `fail`     |
//! | `retry.max_attempts`         | Attempts per object write                          | `5`        |
//! | `retry.base_backoff_ms`      | First retry delay, doubled per attempt             | `100`      |
//! | `retry.max_backoff_ms`       | Upper bound of a retry delay                       | `10000`    |
//! | `store.request_timeout_ms`   | Timeout of a single object store call              | `30000`    |
//! | `commit.backoff_ms`          | First upstream commit retry delay                  | `500`      |
//! | `commit.max_backoff_ms`      | Upper bound of a commit retry delay                | `30000`    |
//! | `pointer.conditional_writes` | Guard pointer updates with the store's e-tags      | `false`    |
//! | `flush.interval_ms`          | How often the runtime calls `flush()`              | `60000`    |

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use object_store::aws::AmazonS3Builder;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, Result};

/// How a record is rendered as one archive line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    /// The record value as UTF-8 text.
    Value,
    /// A one-line JSON envelope with topic, partition, offset, timestamp, key and value.
    Json,
}

impl RecordFormat {
    /// Parse from a string (case-insensitive).
    pub fn from_str_config(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "value" | "raw" => Ok(RecordFormat::Value),
            "json" | "ndjson" => Ok(RecordFormat::Json),
            other => Err(ArchiveError::ConfigError(format!(
                "unknown record format: '{}'",
                other
            ))),
        }
    }
}

/// What the sealer does with a record it cannot render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderErrorPolicy {
    /// Fail the seal, and with it the partition.
    Fail,
    /// Leave the record out of the payload and count it.
    Skip,
}

impl RenderErrorPolicy {
    /// Parse from a string (case-insensitive).
    pub fn from_str_config(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fail" => Ok(RenderErrorPolicy::Fail),
            "skip" => Ok(RenderErrorPolicy::Skip),
            other => Err(ArchiveError::ConfigError(format!(
                "unknown render error policy: '{}'",
                other
            ))),
        }
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retrying after the given zero-based attempt failed.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiverConfig {
    /// Bucket name
    pub bucket: String,

    /// Key prefix for payload, index and pointer objects
    pub prefix: String,

    /// Object store region
    #[serde(default = "default_region")]
    pub region: String,

    /// Optional endpoint (for MinIO/localstack)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Allow plain HTTP endpoints
    #[serde(default)]
    pub allow_http: bool,

    /// Seal a chunk once its rendered lines reach this many bytes (default: 64MB)
    #[serde(default = "default_chunk_max_bytes")]
    pub chunk_max_bytes: usize,

    /// Seal a chunk once it holds this many records
    #[serde(default = "default_chunk_max_records")]
    pub chunk_max_records: usize,

    /// Seal a chunk once its first record was appended this long ago (default: 1 minute)
    #[serde(default = "default_chunk_max_age_ms")]
    pub chunk_max_age_ms: u64,

    /// Number of chunks that share one payload object (default: 1)
    #[serde(default = "default_group_max_chunks")]
    pub group_max_chunks: usize,

    /// Line rendering
    #[serde(default = "default_format")]
    pub format: RecordFormat,

    /// Handling of records that cannot be rendered
    #[serde(default = "default_on_render_error")]
    pub on_render_error: RenderErrorPolicy,

    /// Attempts per object write before the partition fails (default: 5)
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_base_backoff_ms")]
    pub retry_base_backoff_ms: u64,

    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,

    /// Timeout of a single object store call (default: 30s)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_commit_backoff_ms")]
    pub commit_backoff_ms: u64,

    #[serde(default = "default_commit_max_backoff_ms")]
    pub commit_max_backoff_ms: u64,

    /// Use conditional puts on the pointer to detect a second writer
    #[serde(default)]
    pub conditional_pointer_writes: bool,

    /// Interval between runtime-driven flushes (default: 1 minute)
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            bucket: "archivist".to_string(),
            prefix: "archive".to_string(),
            region: default_region(),
            endpoint: None,
            allow_http: false,
            chunk_max_bytes: default_chunk_max_bytes(),
            chunk_max_records: default_chunk_max_records(),
            chunk_max_age_ms: default_chunk_max_age_ms(),
            group_max_chunks: default_group_max_chunks(),
            format: default_format(),
            on_render_error: default_on_render_error(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_backoff_ms: default_retry_base_backoff_ms(),
            retry_max_backoff_ms: default_retry_max_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            commit_backoff_ms: default_commit_backoff_ms(),
            commit_max_backoff_ms: default_commit_max_backoff_ms(),
            conditional_pointer_writes: false,
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl ArchiverConfig {
    /// Parse from a string key-value map, as handed over by a connector host.
    pub fn from_config_map(config: &HashMap<String, String>) -> Result<Self> {
        let bucket = config
            .get("s3.bucket")
            .ok_or_else(|| ArchiveError::ConfigError("missing required 's3.bucket'".to_string()))?
            .clone();
        let prefix = config
            .get("s3.prefix")
            .ok_or_else(|| ArchiveError::ConfigError("missing required 's3.prefix'".to_string()))?
            .clone();

        let format = config
            .get("format")
            .map(|s| RecordFormat::from_str_config(s))
            .transpose()?
            .unwrap_or(RecordFormat::Value);

        let on_render_error = config
            .get("on_render_error")
            .map(|s| RenderErrorPolicy::from_str_config(s))
            .transpose()?
            .unwrap_or(RenderErrorPolicy::Fail);

        let parsed = Self {
            bucket,
            prefix,
            region: config
                .get("s3.region")
                .cloned()
                .unwrap_or_else(default_region),
            endpoint: config.get("s3.endpoint").cloned(),
            allow_http: parse_opt(config, "s3.allow_http")?.unwrap_or(false),
            chunk_max_bytes: parse_opt(config, "chunk.max_bytes")?
                .unwrap_or_else(default_chunk_max_bytes),
            chunk_max_records: parse_opt(config, "chunk.max_records")?
                .unwrap_or_else(default_chunk_max_records),
            chunk_max_age_ms: parse_opt(config, "chunk.max_age_ms")?
                .unwrap_or_else(default_chunk_max_age_ms),
            group_max_chunks: parse_opt(config, "group.max_chunks")?
                .unwrap_or_else(default_group_max_chunks),
            format,
            on_render_error,
            retry_max_attempts: parse_opt(config, "retry.max_attempts")?
                .unwrap_or_else(default_retry_max_attempts),
            retry_base_backoff_ms: parse_opt(config, "retry.base_backoff_ms")?
                .unwrap_or_else(default_retry_base_backoff_ms),
            retry_max_backoff_ms: parse_opt(config, "retry.max_backoff_ms")?
                .unwrap_or_else(default_retry_max_backoff_ms),
            request_timeout_ms: parse_opt(config, "store.request_timeout_ms")?
                .unwrap_or_else(default_request_timeout_ms),
            commit_backoff_ms: parse_opt(config, "commit.backoff_ms")?
                .unwrap_or_else(default_commit_backoff_ms),
            commit_max_backoff_ms: parse_opt(config, "commit.max_backoff_ms")?
                .unwrap_or_else(default_commit_max_backoff_ms),
            conditional_pointer_writes: parse_opt(config, "pointer.conditional_writes")?
                .unwrap_or(false),
            flush_interval_ms: parse_opt(config, "flush.interval_ms")?
                .unwrap_or_else(default_flush_interval_ms),
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            return Err(ArchiveError::ConfigError("bucket must not be empty".to_string()));
        }
        let positive = [
            ("chunk.max_bytes", self.chunk_max_bytes as u64),
            ("chunk.max_records", self.chunk_max_records as u64),
            ("chunk.max_age_ms", self.chunk_max_age_ms),
            ("group.max_chunks", self.group_max_chunks as u64),
            ("retry.max_attempts", self.retry_max_attempts as u64),
            ("store.request_timeout_ms", self.request_timeout_ms),
            ("flush.interval_ms", self.flush_interval_ms),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ArchiveError::ConfigError(format!("'{}' must be greater than 0", key)));
            }
        }
        if self.retry_base_backoff_ms > self.retry_max_backoff_ms {
            return Err(ArchiveError::ConfigError(
                "'retry.base_backoff_ms' exceeds 'retry.max_backoff_ms'".to_string(),
            ));
        }
        Ok(())
    }

    /// Build an S3 client for the configured bucket. Credentials come from
    /// the standard `AWS_*` environment variables.
    pub fn build_s3_store(&self) -> Result<Arc<dyn ObjectStore>> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&self.bucket)
            .with_region(&self.region)
            .with_allow_http(self.allow_http);
        if let Some(endpoint) = &self.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        let store = builder.build().map_err(|e| {
            ArchiveError::ConnectionError(format!("failed to build S3 client: {}", e))
        })?;
        Ok(Arc::new(store))
    }

    pub fn chunk_max_age(&self) -> Duration {
        Duration::from_millis(self.chunk_max_age_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Retry policy of object store calls.
    pub fn store_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_backoff: Duration::from_millis(self.retry_base_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
        }
    }

    /// Backoff of upstream commits. Commits are retried without bound, so
    /// `max_attempts` is unused.
    pub fn commit_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: u32::MAX,
            base_backoff: Duration::from_millis(self.commit_backoff_ms),
            max_backoff: Duration::from_millis(self.commit_max_backoff_ms),
        }
    }
}

fn parse_opt<T>(config: &HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    config
        .get(key)
        .map(|s| {
            s.trim()
                .parse::<T>()
                .map_err(|e| ArchiveError::ConfigError(format!("invalid {}: {}", key, e)))
        })
        .transpose()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_chunk_max_bytes() -> usize {
    64 * 1024 * 1024 // 64MB
}

fn default_chunk_max_records() -> usize {
    1_000_000
}

fn default_chunk_max_age_ms() -> u64 {
    60 * 1000 // 1 minute
}

fn default_group_max_chunks() -> usize {
    1
}

fn default_format() -> RecordFormat {
    RecordFormat::Value
}

fn default_on_render_error() -> RenderErrorPolicy {
    RenderErrorPolicy::Fail
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_base_backoff_ms() -> u64 {
    100
}

fn default_retry_max_backoff_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_commit_backoff_ms() -> u64 {
    500
}

fn default_commit_max_backoff_ms() -> u64 {
    30_000
}

fn default_flush_interval_ms() -> u64 {
    60 * 1000
}
