//! Retrying Object Store Client
//!
//! Every call the pipeline makes against the object store goes through
//! [`StoreClient`]: each attempt is bounded by the request timeout, transient
//! failures are retried with capped exponential backoff, and request, error
//! and latency metrics are recorded per operation.
//!
//! Failures that another attempt cannot fix (missing object, failed
//! precondition, unsupported operation) are returned immediately together
//! with the attempt they happened on, so callers can tell a first-attempt
//! conflict from one that follows a lost response.

use std::future::Future;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore, PutMode, PutOptions, PutResult, UpdateVersion};

use crate::config::{ArchiverConfig, RetryPolicy};
use crate::error::{ArchiveError, Result};
use crate::metrics;

/// Why a retried store call gave up.
#[derive(Debug)]
pub enum StoreCallError {
    /// A failure retrying cannot fix. `attempt` is zero-based.
    Permanent {
        source: object_store::Error,
        attempt: u32,
    },
    /// Every attempt failed with a transient error or timed out.
    Exhausted { attempts: u32, reason: String },
}

impl StoreCallError {
    /// Convert into the error reported for a failed write of `key`.
    pub fn into_publish_error(self, key: &str) -> ArchiveError {
        match self {
            StoreCallError::Permanent { source, .. } => ArchiveError::ObjectStoreError(source),
            StoreCallError::Exhausted { attempts, reason } => ArchiveError::PublishFailed {
                key: key.to_string(),
                attempts,
                reason,
            },
        }
    }

    /// Convert into the error reported for a failed read of `key`.
    pub fn into_read_error(self, key: &str) -> ArchiveError {
        match self {
            StoreCallError::Permanent { source, .. } => ArchiveError::ObjectStoreError(source),
            StoreCallError::Exhausted { attempts, reason } => ArchiveError::ReadFailed {
                key: key.to_string(),
                attempts,
                reason,
            },
        }
    }
}

/// An object's bytes with the version the store reported for them.
#[derive(Debug, Clone)]
pub struct FetchedObject {
    pub bytes: Bytes,
    pub version: Option<UpdateVersion>,
}

/// Object store handle with retries, timeouts and metrics.
#[derive(Debug, Clone)]
pub struct StoreClient {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl StoreClient {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryPolicy, request_timeout: Duration) -> Self {
        Self {
            store,
            retry,
            request_timeout,
        }
    }

    pub fn from_config(store: Arc<dyn ObjectStore>, config: &ArchiverConfig) -> Self {
        Self::new(store, config.store_retry(), config.request_timeout())
    }

    /// The wrapped store.
    pub fn inner(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Unconditional put. `operation` labels metrics and logs.
    pub async fn put(&self, operation: &'static str, key: &str, body: Bytes) -> Result<PutResult> {
        let path = Path::from(key);
        self.call(operation, key, || self.store.put(&path, body.clone()))
            .await
            .map_err(|e| e.into_publish_error(key))
    }

    /// Put guarded by `mode`. Conflicts come back as
    /// [`StoreCallError::Permanent`] so the caller can inspect them.
    pub async fn put_with_mode(
        &self,
        operation: &'static str,
        key: &str,
        body: Bytes,
        mode: PutMode,
    ) -> std::result::Result<PutResult, StoreCallError> {
        let path = Path::from(key);
        self.call(operation, key, || {
            self.store
                .put_opts(&path, body.clone(), PutOptions::from(mode.clone()))
        })
        .await
    }

    /// Fetch a whole object, or `None` when it does not exist.
    pub async fn get(&self, key: &str) -> Result<Option<FetchedObject>> {
        let path = Path::from(key);
        let path = &path;
        let store = &self.store;
        let result = self
            .call("get", key, move || async move {
                let result = store.get(path).await?;
                let version = version_of(result.meta.e_tag.clone(), result.meta.version.clone());
                let bytes = result.bytes().await?;
                Ok::<_, object_store::Error>(FetchedObject { bytes, version })
            })
            .await;

        match result {
            Ok(object) => Ok(Some(object)),
            Err(StoreCallError::Permanent {
                source: object_store::Error::NotFound { .. },
                ..
            }) => Ok(None),
            Err(e) => Err(e.into_read_error(key)),
        }
    }

    /// Fetch a byte range of an object.
    pub async fn get_range(&self, key: &str, range: Range<usize>) -> Result<Bytes> {
        let path = Path::from(key);
        self.call("get_range", key, || self.store.get_range(&path, range.clone()))
            .await
            .map_err(|e| e.into_read_error(key))
    }

    /// Every object below `prefix`. An empty prefix lists the whole store.
    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let path = (!prefix.is_empty()).then(|| Path::from(prefix));
        self.call("list", prefix, || self.store.list(path.as_ref()).try_collect::<Vec<_>>())
            .await
            .map_err(|e| e.into_read_error(prefix))
    }

    async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        key: &str,
        mut attempt_fn: F,
    ) -> std::result::Result<T, StoreCallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = object_store::Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            metrics::STORE_REQUESTS_TOTAL
                .with_label_values(&[operation])
                .inc();
            let start = Instant::now();
            let outcome = tokio::time::timeout(self.request_timeout, attempt_fn()).await;
            metrics::STORE_LATENCY
                .with_label_values(&[operation])
                .observe(start.elapsed().as_secs_f64());

            let reason = match outcome {
                Ok(Ok(value)) => {
                    tracing::trace!(operation, key = %key, attempt = attempt + 1, "object store call succeeded");
                    return Ok(value);
                }
                Ok(Err(e)) if !is_transient(&e) => {
                    if !matches!(e, object_store::Error::NotFound { .. }) {
                        metrics::STORE_ERRORS_TOTAL
                            .with_label_values(&[operation, "permanent"])
                            .inc();
                    }
                    return Err(StoreCallError::Permanent { source: e, attempt });
                }
                Ok(Err(e)) => {
                    metrics::STORE_ERRORS_TOTAL
                        .with_label_values(&[operation, "transient"])
                        .inc();
                    e.to_string()
                }
                Err(_) => {
                    metrics::STORE_ERRORS_TOTAL
                        .with_label_values(&[operation, "timeout"])
                        .inc();
                    format!("timed out after {:?}", self.request_timeout)
                }
            };

            attempt += 1;
            if attempt >= self.retry.max_attempts {
                tracing::error!(
                    operation,
                    key = %key,
                    attempts = attempt,
                    error = %reason,
                    "Object store call failed, giving up"
                );
                return Err(StoreCallError::Exhausted {
                    attempts: attempt,
                    reason,
                });
            }

            let backoff = self.retry.backoff_for(attempt - 1);
            tracing::warn!(
                operation,
                key = %key,
                attempt,
                max_attempts = self.retry.max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %reason,
                "Object store call failed, retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

/// Failures that are worth another attempt.
fn is_transient(e: &object_store::Error) -> bool {
    !matches!(
        e,
        object_store::Error::NotFound { .. }
            | object_store::Error::AlreadyExists { .. }
            | object_store::Error::Precondition { .. }
            | object_store::Error::NotModified { .. }
            | object_store::Error::NotSupported { .. }
            | object_store::Error::NotImplemented { .. }
            | object_store::Error::InvalidPath { .. }
    )
}

/// Version token for a conditional update, if the store reported one.
pub fn version_of(e_tag: Option<String>, version: Option<String>) -> Option<UpdateVersion> {
    if e_tag.is_none() && version.is_none() {
        None
    } else {
        Some(UpdateVersion { e_tag, version })
    }
}
