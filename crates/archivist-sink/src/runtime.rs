//! Archiver runtime.
//!
//! `ArchiverRuntime` drives sinks as background tokio tasks. Each task starts
//! its sink, seeks the record source to the resume offsets the sink reports,
//! then loops: poll, `put`, and `flush` once the flush interval has passed.
//! Control signals pause, resume or stop a task.
//!
//! A failing `put` or `flush` moves the sink to [`RuntimeState::Failed`]: the
//! task releases the sink and stops polling, so nothing is committed past
//! the failure. A finite source that reports itself exhausted is flushed and
//! stopped cleanly.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use archivist_core::TopicPartition;

use crate::error::{ArchiveError, Result};
use crate::traits::{RecordSource, ResumeOffsets, SinkTask};

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SOURCE_ERROR_BACKOFF: Duration = Duration::from_millis(1000);

/// Lifecycle state of a managed sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Running,
    Paused,
    /// `put` or `flush` failed; the sink no longer polls.
    Failed,
    Stopped,
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeState::Running => write!(f, "running"),
            RuntimeState::Paused => write!(f, "paused"),
            RuntimeState::Failed => write!(f, "failed"),
            RuntimeState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Control signals sent from the runtime to a running sink task.
#[derive(Debug)]
enum ControlSignal {
    Pause,
    Resume,
    Stop,
}

/// Handle to a running sink task.
struct SinkHandle {
    join_handle: JoinHandle<()>,
    control_tx: mpsc::Sender<ControlSignal>,
    state: Arc<watch::Sender<RuntimeState>>,
}

/// Runtime that manages the lifecycle of archive sinks.
///
/// # Example
///
/// ```ignore
/// let mut runtime = ArchiverRuntime::new();
/// let resume = runtime
///     .start_sink(Box::new(sink), Box::new(source), assignment, config.flush_interval())
///     .await?;
/// runtime.pause("archive")?;
/// runtime.resume("archive")?;
/// runtime.stop("archive").await?;
/// ```
pub struct ArchiverRuntime {
    sinks: HashMap<String, SinkHandle>,
}

impl ArchiverRuntime {
    pub fn new() -> Self {
        Self {
            sinks: HashMap::new(),
        }
    }

    /// Start `sink` on `assignment` and drive it from `source` in a
    /// background task. Returns the resume offsets the source was seeked to.
    pub async fn start_sink(
        &mut self,
        mut sink: Box<dyn SinkTask>,
        mut source: Box<dyn RecordSource>,
        assignment: Vec<TopicPartition>,
        flush_interval: Duration,
    ) -> Result<ResumeOffsets> {
        let name = sink.name().to_string();
        if self.sinks.contains_key(&name) {
            return Err(ArchiveError::RuntimeError(format!(
                "sink '{}' is already running",
                name
            )));
        }

        let resume = sink.start(&assignment).await?;
        for (tp, offset) in &resume {
            if let Some(offset) = offset {
                tracing::info!(sink = %name, topic = %tp.topic, partition = tp.partition, offset, "Seeking source to resume offset");
                source.seek(tp, *offset).await?;
            }
        }

        let (control_tx, control_rx) = mpsc::channel::<ControlSignal>(16);
        let (state_tx, _) = watch::channel(RuntimeState::Running);
        let state = Arc::new(state_tx);
        let join_handle = tokio::spawn(run_sink(
            name.clone(),
            sink,
            source,
            control_rx,
            state.clone(),
            flush_interval,
        ));

        self.sinks.insert(
            name,
            SinkHandle {
                join_handle,
                control_tx,
                state,
            },
        );
        Ok(resume)
    }

    /// Send a pause signal to a running sink.
    pub fn pause(&mut self, name: &str) -> Result<()> {
        let handle = self.handle(name)?;
        let current = *handle.state.borrow();
        if current != RuntimeState::Running {
            return Err(ArchiveError::RuntimeError(format!(
                "sink '{}' is not running (state: {})",
                name, current
            )));
        }
        handle
            .control_tx
            .try_send(ControlSignal::Pause)
            .map_err(|e| ArchiveError::RuntimeError(format!("failed to send pause: {}", e)))?;
        handle.state.send_replace(RuntimeState::Paused);
        Ok(())
    }

    /// Send a resume signal to a paused sink.
    pub fn resume(&mut self, name: &str) -> Result<()> {
        let handle = self.handle(name)?;
        let current = *handle.state.borrow();
        if current != RuntimeState::Paused {
            return Err(ArchiveError::RuntimeError(format!(
                "sink '{}' is not paused (state: {})",
                name, current
            )));
        }
        handle
            .control_tx
            .try_send(ControlSignal::Resume)
            .map_err(|e| ArchiveError::RuntimeError(format!("failed to send resume: {}", e)))?;
        handle.state.send_replace(RuntimeState::Running);
        Ok(())
    }

    /// Stop a sink and wait for its task to finish. Returns the state the
    /// sink ended in.
    pub async fn stop(&mut self, name: &str) -> Result<RuntimeState> {
        let handle = self
            .sinks
            .remove(name)
            .ok_or_else(|| not_found(name))?;

        let _ = handle.control_tx.send(ControlSignal::Stop).await;
        let _ = handle.join_handle.await;
        let final_state = *handle.state.borrow();
        Ok(final_state)
    }

    /// Wait until a sink's task ends on its own (exhausted source or failure).
    pub async fn wait(&mut self, name: &str) -> Result<RuntimeState> {
        let handle = self
            .sinks
            .remove(name)
            .ok_or_else(|| not_found(name))?;

        handle
            .join_handle
            .await
            .map_err(|e| ArchiveError::RuntimeError(format!("sink task panicked: {}", e)))?;
        let final_state = *handle.state.borrow();
        Ok(final_state)
    }

    /// Current state of a sink, or None if not found.
    pub fn state(&self, name: &str) -> Option<RuntimeState> {
        self.sinks.get(name).map(|h| *h.state.borrow())
    }

    /// Names of all managed sinks.
    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.keys().map(|s| s.as_str()).collect()
    }

    fn handle(&self, name: &str) -> Result<&SinkHandle> {
        self.sinks.get(name).ok_or_else(|| not_found(name))
    }
}

impl Default for ArchiverRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(name: &str) -> ArchiveError {
    ArchiveError::RuntimeError(format!("sink '{}' not found", name))
}

async fn run_sink(
    name: String,
    mut sink: Box<dyn SinkTask>,
    mut source: Box<dyn RecordSource>,
    mut control_rx: mpsc::Receiver<ControlSignal>,
    state: Arc<watch::Sender<RuntimeState>>,
    flush_interval: Duration,
) {
    let mut paused = false;
    let mut last_flush = Instant::now();

    loop {
        match control_rx.try_recv() {
            Ok(ControlSignal::Stop) => {
                tracing::info!(sink = %name, "Stopping sink");
                if let Err(e) = sink.stop().await {
                    tracing::error!(sink = %name, error = %e, "Error stopping sink");
                }
                state.send_replace(RuntimeState::Stopped);
                break;
            }
            Ok(ControlSignal::Pause) => {
                tracing::info!(sink = %name, "Pausing sink");
                paused = true;
            }
            Ok(ControlSignal::Resume) => {
                tracing::info!(sink = %name, "Resuming sink");
                paused = false;
            }
            Err(mpsc::error::TryRecvError::Empty) => {}
            Err(mpsc::error::TryRecvError::Disconnected) => {
                tracing::warn!(sink = %name, "Control channel closed, stopping");
                let _ = sink.stop().await;
                state.send_replace(RuntimeState::Stopped);
                break;
            }
        }

        if paused {
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            continue;
        }

        let records = match source.poll().await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(sink = %name, error = %e, "Error polling record source");
                tokio::time::sleep(SOURCE_ERROR_BACKOFF).await;
                continue;
            }
        };

        // Empty batches still go through put so age thresholds can fire
        if let Err(e) = sink.put(&records).await {
            fail(&name, sink.as_mut(), &state, "put", e).await;
            break;
        }

        if records.is_empty() && source.is_exhausted() {
            tracing::info!(sink = %name, "Record source exhausted, flushing");
            if let Err(e) = sink.flush().await {
                fail(&name, sink.as_mut(), &state, "flush", e).await;
                break;
            }
            if let Err(e) = sink.stop().await {
                tracing::error!(sink = %name, error = %e, "Error stopping sink");
            }
            state.send_replace(RuntimeState::Stopped);
            break;
        }

        if last_flush.elapsed() >= flush_interval {
            if let Err(e) = sink.flush().await {
                fail(&name, sink.as_mut(), &state, "flush", e).await;
                break;
            }
            last_flush = Instant::now();
        }

        if records.is_empty() {
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }
}

async fn fail(
    name: &str,
    sink: &mut dyn SinkTask,
    state: &watch::Sender<RuntimeState>,
    operation: &str,
    err: ArchiveError,
) {
    tracing::error!(sink = %name, operation, error = %err, "Sink failed, no longer polling");
    state.send_replace(RuntimeState::Failed);
    if let Err(e) = sink.stop().await {
        tracing::error!(sink = %name, error = %e, "Error releasing failed sink");
    }
}
