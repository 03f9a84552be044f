//! Progress events for one `parse_document` invocation.
//!
//! A [`ProgressReporter`] is created fresh for every parse and owns a call
//! id (UUID v4) plus a sequence counter. Every event it emits carries both,
//! so two documents parsed concurrently through the same sink can always be
//! told apart and each stream is strictly ordered by `sequence`.
//!
//! Publishing never blocks the pipeline: events go onto an unbounded channel
//! drained by one forwarding task per reporter, which awaits the
//! [`ProgressSink`]. A sink that fails or is slow only delays its own
//! delivery. [`ProgressReporter::finish`] waits for the forwarder so the
//! final events are delivered before the parse returns.
//!
//! # Example
//!
//! ```rust
//! use po_extract::progress::{ChannelProgressSink, ProgressReporter, ProgressStage};
//! use std::sync::Arc;
//! use tokio_stream::StreamExt;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let (sink, mut events) = ChannelProgressSink::channel(64);
//! let reporter = ProgressReporter::new(Arc::new(sink), Some("wf-1".into()));
//! reporter.publish_sub_stage_progress(ProgressStage::Start, 0, 1, serde_json::Value::Null);
//! reporter.finish().await;
//!
//! let first = events.next().await.unwrap();
//! assert_eq!(first.stage, ProgressStage::Start);
//! assert_eq!(first.sequence, 0);
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

/// Parse sub-stages, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Start,
    Preprocess,
    Plan,
    /// A secondary chunk (index ≥ 1) was submitted.
    ChunkStart,
    /// A secondary chunk finished.
    ChunkDone,
    Finalize,
    Complete,
}

impl ProgressStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStage::Start => "start",
            ProgressStage::Preprocess => "preprocess",
            ProgressStage::Plan => "plan",
            ProgressStage::ChunkStart => "chunk_start",
            ProgressStage::ChunkDone => "chunk_done",
            ProgressStage::Finalize => "finalize",
            ProgressStage::Complete => "complete",
        }
    }
}

impl std::fmt::Display for ProgressStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Identifies the parse invocation that emitted the event.
    pub call_id: Uuid,
    /// 0-based, strictly increasing within one `call_id`.
    pub sequence: u64,
    pub workflow_id: Option<String>,
    pub stage: ProgressStage,
    pub current: usize,
    pub total: usize,
    #[serde(default)]
    pub meta: Value,
    pub emitted_at: DateTime<Utc>,
}

/// Error returned by a sink; logged by the forwarder, never propagated.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Receives progress events.
///
/// Implementations must be `Send + Sync`; one sink is typically shared by
/// every document a worker processes.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn publish(&self, event: ProgressEvent) -> Result<(), SinkError>;
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgressSink;

#[async_trait]
impl ProgressSink for NoopProgressSink {
    async fn publish(&self, _event: ProgressEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Forwards events into a bounded channel, read back as a `Stream`.
#[derive(Debug, Clone)]
pub struct ChannelProgressSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ChannelProgressSink {
    /// Create a sink and the stream of events it receives.
    pub fn channel(capacity: usize) -> (Self, ReceiverStream<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, ReceiverStream::new(rx))
    }
}

#[async_trait]
impl ProgressSink for ChannelProgressSink {
    async fn publish(&self, event: ProgressEvent) -> Result<(), SinkError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| "progress receiver dropped".into())
    }
}

/// Call-scoped progress emitter.
///
/// Never shared between two parse invocations. Chunk tasks of the same
/// invocation share it through an `Arc`.
pub struct ProgressReporter {
    call_id: Uuid,
    workflow_id: Option<String>,
    /// Sequence counter and sender, locked together so channel order
    /// matches sequence order.
    emitter: Mutex<Emitter>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

struct Emitter {
    next: u64,
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressReporter {
    /// Create a reporter and spawn its forwarding task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(sink: Arc<dyn ProgressSink>, workflow_id: Option<String>) -> Self {
        let call_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();

        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let stage = event.stage;
                let sequence = event.sequence;
                if let Err(e) = sink.publish(event).await {
                    warn!(
                        "Progress sink rejected event {} ({}) for call {}: {}",
                        sequence, stage, call_id, e
                    );
                }
            }
        });

        Self {
            call_id,
            workflow_id,
            emitter: Mutex::new(Emitter { next: 0, tx: Some(tx) }),
            forwarder: Mutex::new(Some(forwarder)),
        }
    }

    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    fn emitter(&self) -> MutexGuard<'_, Emitter> {
        self.emitter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue one event. Never blocks and never fails.
    pub fn publish_sub_stage_progress(
        &self,
        stage: ProgressStage,
        current: usize,
        total: usize,
        meta: Value,
    ) {
        let mut emitter = self.emitter();
        let Some(tx) = emitter.tx.as_ref() else {
            return;
        };
        let event = ProgressEvent {
            call_id: self.call_id,
            sequence: emitter.next,
            workflow_id: self.workflow_id.clone(),
            stage,
            current,
            total,
            meta,
            emitted_at: Utc::now(),
        };
        if tx.send(event).is_err() {
            debug!("Progress forwarder for call {} has stopped", self.call_id);
            return;
        }
        emitter.next += 1;
    }

    /// Number of events queued so far.
    pub fn emitted(&self) -> u64 {
        self.emitter().next
    }

    /// Close the channel and wait until every queued event was delivered.
    ///
    /// Later publishes are dropped. Calling it twice is harmless.
    pub async fn finish(&self) {
        drop(self.emitter().tx.take());
        let handle = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Progress forwarder for call {} failed: {}", self.call_id, e);
            }
        }
    }
}
