//! Structured progress events for indexing runs.
//!
//! The controller emits one event stream per run; callers choose where it
//! goes by supplying a [`ProgressReporter`]. Percentages are per-phase.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

/// Phases of one indexing run, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IndexPhase {
    Discovering,
    Diffing,
    Deleting,
    Chunking,
    Embedding,
    IndexingFiles,
    Verifying,
    Persisting,
    Done,
}

impl IndexPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovering => "Discovering",
            Self::Diffing => "Diffing",
            Self::Deleting => "Deleting",
            Self::Chunking => "Chunking",
            Self::Embedding => "Embedding",
            Self::IndexingFiles => "Indexing files",
            Self::Verifying => "Verifying",
            Self::Persisting => "Persisting",
            Self::Done => "Done",
        }
    }
}

/// One progress event.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub phase: IndexPhase,
    pub current: u64,
    pub total: u64,
    pub percentage: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProgressEvent {
    pub fn new(phase: IndexPhase, current: u64, total: u64) -> Self {
        let percentage = if total == 0 {
            100.0
        } else {
            (current as f32 / total as f32) * 100.0
        };
        Self {
            phase,
            current,
            total,
            percentage,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Consumes progress events. Implementations must be cheap; the
/// controller calls this inline.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Discards everything.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Emits each event as a tracing info line.
pub struct TracingProgress;

impl ProgressReporter for TracingProgress {
    fn report(&self, event: ProgressEvent) {
        info!(
            phase = event.phase.as_str(),
            current = event.current,
            total = event.total,
            percentage = event.percentage,
            detail = event.detail.as_deref().unwrap_or(""),
            "progress"
        );
    }
}

/// Forwards events onto an unbounded channel, for callers that render
/// progress elsewhere (a CLI spinner, an MCP notification stream).
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressReporter for ChannelProgress {
    fn report(&self, event: ProgressEvent) {
        // A dropped receiver just means nobody is watching.
        let _ = self.tx.send(event);
    }
}
