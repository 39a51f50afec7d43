//! Outbound notifications from the download engine.

use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::download::DownloadState;
use crate::store::DownloadId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A record was created; a run should be scheduled.
    DownloadQueued { id: DownloadId, path: PathBuf },
    /// A paused download was resumed; a new run should be scheduled.
    DownloadResumed(DownloadId),
    Progress(DownloadState),
    Monitor(String),
}

impl NodeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            NodeEvent::DownloadQueued { .. } => "download:queued",
            NodeEvent::DownloadResumed(_) => "download:resumed",
            NodeEvent::Progress(_) => "download:progress",
            NodeEvent::Monitor(_) => "monitor",
        }
    }
}

/// Where events go. Emitting never blocks and never fails the caller.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: NodeEvent);
}

/// Forwards events to an unbounded channel; events after the receiver is gone are dropped.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<NodeEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: NodeEvent) {
        if let Err(err) = self.tx.send(event) {
            tracing::debug!(event = err.0.name(), "event dropped: no receiver");
        }
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: NodeEvent) {}
}
