//! Progress reporting for multipart transfers
//!
//! The orchestrators publish a [`ProgressEvent`] when a transfer starts, after
//! every completed part, and when the transfer completes or fails. Events go
//! to a caller-supplied [`ProgressListener`]. Listeners are called inline on
//! the orchestrator task and must return promptly; [`ChannelListener`]
//! forwards events over an unbounded channel so slow consumers never stall
//! the transfer.
//!
//! # Example
//!
//! ```no_run
//! use ostransfer::core::progress::{ChannelListener, ProgressEventType};
//!
//! # async fn example() {
//! let (listener, mut events) = ChannelListener::new();
//!
//! tokio::spawn(async move {
//!     while let Some(event) = events.recv().await {
//!         if event.event_type == ProgressEventType::Data {
//!             println!("{}/{} bytes", event.consumed_bytes, event.total_bytes);
//!         }
//!     }
//! });
//! // Downloader::new(...).with_progress(listener) ...
//! # }
//! ```

use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Kind of progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEventType {
    /// Transfer started
    Started,
    /// A part completed
    Data,
    /// Every part completed and the result was assembled
    Completed,
    /// Transfer failed
    Failed,
}

/// Aggregate transfer progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub event_type: ProgressEventType,
    /// Bytes completed so far, including parts resumed from a checkpoint
    pub consumed_bytes: u64,
    /// Bytes in the whole transfer span
    pub total_bytes: u64,
    /// Bytes moved by the part that triggered this event
    pub rw_bytes: u64,
}

/// Receives progress events
pub trait ProgressListener: Send + Sync {
    /// Handle one event; must not block
    fn on_event(&self, event: &ProgressEvent);
}

impl<F> ProgressListener for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Listener forwarding events over an unbounded channel
#[derive(Clone)]
pub struct ChannelListener {
    sender: UnboundedSender<ProgressEvent>,
}

impl ChannelListener {
    /// Create a listener and the receiving end of its channel
    pub fn new() -> (Self, UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ProgressListener for ChannelListener {
    fn on_event(&self, event: &ProgressEvent) {
        // Receiver may be gone
        let _ = self.sender.send(*event);
    }
}

/// Publishes events for one transfer to an optional listener
#[derive(Clone, Default)]
pub(crate) struct ProgressPublisher {
    listener: Option<Arc<dyn ProgressListener>>,
}

impl ProgressPublisher {
    pub(crate) fn new(listener: Option<Arc<dyn ProgressListener>>) -> Self {
        Self { listener }
    }

    fn publish(&self, event_type: ProgressEventType, consumed: u64, total: u64, rw: u64) {
        if let Some(listener) = &self.listener {
            listener.on_event(&ProgressEvent {
                event_type,
                consumed_bytes: consumed,
                total_bytes: total,
                rw_bytes: rw,
            });
        }
    }

    pub(crate) fn started(&self, consumed: u64, total: u64) {
        self.publish(ProgressEventType::Started, consumed, total, 0);
    }

    pub(crate) fn data(&self, consumed: u64, total: u64, rw: u64) {
        self.publish(ProgressEventType::Data, consumed, total, rw);
    }

    pub(crate) fn completed(&self, consumed: u64, total: u64) {
        self.publish(ProgressEventType::Completed, consumed, total, 0);
    }

    pub(crate) fn failed(&self, consumed: u64, total: u64) {
        self.publish(ProgressEventType::Failed, consumed, total, 0);
    }
}
