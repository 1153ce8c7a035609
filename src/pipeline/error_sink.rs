//! Shared dead-letter channel.
//!
//! Every stage executor of a pipeline holds a clone of the same sink. The
//! sink is bounded on its own (`engine.error_buffer`) so error volume never
//! borrows capacity from the main stream. It ends only through an explicit
//! [`ErrorSink::close`], issued once by the composer after the last stage
//! has drained.

use crate::error::StageError;
use crate::types::{ErrorRecord, Message};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ErrorSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    sender: Mutex<Option<mpsc::Sender<ErrorRecord>>>,
    emitted: AtomicU64,
    rejected: AtomicU64,
}

impl ErrorSink {
    /// Create a sink and the stream its records are read from.
    pub fn channel(capacity: usize) -> (Self, ReceiverStream<ErrorRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            inner: Arc::new(SinkInner {
                sender: Mutex::new(Some(tx)),
                emitted: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
        };
        (sink, ReceiverStream::new(rx))
    }

    /// Divert `message` to the dead-letter stream. Waits while the buffer is
    /// full. Records sent after `close` or after the reader went away are
    /// counted and dropped.
    pub async fn send(&self, stage: &str, message: Message, cause: StageError) {
        let record = ErrorRecord::new(stage, message, cause);
        warn!("Stage {} diverted item to error sink: {}", stage, record.cause);

        let sender = self.inner.sender.lock().clone();
        let Some(sender) = sender else {
            self.inner.rejected.fetch_add(1, Ordering::Relaxed);
            warn!("Error sink already closed, dropping record from stage {}", stage);
            return;
        };

        match sender.send(record).await {
            Ok(()) => {
                self.inner.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                debug!("Error stream reader dropped, discarding record from stage {}", stage);
            }
        }
    }

    /// Signal completion on the error stream. Returns `true` only for the
    /// call that actually closed it.
    pub fn close(&self) -> bool {
        let closed = self.inner.sender.lock().take().is_some();
        if closed {
            debug!(
                "Error sink closed after {} records",
                self.inner.emitted.load(Ordering::Relaxed)
            );
        }
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.inner.sender.lock().is_none()
    }

    pub fn emitted(&self) -> u64 {
        self.inner.emitted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.inner.rejected.load(Ordering::Relaxed)
    }
}
