//! Bounded per-connection outbound queue.
//!
//! The hub and the connection's own reader hold [`Outbox`] clones; the
//! writer owns the single [`Inbox`]. Closing is explicit so that the hub can
//! end a writer even while other senders are still alive.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::protocol::ServerEnvelope;

pub type Envelope = Arc<ServerEnvelope>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("mailbox full")]
    Full,
    #[error("mailbox closed")]
    Closed,
}

pub fn mailbox(capacity: usize) -> (Outbox, Inbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let closed = CancellationToken::new();
    (
        Outbox {
            tx,
            closed: closed.clone(),
        },
        Inbox { rx, closed },
    )
}

#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Envelope>,
    closed: CancellationToken,
}

impl Outbox {
    /// Enqueues without waiting; a full queue is reported, never awaited.
    pub fn try_deliver(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        if self.closed.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.tx.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Idempotent. The inbox still yields whatever was queued before closing.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::Receiver<Envelope>,
    closed: CancellationToken,
}

impl Inbox {
    /// Next envelope, or `None` once the mailbox is closed and drained.
    pub async fn recv(&mut self) -> Option<Envelope> {
        if self.closed.is_cancelled() {
            return self.rx.try_recv().ok();
        }

        tokio::select! {
            biased;
            envelope = self.rx.recv() => envelope,
            () = self.closed.cancelled() => self.rx.try_recv().ok(),
        }
    }
}
