//! The typed mailbox abstraction between adjacent execution nodes
//! (`spec.md` section 5).
//!
//! Messaging between nodes uses typed mailboxes with FIFO ordering per
//! sender-receiver pair. At most `N` non-empty batches may be outstanding
//! between any two adjacent nodes (default 20, `spec.md` section 4.5);
//! ticks don't count against the bound and exist precisely so a stalled
//! producer can advertise liveness.

use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::diagnostic::Diagnostic;
use crate::element::AnyBatch;

/// A message flowing through one mailbox, tagged per `spec.md` section 9's
/// "Actor system with typed messaging" replacement: `Start`/`Stop`/`Batch`/
/// `Ack`/`Down`/`Diagnostic` as a sum type rather than heterogeneous actor
/// messages.
#[derive(Debug)]
pub enum Message {
    /// Sent to the sink first, then forwarded upstream by each node in
    /// turn (`spec.md` section 4.6 step 4); establishes back-pressure
    /// before any source begins producing.
    Start,
    /// Requests a node stop; idempotent (testable property 8).
    Stop,
    /// A data or tick batch flowing downstream.
    Batch(AnyBatch),
    /// Credit returned upstream once a batch has been consumed, per the
    /// in-flight bound (`spec.md` section 4.5).
    Ack,
    /// Reported by a node to the executor when it terminates, carrying the
    /// clean/failed outcome.
    Down(Result<(), crate::error::PipelineError>),
    /// A diagnostic forwarded to the pipeline's diagnostic handler.
    Diagnostic(Diagnostic),
}

/// One end of a bounded mailbox carrying batches from one node to its
/// immediate downstream neighbor, plus a separate, unbounded credit-return
/// channel running the other way.
///
/// The data channel's capacity is the in-flight bound `N`
/// (`RuntimeConfig::max_inflight`, default 20): `spec.md` section 4.5 says
/// ticks must not count against it, so ticks are sent as credit-free
/// out-of-band messages via [`Mailbox::send_tick`] instead of occupying a
/// data-channel slot.
pub struct Mailbox {
    data: Sender<AnyBatch>,
    ticks: Sender<AnyBatch>,
    credit: Receiver<()>,
}

pub struct MailboxReceiver {
    data: Receiver<AnyBatch>,
    ticks: Receiver<AnyBatch>,
    credit: Sender<()>,
}

/// Creates one edge's mailbox, bounded to `capacity` non-empty batches.
pub fn bounded(capacity: usize) -> (Mailbox, MailboxReceiver) {
    let (data_tx, data_rx) = flume::bounded(capacity);
    let (tick_tx, tick_rx) = flume::unbounded();
    let (credit_tx, credit_rx) = flume::unbounded();
    (
        Mailbox {
            data: data_tx,
            ticks: tick_tx,
            credit: credit_rx,
        },
        MailboxReceiver {
            data: data_rx,
            ticks: tick_rx,
            credit: credit_tx,
        },
    )
}

impl Mailbox {
    /// Sends a non-empty batch, suspending the caller (a cooperative
    /// reschedule point, `spec.md` section 5) if the in-flight bound has
    /// been reached.
    pub fn send_batch(&self, batch: AnyBatch) -> Result<(), AnyBatch> {
        debug_assert!(!batch.is_tick());
        self.data.send(batch).map_err(|e| e.into_inner())
    }

    /// Sends a tick; never blocks and never consumes in-flight credit.
    pub fn send_tick(&self, batch: AnyBatch) -> Result<(), AnyBatch> {
        debug_assert!(batch.is_tick());
        self.ticks.send(batch).map_err(|e| e.into_inner())
    }

    /// Attempts to return one unit of credit without blocking, used by the
    /// consumer after it finishes processing one in-flight batch.
    pub fn is_closed(&self) -> bool {
        self.data.is_disconnected()
    }
}

impl MailboxReceiver {
    /// Blocks for the next tick or data batch, preferring ticks so a
    /// stalled producer's liveness signal is never starved behind a full
    /// data queue -- ticks are delivered out of band precisely so they
    /// can't be.
    pub fn recv(&self) -> Option<AnyBatch> {
        if let Ok(tick) = self.ticks.try_recv() {
            return Some(tick);
        }
        match self.data.recv() {
            Ok(batch) => {
                let _ = self.credit.send(());
                Some(batch)
            }
            Err(_) => self.ticks.try_recv().ok(),
        }
    }

    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Result<Option<AnyBatch>, RecvTimeoutError> {
        if let Ok(tick) = self.ticks.try_recv() {
            return Ok(Some(tick));
        }
        match self.data.recv_timeout(timeout) {
            Ok(batch) => {
                let _ = self.credit.send(());
                Ok(Some(batch))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => self
                .ticks
                .try_recv()
                .map(Some)
                .or(Ok(None)),
        }
    }

    pub fn try_recv(&self) -> Option<AnyBatch> {
        if let Ok(tick) = self.ticks.try_recv() {
            return Some(tick);
        }
        match self.data.try_recv() {
            Ok(batch) => {
                let _ = self.credit.send(());
                Some(batch)
            }
            Err(_) => None,
        }
    }
}

/// Attempts a non-blocking send of a non-empty batch; used by a producer
/// that wants to yield a tick instead of suspending when the bound is
/// reached, rather than block.
pub fn try_send_batch(mailbox: &Mailbox, batch: AnyBatch) -> Result<(), TrySendError<AnyBatch>> {
    mailbox.data.try_send(batch)
}
