//! Strictly ordered single-worker task queue.
//!
//! Every job submitted to a [`DispatchQueue`] is processed by exactly one
//! tokio task, one at a time, in submission order. Producers never wait: the
//! channel is unbounded and `submit` returns immediately.
//!
//! Cancellation works by epoch. Each submission is stamped with the epoch
//! current at the time; [`DispatchQueue::cancel_pending`] moves the epoch
//! forward, and any cancellable job stamped with an older epoch is handed to
//! [`Handler::cancelled`] instead of [`Handler::handle`] when the worker
//! reaches it. A job the worker has already started is never interrupted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Whether the worker keeps going after a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Jobs declare whether `cancel_pending` may skip them.
pub trait Cancellable {
    fn is_cancellable(&self) -> bool;
}

/// The single consumer of a queue.
pub trait Handler<J>: Send + 'static {
    /// Run one job.
    fn handle(&mut self, job: J) -> Flow;

    /// Receive a job that was cancelled before it started.
    fn cancelled(&mut self, job: J);
}

struct Envelope<J> {
    epoch: u64,
    job: J,
}

/// Submission side of the queue. Cheap to clone.
pub struct DispatchQueue<J> {
    tx: mpsc::UnboundedSender<Envelope<J>>,
    epoch: Arc<AtomicU64>,
}

impl<J> Clone for DispatchQueue<J> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            epoch: Arc::clone(&self.epoch),
        }
    }
}

/// Receiving side, consumed when the worker is spawned.
pub struct Inbox<J> {
    rx: mpsc::UnboundedReceiver<Envelope<J>>,
    epoch: Arc<AtomicU64>,
}

impl<J> DispatchQueue<J>
where
    J: Cancellable + Send + 'static,
{
    /// Create a queue and the inbox its worker will drain.
    pub fn channel() -> (Self, Inbox<J>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let epoch = Arc::new(AtomicU64::new(0));
        (
            Self {
                tx,
                epoch: Arc::clone(&epoch),
            },
            Inbox { rx, epoch },
        )
    }

    /// Enqueue a job behind everything already submitted.
    ///
    /// Returns the job back if the worker has stopped.
    pub fn submit(&self, job: J) -> Result<(), J> {
        let envelope = Envelope {
            epoch: self.epoch.load(Ordering::SeqCst),
            job,
        };
        self.tx.send(envelope).map_err(|err| err.0.job)
    }

    /// Cancel every cancellable job that has not started yet.
    pub fn cancel_pending(&self) {
        let previous = self.epoch.fetch_add(1, Ordering::SeqCst);
        debug!(epoch = previous + 1, "Cancelled pending dispatch jobs");
    }

    /// Check whether the worker is still accepting jobs.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<J> Inbox<J>
where
    J: Cancellable + Send + 'static,
{
    /// Start the single worker task.
    ///
    /// The task ends when the handler returns [`Flow::Stop`] or every
    /// [`DispatchQueue`] handle has been dropped.
    pub fn spawn<H>(self, handler: H) -> JoinHandle<()>
    where
        H: Handler<J>,
    {
        tokio::spawn(self.run(handler))
    }

    async fn run<H>(mut self, mut handler: H)
    where
        H: Handler<J>,
    {
        while let Some(envelope) = self.rx.recv().await {
            let current = self.epoch.load(Ordering::SeqCst);
            if envelope.job.is_cancellable() && envelope.epoch < current {
                handler.cancelled(envelope.job);
                continue;
            }

            if handler.handle(envelope.job) == Flow::Stop {
                break;
            }
        }
        debug!("Dispatch worker stopped");
    }
}
