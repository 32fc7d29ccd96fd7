//! Delivery coordinator: the producer-facing half of the shipper.
//!
//! A [`DeliveryCoordinator`] owns a [`RecordBuffer`] and one transport, both
//! held by a single dispatch worker. Appends, flush requests, transport
//! notifications and POST completions all arrive at that worker as jobs and
//! are handled one at a time, so the buffer is never touched concurrently
//! and a flush never snapshots the buffer while another one is writing.
//!
//! Records leave the buffer only after delivery is confirmed: a `Wrote(tag)`
//! notification on the streaming path, a 2xx response for the batch on the
//! HTTP path. Anything else leaves them pending for the next flush.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Url;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::buffer::{BufferStats, PendingEntry, RecordBuffer, Tag};
use crate::config::{Config, Destination};
use crate::dispatch::{Cancellable, DispatchQueue, Flow, Handler};
use crate::error::DeliveryError;
use crate::http::{HttpTransport, StagedPayload};
use crate::record::{LogRecord, TOKEN_KEY};
use crate::stream::StreamTransport;
use crate::tls::TrustPolicy;
use crate::transport::{EventHandler, Transport, TransportEvent};

pub use crate::http::Headers;

/// Callback receiving the outcome of one flush.
pub type Completion = Box<dyn FnOnce(Result<(), DeliveryError>) + Send + 'static>;

enum Job {
    Append(LogRecord),
    ForceSend {
        headers: Headers,
        completion: Completion,
    },
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    Posted {
        tags: Vec<Tag>,
        result: Result<(), DeliveryError>,
        completion: Completion,
    },
    Stats(oneshot::Sender<BufferStats>),
    Cancel,
    Shutdown,
}

impl Cancellable for Job {
    /// Only flush requests may be skipped; appends and acknowledgements
    /// always run.
    fn is_cancellable(&self) -> bool {
        matches!(self, Job::ForceSend { .. })
    }
}

/// Producer handle for one collector destination.
///
/// All methods return immediately; delivery happens on the coordinator's
/// worker task. Dropping the handle cancels queued flushes, disconnects the
/// transport and stops the worker. Records still buffered at that point are
/// lost.
pub struct DeliveryCoordinator {
    queue: DispatchQueue<Job>,
    transport: Arc<dyn Transport>,
    destination: Destination,
}

impl DeliveryCoordinator {
    /// Build the transport for `config` and start the worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn configure(config: Config) -> Result<Self, DeliveryError> {
        tokio::runtime::Handle::try_current().map_err(|e| DeliveryError::Runtime(e.to_string()))?;
        let destination = config.destination()?;

        let (queue, inbox) = DispatchQueue::channel();

        let (strategy, transport): (Strategy, Arc<dyn Transport>) = match &destination {
            Destination::Stream { host, port } => {
                let generation = Arc::new(AtomicU64::new(0));
                let events = event_handler(queue.clone(), Arc::clone(&generation));
                let stream = Arc::new(StreamTransport::new(
                    host.clone(),
                    *port,
                    config.timeout,
                    TrustPolicy::from_allow_untrusted(config.allow_untrusted_server),
                    events,
                )?);
                let flush = StreamFlush {
                    transport: Arc::clone(&stream),
                    phase: StreamPhase::Idle,
                    pending: None,
                    token: config.auth_token.clone(),
                    write_timeout: config.timeout,
                    generation,
                };
                let transport: Arc<dyn Transport> = stream;
                (Strategy::Stream(flush), transport)
            }
            Destination::Http(url) => {
                let http = HttpTransport::new(url.clone(), config.app_id.clone())?;
                let flush = HttpFlush {
                    transport: http.clone(),
                    url: url.clone(),
                    staging_dir: config.staging_dir.clone(),
                    in_flight: HashSet::new(),
                    token: config.auth_token.clone(),
                    post_timeout: config.post_timeout,
                    queue: queue.clone(),
                };
                let transport: Arc<dyn Transport> = Arc::new(http);
                (Strategy::Http(flush), transport)
            }
        };

        inbox.spawn(Worker {
            buffer: RecordBuffer::new(),
            strategy,
        });

        info!(
            destination = %destination,
            secure = destination.is_secure(),
            allow_untrusted = config.allow_untrusted_server,
            "Delivery coordinator configured"
        );

        Ok(Self {
            queue,
            transport,
            destination,
        })
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Check whether the transport currently holds a connection (stream) or
    /// has a request in flight (HTTP).
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn is_secure(&self) -> bool {
        self.transport.is_secure()
    }

    /// Buffer a record for delivery.
    ///
    /// The record is stamped with the current UTC time under `@timestamp`
    /// unless it already carries one.
    pub fn append(&self, mut record: LogRecord) {
        record.stamp(Utc::now());
        if self.queue.submit(Job::Append(record)).is_err() {
            warn!("Delivery worker has stopped, record discarded");
        }
    }

    /// Request a flush of everything buffered.
    ///
    /// `completion` is invoked exactly once with the outcome. `headers` are
    /// added to the request on the HTTP path and ignored when streaming.
    pub fn force_send<F>(&self, headers: Headers, completion: F)
    where
        F: FnOnce(Result<(), DeliveryError>) + Send + 'static,
    {
        let job = Job::ForceSend {
            headers,
            completion: Box::new(completion),
        };
        if let Err(Job::ForceSend { completion, .. }) = self.queue.submit(job) {
            completion(Err(DeliveryError::Shutdown));
        }
    }

    /// Flush and wait for the outcome.
    pub async fn flush(&self, headers: Headers) -> Result<(), DeliveryError> {
        let (tx, rx) = oneshot::channel();
        self.force_send(headers, move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or(Err(DeliveryError::Shutdown))
    }

    /// Cancel queued flushes and drop the current connection.
    ///
    /// A flush waiting on the connection completes with
    /// [`DeliveryError::Cancelled`]. Unacknowledged records stay buffered. An
    /// HTTP request already sent runs to completion.
    pub fn cancel_sending(&self) {
        self.queue.cancel_pending();
        if self.queue.submit(Job::Cancel).is_err() {
            self.transport.disconnect();
        }
    }

    pub async fn stats(&self) -> Result<BufferStats, DeliveryError> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .submit(Job::Stats(tx))
            .map_err(|_| DeliveryError::Shutdown)?;
        rx.await.map_err(|_| DeliveryError::Shutdown)
    }
}

impl Drop for DeliveryCoordinator {
    fn drop(&mut self) {
        self.cancel_sending();
        let _ = self.queue.submit(Job::Shutdown);
    }
}

/// Route transport events onto the worker queue, stamped with the
/// generation current when the event was emitted.
fn event_handler(queue: DispatchQueue<Job>, generation: Arc<AtomicU64>) -> EventHandler {
    Arc::new(move |event| {
        let job = Job::Transport {
            generation: generation.load(Ordering::SeqCst),
            event,
        };
        if queue.submit(job).is_err() {
            debug!("Delivery worker has stopped, transport event dropped");
        }
    })
}

/// Where the current stream flush stands.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamPhase {
    Idle,
    Connecting,
    Securing,
    /// Waiting for acknowledgement of these writes.
    Writing(BTreeSet<Tag>),
    /// Everything was acknowledged; the session is closing.
    Draining,
}

enum Strategy {
    Stream(StreamFlush),
    Http(HttpFlush),
}

struct Worker {
    buffer: RecordBuffer,
    strategy: Strategy,
}

impl Handler<Job> for Worker {
    fn handle(&mut self, job: Job) -> Flow {
        match job {
            Job::Append(record) => {
                let tag = self.buffer.append(record);
                debug!(tag = %tag, pending = self.buffer.len(), "Record buffered");
            }
            Job::ForceSend {
                headers,
                completion,
            } => {
                if self.buffer.is_empty() {
                    completion(Ok(()));
                    return Flow::Continue;
                }
                match &mut self.strategy {
                    Strategy::Stream(stream) => stream.start(completion),
                    Strategy::Http(http) => http.post_batch(&mut self.buffer, headers, completion),
                }
            }
            Job::Transport { generation, event } => {
                if let Strategy::Stream(stream) = &mut self.strategy {
                    stream.on_event(&mut self.buffer, generation, event);
                }
            }
            Job::Posted {
                tags,
                result,
                completion,
            } => {
                if let Strategy::Http(http) = &mut self.strategy {
                    http.on_posted(&mut self.buffer, tags, result, completion);
                }
            }
            Job::Stats(reply) => {
                let _ = reply.send(self.buffer.stats());
            }
            Job::Cancel => {
                if let Strategy::Stream(stream) = &mut self.strategy {
                    stream.cancel();
                }
            }
            Job::Shutdown => {
                debug!(pending = self.buffer.len(), "Delivery worker shutting down");
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn cancelled(&mut self, job: Job) {
        if let Job::ForceSend { completion, .. } = job {
            debug!("Queued flush cancelled");
            completion(Err(DeliveryError::Cancelled));
        }
    }
}

/// Serialize `entries`, dropping any record that cannot be encoded.
fn encode(
    buffer: &mut RecordBuffer,
    entries: Vec<PendingEntry>,
    token: Option<&str>,
) -> Vec<(Tag, Vec<u8>)> {
    let mut frames = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry.record.to_frame_with_token(token) {
            Ok(frame) => frames.push((entry.tag, frame)),
            Err(e) => {
                warn!(
                    tag = %entry.tag,
                    error = %DeliveryError::from(e),
                    "Dropping record that cannot be serialized"
                );
                buffer.drop_undeliverable(entry.tag);
            }
        }
    }
    frames
}

/// Connect, secure, write everything, close gracefully.
struct StreamFlush {
    transport: Arc<StreamTransport>,
    phase: StreamPhase,
    /// Completion of the flush in progress.
    pending: Option<Completion>,
    token: Option<String>,
    write_timeout: Duration,
    /// Bumped on cancel so events from a dropped session are recognised.
    generation: Arc<AtomicU64>,
}

impl StreamFlush {
    fn start(&mut self, completion: Completion) {
        if self.phase != StreamPhase::Idle || self.transport.is_connected() {
            debug!(phase = ?self.phase, "Flush already in progress");
            completion(Ok(()));
            return;
        }

        self.phase = StreamPhase::Connecting;
        match self.transport.connect() {
            Ok(()) => self.pending = Some(completion),
            Err(e) => {
                warn!(error = %e, "Could not start collector connection");
                self.phase = StreamPhase::Idle;
                completion(Err(e));
            }
        }
    }

    fn on_event(&mut self, buffer: &mut RecordBuffer, generation: u64, event: TransportEvent) {
        if generation != self.generation.load(Ordering::SeqCst) {
            // The write did happen, even if its flush was cancelled.
            if let TransportEvent::Wrote(tag) = event {
                buffer.remove(tag);
            } else {
                debug!(event = ?event, "Ignoring event from a cancelled session");
            }
            return;
        }

        match event {
            TransportEvent::Connected => {
                if self.phase == StreamPhase::Connecting {
                    self.phase = StreamPhase::Securing;
                    self.transport.secure();
                }
            }
            TransportEvent::Secured => {
                if self.phase == StreamPhase::Securing {
                    self.write_all(buffer);
                }
            }
            TransportEvent::Wrote(tag) => self.on_wrote(buffer, tag),
            TransportEvent::Disconnected(error) => {
                self.phase = StreamPhase::Idle;
                match &error {
                    Some(e) => warn!(
                        error = %e,
                        pending = buffer.len(),
                        "Collector session ended with error"
                    ),
                    None => debug!(pending = buffer.len(), "Collector session ended"),
                }
                self.complete(error.map_or(Ok(()), Err));
            }
        }
    }

    fn write_all(&mut self, buffer: &mut RecordBuffer) {
        if !self.transport.is_secure() {
            warn!(error = %DeliveryError::WriteSkipped, "Collector connection lost before writing");
            self.transport.disconnect();
            return;
        }

        let entries = buffer.snapshot_ordered();
        let frames = encode(buffer, entries, self.token.as_deref());

        let mut outstanding = BTreeSet::new();
        for (tag, frame) in frames {
            self.transport.write(frame, tag, self.write_timeout);
            outstanding.insert(tag);
        }
        debug!(writes = outstanding.len(), "Flushing buffered records");

        if outstanding.is_empty() {
            self.phase = StreamPhase::Draining;
            self.complete(Ok(()));
        } else {
            self.phase = StreamPhase::Writing(outstanding);
        }
        self.transport.disconnect_after_pending_writes();
    }

    fn on_wrote(&mut self, buffer: &mut RecordBuffer, tag: Tag) {
        buffer.remove(tag);
        debug!(tag = %tag, pending = buffer.len(), "Record delivered");

        if let StreamPhase::Writing(outstanding) = &mut self.phase {
            outstanding.remove(&tag);
            if outstanding.is_empty() {
                self.phase = StreamPhase::Draining;
                self.complete(Ok(()));
            }
        }
    }

    fn complete(&mut self, result: Result<(), DeliveryError>) {
        if let Some(completion) = self.pending.take() {
            completion(result);
        }
    }

    fn cancel(&mut self) {
        debug!(phase = ?self.phase, "Cancelling collector session");
        self.phase = StreamPhase::Idle;
        self.complete(Err(DeliveryError::Cancelled));
        // Anything emitted after this belongs to the next session.
        self.transport.disconnect();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// Stage a batch, post it, reconcile on the response.
struct HttpFlush {
    transport: HttpTransport,
    url: Url,
    staging_dir: PathBuf,
    /// Tags of batches currently being posted.
    in_flight: HashSet<Tag>,
    token: Option<String>,
    post_timeout: Duration,
    queue: DispatchQueue<Job>,
}

impl HttpFlush {
    fn post_batch(&mut self, buffer: &mut RecordBuffer, mut headers: Headers, completion: Completion) {
        let entries = buffer.snapshot_excluding(&self.in_flight);
        let encoded = encode(buffer, entries, None);
        if encoded.is_empty() {
            debug!(in_flight = self.in_flight.len(), "Nothing new to post");
            completion(Ok(()));
            return;
        }

        let (tags, frames): (Vec<Tag>, Vec<Vec<u8>>) = encoded.into_iter().unzip();
        self.in_flight.extend(tags.iter().copied());
        if let Some(token) = &self.token {
            headers.insert(TOKEN_KEY.to_string(), token.clone());
        }

        let transport = self.transport.clone();
        let url = self.url.clone();
        let staging_dir = self.staging_dir.clone();
        let token = self.token.clone();
        let timeout = self.post_timeout;
        let queue = self.queue.clone();

        debug!(records = tags.len(), url = %url, "Posting batch");
        tokio::spawn(async move {
            let result = match StagedPayload::stage(staging_dir, frames).await {
                Ok(staged) => {
                    let result = transport
                        .post(&url, &headers, staged.path(), token.as_deref(), timeout)
                        .await;
                    staged.discard();
                    result
                }
                Err(e) => Err(e),
            };

            let job = Job::Posted {
                tags,
                result,
                completion,
            };
            if let Err(Job::Posted {
                result, completion, ..
            }) = queue.submit(job)
            {
                completion(result);
            }
        });
    }

    fn on_posted(
        &mut self,
        buffer: &mut RecordBuffer,
        tags: Vec<Tag>,
        result: Result<(), DeliveryError>,
        completion: Completion,
    ) {
        for tag in &tags {
            self.in_flight.remove(tag);
        }

        match result {
            Ok(()) => {
                buffer.remove_all(&tags);
                completion(Ok(()));
            }
            Err(e) => {
                warn!(
                    error = %e,
                    records = tags.len(),
                    pending = buffer.len(),
                    "Batch post failed, records kept for retry"
                );
                completion(Err(e));
            }
        }
    }
}
