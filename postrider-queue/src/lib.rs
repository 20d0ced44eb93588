//! The durable queue between reception and delivery.
//!
//! Enqueue runs the pre-queue policies, persists every resulting
//! envelope through the storage contract, and acknowledges the caller;
//! a dispatcher task then drives deliveries earliest-deadline-first,
//! rescheduling transient failures through the backoff function and
//! turning permanent failures into bounce envelopes that re-enter the
//! queue with the null sender.

#![deny(clippy::pedantic, clippy::all)]
#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod disk;
pub mod error;
pub mod memory;
pub mod storage;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use postrider_common::{Envelope, Reply};
use postrider_policy::{QueuePolicy, run_policies};
use postrider_relay::{RecipientStatus, Relay};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

pub use disk::DiskStorage;
pub use error::QueueError;
pub use memory::MemoryStorage;
pub use storage::{QueueId, QueueMetadata, QueueStorage, StorageError};

/// Given an envelope and the upcoming attempt number (1-based), decide
/// how long to wait before that attempt. `None` gives the message up as
/// permanently failed. The default backoff never retries.
pub type BackoffFn = dyn Fn(&Envelope, u32) -> Option<Duration> + Send + Sync;

/// Builds the bounce envelope for a permanent failure; `None` suppresses
/// the bounce.
pub type BounceFactory = dyn Fn(&Envelope, &Reply) -> Option<Envelope> + Send + Sync;

/// Exponential backoff capped at `max_delay`, giving up after
/// `max_attempts`.
#[must_use]
pub fn exponential_backoff(
    base: Duration,
    max_delay: Duration,
    max_attempts: u32,
) -> Box<BackoffFn> {
    Box::new(move |_envelope, attempts| {
        if attempts > max_attempts {
            return None;
        }
        let shift = attempts.saturating_sub(1).min(16);
        Some((base * 2u32.pow(shift)).min(max_delay))
    })
}

/// Outcome of enqueueing one post-policy envelope.
#[derive(Debug)]
pub struct Enqueued {
    pub envelope: Envelope,
    pub result: Result<QueueId, QueueError>,
}

enum WorkItem {
    Schedule { id: QueueId, when: SystemTime },
    Flush,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct Scheduled {
    when: SystemTime,
    id_key: String,
}

struct QueueInner {
    storage: Arc<dyn QueueStorage>,
    relay: Option<Arc<dyn Relay>>,
    backoff: Box<BackoffFn>,
    policies: Vec<Box<dyn QueuePolicy>>,
    bounce_factory: Box<BounceFactory>,
    work: mpsc::UnboundedSender<WorkItem>,
    in_flight: Mutex<HashSet<QueueId>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for QueueInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("storage", &self.storage)
            .field("policies", &self.policies.len())
            .finish_non_exhaustive()
    }
}

impl QueueInner {
    async fn enqueue(self: &Arc<Self>, envelope: Envelope) -> Result<Vec<Enqueued>, QueueError> {
        if *self.shutdown.borrow() {
            return Err(QueueError::ShuttingDown);
        }
        if envelope.recipients.is_empty() {
            return Err(QueueError::NoRecipients);
        }

        let envelopes = run_policies(&self.policies, envelope)?;
        let metadata = QueueMetadata::fresh();
        let mut results = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            let result = self
                .storage
                .write(&envelope, &metadata)
                .await
                .map_err(QueueError::from);
            if let Ok(id) = &result {
                debug!(%id, %envelope, "enqueued");
                let _ = self.work.send(WorkItem::Schedule {
                    id: id.clone(),
                    when: metadata.next_attempt,
                });
            }
            results.push(Enqueued { envelope, result });
        }
        Ok(results)
    }

    fn clear_in_flight(&self, id: &QueueId) {
        self.in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(id);
    }

    fn mark_in_flight(&self, id: &QueueId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id.clone())
    }

    fn is_in_flight(&self, id: &QueueId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(id)
    }
}

/// The queue engine. Cheap to clone handles are not provided; share it
/// behind an [`Arc`].
#[derive(Debug)]
pub struct Queue {
    inner: Arc<QueueInner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Queue {
    #[must_use]
    pub fn builder(storage: Arc<dyn QueueStorage>) -> QueueBuilder {
        QueueBuilder::new(storage)
    }

    /// Run an envelope through the policies and persist the results.
    /// The returned vector pairs each post-policy envelope with its
    /// storage outcome; delivery is scheduled asynchronously.
    pub async fn enqueue(&self, envelope: Envelope) -> Result<Vec<Enqueued>, QueueError> {
        self.inner.enqueue(envelope).await
    }

    /// Dispatch everything in the queue now, ignoring retry timers.
    pub fn flush(&self) {
        let _ = self.inner.work.send(WorkItem::Flush);
    }

    /// Stop the dispatcher and wait for in-flight deliveries to finish
    /// recording their results. Subsequent enqueues fail transient.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

pub struct QueueBuilder {
    storage: Arc<dyn QueueStorage>,
    relay: Option<Arc<dyn Relay>>,
    backoff: Box<BackoffFn>,
    policies: Vec<Box<dyn QueuePolicy>>,
    bounce_factory: Box<BounceFactory>,
}

impl QueueBuilder {
    #[must_use]
    pub fn new(storage: Arc<dyn QueueStorage>) -> Self {
        let default_bounce = postrider_relay::BounceGenerator::new("localhost");
        Self {
            storage,
            relay: None,
            backoff: Box::new(|_, _| None),
            policies: Vec::new(),
            bounce_factory: Box::new(move |envelope, reply| default_bounce.build(envelope, reply)),
        }
    }

    /// The relay that delivery attempts go through. Without one the
    /// queue only stores.
    #[must_use]
    pub fn relay(mut self, relay: Arc<dyn Relay>) -> Self {
        self.relay = Some(relay);
        self
    }

    #[must_use]
    pub fn backoff(mut self, backoff: Box<BackoffFn>) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: Box<dyn QueuePolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    #[must_use]
    pub fn bounce_factory(mut self, factory: Box<BounceFactory>) -> Self {
        self.bounce_factory = factory;
        self
    }

    /// Recover existing records from storage, schedule them at their
    /// stored timestamps, and start the dispatcher.
    pub async fn start(self) -> Result<Queue, QueueError> {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(QueueInner {
            storage: self.storage,
            relay: self.relay,
            backoff: self.backoff,
            policies: self.policies,
            bounce_factory: self.bounce_factory,
            work: work_tx,
            in_flight: Mutex::new(HashSet::new()),
            shutdown: shutdown_tx,
        });

        let recovered = inner.storage.load_all().await?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered queue records from storage");
        }
        for (id, metadata) in recovered {
            let _ = inner.work.send(WorkItem::Schedule {
                id,
                when: metadata.next_attempt,
            });
        }

        let dispatcher = inner.relay.as_ref().map(|_| {
            tokio::spawn(dispatcher_loop(Arc::clone(&inner), work_rx, shutdown_rx))
        });

        Ok(Queue {
            inner,
            dispatcher: Mutex::new(dispatcher),
        })
    }
}

/// Idle sleep when nothing is scheduled.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

async fn dispatcher_loop(
    inner: Arc<QueueInner>,
    mut work: mpsc::UnboundedReceiver<WorkItem>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut heap: BinaryHeap<Reverse<Scheduled>> = BinaryHeap::new();
    let mut queued: HashSet<String> = HashSet::new();
    let mut attempts: JoinSet<()> = JoinSet::new();

    loop {
        // Hand every due entry to a delivery task.
        loop {
            let due = heap
                .peek()
                .is_some_and(|Reverse(entry)| entry.when <= SystemTime::now());
            if !due {
                break;
            }
            if let Some(Reverse(entry)) = heap.pop() {
                queued.remove(&entry.id_key);
                launch(&inner, &mut heap, &mut queued, &mut attempts, entry);
            }
        }

        let next_wait = heap.peek().map_or(IDLE_WAIT, |Reverse(entry)| {
            entry
                .when
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO)
        });

        tokio::select! {
            item = work.recv() => match item {
                Some(WorkItem::Schedule { id, when }) => {
                    if queued.insert(id.as_str().to_owned()) {
                        heap.push(Reverse(Scheduled { when, id_key: id.as_str().to_owned() }));
                    }
                }
                Some(WorkItem::Flush) => {
                    while let Some(Reverse(entry)) = heap.pop() {
                        queued.remove(&entry.id_key);
                        launch(&inner, &mut heap, &mut queued, &mut attempts, entry);
                    }
                }
                None => break,
            },
            () = tokio::time::sleep(next_wait) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            Some(_) = attempts.join_next(), if !attempts.is_empty() => {}
        }
    }

    // Let in-flight deliveries finish so their results are recorded.
    while attempts.join_next().await.is_some() {}
    debug!("queue dispatcher stopped");
}

fn launch(
    inner: &Arc<QueueInner>,
    heap: &mut BinaryHeap<Reverse<Scheduled>>,
    queued: &mut HashSet<String>,
    attempts: &mut JoinSet<()>,
    entry: Scheduled,
) {
    let id = QueueId::from(entry.id_key.clone());
    if inner.is_in_flight(&id) {
        // Still being delivered; look again shortly.
        if queued.insert(entry.id_key.clone()) {
            heap.push(Reverse(Scheduled {
                when: SystemTime::now() + Duration::from_secs(1),
                id_key: entry.id_key,
            }));
        }
        return;
    }
    inner.mark_in_flight(&id);
    let inner = Arc::clone(inner);
    attempts.spawn(async move {
        attempt(&inner, &id).await;
        inner.clear_in_flight(&id);
    });
}

/// One delivery attempt for one stored record.
async fn attempt(inner: &Arc<QueueInner>, id: &QueueId) {
    let Some(relay) = inner.relay.clone() else {
        return;
    };
    let (envelope, metadata) = match inner.storage.get(id).await {
        Ok(pair) => pair,
        Err(StorageError::NotFound(_)) => return,
        Err(err) => {
            warn!(%id, error = %err, "could not load queue record for delivery");
            return;
        }
    };
    if envelope.recipients.is_empty() {
        let _ = inner.storage.remove(id).await;
        return;
    }

    debug!(%id, attempts = metadata.attempts, "attempting delivery");
    match relay.attempt(&envelope, metadata.attempts).await {
        Ok(result) => handle_result(inner, id, &envelope, &metadata, result.statuses).await,
        Err(err) => {
            let reply = err.reply().clone();
            if err.is_permanent() {
                perm_fail(inner, Some(id), &envelope, reply).await;
            } else {
                let replies: Vec<(usize, Reply)> = (0..envelope.recipients.len())
                    .map(|i| (i, reply.clone()))
                    .collect();
                retry_later(inner, id, &envelope, &metadata, &replies).await;
            }
        }
    }
}

/// Fold per-recipient outcomes back into the stored record: delivered
/// and permanently failed recipients leave the record, transient ones
/// reschedule it.
async fn handle_result(
    inner: &Arc<QueueInner>,
    id: &QueueId,
    envelope: &Envelope,
    metadata: &QueueMetadata,
    statuses: Vec<RecipientStatus>,
) {
    let mut handled = Vec::new();
    let mut permfails: Vec<(usize, Reply)> = Vec::new();
    let mut tempfails: Vec<(usize, Reply)> = Vec::new();

    for (index, status) in statuses.into_iter().enumerate() {
        match status {
            RecipientStatus::Delivered(_) => handled.push(index),
            RecipientStatus::Permanent(reply) => {
                handled.push(index);
                permfails.push((index, reply));
            }
            RecipientStatus::Transient(reply) => tempfails.push((index, reply)),
        }
    }

    for (reply, indexes) in group_by_reply(&permfails) {
        let failed = envelope.narrowed(&indexes);
        perm_fail(inner, None, &failed, reply).await;
    }

    if tempfails.is_empty() {
        let _ = inner.storage.remove(id).await;
        return;
    }

    let temp_indexes: Vec<usize> = tempfails.iter().map(|(i, _)| *i).collect();
    let retry_envelope = envelope.narrowed(&temp_indexes);
    let rescheduled = retry_later(inner, id, &retry_envelope, metadata, &tempfails).await;
    if rescheduled && !handled.is_empty() {
        if let Err(err) = inner.storage.set_recipients_delivered(id, &handled).await {
            warn!(%id, error = %err, "could not narrow stored recipient list");
        }
    }
}

/// Consult the backoff; reschedule on `Some`, turn permanent on `None`.
/// Returns whether the record is still queued.
async fn retry_later(
    inner: &Arc<QueueInner>,
    id: &QueueId,
    envelope: &Envelope,
    metadata: &QueueMetadata,
    failures: &[(usize, Reply)],
) -> bool {
    let attempts = metadata.attempts + 1;
    if let Some(delay) = (inner.backoff)(envelope, attempts) {
        let when = SystemTime::now() + delay;
        let next = QueueMetadata {
            attempts,
            next_attempt: when,
        };
        if let Err(err) = inner.storage.write_metadata(id, &next).await {
            warn!(%id, error = %err, "could not record retry metadata");
        }
        debug!(%id, attempts, delay_secs = delay.as_secs(), "retry scheduled");
        let _ = inner.work.send(WorkItem::Schedule {
            id: id.clone(),
            when,
        });
        return true;
    }

    // Out of retries; each distinct failure reply bounces on its own.
    info!(%id, attempts, "giving up after too many retries");
    let local: Vec<(usize, Reply)> = failures
        .iter()
        .enumerate()
        .map(|(local_index, (_, reply))| (local_index, reply.clone()))
        .collect();
    for (mut reply, indexes) in group_by_reply(&local) {
        reply.append_text(" (Too many retries)");
        let failed = envelope.narrowed(&indexes);
        perm_fail(inner, None, &failed, reply).await;
    }
    let _ = inner.storage.remove(id).await;
    false
}

/// Remove the record (when an id is given) and bounce unless the sender
/// is null.
async fn perm_fail(
    inner: &Arc<QueueInner>,
    id: Option<&QueueId>,
    envelope: &Envelope,
    reply: Reply,
) {
    if let Some(id) = id {
        let _ = inner.storage.remove(id).await;
    }
    if envelope.sender.is_none() {
        // A bounce that itself failed; log it and stop the loop here.
        info!(%reply, "dropping permanently failed bounce envelope");
        return;
    }
    if let Some(bounce) = (inner.bounce_factory)(envelope, &reply) {
        if let Err(err) = inner.enqueue(bounce).await {
            warn!(error = %err, "could not enqueue bounce");
        }
    }
}

/// Group `(index, reply)` pairs by equal reply, preserving first-seen
/// order.
fn group_by_reply(failures: &[(usize, Reply)]) -> Vec<(Reply, Vec<usize>)> {
    let mut groups: Vec<(Reply, Vec<usize>)> = Vec::new();
    for (index, reply) in failures {
        match groups.iter_mut().find(|(r, _)| r == reply) {
            Some((_, indexes)) => indexes.push(*index),
            None => groups.push((reply.clone(), vec![*index])),
        }
    }
    groups
}
