//! In-process broker.
//!
//! [`MemoryBroker`] implements [`Broker`] with the delivery semantics the
//! pipeline relies on:
//!
//! - FIFO per queue, prefetch-limited unacked window per channel
//! - unacked deliveries go back to the **front** of the queue (flagged
//!   `redelivered`) when their channel closes
//! - acks on a closed channel fail, like stale AMQP delivery tags
//!
//! It also exposes fault injection (failed publishes, failed channel opens,
//! forced channel closes) and queue inspection. Used for standalone runs and
//! throughout the test suite.

use crate::broker::{Acknowledge, BoxFuture, Broker, BrokerChannel, DeliveryStream, RawDelivery};
use crate::error::PipelineError;
use crate::headers::Headers;
use crate::queue::{ChannelSpec, QueueName};
use dashmap::DashMap;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Fallback wake-up for idle consumers in case a notification is missed.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// A message sitting in a memory queue.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub redelivered: bool,
}

#[derive(Default)]
struct Faults {
    fail_publishes: AtomicUsize,
    fail_opens: AtomicUsize,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct MemoryQueue {
    ready: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
    published: AtomicUsize,
    acked: AtomicUsize,
}

impl MemoryQueue {
    fn push_back(&self, message: StoredMessage) {
        lock(&self.ready).push_back(message);
        self.notify.notify_one();
    }
}

/// In-process [`Broker`] with fault injection.
pub struct MemoryBroker {
    name: String,
    queues: DashMap<QueueName, Arc<MemoryQueue>>,
    channels: Mutex<Vec<Weak<ChannelInner>>>,
    faults: Arc<Faults>,
    opened: AtomicUsize,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryBroker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queues: DashMap::new(),
            channels: Mutex::new(Vec::new()),
            faults: Arc::new(Faults::default()),
            opened: AtomicUsize::new(0),
        }
    }

    fn queue(&self, name: QueueName) -> Arc<MemoryQueue> {
        Arc::clone(self.queues.entry(name).or_default().value())
    }

    fn live_channels(&self) -> Vec<Arc<ChannelInner>> {
        let mut channels = lock(&self.channels);
        channels.retain(|w| w.strong_count() > 0);
        channels.iter().filter_map(Weak::upgrade).collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Fault injection
    // ─────────────────────────────────────────────────────────────────────

    /// Make the next `n` publishes (on any channel) fail.
    pub fn fail_next_publishes(&self, n: usize) {
        self.faults.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` channel opens fail.
    pub fn fail_next_opens(&self, n: usize) {
        self.faults.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Simulate a broker-side close of every open channel.
    ///
    /// Consumer streams end and unacked deliveries are requeued.
    pub fn close_all_channels(&self) {
        for channel in self.live_channels() {
            channel.shut();
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inspection
    // ─────────────────────────────────────────────────────────────────────

    /// Publish as an external producer would (no channel, no header rewrite).
    pub fn inject(&self, queue: QueueName, body: impl Into<Vec<u8>>, headers: Headers) {
        let q = self.queue(queue);
        q.published.fetch_add(1, Ordering::SeqCst);
        q.push_back(StoredMessage {
            body: body.into(),
            headers,
            redelivered: false,
        });
    }

    /// Snapshot of messages waiting in `queue`, front first.
    pub fn ready(&self, queue: QueueName) -> Vec<StoredMessage> {
        lock(&self.queue(queue).ready).iter().cloned().collect()
    }

    /// Remove and return every waiting message in `queue`.
    pub fn drain(&self, queue: QueueName) -> Vec<StoredMessage> {
        lock(&self.queue(queue).ready).drain(..).collect()
    }

    pub fn ready_count(&self, queue: QueueName) -> usize {
        lock(&self.queue(queue).ready).len()
    }

    /// Deliveries handed to consumers and not yet acked.
    pub fn unacked_count(&self, queue: QueueName) -> usize {
        self.live_channels()
            .iter()
            .filter(|c| c.queue_name == queue)
            .map(|c| lock(&c.unacked).len())
            .sum()
    }

    /// Successful publishes into `queue`, including injected ones.
    pub fn published_count(&self, queue: QueueName) -> usize {
        self.queue(queue).published.load(Ordering::SeqCst)
    }

    pub fn acked_count(&self, queue: QueueName) -> usize {
        self.queue(queue).acked.load(Ordering::SeqCst)
    }

    /// Channels opened over the broker's lifetime.
    pub fn channels_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl Broker for MemoryBroker {
    fn open_channel(&self, spec: &ChannelSpec) -> BoxFuture<'_, Arc<dyn BrokerChannel>> {
        let spec = spec.clone();
        Box::pin(async move {
            if take_one(&self.faults.fail_opens) {
                return Err(PipelineError::broker_msg("create_channel", "injected open failure"));
            }

            let (closed_tx, _) = watch::channel(false);
            let inner = Arc::new(ChannelInner {
                queue_name: spec.queue,
                queue: self.queue(spec.queue),
                faults: Arc::clone(&self.faults),
                prefetch: spec.prefetch.max(1) as usize,
                open: AtomicBool::new(true),
                closed_tx,
                unacked: Mutex::new(BTreeMap::new()),
                acked_notify: Notify::new(),
                next_tag: AtomicU64::new(0),
            });

            lock(&self.channels).push(Arc::downgrade(&inner));
            self.opened.fetch_add(1, Ordering::SeqCst);

            Ok(Arc::new(MemoryChannel { inner }) as Arc<dyn BrokerChannel>)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.close_all_channels();
            Ok(())
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct ChannelInner {
    queue_name: QueueName,
    queue: Arc<MemoryQueue>,
    faults: Arc<Faults>,
    prefetch: usize,
    open: AtomicBool,
    closed_tx: watch::Sender<bool>,
    unacked: Mutex<BTreeMap<u64, StoredMessage>>,
    acked_notify: Notify,
    next_tag: AtomicU64,
}

impl ChannelInner {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Close and put unacked deliveries back at the front, original order kept.
    fn shut(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let unacked = std::mem::take(&mut *lock(&self.unacked));
        {
            let mut ready = lock(&self.queue.ready);
            for (_, mut message) in unacked.into_iter().rev() {
                message.redelivered = true;
                ready.push_front(message);
            }
        }
        self.queue.notify.notify_waiters();
        self.queue.notify.notify_one();
        self.closed_tx.send_replace(true);
    }

    /// Pop the next delivery if the prefetch window allows it.
    fn try_deliver(self: &Arc<Self>) -> Option<RawDelivery> {
        let mut unacked = lock(&self.unacked);
        if unacked.len() >= self.prefetch {
            return None;
        }
        let message = lock(&self.queue.ready).pop_front()?;
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        unacked.insert(tag, message.clone());

        Some(RawDelivery {
            body: message.body,
            headers: message.headers,
            redelivered: message.redelivered,
            acker: Arc::new(MemoryAcker {
                channel: Arc::clone(self),
                tag,
            }),
        })
    }
}

struct MemoryChannel {
    inner: Arc<ChannelInner>,
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.inner.shut();
    }
}

impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn publish(&self, body: Vec<u8>, headers: Headers) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.inner.is_open() {
                return Err(PipelineError::broker_msg("basic_publish", "channel closed"));
            }
            if take_one(&self.inner.faults.fail_publishes) {
                return Err(PipelineError::broker_msg("basic_publish", "injected publish failure"));
            }

            self.inner.queue.published.fetch_add(1, Ordering::SeqCst);
            self.inner.queue.push_back(StoredMessage {
                body,
                headers,
                redelivered: false,
            });
            Ok(())
        })
    }

    fn consume(&self, _consumer_tag: &str) -> BoxFuture<'_, DeliveryStream> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            if !inner.is_open() {
                return Err(PipelineError::broker_msg("basic_consume", "channel closed"));
            }
            let closed_rx = inner.closed_tx.subscribe();

            let stream = futures::stream::unfold((inner, closed_rx), |(inner, mut closed_rx)| async move {
                loop {
                    if !inner.is_open() {
                        return None;
                    }
                    if let Some(delivery) = inner.try_deliver() {
                        return Some((Ok(delivery), (inner, closed_rx)));
                    }
                    tokio::select! {
                        _ = inner.queue.notify.notified() => {}
                        _ = inner.acked_notify.notified() => {}
                        _ = closed_rx.changed() => {}
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                    }
                }
            });

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.inner.shut();
            Ok(())
        })
    }
}

struct MemoryAcker {
    channel: Arc<ChannelInner>,
    tag: u64,
}

impl Acknowledge for MemoryAcker {
    fn ack(&self, multiple: bool) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.channel.is_open() {
                return Err(PipelineError::broker_msg("basic_ack", "channel closed"));
            }

            let removed = {
                let mut unacked = lock(&self.channel.unacked);
                if multiple {
                    let keep = unacked.split_off(&(self.tag + 1));
                    let removed = std::mem::replace(&mut *unacked, keep);
                    removed.len()
                } else {
                    usize::from(unacked.remove(&self.tag).is_some())
                }
            };

            if removed == 0 {
                return Err(PipelineError::broker_msg(
                    "basic_ack",
                    format!("unknown delivery tag {}", self.tag),
                ));
            }

            self.channel.queue.acked.fetch_add(removed, Ordering::SeqCst);
            self.channel.acked_notify.notify_waiters();
            Ok(())
        })
    }
}
