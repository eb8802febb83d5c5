// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queue-bound channels: produce, batch-consume, reconnect.
//!
//! A [`Channel`] is the unit business code talks to. It owns one broker
//! channel for one queue and replaces it in place when the broker closes it,
//! so an `Arc<Channel>` stays valid for the life of the process.
//!
//! # Consume loop
//!
//! ```text
//! connect ──► basic_consume ──► accumulate ──► batch full / timeout ──► handler
//!    ▲                              │
//!    │                     stream ends / errors
//!    └──── mark closed ◄── abandon batch (broker redelivers)
//! ```
//!
//! # Header rewrite
//!
//! Channels with `rewrite_headers` stamp every produced message
//! (see [`Headers::rewritten`]). Delay and failed channels forward headers
//! untouched.

use crate::broker::{BoxFuture, Broker, BrokerChannel};
use crate::error::{PipelineError, Result};
use crate::headers::{unix_now, Headers};
use crate::message::Message;
use crate::metrics;
use crate::queue::{ChannelSpec, QueueName};
use crate::resilience::{retry_with_backoff, RetryConfig};
use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// Default interval between producer channel health checks.
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Open => write!(f, "open"),
            ChannelState::Closed => write!(f, "closed"),
        }
    }
}

/// Business logic invoked with each consumed batch.
///
/// Every message in the batch must be acked or rerouted. If the handler
/// fails, messages it left pending are sent to the channel's retry target
/// (when one is set) or stay unacked until the broker redelivers them.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, batch: Vec<Message>) -> BoxFuture<'_, ()>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Vec<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, batch: Vec<Message>) -> BoxFuture<'_, ()> {
        Box::pin(self(batch))
    }
}

fn same_channel(a: &Arc<dyn BrokerChannel>, b: &Arc<dyn BrokerChannel>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// A self-healing channel bound to one queue.
pub struct Channel {
    spec: ChannelSpec,
    broker: Arc<dyn Broker>,
    inner: RwLock<Option<Arc<dyn BrokerChannel>>>,
    connect_lock: Mutex<()>,
    retry: RetryConfig,
    check_interval: Duration,
    retry_target: Option<Arc<Channel>>,
}

impl Channel {
    /// Create a closed channel. Call [`connect`](Self::connect) before use.
    pub fn new(spec: ChannelSpec, broker: Arc<dyn Broker>) -> Self {
        Self {
            spec,
            broker,
            inner: RwLock::new(None),
            connect_lock: Mutex::new(()),
            retry: RetryConfig::daemon(),
            check_interval: DEFAULT_CHECK_INTERVAL,
            retry_target: None,
        }
    }

    /// Backoff used by the consume loop when reopening.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Interval for the producer supervisor's health check.
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Where pending messages go when a handler fails.
    pub fn with_retry_target(mut self, target: Arc<Channel>) -> Self {
        self.retry_target = Some(target);
        self
    }

    pub fn queue(&self) -> QueueName {
        self.spec.queue
    }

    pub fn spec(&self) -> &ChannelSpec {
        &self.spec
    }

    async fn current(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.inner.read().await.clone()
    }

    /// Whether a usable broker channel is attached.
    pub async fn is_open(&self) -> bool {
        match self.inner.read().await.as_ref() {
            Some(ch) => ch.is_open(),
            None => false,
        }
    }

    pub async fn state(&self) -> ChannelState {
        if self.is_open().await {
            ChannelState::Open
        } else {
            ChannelState::Closed
        }
    }

    /// Open the broker channel. No-op if already open.
    pub async fn connect(&self) -> Result<()> {
        if self.is_open().await {
            return Ok(());
        }

        let _guard = self.connect_lock.lock().await;
        if self.is_open().await {
            return Ok(());
        }

        let queue = self.spec.queue.as_str();
        match self.broker.open_channel(&self.spec).await {
            Ok(channel) => {
                *self.inner.write().await = Some(channel);
                metrics::record_channel_open(queue, true);
                info!(
                    queue,
                    broker = self.broker.name(),
                    prefetch = self.spec.prefetch,
                    "Channel open"
                );
                Ok(())
            }
            Err(e) => {
                metrics::record_channel_open(queue, false);
                Err(e)
            }
        }
    }

    /// [`connect`](Self::connect) with backoff until it succeeds or shutdown.
    pub async fn connect_with_retry(&self, shutdown: &watch::Receiver<bool>) -> Result<()> {
        retry_with_backoff(&self.retry, "channel_connect", shutdown, || self.connect()).await
    }

    /// Detach `channel` if it is still the current one.
    async fn mark_closed(&self, channel: &Arc<dyn BrokerChannel>) {
        let mut inner = self.inner.write().await;
        if inner.as_ref().is_some_and(|current| same_channel(current, channel)) {
            *inner = None;
            warn!(queue = %self.spec.queue, "Channel marked closed");
        }
    }

    /// Close the broker channel. Unacked deliveries go back to the queue.
    pub async fn close(&self) -> Result<()> {
        let channel = self.inner.write().await.take();
        if let Some(channel) = channel {
            channel.close().await?;
            debug!(queue = %self.spec.queue, "Channel closed");
        }
        Ok(())
    }

    /// Encode `payload` as JSON and publish it with fresh headers.
    pub async fn produce<T: Serialize + ?Sized>(&self, payload: &T) -> Result<()> {
        let body = serde_json::to_vec(payload).map_err(PipelineError::Encode)?;
        self.produce_raw(body, Headers::default()).await
    }

    /// Publish an already-encoded body, carrying `headers` forward.
    ///
    /// Fails fast with [`PipelineError::ChannelClosed`] when no broker
    /// channel is attached.
    pub async fn produce_raw(&self, body: Vec<u8>, headers: Headers) -> Result<()> {
        let queue = self.spec.queue;

        let channel = match self.current().await {
            Some(ch) if ch.is_open() => ch,
            Some(ch) => {
                self.mark_closed(&ch).await;
                metrics::record_produced(queue.as_str(), false);
                return Err(PipelineError::ChannelClosed { queue: queue.to_string() });
            }
            None => {
                metrics::record_produced(queue.as_str(), false);
                return Err(PipelineError::ChannelClosed { queue: queue.to_string() });
            }
        };

        let headers = if self.spec.rewrite_headers {
            headers.rewritten(queue.as_str(), unix_now())
        } else {
            headers
        };

        match channel.publish(body, headers).await {
            Ok(()) => {
                metrics::record_produced(queue.as_str(), true);
                Ok(())
            }
            Err(e) => {
                metrics::record_produced(queue.as_str(), false);
                if !channel.is_open() {
                    self.mark_closed(&channel).await;
                }
                Err(e)
            }
        }
    }

    /// Consume this channel's queue until shutdown.
    ///
    /// Reconnects in place whenever the delivery stream ends. Partial
    /// batches are abandoned, never flushed, on a stream drop or shutdown.
    pub async fn consume(
        self: &Arc<Self>,
        consumer_tag: &str,
        handler: Arc<dyn Handler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let queue = self.spec.queue;
        let batch_size = self.spec.batch_size.max(1);
        let span = tracing::info_span!("consume", queue = %queue, consumer_tag = %consumer_tag);

        async move {
            info!(batch_size, "Starting consumer");

            'session: loop {
                if *shutdown.borrow() {
                    break;
                }

                match self.connect_with_retry(&shutdown).await {
                    Ok(()) => {}
                    Err(PipelineError::Shutdown) => break,
                    Err(e) => {
                        error!(error = %e, "Could not open channel, consumer exiting");
                        return Err(e);
                    }
                }

                let Some(channel) = self.current().await else {
                    continue;
                };

                let mut stream = match channel.consume(consumer_tag).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "basic_consume failed");
                        metrics::record_error("channel", e.kind());
                        self.mark_closed(&channel).await;
                        tokio::select! {
                            _ = tokio::time::sleep(self.retry.initial_delay) => {}
                            _ = shutdown.changed() => {}
                        }
                        continue;
                    }
                };

                let mut batch: Vec<Message> = Vec::with_capacity(batch_size);
                let mut deadline: Option<Instant> = None;

                loop {
                    let flush_at = deadline;
                    let flush_timer = async move {
                        match flush_at {
                            Some(at) => tokio::time::sleep_until(at).await,
                            None => std::future::pending::<()>().await,
                        }
                    };

                    tokio::select! {
                        biased;

                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                if !batch.is_empty() {
                                    debug!(pending = batch.len(), "Dropping partial batch on shutdown");
                                }
                                break 'session;
                            }
                        }

                        item = stream.next() => match item {
                            Some(Ok(delivery)) => {
                                if batch.is_empty() {
                                    deadline = self.spec.batch_timeout.map(|t| Instant::now() + t);
                                }
                                batch.push(Message::new(delivery, Arc::clone(self)));
                                if batch.len() >= batch_size {
                                    deadline = None;
                                    self.dispatch(&handler, std::mem::take(&mut batch)).await;
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, abandoned = batch.len(), "Delivery stream failed");
                                break;
                            }
                            None => {
                                warn!(abandoned = batch.len(), "Delivery stream ended");
                                break;
                            }
                        },

                        _ = flush_timer => {
                            deadline = None;
                            self.dispatch(&handler, std::mem::take(&mut batch)).await;
                        }
                    }
                }

                if !batch.is_empty() {
                    metrics::record_batch_abandoned(queue.as_str(), batch.len());
                }
                drop(batch);
                self.mark_closed(&channel).await;
                if let Err(e) = channel.close().await {
                    debug!(error = %e, "Closing dead channel failed");
                }
            }

            info!("Consumer stopped");
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, handler: &Arc<dyn Handler>, batch: Vec<Message>) {
        if batch.is_empty() {
            return;
        }

        let queue = self.spec.queue;
        let size = batch.len();
        let tracked = batch.clone();
        let started = std::time::Instant::now();

        let result = handler.handle(batch).await;
        metrics::record_batch(queue.as_str(), size, started.elapsed());

        let mut pending = Vec::new();
        for message in tracked {
            if message.is_pending().await {
                pending.push(message);
            }
        }

        match result {
            Ok(()) if pending.is_empty() => {
                debug!(size, "Batch handled");
            }
            Ok(()) => {
                warn!(size, pending = pending.len(), "Handler left messages unactioned");
            }
            Err(e) => {
                error!(size, pending = pending.len(), error = %e, "Handler failed");
                metrics::record_error("handler", e.kind());
                if let Some(target) = &self.retry_target {
                    for message in pending {
                        if let Err(e) = message.send_to_queue(std::slice::from_ref(target)).await {
                            warn!(error = %e, "Could not reroute pending message");
                        }
                    }
                }
            }
        }
    }

    /// Spawn the producer-side supervisor: reopen whenever found closed.
    pub fn spawn_supervisor(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let span = tracing::info_span!("channel_supervisor", queue = %self.spec.queue);

        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(this.check_interval) => {
                            if this.is_open().await {
                                continue;
                            }
                            debug!("Channel closed, reopening");
                            if let Err(e) = this.connect().await {
                                warn!(error = %e, "Channel reopen failed");
                            }
                        }
                    }
                }
                debug!("Channel supervisor stopped");
            }
            .instrument(span),
        )
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("spec", &self.spec)
            .field("broker", &self.broker.name())
            .finish()
    }
}

/// Channels by queue, shared between producers and handlers.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: Arc<DashMap<QueueName, Arc<Channel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel under its queue, replacing any previous one.
    pub fn insert(&self, channel: Arc<Channel>) {
        self.channels.insert(channel.queue(), channel);
    }

    pub fn get(&self, queue: QueueName) -> Result<Arc<Channel>> {
        self.channels
            .get(&queue)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| PipelineError::Config(format!("no channel registered for queue {}", queue)))
    }

    pub fn contains(&self, queue: QueueName) -> bool {
        self.channels.contains_key(&queue)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// All channels, ordered by queue.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        let mut all: Vec<_> = self.channels.iter().map(|c| Arc::clone(c.value())).collect();
        all.sort_by_key(|c| c.queue());
        all
    }

    /// Open every registered channel, retrying each until it succeeds.
    pub async fn connect_all(&self, shutdown: &watch::Receiver<bool>) -> Result<()> {
        for channel in self.channels() {
            channel.connect_with_retry(shutdown).await?;
        }
        Ok(())
    }

    /// Close every registered channel, logging failures.
    pub async fn close_all(&self) {
        for channel in self.channels() {
            if let Err(e) = channel.close().await {
                warn!(queue = %channel.queue(), error = %e, "Channel close failed");
            }
        }
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queues: Vec<_> = self.channels().iter().map(|c| c.queue()).collect();
        f.debug_struct("ChannelRegistry").field("queues", &queues).finish()
    }
}
