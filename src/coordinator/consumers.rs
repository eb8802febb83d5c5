//! Consumer side of the pipeline.
//!
//! Handlers are registered per queue before consumers start. Starting is
//! one-shot: the first call opens a consumer channel for every registered
//! queue and spawns its consume loop; later calls do nothing.

use crate::channel::{Channel, ChannelRegistry, Handler};
use crate::broker::Broker;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::queue::QueueName;
use crate::resilience::RetryConfig;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

pub(crate) struct ConsumerGroup {
    config: PipelineConfig,
    broker: Arc<dyn Broker>,
    producers: ChannelRegistry,
    consumers: ChannelRegistry,
    handlers: DashMap<QueueName, Arc<dyn Handler>>,
    started: AtomicBool,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ConsumerGroup {
    pub(crate) fn new(
        config: PipelineConfig,
        broker: Arc<dyn Broker>,
        producers: ChannelRegistry,
        shutdown_rx: watch::Receiver<bool>,
        tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    ) -> Self {
        Self {
            config,
            broker,
            producers,
            consumers: ChannelRegistry::new(),
            handlers: DashMap::new(),
            started: AtomicBool::new(false),
            shutdown_rx,
            tasks,
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn channels(&self) -> &ChannelRegistry {
        &self.consumers
    }

    pub(crate) fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub(crate) fn has_handler(&self, queue: QueueName) -> bool {
        self.handlers.contains_key(&queue)
    }

    pub(crate) fn register(&self, queue: QueueName, handler: Arc<dyn Handler>) -> Result<()> {
        if self.is_started() {
            return Err(PipelineError::InvalidState {
                expected: "consumers not started".to_string(),
                actual: "consumers started".to_string(),
            });
        }
        if self.handlers.insert(queue, handler).is_some() {
            info!(queue = %queue, "Replaced handler");
        }
        Ok(())
    }

    /// Consumers reconnect forever, pacing attempts like the broker dial.
    fn consumer_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: usize::MAX,
            ..self.config.broker.retry_config()
        }
    }

    /// Open a consumer per registered queue. Returns how many were spawned.
    pub(crate) async fn start(&self, identity: &str) -> Result<usize> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }

        let tag = self.config.consumer_tag(identity);
        let mut queues: Vec<QueueName> = self.handlers.iter().map(|e| *e.key()).collect();
        queues.sort();

        let mut spawned = Vec::with_capacity(queues.len());
        for queue in queues {
            let Some(handler) = self.handlers.get(&queue).map(|h| Arc::clone(h.value())) else {
                continue;
            };

            let mut channel = Channel::new(self.config.channel_spec(queue), Arc::clone(&self.broker))
                .with_retry(self.consumer_retry())
                .with_check_interval(self.config.broker.channel_check_interval_duration());
            if queue.is_retry_target() && self.config.delay.enabled {
                channel = channel.with_retry_target(self.producers.get(QueueName::Delay)?);
            }
            let channel = Arc::new(channel);
            self.consumers.insert(Arc::clone(&channel));

            let tag = tag.clone();
            let shutdown_rx = self.shutdown_rx.clone();
            spawned.push(tokio::spawn(async move {
                if let Err(e) = channel.consume(&tag, handler, shutdown_rx).await {
                    error!(queue = %channel.queue(), error = %e, "Consumer stopped");
                }
            }));
        }

        let count = spawned.len();
        self.tasks.lock().await.extend(spawned);
        info!(consumer_tag = %tag, count, "Consumers started");
        Ok(count)
    }
}
