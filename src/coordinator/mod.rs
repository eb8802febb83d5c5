// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pipeline coordinator.
//!
//! Ties together:
//! - two broker connections, producer and consumer, via [`crate::broker::Broker`]
//! - one producer [`Channel`] per queue, each with a reopen supervisor
//! - consumers per registered [`Handler`], started on the first catalog logon
//! - the [`DelayRouter`] on the delay queue
//! - the [`ChangePoller`] feeding changes, apps and packages
//!
//! # Startup
//!
//! 1. Dial both connections (backoff per `broker.*` settings)
//! 2. Open every producer channel and spawn its supervisor
//! 3. `Running`: the poller can be started with [`Pipeline::run_poller`]
//! 4. First `LoggedOn` from the poller starts the consumers
//!
//! # Shutdown
//!
//! The shutdown signal stops every loop. Consumers drop partial batches,
//! so unacked deliveries go back to the broker when their channels close.

mod consumers;
mod types;

pub use types::{ChannelHealth, ChannelRole, EngineState, HealthCheck};

use crate::broker::Broker;
use crate::channel::{Channel, ChannelRegistry, Handler};
use crate::config::PipelineConfig;
use crate::connection::Connection;
use crate::delay::DelayRouter;
use crate::error::{PipelineError, Result};
use crate::metrics;
use crate::poller::{CatalogEvent, CatalogSession, ChangePoller, SessionState};
use crate::queue::QueueName;
use consumers::ConsumerGroup;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// How long `shutdown()` waits for each task.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

fn same_broker(a: &Arc<dyn Broker>, b: &Arc<dyn Broker>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// The ingestion pipeline service.
pub struct Pipeline {
    config: PipelineConfig,

    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    producer_broker: Arc<dyn Broker>,

    /// One producer channel per queue, opened by `start()`.
    producers: ChannelRegistry,

    consumers: Arc<ConsumerGroup>,

    /// Set once a poller is running.
    session_rx: RwLock<Option<watch::Receiver<SessionState>>>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Pipeline {
    /// Build a pipeline backed by two AMQP connections.
    ///
    /// Nothing is dialed until [`start()`](Self::start).
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let producer: Arc<dyn Broker> = Arc::new(Connection::new("producer", &config.broker, shutdown_rx.clone()));
        let consumer: Arc<dyn Broker> = Arc::new(Connection::new("consumer", &config.broker, shutdown_rx.clone()));

        Ok(Self::build(config, producer, consumer, shutdown_tx, shutdown_rx))
    }

    /// Build a pipeline over caller-supplied brokers (e.g. `MemoryBroker`).
    ///
    /// Producer and consumer may be the same broker.
    pub fn with_brokers(config: PipelineConfig, producer: Arc<dyn Broker>, consumer: Arc<dyn Broker>) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self::build(config, producer, consumer, shutdown_tx, shutdown_rx))
    }

    fn build(
        config: PipelineConfig,
        producer_broker: Arc<dyn Broker>,
        consumer_broker: Arc<dyn Broker>,
        shutdown_tx: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);

        let producers = ChannelRegistry::new();
        for queue in QueueName::ALL {
            producers.insert(Arc::new(
                Channel::new(config.channel_spec(queue), Arc::clone(&producer_broker))
                    .with_retry(config.broker.retry_config())
                    .with_check_interval(config.broker.channel_check_interval_duration()),
            ));
        }

        let tasks = Arc::new(Mutex::new(Vec::new()));
        let consumers = Arc::new(ConsumerGroup::new(
            config.clone(),
            consumer_broker,
            producers.clone(),
            shutdown_rx.clone(),
            Arc::clone(&tasks),
        ));

        Self {
            config,
            state_tx,
            state_rx,
            producer_broker,
            producers,
            consumers,
            session_rx: RwLock::new(None),
            shutdown_tx,
            shutdown_rx,
            tasks,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Producer channels, one per queue. Handlers publish through these.
    pub fn producers(&self) -> &ChannelRegistry {
        &self.producers
    }

    /// Consumer channels opened so far.
    pub fn consumer_channels(&self) -> &ChannelRegistry {
        self.consumers.channels()
    }

    pub fn consumers_started(&self) -> bool {
        self.consumers.is_started()
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Register the handler for a queue. Must happen before consumers start.
    pub fn register_handler<H: Handler>(&self, queue: QueueName, handler: H) -> Result<()> {
        self.consumers.register(queue, Arc::new(handler))
    }

    /// Dial both connections and open every producer channel.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(PipelineError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            environment = %self.config.environment,
            delay_enabled = self.config.delay.enabled,
            "Starting pipeline"
        );
        self.set_state(EngineState::Connecting);

        let consumer_broker = Arc::clone(self.consumers.broker());
        let mut brokers = vec![Arc::clone(&self.producer_broker)];
        if !same_broker(&self.producer_broker, &consumer_broker) {
            brokers.push(consumer_broker);
        }

        for broker in &brokers {
            if let Err(e) = broker.connect().await {
                error!(connection = %broker.name(), error = %e, "Broker connection failed");
                metrics::record_error("pipeline", e.kind());
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        }

        let mut handles = Vec::new();
        for broker in brokers {
            let name = broker.name().to_string();
            handles.push(tokio::spawn(async move {
                if let Err(e) = broker.supervise().await {
                    error!(connection = %name, error = %e, "Connection supervisor stopped");
                }
            }));
        }

        if let Err(e) = self.producers.connect_all(&self.shutdown_rx).await {
            error!(error = %e, "Could not open producer channels");
            self.set_state(EngineState::Failed);
            return Err(e);
        }
        for channel in self.producers.channels() {
            handles.push(channel.spawn_supervisor(self.shutdown_rx.clone()));
        }
        self.tasks.lock().await.extend(handles);

        if self.config.delay.enabled && !self.consumers.has_handler(QueueName::Delay) {
            self.consumers
                .register(QueueName::Delay, Arc::new(DelayRouter::new(&self.config.delay, self.producers.clone())))?;
        }

        self.set_state(EngineState::Running);
        info!(producers = self.producers.len(), "Pipeline running");
        Ok(())
    }

    /// Start a consumer for every registered handler.
    ///
    /// Consumer tags are `{environment}-{identity}`. Only the first call has
    /// any effect; returns the number of consumers spawned by this call.
    pub async fn start_consumers(&self, identity: &str) -> Result<usize> {
        if !self.is_running() {
            return Err(PipelineError::InvalidState {
                expected: "Running".to_string(),
                actual: self.state().to_string(),
            });
        }
        self.consumers.start(identity).await
    }

    /// Spawn the change poller over `session`, fed by `events`.
    ///
    /// Consumers start the first time the session reaches `LoggedOn`,
    /// tagged with `identity`.
    pub async fn run_poller<C: CatalogSession>(
        &self,
        session: Arc<C>,
        events: mpsc::Receiver<CatalogEvent>,
        identity: impl Into<String>,
    ) -> Result<Arc<ChangePoller<C>>> {
        if !self.is_running() {
            return Err(PipelineError::InvalidState {
                expected: "Running".to_string(),
                actual: self.state().to_string(),
            });
        }
        if !self.config.poller.enabled {
            return Err(PipelineError::Config("poller.enabled is false".to_string()));
        }

        let poller = Arc::new(ChangePoller::new(session, self.config.poller.clone(), &self.producers)?);
        let mut session_rx = poller.state_receiver();
        *self.session_rx.write().await = Some(session_rx.clone());

        let run = tokio::spawn({
            let poller = Arc::clone(&poller);
            let shutdown_rx = self.shutdown_rx.clone();
            async move {
                if let Err(e) = poller.run(events, shutdown_rx).await {
                    error!(error = %e, "Change poller stopped");
                }
            }
        });

        let identity = identity.into();
        let group = Arc::clone(&self.consumers);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let span = tracing::info_span!("consumer_starter", identity = %identity);
        let starter = tokio::spawn(
            async move {
                loop {
                    let current = *session_rx.borrow_and_update();
                    if current == SessionState::LoggedOn {
                        match group.start(&identity).await {
                            Ok(count) => debug!(count, "Consumers started on first logon"),
                            Err(e) => error!(error = %e, "Could not start consumers"),
                        }
                        break;
                    }
                    tokio::select! {
                        changed = session_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
            }
            .instrument(span),
        );

        self.tasks.lock().await.extend([run, starter]);
        info!("Change poller spawned");
        Ok(poller)
    }

    /// Health snapshot. No broker I/O.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let producer_connected = self.producer_broker.is_connected();
        let consumer_connected = self.consumers.broker().is_connected();
        let consumers_started = self.consumers.is_started();
        let session_state = self.session_rx.read().await.as_ref().map(|rx| *rx.borrow());

        let mut channels = Vec::new();
        for (role, registry) in [
            (ChannelRole::Producer, &self.producers),
            (ChannelRole::Consumer, self.consumers.channels()),
        ] {
            for channel in registry.channels() {
                channels.push(ChannelHealth {
                    queue: channel.queue(),
                    role,
                    open: channel.is_open().await,
                });
            }
        }

        let ready = state == EngineState::Running && producer_connected;
        let healthy = ready && (!consumers_started || consumer_connected) && channels.iter().all(|c| c.open);

        HealthCheck {
            state,
            ready,
            healthy,
            producer_connected,
            consumer_connected,
            consumers_started,
            session_state,
            channels,
        }
    }

    /// Stop everything.
    ///
    /// 1. Signal every task to stop
    /// 2. Wait for each, up to a drain timeout
    /// 3. Close consumer channels (unacked deliveries return to the queue)
    /// 4. Close producer channels, then both connections
    pub async fn shutdown(&mut self) {
        if matches!(self.state(), EngineState::Stopped) {
            return;
        }
        info!("Shutting down pipeline");
        self.set_state(EngineState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock().await);
        if !handles.is_empty() {
            info!(task_count = handles.len(), "Waiting for tasks to stop");
        }
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task stopped"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task did not stop within the drain timeout"),
            }
        }

        self.consumers.channels().close_all().await;
        self.producers.close_all().await;

        let consumer_broker = Arc::clone(self.consumers.broker());
        let mut brokers = vec![Arc::clone(&self.producer_broker)];
        if !same_broker(&self.producer_broker, &consumer_broker) {
            brokers.push(consumer_broker);
        }
        for broker in brokers {
            if let Err(e) = broker.close().await {
                warn!(connection = %broker.name(), error = %e, "Connection close failed");
            }
        }

        self.set_state(EngineState::Stopped);
        info!("Pipeline stopped");
    }
}
