//! Broker connection management.
//!
//! One [`Connection`] owns one physical AMQP connection. The pipeline keeps
//! two: one for producing and one for consuming, so a slow consumer cannot
//! stall publishes through TCP back-pressure.
//!
//! # Connection Lifecycle
//!
//! ```text
//! Disconnected → Connecting → Connected
//!      ↑             │ (backoff,    │
//!      │             │  forever)    │ on_error (broker close / network)
//!      └─────────────┴──────────────┘
//! ```
//!
//! `connect()` dials with the broker retry budget from config, so startup can
//! fail when `reconnect_max_attempts` is set. A lapin `on_error` hook feeds a
//! close-notification channel; the supervisor task spawned by
//! [`Connection::spawn_supervisor`] waits on it and redials with no attempt
//! limit (only the root shutdown signal stops it). Concurrent reconnects
//! collapse into one through `connect_lock`.
//!
//! Channels opened while the connection is down park in
//! `wait_connected()` until it is back.

use crate::amqp::AmqpChannel;
use crate::broker::{BoxFuture, Broker, BrokerChannel};
use crate::config::BrokerConfig;
use crate::error::{PipelineError, Result};
use crate::metrics;
use crate::queue::ChannelSpec;
use crate::resilience::{retry_with_backoff, RetryConfig};
use lapin::options::{BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::ConnectionProperties;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// How often a parked channel re-checks the connection if no state change arrives.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// State of a broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected (initial state, or after a close notification).
    Disconnected,
    /// Dial in progress (possibly backing off between attempts).
    Connecting,
    /// Connected and usable.
    Connected,
    /// Closed by `close()`. Terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// A supervised AMQP connection.
pub struct Connection {
    /// Role name ("producer" / "consumer"), used in logs and metrics.
    name: String,
    /// AMQP URI, heartbeat already applied.
    uri: String,
    retry: RetryConfig,
    conn: RwLock<Option<Arc<lapin::Connection>>>,
    state_tx: watch::Sender<ConnectionState>,
    close_tx: mpsc::UnboundedSender<String>,
    close_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    connect_lock: Mutex<()>,
    shutdown_rx: watch::Receiver<bool>,
    reconnects: AtomicU64,
    dial_attempts: AtomicU64,
}

impl Connection {
    /// Create a connection (not yet dialed).
    pub fn new(name: impl Into<String>, config: &BrokerConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (close_tx, close_rx) = mpsc::unbounded_channel();

        Self {
            name: name.into(),
            uri: config.connection_uri(),
            retry: config.retry_config(),
            conn: RwLock::new(None),
            state_tx,
            close_tx,
            close_rx: Mutex::new(Some(close_rx)),
            connect_lock: Mutex::new(()),
            shutdown_rx,
            reconnects: AtomicU64::new(0),
            dial_attempts: AtomicU64::new(0),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Receiver for state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Number of reconnects performed by the supervisor.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Number of individual dial attempts, failed ones included.
    pub fn dial_attempts(&self) -> u64 {
        self.dial_attempts.load(Ordering::Relaxed)
    }

    /// Backoff for redials after a close: same pacing, no attempt limit.
    fn reconnect_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: usize::MAX,
            ..self.retry.clone()
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
        metrics::record_connection_state(&self.name, &state.to_string());
    }

    /// Whether the current lapin connection is usable.
    pub async fn is_open(&self) -> bool {
        match self.conn.read().await.as_ref() {
            Some(conn) => conn.status().connected(),
            None => false,
        }
    }

    /// Dial the broker with the configured retry budget.
    ///
    /// No-op if already connected.
    pub async fn dial(&self) -> Result<()> {
        self.dial_with(&self.retry).await
    }

    async fn dial_with(&self, retry: &RetryConfig) -> Result<()> {
        let _guard = self.connect_lock.lock().await;

        if self.is_open().await {
            return Ok(());
        }
        if self.state() == ConnectionState::Closed {
            return Err(PipelineError::Shutdown);
        }

        self.set_state(ConnectionState::Connecting);
        info!(connection = %self.name, "Connecting to broker");

        let uri = self.uri.clone();
        let attempts = &self.dial_attempts;
        let result = retry_with_backoff(retry, "amqp_connect", &self.shutdown_rx, || {
            attempts.fetch_add(1, Ordering::Relaxed);
            let uri = uri.clone();
            async move {
                lapin::Connection::connect(&uri, ConnectionProperties::default())
                    .await
                    .map_err(|e| PipelineError::broker("connect", e))
            }
        })
        .await;

        let conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                metrics::record_connection_attempt(&self.name, false);
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let close_tx = self.close_tx.clone();
        let name = self.name.clone();
        conn.on_error(move |err| {
            warn!(connection = %name, error = %err, "Broker connection closed");
            let _ = close_tx.send(err.to_string());
        });

        *self.conn.write().await = Some(Arc::new(conn));
        metrics::record_connection_attempt(&self.name, true);
        self.set_state(ConnectionState::Connected);
        info!(connection = %self.name, "Connected to broker");

        Ok(())
    }

    /// Mark the connection unusable (triggers reconnect on next dial).
    pub async fn mark_disconnected(&self) {
        *self.conn.write().await = None;
        if self.state() != ConnectionState::Closed {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Spawn the reconnect supervisor.
    ///
    /// Waits for close notifications and redials. Exits on shutdown or
    /// after `close()`. Only the first call spawns anything.
    pub fn spawn_supervisor(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let span = tracing::info_span!("connection_supervisor", connection = %self.name);
        tokio::spawn(
            async move {
                if let Err(e) = this.run_supervisor().await {
                    debug!(error = %e, "Connection supervisor stopped");
                }
            }
            .instrument(span),
        )
    }

    async fn run_supervisor(&self) -> Result<()> {
        let Some(mut close_rx) = self.close_rx.lock().await.take() else {
            return Err(PipelineError::InvalidState {
                expected: "supervisor not started".to_string(),
                actual: "supervisor already running".to_string(),
            });
        };
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                reason = close_rx.recv() => {
                    let Some(reason) = reason else { return Ok(()) };
                    if self.state() == ConnectionState::Closed {
                        return Ok(());
                    }

                    // Collapse a burst of notifications into one reconnect
                    while close_rx.try_recv().is_ok() {}

                    self.mark_disconnected().await;
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    metrics::record_reconnect(&self.name);
                    warn!(reason = %reason, "Reconnecting to broker");

                    match self.dial_with(&self.reconnect_retry()).await {
                        Ok(()) => {}
                        Err(PipelineError::Shutdown) => return Ok(()),
                        Err(e) => error!(error = %e, "Reconnect failed"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Wait until a usable lapin connection exists.
    async fn wait_connected(&self) -> Result<Arc<lapin::Connection>> {
        let mut state_rx = self.state_tx.subscribe();
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            if let Some(conn) = self.conn.read().await.as_ref() {
                if conn.status().connected() {
                    return Ok(Arc::clone(conn));
                }
            }
            if *shutdown_rx.borrow() || self.state() == ConnectionState::Closed {
                return Err(PipelineError::Shutdown);
            }

            tokio::select! {
                _ = state_rx.changed() => {}
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(WAIT_POLL_INTERVAL) => {}
            }
        }
    }

    /// Close the connection. Terminal: the supervisor stops reconnecting.
    pub async fn shutdown(&self) -> Result<()> {
        self.set_state(ConnectionState::Closed);
        if let Some(conn) = self.conn.write().await.take() {
            if conn.status().connected() {
                conn.close(200, "shutdown")
                    .await
                    .map_err(|e| PipelineError::broker("connection_close", e))?;
            }
        }
        info!(connection = %self.name, "Broker connection closed");
        Ok(())
    }
}

impl Broker for Connection {
    fn open_channel(&self, spec: &ChannelSpec) -> BoxFuture<'_, Arc<dyn BrokerChannel>> {
        let spec = spec.clone();
        Box::pin(async move {
            let conn = self.wait_connected().await?;

            let channel = conn
                .create_channel()
                .await
                .map_err(|e| PipelineError::broker("create_channel", e))?;
            channel
                .basic_qos(spec.prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| PipelineError::broker("basic_qos", e))?;
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| PipelineError::broker("confirm_select", e))?;
            channel
                .queue_declare(
                    spec.queue.as_str(),
                    QueueDeclareOptions {
                        durable: true,
                        exclusive: false,
                        auto_delete: false,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| PipelineError::broker("queue_declare", e))?;

            debug!(
                connection = %self.name,
                queue = %spec.queue,
                prefetch = spec.prefetch,
                "Broker channel opened"
            );

            Ok(Arc::new(AmqpChannel::new(spec.queue, channel)) as Arc<dyn BrokerChannel>)
        })
    }

    fn connect(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.dial())
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn supervise(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let span = tracing::info_span!("connection_supervisor", connection = %self.name);
            self.run_supervisor().instrument(span).await
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.shutdown())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
