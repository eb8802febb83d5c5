// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change poller.
//!
//! Keeps a session to the upstream catalog alive, asks for deltas since the
//! persisted change number, and turns each delta into queued work:
//!
//! ```text
//! tick (LoggedOn) ──► request_changes_since(cursor)
//!                                │
//!        CatalogEvent::Changes ◄─┘
//!                │ current <= cursor ──► discard (stale)
//!                ▼
//!   partition ──► detail requests (rate limited) ──► ChangeMessage ──► advance cursor
//!
//!        CatalogEvent::ProductInfo ──► EntityMessage per app / package
//! ```
//!
//! # Dispatch Then Advance
//!
//! The cursor only moves after every detail request was sent and the
//! change message was accepted by the broker. Any failure leaves it where
//! it was, so the next poll asks for the same delta again.
//!
//! # One Request In Flight
//!
//! Requests and responses are not correlated upstream, so the poller keeps
//! at most one changes request outstanding. The marker clears when a
//! changes response is handled, when the session drops, or after
//! `response_timeout`.

pub mod catalog;
pub mod changes;
pub mod credentials;
pub mod state;

pub use catalog::{
    CatalogEvent, CatalogSession, ChangesResponse, EntityChange, LogOnDetails, ProductInfo,
    ProductInfoRequest, ProductInfoResponse,
};
pub use changes::{ChangeBatch, ChangeMessage, EntityKind, EntityMessage};
pub use credentials::AuthTokenStore;
pub use state::{transition, SessionAction, SessionInput, SessionState};

use crate::channel::{Channel, ChannelRegistry};
use crate::config::PollerConfig;
use crate::cursor::CursorStore;
use crate::error::{PipelineError, Result};
use crate::metrics;
use crate::queue::QueueName;
use crate::resilience::RateLimiter;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

/// Outstanding changes request.
#[derive(Debug, Clone, Copy)]
struct InFlight {
    since: u32,
    sent_at: Instant,
}

/// Serializes cursor read, request send and response handling.
#[derive(Debug, Default)]
struct PollGate {
    in_flight: Option<InFlight>,
}

impl PollGate {
    /// The outstanding request, unless it has timed out.
    fn blocking(&mut self, timeout: Duration) -> Option<InFlight> {
        match self.in_flight {
            Some(req) if req.sent_at.elapsed() < timeout => Some(req),
            Some(req) => {
                warn!(since = req.since, "Changes request timed out, polling again");
                self.in_flight = None;
                None
            }
            None => None,
        }
    }
}

/// What `handle_changes` did with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// `current <= cursor`: nothing produced, cursor untouched.
    Stale { current: u32, cursor: u32 },
    /// Delta dispatched and cursor advanced.
    Advanced { from: u32, to: u32 },
    /// `since` is past the cursor or answers some other request: nothing
    /// produced, the outstanding request stays outstanding.
    Mismatched { since: u32, expected: u32 },
}

/// Long-lived upstream client. See the module docs.
pub struct ChangePoller<C: CatalogSession> {
    session: Arc<C>,
    config: PollerConfig,
    changes: Arc<Channel>,
    apps: Arc<Channel>,
    packages: Arc<Channel>,
    cursor: CursorStore,
    tokens: AuthTokenStore,
    gate: Mutex<PollGate>,
    limiter: Option<RateLimiter>,
    state_tx: watch::Sender<SessionState>,
}

impl<C: CatalogSession> ChangePoller<C> {
    /// `producers` must hold the changes, apps and packages channels.
    pub fn new(session: Arc<C>, config: PollerConfig, producers: &ChannelRegistry) -> Result<Self> {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);

        Ok(Self {
            changes: producers.get(QueueName::Changes)?,
            apps: producers.get(QueueName::Apps)?,
            packages: producers.get(QueueName::Packages)?,
            cursor: CursorStore::new(config.cursor_path.clone()),
            tokens: AuthTokenStore::new(config.auth_token_path.clone()),
            gate: Mutex::new(PollGate::default()),
            limiter: config.rate_limit_config().map(RateLimiter::new),
            session,
            config,
            state_tx,
        })
    }

    pub fn session_state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Receiver for session state changes.
    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn cursor(&self) -> &CursorStore {
        &self.cursor
    }

    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
        metrics::set_session_state(&state.to_string());
    }

    /// Drive the session until shutdown.
    ///
    /// Returns an error only if the event channel closes underneath it.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<CatalogEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let span = tracing::info_span!("change_poller");

        async move {
            info!(interval = ?self.config.interval_duration(), "Starting change poller");

            let mut state = self.session_state();
            let mut inputs = VecDeque::from([SessionInput::Start]);
            let mut reconnect_at: Option<Instant> = None;

            let mut ticker = tokio::time::interval(self.config.interval_duration());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let result = loop {
                while let Some(input) = inputs.pop_front() {
                    let (next, actions) = transition(state, input);
                    if next != state {
                        info!(from = %state, to = %next, ?input, "Session state changed");
                        state = next;
                        self.set_state(state);
                    }
                    for action in actions {
                        if let Some(follow_up) = self.execute(action, &mut reconnect_at).await {
                            inputs.push_back(follow_up);
                        }
                    }
                }

                let wake_at = reconnect_at;
                let reconnect_timer = async move {
                    match wake_at {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    biased;

                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break Ok(());
                        }
                    }

                    event = events.recv() => match event {
                        Some(event) => {
                            if let Some(input) = self.handle_event(event).await {
                                inputs.push_back(input);
                            }
                        }
                        None => {
                            error!("Catalog event channel closed");
                            break Err(PipelineError::catalog("events", "event channel closed"));
                        }
                    },

                    _ = reconnect_timer => {
                        reconnect_at = None;
                        inputs.push_back(SessionInput::ReconnectDue);
                    }

                    _ = ticker.tick(), if state == SessionState::LoggedOn => {
                        if let Err(e) = self.poll().await {
                            warn!(error = %e, "Poll failed");
                            metrics::record_error("poller", e.kind());
                        }
                    }
                }
            };

            if let Err(e) = self.session.disconnect().await {
                debug!(error = %e, "Session disconnect failed");
            }
            self.set_state(SessionState::Disconnected);
            info!("Change poller stopped");
            result
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, action: SessionAction, reconnect_at: &mut Option<Instant>) -> Option<SessionInput> {
        match action {
            SessionAction::Connect => match self.session.connect().await {
                Ok(()) => None,
                Err(e) => {
                    warn!(error = %e, "Catalog connect failed");
                    Some(SessionInput::FatalError)
                }
            },
            SessionAction::LogOn => {
                let auth_token = match self.tokens.load().await {
                    Ok(token) => token,
                    Err(e) => {
                        warn!(error = %e, "Could not read auth token, logging on without it");
                        None
                    }
                };
                let details = credentials::log_on_details(&self.config.credentials, auth_token);
                match self.session.log_on(details).await {
                    Ok(()) => Some(SessionInput::LogOnSent),
                    Err(e) => {
                        warn!(error = %e, "Catalog logon failed");
                        Some(SessionInput::FatalError)
                    }
                }
            }
            SessionAction::StartPolling => {
                if let Err(e) = self.poll().await {
                    warn!(error = %e, "Initial poll failed");
                }
                None
            }
            SessionAction::StopPolling => {
                self.gate.lock().await.in_flight = None;
                None
            }
            SessionAction::ScheduleReconnect => {
                let delay = self.config.reconnect_delay_duration();
                debug!(delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
                *reconnect_at = Some(Instant::now() + delay);
                None
            }
        }
    }

    /// Apply one upstream event; returns the state machine input it maps to.
    pub async fn handle_event(&self, event: CatalogEvent) -> Option<SessionInput> {
        match event {
            CatalogEvent::Connected => Some(SessionInput::Connected),
            CatalogEvent::Disconnected => Some(SessionInput::Disconnected),
            CatalogEvent::LoggedOn => Some(SessionInput::LoggedOn),
            CatalogEvent::LoggedOff { reason } => {
                warn!(reason = %reason, "Logged off");
                Some(SessionInput::LoggedOff)
            }
            CatalogEvent::LogOnFailed { reason } => {
                warn!(reason = %reason, "Logon rejected");
                Some(SessionInput::LogOnFailed)
            }
            CatalogEvent::Error(message) => {
                error!(error = %message, "Catalog session error");
                metrics::record_error("poller", "catalog");
                Some(SessionInput::FatalError)
            }
            CatalogEvent::AuthTokenIssued(token) => {
                if let Err(e) = self.tokens.save(&token).await {
                    warn!(error = %e, "Could not persist auth token");
                    metrics::record_cursor_persist(false);
                }
                None
            }
            CatalogEvent::Changes(response) => {
                if let Err(e) = self.handle_changes(response).await {
                    warn!(error = %e, "Changes not applied, cursor unchanged");
                    metrics::record_error("poller", e.kind());
                }
                None
            }
            CatalogEvent::ProductInfo(response) => {
                if let Err(e) = self.handle_product_info(response).await {
                    warn!(error = %e, "Product info not fully dispatched");
                    metrics::record_error("poller", e.kind());
                }
                None
            }
        }
    }

    /// Ask upstream for changes since the cursor.
    ///
    /// Returns `false` if a previous request is still outstanding.
    pub async fn poll(&self) -> Result<bool> {
        let mut gate = self.gate.lock().await;
        if let Some(req) = gate.blocking(self.config.response_timeout_duration()) {
            debug!(since = req.since, "Changes request outstanding, skipping poll");
            metrics::record_poll(false);
            return Ok(false);
        }

        let since = self.cursor.get().await?;
        self.session.request_changes_since(since).await?;
        gate.in_flight = Some(InFlight {
            since,
            sent_at: Instant::now(),
        });
        metrics::record_poll(true);
        debug!(since, "Requested changes");
        Ok(true)
    }

    /// Dispatch a delta and advance the cursor.
    pub async fn handle_changes(&self, response: ChangesResponse) -> Result<ChangeOutcome> {
        let mut gate = self.gate.lock().await;
        let cursor = self.cursor.get().await?;

        // A gap between cursor and since would skip change numbers
        let since = response.since_change_number;
        let expected = gate.in_flight.map_or(cursor, |req| req.since);
        if since > cursor || (gate.in_flight.is_some() && since != expected) {
            debug!(since, expected, cursor, "Changes response does not match request, discarded");
            metrics::record_stale_changes();
            return Ok(ChangeOutcome::Mismatched { since, expected });
        }
        gate.in_flight = None;

        let current = response.current_change_number;
        if current <= cursor {
            debug!(current, cursor, "Stale changes response discarded");
            metrics::record_stale_changes();
            return Ok(ChangeOutcome::Stale { current, cursor });
        }

        let batch = ChangeBatch::from_response(&response);
        metrics::record_changes("apps", batch.app_count());
        metrics::record_changes("packages", batch.package_count());

        let requests = batch.detail_requests(self.config.detail_batch_size);
        let request_count = requests.len();
        for request in requests {
            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
            }
            self.session.request_product_info(request).await?;
        }
        metrics::record_detail_requests(request_count);

        self.changes.produce(&batch.to_message()).await?;
        self.cursor.advance(current).await?;

        info!(
            from = cursor,
            to = current,
            apps = batch.app_count(),
            packages = batch.package_count(),
            requests = request_count,
            "Changes dispatched"
        );
        Ok(ChangeOutcome::Advanced { from: cursor, to: current })
    }

    /// Produce one entity message per returned or unknown id.
    ///
    /// Returns how many messages were produced.
    pub async fn handle_product_info(&self, response: ProductInfoResponse) -> Result<usize> {
        let mut produced = 0;

        for (kind, channel, found, unknown) in [
            (EntityKind::App, &self.apps, response.apps, response.unknown_apps),
            (EntityKind::Package, &self.packages, response.packages, response.unknown_packages),
        ] {
            let (found_count, missing_count) = (found.len(), unknown.len());
            for info in found {
                channel.produce(&EntityMessage::found(kind, info)).await?;
                produced += 1;
            }
            for id in unknown {
                channel.produce(&EntityMessage::missing(kind, id)).await?;
                produced += 1;
            }
            metrics::record_entities(kind.as_str(), found_count, missing_count);
        }

        debug!(produced, "Product info dispatched");
        Ok(produced)
    }
}

impl<C: CatalogSession> std::fmt::Debug for ChangePoller<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangePoller")
            .field("state", &self.session_state())
            .field("cursor", &self.cursor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BoxFuture, Broker};
    use crate::memory::MemoryBroker;
    use crate::queue::ChannelSpec;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        changes_since: StdMutex<Vec<u32>>,
        detail_requests: StdMutex<Vec<ProductInfoRequest>>,
        fail_details: std::sync::atomic::AtomicBool,
    }

    impl CatalogSession for Recorder {
        fn connect(&self) -> BoxFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn log_on(&self, _details: LogOnDetails) -> BoxFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn request_changes_since(&self, change_number: u32) -> BoxFuture<'_, ()> {
            self.changes_since.lock().unwrap().push(change_number);
            Box::pin(async { Ok(()) })
        }

        fn request_product_info(&self, request: ProductInfoRequest) -> BoxFuture<'_, ()> {
            if self.fail_details.load(std::sync::atomic::Ordering::SeqCst) {
                return Box::pin(async { Err(PipelineError::catalog("product_info", "session gone")) });
            }
            self.detail_requests.lock().unwrap().push(request);
            Box::pin(async { Ok(()) })
        }
    }

    struct Fixture {
        broker: Arc<MemoryBroker>,
        session: Arc<Recorder>,
        poller: ChangePoller<Recorder>,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(MemoryBroker::default());
        let registry = ChannelRegistry::new();
        for queue in [QueueName::Changes, QueueName::Apps, QueueName::Packages] {
            let ch = Arc::new(Channel::new(ChannelSpec::new(queue), Arc::clone(&broker) as Arc<dyn Broker>));
            ch.connect().await.unwrap();
            registry.insert(ch);
        }

        let config = PollerConfig {
            cursor_path: dir.path().join("change_number.txt"),
            auth_token_path: Some(dir.path().join("auth_token.txt")),
            rate_limit_enabled: false,
            ..PollerConfig::default()
        };
        let session = Arc::new(Recorder::default());
        let poller = ChangePoller::new(Arc::clone(&session), config, &registry).unwrap();

        Fixture {
            broker,
            session,
            poller,
            _dir: dir,
        }
    }

    fn delta(since: u32, current: u32, apps: &[(u32, u32)]) -> ChangesResponse {
        ChangesResponse {
            since_change_number: since,
            current_change_number: current,
            app_changes: apps
                .iter()
                .map(|&(id, change_number)| EntityChange { id, change_number })
                .collect(),
            package_changes: vec![],
        }
    }

    #[tokio::test]
    async fn test_delta_produces_changes_and_advances_cursor() {
        let f = fixture().await;
        std::fs::write(f.poller.cursor().path(), "4").unwrap();

        let outcome = f.poller.handle_changes(delta(4, 6, &[(10, 5), (20, 6)])).await.unwrap();
        assert_eq!(outcome, ChangeOutcome::Advanced { from: 4, to: 6 });

        let produced = f.broker.ready(QueueName::Changes);
        assert_eq!(produced.len(), 1);
        let msg: ChangeMessage = serde_json::from_slice(&produced[0].body).unwrap();
        assert_eq!(msg.app_ids, BTreeMap::from([(10, 5), (20, 6)]));

        let requests = f.session.detail_requests.lock().unwrap().clone();
        assert_eq!(requests, vec![ProductInfoRequest { apps: vec![10, 20], packages: vec![] }]);
        assert_eq!(std::fs::read_to_string(f.poller.cursor().path()).unwrap(), "6");
    }

    #[tokio::test]
    async fn test_stale_response_is_a_no_op() {
        let f = fixture().await;
        std::fs::write(f.poller.cursor().path(), "10").unwrap();

        for current in [10, 9] {
            let outcome = f.poller.handle_changes(delta(8, current, &[(1, current)])).await.unwrap();
            assert!(matches!(outcome, ChangeOutcome::Stale { .. }));
        }
        assert_eq!(f.broker.ready_count(QueueName::Changes), 0);
        assert!(f.session.detail_requests.lock().unwrap().is_empty());
        assert_eq!(std::fs::read_to_string(f.poller.cursor().path()).unwrap(), "10");
    }

    #[tokio::test]
    async fn test_mismatched_since_is_discarded() {
        let f = fixture().await;
        std::fs::write(f.poller.cursor().path(), "4").unwrap();
        assert!(f.poller.poll().await.unwrap());

        // Starts past the cursor: 5..=8 would be lost
        let outcome = f.poller.handle_changes(delta(8, 10, &[(1, 9)])).await.unwrap();
        assert_eq!(outcome, ChangeOutcome::Mismatched { since: 8, expected: 4 });

        // Answers an older request
        let outcome = f.poller.handle_changes(delta(2, 10, &[(1, 9)])).await.unwrap();
        assert_eq!(outcome, ChangeOutcome::Mismatched { since: 2, expected: 4 });

        assert_eq!(f.broker.ready_count(QueueName::Changes), 0);
        assert!(f.session.detail_requests.lock().unwrap().is_empty());
        assert_eq!(std::fs::read_to_string(f.poller.cursor().path()).unwrap(), "4");
        assert!(!f.poller.poll().await.unwrap(), "request must stay outstanding");

        let outcome = f.poller.handle_changes(delta(4, 10, &[(1, 9)])).await.unwrap();
        assert_eq!(outcome, ChangeOutcome::Advanced { from: 4, to: 10 });
        assert!(f.poller.poll().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_dispatch_keeps_cursor() {
        let f = fixture().await;

        f.broker.fail_next_publishes(1);
        assert!(f.poller.handle_changes(delta(0, 3, &[(1, 3)])).await.is_err());
        assert_eq!(f.poller.cursor().get().await.unwrap(), 0);
        assert!(!f.poller.cursor().path().exists());

        f.session.fail_details.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(f.poller.handle_changes(delta(0, 3, &[(1, 3)])).await.is_err());
        assert_eq!(f.broker.ready_count(QueueName::Changes), 0);
        assert_eq!(f.poller.cursor().get().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_poll_keeps_one_request_in_flight() {
        let f = fixture().await;

        assert!(f.poller.poll().await.unwrap());
        assert!(!f.poller.poll().await.unwrap());
        assert_eq!(*f.session.changes_since.lock().unwrap(), vec![0]);

        f.poller.handle_changes(delta(0, 5, &[])).await.unwrap();
        assert!(f.poller.poll().await.unwrap());
        assert_eq!(*f.session.changes_since.lock().unwrap(), vec![0, 5]);
    }

    #[tokio::test]
    async fn test_in_flight_marker_times_out() {
        let mut f = fixture().await;
        f.poller.config.response_timeout = "10ms".to_string();

        assert!(f.poller.poll().await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.poller.poll().await.unwrap());
    }

    #[tokio::test]
    async fn test_product_info_produces_entities_and_placeholders() {
        let f = fixture().await;
        let response = ProductInfoResponse {
            apps: vec![ProductInfo {
                id: 10,
                change_number: 5,
                payload: serde_json::json!({"name": "x"}),
            }],
            packages: vec![],
            unknown_apps: vec![99],
            unknown_packages: vec![7],
        };

        assert_eq!(f.poller.handle_product_info(response).await.unwrap(), 3);

        let apps: Vec<EntityMessage> = f
            .broker
            .ready(QueueName::Apps)
            .iter()
            .map(|m| serde_json::from_slice(&m.body).unwrap())
            .collect();
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].id, 10);
        assert!(!apps[0].missing);
        assert_eq!(apps[1].id, 99);
        assert!(apps[1].missing);

        let packages = f.broker.ready(QueueName::Packages);
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].headers.first_queue.as_deref(), Some("packages"));
    }

    #[tokio::test]
    async fn test_auth_token_event_is_persisted() {
        let f = fixture().await;
        assert_eq!(
            f.poller.handle_event(CatalogEvent::AuthTokenIssued("tok".to_string())).await,
            None
        );
        let saved = std::fs::read_to_string(f.poller.config.auth_token_path.as_ref().unwrap()).unwrap();
        assert_eq!(saved, "tok");
    }

    #[tokio::test]
    async fn test_event_mapping() {
        let f = fixture().await;
        assert_eq!(f.poller.handle_event(CatalogEvent::Connected).await, Some(SessionInput::Connected));
        assert_eq!(
            f.poller
                .handle_event(CatalogEvent::LoggedOff { reason: "x".to_string() })
                .await,
            Some(SessionInput::LoggedOff)
        );
        assert_eq!(
            f.poller.handle_event(CatalogEvent::Error("boom".to_string())).await,
            Some(SessionInput::FatalError)
        );
    }
}
