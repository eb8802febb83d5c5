//! Consumed messages and their one-shot actions.
//!
//! A [`Message`] wraps one broker delivery. It can be actioned exactly once:
//! either acknowledged, or rerouted (published elsewhere, then acked). The
//! guard is an [`ActionState`] behind a mutex, so concurrent or repeated
//! calls collapse into the first one that succeeds.

use crate::broker::{Acknowledge, RawDelivery};
use crate::channel::{Channel, ChannelRegistry};
use crate::error::{PipelineError, Result};
use crate::headers::Headers;
use crate::metrics;
use crate::queue::QueueName;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// What has happened to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Pending,
    Acked,
    Rerouted,
}

/// Handler outcome for a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Done; acknowledge.
    Ack,
    /// Transient failure; park in the delay queue.
    Retry,
    /// Permanent failure; send to the failed queue.
    DeadLetter,
}

impl Disposition {
    /// Map a handler error onto a disposition.
    pub fn for_error(error: &PipelineError) -> Self {
        if error.is_retryable() {
            Disposition::Retry
        } else {
            Disposition::DeadLetter
        }
    }
}

struct MessageInner {
    body: Vec<u8>,
    headers: Headers,
    redelivered: bool,
    acker: Arc<dyn Acknowledge>,
    origin: Arc<Channel>,
    state: Mutex<ActionState>,
}

/// One consumed delivery. Cloning shares the action guard.
#[derive(Clone)]
pub struct Message {
    inner: Arc<MessageInner>,
}

impl Message {
    pub(crate) fn new(delivery: RawDelivery, origin: Arc<Channel>) -> Self {
        Self {
            inner: Arc::new(MessageInner {
                body: delivery.body,
                headers: delivery.headers,
                redelivered: delivery.redelivered,
                acker: delivery.acker,
                origin,
                state: Mutex::new(ActionState::Pending),
            }),
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    /// Whether the broker flagged this as a redelivery.
    pub fn redelivered(&self) -> bool {
        self.inner.redelivered
    }

    /// Queue this message was consumed from.
    pub fn queue(&self) -> QueueName {
        self.inner.origin.queue()
    }

    pub fn attempt(&self) -> u32 {
        self.inner.headers.attempt_or_default()
    }

    /// Decode the JSON body.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.inner.body).map_err(PipelineError::Decode)
    }

    pub async fn state(&self) -> ActionState {
        *self.inner.state.lock().await
    }

    pub async fn is_pending(&self) -> bool {
        self.state().await == ActionState::Pending
    }

    /// Acknowledge this delivery. No-op if already actioned.
    pub async fn ack(&self) -> Result<()> {
        self.ack_with(false).await
    }

    /// Acknowledge this and every earlier delivery on the same broker channel.
    pub async fn ack_multiple(&self) -> Result<()> {
        self.ack_with(true).await
    }

    async fn ack_with(&self, multiple: bool) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if *state != ActionState::Pending {
            let current = *state;
            debug!(queue = %self.queue(), state = ?current, "Message already actioned");
            return Ok(());
        }

        self.inner.acker.ack(multiple).await?;
        *state = ActionState::Acked;
        metrics::record_ack(self.queue().as_str());
        Ok(())
    }

    /// Publish this message to every target, then ack the original.
    ///
    /// An empty `targets` slice means "back to the queue it came from".
    /// If any publish fails the delivery stays unacked and the error is
    /// returned. No-op if already actioned.
    pub async fn send_to_queue(&self, targets: &[Arc<Channel>]) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if *state != ActionState::Pending {
            let current = *state;
            debug!(queue = %self.queue(), state = ?current, "Message already actioned");
            return Ok(());
        }

        let origin = std::slice::from_ref(&self.inner.origin);
        let targets = if targets.is_empty() { origin } else { targets };

        for target in targets {
            target
                .produce_raw(self.inner.body.clone(), self.inner.headers.clone())
                .await?;
        }

        let from = self.queue();
        for target in targets {
            metrics::record_reroute(from.as_str(), target.queue().as_str());
        }

        // Every copy is out. From here the message counts as rerouted even if
        // the ack is lost; the broker may then deliver a duplicate.
        *state = ActionState::Rerouted;
        if let Err(e) = self.inner.acker.ack(false).await {
            warn!(queue = %from, error = %e, "Ack after reroute failed, duplicate delivery possible");
        }
        Ok(())
    }

    /// Route according to a handler outcome.
    pub async fn settle(&self, disposition: Disposition, registry: &ChannelRegistry) -> Result<()> {
        match disposition {
            Disposition::Ack => self.ack().await,
            Disposition::Retry => {
                let delay = registry.get(QueueName::Delay)?;
                self.send_to_queue(&[delay]).await
            }
            Disposition::DeadLetter => {
                let failed = registry.get(QueueName::Failed)?;
                self.send_to_queue(&[failed]).await
            }
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("queue", &self.queue())
            .field("body_len", &self.inner.body.len())
            .field("headers", &self.inner.headers)
            .field("redelivered", &self.inner.redelivered)
            .finish()
    }
}
