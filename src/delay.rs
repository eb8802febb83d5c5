//! Delay/retry router.
//!
//! Consumes the delay queue and decides, from headers alone, where each
//! message goes next:
//!
//! ```text
//!              backoff = clamp(base^attempt, min, max)
//!              retry_at = last-seen + backoff
//!
//! retry_at <= now  ──► producer for last-queue (headers rewritten)
//! retry_at >  now  ──► pause, then back of the delay queue (headers kept)
//! no usable queue  ──► failed
//! ```
//!
//! The router is its own clock: a message cycles through the delay queue
//! until its deadline passes. No timers, no external state.

use crate::channel::{ChannelRegistry, Handler};
use crate::broker::BoxFuture;
use crate::config::DelayConfig;
use crate::error::Result;
use crate::headers::{unix_now, Headers};
use crate::message::Message;
use crate::metrics;
use crate::queue::QueueName;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Exponential backoff bounded to `[min, max]`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: f64,
    pub min: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: 1.5,
            min: Duration::from_secs(2),
            max: Duration::from_secs(3600),
        }
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &DelayConfig) -> Self {
        Self {
            base: config.base,
            min: config.min_delay_duration(),
            max: config.max_delay_duration(),
        }
    }

    /// `base^attempt` seconds, clamped. Non-decreasing in `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Past ~2000 the power is infinite for any sane base; max applies anyway
        let exponent = attempt.min(2048) as i32;
        let secs = self.base.powi(exponent);

        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        if secs <= self.min.as_secs_f64() {
            return self.min;
        }
        Duration::from_secs_f64(secs)
    }

    /// Decide where a delay-queue message goes at unix time `now`.
    pub fn decide(&self, headers: &Headers, now: i64) -> DelayDecision {
        let queue = match headers.last_queue.as_deref() {
            None => {
                return DelayDecision::DeadLetter {
                    reason: "missing last-queue header".to_string(),
                }
            }
            Some(name) => match name.parse::<QueueName>() {
                Ok(q) if q.is_retry_target() => q,
                Ok(q) => {
                    return DelayDecision::DeadLetter {
                        reason: format!("last-queue {} cannot be retried", q),
                    }
                }
                Err(e) => return DelayDecision::DeadLetter { reason: e },
            },
        };

        let backoff = self.delay_for_attempt(headers.attempt_or_default());
        let backoff_secs = backoff.as_secs_f64().ceil() as i64;
        let retry_at = headers.last_seen_or(now).saturating_add(backoff_secs);

        if retry_at <= now {
            DelayDecision::Retry { queue }
        } else {
            DelayDecision::Wait {
                queue,
                remaining: Duration::from_secs(retry_at.saturating_sub(now) as u64),
            }
        }
    }
}

/// Routing outcome for one delay-queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelayDecision {
    /// Deadline passed: back to the original queue.
    Retry { queue: QueueName },
    /// Not yet due: back of the delay queue.
    Wait { queue: QueueName, remaining: Duration },
    /// Nowhere sensible to retry: failed queue.
    DeadLetter { reason: String },
}

impl DelayDecision {
    fn label(&self) -> &'static str {
        match self {
            DelayDecision::Retry { .. } => "retry",
            DelayDecision::Wait { .. } => "wait",
            DelayDecision::DeadLetter { .. } => "dead_letter",
        }
    }
}

/// [`Handler`] for the delay queue.
pub struct DelayRouter {
    policy: BackoffPolicy,
    requeue_pause: Duration,
    producers: ChannelRegistry,
    clock: fn() -> i64,
}

impl DelayRouter {
    /// `producers` must hold the delay and failed channels plus every
    /// queue messages can be retried into.
    pub fn new(config: &DelayConfig, producers: ChannelRegistry) -> Self {
        Self {
            policy: BackoffPolicy::from_config(config),
            requeue_pause: config.requeue_pause_duration(),
            producers,
            clock: unix_now,
        }
    }

    /// Replace the wall clock (tests).
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Route one message. Leaves it unacked on publish failure.
    pub async fn route(&self, message: &Message) -> Result<DelayDecision> {
        let decision = self.policy.decide(message.headers(), (self.clock)());
        metrics::record_delay_decision(decision.label());

        match &decision {
            DelayDecision::Retry { queue } => {
                let target = self.producers.get(*queue)?;
                message.send_to_queue(&[target]).await?;
                debug!(queue = %queue, attempt = message.attempt(), "Retrying message");
            }
            DelayDecision::Wait { queue, remaining } => {
                tokio::time::sleep(self.requeue_pause).await;
                let delay = self.producers.get(QueueName::Delay)?;
                message.send_to_queue(&[delay]).await?;
                debug!(
                    queue = %queue,
                    attempt = message.attempt(),
                    remaining_secs = remaining.as_secs(),
                    "Message not due, requeued"
                );
            }
            DelayDecision::DeadLetter { reason } => {
                let failed = self.producers.get(QueueName::Failed)?;
                message.send_to_queue(&[failed]).await?;
                info!(reason = %reason, attempt = message.attempt(), "Message dead-lettered");
            }
        }

        Ok(decision)
    }
}

impl Handler for DelayRouter {
    fn handle(&self, batch: Vec<Message>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut first_error = None;
            for message in &batch {
                if let Err(e) = self.route(message).await {
                    warn!(error = %e, "Delay routing failed, message left unacked");
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), Err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::default()
    }

    fn headers(attempt: u32, last_seen: i64, last_queue: &str) -> Headers {
        Headers {
            attempt: Some(attempt),
            first_seen: Some(last_seen),
            last_seen: Some(last_seen),
            first_queue: Some(last_queue.to_string()),
            last_queue: Some(last_queue.to_string()),
        }
    }

    #[test]
    fn test_backoff_bounds() {
        let p = policy();
        assert_eq!(p.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(p.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(p.delay_for_attempt(3), Duration::from_secs_f64(3.375));
        assert_eq!(p.delay_for_attempt(30), Duration::from_secs(3600));
        assert_eq!(p.delay_for_attempt(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn test_backoff_monotonic() {
        let p = policy();
        let mut prev = Duration::ZERO;
        for attempt in 0..200 {
            let d = p.delay_for_attempt(attempt);
            assert!(d >= prev, "attempt {} went down", attempt);
            prev = d;
        }
    }

    #[test]
    fn test_overdue_message_is_retried() {
        let now = 1_700_000_000;
        let decision = policy().decide(&headers(3, now - 3600, "apps"), now);
        assert_eq!(decision, DelayDecision::Retry { queue: QueueName::Apps });
    }

    #[test]
    fn test_fresh_message_waits() {
        let now = 1_700_000_000;
        let decision = policy().decide(&headers(5, now, "packages"), now);
        // 1.5^5 = 7.59s, rounded up
        assert_eq!(
            decision,
            DelayDecision::Wait {
                queue: QueueName::Packages,
                remaining: Duration::from_secs(8),
            }
        );
    }

    #[test]
    fn test_defaults_for_missing_attempt_and_last_seen() {
        let now = 1_000;
        let h = Headers {
            last_queue: Some("players".to_string()),
            ..Default::default()
        };
        // attempt 1, last-seen now: 2s minimum backoff
        assert_eq!(
            policy().decide(&h, now),
            DelayDecision::Wait {
                queue: QueueName::Players,
                remaining: Duration::from_secs(2),
            }
        );
    }

    #[test]
    fn test_unroutable_messages_are_dead_lettered() {
        let now = 1_000;
        for h in [
            Headers::default(),
            headers(1, 0, "nope"),
            headers(1, 0, "delay"),
            headers(1, 0, "failed"),
        ] {
            assert!(
                matches!(policy().decide(&h, now), DelayDecision::DeadLetter { .. }),
                "{:?}",
                h
            );
        }
    }

    #[test]
    fn test_from_config() {
        let config = DelayConfig {
            base: 2.0,
            min_delay: "1s".to_string(),
            max_delay: "10s".to_string(),
            ..DelayConfig::default()
        };
        let p = BackoffPolicy::from_config(&config);
        assert_eq!(p.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(p.delay_for_attempt(10), Duration::from_secs(10));
    }

    fn fixed_clock() -> i64 {
        1_700_000_000
    }

    #[tokio::test]
    async fn test_router_handles_batch() {
        use crate::broker::Broker;
        use crate::channel::Channel;
        use crate::memory::MemoryBroker;
        use crate::queue::ChannelSpec;
        use futures::StreamExt;
        use std::sync::Arc;

        let broker = Arc::new(MemoryBroker::default());
        let producers = ChannelRegistry::new();
        for queue in [QueueName::Apps, QueueName::Delay, QueueName::Failed] {
            let ch = Channel::new(ChannelSpec::new(queue), Arc::clone(&broker) as Arc<dyn Broker>);
            ch.connect().await.unwrap();
            producers.insert(Arc::new(ch));
        }
        let router = DelayRouter::new(&DelayConfig::default(), producers.clone()).with_clock(fixed_clock);

        let now = fixed_clock();
        broker.inject(QueueName::Delay, "overdue", headers(3, now - 3600, "apps"));
        broker.inject(QueueName::Delay, "orphan", Headers::default());

        let raw = broker.open_channel(&ChannelSpec::new(QueueName::Delay)).await.unwrap();
        let mut stream = raw.consume("test").await.unwrap();
        let origin = producers.get(QueueName::Delay).unwrap();
        let mut batch = Vec::new();
        for _ in 0..2 {
            let delivery = stream.next().await.unwrap().unwrap();
            batch.push(Message::new(delivery, Arc::clone(&origin)));
        }

        router.handle(batch).await.unwrap();

        let retried = broker.ready(QueueName::Apps);
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].body, b"overdue");
        assert_eq!(retried[0].headers.attempt, Some(4));

        let failed = broker.ready(QueueName::Failed);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].headers, Headers::default());
        assert_eq!(broker.acked_count(QueueName::Delay), 2);
    }
}
