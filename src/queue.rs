//! Fixed queue topology.
//!
//! The pipeline uses a closed set of durable queues. There is no dynamic
//! queue creation: every name here is declared at startup.
//!
//! ```text
//! apps ─┐
//! packages ─┤ (entity work)       changes (summaries)
//! players ─┘
//!     │ handler failure
//!     ▼
//!   delay ──(deadline passed)──► original queue
//!     │
//!     └──(unroutable)──► failed
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A queue in the pipeline topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Apps,
    Packages,
    Players,
    Changes,
    Delay,
    Failed,
    Test,
}

impl QueueName {
    /// Every queue, in declaration order.
    pub const ALL: [QueueName; 7] = [
        QueueName::Apps,
        QueueName::Packages,
        QueueName::Players,
        QueueName::Changes,
        QueueName::Delay,
        QueueName::Failed,
        QueueName::Test,
    ];

    /// Broker-side queue name.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Apps => "apps",
            QueueName::Packages => "packages",
            QueueName::Players => "players",
            QueueName::Changes => "changes",
            QueueName::Delay => "delay",
            QueueName::Failed => "failed",
            QueueName::Test => "test",
        }
    }

    /// Whether publishing through this queue's channel rewrites retry headers.
    ///
    /// The delay and failed queues preserve headers: the delay router relies
    /// on `last-seen`/`last-queue` pointing at the work queue that failed,
    /// and dead-lettered messages keep the attempt count they failed with.
    pub fn rewrites_headers(&self) -> bool {
        !matches!(self, QueueName::Delay | QueueName::Failed)
    }

    /// Whether the delay router may send a message back into this queue.
    pub fn is_retry_target(&self) -> bool {
        self.rewrites_headers()
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| format!("unknown queue: {}", s))
    }
}

/// Everything a broker needs to open a channel for one queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    /// Queue this channel is bound to.
    pub queue: QueueName,
    /// QoS prefetch count.
    pub prefetch: u16,
    /// Deliveries accumulated before the handler runs.
    pub batch_size: usize,
    /// Flush a partial batch after this long. `None` waits for a full batch.
    pub batch_timeout: Option<Duration>,
    /// Apply the retry-header rewrite on produce.
    pub rewrite_headers: bool,
}

impl ChannelSpec {
    /// Spec with single-message batches and the queue's default rewrite rule.
    pub fn new(queue: QueueName) -> Self {
        Self {
            queue,
            prefetch: 10,
            batch_size: 1,
            batch_timeout: None,
            rewrite_headers: queue.rewrites_headers(),
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_batch(mut self, batch_size: usize, batch_timeout: Option<Duration>) -> Self {
        self.batch_size = batch_size.max(1);
        self.batch_timeout = batch_timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip_through_from_str() {
        for q in QueueName::ALL {
            assert_eq!(q.as_str().parse::<QueueName>().unwrap(), q);
            assert_eq!(q.to_string(), q.as_str());
        }
        assert!("nope".parse::<QueueName>().is_err());
    }

    #[test]
    fn test_rewrite_rule_per_queue() {
        assert!(QueueName::Apps.rewrites_headers());
        assert!(QueueName::Changes.rewrites_headers());
        assert!(!QueueName::Delay.rewrites_headers());
        assert!(!QueueName::Failed.rewrites_headers());
        assert!(!QueueName::Failed.is_retry_target());
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&QueueName::Packages).unwrap();
        assert_eq!(json, "\"packages\"");
        let q: QueueName = serde_json::from_str("\"delay\"").unwrap();
        assert_eq!(q, QueueName::Delay);
    }

    #[test]
    fn test_channel_spec_builder() {
        let spec = ChannelSpec::new(QueueName::Delay)
            .with_prefetch(1)
            .with_batch(0, Some(Duration::from_secs(1)));
        assert_eq!(spec.prefetch, 1);
        assert_eq!(spec.batch_size, 1, "batch size is clamped to at least one");
        assert!(!spec.rewrite_headers);
    }
}
