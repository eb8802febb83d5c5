//! Typed retry envelope carried in message headers.
//!
//! Every message that passes through a rewriting channel carries:
//!
//! | Header | Type | Rule on re-produce |
//! |--------|------|--------------------|
//! | `attempt` | int | increment, or set to 1 if absent |
//! | `first-seen` | unix seconds | set if absent, then immutable |
//! | `last-seen` | unix seconds | always overwritten |
//! | `first-queue` | string | set if absent, then immutable |
//! | `last-queue` | string | always overwritten with the channel's queue |
//!
//! Internal code only ever sees [`Headers`]. Conversion to and from the
//! broker's table format happens in [`crate::amqp`].

use serde::{Deserialize, Serialize};

/// Header key for the attempt counter.
pub const ATTEMPT: &str = "attempt";
/// Header key for the first-seen timestamp.
pub const FIRST_SEEN: &str = "first-seen";
/// Header key for the last-seen timestamp.
pub const LAST_SEEN: &str = "last-seen";
/// Header key for the origin queue.
pub const FIRST_QUEUE: &str = "first-queue";
/// Header key for the most recent queue.
pub const LAST_QUEUE: &str = "last-queue";

/// Retry metadata attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    pub attempt: Option<u32>,
    pub first_seen: Option<i64>,
    pub last_seen: Option<i64>,
    pub first_queue: Option<String>,
    pub last_queue: Option<String>,
}

impl Headers {
    /// Apply the re-produce rule for a hop into `queue` at unix time `now`.
    ///
    /// `last_seen` never drops below `first_seen`, even if the local clock
    /// is behind whoever stamped the message first.
    pub fn rewritten(&self, queue: &str, now: i64) -> Headers {
        let attempt = self.attempt.map_or(1, |a| a.saturating_add(1));
        let first_seen = self.first_seen.unwrap_or(now);

        Headers {
            attempt: Some(attempt),
            first_seen: Some(first_seen),
            last_seen: Some(now.max(first_seen)),
            first_queue: Some(self.first_queue.clone().unwrap_or_else(|| queue.to_string())),
            last_queue: Some(queue.to_string()),
        }
    }

    /// Attempt count, defaulting to 1 for messages that never passed a rewriting channel.
    pub fn attempt_or_default(&self) -> u32 {
        self.attempt.unwrap_or(1)
    }

    /// Last-seen timestamp, defaulting to `now`.
    pub fn last_seen_or(&self, now: i64) -> i64 {
        self.last_seen.unwrap_or(now)
    }

    /// True if no header has ever been written.
    pub fn is_empty(&self) -> bool {
        *self == Headers::default()
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_hop_initializes_everything() {
        let h = Headers::default().rewritten("apps", 1_000);

        assert_eq!(h.attempt, Some(1));
        assert_eq!(h.first_seen, Some(1_000));
        assert_eq!(h.last_seen, Some(1_000));
        assert_eq!(h.first_queue.as_deref(), Some("apps"));
        assert_eq!(h.last_queue.as_deref(), Some("apps"));
    }

    #[test]
    fn test_second_hop_keeps_origin() {
        let first = Headers::default().rewritten("apps", 1_000);
        let second = first.rewritten("packages", 1_060);

        assert_eq!(second.attempt, Some(2));
        assert_eq!(second.first_seen, Some(1_000));
        assert_eq!(second.last_seen, Some(1_060));
        assert_eq!(second.first_queue.as_deref(), Some("apps"));
        assert_eq!(second.last_queue.as_deref(), Some("packages"));
    }

    #[test]
    fn test_clock_skew_keeps_last_seen_after_first_seen() {
        let h = Headers {
            first_seen: Some(5_000),
            ..Default::default()
        };
        let next = h.rewritten("apps", 4_000);
        assert_eq!(next.first_seen, Some(5_000));
        assert_eq!(next.last_seen, Some(5_000));
    }

    #[test]
    fn test_attempt_saturates() {
        let h = Headers {
            attempt: Some(u32::MAX),
            ..Default::default()
        };
        assert_eq!(h.rewritten("apps", 1).attempt, Some(u32::MAX));
    }

    #[test]
    fn test_defaults() {
        let h = Headers::default();
        assert!(h.is_empty());
        assert_eq!(h.attempt_or_default(), 1);
        assert_eq!(h.last_seen_or(42), 42);

        let h = h.rewritten("test", 7);
        assert!(!h.is_empty());
        assert_eq!(h.last_seen_or(42), 7);
    }
}
