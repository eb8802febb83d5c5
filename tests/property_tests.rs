//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use catalog_pipeline::cursor::{parse_cursor, CursorStore};
use catalog_pipeline::delay::{BackoffPolicy, DelayDecision};
use catalog_pipeline::poller::{ChangeBatch, ChangesResponse, EntityChange};
use catalog_pipeline::{Headers, QueueName};
use proptest::prelude::*;
use std::time::Duration;

fn queue_name() -> impl Strategy<Value = QueueName> {
    prop::sample::select(QueueName::ALL.to_vec())
}

fn headers() -> impl Strategy<Value = Headers> {
    (
        prop::option::of(0u32..1000),
        prop::option::of(0i64..2_000_000_000),
        prop::option::of(0i64..2_000_000_000),
        prop::option::of(queue_name()),
        prop::option::of(queue_name()),
    )
        .prop_map(|(attempt, first_seen, last_seen, first_queue, last_queue)| Headers {
            attempt,
            first_seen,
            last_seen,
            first_queue: first_queue.map(|q| q.to_string()),
            last_queue: last_queue.map(|q| q.to_string()),
        })
}

fn changes() -> impl Strategy<Value = Vec<EntityChange>> {
    prop::collection::vec(
        (0u32..50, 0u32..10_000).prop_map(|(id, change_number)| EntityChange { id, change_number }),
        0..100,
    )
}

// =============================================================================
// Header rewrite
// =============================================================================

proptest! {
    /// Attempt strictly increases on every rewrite.
    #[test]
    fn rewrite_increments_attempt(h in headers(), queue in queue_name(), now in 0i64..2_000_000_000) {
        let next = h.rewritten(queue.as_str(), now);
        prop_assert_eq!(next.attempt, Some(h.attempt.map_or(1, |a| a + 1)));
    }

    /// first-seen and first-queue never change once set.
    #[test]
    fn rewrite_keeps_first_fields(h in headers(), queue in queue_name(), now in 0i64..2_000_000_000) {
        let next = h.rewritten(queue.as_str(), now);
        if let Some(first_seen) = h.first_seen {
            prop_assert_eq!(next.first_seen, Some(first_seen));
        }
        if let Some(first_queue) = &h.first_queue {
            prop_assert_eq!(next.first_queue.as_deref(), Some(first_queue.as_str()));
        }
        prop_assert_eq!(next.last_queue.as_deref(), Some(queue.as_str()));
    }

    /// last-seen is never before first-seen.
    #[test]
    fn rewrite_last_seen_not_before_first(h in headers(), now in 0i64..2_000_000_000) {
        let next = h.rewritten("apps", now);
        prop_assert!(next.last_seen.unwrap() >= next.first_seen.unwrap());
    }

    /// Repeated hops count every hop.
    #[test]
    fn rewrite_chain_counts_hops(hops in 1usize..20, start in 0i64..1_000_000) {
        let mut h = Headers::default();
        for i in 0..hops {
            h = h.rewritten("apps", start + i as i64);
        }
        prop_assert_eq!(h.attempt, Some(hops as u32));
        prop_assert_eq!(h.first_seen, Some(start));
    }
}

// =============================================================================
// Backoff
// =============================================================================

proptest! {
    /// Delay always lands inside [min, max].
    #[test]
    fn backoff_within_bounds(attempt in 0u32..10_000) {
        let policy = BackoffPolicy::default();
        let delay = policy.delay_for_attempt(attempt);
        prop_assert!(delay >= Duration::from_secs(2));
        prop_assert!(delay <= Duration::from_secs(3600));
    }

    /// More attempts never wait less.
    #[test]
    fn backoff_monotonic(a in 0u32..5_000, b in 0u32..5_000) {
        let policy = BackoffPolicy::default();
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(policy.delay_for_attempt(lo) <= policy.delay_for_attempt(hi));
    }

    /// Messages without a usable last-queue never go back into a work queue.
    #[test]
    fn decide_never_retries_into_delay_or_failed(h in headers(), now in 0i64..2_000_000_000) {
        match BackoffPolicy::default().decide(&h, now) {
            DelayDecision::Retry { queue } | DelayDecision::Wait { queue, .. } => {
                prop_assert!(queue.is_retry_target());
                prop_assert_eq!(Some(queue.as_str()), h.last_queue.as_deref());
            }
            DelayDecision::DeadLetter { .. } => {
                let retryable = h
                    .last_queue
                    .as_deref()
                    .and_then(|q| q.parse::<QueueName>().ok())
                    .is_some_and(|q| q.is_retry_target());
                prop_assert!(!retryable);
            }
        }
    }

    /// A message is due exactly when its backoff has elapsed since last-seen.
    #[test]
    fn decide_due_after_backoff(attempt in 1u32..40, last_seen in 0i64..1_000_000, elapsed in 0i64..10_000) {
        let policy = BackoffPolicy::default();
        let h = Headers {
            attempt: Some(attempt),
            last_seen: Some(last_seen),
            last_queue: Some("apps".to_string()),
            ..Default::default()
        };
        let backoff = policy.delay_for_attempt(attempt).as_secs_f64().ceil() as i64;
        let decision = policy.decide(&h, last_seen + elapsed);
        if elapsed >= backoff {
            prop_assert_eq!(decision, DelayDecision::Retry { queue: QueueName::Apps });
        } else {
            let is_wait = matches!(decision, DelayDecision::Wait { .. });
            prop_assert!(is_wait);
        }
    }
}

// =============================================================================
// Cursor
// =============================================================================

proptest! {
    /// Any u32 written as text parses back, surrounding whitespace included.
    #[test]
    fn cursor_parses_formatted_numbers(n in any::<u32>(), pad in "[ \t\n]{0,3}") {
        prop_assert_eq!(parse_cursor(&format!("{}{}{}", pad, n, pad)).unwrap(), n);
    }

    /// Parsing arbitrary text never panics.
    #[test]
    fn cursor_parse_never_panics(s in ".*") {
        let _ = parse_cursor(&s);
    }

    /// The stored cursor is the running maximum of everything advanced to.
    #[test]
    fn cursor_only_moves_forward(steps in prop::collection::vec(0u32..1000, 1..20)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let store = CursorStore::new(dir.path().join("cursor.txt"));
            let mut max = 0;
            for step in &steps {
                let moved = store.advance(*step).await.unwrap();
                prop_assert_eq!(moved, *step > max);
                max = max.max(*step);
                prop_assert_eq!(store.get().await.unwrap(), max);
            }

            let reopened = CursorStore::new(dir.path().join("cursor.txt"));
            prop_assert_eq!(reopened.get().await.unwrap(), max);
            Ok(())
        })?;
    }
}

// =============================================================================
// Change partitioning
// =============================================================================

proptest! {
    /// One entry per id, holding the highest change number for it.
    #[test]
    fn partition_keeps_max_per_id(apps in changes(), packages in changes()) {
        let response = ChangesResponse {
            since_change_number: 0,
            current_change_number: 1,
            app_changes: apps.clone(),
            package_changes: packages.clone(),
        };
        let message = ChangeBatch::from_response(&response).to_message();

        for change in &apps {
            prop_assert!(message.app_ids[&change.id] >= change.change_number);
        }
        for (id, n) in &message.app_ids {
            prop_assert!(apps.iter().any(|c| c.id == *id && c.change_number == *n));
        }
        prop_assert_eq!(
            message.package_ids.len(),
            packages.iter().map(|c| c.id).collect::<std::collections::HashSet<_>>().len()
        );
    }

    /// Detail requests cover every id exactly once and respect the size cap.
    #[test]
    fn detail_requests_cover_all_ids(apps in changes(), packages in changes(), max_ids in 1usize..30) {
        let response = ChangesResponse {
            app_changes: apps,
            package_changes: packages,
            ..Default::default()
        };
        let batch = ChangeBatch::from_response(&response);
        let requests = batch.detail_requests(max_ids);

        prop_assert!(requests.iter().all(|r| !r.is_empty() && r.len() <= max_ids));
        let requested_apps: usize = requests.iter().map(|r| r.apps.len()).sum();
        let requested_packages: usize = requests.iter().map(|r| r.packages.len()).sum();
        prop_assert_eq!(requested_apps, batch.app_count());
        prop_assert_eq!(requested_packages, batch.package_count());
    }
}
