//! Fuzz target for delay routing.
//!
//! Arbitrary retry headers and clocks must never panic the backoff math,
//! and a retry must only ever target a work queue.

#![no_main]

use catalog_pipeline::delay::{BackoffPolicy, DelayDecision};
use catalog_pipeline::Headers;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (Option<u32>, Option<i64>, Option<&str>, i64)| {
    let (attempt, last_seen, last_queue, now) = data;
    let headers = Headers {
        attempt,
        last_seen,
        last_queue: last_queue.map(str::to_string),
        ..Default::default()
    };

    let policy = BackoffPolicy::default();
    if let Some(attempt) = attempt {
        let delay = policy.delay_for_attempt(attempt);
        assert!(delay <= std::time::Duration::from_secs(3600));
    }

    match policy.decide(&headers, now) {
        DelayDecision::Retry { queue } | DelayDecision::Wait { queue, .. } => {
            assert!(queue.is_retry_target());
        }
        DelayDecision::DeadLetter { .. } => {}
    }
});
