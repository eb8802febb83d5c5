//! Fuzz target for cursor file parsing.
//!
//! `parse_cursor` must never panic, and whatever it accepts must be the
//! trimmed contents read as a number (or 0 for blank input).

#![no_main]

use catalog_pipeline::cursor::parse_cursor;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Ok(value) = parse_cursor(data) {
        let trimmed = data.trim();
        if trimmed.is_empty() {
            assert_eq!(value, 0);
        } else {
            assert_eq!(trimmed.parse::<u32>().ok(), Some(value));
        }
    }
});
