//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - RabbitMQ testcontainer setup
//! - A scripted `CatalogSession` that records calls
//! - Polling helpers for asynchronous assertions

#![allow(dead_code)]

pub mod containers;
pub mod mock_catalog;

pub use containers::*;
pub use mock_catalog::*;

use catalog_pipeline::PipelineConfig;
use std::time::Duration;
use tempfile::TempDir;

/// Fast config with the cursor and auth token under `dir`.
pub fn test_config(uri: &str, dir: &TempDir) -> PipelineConfig {
    let mut config = PipelineConfig::for_testing(uri);
    config.poller.cursor_path = dir.path().join("last_changenumber.txt");
    config.poller.auth_token_path = Some(dir.path().join("auth_token.txt"));
    config
}

/// Wait until `check` holds, polling every 10ms for up to `timeout`.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
