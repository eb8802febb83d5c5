// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change-number cursor persistence.
//!
//! The cursor is the last upstream change number whose delta has been fully
//! dispatched. It lives in a plain-text file holding one decimal number.
//!
//! # Cursor Semantics
//!
//! ```text
//! changes(current=N) ──► produce ChangeMessage ──► advance(N) ──► file = N
//!                        (crash here = same delta re-requested, idempotent)
//! ```
//!
//! - Read lazily on first use; a missing or empty file means 0
//! - Only ever moves forward: `advance` to a value `<=` the current one is a no-op
//! - Every advance is written to a temp file, fsynced, then renamed over the
//!   original, so a crash leaves either the old or the new value
//!
//! A file that exists but does not parse is an error, never a silent reset:
//! resetting to 0 would replay the whole upstream history.

use crate::error::{PipelineError, Result};
use crate::metrics;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Parse cursor file contents. Surrounding whitespace is ignored; empty means 0.
pub fn parse_cursor(contents: &str) -> Result<u32> {
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed
        .parse::<u32>()
        .map_err(|e| PipelineError::CursorParse(format!("{:?}: {}", truncate(trimmed, 32), e)))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Replace `path` with `contents` via write-then-rename.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut tmp: OsString = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// File-backed, monotonic change-number cursor.
pub struct CursorStore {
    path: PathBuf,
    cache: Mutex<Option<u32>>,
}

impl CursorStore {
    /// Create a store for `path`. Nothing is read until first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<u32> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let value = parse_cursor(&contents)?;
                info!(path = %self.path.display(), change_number = value, "Loaded cursor");
                Ok(value)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No cursor file, starting from 0");
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Current change number, loading it from disk on first call.
    pub async fn get(&self) -> Result<u32> {
        let mut cache = self.cache.lock().await;
        if let Some(value) = *cache {
            return Ok(value);
        }
        let value = self.load().await?;
        *cache = Some(value);
        metrics::set_cursor(value);
        Ok(value)
    }

    /// Move the cursor to `to` and persist it.
    ///
    /// Returns `false` (and touches nothing) if `to` is not ahead of the
    /// current value. On a write failure the in-memory value is unchanged.
    pub async fn advance(&self, to: u32) -> Result<bool> {
        let mut cache = self.cache.lock().await;
        let current = match *cache {
            Some(value) => value,
            None => self.load().await?,
        };

        if to <= current {
            debug!(current, requested = to, "Cursor not advanced");
            *cache = Some(current);
            return Ok(false);
        }

        if let Err(e) = write_atomic(&self.path, to.to_string().as_bytes()).await {
            warn!(path = %self.path.display(), error = %e, "Failed to persist cursor");
            metrics::record_cursor_persist(false);
            return Err(e);
        }

        *cache = Some(to);
        metrics::record_cursor_persist(true);
        metrics::set_cursor(to);
        debug!(from = current, to, "Cursor advanced");
        Ok(true)
    }
}

impl std::fmt::Debug for CursorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorStore").field("path", &self.path).finish()
    }
}
