// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the ingestion pipeline.
//!
//! Errors are categorized by their source (broker, catalog session, cursor
//! file, etc.) and carry enough context to locate the failing operation.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Broker` | Yes | AMQP dial, declare, publish or consume failures |
//! | `ChannelClosed` | Yes | Channel not open yet (reconnect pending) |
//! | `Catalog` | Yes | Upstream catalog session request failed |
//! | `Encode` | No | Payload could not be marshalled |
//! | `Decode` | No | Message body is malformed (dead-letter it) |
//! | `CursorStore` | No | Local cursor/token file I/O (needs operator attention) |
//! | `CursorParse` | No | Cursor file content is not a change number |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Lifecycle state machine violation |
//! | `Shutdown` | No | Pipeline is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`PipelineError::is_retryable()`] to decide whether an operation
//! should be retried with backoff. Message handlers usually map a retryable
//! error to the delay queue and a non-retryable one to the failed queue
//! (see [`Disposition`](crate::message::Disposition)).

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur in the queue framework and change poller.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Broker protocol or network error.
    ///
    /// Covers dialing, channel creation, queue declaration, publish and
    /// consume. Retryable: the connection supervisor will reconnect.
    #[error("Broker error ({operation}): {message}")]
    Broker {
        operation: String,
        message: String,
        #[source]
        source: Option<lapin::Error>,
    },

    /// The channel for a queue is not open.
    ///
    /// Returned by `produce` instead of blocking. The channel supervisor
    /// reopens it, so callers retry later.
    #[error("Channel closed: {queue}")]
    ChannelClosed { queue: String },

    /// Upstream catalog session error (request could not be sent, session dropped).
    #[error("Catalog error ({operation}): {message}")]
    Catalog { operation: String, message: String },

    /// Payload could not be serialized.
    #[error("Encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// Message body could not be decoded into the expected payload.
    ///
    /// Not retryable: the body is malformed at the source.
    #[error("Decode error: {0}")]
    Decode(#[source] serde_json::Error),

    /// Cursor or auth-token file I/O error.
    #[error("Cursor store error: {0}")]
    CursorStore(#[from] std::io::Error),

    /// Cursor file exists but does not hold a change number.
    #[error("Cursor parse error: {0}")]
    CursorParse(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle state machine violation
    /// (e.g. calling `start()` on a pipeline that is already running).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Create a broker error from a `lapin::Error`.
    pub fn broker(operation: impl Into<String>, source: lapin::Error) -> Self {
        Self::Broker {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a broker error without source
    pub fn broker_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Broker {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a catalog session error.
    pub fn catalog(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Catalog {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Broker { .. } => true,
            Self::ChannelClosed { .. } => true,
            Self::Catalog { .. } => true,
            Self::Encode(_) => false,
            Self::Decode(_) => false, // Retrying a malformed body cannot help
            Self::CursorStore(_) => false,
            Self::CursorParse(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl PipelineError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Broker { .. } => "broker",
            Self::ChannelClosed { .. } => "channel_closed",
            Self::Catalog { .. } => "catalog",
            Self::Encode(_) => "encode",
            Self::Decode(_) => "decode",
            Self::CursorStore(_) => "cursor_store",
            Self::CursorParse(_) => "cursor_parse",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<lapin::Error> for PipelineError {
    fn from(e: lapin::Error) -> Self {
        Self::broker("unknown", e)
    }
}
