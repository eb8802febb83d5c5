//! Pipeline lifecycle and health types.
//!
//! ```text
//!              start()
//! Created ─────────────→ Connecting ──(brokers + producers open)──→ Running
//!    │                       │                                        │
//!    │                       │ (broker unreachable, retries spent)    │ shutdown()
//!    │                       ↓                                        ↓
//!    │                    Failed                                ShuttingDown
//!    │                                                                │
//!    └──────────────────────── shutdown() ─────────────────────→ Stopped
//! ```
//!
//! Consumers are not part of `Running`: they start later, the first time the
//! catalog session logs on (or when `start_consumers` is called directly).

use crate::poller::SessionState;
use crate::queue::QueueName;
use std::fmt;

/// State of the pipeline service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built but not started.
    Created,
    /// Dialing brokers and opening producer channels.
    Connecting,
    /// Producers open; the poller and consumers may be started.
    Running,
    /// Tasks are being signalled and drained.
    ShuttingDown,
    /// Clean stop. Terminal.
    Stopped,
    /// Startup could not complete. Terminal.
    Failed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which connection a channel rides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Producer,
    Consumer,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRole::Producer => f.write_str("producer"),
            ChannelRole::Consumer => f.write_str("consumer"),
        }
    }
}

/// Health of a single channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHealth {
    pub queue: QueueName,
    pub role: ChannelRole,
    pub open: bool,
}

/// Point-in-time health snapshot.
///
/// Collected from cached state only; building one does no broker I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running with the producer connection up.
    pub ready: bool,
    /// Ready, every producer channel open, and (once started) every consumer
    /// channel open.
    pub healthy: bool,
    pub producer_connected: bool,
    pub consumer_connected: bool,
    pub consumers_started: bool,
    /// `None` until a poller has been started.
    pub session_state: Option<SessionState>,
    pub channels: Vec<ChannelHealth>,
}

impl HealthCheck {
    /// Queues whose channel is currently closed.
    pub fn closed_channels(&self) -> Vec<(ChannelRole, QueueName)> {
        self.channels
            .iter()
            .filter(|c| !c.open)
            .map(|c| (c.role, c.queue))
            .collect()
    }
}
