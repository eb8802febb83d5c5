// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Broker integration traits.
//!
//! [`Channel`](crate::channel::Channel) never talks to an AMQP client
//! directly. It asks a [`Broker`] for a [`BrokerChannel`] bound to one queue
//! and drives that. Two implementations ship with the crate:
//!
//! - [`Connection`](crate::connection::Connection): lapin-backed, with
//!   reconnect supervision
//! - [`MemoryBroker`](crate::memory::MemoryBroker): in-process, for
//!   standalone runs and tests
//!
//! Everything crossing this seam is typed ([`Headers`], `Vec<u8>` bodies).

use crate::error::Result;
use crate::headers::Headers;
use crate::queue::ChannelSpec;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Stream of deliveries from one consumer subscription.
///
/// The stream ends (or yields an error) when the underlying broker channel
/// closes. Unacked deliveries are then redelivered by the broker.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<RawDelivery>> + Send>>;

/// One delivery as received from the broker, before it is wrapped in a
/// [`Message`](crate::message::Message).
pub struct RawDelivery {
    /// Opaque payload.
    pub body: Vec<u8>,
    /// Decoded retry headers (empty if the producer set none).
    pub headers: Headers,
    /// Whether the broker flagged this as a redelivery.
    pub redelivered: bool,
    /// Handle used to acknowledge this delivery.
    pub acker: Arc<dyn Acknowledge>,
}

impl std::fmt::Debug for RawDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawDelivery")
            .field("body_len", &self.body.len())
            .field("headers", &self.headers)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Acknowledgement handle for a single delivery.
pub trait Acknowledge: Send + Sync {
    /// Acknowledge the delivery. With `multiple`, also every earlier
    /// unacknowledged delivery on the same broker channel.
    fn ack(&self, multiple: bool) -> BoxFuture<'_, ()>;
}

/// A broker channel bound to exactly one declared queue.
pub trait BrokerChannel: Send + Sync {
    /// Whether the underlying broker channel is still usable.
    fn is_open(&self) -> bool;

    /// Publish `body` to this channel's queue with persistent delivery.
    ///
    /// Resolves once the broker has accepted the message.
    fn publish(&self, body: Vec<u8>, headers: Headers) -> BoxFuture<'_, ()>;

    /// Start consuming this channel's queue under `consumer_tag`.
    fn consume(&self, consumer_tag: &str) -> BoxFuture<'_, DeliveryStream>;

    /// Close the broker channel. Unacked deliveries go back to the queue.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Source of broker channels.
///
/// Implementations decide how long `open_channel` waits for an underlying
/// connection; the lapin implementation parks until it is reconnected.
pub trait Broker: Send + Sync + 'static {
    /// Open a channel: apply QoS and declare the queue (durable, non-exclusive).
    fn open_channel(&self, spec: &ChannelSpec) -> BoxFuture<'_, Arc<dyn BrokerChannel>>;

    /// Establish the underlying connection. Default: nothing to do.
    fn connect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Whether the underlying connection is usable.
    fn is_connected(&self) -> bool {
        true
    }

    /// Long-running supervision task (reconnect on close).
    ///
    /// Spawned once by the coordinator. Default: returns immediately.
    fn supervise(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Close the underlying connection.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Name used in logs and metrics.
    fn name(&self) -> &str;
}
