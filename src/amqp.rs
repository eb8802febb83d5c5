//! lapin-backed broker channel and the header table codec.
//!
//! This is the only module that touches the untyped AMQP header table.
//! Headers are written as long-long ints / long strings; the decoder is
//! lenient and also accepts the other integer widths, timestamps and
//! numeric strings that foreign producers tend to emit.

use crate::broker::{Acknowledge, BoxFuture, BrokerChannel, DeliveryStream, RawDelivery};
use crate::error::PipelineError;
use crate::headers::{self, Headers};
use crate::queue::QueueName;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::BasicProperties;
use std::sync::Arc;
use tracing::debug;

/// AMQP delivery mode for messages that survive a broker restart.
pub const PERSISTENT: u8 = 2;

/// Encode typed headers into an AMQP field table. Absent fields are omitted.
pub fn headers_to_table(h: &Headers) -> FieldTable {
    let mut table = FieldTable::default();

    if let Some(attempt) = h.attempt {
        table.insert(ShortString::from(headers::ATTEMPT), AMQPValue::LongLongInt(attempt as i64));
    }
    if let Some(ts) = h.first_seen {
        table.insert(ShortString::from(headers::FIRST_SEEN), AMQPValue::LongLongInt(ts));
    }
    if let Some(ts) = h.last_seen {
        table.insert(ShortString::from(headers::LAST_SEEN), AMQPValue::LongLongInt(ts));
    }
    if let Some(q) = &h.first_queue {
        table.insert(ShortString::from(headers::FIRST_QUEUE), AMQPValue::LongString(LongString::from(q.as_str())));
    }
    if let Some(q) = &h.last_queue {
        table.insert(ShortString::from(headers::LAST_QUEUE), AMQPValue::LongString(LongString::from(q.as_str())));
    }

    table
}

/// Decode typed headers from an AMQP field table.
///
/// Unknown keys are ignored. Values of the wrong type are treated as absent.
pub fn headers_from_table(table: Option<&FieldTable>) -> Headers {
    let Some(table) = table else {
        return Headers::default();
    };
    let inner = table.inner();
    let get = |key: &str| inner.get(&ShortString::from(key));

    Headers {
        attempt: get(headers::ATTEMPT)
            .and_then(value_as_i64)
            .and_then(|v| u32::try_from(v).ok()),
        first_seen: get(headers::FIRST_SEEN).and_then(value_as_i64),
        last_seen: get(headers::LAST_SEEN).and_then(value_as_i64),
        first_queue: get(headers::FIRST_QUEUE).and_then(value_as_string),
        last_queue: get(headers::LAST_QUEUE).and_then(value_as_string),
    }
}

fn value_as_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(*v as i64),
        AMQPValue::ShortShortUInt(v) => Some(*v as i64),
        AMQPValue::ShortInt(v) => Some(*v as i64),
        AMQPValue::ShortUInt(v) => Some(*v as i64),
        AMQPValue::LongInt(v) => Some(*v as i64),
        AMQPValue::LongUInt(v) => Some(*v as i64),
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::Timestamp(v) => i64::try_from(*v).ok(),
        AMQPValue::Float(v) if v.is_finite() => Some(*v as i64),
        AMQPValue::Double(v) if v.is_finite() => Some(*v as i64),
        AMQPValue::ShortString(s) => s.as_str().trim().parse().ok(),
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok()?.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        _ => None,
    }
}

/// A lapin channel bound to one declared queue.
pub struct AmqpChannel {
    queue: QueueName,
    channel: lapin::Channel,
}

impl AmqpChannel {
    pub fn new(queue: QueueName, channel: lapin::Channel) -> Self {
        Self { queue, channel }
    }
}

impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    fn publish(&self, body: Vec<u8>, headers: Headers) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let properties = BasicProperties::default()
                .with_delivery_mode(PERSISTENT)
                .with_content_type(ShortString::from("application/json"))
                .with_headers(headers_to_table(&headers));

            let confirm = self
                .channel
                .basic_publish(
                    "",
                    self.queue.as_str(),
                    BasicPublishOptions::default(),
                    &body,
                    properties,
                )
                .await
                .map_err(|e| PipelineError::broker("basic_publish", e))?;

            let confirmation = confirm
                .await
                .map_err(|e| PipelineError::broker("publisher_confirm", e))?;
            if confirmation.is_nack() {
                return Err(PipelineError::broker_msg(
                    "publisher_confirm",
                    format!("broker nacked publish to {}", self.queue),
                ));
            }

            Ok(())
        })
    }

    fn consume(&self, consumer_tag: &str) -> BoxFuture<'_, DeliveryStream> {
        let consumer_tag = consumer_tag.to_string();
        Box::pin(async move {
            let consumer = self
                .channel
                .basic_consume(
                    self.queue.as_str(),
                    &consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| PipelineError::broker("basic_consume", e))?;

            debug!(queue = %self.queue, consumer_tag = %consumer_tag, "Consumer registered");

            let stream = consumer.map(|item| match item {
                Ok(delivery) => {
                    let headers = headers_from_table(delivery.properties.headers().as_ref());
                    Ok(RawDelivery {
                        headers,
                        redelivered: delivery.redelivered,
                        body: delivery.data,
                        acker: Arc::new(AmqpAcker(delivery.acker)) as Arc<dyn Acknowledge>,
                    })
                }
                Err(e) => Err(PipelineError::broker("consume", e)),
            });

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.channel.status().connected() {
                self.channel
                    .close(200, "closing")
                    .await
                    .map_err(|e| PipelineError::broker("channel_close", e))?;
            }
            Ok(())
        })
    }
}

struct AmqpAcker(Acker);

impl Acknowledge for AmqpAcker {
    fn ack(&self, multiple: bool) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.0
                .ack(BasicAckOptions { multiple })
                .await
                .map(|_| ())
                .map_err(|e| PipelineError::broker("basic_ack", e))
        })
    }
}
