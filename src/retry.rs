// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry and Dead-Letter Routing
//!
//! When a delivery fails, the retry budget travels with the message itself in
//! the `x-retry-count` header. A failed message is republished to the back of
//! its own queue with the counter incremented until the consumer's
//! `max_retry` is reached; after that it is published to the consumer's
//! dead-letter exchange. Republished copies are always persistent.

use crate::{
    channel::{AmqpChannel, InboundDelivery},
    errors::AmqpError,
    topology::ConsumerTopology,
};
use chrono::{SecondsFormat, Utc};
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use tracing::{error, warn};

/// Number of times a message has already been retried
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";
/// Instant of the last failed processing attempt
pub const AMQP_HEADERS_LAST_PROCESS: &str = "x-last-process";
/// Instant the message was sent to the dead-letter exchange
pub const AMQP_HEADERS_SEND_DLQ: &str = "x-send-dlq";

/// AMQP delivery mode for messages that survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Requeued,
    DeadLettered,
}

/// Reads the retry counter from message headers; absent or unparseable means 0.
pub fn retry_count(props: &BasicProperties) -> u32 {
    let Some(headers) = props.headers() else {
        return 0;
    };

    match headers.inner().get(AMQP_HEADERS_RETRY_COUNT) {
        Some(AMQPValue::LongString(v)) => parse_count(&String::from_utf8_lossy(v.as_bytes())),
        Some(AMQPValue::ShortString(v)) => parse_count(v.as_str()),
        Some(AMQPValue::ShortShortUInt(v)) => u32::from(*v),
        Some(AMQPValue::ShortUInt(v)) => u32::from(*v),
        Some(AMQPValue::LongUInt(v)) => *v,
        Some(AMQPValue::ShortShortInt(v)) => u32::try_from(*v).unwrap_or_default(),
        Some(AMQPValue::ShortInt(v)) => u32::try_from(*v).unwrap_or_default(),
        Some(AMQPValue::LongInt(v)) => u32::try_from(*v).unwrap_or_default(),
        Some(AMQPValue::LongLongInt(v)) => u32::try_from(*v).unwrap_or_default(),
        _ => 0,
    }
}

fn parse_count(raw: &str) -> u32 {
    raw.trim().parse().unwrap_or_default()
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn with_header(props: &BasicProperties, key: &str, value: String) -> BasicProperties {
    let mut headers = props.headers().clone().unwrap_or_else(FieldTable::default);
    headers.insert(
        ShortString::from(key),
        AMQPValue::LongString(LongString::from(value)),
    );

    props
        .clone()
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_headers(headers)
}

/// Requeues or dead-letters a failed delivery.
///
/// The caller acknowledges the original delivery only after this returns
/// `Ok`; on `Err` the delivery must be left unacknowledged.
pub async fn route(
    channel: &dyn AmqpChannel,
    delivery: &InboundDelivery,
    topology: &ConsumerTopology,
    max_retry: u32,
) -> Result<RouteOutcome, AmqpError> {
    let count = retry_count(&delivery.properties);

    if count >= max_retry {
        warn!(
            queue = topology.queue,
            dlq = topology.dead_letter_queue,
            retry_count = count,
            "too many attempts, sending to dlq"
        );

        let props = with_header(&delivery.properties, AMQP_HEADERS_SEND_DLQ, now());
        return match channel
            .publish(&topology.dead_letter_exchange, "", &delivery.data, props)
            .await
        {
            Ok(_) => Ok(RouteOutcome::DeadLettered),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = topology.dead_letter_exchange,
                    "error whiling sending to dlq"
                );
                Err(AmqpError::PublishingToDQLError)
            }
        };
    }

    warn!(
        queue = topology.queue,
        retry_count = count + 1,
        max_retry,
        "error whiling handling msg, requeuing for latter"
    );

    let props = with_header(
        &delivery.properties,
        AMQP_HEADERS_RETRY_COUNT,
        (count + 1).to_string(),
    );
    let props = with_header(&props, AMQP_HEADERS_LAST_PROCESS, now());

    match channel
        .publish("", &topology.queue, &delivery.data, props)
        .await
    {
        Ok(_) => Ok(RouteOutcome::Requeued),
        Err(err) => {
            error!(
                error = err.to_string(),
                queue = topology.queue,
                "error whiling requeuing"
            );
            Err(AmqpError::RequeuingMessageError)
        }
    }
}
