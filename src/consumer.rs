// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Processing of a single delivery: decode the envelope, build a handler for
//! this delivery only, run it, and then either acknowledge the message or hand
//! it to the retry router. A failed message is acknowledged only once the
//! router has republished it, so a crash in between causes a redelivery
//! rather than a loss.

use crate::{
    channel::{AmqpChannel, InboundDelivery},
    envelope::Envelope,
    errors::{AmqpError, HandlerError},
    handler::{ConsumerRegistration, MessageContext},
    otel,
    retry::{self, RouteOutcome},
    topology::ConsumerTopology,
};
use futures_util::FutureExt;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// What happened to a delivery once processing finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acknowledged,
    Requeued,
    DeadLettered,
}

impl From<RouteOutcome> for DeliveryOutcome {
    fn from(outcome: RouteOutcome) -> Self {
        match outcome {
            RouteOutcome::Requeued => DeliveryOutcome::Requeued,
            RouteOutcome::DeadLettered => DeliveryOutcome::DeadLettered,
        }
    }
}

/// Acknowledgement handle for one delivery. Acking consumes it.
pub(crate) struct DeliveryHandle {
    channel: Arc<dyn AmqpChannel>,
    delivery_tag: u64,
}

impl DeliveryHandle {
    pub(crate) fn new(channel: Arc<dyn AmqpChannel>, delivery_tag: u64) -> Self {
        DeliveryHandle {
            channel,
            delivery_tag,
        }
    }

    pub(crate) async fn ack(self) -> Result<(), AmqpError> {
        self.channel.ack(self.delivery_tag).await
    }
}

/// Consumes and processes one message.
///
/// Returns `Err` only when the delivery was left unacknowledged: the router
/// could not republish it, or the acknowledgement itself failed.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    channel: Arc<dyn AmqpChannel>,
    registration: &ConsumerRegistration,
    topology: &ConsumerTopology,
    delivery: InboundDelivery,
    shutdown: CancellationToken,
) -> Result<DeliveryOutcome, AmqpError> {
    let retry_count = retry::retry_count(&delivery.properties);
    let (trace, mut span) = otel::new_span(
        &delivery.properties,
        tracer,
        &registration.name,
        &topology.queue,
    );
    let handle = DeliveryHandle::new(channel.clone(), delivery.delivery_tag);

    debug!(
        consumer = registration.name,
        queue = topology.queue,
        delivery_tag = delivery.delivery_tag,
        retry_count,
        "received"
    );

    let processed = match Envelope::decode(&delivery.data) {
        Ok(event) => {
            info!(
                consumer = registration.name,
                queue = topology.queue,
                event_type = event.event_type,
                id = event.id,
                "message received"
            );

            let ctx = MessageContext {
                consumer: registration.name.clone(),
                queue: topology.queue.clone(),
                exchange: delivery.exchange.clone(),
                routing_key: delivery.routing_key.clone(),
                delivery_tag: delivery.delivery_tag,
                retry_count,
                redelivered: delivery.redelivered,
                cancellation: shutdown,
                trace,
            };

            invoke(registration, &ctx, &event)
                .await
                .map_err(|err| err.to_string())
        }
        Err(err) => Err(err.to_string()),
    };

    if let Err(reason) = processed {
        error!(
            consumer = registration.name,
            queue = topology.queue,
            exchange = topology.exchange,
            routing_key = topology.routing_key,
            retry_count,
            error = reason,
            "error to process message"
        );
        span.record_error(&AmqpError::ConsumerError(reason.clone()));

        let outcome = match retry::route(
            channel.as_ref(),
            &delivery,
            topology,
            registration.descriptor.max_retry(),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    consumer = registration.name,
                    queue = topology.queue,
                    exchange = topology.exchange,
                    routing_key = topology.routing_key,
                    error = err.to_string(),
                    "message left unacknowledged"
                );
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("failure to route failed msg"),
                });
                return Err(err);
            }
        };

        if let Err(err) = handle.ack().await {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
            return Err(err);
        }

        span.set_status(Status::Error {
            description: Cow::from(reason),
        });
        return Ok(outcome.into());
    }

    match handle.ack().await {
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
            Err(err)
        }
        Ok(_) => {
            debug!(consumer = registration.name, "message successfully processed");
            span.set_status(Status::Ok);
            Ok(DeliveryOutcome::Acknowledged)
        }
    }
}

/// Runs a freshly built handler, converting timeouts and panics into failures.
/// The handler is dropped before this returns.
async fn invoke(
    registration: &ConsumerRegistration,
    ctx: &MessageContext,
    event: &Envelope,
) -> Result<(), HandlerError> {
    let handler = registration.factory.create();
    let exec = AssertUnwindSafe(handler.exec(ctx, event)).catch_unwind();

    let result = match registration.descriptor.handler_timeout() {
        Some(limit) => match tokio::time::timeout(limit, exec).await {
            Ok(result) => result,
            Err(_) => return Err(HandlerError::Timeout(limit)),
        },
        None => exec.await,
    };

    result.unwrap_or_else(|_| Err(HandlerError::failure("handler panicked")))
}
