// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Trace context travels in AMQP message headers. Publishing writes the
//! current context into the outgoing header table; consuming reads it back
//! and parents the per-delivery consumer span on it.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context, KeyValue,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::warn;

/// Writes propagation fields into an outgoing header table.
struct HeaderInjector<'a>(&'a mut BTreeMap<ShortString, AMQPValue>);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(
            ShortString::from(key.to_lowercase()),
            AMQPValue::LongString(value.into()),
        );
    }
}

/// Reads propagation fields from the headers of a delivery.
struct HeaderExtractor<'a>(Option<&'a FieldTable>);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.0?.inner().get(key)? {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                .map_err(|err| warn!(key, error = err.to_string(), "invalid trace header"))
                .ok(),
            AMQPValue::ShortString(value) => Some(value.as_str()),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.0
            .map(|headers| headers.inner().keys().map(|k| k.as_str()).collect())
            .unwrap_or_default()
    }
}

pub(crate) fn inject(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector(headers))
    });
}

pub(crate) fn extract(props: &AMQPProperties) -> Context {
    global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(props.headers().as_ref()))
    })
}

/// Creates a consumer span for one delivery, parented on the context found
/// in its headers. `queue` is recorded as the messaging destination.
pub(crate) fn new_span(
    props: &AMQPProperties,
    tracer: &BoxedTracer,
    name: &str,
    queue: &str,
) -> (Context, BoxedSpan) {
    let ctx = extract(props);

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .with_attributes(vec![
            KeyValue::new("messaging.system", "rabbitmq"),
            KeyValue::new("messaging.destination.name", queue.to_owned()),
        ])
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
