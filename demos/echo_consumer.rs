// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Registers a single consumer that logs every event it receives, publishes
//! one event to it and runs until ctrl-c.
//!
//! Broker settings are read from `config/rabbitmq.toml` and `RABBITMQ_*`
//! environment variables.

use async_trait::async_trait;
use rabbitmq_consumers::{
    channel::AmqpConnection,
    descriptor::ConsumerDescriptor,
    dispatcher::RabbitMQDispatcher,
    envelope::Envelope,
    errors::{AmqpError, HandlerError},
    handler::{ConsumerHandler, MessageContext},
    publisher::RabbitMQPublisher,
    settings::RabbitMqConfig,
};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const EXCHANGE: &str = "echo-exchange";

struct Echo;

#[async_trait]
impl ConsumerHandler for Echo {
    async fn exec(&self, ctx: &MessageContext, event: &Envelope) -> Result<(), HandlerError> {
        info!(
            queue = ctx.queue,
            retry = ctx.retry_count,
            id = event.id,
            event_type = event.event_type,
            data = event.data.to_string(),
            "echo"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), AmqpError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = RabbitMqConfig::load()?;
    let connection = AmqpConnection::connect(&cfg).await?;
    let shutdown = CancellationToken::new();

    let dispatcher = RabbitMQDispatcher::new(connection.clone(), cfg.qos()).register(
        "echo",
        ConsumerDescriptor::new(EXCHANGE)
            .with_routing_key("echo.#")
            .with_max_retry(2),
        Arc::new(|| Box::new(Echo) as Box<dyn ConsumerHandler>),
    );
    let handles = dispatcher.start(&shutdown);

    RabbitMQPublisher::new(connection)
        .publish(
            EXCHANGE,
            &json!({ "hello": "world" }),
            "echo.greeting",
            "echo-demo",
            None,
            Some("echo.greeting"),
        )
        .await?;

    let _ = tokio::signal::ctrl_c().await;
    shutdown.cancel();

    for handle in handles {
        handle.join().await?;
    }

    Ok(())
}
