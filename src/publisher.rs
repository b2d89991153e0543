// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes envelope-wrapped events to topic exchanges. Every publish opens
//! its own channel, provisions the target exchange and closes the channel
//! once the message is handed to the broker. Failures are returned to the
//! caller as is; there is no internal retry on this path.

use crate::{
    channel::{AmqpChannel, ChannelFactory},
    envelope::{Envelope, JSON_CONTENT_TYPE},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    otel,
    retry::PERSISTENT_DELIVERY_MODE,
};
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Publishes events to RabbitMQ exchanges over a shared connection.
pub struct RabbitMQPublisher {
    connection: Arc<dyn ChannelFactory>,
}

impl RabbitMQPublisher {
    /// Creates a new RabbitMQ publisher.
    ///
    /// # Parameters
    /// * `connection` - Source of one fresh channel per publish
    ///
    /// # Returns
    /// An Arc-wrapped RabbitMQPublisher instance for thread-safe sharing
    pub fn new(connection: Arc<dyn ChannelFactory>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { connection })
    }

    /// Publishes `payload` to `exchange` as the data of a new envelope.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange, declared as a durable topic exchange if absent
    /// * `payload` - Serialized as the envelope `data`
    /// * `event_type` - Envelope `type`, also set as the AMQP `type` property
    /// * `source` - Envelope `source`
    /// * `message_id` - Envelope id; a v4 uuid is generated when `None` or blank
    /// * `routing_key` - Defaults to empty
    ///
    /// # Returns
    /// The message id that went on the wire
    pub async fn publish<T: Serialize + Sync>(
        &self,
        exchange: &str,
        payload: &T,
        event_type: &str,
        source: &str,
        message_id: Option<&str>,
        routing_key: Option<&str>,
    ) -> Result<String, AmqpError> {
        let message_id = match message_id.filter(|id| !id.trim().is_empty()) {
            Some(id) => id.to_owned(),
            None => Uuid::new_v4().to_string(),
        };
        let routing_key = routing_key.unwrap_or_default();

        let body = Envelope::new(&message_id, event_type, source, payload).encode()?;

        let channel = self.connection.open_channel().await.map_err(|err| {
            error!(
                error = err.to_string(),
                exchange = exchange,
                "failure to open channel for publishing"
            );
            err
        })?;

        let res = Self::send(
            channel.as_ref(),
            exchange,
            routing_key,
            &body,
            Self::properties(&message_id, event_type),
        )
        .await;

        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "failure to close publisher channel");
        }

        match res {
            Ok(()) => {
                info!(
                    exchange = exchange,
                    routing_key = routing_key,
                    message_id = message_id,
                    event_type = event_type,
                    "message published"
                );
                Ok(message_id)
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = exchange,
                    message_id = message_id,
                    "error publishing message"
                );
                Err(err)
            }
        }
    }

    async fn send(
        channel: &dyn AmqpChannel,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        channel
            .declare_exchange(&ExchangeDefinition::new(exchange).topic().durable())
            .await?;

        channel.publish(exchange, routing_key, body, properties).await
    }

    fn properties(message_id: &str, event_type: &str) -> BasicProperties {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject(&Context::current(), &mut headers);

        BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_type(ShortString::from(event_type))
            .with_message_id(ShortString::from(message_id))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_headers(FieldTable::from(headers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{exchange::ExchangeKind, testing::FakeBroker};
    use serde_json::{json, Value};

    #[tokio::test]
    async fn should_publish_persistent_envelope() {
        let broker = FakeBroker::new();
        let publisher = RabbitMQPublisher::new(Arc::new(broker.clone()));

        let id = publisher
            .publish(
                "orders-exchange",
                &json!({ "orderId": 42 }),
                "order.created",
                "checkout",
                None,
                Some("order.created"),
            )
            .await
            .unwrap();

        assert!(Uuid::parse_str(&id).is_ok());

        let exchange = broker.exchange("orders-exchange").unwrap();
        assert_eq!(exchange.kind(), ExchangeKind::Topic);
        assert!(exchange.is_durable());

        let published = broker.published();
        assert_eq!(published.len(), 1);
        let message = &published[0];
        assert_eq!(message.exchange, "orders-exchange");
        assert_eq!(message.routing_key, "order.created");
        assert_eq!(
            message.properties.delivery_mode(),
            &Some(PERSISTENT_DELIVERY_MODE)
        );
        assert_eq!(
            message.properties.message_id().as_ref().map(|m| m.as_str()),
            Some(id.as_str())
        );

        let envelope = Envelope::<Value>::decode(&message.data).unwrap();
        assert_eq!(envelope.id, id);
        assert_eq!(envelope.event_type, "order.created");
        assert_eq!(envelope.source, "checkout");
        assert_eq!(envelope.data, json!({ "orderId": 42 }));
    }

    #[tokio::test]
    async fn should_keep_caller_message_id_and_empty_routing_key() {
        let broker = FakeBroker::new();
        let publisher = RabbitMQPublisher::new(Arc::new(broker.clone()));

        let id = publisher
            .publish("audit-exchange", &"ping", "audit.ping", "ops", Some("fixed-id"), None)
            .await
            .unwrap();

        assert_eq!(id, "fixed-id");
        assert_eq!(broker.published()[0].routing_key, "");
    }

    #[tokio::test]
    async fn should_generate_id_for_blank_message_id() {
        let broker = FakeBroker::new();
        let publisher = RabbitMQPublisher::new(Arc::new(broker.clone()));

        for blank in ["", "   "] {
            let id = publisher
                .publish(
                    "orders-exchange",
                    &json!({}),
                    "order.created",
                    "checkout",
                    Some(blank),
                    None,
                )
                .await
                .unwrap();

            assert!(Uuid::parse_str(&id).is_ok());
            let message = broker.published().pop().unwrap();
            let envelope = Envelope::<Value>::decode(&message.data).unwrap();
            assert_eq!(envelope.id, id);
        }
    }

    #[tokio::test]
    async fn should_fail_when_channel_cannot_be_opened() {
        let broker = FakeBroker::new();
        broker.fail_next_opens(1);
        let publisher = RabbitMQPublisher::new(Arc::new(broker.clone()));

        let res = publisher
            .publish("orders-exchange", &json!({}), "order.created", "checkout", None, None)
            .await;

        assert_eq!(res, Err(AmqpError::ConnectionError));
        assert!(broker.published().is_empty());
        assert!(broker.exchange("orders-exchange").is_none());
    }

    #[tokio::test]
    async fn should_surface_exchange_redeclare_conflicts() {
        let broker = FakeBroker::new();
        let publisher = RabbitMQPublisher::new(Arc::new(broker.clone()));
        let channel = broker.open_channel().await.unwrap();
        channel
            .declare_exchange(&ExchangeDefinition::new("orders-exchange").fanout())
            .await
            .unwrap();

        let res = publisher
            .publish("orders-exchange", &json!({}), "order.created", "checkout", None, None)
            .await;

        assert_eq!(
            res,
            Err(AmqpError::DeclareExchangeError("orders-exchange".to_owned()))
        );
        assert!(broker.published().is_empty());
    }
}
