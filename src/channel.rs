// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! The engine talks to the broker through two seams:
//! - `ChannelFactory` opens a fresh logical channel on the shared connection.
//! - `AmqpChannel` exposes the channel operations the engine needs.
//!
//! `AmqpConnection` is the lapin-backed factory. It re-establishes the
//! connection lazily when a channel is requested after the connection dropped.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    settings::RabbitMqConfig,
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Reply code sent when a channel is closed on purpose
const REPLY_SUCCESS: u16 = 200;

/// A message received from a queue, detached from the lapin consumer.
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl From<Delivery> for InboundDelivery {
    fn from(delivery: Delivery) -> Self {
        InboundDelivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// Stream of deliveries for one subscription. It ends, or yields an error,
/// when the underlying channel is closed.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// Channel operations used by the engine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Declares an exchange, creating it if absent.
    ///
    /// # Parameters
    /// * `def` - The exchange definition to declare
    ///
    /// # Returns
    /// `DeclareExchangeError` when the broker refuses the declaration,
    /// e.g. an existing exchange with different parameters
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue, creating it if absent.
    ///
    /// # Parameters
    /// * `def` - The queue definition, including its `x-queue-type` argument
    ///
    /// # Returns
    /// `DeclareQueueError` when the broker refuses the declaration
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    /// Binds a queue to an exchange with the binding's routing key.
    ///
    /// # Parameters
    /// * `binding` - Queue, exchange and routing key of the binding
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Limits unacknowledged deliveries on this channel.
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Subscribes to `queue` with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    /// Publishes a message.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange; empty for the default exchange
    /// * `routing_key` - Routing key; a queue name when `exchange` is empty
    /// * `payload` - Raw message body
    /// * `properties` - AMQP properties and headers sent with the message
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Acknowledges a single delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Closes the channel. Unacknowledged deliveries go back to their queues.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Opens logical channels on a shared broker connection.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Opens a new channel.
    ///
    /// # Returns
    /// The channel, or `ConnectionError`/`ChannelError` when the broker
    /// cannot be reached
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;
}

/// Establishes a new AMQP connection using the given configuration.
pub async fn new_amqp_connection(cfg: &RabbitMqConfig) -> Result<Connection, AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.connection_name.clone()));

    match Connection::connect(&cfg.uri(), options).await {
        Ok(conn) => {
            debug!("amqp connected");
            Ok(conn)
        }
        Err(err) => {
            error!(error = err.to_string(), host = cfg.host, "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }
}

/// Process-wide connection handle shared by every consumer and publish call.
pub struct AmqpConnection {
    cfg: RabbitMqConfig,
    conn: Mutex<Option<Arc<Connection>>>,
}

impl AmqpConnection {
    /// Connects eagerly so misconfiguration surfaces at startup.
    pub async fn connect(cfg: &RabbitMqConfig) -> Result<Arc<AmqpConnection>, AmqpError> {
        cfg.validate()?;
        let conn = new_amqp_connection(cfg).await?;

        Ok(Arc::new(AmqpConnection {
            cfg: cfg.clone(),
            conn: Mutex::new(Some(Arc::new(conn))),
        }))
    }

    async fn current(&self) -> Result<Arc<Connection>, AmqpError> {
        let mut guard = self.conn.lock().await;

        if let Some(conn) = guard.as_ref() {
            if conn.status().connected() {
                return Ok(conn.clone());
            }
            warn!(host = self.cfg.host, "amqp connection lost, reconnecting");
        }

        *guard = None;
        let conn = Arc::new(new_amqp_connection(&self.cfg).await?);
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl ChannelFactory for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let conn = self.current().await?;

        debug!("creating amqp channel...");
        match conn.create_channel().await {
            Ok(channel) => {
                debug!(id = channel.id(), "channel created");
                Ok(Arc::new(channel))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }
}

#[async_trait]
impl AmqpChannel for Channel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.exchange_declare(
            &def.name,
            def.kind.into(),
            ExchangeDeclareOptions {
                passive: false,
                durable: def.durable,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| {
            error!(
                error = err.to_string(),
                name = def.name,
                "error to declare the exchange"
            );
            AmqpError::DeclareExchangeError(def.name.clone())
        })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        match self
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(_) => Ok(()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.queue_bind(
            &binding.queue_name,
            &binding.exchange_name,
            &binding.routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error to bind queue to exchange");
            AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            )
        })
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::BindingConsumerError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|res| {
                res.map(InboundDelivery::from)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        match self
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), exchange, routing_key, "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.status().connected() {
            return Ok(());
        }

        Channel::close(self, REPLY_SUCCESS, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "error to close the channel");
            AmqpError::ChannelError
        })
    }
}
