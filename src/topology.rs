// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares the broker objects a consumer depends on. For a
//! consumer reading from exchange `E` and queue `Q` it installs:
//! - `E` as a durable topic exchange and `E-dlx` as a durable fanout exchange
//! - `Q` and `Q-dlq`, durable and of the consumer's queue kind
//! - `Q` bound to `E` with the consumer's routing key, `Q-dlq` bound to `E-dlx`
//!
//! An empty routing key binds `Q` with `#`, so it receives everything
//! published to `E`.
//!
//! Declarations are declare-if-absent on the broker, so installing the same
//! topology again is harmless.

use crate::{
    channel::AmqpChannel,
    descriptor::ConsumerDescriptor,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{dlq_name, QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Suffix appended to an exchange name to obtain its dead-letter exchange
pub const DLX_SUFFIX: &str = "-dlx";

/// Dead-letter exchange name for an exchange: `E` ⇒ `E-dlx`.
pub fn dlx_name(exchange: &str) -> String {
    format!("{}{}", exchange, DLX_SUFFIX)
}

/// Topic pattern matching any routing key, including the empty one
pub const MATCH_ALL_ROUTING_KEY: &str = "#";

/// Binding key for a consumer routing key.
///
/// # Parameters
/// * `routing_key` - The routing key from the consumer descriptor
///
/// # Returns
/// `#` for an empty key, the key itself otherwise
pub fn binding_key(routing_key: &str) -> String {
    if routing_key.is_empty() {
        MATCH_ALL_ROUTING_KEY.to_owned()
    } else {
        routing_key.to_owned()
    }
}

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Installs the topology to the RabbitMQ server.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
pub struct AmqpTopology {
    channel: Arc<dyn AmqpChannel>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
}

impl AmqpTopology {
    pub fn new(channel: Arc<dyn AmqpChannel>) -> AmqpTopology {
        AmqpTopology {
            channel,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Creates exchanges first, then queues, then the bindings between them.
    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queues().await
    }
}

impl AmqpTopology {
    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);
            self.channel.declare_exchange(exch).await?;
            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<(), AmqpError> {
        for queue in &self.queues {
            debug!("creating queue: {}", queue.name);
            self.channel.declare_queue(queue).await?;
            debug!("queue: {} was created", queue.name);
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            self.channel.bind_queue(binding).await?;
        }

        Ok(())
    }
}

/// Names of the broker objects backing one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerTopology {
    pub exchange: String,
    pub dead_letter_exchange: String,
    pub queue: String,
    pub dead_letter_queue: String,
    pub routing_key: String,
}

impl From<&ConsumerDescriptor> for ConsumerTopology {
    fn from(desc: &ConsumerDescriptor) -> Self {
        let queue = desc.queue_name();

        ConsumerTopology {
            exchange: desc.exchange_name().to_owned(),
            dead_letter_exchange: dlx_name(desc.exchange_name()),
            dead_letter_queue: dlq_name(&queue),
            queue,
            routing_key: binding_key(desc.routing_key()),
        }
    }
}

/// Declares and binds everything `desc` needs, returning the resulting names.
pub async fn provision(
    channel: Arc<dyn AmqpChannel>,
    desc: &ConsumerDescriptor,
) -> Result<ConsumerTopology, AmqpError> {
    desc.validate()?;
    let names = ConsumerTopology::from(desc);

    let queue = QueueDefinition::new(&names.queue)
        .durable()
        .kind(desc.queue_kind());
    let dlq = queue.dead_letter();

    AmqpTopology::new(channel)
        .exchange(ExchangeDefinition::new(&names.exchange).topic().durable())
        .exchange(
            ExchangeDefinition::new(&names.dead_letter_exchange)
                .fanout()
                .durable(),
        )
        .queue(queue)
        .queue(dlq)
        .queue_binding(
            QueueBinding::new(&names.queue)
                .exchange(&names.exchange)
                .routing_key(&names.routing_key),
        )
        .queue_binding(
            QueueBinding::new(&names.dead_letter_queue).exchange(&names.dead_letter_exchange),
        )
        .install()
        .await?;

    Ok(names)
}
