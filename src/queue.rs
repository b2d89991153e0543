// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Types describing the queues a consumer owns and how they are bound to
//! exchanges. A queue can be classic or quorum; the dead-letter queue of a
//! consumer always follows the kind of its primary queue.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use std::collections::BTreeMap;

/// Queue argument selecting the queue implementation
pub const AMQP_HEADERS_QUEUE_TYPE: &str = "x-queue-type";
/// Suffix appended to a queue name to obtain its dead-letter queue
pub const DLQ_SUFFIX: &str = "-dlq";

/// Replication flavour of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueKind {
    #[default]
    Classic,
    Quorum,
}

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) kind: QueueKind,
    pub(crate) durable: bool,
}

impl QueueDefinition {
    /// Creates a new classic queue definition with the given name.
    ///
    /// The queue is non-durable until `durable()` is applied. Queues are never
    /// exclusive nor auto-deleted.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            kind: QueueKind::Classic,
            durable: false,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn kind(mut self, kind: QueueKind) -> Self {
        self.kind = kind;
        self
    }

    /// Derives the dead-letter queue for this queue, sharing its durability and kind.
    pub fn dead_letter(&self) -> QueueDefinition {
        QueueDefinition {
            name: dlq_name(&self.name),
            ..self.clone()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_kind(&self) -> QueueKind {
        self.kind
    }

    /// Declaration arguments; quorum queues select their implementation here.
    pub fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        if self.kind == QueueKind::Quorum {
            args.insert(
                ShortString::from(AMQP_HEADERS_QUEUE_TYPE),
                AMQPValue::LongString(LongString::from("quorum")),
            );
        }

        FieldTable::from(args)
    }
}

/// Dead-letter queue name for a queue: `Q` ⇒ `Q-dlq`.
pub fn dlq_name(queue: &str) -> String {
    format!("{}{}", queue, DLQ_SUFFIX)
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
