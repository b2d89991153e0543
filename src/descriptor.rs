// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Descriptor
//!
//! Declares, once per consumer, where it reads from and how failures are
//! budgeted. Descriptors are immutable once registered.

use crate::{errors::AmqpError, queue::QueueKind};
use std::time::Duration;

pub const DEFAULT_MAX_RETRY: u32 = 5;
pub const DEFAULT_PREFETCH_COUNT: u16 = 3;

const EXCHANGE_SUFFIXES: [&str; 2] = ["-exchange", ".exchange"];
const QUEUE_SUFFIX: &str = "-queue";

/// Where a consumer reads from and how its failures are budgeted.
///
/// Built with `new` and the `with_*` setters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerDescriptor {
    pub(crate) exchange_name: String,
    pub(crate) queue_name: Option<String>,
    pub(crate) routing_key: String,
    pub(crate) max_retry: u32,
    pub(crate) prefetch_count: u16,
    pub(crate) queue_kind: QueueKind,
    pub(crate) handler_timeout: Option<Duration>,
}

impl ConsumerDescriptor {
    /// Creates a descriptor reading from `exchange` with every other value defaulted.
    pub fn new(exchange: &str) -> ConsumerDescriptor {
        ConsumerDescriptor {
            exchange_name: exchange.to_owned(),
            queue_name: None,
            routing_key: String::new(),
            max_retry: DEFAULT_MAX_RETRY,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            queue_kind: QueueKind::Classic,
            handler_timeout: None,
        }
    }

    /// Overrides the queue name derived from the exchange.
    pub fn with_queue(mut self, name: &str) -> Self {
        self.queue_name = Some(name.to_owned());
        self
    }

    /// Sets the topic pattern the queue is bound with.
    ///
    /// # Parameters
    /// * `key` - A topic pattern such as `order.*`; empty matches every key
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Sets how many times a failed message is requeued before it is dead-lettered.
    ///
    /// # Parameters
    /// * `max` - Retry budget; 0 dead-letters on the first failure
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_max_retry(mut self, max: u32) -> Self {
        self.max_retry = max;
        self
    }

    /// Sets the maximum number of unacknowledged deliveries for this consumer.
    ///
    /// # Parameters
    /// * `count` - Prefetch limit; 0 means unlimited
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    /// Declares the queue and its dead-letter queue as quorum queues.
    pub fn with_quorum(mut self) -> Self {
        self.queue_kind = QueueKind::Quorum;
        self
    }

    /// Handler invocations running longer than `timeout` count as failures.
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    /// The configured queue name, or one derived from the exchange name:
    /// a trailing `-exchange`/`.exchange` is stripped and `-queue` appended.
    pub fn queue_name(&self) -> String {
        if let Some(name) = &self.queue_name {
            return name.clone();
        }

        if self.exchange_name.is_empty() {
            return String::new();
        }

        let base = EXCHANGE_SUFFIXES
            .iter()
            .find_map(|suffix| self.exchange_name.strip_suffix(suffix))
            .unwrap_or(self.exchange_name.as_str());

        format!("{}{}", base, QUEUE_SUFFIX)
    }

    /// The routing key as configured. Empty is bound as `#`.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch_count
    }

    pub fn queue_kind(&self) -> QueueKind {
        self.queue_kind
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout
    }

    /// Consumers without exchange or queue name are never registered.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.exchange_name.trim().is_empty() {
            return Err(AmqpError::InvalidConsumer(
                "exchange name is empty".to_owned(),
            ));
        }

        if self.queue_name().trim().is_empty() {
            return Err(AmqpError::InvalidConsumer("queue name is empty".to_owned()));
        }

        Ok(())
    }
}
