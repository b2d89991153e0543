// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! The registry of consumers. Each registered consumer is bound to its own
//! `ConsumerRuntime`, so a slow, failing or disconnected consumer never
//! affects the others. Consumers with no exchange or queue name are skipped
//! with a warning instead of failing startup.

use crate::{
    channel::ChannelFactory,
    descriptor::ConsumerDescriptor,
    errors::AmqpError,
    handler::{ConsumerRegistration, HandlerFactory},
    runtime::{BackoffPolicy, ConsumerHandle, ConsumerRuntime},
    settings::QosPolicy,
};
use futures_util::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Registry of consumers sharing one broker connection.
pub struct RabbitMQDispatcher {
    connection: Arc<dyn ChannelFactory>,
    qos: QosPolicy,
    backoff: BackoffPolicy,
    pub(crate) registrations: Vec<Arc<ConsumerRegistration>>,
}

impl RabbitMQDispatcher {
    /// Creates an empty dispatcher.
    ///
    /// # Parameters
    /// * `connection` - Channel source shared by every consumer
    /// * `qos` - Prefetch policy applied to every consumer
    ///
    /// # Returns
    /// A dispatcher with the default reconnect backoff
    pub fn new(connection: Arc<dyn ChannelFactory>, qos: QosPolicy) -> Self {
        RabbitMQDispatcher {
            connection,
            qos,
            backoff: BackoffPolicy::default(),
            registrations: vec![],
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Registers a consumer.
    ///
    /// # Parameters
    /// * `name` - Consumer identity, used in logs, spans and as consumer tag
    /// * `descriptor` - Exchange, queue and retry settings
    /// * `factory` - Builds one handler per delivery
    ///
    /// # Returns
    /// Self for method chaining
    pub fn register(
        mut self,
        name: &str,
        descriptor: ConsumerDescriptor,
        factory: Arc<dyn HandlerFactory>,
    ) -> Self {
        self.registrations.push(Arc::new(ConsumerRegistration::new(
            name, descriptor, factory,
        )));
        self
    }

    /// Spawns one runtime per valid consumer.
    pub fn start(&self, shutdown: &CancellationToken) -> Vec<ConsumerHandle> {
        let mut handles = vec![];

        for registration in &self.registrations {
            if let Err(err) = registration.descriptor.validate() {
                warn!(
                    consumer = registration.name,
                    exchange = registration.descriptor.exchange_name(),
                    queue = registration.descriptor.queue_name(),
                    error = err.to_string(),
                    "skipping consumer without exchange or queue"
                );
                continue;
            }

            let runtime = ConsumerRuntime::new(
                registration.clone(),
                self.connection.clone(),
                self.qos,
                shutdown.clone(),
            )
            .with_backoff(self.backoff);

            handles.push(runtime.spawn());
        }

        info!(consumers = handles.len(), "consumers started");
        handles
    }

    /// Starts every consumer and waits until all of them stopped.
    pub async fn consume_blocking(&self, shutdown: &CancellationToken) -> Result<(), AmqpError> {
        let handles = self.start(shutdown);

        let mut result = Ok(());
        for res in join_all(handles.into_iter().map(|h| h.join())).await {
            if let Err(err) = res {
                error!(error = err.to_string(), "tokio process error");
                result = Err(err);
            }
        }

        result
    }
}
