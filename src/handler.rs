// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! Application code plugs into the engine by implementing `ConsumerHandler`.
//! A `HandlerFactory` builds a fresh handler for every delivery, so anything
//! the handler owns lives exactly as long as one message.

use crate::{descriptor::ConsumerDescriptor, envelope::Envelope, errors::HandlerError};
use async_trait::async_trait;
use opentelemetry::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-delivery scope handed to a handler.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub consumer: String,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub retry_count: u32,
    pub redelivered: bool,
    /// Cancelled when the process is shutting down.
    pub cancellation: CancellationToken,
    /// Trace context extracted from the message headers.
    pub trace: Context,
}

#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &MessageContext, event: &Envelope) -> Result<(), HandlerError>;
}

pub trait HandlerFactory: Send + Sync {
    fn create(&self) -> Box<dyn ConsumerHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn() -> Box<dyn ConsumerHandler> + Send + Sync,
{
    fn create(&self) -> Box<dyn ConsumerHandler> {
        self()
    }
}

/// A named consumer: what it reads, and how to build its handler.
pub struct ConsumerRegistration {
    pub(crate) name: String,
    pub(crate) descriptor: ConsumerDescriptor,
    pub(crate) factory: Arc<dyn HandlerFactory>,
}

impl ConsumerRegistration {
    pub fn new(
        name: &str,
        descriptor: ConsumerDescriptor,
        factory: Arc<dyn HandlerFactory>,
    ) -> ConsumerRegistration {
        ConsumerRegistration {
            name: name.to_owned(),
            descriptor,
            factory,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &ConsumerDescriptor {
        &self.descriptor
    }
}
