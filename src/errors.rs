// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! `AmqpError` represents every failure the engine itself can hit while talking
//! to the broker: connecting, opening channels, declaring topology, publishing,
//! acknowledging and decoding. `HandlerError` is what consumer handlers return;
//! it never escapes the engine, it is routed through the retry path instead.

use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Invalid or missing broker configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error subscribing a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Consumer descriptor without exchange or queue name
    #[error("invalid consumer `{0}`")]
    InvalidConsumer(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing or parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error republishing a message for retry
    #[error("failure to requeuing message")]
    RequeuingMessageError,

    /// Error publishing a message to the dead-letter exchange
    #[error("failure to publish to dlq")]
    PublishingToDQLError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error while receiving from a consumer stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl From<config::ConfigError> for AmqpError {
    fn from(err: config::ConfigError) -> Self {
        AmqpError::ConfigError(err.to_string())
    }
}

/// Failure reported by a consumer handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("handler failure: {0}")]
    Failure(String),

    #[error("handler timed out after {0:?}")]
    Timeout(Duration),
}

impl HandlerError {
    pub fn failure(msg: impl Into<String>) -> Self {
        HandlerError::Failure(msg.into())
    }
}
