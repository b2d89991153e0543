// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;
#[cfg(test)]
mod testing;

pub mod channel;
pub mod descriptor;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod settings;
pub mod topology;

pub use consumer::DeliveryOutcome;
