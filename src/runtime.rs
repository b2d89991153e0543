// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Runtime
//!
//! One supervised task per registered consumer. The task owns its channel
//! exclusively and moves through:
//!
//! ```text
//! Unregistered → TopologyReady → Consuming → (Failed → Backoff → TopologyReady)
//!                                           | Stopped
//! ```
//!
//! A channel that closes underneath a consumer is recovered by provisioning
//! the topology again on a fresh channel, waiting an exponentially growing
//! delay between attempts. Up to `prefetch` deliveries are processed
//! concurrently; shutdown stops new work and lets in-flight handlers finish.

use crate::{
    channel::{AmqpChannel, ChannelFactory, DeliveryStream},
    consumer::consume,
    errors::AmqpError,
    handler::ConsumerRegistration,
    settings::QosPolicy,
    topology::{self, ConsumerTopology},
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{watch, Semaphore},
    task::{JoinError, JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Unregistered,
    TopologyReady,
    Consuming,
    Failed,
    Backoff,
    Stopped,
}

/// Exponential reconnect delay: starts at `initial`, doubles up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial: INITIAL_BACKOFF,
            max: MAX_BACKOFF,
        }
    }
}

impl BackoffPolicy {
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            next: self.initial,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    next: Duration,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.policy.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.policy.initial;
    }
}

enum Stop {
    Shutdown,
    ChannelClosed(String),
}

pub struct ConsumerRuntime {
    registration: Arc<ConsumerRegistration>,
    connection: Arc<dyn ChannelFactory>,
    qos: QosPolicy,
    backoff: BackoffPolicy,
    shutdown: CancellationToken,
    state: watch::Sender<ConsumerState>,
}

/// Handle to a spawned consumer runtime.
pub struct ConsumerHandle {
    name: String,
    state: watch::Receiver<ConsumerState>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.state.clone()
    }

    /// Waits for the runtime task to stop.
    pub async fn join(self) -> Result<(), AmqpError> {
        self.task.await.map_err(|err| {
            error!(consumer = self.name, error = err.to_string(), "consumer task failure");
            AmqpError::InternalError
        })
    }
}

impl ConsumerRuntime {
    /// Creates the runtime of one consumer, in the `Unregistered` state.
    ///
    /// # Parameters
    /// * `registration` - The consumer's name, descriptor and handler factory
    /// * `connection` - Source of the channel the runtime owns
    /// * `qos` - Prefetch policy; with the global flag set it overrides the descriptor
    /// * `shutdown` - Process-wide cancellation; stops registration and consumption
    pub fn new(
        registration: Arc<ConsumerRegistration>,
        connection: Arc<dyn ChannelFactory>,
        qos: QosPolicy,
        shutdown: CancellationToken,
    ) -> ConsumerRuntime {
        let (state, _) = watch::channel(ConsumerState::Unregistered);

        ConsumerRuntime {
            registration,
            connection,
            qos,
            backoff: BackoffPolicy::default(),
            shutdown,
            state,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Spawns the supervised consumer task.
    ///
    /// # Returns
    /// A handle to observe the consumer state and await its termination
    pub fn spawn(self) -> ConsumerHandle {
        let name = self.registration.name.clone();
        let state = self.state.subscribe();
        let task = tokio::spawn(self.run());

        ConsumerHandle { name, state, task }
    }

    fn set_state(&self, state: ConsumerState) {
        debug!(consumer = self.registration.name, ?state, "consumer state");
        self.state.send_replace(state);
    }

    async fn run(self) {
        let mut backoff = self.backoff.start();

        loop {
            if self.shutdown.is_cancelled() {
                info!(
                    consumer = self.registration.name,
                    "consumer registration cancelled by shutdown"
                );
                break;
            }

            match self.register().await {
                Ok((channel, topology, deliveries)) => {
                    backoff.reset();
                    self.set_state(ConsumerState::Consuming);

                    match self.drain(channel.clone(), &topology, deliveries).await {
                        Stop::Shutdown => {
                            let _ = channel.close().await;
                            break;
                        }
                        Stop::ChannelClosed(reason) => {
                            warn!(
                                consumer = self.registration.name,
                                queue = topology.queue,
                                exchange = topology.exchange,
                                routing_key = topology.routing_key,
                                reason,
                                "consumer channel was closed"
                            );
                            let _ = channel.close().await;
                        }
                    }
                }
                Err(err) => {
                    let desc = &self.registration.descriptor;
                    error!(
                        consumer = self.registration.name,
                        queue = desc.queue_name(),
                        exchange = desc.exchange_name(),
                        routing_key = desc.routing_key(),
                        error = err.to_string(),
                        "failure to register consumer"
                    );
                }
            }

            self.set_state(ConsumerState::Failed);

            let delay = backoff.next_delay();
            self.set_state(ConsumerState::Backoff);
            info!(
                consumer = self.registration.name,
                delay_secs = delay.as_secs(),
                "recreating consumer after delay"
            );

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConsumerState::Stopped);
    }

    fn prefetch(&self) -> u16 {
        self.qos
            .effective_prefetch(self.registration.descriptor.prefetch_count())
    }

    /// Opens a channel, provisions topology, applies QoS and subscribes.
    async fn register(
        &self,
    ) -> Result<(Arc<dyn AmqpChannel>, ConsumerTopology, DeliveryStream), AmqpError> {
        let channel = self.connection.open_channel().await?;

        let topology = match topology::provision(channel.clone(), &self.registration.descriptor)
            .await
        {
            Ok(topology) => topology,
            Err(err) => {
                let _ = channel.close().await;
                return Err(err);
            }
        };

        let subscribed = async {
            channel.qos(self.prefetch()).await?;
            self.set_state(ConsumerState::TopologyReady);
            channel.consume(&topology.queue, &self.registration.name).await
        }
        .await;

        match subscribed {
            Ok(deliveries) => {
                info!(
                    consumer = self.registration.name,
                    queue = topology.queue,
                    exchange = topology.exchange,
                    routing_key = topology.routing_key,
                    prefetch = self.prefetch(),
                    "consumer registered"
                );
                Ok((channel, topology, deliveries))
            }
            Err(err) => {
                let _ = channel.close().await;
                Err(err)
            }
        }
    }

    async fn drain(
        &self,
        channel: Arc<dyn AmqpChannel>,
        topology: &ConsumerTopology,
        mut deliveries: DeliveryStream,
    ) -> Stop {
        let limit = match self.prefetch() {
            0 => Semaphore::MAX_PERMITS,
            n => usize::from(n),
        };
        let permits = Arc::new(Semaphore::new(limit));
        let topology = Arc::new(topology.clone());
        let mut in_flight = JoinSet::new();

        let stop = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break Stop::Shutdown,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    self.log_join(joined);
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        let Ok(permit) = permits.clone().acquire_owned().await else {
                            break Stop::ChannelClosed("delivery permits closed".to_owned());
                        };

                        let channel = channel.clone();
                        let registration = self.registration.clone();
                        let topology = topology.clone();
                        let shutdown = self.shutdown.clone();

                        in_flight.spawn(async move {
                            let tracer = global::tracer("amqp consumer");
                            let res = consume(
                                &tracer,
                                channel,
                                &registration,
                                &topology,
                                delivery,
                                shutdown,
                            )
                            .await;

                            if let Err(err) = res {
                                error!(
                                    consumer = registration.name,
                                    queue = topology.queue,
                                    error = err.to_string(),
                                    "error consume msg"
                                );
                            }
                            drop(permit);
                        });
                    }
                    Some(Err(err)) => break Stop::ChannelClosed(err.to_string()),
                    None => break Stop::ChannelClosed("delivery stream ended".to_owned()),
                },
            }
        };

        while let Some(joined) = in_flight.join_next().await {
            self.log_join(joined);
        }

        stop
    }

    fn log_join(&self, joined: Result<(), JoinError>) {
        if let Err(err) = joined {
            error!(
                consumer = self.registration.name,
                error = err.to_string(),
                "delivery task failure"
            );
        }
    }
}
