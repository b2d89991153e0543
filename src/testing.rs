// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker and recording handlers used by the unit tests.

use crate::{
    channel::{AmqpChannel, ChannelFactory, DeliveryStream, InboundDelivery},
    envelope::Envelope,
    errors::{AmqpError, HandlerError},
    exchange::{ExchangeDefinition, ExchangeKind},
    handler::{ConsumerHandler, HandlerFactory, MessageContext},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{types::AMQPValue, BasicProperties};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};

#[derive(Debug, Clone)]
pub(crate) struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
}

#[derive(Debug, Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    data: Vec<u8>,
    properties: BasicProperties,
}

type Subscriber = mpsc::UnboundedSender<Result<InboundDelivery, AmqpError>>;

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueDefinition>,
    bindings: HashSet<QueueBinding>,
    messages: HashMap<String, VecDeque<Stored>>,
    subscribers: HashMap<String, Subscriber>,
    published: Vec<Published>,
    acks: Vec<u64>,
    qos: Vec<u16>,
    next_tag: u64,
    failing_opens: usize,
    open_attempts: Vec<Instant>,
}

impl BrokerState {
    fn dispatch(&mut self, queue: &str) {
        let Some(subscriber) = self.subscribers.get(queue) else {
            return;
        };
        let Some(pending) = self.messages.get_mut(queue) else {
            return;
        };

        while let Some(msg) = pending.pop_front() {
            self.next_tag += 1;
            let delivery = InboundDelivery {
                delivery_tag: self.next_tag,
                exchange: msg.exchange.clone(),
                routing_key: msg.routing_key.clone(),
                redelivered: false,
                properties: msg.properties.clone(),
                data: msg.data.clone(),
            };

            if subscriber.send(Ok(delivery)).is_err() {
                pending.push_front(msg);
                self.subscribers.remove(queue);
                return;
            }
        }
    }

    fn targets(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }

        let Some(def) = self.exchanges.get(exchange) else {
            return Err(AmqpError::PublishingError);
        };

        Ok(self
            .bindings
            .iter()
            .filter(|b| b.exchange_name == exchange)
            .filter(|b| {
                def.kind == ExchangeKind::Fanout || topic_matches(&b.routing_key, routing_key)
            })
            .map(|b| b.queue_name.clone())
            .collect())
    }
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

/// A single-node broker living in memory.
#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub fn new() -> FakeBroker {
        FakeBroker::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut BrokerState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// The next `n` channel opens fail as if the broker were unreachable.
    pub fn fail_next_opens(&self, n: usize) {
        self.with(|s| s.failing_opens = n);
    }

    pub fn open_attempts(&self) -> Vec<Instant> {
        self.with(|s| s.open_attempts.clone())
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeDefinition> {
        self.with(|s| s.exchanges.get(name).cloned())
    }

    pub fn queue(&self, name: &str) -> Option<QueueDefinition> {
        self.with(|s| s.queues.get(name).cloned())
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.with(|s| s.queues.keys().cloned().collect())
    }

    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.with(|s| s.bindings.iter().cloned().collect())
    }

    /// Messages sitting in `queue` that no consumer has received yet.
    pub fn pending(&self, queue: &str) -> Vec<(Vec<u8>, BasicProperties)> {
        self.with(|s| {
            s.messages
                .get(queue)
                .map(|q| q.iter().map(|m| (m.data.clone(), m.properties.clone())).collect())
                .unwrap_or_default()
        })
    }

    pub fn published(&self) -> Vec<Published> {
        self.with(|s| s.published.clone())
    }

    pub fn acks(&self) -> Vec<u64> {
        self.with(|s| s.acks.clone())
    }

    pub fn qos(&self) -> Vec<u16> {
        self.with(|s| s.qos.clone())
    }

    /// Closes the subscription on `queue` the way a broker-side channel close would.
    pub fn close_subscriber(&self, queue: &str) {
        self.with(|s| {
            if let Some(subscriber) = s.subscribers.remove(queue) {
                let _ = subscriber.send(Err(AmqpError::ConsumerError(
                    "channel closed by broker".to_owned(),
                )));
            }
        });
    }

    /// Publishes straight into the broker, bypassing any channel.
    pub fn inject(&self, exchange: &str, routing_key: &str, data: &[u8]) {
        self.with(|s| {
            for queue in s.targets(exchange, routing_key).unwrap_or_default() {
                s.messages.entry(queue.clone()).or_default().push_back(Stored {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    data: data.to_vec(),
                    properties: BasicProperties::default(),
                });
                s.dispatch(&queue);
            }
        });
    }
}

#[async_trait]
impl ChannelFactory for FakeBroker {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        self.with(|s| {
            s.open_attempts.push(Instant::now());
            if s.failing_opens > 0 {
                s.failing_opens -= 1;
                return Err(AmqpError::ConnectionError);
            }
            Ok(())
        })?;

        Ok(Arc::new(FakeChannel {
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

pub(crate) struct FakeChannel {
    broker: FakeBroker,
    closed: AtomicBool,
}

impl FakeChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError);
        }
        Ok(())
    }
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.with(|s| match s.exchanges.get(&def.name) {
            Some(existing) if existing != def => {
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                s.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.with(|s| match s.queues.get(&def.name) {
            Some(existing) if existing != def => {
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                s.queues.insert(def.name.clone(), def.clone());
                Ok(())
            }
        })
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.with(|s| {
            if !s.queues.contains_key(&binding.queue_name)
                || !s.exchanges.contains_key(&binding.exchange_name)
            {
                return Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ));
            }
            s.bindings.insert(binding.clone());
            Ok(())
        })
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.with(|s| s.qos.push(prefetch_count));
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();

        self.broker.with(|s| {
            if !s.queues.contains_key(queue) {
                return Err(AmqpError::BindingConsumerError(queue.to_owned()));
            }
            s.subscribers.insert(queue.to_owned(), tx);
            s.dispatch(queue);
            Ok(())
        })?;

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
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
        self.ensure_open()?;
        self.broker.with(|s| {
            let targets = s.targets(exchange, routing_key)?;
            s.published.push(Published {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                data: payload.to_vec(),
                properties: properties.clone(),
            });

            for queue in targets {
                s.messages.entry(queue.clone()).or_default().push_back(Stored {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    data: payload.to_vec(),
                    properties: properties.clone(),
                });
                s.dispatch(&queue);
            }
            Ok(())
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.with(|s| s.acks.push(delivery_tag));
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) fn delivery_of(delivery_tag: u64, data: Vec<u8>) -> InboundDelivery {
    InboundDelivery {
        delivery_tag,
        exchange: "orders-exchange".to_owned(),
        routing_key: String::new(),
        redelivered: false,
        properties: BasicProperties::default(),
        data,
    }
}

pub(crate) fn header(props: &BasicProperties, key: &str) -> Option<String> {
    match props.headers().as_ref()?.inner().get(key)? {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).to_string()),
        _ => None,
    }
}

/// Polls `check` until it holds or `limit` elapses.
pub(crate) async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    Succeed,
    Fail,
    Sleep(Duration),
    Panic,
    UntilCancelled,
}

/// Builds recording handlers and keeps track of what they saw.
#[derive(Clone)]
pub(crate) struct Recorder {
    behavior: Behavior,
    calls: Arc<AtomicUsize>,
    created: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    contexts: Arc<Mutex<Vec<MessageContext>>>,
    events: Arc<Mutex<Vec<Envelope>>>,
}

impl Recorder {
    pub fn new(behavior: Behavior) -> Recorder {
        Recorder {
            behavior,
            calls: Arc::default(),
            created: Arc::default(),
            live: Arc::default(),
            contexts: Arc::default(),
            events: Arc::default(),
        }
    }

    pub fn factory(&self) -> Arc<dyn HandlerFactory> {
        let recorder = self.clone();
        Arc::new(move || -> Box<dyn ConsumerHandler> {
            recorder.created.fetch_add(1, Ordering::SeqCst);
            recorder.live.fetch_add(1, Ordering::SeqCst);
            Box::new(RecordingHandler {
                recorder: recorder.clone(),
            })
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Handlers built but not yet dropped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn contexts(&self) -> Vec<MessageContext> {
        self.contexts.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<Envelope> {
        self.events.lock().unwrap().clone()
    }
}

struct RecordingHandler {
    recorder: Recorder,
}

impl Drop for RecordingHandler {
    fn drop(&mut self) {
        self.recorder.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConsumerHandler for RecordingHandler {
    async fn exec(&self, ctx: &MessageContext, event: &Envelope) -> Result<(), HandlerError> {
        self.recorder.calls.fetch_add(1, Ordering::SeqCst);
        self.recorder.contexts.lock().unwrap().push(ctx.clone());
        self.recorder.events.lock().unwrap().push(event.clone());

        match &self.recorder.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail => Err(HandlerError::failure("boom")),
            Behavior::Sleep(d) => {
                tokio::time::sleep(*d).await;
                Ok(())
            }
            Behavior::Panic => panic!("boom"),
            Behavior::UntilCancelled => {
                ctx.cancellation.cancelled().await;
                Err(HandlerError::failure("cancelled"))
            }
        }
    }
}

#[test]
fn topic_patterns_follow_amqp_rules() {
    assert!(topic_matches("", ""));
    assert!(!topic_matches("", "order.created"));
    assert!(topic_matches("#", ""));
    assert!(topic_matches("order.*", "order.created"));
    assert!(!topic_matches("order.*", "order.created.eu"));
    assert!(topic_matches("order.#", "order.created.eu"));
    assert!(topic_matches("#", "anything.at.all"));
}
