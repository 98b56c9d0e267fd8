// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! `MemoryBroker` implements [`Broker`] inside the process so the job queue
//! can be exercised without RabbitMQ. It keeps the parts of the AMQP model
//! the job queue depends on:
//! - the default exchange and declared direct, topic, headers and fanout
//!   exchanges (everything but fanout routes on the exact routing key)
//! - conflicting redeclarations fail like a 406 PRECONDITION_FAILED
//! - per-message expiration and `x-dead-letter-*` arguments
//! - `x-expires`, deleting queues left unused for too long
//!
//! Time only moves when [`MemoryBroker::elapse`] is called, which makes
//! delayed delivery deterministic in tests.

use crate::{
    broker::{Broker, ReceivedMessage, Route},
    errors::QueueError,
    exchange::{ExchangeDeclaration, ExchangeKind},
    queue::QueueDeclaration,
    topology::{AMQP_ARGS_DEAD_LETTER_EXCHANGE, AMQP_ARGS_DEAD_LETTER_ROUTING_KEY, AMQP_ARGS_EXPIRES},
};
use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, FieldTable},
    BasicProperties,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    data: Vec<u8>,
    remaining_millis: Option<i64>,
    redelivered: bool,
}

#[derive(Debug)]
struct MemoryQueue {
    declaration: QueueDeclaration,
    messages: VecDeque<StoredMessage>,
    idle_millis: i64,
}

impl MemoryQueue {
    fn expires_millis(&self) -> Option<i64> {
        self.declaration
            .arguments
            .inner()
            .get(AMQP_ARGS_EXPIRES)
            .and_then(integer)
    }

    /// Where rejected and expired messages of this queue go.
    fn dead_letter_route(&self, original_key: &str) -> Option<Route> {
        let args = self.declaration.arguments.inner();
        let exchange = args.get(AMQP_ARGS_DEAD_LETTER_EXCHANGE).and_then(string)?;
        let routing_key = args
            .get(AMQP_ARGS_DEAD_LETTER_ROUTING_KEY)
            .and_then(string)
            .unwrap_or_else(|| original_key.to_owned());

        Some(Route::new(&exchange, &routing_key))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashMap<String, ExchangeDeclaration>,
    bindings: Vec<Binding>,
    queues: HashMap<String, MemoryQueue>,
    unacked: HashMap<u64, (String, StoredMessage)>,
    next_tag: u64,
}

impl State {
    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return match self.queues.contains_key(routing_key) {
                true => vec![routing_key.to_owned()],
                false => vec![],
            };
        }

        let fanout = matches!(
            self.exchanges.get(exchange).map(|def| def.kind),
            Some(ExchangeKind::Fanout)
        );

        let mut queues = vec![];
        for binding in &self.bindings {
            if binding.exchange == exchange
                && (fanout || binding.routing_key == routing_key)
                && !queues.contains(&binding.queue)
            {
                queues.push(binding.queue.clone());
            }
        }
        queues
    }

    fn deliver(&mut self, exchange: &str, routing_key: &str, message: StoredMessage) -> usize {
        let targets = self.route(exchange, routing_key);
        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.messages.push_back(message.clone());
            }
        }
        targets.len()
    }

    /// Dead-letters `message` out of `queue`; dropped when the queue has no
    /// dead letter exchange.
    fn dead_letter(&mut self, queue: &str, mut message: StoredMessage) {
        let Some(route) = self
            .queues
            .get(queue)
            .and_then(|q| q.dead_letter_route(&message.routing_key))
        else {
            debug!(queue, "dropping message without dead letter exchange");
            return;
        };

        message.exchange = route.exchange.clone();
        message.routing_key = route.routing_key.clone();
        message.remaining_millis = None;

        let delivered = self.deliver(&route.exchange, &route.routing_key, message);
        debug!(
            queue,
            exchange = route.exchange,
            routing_key = route.routing_key,
            delivered,
            "message dead-lettered"
        );
    }
}

/// Broker living in process memory.
///
/// Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker::default()
    }

    /// Moves the broker clock forward.
    ///
    /// Messages whose expiration has passed are dead-lettered, then queues
    /// left unused for longer than their `x-expires` are deleted.
    pub async fn elapse(&self, duration: Duration) {
        let elapsed = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        let mut state = self.state.lock().await;

        let mut expired = vec![];
        for (name, queue) in state.queues.iter_mut() {
            queue.idle_millis = queue.idle_millis.saturating_add(elapsed);

            let mut kept = VecDeque::with_capacity(queue.messages.len());
            for mut message in queue.messages.drain(..) {
                match message.remaining_millis {
                    Some(remaining) if remaining <= elapsed => expired.push((name.clone(), message)),
                    Some(remaining) => {
                        message.remaining_millis = Some(remaining - elapsed);
                        kept.push_back(message);
                    }
                    None => kept.push_back(message),
                }
            }
            queue.messages = kept;
        }

        for (queue, message) in expired {
            state.dead_letter(&queue, message);
        }

        state.queues.retain(|name, queue| match queue.expires_millis() {
            Some(expires) if queue.idle_millis >= expires => {
                debug!(queue = name, "queue expired");
                false
            }
            _ => true,
        });
    }

    /// Number of ready messages in `queue`.
    pub async fn message_count(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state.queues.get(queue).map_or(0, |q| q.messages.len())
    }

    /// Number of fetched messages not yet acknowledged or rejected.
    pub async fn unacked_count(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    pub async fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().await.queues.contains_key(queue)
    }

    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().await.queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn queue_arguments(&self, queue: &str) -> Option<FieldTable> {
        let state = self.state.lock().await;
        state.queues.get(queue).map(|q| q.declaration.arguments.clone())
    }

    pub async fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        let state = self.state.lock().await;
        state.exchanges.get(exchange).map(|def| def.kind)
    }
}

fn string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok().map(str::to_owned),
        AMQPValue::ShortString(s) => Some(s.as_str().to_owned()),
        _ => None,
    }
}

fn integer(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        _ => None,
    }
}

fn same_queue(a: &QueueDeclaration, b: &QueueDeclaration) -> bool {
    a.options.durable == b.options.durable
        && a.options.exclusive == b.options.exclusive
        && a.options.auto_delete == b.options.auto_delete
        && a.arguments.inner() == b.arguments.inner()
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, def: &ExchangeDeclaration) -> Result<(), QueueError> {
        if def.name.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        match state.exchanges.get(&def.name) {
            Some(existing)
                if !def.options.passive
                    && (existing.kind != def.kind
                        || existing.options.durable != def.options.durable) =>
            {
                Err(QueueError::TopologyConflictError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None if def.options.passive => Err(QueueError::DeclareExchangeError(def.name.clone())),
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDeclaration) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        match state.queues.get_mut(&def.name) {
            Some(existing) if !def.options.passive && !same_queue(&existing.declaration, def) => {
                Err(QueueError::TopologyConflictError(def.name.clone()))
            }
            Some(existing) => {
                existing.idle_millis = 0;
                Ok(())
            }
            None if def.options.passive => Err(QueueError::DeclareQueueError(def.name.clone())),
            None => {
                state.queues.insert(
                    def.name.clone(),
                    MemoryQueue {
                        declaration: def.clone(),
                        messages: VecDeque::new(),
                        idle_millis: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if !state.exchanges.contains_key(exchange) || !state.queues.contains_key(queue) {
            return Err(QueueError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }

        let binding = Binding {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            routing_key: routing_key.to_owned(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            return Err(QueueError::PublishingError(routing_key.to_owned()));
        }

        let remaining_millis = properties
            .expiration()
            .as_ref()
            .and_then(|expiration| expiration.as_str().parse::<i64>().ok());

        let message = StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            data: payload.to_vec(),
            remaining_millis,
            redelivered: false,
        };

        let delivered = state.deliver(exchange, routing_key, message);
        if delivered == 0 {
            debug!(exchange, routing_key, "message unroutable, dropped");
        }
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<ReceivedMessage>, QueueError> {
        let mut state = self.state.lock().await;
        let Some(memory_queue) = state.queues.get_mut(queue) else {
            return Err(QueueError::ConsumerError(queue.to_owned()));
        };

        memory_queue.idle_millis = 0;
        let Some(message) = memory_queue.messages.pop_front() else {
            return Ok(None);
        };

        state.next_tag += 1;
        let delivery_tag = state.next_tag;
        let received = ReceivedMessage {
            delivery_tag,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            properties: message.properties.clone(),
            data: message.data.clone(),
        };
        state.unacked.insert(delivery_tag, (queue.to_owned(), message));

        Ok(Some(received))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        match state.unacked.remove(&delivery_tag) {
            Some(_) => Ok(()),
            None => Err(QueueError::AckMessageError),
        }
    }

    async fn reject(&self, delivery_tag: u64) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        match state.unacked.remove(&delivery_tag) {
            Some((queue, message)) => {
                state.dead_letter(&queue, message);
                Ok(())
            }
            None => Err(QueueError::RejectMessageError),
        }
    }
}
