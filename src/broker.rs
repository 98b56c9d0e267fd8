// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Capabilities
//!
//! The `Broker` trait is the set of broker round trips the job queue relies
//! on. `AmqpBroker` implements it over a lapin channel and `MemoryBroker`
//! implements it in-process for tests.

use crate::{errors::QueueError, exchange::ExchangeDeclaration, queue::QueueDeclaration};
use async_trait::async_trait;
use lapin::BasicProperties;

#[cfg(test)]
use mockall::automock;

/// A message fetched from a queue and not yet acknowledged or rejected.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

/// Where a message is published: an exchange and a routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub exchange: String,
    pub routing_key: String,
}

impl Route {
    pub fn new(exchange: &str, routing_key: &str) -> Self {
        Route {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }
}

/// Broker operations used by the job queue.
///
/// Every method is one round trip. Declarations are idempotent: declaring
/// an entity again with identical options succeeds, while declaring it with
/// conflicting options fails with [`QueueError::TopologyConflictError`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDeclaration) -> Result<(), QueueError>;

    async fn declare_queue(&self, def: &QueueDeclaration) -> Result<(), QueueError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), QueueError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), QueueError>;

    /// Fetches at most one message without waiting for one to arrive.
    async fn get(&self, queue: &str) -> Result<Option<ReceivedMessage>, QueueError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), QueueError>;

    /// Rejects a delivery without requeueing it.
    ///
    /// Callers treat this as best effort: when it fails the channel is gone,
    /// and the broker redelivers the unacknowledged message by itself.
    async fn reject(&self, delivery_tag: u64) -> Result<(), QueueError>;
}
