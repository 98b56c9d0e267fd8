// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Job Queue
//!
//! `JobQueue` is the contract the host framework's queue abstraction talks
//! to: push a job, push a raw payload, push a job after a delay, and pop the
//! next job. Every operation resolves the queue topology afresh and declares
//! it on the broker before publishing or fetching.

use crate::{
    broker::{Broker, Route},
    deferred::{Delay, DelayedDelivery},
    errors::QueueError,
    exchange::ExchangeOptions,
    job::{JobData, JobEnvelope, JobHandle},
    publisher::{push_properties, PushOptions},
    queue::QueueOptions,
    topology::TopologyResolver,
};
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A declared queue together with the exchange publishing to it.
#[derive(Debug, Clone)]
pub(crate) struct Destination {
    pub(crate) queue: QueueOptions,
    pub(crate) exchange: ExchangeOptions,
}

impl Destination {
    pub(crate) fn route(&self) -> Route {
        Route::new(&self.exchange.name, &self.queue.name)
    }
}

/// Job queue backed by an AMQP broker.
///
/// Cloning is cheap; clones share the broker channel.
#[derive(Clone)]
pub struct JobQueue {
    broker: Arc<dyn Broker>,
    topology: Arc<TopologyResolver>,
}

impl JobQueue {
    pub fn new(broker: Arc<dyn Broker>, topology: TopologyResolver) -> Self {
        JobQueue {
            broker,
            topology: Arc::new(topology),
        }
    }

    pub fn topology(&self) -> &TopologyResolver {
        &self.topology
    }

    pub(crate) fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Pushes a job for immediate delivery.
    ///
    /// # Returns
    /// `Ok(false)` when the queue's exchange could not be declared, for
    /// instance because the broker holds an exchange of another type under
    /// that name
    pub async fn push(
        &self,
        job: &str,
        data: JobData,
        queue: Option<&str>,
    ) -> Result<bool, QueueError> {
        let payload = JobEnvelope::new(job, data).encode()?;
        self.push_raw(&payload, queue, PushOptions::default()).await
    }

    /// Pushes an already encoded payload for immediate delivery.
    pub async fn push_raw(
        &self,
        payload: &[u8],
        queue: Option<&str>,
        options: PushOptions,
    ) -> Result<bool, QueueError> {
        let Some(destination) = self.declare_destination(queue).await? else {
            return Ok(false);
        };

        let route = destination.route();
        self.broker
            .publish(
                &route.exchange,
                &route.routing_key,
                payload,
                push_properties(&Context::current(), &options),
            )
            .await?;

        debug!(
            exchange = route.exchange,
            queue = route.routing_key,
            "job pushed"
        );

        Ok(true)
    }

    /// Pushes a job that is delivered once `delay` has elapsed.
    pub async fn later(
        &self,
        delay: impl Into<Delay>,
        job: &str,
        data: JobData,
        queue: Option<&str>,
    ) -> Result<bool, QueueError> {
        let deferred = DelayedDelivery::new(self)
            .schedule(delay.into(), job, data, queue)
            .await?;
        Ok(deferred.is_some())
    }

    /// Fetches the next job without waiting.
    ///
    /// Broker failures are logged and reported as an empty queue; the caller
    /// is expected to poll again.
    pub async fn pop(&self, queue: Option<&str>) -> Option<JobHandle> {
        let options = self.resolve_queue(queue);

        if let Err(err) = self.broker.declare_queue(&options.declaration()).await {
            warn!(error = err.to_string(), queue = options.name, "failure to declare queue before pop");
            return None;
        }

        match self.broker.get(&options.name).await {
            Ok(Some(message)) => Some(JobHandle::new(self.clone(), &options.name, message)),
            Ok(None) => None,
            Err(err) => {
                warn!(error = err.to_string(), queue = options.name, "failure to pop job");
                None
            }
        }
    }

    fn resolve_queue(&self, queue: Option<&str>) -> QueueOptions {
        let name = queue
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.topology.default_queue());
        self.topology.resolve_queue(name)
    }

    /// Declares the queue, its exchange and their binding.
    ///
    /// # Returns
    /// `None` when the exchange declaration failed
    pub(crate) async fn declare_destination(
        &self,
        queue: Option<&str>,
    ) -> Result<Option<Destination>, QueueError> {
        let queue = self.resolve_queue(queue);
        self.broker.declare_queue(&queue.declaration()).await?;

        let exchange = self.topology.exchange_for_queue(&queue);
        if !exchange.is_default() {
            if let Err(err) = self.broker.declare_exchange(&exchange.declaration()).await {
                error!(
                    error = err.to_string(),
                    exchange = exchange.name,
                    kind = exchange.kind.to_string(),
                    "failure to declare the exchange"
                );
                return Ok(None);
            }

            self.broker
                .bind_queue(&queue.name, &exchange.name, &queue.name)
                .await?;
        }

        Ok(Some(Destination { queue, exchange }))
    }
}
