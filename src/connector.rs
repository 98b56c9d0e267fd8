// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connector
//!
//! Entry point turning a [`QueueConfig`] into a ready [`JobQueue`]. Queues
//! built from configurations sharing the same connection parameters share
//! one broker connection.

use crate::{
    channel::LapinConnector,
    config::QueueConfig,
    errors::QueueError,
    job_queue::JobQueue,
    registry::{ConnectionFactory, ConnectionRegistry},
    topology::TopologyResolver,
};
use std::sync::Arc;
use tracing::debug;

pub struct Connector<F: ConnectionFactory = LapinConnector> {
    registry: Arc<ConnectionRegistry<F>>,
}

impl<F: ConnectionFactory> Clone for Connector<F> {
    fn clone(&self) -> Self {
        Connector {
            registry: self.registry.clone(),
        }
    }
}

impl Connector<LapinConnector> {
    /// Connector opening lapin connections named after
    /// `QueueConfig::connection_name`.
    pub fn lapin(config: &QueueConfig) -> Self {
        let factory = match &config.connection_name {
            Some(name) => LapinConnector::new().with_connection_name(name),
            None => LapinConnector::new(),
        };
        Connector::new(factory)
    }
}

impl<F: ConnectionFactory> Connector<F> {
    pub fn new(factory: F) -> Self {
        Connector {
            registry: Arc::new(ConnectionRegistry::new(factory)),
        }
    }

    /// Connector drawing its connections from an existing registry.
    pub fn with_registry(registry: Arc<ConnectionRegistry<F>>) -> Self {
        Connector { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry<F>> {
        &self.registry
    }

    /// Builds a job queue for `config`, reusing the connection of any
    /// earlier queue with the same connection parameters.
    pub async fn connect(&self, config: &QueueConfig) -> Result<JobQueue, QueueError> {
        let params = &config.connection;
        let connection = self.registry.get_connection(params).await?;
        let broker = self.registry.factory().open_broker(connection, params).await?;

        debug!(
            host = params.host(),
            vhost = params.vhost(),
            queues = config.queues.len(),
            exchanges = config.exchanges.len(),
            "job queue connected"
        );

        Ok(JobQueue::new(broker, TopologyResolver::from_config(config)))
    }

    /// Closes every connection opened through this connector.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
