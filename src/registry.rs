// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Registry
//!
//! Broker connections are expensive, so every distinct set of connection
//! parameters maps to exactly one live connection. The registry is an
//! explicit object handed to whoever needs connections; it is never global
//! state, and `shutdown` closes everything it opened.

use crate::{broker::Broker, config::ConnectionParameters, errors::QueueError};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Opens broker connections and the brokers operating on them.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    type Connection: Send + Sync + 'static;

    /// Establishes a new connection.
    async fn connect(&self, params: &ConnectionParameters) -> Result<Self::Connection, QueueError>;

    fn is_connected(&self, connection: &Self::Connection) -> bool;

    async fn disconnect(&self, connection: &Self::Connection) -> Result<(), QueueError>;

    /// Opens a broker (a channel) on an established connection.
    async fn open_broker(
        &self,
        connection: Arc<Self::Connection>,
        params: &ConnectionParameters,
    ) -> Result<Arc<dyn Broker>, QueueError>;
}

/// Cache of live connections keyed by
/// [`ConnectionParameters::canonical_key`].
pub struct ConnectionRegistry<F: ConnectionFactory> {
    factory: F,
    connections: Mutex<HashMap<String, Arc<F::Connection>>>,
}

impl<F: ConnectionFactory> ConnectionRegistry<F> {
    pub fn new(factory: F) -> Self {
        ConnectionRegistry {
            factory,
            connections: Mutex::new(HashMap::default()),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Returns the connection for `params`, connecting when none is cached
    /// and reconnecting when the cached one dropped.
    ///
    /// The cache stays locked while connecting, so concurrent first calls
    /// with the same parameters still end up sharing one connection.
    pub async fn get_connection(
        &self,
        params: &ConnectionParameters,
    ) -> Result<Arc<F::Connection>, QueueError> {
        let key = params.canonical_key();
        let mut connections = self.connections.lock().await;

        if let Some(connection) = connections.get(&key) {
            if self.factory.is_connected(connection) {
                return Ok(connection.clone());
            }
            debug!(host = params.host(), "cached connection dropped, reconnecting");
        }

        let connection = Arc::new(self.factory.connect(params).await?);
        connections.insert(key, connection.clone());

        Ok(connection)
    }

    /// Number of cached connections.
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    /// Closes and forgets every cached connection.
    pub async fn shutdown(&self) {
        let connections: Vec<_> = self.connections.lock().await.drain().collect();

        for (key, connection) in connections {
            if let Err(err) = self.factory.disconnect(&connection).await {
                warn!(error = err.to_string(), key, "failure to close connection");
            }
        }
    }
}
