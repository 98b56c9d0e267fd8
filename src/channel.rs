// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connections and Channels
//!
//! This module connects to RabbitMQ through lapin. `LapinConnector` is the
//! connection factory behind the registry, and `AmqpBroker` runs the job
//! queue's broker operations over one channel of a shared connection.
//!
//! Channels are opened with a prefetch count of one, so a consumer never
//! holds more than one unacknowledged job. A channel the broker closed, for
//! instance after refusing a conflicting declaration, is reopened on the next
//! operation.

use crate::{
    broker::{Broker, ReceivedMessage},
    config::ConnectionParameters,
    errors::QueueError,
    exchange::ExchangeDeclaration,
    queue::QueueDeclaration,
    registry::ConnectionFactory,
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicGetOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, QueueBindOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{FieldTable, LongString},
    uri::{AMQPAuthority, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{debug, error};

/// Messages a channel may hold unacknowledged
pub const PREFETCH_COUNT: u16 = 1;

/// Builds the AMQP URI for the given parameters.
///
/// Credentials and vhost are kept as typed fields, so lapin never parses
/// them back out of a URI string and no escaping is involved.
pub fn amqp_uri(params: &ConnectionParameters) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: params.login().to_owned(),
                password: params.password().to_owned(),
            },
            host: params.host().to_owned(),
            port: params.port(),
        },
        vhost: params.vhost().to_owned(),
        ..AMQPUri::default()
    }
}

/// Connection factory opening lapin connections.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector {
    connection_name: Option<String>,
}

impl LapinConnector {
    pub fn new() -> Self {
        LapinConnector::default()
    }

    /// Sets the name connections report to the broker.
    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }
}

#[async_trait]
impl ConnectionFactory for LapinConnector {
    type Connection = Connection;

    async fn connect(&self, params: &ConnectionParameters) -> Result<Connection, QueueError> {
        debug!(host = params.host(), port = params.port(), "creating amqp connection...");

        let mut options = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            options = options.with_connection_name(LongString::from(name.clone()));
        }

        let connecting = Connection::connect_uri(amqp_uri(params), options);

        let connected = match params.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, connecting).await.map_err(|_| {
                error!(host = params.host(), "timed out connecting");
                QueueError::ConnectionError(format!("timed out connecting to {}", params.host()))
            })?,
            None => connecting.await,
        };

        let conn = match connected {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(QueueError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        Ok(conn)
    }

    fn is_connected(&self, connection: &Connection) -> bool {
        connection.status().connected()
    }

    async fn disconnect(&self, connection: &Connection) -> Result<(), QueueError> {
        connection.close(200, "shutdown").await.map_err(|err| {
            error!(error = err.to_string(), "failure to close connection");
            QueueError::ConnectionError(err.to_string())
        })
    }

    async fn open_broker(
        &self,
        connection: Arc<Connection>,
        params: &ConnectionParameters,
    ) -> Result<Arc<dyn Broker>, QueueError> {
        let broker = AmqpBroker::open(connection, params).await?;
        Ok(Arc::new(broker))
    }
}

/// Creates a channel with the job queue's prefetch count.
async fn new_amqp_channel(conn: &Connection) -> Result<Channel, QueueError> {
    debug!("creating amqp channel...");
    let channel = match conn.create_channel().await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(QueueError::ChannelError(err.to_string()))
        }
    }?;

    if let Err(err) = channel
        .basic_qos(PREFETCH_COUNT, BasicQosOptions { global: false })
        .await
    {
        error!(error = err.to_string(), "error to configure channel qos");
        return Err(QueueError::ChannelError(err.to_string()));
    }

    debug!("channel created");
    Ok(channel)
}

/// Awaits a broker round trip, giving up after `limit`.
async fn bounded<T, F>(
    limit: Option<Duration>,
    operation: &str,
    round_trip: F,
) -> Result<Result<T, lapin::Error>, QueueError>
where
    F: Future<Output = Result<T, lapin::Error>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, round_trip).await.map_err(|_| {
            error!(operation, "broker operation timed out");
            QueueError::TimeoutError(operation.to_owned())
        }),
        None => Ok(round_trip.await),
    }
}

fn is_precondition_failed(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED))
    )
}

/// Broker operations over a lapin channel.
pub struct AmqpBroker {
    connection: Arc<Connection>,
    channel: RwLock<Channel>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl AmqpBroker {
    /// Opens a channel on `connection`. Round trips are bounded by the read
    /// and write timeouts of `params`.
    pub async fn open(
        connection: Arc<Connection>,
        params: &ConnectionParameters,
    ) -> Result<Self, QueueError> {
        let channel = new_amqp_channel(&connection).await?;

        Ok(AmqpBroker {
            connection,
            channel: RwLock::new(channel),
            read_timeout: params.read_timeout(),
            write_timeout: params.write_timeout(),
        })
    }

    /// Returns a usable channel, reopening it when the broker closed it.
    async fn channel(&self) -> Result<Channel, QueueError> {
        {
            let channel = self.channel.read().await;
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let mut channel = self.channel.write().await;
        if !channel.status().connected() {
            debug!("channel closed by the broker, reopening");
            *channel = new_amqp_channel(&self.connection).await?;
        }

        Ok(channel.clone())
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(&self, def: &ExchangeDeclaration) -> Result<(), QueueError> {
        let channel = self.channel().await?;
        debug!("creating exchange: {}", def.name);

        match bounded(
            self.write_timeout,
            "exchange.declare",
            channel.exchange_declare(&def.name, def.kind.into(), def.options, FieldTable::default()),
        )
        .await?
        {
            Err(err) if is_precondition_failed(&err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "exchange already exists with other options"
                );
                Err(QueueError::TopologyConflictError(def.name.clone()))
            }
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "error to declare the exchange");
                Err(QueueError::DeclareExchangeError(def.name.clone()))
            }
            Ok(()) => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDeclaration) -> Result<(), QueueError> {
        let channel = self.channel().await?;
        debug!("creating queue: {}", def.name);

        match bounded(
            self.write_timeout,
            "queue.declare",
            channel.queue_declare(&def.name, def.options, def.arguments.clone()),
        )
        .await?
        {
            Err(err) if is_precondition_failed(&err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "queue already exists with other arguments"
                );
                Err(QueueError::TopologyConflictError(def.name.clone()))
            }
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                Err(QueueError::DeclareQueueError(def.name.clone()))
            }
            Ok(_) => {
                debug!("queue: {} was created", def.name);
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
        let channel = self.channel().await?;
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, routing_key
        );

        match bounded(
            self.write_timeout,
            "queue.bind",
            channel.queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            ),
        )
        .await?
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(QueueError::BindingExchangeToQueueError(
                    exchange.to_owned(),
                    queue.to_owned(),
                ))
            }
            Ok(()) => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), QueueError> {
        let channel = self.channel().await?;

        match bounded(
            self.write_timeout,
            "basic.publish",
            channel.basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            ),
        )
        .await?
        {
            Err(err) => {
                error!(error = err.to_string(), exchange, routing_key, "error publishing message");
                Err(QueueError::PublishingError(routing_key.to_owned()))
            }
            Ok(_) => Ok(()),
        }
    }

    async fn get(&self, queue: &str) -> Result<Option<ReceivedMessage>, QueueError> {
        let channel = self.channel().await?;

        match bounded(
            self.read_timeout,
            "basic.get",
            channel.basic_get(queue, BasicGetOptions { no_ack: false }),
        )
        .await?
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to get message");
                Err(QueueError::ConsumerError(queue.to_owned()))
            }
            Ok(None) => Ok(None),
            Ok(Some(message)) => {
                let delivery = message.delivery;
                Ok(Some(ReceivedMessage {
                    delivery_tag: delivery.delivery_tag,
                    exchange: delivery.exchange.to_string(),
                    routing_key: delivery.routing_key.to_string(),
                    redelivered: delivery.redelivered,
                    properties: delivery.properties,
                    data: delivery.data,
                }))
            }
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), QueueError> {
        let channel = self.channel().await?;

        match bounded(
            self.write_timeout,
            "basic.ack",
            channel.basic_ack(delivery_tag, BasicAckOptions { multiple: false }),
        )
        .await?
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(QueueError::AckMessageError)
            }
            Ok(()) => Ok(()),
        }
    }

    async fn reject(&self, delivery_tag: u64) -> Result<(), QueueError> {
        let channel = self.channel().await?;

        match bounded(
            self.write_timeout,
            "basic.reject",
            channel.basic_reject(delivery_tag, BasicRejectOptions { requeue: false }),
        )
        .await?
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling reject msg");
                Err(QueueError::RejectMessageError)
            }
            Ok(()) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::protocol::AMQPError;

    #[test]
    fn uri_uses_defaults() {
        let uri = amqp_uri(&ConnectionParameters::default());

        assert_eq!(uri.authority.host, "localhost");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.authority.userinfo.username, "guest");
        assert_eq!(uri.authority.userinfo.password, "guest");
        assert_eq!(uri.vhost, "/");
    }

    #[test]
    fn uri_keeps_credentials_and_vhost_verbatim() {
        let params = ConnectionParameters {
            host: Some("mq.internal".to_owned()),
            port: Some(5673),
            vhost: Some("jobs/eu west".to_owned()),
            login: Some("app".to_owned()),
            password: Some("p@ss:w/rd+[ä]".to_owned()),
            ..ConnectionParameters::default()
        };

        let uri = amqp_uri(&params);

        assert_eq!(uri.authority.host, "mq.internal");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.username, "app");
        assert_eq!(uri.authority.userinfo.password, "p@ss:w/rd+[ä]");
        assert_eq!(uri.vhost, "jobs/eu west");
    }

    fn protocol_error(kind: AMQPErrorKind) -> lapin::Error {
        lapin::Error::ProtocolError(AMQPError::new(kind, "refused".into()))
    }

    #[test]
    fn precondition_failed_is_recognized() {
        assert!(is_precondition_failed(&protocol_error(AMQPErrorKind::Soft(
            AMQPSoftError::PRECONDITIONFAILED
        ))));
        assert!(!is_precondition_failed(&protocol_error(AMQPErrorKind::Soft(
            AMQPSoftError::NOTFOUND
        ))));
        assert!(!is_precondition_failed(&lapin::Error::InvalidChannel(1)));
    }

    #[tokio::test]
    async fn round_trip_over_limit_times_out() {
        let result = bounded(
            Some(Duration::from_millis(1)),
            "queue.declare",
            std::future::pending::<Result<(), lapin::Error>>(),
        )
        .await;

        assert_eq!(
            result.map(|r| r.is_ok()),
            Err(QueueError::TimeoutError("queue.declare".to_owned()))
        );
    }

    #[tokio::test]
    async fn round_trip_within_limit_returns_its_result() {
        let within = bounded(Some(Duration::from_secs(5)), "basic.get", async {
            Ok::<_, lapin::Error>(7)
        })
        .await;
        let unbounded = bounded(None, "basic.get", async { Ok::<_, lapin::Error>(8) }).await;

        assert!(matches!(within, Ok(Ok(7))));
        assert!(matches!(unbounded, Ok(Ok(8))));
    }
}
