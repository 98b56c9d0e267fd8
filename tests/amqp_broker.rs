// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Runs against a live broker configured through the `RABBITMQ_*`
//! environment variables: `cargo test -- --ignored`.

use rabbitmq_queue::{
    broker::Broker,
    channel::LapinConnector,
    config::QueueConfig,
    errors::QueueError,
    exchange::{ExchangeKind, ExchangeOptions, ExchangeRule},
    queue::QueueOptions,
    registry::ConnectionFactory,
};
use std::sync::Arc;
use uuid::Uuid;

fn exchange(name: &str, kind: ExchangeKind) -> ExchangeOptions {
    ExchangeOptions {
        name: name.to_owned(),
        durable: false,
        ..ExchangeOptions::default()
    }
    .merge(&ExchangeRule::new().kind(kind))
}

#[tokio::test]
#[ignore = "needs a RabbitMQ broker"]
async fn conflicting_redeclare_is_reported_and_channel_reopened() {
    let config = QueueConfig::from_env().unwrap();
    let connector = LapinConnector::new().with_connection_name("rabbitmq-queue tests");

    let connection = Arc::new(connector.connect(&config.connection).await.unwrap());
    let broker = connector
        .open_broker(connection.clone(), &config.connection)
        .await
        .unwrap();

    let name = format!("conflict-{}", Uuid::new_v4());
    broker
        .declare_exchange(&exchange(&name, ExchangeKind::Direct).declaration())
        .await
        .unwrap();

    assert_eq!(
        broker
            .declare_exchange(&exchange(&name, ExchangeKind::Fanout).declaration())
            .await,
        Err(QueueError::TopologyConflictError(name.clone()))
    );

    let queue = QueueOptions {
        name: format!("reopened-{}", Uuid::new_v4()),
        durable: false,
        autodelete: true,
        ..QueueOptions::default()
    };
    assert_eq!(broker.declare_queue(&queue.declaration()).await, Ok(()));
    assert!(broker.get(&queue.name).await.unwrap().is_none());

    connector.disconnect(&connection).await.unwrap();
}
