// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use rabbitmq_queue::{
    broker::Route,
    config::QueueConfig,
    deferred::DeferredQueue,
    exchange::{ExchangeKind, ExchangeRule},
    job::JobData,
    job_queue::JobQueue,
    memory::MemoryBroker,
    queue::QueueRule,
    topology::TopologyResolver,
};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};

fn job_queue(broker: &MemoryBroker, config: &QueueConfig) -> JobQueue {
    JobQueue::new(Arc::new(broker.clone()), TopologyResolver::from_config(config))
}

fn data(value: Value) -> JobData {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::test]
async fn pushed_job_pops_with_zero_attempts() {
    let broker = MemoryBroker::new();
    let queue = job_queue(&broker, &QueueConfig::default());

    let pushed = queue
        .push("SendWelcomeEmail", data(json!({"user": 42})), Some("emails"))
        .await;
    assert_eq!(pushed, Ok(true));

    let job = queue.pop(Some("emails")).await.unwrap();
    assert_eq!(job.attempts(), Ok(0));
    assert_eq!(job.queue(), "emails");
    assert!(job.job_id().is_some());

    let body: Value = serde_json::from_slice(job.raw_body()).unwrap();
    assert_eq!(body, json!({"job": "SendWelcomeEmail", "data": {"user": 42}}));

    job.delete().await.unwrap();
    assert!(queue.pop(Some("emails")).await.is_none());
    assert_eq!(broker.unacked_count().await, 0);
}

#[tokio::test]
async fn pop_on_empty_queue_returns_none() {
    let broker = MemoryBroker::new();
    let queue = job_queue(&broker, &QueueConfig::default());

    assert!(queue.pop(None).await.is_none());
    assert!(broker.has_queue("default").await);
}

#[tokio::test]
async fn released_job_counts_attempts() {
    let broker = MemoryBroker::new();
    let queue = job_queue(&broker, &QueueConfig::default());
    queue.push("Resize", JobData::new(), None).await.unwrap();

    let first = queue.pop(None).await.unwrap();
    assert_eq!(first.release(0).await, Ok(true));

    let second = queue.pop(None).await.unwrap();
    assert_eq!(second.attempts(), Ok(1));
    assert_eq!(second.release(0).await, Ok(true));

    let third = queue.pop(None).await.unwrap();
    assert_eq!(third.attempts(), Ok(2));
    assert_eq!(broker.message_count("default").await, 0);
}

#[tokio::test]
async fn delayed_job_arrives_after_delay() {
    let broker = MemoryBroker::new();
    let queue = job_queue(&broker, &QueueConfig::default());

    assert_eq!(
        queue.later(60, "Remind", JobData::new(), Some("emails")).await,
        Ok(true)
    );
    assert!(queue.pop(Some("emails")).await.is_none());

    broker.elapse(Duration::from_secs(59)).await;
    assert!(queue.pop(Some("emails")).await.is_none());

    broker.elapse(Duration::from_secs(1)).await;
    let job = queue.pop(Some("emails")).await.unwrap();
    assert_eq!(job.envelope().unwrap().job, "Remind");
    assert_eq!(job.attempts(), Ok(0));
}

#[tokio::test]
async fn same_delay_shares_one_deferred_queue() {
    let broker = MemoryBroker::new();
    let queue = job_queue(&broker, &QueueConfig::default());

    queue.later(30, "A", JobData::new(), Some("emails")).await.unwrap();
    queue.later(30, "B", JobData::new(), Some("emails")).await.unwrap();
    queue.later(45, "C", JobData::new(), Some("emails")).await.unwrap();

    let thirty = DeferredQueue::new(Route::new("", "emails"), 30);
    let forty_five = DeferredQueue::new(Route::new("", "emails"), 45);

    assert_eq!(
        broker.queue_names().await,
        vec![
            thirty.name().to_owned(),
            forty_five.name().to_owned(),
            "emails".to_owned()
        ]
    );
    assert_eq!(broker.message_count(thirty.name()).await, 2);
    assert_eq!(broker.message_count(forty_five.name()).await, 1);
}

#[tokio::test]
async fn released_job_with_delay_waits_in_deferred_queue() {
    let broker = MemoryBroker::new();
    let queue = job_queue(&broker, &QueueConfig::default());
    queue.push("Resize", JobData::new(), None).await.unwrap();

    let job = queue.pop(None).await.unwrap();
    assert_eq!(job.release(10).await, Ok(true));
    assert!(queue.pop(None).await.is_none());

    broker.elapse(Duration::from_secs(10)).await;
    let job = queue.pop(None).await.unwrap();
    assert_eq!(job.attempts(), Ok(1));
}

#[tokio::test]
async fn idle_deferred_queue_deletes_itself() {
    let broker = MemoryBroker::new();
    let queue = job_queue(&broker, &QueueConfig::default());
    queue.later(10, "A", JobData::new(), None).await.unwrap();

    let deferred = DeferredQueue::new(Route::new("", "default"), 10);
    broker.elapse(Duration::from_secs(10)).await;
    assert!(broker.has_queue(deferred.name()).await);

    broker.elapse(Duration::from_secs(5)).await;
    assert!(!broker.has_queue(deferred.name()).await);
    assert_eq!(broker.message_count("default").await, 1);
}

#[tokio::test]
async fn named_exchange_routes_to_queue() {
    let config = QueueConfig::default()
        .queue_rule("^orders", QueueRule::new().exchange("orders"))
        .unwrap()
        .exchange_rule("^orders$", ExchangeRule::new().kind(ExchangeKind::Topic))
        .unwrap();

    let broker = MemoryBroker::new();
    let queue = job_queue(&broker, &config);

    assert_eq!(
        queue.push("Ship", JobData::new(), Some("orders.created")).await,
        Ok(true)
    );
    assert_eq!(broker.exchange_kind("orders").await, Some(ExchangeKind::Topic));

    let job = queue.pop(Some("orders.created")).await.unwrap();
    assert_eq!(job.message().exchange, "orders");
    assert_eq!(job.message().routing_key, "orders.created");
}

#[tokio::test]
async fn delayed_job_through_named_exchange() {
    let config = QueueConfig::default()
        .queue_rule("^orders", QueueRule::new().exchange("orders"))
        .unwrap();

    let broker = MemoryBroker::new();
    let queue = job_queue(&broker, &config);
    queue.later(5, "Ship", JobData::new(), Some("orders")).await.unwrap();

    broker.elapse(Duration::from_secs(5)).await;

    let job = queue.pop(Some("orders")).await.unwrap();
    assert_eq!(job.message().exchange, "orders");
}

#[tokio::test]
async fn exchange_type_conflict_reports_false() {
    let broker = MemoryBroker::new();

    let fanout = QueueConfig::default()
        .queue_rule(".*", QueueRule::new().exchange("jobs"))
        .unwrap()
        .exchange_rule("^jobs$", ExchangeRule::new().kind(ExchangeKind::Fanout))
        .unwrap();
    let direct = QueueConfig::default()
        .queue_rule(".*", QueueRule::new().exchange("jobs"))
        .unwrap();

    let first = job_queue(&broker, &fanout);
    let second = job_queue(&broker, &direct);

    assert_eq!(first.push("A", JobData::new(), None).await, Ok(true));
    assert_eq!(second.push("B", JobData::new(), None).await, Ok(false));
    assert_eq!(second.later(5, "B", JobData::new(), None).await, Ok(false));
    assert_eq!(broker.message_count("default").await, 1);
}

#[tokio::test]
async fn queue_rules_drive_declarations() {
    let config = QueueConfig::from_json(
        r#"{
            "queues": {
                "^temp\\.": {"durable": false, "autodelete": true},
                ".*": {"durable": true}
            }
        }"#,
    )
    .unwrap();

    let broker = MemoryBroker::new();
    let queue = job_queue(&broker, &config);

    queue.push("A", JobData::new(), Some("temp.reports")).await.unwrap();
    queue.push("B", JobData::new(), Some("reports")).await.unwrap();

    let temp = queue.topology().resolve_queue("temp.reports");
    assert!(!temp.durable);
    assert!(temp.autodelete);
    assert!(queue.topology().resolve_queue("reports").durable);
    assert_eq!(broker.message_count("temp.reports").await, 1);
    assert_eq!(broker.message_count("reports").await, 1);
}
