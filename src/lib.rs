// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Job Queue
//!
//! Job queue driver over AMQP 0-9-1. Jobs are pushed as JSON envelopes onto
//! queues whose options, and the exchanges publishing to them, are resolved
//! from pattern rules. Delayed jobs wait in per-delay holding queues and are
//! dead-lettered onto their destination once their message TTL expires.
//!
//! ```no_run
//! use rabbitmq_queue::{config::QueueConfig, connector::Connector, job::JobData};
//!
//! # async fn run() -> Result<(), rabbitmq_queue::errors::QueueError> {
//! let config = QueueConfig::from_env()?;
//! let queue = Connector::lapin(&config).connect(&config).await?;
//!
//! queue.push("SendWelcomeEmail", JobData::new(), Some("emails")).await?;
//! queue.later(60, "SendReminder", JobData::new(), Some("emails")).await?;
//!
//! if let Some(job) = queue.pop(Some("emails")).await {
//!     job.delete().await?;
//! }
//! # Ok(())
//! # }
//! ```

mod otel;

pub mod broker;
pub mod channel;
pub mod config;
pub mod connector;
pub mod deferred;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod job;
pub mod job_queue;
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod topology;

pub use connector::Connector;
pub use errors::QueueError;
pub use job::{JobData, JobHandle};
pub use job_queue::JobQueue;
