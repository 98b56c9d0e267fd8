// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Job Dispatcher
//!
//! Maps job names to handlers and runs fetched jobs through them. The outcome
//! of a handler decides what happens to the delivery:
//! - success acknowledges the job
//! - failure releases the job with one more attempt recorded, until the
//!   configured maximum of attempts is reached and the job is dropped
//! - jobs nobody registered a handler for are acknowledged and dropped
//! - bodies that are not a job envelope are acknowledged, and the decoding
//!   error is returned to the caller
//!
//! Each dispatch opens a consumer span continuing the trace of whoever pushed
//! the job.

use crate::{
    deferred::Delay,
    errors::QueueError,
    job::{JobData, JobHandle},
    job_queue::JobQueue,
    otel,
};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use opentelemetry::{
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, collections::HashMap, sync::Arc};
use tracing::{debug, error, warn};

/// Attempts a job gets before it is dropped
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Runs one kind of job.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, job: &JobHandle, data: &JobData)
        -> Result<(), QueueError>;
}

/// What became of a dispatched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// The handler succeeded and the job was acknowledged
    Completed,
    /// The handler failed and the job was put back on its queue
    Released { attempts: u32 },
    /// The handler failed on the last allowed attempt; the job was dropped
    Failed,
    /// No handler knows the job; it was dropped
    Discarded,
}

pub struct JobDispatcher {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    max_attempts: u32,
    retry_delay: Delay,
}

impl Default for JobDispatcher {
    fn default() -> Self {
        JobDispatcher {
            handlers: HashMap::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: Delay::Seconds(0),
        }
    }
}

impl JobDispatcher {
    pub fn new() -> Self {
        JobDispatcher::default()
    }

    /// Registers the handler running jobs named `job`.
    pub fn register(mut self, job: &str, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job.to_owned(), handler);
        self
    }

    /// Sets how many attempts a job gets, the first one included.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets the delay failed jobs are released with.
    pub fn retry_delay(mut self, delay: impl Into<Delay>) -> Self {
        self.retry_delay = delay.into();
        self
    }

    /// Pops one job from `queue` and dispatches it.
    ///
    /// # Returns
    /// `None` when there was no job to run
    pub async fn work_once(
        &self,
        queue: &JobQueue,
        name: Option<&str>,
    ) -> Result<Option<Dispatched>, QueueError> {
        match queue.pop(name).await {
            Some(job) => Ok(Some(self.dispatch(job).await?)),
            None => Ok(None),
        }
    }

    pub async fn dispatch(&self, job: JobHandle) -> Result<Dispatched, QueueError> {
        let envelope = match job.envelope() {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = job.queue(),
                    "removing job from queue - reason: malformed payload"
                );
                job.delete().await?;
                return Err(err);
            }
        };

        let (ctx, mut span) = otel::job_span(job.message(), job.queue(), &envelope.job);

        debug!(queue = job.queue(), job = envelope.job, "received job");

        let Some(handler) = self.handlers.get(&envelope.job) else {
            let msg = "removing job from queue - reason: unsupported job";
            span.record_error(&QueueError::HandlerError(envelope.job.clone()));
            span.set_status(Status::Error {
                description: Cow::from(msg),
            });
            debug!(job = envelope.job, "{}", msg);

            if let Err(err) = job.delete().await {
                span.record_error(&err);
                return Err(err);
            }
            return Ok(Dispatched::Discarded);
        };

        let result = handler.handle(&ctx, &job, &envelope.data).await;
        if result.is_ok() {
            debug!(job = envelope.job, "job successfully processed");
            return match job.delete().await {
                Ok(()) => {
                    span.set_status(Status::Ok);
                    Ok(Dispatched::Completed)
                }
                Err(err) => {
                    error!(error = err.to_string(), "error to ack job");
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack job"),
                    });
                    Err(err)
                }
            };
        }

        if let Err(err) = &result {
            span.record_error(err);
        }

        let attempts = envelope.attempts().saturating_add(1);
        if attempts >= self.max_attempts {
            error!(job = envelope.job, attempts, "too many attempts, dropping job");
            span.set_status(Status::Error {
                description: Cow::from("too many attempts"),
            });
            job.delete().await?;
            return Ok(Dispatched::Failed);
        }

        warn!(job = envelope.job, attempts, "error whiling handling job, releasing for latter");
        span.set_status(Status::Error {
            description: Cow::from("job released"),
        });

        match job.release(self.retry_delay).await {
            Ok(true) => Ok(Dispatched::Released { attempts }),
            Ok(false) => Err(QueueError::PublishingError(envelope.job)),
            Err(err) => {
                error!(error = err.to_string(), "error whiling releasing job");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::QueueConfig, memory::MemoryBroker, topology::TopologyResolver};
    use serde_json::json;

    fn job_queue(broker: &MemoryBroker) -> JobQueue {
        JobQueue::new(
            Arc::new(broker.clone()),
            TopologyResolver::from_config(&QueueConfig::default()),
        )
    }

    #[tokio::test]
    async fn successful_job_is_acknowledged() {
        let broker = MemoryBroker::new();
        let queue = job_queue(&broker);
        queue.push("Send", JobData::new(), None).await.unwrap();

        let mut handler = MockJobHandler::new();
        handler.expect_handle().times(1).returning(|_, _, _| Ok(()));

        let dispatcher = JobDispatcher::new().register("Send", Arc::new(handler));

        assert_eq!(
            dispatcher.work_once(&queue, None).await,
            Ok(Some(Dispatched::Completed))
        );
        assert_eq!(broker.message_count("default").await, 0);
        assert_eq!(broker.unacked_count().await, 0);
    }

    #[tokio::test]
    async fn handler_receives_job_data() {
        let broker = MemoryBroker::new();
        let queue = job_queue(&broker);
        let data = json!({"to": "a@b.com"}).as_object().cloned().unwrap();
        queue.push("Send", data, Some("emails")).await.unwrap();

        let mut handler = MockJobHandler::new();
        handler
            .expect_handle()
            .withf(|_, job, data| job.queue() == "emails" && data["to"] == "a@b.com")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let dispatcher = JobDispatcher::new().register("Send", Arc::new(handler));

        assert_eq!(
            dispatcher.work_once(&queue, Some("emails")).await,
            Ok(Some(Dispatched::Completed))
        );
    }

    #[tokio::test]
    async fn failing_job_is_released_until_max_attempts() {
        let broker = MemoryBroker::new();
        let queue = job_queue(&broker);
        queue.push("Send", JobData::new(), None).await.unwrap();

        let mut handler = MockJobHandler::new();
        handler
            .expect_handle()
            .times(2)
            .returning(|_, _, _| Err(QueueError::HandlerError("smtp down".to_owned())));

        let dispatcher = JobDispatcher::new()
            .register("Send", Arc::new(handler))
            .max_attempts(2);

        assert_eq!(
            dispatcher.work_once(&queue, None).await,
            Ok(Some(Dispatched::Released { attempts: 1 }))
        );
        assert_eq!(broker.message_count("default").await, 1);

        assert_eq!(
            dispatcher.work_once(&queue, None).await,
            Ok(Some(Dispatched::Failed))
        );
        assert_eq!(broker.message_count("default").await, 0);
        assert_eq!(broker.unacked_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_job_is_discarded() {
        let broker = MemoryBroker::new();
        let queue = job_queue(&broker);
        queue.push("Unknown", JobData::new(), None).await.unwrap();

        let dispatcher = JobDispatcher::new();

        assert_eq!(
            dispatcher.work_once(&queue, None).await,
            Ok(Some(Dispatched::Discarded))
        );
        assert_eq!(broker.unacked_count().await, 0);
    }

    #[tokio::test]
    async fn malformed_payload_fails_dispatch_and_leaves_queue() {
        let broker = MemoryBroker::new();
        let queue = job_queue(&broker);
        queue
            .push_raw(br#"{"job": 1}"#, None, Default::default())
            .await
            .unwrap();

        let result = JobDispatcher::new().work_once(&queue, None).await;

        assert!(matches!(result, Err(QueueError::ParsePayloadError(_))));
        assert_eq!(broker.message_count("default").await, 0);
        assert_eq!(broker.unacked_count().await, 0);
    }

    #[tokio::test]
    async fn empty_queue_dispatches_nothing() {
        let broker = MemoryBroker::new();
        let queue = job_queue(&broker);

        assert_eq!(JobDispatcher::new().work_once(&queue, None).await, Ok(None));
    }
}
