// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Jobs
//!
//! A job travels as a JSON envelope `{"job": <handler>, "data": {...}}`. The
//! number of times a job was attempted lives in `data.attempts`, incremented
//! each time the job is released back onto the queue.
//!
//! A `JobHandle` wraps one fetched delivery. Deleting or releasing it
//! consumes the handle, so a delivery is resolved at most once.

use crate::{
    broker::ReceivedMessage, deferred::Delay, errors::QueueError, job_queue::JobQueue,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Data payload of a job.
pub type JobData = Map<String, Value>;

/// Key of the attempt counter inside the job data
pub const ATTEMPTS_KEY: &str = "attempts";

/// Wire representation of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job: String,
    #[serde(default)]
    pub data: JobData,
}

impl JobEnvelope {
    pub fn new(job: &str, data: JobData) -> Self {
        JobEnvelope {
            job: job.to_owned(),
            data,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, QueueError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(body: &[u8]) -> Result<Self, QueueError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Number of times the job was attempted; zero when the counter is absent
    /// or unreadable.
    pub fn attempts(&self) -> u32 {
        match self.data.get(ATTEMPTS_KEY) {
            Some(Value::Number(n)) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
                .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX)),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    /// Returns the envelope with its attempt counter incremented by one.
    pub fn next_attempt(mut self) -> Self {
        let attempts = self.attempts().saturating_add(1);
        self.data.insert(ATTEMPTS_KEY.to_owned(), Value::from(attempts));
        self
    }
}

/// A job fetched from a queue.
pub struct JobHandle {
    queue: JobQueue,
    queue_name: String,
    message: ReceivedMessage,
}

impl JobHandle {
    pub(crate) fn new(queue: JobQueue, queue_name: &str, message: ReceivedMessage) -> Self {
        JobHandle {
            queue,
            queue_name: queue_name.to_owned(),
            message,
        }
    }

    /// Number of times the job was attempted before this delivery.
    pub fn attempts(&self) -> Result<u32, QueueError> {
        Ok(self.envelope()?.attempts())
    }

    pub fn envelope(&self) -> Result<JobEnvelope, QueueError> {
        JobEnvelope::decode(&self.message.data)
    }

    pub fn raw_body(&self) -> &[u8] {
        &self.message.data
    }

    /// Name of the queue the job was fetched from.
    pub fn queue(&self) -> &str {
        &self.queue_name
    }

    /// The message correlation id.
    pub fn job_id(&self) -> Option<&str> {
        self.message
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str())
    }

    pub fn message(&self) -> &ReceivedMessage {
        &self.message
    }

    /// Acknowledges the delivery, removing the job from the queue.
    pub async fn delete(self) -> Result<(), QueueError> {
        self.queue.broker().ack(self.message.delivery_tag).await?;
        debug!(queue = self.queue_name, "job deleted");
        Ok(())
    }

    /// Puts the job back onto its queue with one more attempt recorded.
    ///
    /// The current delivery is rejected without requeueing and the job is
    /// pushed again, through a deferred queue when `delay` is positive. The
    /// envelope is decoded first, so a malformed job is left unacknowledged.
    ///
    /// # Returns
    /// Whether the job was published again
    pub async fn release(self, delay: impl Into<Delay>) -> Result<bool, QueueError> {
        let delay = delay.into().seconds();
        let envelope = self.envelope()?.next_attempt();

        self.reject_best_effort().await;

        debug!(
            queue = self.queue_name,
            job = envelope.job,
            attempts = envelope.attempts(),
            delay,
            "releasing job"
        );

        if delay > 0 {
            self.queue
                .later(
                    Delay::Seconds(i64::try_from(delay).unwrap_or(i64::MAX)),
                    &envelope.job,
                    envelope.data,
                    Some(&self.queue_name),
                )
                .await
        } else {
            self.queue
                .push(&envelope.job, envelope.data, Some(&self.queue_name))
                .await
        }
    }

    async fn reject_best_effort(&self) {
        if let Err(err) = self.queue.broker().reject(self.message.delivery_tag).await {
            warn!(
                error = err.to_string(),
                queue = self.queue_name,
                "failure to reject released job, the broker will redeliver it"
            );
        }
    }
}
