// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delayed Delivery
//!
//! Delayed jobs are parked in a generated deferred queue and left to the
//! broker. The deferred queue has no consumers; each message in it carries an
//! expiration equal to the delay, and the queue dead-letters expired messages
//! to the destination exchange with the destination queue as routing key.
//!
//! A delayed job therefore goes through two states:
//! 1. Holding: published to the deferred queue, waiting for its expiration
//! 2. Redelivered: dead-lettered by the broker to its destination
//!
//! Deferred queue names only depend on the destination and the delay, so jobs
//! scheduled with the same delay for the same queue share one deferred queue.
//! Each deferred queue expires by itself once it stays unused for half again
//! as long as the delay.

use crate::{
    broker::Route,
    errors::QueueError,
    job::{JobData, JobEnvelope},
    job_queue::JobQueue,
    publisher::deferred_properties,
    queue::QueueDeclaration,
    topology::{AMQP_ARGS_DEAD_LETTER_EXCHANGE, AMQP_ARGS_DEAD_LETTER_ROUTING_KEY, AMQP_ARGS_EXPIRES},
};
use chrono::{DateTime, Utc};
use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use opentelemetry::Context;
use std::time::Duration;
use tracing::{debug, warn};

/// Lower bound of a deferred queue's `x-expires`. The broker refuses zero.
pub const MIN_DEFERRED_QUEUE_EXPIRES_MILLIS: u64 = 1_000;
/// Largest expiry timer the broker accepts, in milliseconds.
pub const MAX_BROKER_EXPIRY_MILLIS: u64 = u32::MAX as u64;
/// Longest delay a deferred queue holds a job for. Its `x-expires`, one and a
/// half times the delay, still fits the broker's expiry timer.
pub const MAX_DELAY_SECS: u64 = MAX_BROKER_EXPIRY_MILLIS * 2 / 3 / 1_000;

/// How long to wait before a job is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// Relative delay in seconds; negative values mean no delay
    Seconds(i64),
    /// Absolute deadline
    Until(DateTime<Utc>),
}

impl Delay {
    /// Normalizes the delay to whole seconds from `now`, never negative.
    pub fn seconds_at(&self, now: DateTime<Utc>) -> u64 {
        let seconds = match self {
            Delay::Seconds(seconds) => *seconds,
            Delay::Until(deadline) => deadline.timestamp() - now.timestamp(),
        };
        seconds.max(0) as u64
    }

    /// Normalizes the delay to whole seconds from the current time.
    pub fn seconds(&self) -> u64 {
        self.seconds_at(Utc::now())
    }
}

impl From<i64> for Delay {
    fn from(seconds: i64) -> Self {
        Delay::Seconds(seconds)
    }
}

impl From<i32> for Delay {
    fn from(seconds: i32) -> Self {
        Delay::Seconds(i64::from(seconds))
    }
}

impl From<u32> for Delay {
    fn from(seconds: u32) -> Self {
        Delay::Seconds(i64::from(seconds))
    }
}

impl From<u64> for Delay {
    fn from(seconds: u64) -> Self {
        Delay::Seconds(i64::try_from(seconds).unwrap_or(i64::MAX))
    }
}

impl From<Duration> for Delay {
    fn from(duration: Duration) -> Self {
        Delay::Seconds(i64::try_from(duration.as_secs()).unwrap_or(i64::MAX))
    }
}

impl From<DateTime<Utc>> for Delay {
    fn from(deadline: DateTime<Utc>) -> Self {
        Delay::Until(deadline)
    }
}

/// The generated queue holding delayed jobs for one destination and delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredQueue {
    name: String,
    destination: Route,
    delay_secs: u64,
}

impl DeferredQueue {
    /// Describes the deferred queue redelivering to `destination` after
    /// `delay_secs` seconds, capped at [`MAX_DELAY_SECS`].
    pub fn new(destination: Route, delay_secs: u64) -> Self {
        let delay_secs = delay_secs.min(MAX_DELAY_SECS);
        let name = format!(
            "deferred from {}:{} for {}s",
            destination.exchange,
            destination.routing_key,
            group_thousands(delay_secs)
        );

        DeferredQueue {
            name,
            destination,
            delay_secs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn delay_secs(&self) -> u64 {
        self.delay_secs
    }

    /// Per-message expiration, in milliseconds.
    pub fn ttl_millis(&self) -> u64 {
        self.delay_secs.saturating_mul(1_000)
    }

    /// Idle lifetime of the queue itself, in milliseconds.
    pub fn expires_millis(&self) -> u64 {
        (self.ttl_millis().saturating_mul(3) / 2).max(MIN_DEFERRED_QUEUE_EXPIRES_MILLIS)
    }

    pub fn arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        args.insert(
            ShortString::from(AMQP_ARGS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(self.destination.exchange.clone())),
        );
        args.insert(
            ShortString::from(AMQP_ARGS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(self.destination.routing_key.clone())),
        );
        args.insert(
            ShortString::from(AMQP_ARGS_EXPIRES),
            AMQPValue::LongLongInt(i64::try_from(self.expires_millis()).unwrap_or(i64::MAX)),
        );
        args
    }

    pub fn declaration(&self) -> QueueDeclaration {
        QueueDeclaration {
            name: self.name.clone(),
            options: QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            arguments: self.arguments(),
        }
    }

    /// Route a job is published on to start holding: the default exchange
    /// delivers straight into the deferred queue.
    pub fn holding_route(&self) -> Route {
        Route::new("", &self.name)
    }

    /// Holding ends when the job expires: the broker dead-letters it along
    /// the returned route.
    pub fn expire(self) -> Route {
        self.destination
    }
}

/// Schedules jobs for delivery after a delay.
pub struct DelayedDelivery<'q> {
    queue: &'q JobQueue,
}

impl<'q> DelayedDelivery<'q> {
    pub fn new(queue: &'q JobQueue) -> Self {
        DelayedDelivery { queue }
    }

    /// Publishes a job that reaches `queue` once `delay` has elapsed.
    ///
    /// The destination queue and exchange, and the deferred queue, are
    /// declared before publishing. A zero delay still goes through the
    /// deferred queue, where the job expires at once; callers wanting
    /// immediate delivery should push instead.
    ///
    /// # Returns
    /// The deferred queue holding the job, or `None` when the destination
    /// exchange could not be declared
    pub async fn schedule(
        &self,
        delay: Delay,
        job: &str,
        data: JobData,
        queue: Option<&str>,
    ) -> Result<Option<DeferredQueue>, QueueError> {
        let delay_secs = delay.seconds();
        if delay_secs > MAX_DELAY_SECS {
            warn!(
                delay = delay_secs,
                max = MAX_DELAY_SECS,
                "delay exceeds what the broker can hold, capping it"
            );
        }
        let payload = JobEnvelope::new(job, data).encode()?;

        let Some(destination) = self.queue.declare_destination(queue).await? else {
            return Ok(None);
        };

        let deferred = DeferredQueue::new(destination.route(), delay_secs);
        debug!(queue = deferred.name(), "declaring deferred queue");
        self.queue.broker().declare_queue(&deferred.declaration()).await?;

        let route = deferred.holding_route();
        self.queue
            .broker()
            .publish(
                &route.exchange,
                &route.routing_key,
                &payload,
                deferred_properties(&Context::current(), deferred.ttl_millis()),
            )
            .await?;

        debug!(
            job,
            queue = deferred.name(),
            delay = delay_secs,
            "job deferred"
        );

        Ok(Some(deferred))
    }
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);

    for (i, digit) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn deadline_normalizes_to_remaining_seconds() {
        let now = Utc::now();

        assert_eq!(Delay::Until(now + TimeDelta::seconds(10)).seconds_at(now), 10);
        assert_eq!(Delay::Until(now - TimeDelta::seconds(10)).seconds_at(now), 0);
        assert_eq!(Delay::Seconds(-5).seconds_at(now), 0);
        assert_eq!(Delay::from(Duration::from_secs(90)).seconds_at(now), 90);

        let remaining = Delay::from(Utc::now() + TimeDelta::seconds(10)).seconds();
        assert!((9..=10).contains(&remaining));
    }

    #[test]
    fn name_depends_on_destination_and_delay_only() {
        let a = DeferredQueue::new(Route::new("", "emails"), 30);
        let b = DeferredQueue::new(Route::new("", "emails"), 30);
        let c = DeferredQueue::new(Route::new("", "emails"), 60);

        assert_eq!(a.name(), "deferred from :emails for 30s");
        assert_eq!(a.name(), b.name());
        assert_ne!(a.name(), c.name());
        assert_eq!(
            DeferredQueue::new(Route::new("jobs", "reports"), 3_600).name(),
            "deferred from jobs:reports for 3,600s"
        );
    }

    #[test]
    fn arguments_redirect_to_destination() {
        let deferred = DeferredQueue::new(Route::new("jobs", "emails"), 30);
        let args = deferred.arguments();

        assert_eq!(
            args.inner().get(AMQP_ARGS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString(LongString::from("jobs")))
        );
        assert_eq!(
            args.inner().get(AMQP_ARGS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString(LongString::from("emails")))
        );
        assert_eq!(
            args.inner().get(AMQP_ARGS_EXPIRES),
            Some(&AMQPValue::LongLongInt(45_000))
        );
        assert_eq!(deferred.ttl_millis(), 30_000);
        assert!(deferred.declaration().options.durable);
    }

    #[test]
    fn zero_delay_keeps_a_valid_queue_expiry() {
        let deferred = DeferredQueue::new(Route::new("", "emails"), 0);

        assert_eq!(deferred.ttl_millis(), 0);
        assert_eq!(deferred.expires_millis(), MIN_DEFERRED_QUEUE_EXPIRES_MILLIS);
    }

    #[test]
    fn expiry_moves_from_holding_to_destination() {
        let deferred = DeferredQueue::new(Route::new("jobs", "emails"), 30);

        assert_eq!(deferred.holding_route(), Route::new("", deferred.name()));
        assert_eq!(deferred.expire(), Route::new("jobs", "emails"));
    }

    #[test]
    fn huge_delay_is_capped_to_broker_limits() {
        let deferred = DeferredQueue::new(Route::new("", "emails"), u64::MAX);

        assert_eq!(deferred.delay_secs(), MAX_DELAY_SECS);
        assert!(deferred.expires_millis() >= deferred.ttl_millis());
        assert!(deferred.expires_millis() <= MAX_BROKER_EXPIRY_MILLIS);
        assert_eq!(
            deferred.name(),
            DeferredQueue::new(Route::new("", "emails"), MAX_DELAY_SECS).name()
        );
    }

    #[test]
    fn plain_integer_literals_are_delays() {
        let now = Utc::now();

        assert_eq!(Delay::from(60).seconds_at(now), 60);
        assert_eq!(Delay::from(-1).seconds_at(now), 0);
        assert_eq!(Delay::from(60u32).seconds_at(now), 60);
        assert_eq!(Delay::from(u64::MAX), Delay::Seconds(i64::MAX));
    }

    #[test]
    fn groups_thousands() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1_000), "1,000");
        assert_eq!(group_thousands(86_400), "86,400");
        assert_eq!(group_thousands(1_234_567), "1,234,567");
    }
}
