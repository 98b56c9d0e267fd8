// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Properties
//!
//! This module builds the AMQP properties attached to published jobs. Every
//! job is persistent JSON carrying a message id and a correlation id, and the
//! current OpenTelemetry context travels in its headers.

use crate::otel::trace_headers;
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::collections::HashMap;
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode marking a message persistent
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A header value attached to a raw push.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<HeaderValue> for AMQPValue {
    fn from(value: HeaderValue) -> Self {
        match value {
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(v),
            HeaderValue::Float(v) => AMQPValue::Double(v),
            HeaderValue::Bool(v) => AMQPValue::Boolean(v),
        }
    }
}

/// Options accepted by a raw push.
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub headers: HashMap<String, HeaderValue>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
}

impl PushOptions {
    pub fn new() -> Self {
        PushOptions::default()
    }

    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the id the popped job reports as its job id.
    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }
}

/// Builds the properties of an immediately delivered job.
pub(crate) fn push_properties(ctx: &Context, options: &PushOptions) -> BasicProperties {
    let mut headers = trace_headers(ctx);
    for (key, value) in options.headers.clone() {
        headers.insert(ShortString::from(key), value.into());
    }

    let correlation_id = options
        .correlation_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    base_properties(correlation_id)
        .with_priority(options.priority.unwrap_or(0))
        .with_headers(FieldTable::from(headers))
}

/// Builds the properties of a job parked in a deferred queue. The broker
/// dead-letters it once `expiration_millis` have elapsed.
pub(crate) fn deferred_properties(ctx: &Context, expiration_millis: u64) -> BasicProperties {
    base_properties(Uuid::new_v4().to_string())
        .with_expiration(ShortString::from(expiration_millis.to_string()))
        .with_headers(FieldTable::from(trace_headers(ctx)))
}

fn base_properties(correlation_id: String) -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_correlation_id(ShortString::from(correlation_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_properties_are_persistent_json() {
        let options = PushOptions::new()
            .header("tenant", "acme")
            .header("retries", 3i64)
            .priority(5);

        let props = push_properties(&Context::new(), &options);

        assert_eq!(props.delivery_mode(), &Some(PERSISTENT_DELIVERY_MODE));
        assert_eq!(
            props.content_type().as_ref().map(|c| c.as_str()),
            Some(JSON_CONTENT_TYPE)
        );
        assert_eq!(props.priority(), &Some(5));
        assert!(props.correlation_id().is_some());
        assert!(props.expiration().is_none());

        let headers = props.headers().clone().unwrap_or_default();
        assert_eq!(
            headers.inner().get("tenant"),
            Some(&AMQPValue::LongString(LongString::from("acme")))
        );
        assert_eq!(
            headers.inner().get("retries"),
            Some(&AMQPValue::LongLongInt(3))
        );
    }

    #[test]
    fn push_properties_keep_caller_correlation_id() {
        let options = PushOptions::new().correlation_id("job-42");
        let props = push_properties(&Context::new(), &options);

        assert_eq!(
            props.correlation_id().as_ref().map(|c| c.as_str()),
            Some("job-42")
        );
        assert_eq!(props.priority(), &Some(0));
    }

    #[test]
    fn deferred_properties_carry_expiration() {
        let props = deferred_properties(&Context::new(), 30_000);

        assert_eq!(
            props.expiration().as_ref().map(|e| e.as_str()),
            Some("30000")
        );
        assert_eq!(props.delivery_mode(), &Some(PERSISTENT_DELIVERY_MODE));
    }
}
