// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Job Tracing
//!
//! A job carries the trace of whoever pushed it in its AMQP headers, so the
//! span running the job continues that trace even when the worker lives in
//! another process. Pushing writes the current context into the headers;
//! dispatching reads it back and opens a consumer span for the job.

use crate::broker::ReceivedMessage;
use lapin::types::{AMQPValue, LongString, ShortString};
use opentelemetry::{
    global::{self, BoxedSpan},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context, KeyValue,
};
use std::{borrow::Cow, collections::BTreeMap};

/// Name of the tracer job spans are opened with
pub const JOB_TRACER: &str = "rabbitmq job queue";

pub(crate) type Headers = BTreeMap<ShortString, AMQPValue>;

/// Writes propagation fields as long string headers of a pushed job.
struct JobHeaderWriter<'a>(&'a mut Headers);

impl Injector for JobHeaderWriter<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(
            ShortString::from(key.to_lowercase()),
            AMQPValue::LongString(LongString::from(value)),
        );
    }
}

/// Reads propagation fields from the headers of a fetched job.
///
/// Both long and short string headers are accepted; headers of any other
/// type, or not valid UTF-8, are treated as absent.
struct JobHeaderReader<'a>(&'a Headers);

impl Extractor for JobHeaderReader<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.0.get(key)? {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes()).ok(),
            AMQPValue::ShortString(value) => Some(value.as_str()),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(ShortString::as_str).collect()
    }
}

/// Headers carrying `ctx` to whoever runs the job.
pub(crate) fn trace_headers(ctx: &Context) -> Headers {
    let mut headers = Headers::default();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut JobHeaderWriter(&mut headers))
    });
    headers
}

/// Context the job was pushed under, or an empty one when the job carries
/// no trace.
pub(crate) fn pushed_context(message: &ReceivedMessage) -> Context {
    match message.properties.headers() {
        Some(table) => global::get_text_map_propagator(|propagator| {
            propagator.extract(&JobHeaderReader(table.inner()))
        }),
        None => Context::new(),
    }
}

/// Opens the consumer span running `job`, fetched from `queue`.
///
/// # Returns
/// The context the job was pushed under and the new span
pub(crate) fn job_span(message: &ReceivedMessage, queue: &str, job: &str) -> (Context, BoxedSpan) {
    let ctx = pushed_context(message);
    let tracer = global::tracer(JOB_TRACER);

    let span = tracer
        .span_builder(Cow::from(job.to_owned()))
        .with_kind(SpanKind::Consumer)
        .with_attributes([
            KeyValue::new("messaging.system", "rabbitmq"),
            KeyValue::new("messaging.destination.name", queue.to_owned()),
            KeyValue::new("messaging.rabbitmq.delivery_tag", message.delivery_tag as i64),
        ])
        .start_with_context(&tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::{types::FieldTable, BasicProperties};
    use opentelemetry::trace::TraceContextExt;

    #[test]
    fn writer_lowercases_keys_into_long_strings() {
        let mut headers = Headers::default();
        JobHeaderWriter(&mut headers).set("TraceParent", "00-abc".to_owned());

        assert_eq!(
            headers.get("traceparent"),
            Some(&AMQPValue::LongString(LongString::from("00-abc")))
        );
    }

    #[test]
    fn reader_skips_non_string_headers() {
        let mut headers = Headers::default();
        headers.insert("a".into(), AMQPValue::LongString(LongString::from("1")));
        headers.insert("b".into(), AMQPValue::ShortString(ShortString::from("2")));
        headers.insert("c".into(), AMQPValue::LongLongInt(3));

        let reader = JobHeaderReader(&headers);

        assert_eq!(reader.get("a"), Some("1"));
        assert_eq!(reader.get("b"), Some("2"));
        assert_eq!(reader.get("c"), None);
        assert_eq!(reader.get("d"), None);
        assert_eq!(reader.keys(), vec!["a", "b", "c"]);
    }

    #[test]
    fn job_without_headers_has_no_pushed_trace() {
        let message = ReceivedMessage {
            delivery_tag: 1,
            exchange: String::new(),
            routing_key: "emails".to_owned(),
            redelivered: false,
            properties: BasicProperties::default().with_headers(FieldTable::default()),
            data: vec![],
        };

        let ctx = pushed_context(&message);

        assert!(!ctx.span().span_context().is_valid());
    }
}
