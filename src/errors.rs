// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Job Queue
//!
//! `QueueError` covers every failure the adapter can report: connecting to the
//! broker, declaring topology, publishing, fetching and resolving deliveries,
//! decoding job envelopes and loading configuration.
//!
//! Not every variant reaches the caller. `pop` swallows fetch failures into
//! "no job", `release` swallows reject failures, and `push`/`later` turn an
//! exchange declaration failure into `Ok(false)`.

use thiserror::Error;

/// Represents errors that can occur while operating the job queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The broker is unreachable or the handshake failed
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// A channel could not be opened or configured on a live connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// A broker round trip exceeded the configured timeout
    #[error("broker operation `{0}` timed out")]
    TimeoutError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// The broker already holds a conflicting definition for the named entity
    #[error("topology conflict on `{0}`")]
    TopologyConflictError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// Error fetching a message from a queue
    #[error("failure to get a message from `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// A job envelope could not be encoded or decoded
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Invalid configuration
    #[error("invalid configuration `{0}`")]
    ConfigurationError(String),

    /// A job handler reported a failure
    #[error("job handler failed `{0}`")]
    HandlerError(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::ParsePayloadError(err.to_string())
    }
}
