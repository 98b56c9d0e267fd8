// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Configuration
//!
//! This module defines the configuration a job queue connection is built from:
//! the broker connection parameters, the ordered per-queue and per-exchange
//! rules, and the defaults those rules are merged over.
//!
//! A configuration document looks like this:
//!
//! ```json
//! {
//!   "host": "rabbitmq", "port": 5672, "vhost": "/",
//!   "login": "guest", "password": "guest", "read_timeout": 3,
//!   "queues": { "^orders\\.": { "durable": false, "exchange": "orders" } },
//!   "queue_defaults": { "name": "default" },
//!   "exchanges": { "^orders$": { "type": "topic" } },
//!   "exchange_defaults": { "type": "direct", "durable": true }
//! }
//! ```

use crate::{
    errors::QueueError,
    exchange::{ExchangeOptions, ExchangeRule},
    queue::{QueueOptions, QueueRule},
    topology::Rules,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, env, time::Duration};
use tracing::error;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_VHOST: &str = "/";
pub const DEFAULT_LOGIN: &str = "guest";
pub const DEFAULT_PASSWORD: &str = "guest";

/// Parameters identifying a broker connection.
///
/// Every field is optional; unset fields fall back to the RabbitMQ defaults.
/// Two parameter sets sharing the same [`canonical_key`](Self::canonical_key)
/// share one connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vhost: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Seconds allowed for the connection handshake
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<f64>,
    /// Seconds allowed for a fetch round trip
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_timeout: Option<f64>,
    /// Seconds allowed for a declare, publish, ack or reject round trip
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_timeout: Option<f64>,
}

impl ConnectionParameters {
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn vhost(&self) -> &str {
        self.vhost.as_deref().unwrap_or(DEFAULT_VHOST)
    }

    pub fn login(&self) -> &str {
        self.login.as_deref().unwrap_or(DEFAULT_LOGIN)
    }

    pub fn password(&self) -> &str {
        self.password.as_deref().unwrap_or(DEFAULT_PASSWORD)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        seconds(self.connect_timeout)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        seconds(self.read_timeout)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        seconds(self.write_timeout)
    }

    /// Computes the key connections are cached under.
    ///
    /// Defaults are applied first, so a parameter set that spells out a
    /// default value collides with one that leaves it unset. Timeouts only
    /// take part when they are set. The fields are rendered as `[name=value]`
    /// sorted by name, which makes the key independent of the order the
    /// fields were written in.
    pub fn canonical_key(&self) -> String {
        let mut fields = BTreeMap::new();
        fields.insert("host", self.host().to_owned());
        fields.insert("port", self.port().to_string());
        fields.insert("vhost", self.vhost().to_owned());
        fields.insert("login", self.login().to_owned());
        fields.insert("password", self.password().to_owned());

        for (name, timeout) in [
            ("connect_timeout", self.connect_timeout),
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
        ] {
            if let Some(timeout) = timeout {
                fields.insert(name, timeout.to_string());
            }
        }

        fields
            .iter()
            .map(|(name, value)| format!("[{name}={value}]"))
            .collect()
    }
}

fn seconds(value: Option<f64>) -> Option<Duration> {
    value
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(Duration::from_secs_f64)
}

/// Full configuration of a job queue connection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueConfig {
    #[serde(flatten)]
    pub connection: ConnectionParameters,
    /// Name the connection reports to the broker
    #[serde(default)]
    pub connection_name: Option<String>,
    #[serde(default)]
    pub queues: Rules<QueueRule>,
    #[serde(default)]
    pub queue_defaults: QueueOptions,
    #[serde(default)]
    pub exchanges: Rules<ExchangeRule>,
    #[serde(default)]
    pub exchange_defaults: ExchangeOptions,
}

impl QueueConfig {
    pub fn new(connection: ConnectionParameters) -> Self {
        QueueConfig {
            connection,
            ..QueueConfig::default()
        }
    }

    /// Parses a JSON configuration document.
    ///
    /// Rule patterns are compiled and exchange types validated here, so a
    /// configuration that loads is one the queue can always resolve.
    pub fn from_json(document: &str) -> Result<Self, QueueError> {
        serde_json::from_str(document).map_err(|err| {
            error!(error = err.to_string(), "failure to load queue configuration");
            QueueError::ConfigurationError(err.to_string())
        })
    }

    /// Builds a configuration from the `RABBITMQ_*` environment variables.
    ///
    /// Only the connection parameters are read; rules and defaults are left
    /// empty.
    pub fn from_env() -> Result<Self, QueueError> {
        let port = match env::var("RABBITMQ_PORT") {
            Ok(port) => Some(port.parse::<u16>().map_err(|err| {
                error!(error = err.to_string(), "invalid RABBITMQ_PORT");
                QueueError::ConfigurationError(format!("RABBITMQ_PORT: {err}"))
            })?),
            Err(_) => None,
        };

        Ok(QueueConfig::new(ConnectionParameters {
            host: env::var("RABBITMQ_HOST").ok(),
            port,
            vhost: env::var("RABBITMQ_VHOST").ok(),
            login: env::var("RABBITMQ_USER").ok(),
            password: env::var("RABBITMQ_PASSWORD").ok(),
            ..ConnectionParameters::default()
        }))
    }

    pub fn queue_rule(mut self, pattern: &str, rule: QueueRule) -> Result<Self, QueueError> {
        self.queues = self.queues.rule(pattern, rule)?;
        Ok(self)
    }

    pub fn exchange_rule(mut self, pattern: &str, rule: ExchangeRule) -> Result<Self, QueueError> {
        self.exchanges = self.exchanges.rule(pattern, rule)?;
        Ok(self)
    }

    pub fn queue_defaults(mut self, defaults: QueueOptions) -> Self {
        self.queue_defaults = defaults;
        self
    }

    pub fn exchange_defaults(mut self, defaults: ExchangeOptions) -> Self {
        self.exchange_defaults = defaults;
        self
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty() && s != "0",
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}

/// Reads an optional flag, accepting any truthy value. `null` counts as unset.
pub(crate) fn truthy<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.map(|value| is_truthy(&value)))
}

pub(crate) fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(truthy(deserializer)?.unwrap_or(false))
}
