// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Resolution
//!
//! This module turns a queue name into the options its queue and exchange are
//! declared with. Configuration carries ordered rules mapping a name pattern
//! to partial options; the first rule whose pattern matches a name is merged
//! over the defaults, and later rules are never consulted.
//!
//! The main components are:
//! - `Rules`: an ordered list of compiled patterns and their partial options
//! - `TopologyResolver`: pure resolution of queue and exchange options
//! - Argument constants: RabbitMQ queue arguments used by deferred queues

use crate::{
    config::QueueConfig,
    errors::QueueError,
    exchange::{ExchangeOptions, ExchangeRule},
    queue::{QueueOptions, QueueRule},
};
use regex::Regex;
use serde::{
    de::{MapAccess, Visitor},
    Deserialize, Deserializer,
};
use std::{fmt, marker::PhantomData};
use tracing::error;

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_ARGS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_ARGS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify how long an unused queue lives
pub const AMQP_ARGS_EXPIRES: &str = "x-expires";

#[derive(Debug, Clone)]
struct Rule<T> {
    pattern: Regex,
    options: T,
}

/// Ordered mapping of name patterns to partial options.
///
/// Patterns are regular expressions searched in the name, so a pattern must
/// be anchored (`^orders$`) to match the whole name only.
#[derive(Debug, Clone)]
pub struct Rules<T> {
    rules: Vec<Rule<T>>,
}

impl<T> Default for Rules<T> {
    fn default() -> Self {
        Rules { rules: vec![] }
    }
}

impl<T> Rules<T> {
    pub fn new() -> Self {
        Rules::default()
    }

    /// Appends a rule. Rules are tried in the order they were added.
    pub fn rule(mut self, pattern: &str, options: T) -> Result<Self, QueueError> {
        let pattern = Regex::new(pattern).map_err(|err| {
            error!(error = err.to_string(), pattern, "invalid rule pattern");
            QueueError::ConfigurationError(err.to_string())
        })?;
        self.rules.push(Rule { pattern, options });
        Ok(self)
    }

    /// Returns the options of the first rule matching `name`.
    pub fn first_match(&self, name: &str) -> Option<&T> {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(name))
            .map(|rule| &rule.options)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

struct RulesVisitor<T> {
    marker: PhantomData<T>,
}

impl<'de, T> Visitor<'de> for RulesVisitor<T>
where
    T: Deserialize<'de>,
{
    type Value = Rules<T>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of name patterns to options")
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut rules = Rules::new();
        while let Some((pattern, options)) = map.next_entry::<String, T>()? {
            rules = rules
                .rule(&pattern, options)
                .map_err(serde::de::Error::custom)?;
        }
        Ok(rules)
    }
}

impl<'de, T> Deserialize<'de> for Rules<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(RulesVisitor {
            marker: PhantomData,
        })
    }
}

/// Resolves queue and exchange options from configured rules and defaults.
///
/// Resolution does no I/O and caches nothing: the same resolver and name
/// always produce the same options.
#[derive(Debug, Clone, Default)]
pub struct TopologyResolver {
    queues: Rules<QueueRule>,
    queue_defaults: QueueOptions,
    exchanges: Rules<ExchangeRule>,
    exchange_defaults: ExchangeOptions,
}

impl TopologyResolver {
    pub fn new(
        queues: Rules<QueueRule>,
        queue_defaults: QueueOptions,
        exchanges: Rules<ExchangeRule>,
        exchange_defaults: ExchangeOptions,
    ) -> Self {
        TopologyResolver {
            queues,
            queue_defaults,
            exchanges,
            exchange_defaults,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        TopologyResolver::new(
            config.queues.clone(),
            config.queue_defaults.clone(),
            config.exchanges.clone(),
            config.exchange_defaults.clone(),
        )
    }

    /// Name of the queue used when an operation names none.
    pub fn default_queue(&self) -> &str {
        &self.queue_defaults.name
    }

    /// Resolves the options of the named queue.
    pub fn resolve_queue(&self, name: &str) -> QueueOptions {
        let defaults = QueueOptions {
            name: name.to_owned(),
            ..self.queue_defaults.clone()
        };

        match self.queues.first_match(name) {
            Some(rule) => defaults.merge(rule),
            None => defaults,
        }
    }

    /// Resolves the options of the named exchange. An empty name resolves
    /// the default exchange.
    pub fn resolve_exchange(&self, name: &str) -> ExchangeOptions {
        let defaults = ExchangeOptions {
            name: name.to_owned(),
            ..self.exchange_defaults.clone()
        };

        match self.exchanges.first_match(name) {
            Some(rule) => defaults.merge(rule),
            None => defaults,
        }
    }

    /// Resolves the exchange a resolved queue publishes through.
    pub fn exchange_for_queue(&self, queue: &QueueOptions) -> ExchangeOptions {
        self.resolve_exchange(queue.exchange_name().unwrap_or_default())
    }
}
