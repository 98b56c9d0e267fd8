// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Options
//!
//! This module provides the types describing the exchange a job queue is bound
//! to. Exchange types form a closed set, validated when the configuration is
//! loaded rather than when a message is published.

use crate::config::{flag, truthy};
use lapin::options::ExchangeDeclareOptions;
use serde::Deserialize;
use std::fmt;

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        };
        f.write_str(name)
    }
}

/// Resolved options of an exchange.
///
/// An empty `name` stands for the broker's default exchange, which is never
/// declared. When deserialized this acts as the `exchange_defaults` section of
/// the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ExchangeKind,
    #[serde(deserialize_with = "flag")]
    pub durable: bool,
    #[serde(deserialize_with = "flag")]
    pub passive: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        ExchangeOptions {
            name: String::new(),
            kind: ExchangeKind::Direct,
            durable: true,
            passive: false,
        }
    }
}

impl ExchangeOptions {
    /// Whether these options designate the default (unnamed) exchange.
    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }

    /// Overlays the options a rule sets on top of these ones.
    pub fn merge(mut self, rule: &ExchangeRule) -> Self {
        if let Some(kind) = rule.kind {
            self.kind = kind;
        }
        if let Some(durable) = rule.durable {
            self.durable = durable;
        }
        if let Some(passive) = rule.passive {
            self.passive = passive;
        }
        self
    }

    /// Derives the broker flags for this exchange.
    pub fn declare_options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            auto_delete: false,
            internal: false,
            nowait: false,
        }
    }

    pub fn declaration(&self) -> ExchangeDeclaration {
        ExchangeDeclaration {
            name: self.name.clone(),
            kind: self.kind,
            options: self.declare_options(),
        }
    }
}

/// Partial exchange options carried by a configuration rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExchangeRule {
    #[serde(default, rename = "type")]
    pub kind: Option<ExchangeKind>,
    #[serde(default, deserialize_with = "truthy")]
    pub durable: Option<bool>,
    #[serde(default, deserialize_with = "truthy")]
    pub passive: Option<bool>,
}

impl ExchangeRule {
    pub fn new() -> Self {
        ExchangeRule::default()
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn passive(mut self, passive: bool) -> Self {
        self.passive = Some(passive);
        self
    }
}

/// An exchange as it is declared on the broker.
#[derive(Debug, Clone)]
pub struct ExchangeDeclaration {
    pub name: String,
    pub kind: ExchangeKind,
    pub options: ExchangeDeclareOptions,
}
