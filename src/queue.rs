// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Options
//!
//! This module provides the types describing how a job queue is declared on
//! the broker. `QueueOptions` is the fully resolved set of options for one
//! queue name, `QueueRule` is the partial set of options a configuration rule
//! may override, and `QueueDeclaration` is what gets sent to the broker.

use crate::config::{flag, truthy};
use lapin::{options::QueueDeclareOptions, types::FieldTable};
use serde::Deserialize;

/// Name of the queue used when an operation does not name one.
pub const DEFAULT_QUEUE_NAME: &str = "default";

/// Resolved options of a queue.
///
/// When deserialized this acts as the `queue_defaults` section of the
/// configuration: every field falls back to the built-in default.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub name: String,
    #[serde(deserialize_with = "flag")]
    pub durable: bool,
    #[serde(deserialize_with = "flag")]
    pub passive: bool,
    #[serde(deserialize_with = "flag")]
    pub exclusive: bool,
    #[serde(alias = "auto_delete", deserialize_with = "flag")]
    pub autodelete: bool,
    /// Exchange the queue is bound to. `None` or a blank name selects the
    /// default exchange.
    pub exchange: Option<String>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            name: DEFAULT_QUEUE_NAME.to_owned(),
            durable: true,
            passive: false,
            exclusive: false,
            autodelete: false,
            exchange: None,
        }
    }
}

impl QueueOptions {
    /// Returns the name of the bound exchange, or `None` for the default exchange.
    pub fn exchange_name(&self) -> Option<&str> {
        self.exchange
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    /// Overlays the options a rule sets on top of these ones.
    pub fn merge(mut self, rule: &QueueRule) -> Self {
        if let Some(durable) = rule.durable {
            self.durable = durable;
        }
        if let Some(passive) = rule.passive {
            self.passive = passive;
        }
        if let Some(exclusive) = rule.exclusive {
            self.exclusive = exclusive;
        }
        if let Some(autodelete) = rule.autodelete {
            self.autodelete = autodelete;
        }
        if rule.exchange.is_some() {
            self.exchange = rule.exchange.clone();
        }
        self
    }

    /// Derives the broker flags for this queue.
    pub fn declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.autodelete,
            nowait: false,
        }
    }

    /// Builds the declaration sent to the broker, without extra arguments.
    pub fn declaration(&self) -> QueueDeclaration {
        QueueDeclaration {
            name: self.name.clone(),
            options: self.declare_options(),
            arguments: FieldTable::default(),
        }
    }
}

/// Partial queue options carried by a configuration rule.
///
/// Fields left unset inherit from the queue defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QueueRule {
    #[serde(default, deserialize_with = "truthy")]
    pub durable: Option<bool>,
    #[serde(default, deserialize_with = "truthy")]
    pub passive: Option<bool>,
    #[serde(default, deserialize_with = "truthy")]
    pub exclusive: Option<bool>,
    #[serde(default, alias = "auto_delete", deserialize_with = "truthy")]
    pub autodelete: Option<bool>,
    #[serde(default)]
    pub exchange: Option<String>,
}

impl QueueRule {
    pub fn new() -> Self {
        QueueRule::default()
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn passive(mut self, passive: bool) -> Self {
        self.passive = Some(passive);
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = Some(exclusive);
        self
    }

    pub fn autodelete(mut self, autodelete: bool) -> Self {
        self.autodelete = Some(autodelete);
        self
    }

    /// Binds matching queues to the named exchange.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = Some(exchange.to_owned());
        self
    }
}

/// A queue as it is declared on the broker.
#[derive(Debug, Clone)]
pub struct QueueDeclaration {
    pub name: String,
    pub options: QueueDeclareOptions,
    pub arguments: FieldTable,
}
