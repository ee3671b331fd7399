//! Arguments and results of user operations.

use std::time::Duration;

use bytes::Bytes;

use crate::common::{Contact, Id, TransportValue};

#[derive(Debug, Clone, PartialEq, Eq)]
/// Store a value under a key at the closest nodes.
pub struct PutRequest {
    pub key: Bytes,
    pub value: Bytes,
    /// Shown in [crate::Activity::description].
    pub description: String,
    pub flags: u16,
    /// Hours remote nodes keep the value, 0 for the default.
    pub life_hours: u8,
    /// Extra replicas beyond the K closest nodes.
    pub replication_control: u8,
    /// Jump the queue of waiting operations.
    pub high_priority: bool,
}

impl PutRequest {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            description: String::new(),
            flags: 0,
            life_hours: 0,
            replication_control: 0,
            high_priority: false,
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn life_hours(mut self, life_hours: u8) -> Self {
        self.life_hours = life_hours;
        self
    }

    pub fn replication_control(mut self, replication_control: u8) -> Self {
        self.replication_control = replication_control;
        self
    }

    pub fn high_priority(mut self, high_priority: bool) -> Self {
        self.high_priority = high_priority;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Find the values stored under a key.
pub struct GetRequest {
    pub key: Bytes,
    pub description: String,
    pub flags: u16,
    /// Stop once this many distinct values were found, 0 for no limit.
    pub max_values: u8,
    /// Overrides [crate::control::Config::operation_timeout].
    pub timeout: Option<Duration>,
    /// Query the whole closest frontier instead of stopping at the first values.
    pub exhaustive: bool,
    pub high_priority: bool,
}

impl GetRequest {
    pub fn new(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            description: String::new(),
            flags: 0,
            max_values: 0,
            timeout: None,
            exhaustive: false,
            high_priority: false,
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn max_values(mut self, max_values: u8) -> Self {
        self.max_values = max_values;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn exhaustive(mut self, exhaustive: bool) -> Self {
        self.exhaustive = exhaustive;
        self
    }

    pub fn high_priority(mut self, high_priority: bool) -> Self {
        self.high_priority = high_priority;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of a get.
pub struct GetResult {
    /// The encoded key.
    pub key: Id,
    /// Distinct values, in the order they were received.
    pub values: Vec<TransportValue>,
    /// More than one distinct value is known to live under this key.
    pub diversified: bool,
}

#[derive(Debug, Clone, PartialEq)]
/// Outcome of a put or remove: which contacts acknowledged it.
pub struct PutReport {
    /// The encoded key.
    pub key: Id,
    pub stored_at: Vec<Contact>,
    pub failed: Vec<Contact>,
}
