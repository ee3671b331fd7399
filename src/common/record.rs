//! Records stored under a key, locally and on the wire.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::common::Id;

/// Lifetime assumed for values stored with `life_hours == 0`.
pub const DEFAULT_LIFE_HOURS: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A value the local node wants stored under a key.
pub struct Record {
    pub key: Id,
    pub value: Bytes,
    pub flags: u16,
    pub life_hours: u8,
    /// Extra replicas wanted beyond the K closest nodes.
    pub replication_control: u8,
    /// `true` when the local node is the authoritative owner of this value.
    pub original: bool,
    pub high_priority: bool,
}

impl Record {
    pub fn new(key: Id, value: Bytes) -> Self {
        Self {
            key,
            value,
            flags: 0,
            life_hours: 0,
            replication_control: 0,
            original: true,
            high_priority: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A value as it travels in STORE and FIND_VALUE messages and sits in a database.
pub struct TransportValue {
    #[serde(rename = "v")]
    pub value: Bytes,
    #[serde(rename = "f")]
    pub flags: u16,
    #[serde(rename = "l")]
    pub life_hours: u8,
    #[serde(rename = "r")]
    pub replication_control: u8,
    /// Id of the node that originally published this value.
    #[serde(rename = "o")]
    pub originator: Id,
    /// Unix seconds at which the originator (re)published this value.
    #[serde(rename = "t")]
    pub created: u64,
}

impl TransportValue {
    /// Value published by `originator` now.
    pub fn from_record(record: &Record, originator: Id) -> Self {
        Self {
            value: record.value.clone(),
            flags: record.flags,
            life_hours: record.life_hours,
            replication_control: record.replication_control,
            originator,
            created: unix_now(),
        }
    }

    pub fn life_time(&self) -> Duration {
        let hours = if self.life_hours == 0 {
            DEFAULT_LIFE_HOURS
        } else {
            self.life_hours
        };

        Duration::from_secs(hours as u64 * 60 * 60)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A value held in the local database.
pub struct StoredValue {
    pub value: TransportValue,
    /// `true` if the local node published it, `false` for cached copies and
    /// replicas stored on behalf of others.
    pub original: bool,
    /// Unix seconds at which this copy was stored locally.
    pub stored_at: u64,
}

impl StoredValue {
    pub fn new(value: TransportValue, original: bool) -> Self {
        Self {
            value,
            original,
            stored_at: unix_now(),
        }
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        now.saturating_sub(self.stored_at) >= self.value.life_time().as_secs()
    }

    /// Rebuild the record to republish this value.
    pub fn to_record(&self, key: Id) -> Record {
        Record {
            key,
            value: self.value.value.clone(),
            flags: self.value.flags,
            life_hours: self.value.life_hours,
            replication_control: self.value.replication_control,
            original: self.original,
            high_priority: false,
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}
