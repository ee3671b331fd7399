//! Periodic republish and random poke scheduling.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::common::Id;

/// Interval between republishes of values published by the local node.
pub const ORIGINAL_REPUBLISH_INTERVAL: Duration = Duration::from_secs(8 * 60 * 60);
/// Interval between republishes of values cached on behalf of other nodes.
pub const CACHE_REPUBLISH_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Interval between lookups of random ids keeping the routing table fresh.
pub const RANDOM_POKE_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy)]
struct Entry {
    original: bool,
    due: Instant,
}

/// Republish and random poke timers.
#[derive(Debug)]
pub struct Maintenance {
    original_interval: Duration,
    cache_interval: Duration,
    poke_interval: Duration,

    entries: HashMap<Id, Entry>,
    last_poke: Instant,
}

/// Decisions about periodic maintenance
#[derive(Debug, Default)]
pub struct MaintenanceDecisions {
    /// Whether to run a lookup on a random id.
    pub should_poke: bool,

    /// Keys of values published by the local node that are due for republish.
    pub originals_due: Vec<Id>,

    /// Keys of cached values that are due for republish.
    pub caches_due: Vec<Id>,
}

impl Maintenance {
    pub fn new(original_interval: Duration, cache_interval: Duration, poke_interval: Duration) -> Self {
        Maintenance {
            original_interval,
            cache_interval,
            poke_interval,

            entries: HashMap::new(),
            last_poke: Instant::now(),
        }
    }

    // === Getters ===

    pub fn is_scheduled(&self, key: &Id) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of scheduled keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    // === Public Methods ===

    /// Republish the locally published value under `key` every original interval.
    pub fn schedule_original(&mut self, key: Id) {
        self.schedule_original_at(Instant::now(), key)
    }

    /// Republish the values cached under `key` every cache interval.
    ///
    /// A key already scheduled as original stays original.
    pub fn schedule_cache(&mut self, key: Id) {
        self.schedule_cache_at(Instant::now(), key)
    }

    pub fn unschedule(&mut self, key: &Id) {
        self.entries.remove(key);
    }

    /// Determine what maintenance operations should be performed.
    ///
    /// Due keys are rescheduled one interval later, random pokes only happen
    /// while `poke_allowed`.
    pub fn periodic_maintenance_decisions(&mut self, poke_allowed: bool) -> MaintenanceDecisions {
        self.periodic_maintenance_decisions_at(Instant::now(), poke_allowed)
    }

    fn periodic_maintenance_decisions_at(
        &mut self,
        now: Instant,
        poke_allowed: bool,
    ) -> MaintenanceDecisions {
        let mut decisions = MaintenanceDecisions::default();

        if now.duration_since(self.last_poke) >= self.poke_interval {
            self.last_poke = now;
            decisions.should_poke = poke_allowed;
        }

        for (key, entry) in self.entries.iter_mut() {
            if entry.due > now {
                continue;
            }

            if entry.original {
                entry.due = now + self.original_interval;
                decisions.originals_due.push(*key);
            } else {
                entry.due = now + self.cache_interval;
                decisions.caches_due.push(*key);
            }
        }

        decisions
    }

    // === Private Methods ===

    fn schedule_original_at(&mut self, now: Instant, key: Id) {
        self.entries.insert(
            key,
            Entry {
                original: true,
                due: now + self.original_interval,
            },
        );
    }

    fn schedule_cache_at(&mut self, now: Instant, key: Id) {
        let due = now + self.cache_interval;

        self.entries.entry(key).or_insert(Entry {
            original: false,
            due,
        });
    }
}

impl Default for Maintenance {
    fn default() -> Self {
        Self::new(
            ORIGINAL_REPUBLISH_INTERVAL,
            CACHE_REPUBLISH_INTERVAL,
            RANDOM_POKE_INTERVAL,
        )
    }
}
