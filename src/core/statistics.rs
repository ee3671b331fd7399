//! DHT statistics and size estimation.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::common::{ClosestContacts, Id};

const MAX_CACHED_ESTIMATES: usize = 1000;

/// Statistics about the DHT network
#[derive(Debug)]
pub struct DhtStatistics {
    k: usize,

    /// Sum of DHT size estimates from all cached lookups
    dht_size_estimates_sum: f64,

    /// Size estimate per lookup target
    estimates: LruCache<Id, f64>,

    lookups: u64,
    timeouts: u64,
}

impl DhtStatistics {
    /// Create new DHT statistics tracker, estimating from the `k` closest responders.
    pub fn new(k: usize) -> Self {
        DhtStatistics {
            k,
            dht_size_estimates_sum: 0.0,
            estimates: LruCache::new(
                NonZeroUsize::new(MAX_CACHED_ESTIMATES).unwrap_or(NonZeroUsize::MIN),
            ),
            lookups: 0,
            timeouts: 0,
        }
    }

    /// Get DHT size estimate based on all lookups, and its standard deviation.
    pub fn dht_size_estimate(&self) -> (usize, f64) {
        let sample_count = self.estimates.len();
        if sample_count == 0 {
            return (0, 0.0);
        }

        let normal = self.dht_size_estimates_sum as usize / sample_count;

        // Standard deviation calculation
        let std_dev = 0.281 * (sample_count as f64).powf(-0.529);

        (normal, std_dev)
    }

    /// Completed lookups, and how many of them timed out.
    pub fn lookups(&self) -> (u64, u64) {
        (self.lookups, self.timeouts)
    }

    /// Record a completed lookup and its closest responders.
    pub fn record_lookup(&mut self, responders: &ClosestContacts, timed_out: bool) {
        self.lookups += 1;
        if timed_out {
            self.timeouts += 1;
        }

        if responders.is_empty() {
            // Node is offline
            return;
        }

        // Evict LRU if at capacity
        if self.estimates.len() >= MAX_CACHED_ESTIMATES {
            if let Some((_, old)) = self.estimates.pop_lru() {
                self.dht_size_estimates_sum -= old;
            }
        }

        let estimate = responders.dht_size_estimate(self.k) as f64;

        if let Some(old) = self.estimates.put(responders.target(), estimate) {
            self.dht_size_estimates_sum -= old;
        }

        self.dht_size_estimates_sum += estimate;
    }
}

#[cfg(test)]
mod tests {
    use crate::common::{ClosestContacts, Contact, Id};

    use super::{DhtStatistics, MAX_CACHED_ESTIMATES};

    #[test]
    fn dht_size_estimate_empty_is_zero() {
        let stats = DhtStatistics::new(20);
        assert_eq!(stats.dht_size_estimate(), (0, 0.0));
    }

    #[test]
    fn empty_responders_do_not_evict() {
        let mut stats = DhtStatistics::new(20);

        for i in 0..MAX_CACHED_ESTIMATES {
            let mut responders = ClosestContacts::new(Id::random());
            responders.add(Contact::unique(i + 1));
            stats.record_lookup(&responders, false);
        }

        let (_, std_dev_before) = stats.dht_size_estimate();

        stats.record_lookup(&ClosestContacts::new(Id::random()), true);

        let (_, std_dev_after) = stats.dht_size_estimate();
        assert!((std_dev_before - std_dev_after).abs() < f64::EPSILON);
        assert_eq!(stats.lookups(), (MAX_CACHED_ESTIMATES as u64 + 1, 1));
    }

    #[test]
    fn same_target_replaces_estimate() {
        let mut stats = DhtStatistics::new(20);
        let target = Id::random();

        let mut responders = ClosestContacts::new(target);
        responders.add(Contact::unique(1));

        stats.record_lookup(&responders, false);
        stats.record_lookup(&responders, false);

        assert_eq!(stats.dht_size_estimate().0, responders.dht_size_estimate(20));
    }
}
