use std::net::SocketAddrV4;
use std::time::Duration;

use crate::common::MAX_BUCKET_SIZE_K;
use crate::core::maintenance::{
    CACHE_REPUBLISH_INTERVAL, ORIGINAL_REPUBLISH_INTERVAL, RANDOM_POKE_INTERVAL,
};
use crate::core::replication::{CACHE_AT_CLOSEST_N_DEFAULT, MAX_REP_PER_NODE_DEFAULT};

/// Results a FIND_VALUE accumulates before it may stop early.
pub const SEARCH_CONCURRENCY: usize = 5;
/// Contacts queried in parallel per lookup round.
pub const LOOKUP_CONCURRENCY: usize = 10;
/// Default deadline of an operation.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
/// Operations running at once, the rest wait in a queue.
pub const MAX_ACTIVE_OPERATIONS: usize = 16;
/// Operations running at once while sleeping.
pub const SLEEPING_MAX_ACTIVE_OPERATIONS: usize = 4;

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// Bootstrap nodes, visited by [crate::Dht::seed] alongside the router's contacts.
    ///
    /// Defaults to an empty list.
    pub bootstrap: Vec<SocketAddrV4>,
    /// Replication factor, and the number of closest contacts a lookup converges on.
    ///
    /// Defaults to [MAX_BUCKET_SIZE_K]
    pub k: usize,
    /// Defaults to [SEARCH_CONCURRENCY]
    pub search_concurrency: usize,
    /// Defaults to [LOOKUP_CONCURRENCY]
    pub lookup_concurrency: usize,
    /// Maximum replicas placed on a single IP address.
    ///
    /// Defaults to [MAX_REP_PER_NODE_DEFAULT]
    pub max_rep_per_node: usize,
    /// Closest responders without the value that receive a cached copy after a get.
    ///
    /// Defaults to [CACHE_AT_CLOSEST_N_DEFAULT]
    pub cache_at_closest_n: usize,
    /// Defaults to [ORIGINAL_REPUBLISH_INTERVAL]
    pub original_republish_interval: Duration,
    /// Defaults to [CACHE_REPUBLISH_INTERVAL]
    pub cache_republish_interval: Duration,
    /// Defaults to [RANDOM_POKE_INTERVAL]
    pub random_poke_interval: Duration,
    /// Deadline of operations that don't set their own.
    ///
    /// Defaults to [DEFAULT_OPERATION_TIMEOUT]
    pub operation_timeout: Duration,
    /// Defaults to [MAX_ACTIVE_OPERATIONS]
    pub max_active_operations: usize,
    /// Defaults to [SLEEPING_MAX_ACTIVE_OPERATIONS]
    pub sleeping_max_active_operations: usize,
    /// Hash user keys with SHA-1, otherwise keys must be exactly 20 bytes.
    ///
    /// Defaults to true
    pub encode_keys: bool,
    /// Use Vivaldi RTT estimates to order equally close contacts and to pick
    /// the first lookup round.
    ///
    /// Defaults to true
    pub prefer_low_latency: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            k: MAX_BUCKET_SIZE_K,
            search_concurrency: SEARCH_CONCURRENCY,
            lookup_concurrency: LOOKUP_CONCURRENCY,
            max_rep_per_node: MAX_REP_PER_NODE_DEFAULT,
            cache_at_closest_n: CACHE_AT_CLOSEST_N_DEFAULT,
            original_republish_interval: ORIGINAL_REPUBLISH_INTERVAL,
            cache_republish_interval: CACHE_REPUBLISH_INTERVAL,
            random_poke_interval: RANDOM_POKE_INTERVAL,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            max_active_operations: MAX_ACTIVE_OPERATIONS,
            sleeping_max_active_operations: SLEEPING_MAX_ACTIVE_OPERATIONS,
            encode_keys: true,
            prefer_low_latency: true,
        }
    }
}
