//! Core DHT logic - pure computation with no direct I/O.
//!
//! Contains query drivers (`iterative_query`, `put_query`), the `server` request
//! handler, and stateful helpers (`activity`, `maintenance`, `replication`, `statistics`).
//! All I/O orchestration lives in `control/`, which calls into this module.

pub mod activity;
pub(crate) mod iterative_query;
pub mod maintenance;
pub(crate) mod put_query;
pub mod replication;
pub mod server;
pub mod state;
pub(crate) mod statistics;
pub mod vivaldi;
