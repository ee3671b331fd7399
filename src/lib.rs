#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
pub mod common;
pub mod control;
pub mod core;
pub mod database;
pub mod transport;

mod actor;
#[cfg(feature = "async")]
pub mod async_dht;
mod dht;
mod error;

pub use crate::common::{Contact, Id, Record, TransportValue};
pub use crate::control::{Config, GetRequest, GetResult, PutReport, PutRequest};
pub use crate::core::activity::{Activity, ActivityEvent, ActivityKind};
pub use bytes::Bytes;
pub use dht::{Dht, DhtBuilder, DhtOperationError, DhtWasShutdown, Testnet};
pub use error::DhtError;
