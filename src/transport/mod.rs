//! Transport port: how the control plane talks to other nodes.
//!
//! The control plane only assumes eventual delivery or timeout. Framing,
//! retries and NAT traversal live behind this trait.

mod inflight_requests;
mod memory;
#[cfg(test)]
pub(crate) mod testing;

use std::fmt::Debug;
use std::net::SocketAddrV4;
use std::time::Duration;

use crate::common::{Contact, ErrorSpecific, RequestSpecific, ResponseSpecific};
use crate::core::vivaldi::VivaldiPosition;

pub use inflight_requests::{InflightRequest, InflightRequests};
pub use memory::{MemoryNetwork, MemoryTransport};

/// Default request timeout before abandoning an inflight request to a non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000); // 2 seconds

/// Request/response messaging with other nodes.
pub trait Transport: Send + Debug {
    /// The local node as other nodes see it.
    fn local_contact(&self) -> Contact;

    /// Send a request and return its transaction id.
    fn request(&mut self, to: SocketAddrV4, request: RequestSpecific) -> u32;

    /// Send a request straight to `to`, bypassing any relay or NAT helper.
    fn request_direct(&mut self, to: SocketAddrV4, request: RequestSpecific) -> u32 {
        self.request(to, request)
    }

    /// Answer a request received with `transaction_id`.
    fn respond(&mut self, to: SocketAddrV4, transaction_id: u32, response: ResponseSpecific);

    /// Answer a request received with `transaction_id` with an error.
    fn error(&mut self, to: SocketAddrV4, transaction_id: u32, error: ErrorSpecific);

    /// Next incoming message, if any arrives within the transport's poll interval.
    ///
    /// Responses and errors are only returned for requests that are still inflight.
    fn recv(&mut self) -> Option<Incoming>;

    /// Returns true while a request is awaiting its response and not timed out.
    fn inflight(&self, transaction_id: u32) -> bool;

    /// Position attached to every outgoing message.
    fn set_local_position(&mut self, _position: VivaldiPosition) {}
}

#[derive(Debug, Clone)]
/// A message received from another node.
pub enum Incoming {
    Request {
        from: Contact,
        transaction_id: u32,
        request: RequestSpecific,
    },
    Response {
        /// The responder, carrying its Vivaldi position if it sent one.
        from: Contact,
        transaction_id: u32,
        response: ResponseSpecific,
        /// Time between sending the request and receiving this response.
        rtt: Duration,
    },
    Error {
        from: Contact,
        transaction_id: u32,
        error: ErrorSpecific,
    },
}

impl Incoming {
    pub fn from(&self) -> &Contact {
        match self {
            Incoming::Request { from, .. } => from,
            Incoming::Response { from, .. } => from,
            Incoming::Error { from, .. } => from,
        }
    }
}
