//! In-process transport passing bencoded [Message]s over channels.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use tracing::{debug, trace};

use crate::common::{
    ContactInfo, ErrorSpecific, Id, Message, MessageType, RequestSpecific, ResponseSpecific,
};
use crate::core::vivaldi::VivaldiPosition;

use super::{Contact, Incoming, InflightRequests, Transport, DEFAULT_REQUEST_TIMEOUT};

const DEFAULT_PORT: u16 = 6881;
/// How long [MemoryTransport::recv] waits for a message.
const POLL_INTERVAL: Duration = Duration::from_millis(1);
/// Cleanup interval for expired inflight requests to avoid overhead on every recv
const INFLIGHT_CLEANUP_INTERVAL: Duration = Duration::from_millis(200);

type Datagram = (SocketAddrV4, Vec<u8>);

#[derive(Debug, Clone, Default)]
/// A simulated network of [MemoryTransport]s, each on its own IP address.
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

#[derive(Debug, Default)]
struct NetworkInner {
    next_host: u32,
    nodes: HashMap<SocketAddrV4, Sender<Datagram>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new node with a random [Id].
    pub fn transport(&self) -> MemoryTransport {
        self.transport_with_id(Id::random())
    }

    /// Attach a new node with the given [Id].
    pub fn transport_with_id(&self, id: Id) -> MemoryTransport {
        let (sender, receiver) = flume::unbounded();

        let address = match self.inner.lock() {
            Ok(mut inner) => {
                inner.next_host += 1;
                // 10.0.0.0/8, one host per node.
                let address = SocketAddrV4::new(
                    Ipv4Addr::from(0x0a00_0000 + inner.next_host),
                    DEFAULT_PORT,
                );
                inner.nodes.insert(address, sender);
                address
            }
            Err(_) => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        };

        MemoryTransport {
            id,
            address,
            network: self.clone(),
            receiver,
            inflight_requests: InflightRequests::new(DEFAULT_REQUEST_TIMEOUT),
            next_tid: 0,
            position: None,
            last_cleanup: Instant::now(),
        }
    }

    /// Stop delivering messages to `address`, as if the node went offline.
    pub fn disconnect(&self, address: &SocketAddrV4) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.nodes.remove(address);
        }
    }

    /// Number of attached nodes.
    pub fn size(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.nodes.len())
            .unwrap_or_default()
    }

    fn send(&self, from: SocketAddrV4, to: SocketAddrV4, bytes: Vec<u8>) {
        let sender = self
            .inner
            .lock()
            .ok()
            .and_then(|inner| inner.nodes.get(&to).cloned());

        match sender {
            Some(sender) => {
                let _ = sender.send((from, bytes));
            }
            None => trace!(?to, "Dropped message to unknown address"),
        }
    }
}

#[derive(Debug)]
/// A [Transport] attached to a [MemoryNetwork].
pub struct MemoryTransport {
    id: Id,
    address: SocketAddrV4,
    network: MemoryNetwork,
    receiver: Receiver<Datagram>,
    inflight_requests: InflightRequests,
    next_tid: u32,
    position: Option<VivaldiPosition>,
    last_cleanup: Instant,
}

impl MemoryTransport {
    /// Override [DEFAULT_REQUEST_TIMEOUT].
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.inflight_requests = InflightRequests::new(timeout);
        self
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    /// Increments self.next_tid and returns the previous value.
    fn tid(&mut self) -> u32 {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        tid
    }

    fn send(&mut self, to: SocketAddrV4, transaction_id: u32, message_type: MessageType) {
        let message = Message {
            transaction_id,
            sender: ContactInfo {
                id: self.id,
                ip: (*self.address.ip()).into(),
                port: self.address.port(),
            },
            position: self.position.map(|position| position.to_bytes().to_vec()),
            message_type,
        };

        trace!(context = "socket_message_sending", ?message);

        match message.to_bytes() {
            Ok(bytes) => self.network.send(self.address, to, bytes),
            Err(error) => debug!(?error, "Error encoding message"),
        }
    }
}

impl Transport for MemoryTransport {
    fn local_contact(&self) -> Contact {
        Contact::new(self.id, self.address).with_position(self.position)
    }

    fn request(&mut self, to: SocketAddrV4, request: RequestSpecific) -> u32 {
        let tid = self.tid();
        self.inflight_requests.add(tid, to);
        self.send(to, tid, MessageType::Request(request));
        tid
    }

    fn respond(&mut self, to: SocketAddrV4, transaction_id: u32, response: ResponseSpecific) {
        self.send(to, transaction_id, MessageType::Response(response));
    }

    fn error(&mut self, to: SocketAddrV4, transaction_id: u32, error: ErrorSpecific) {
        self.send(to, transaction_id, MessageType::Error(error));
    }

    fn recv(&mut self) -> Option<Incoming> {
        if self.last_cleanup.elapsed() > INFLIGHT_CLEANUP_INTERVAL {
            self.last_cleanup = Instant::now();
            self.inflight_requests.cleanup();
        }

        let (from, bytes) = self.receiver.recv_timeout(POLL_INTERVAL).ok()?;

        let message = match Message::from_bytes(&bytes) {
            Ok(message) => message,
            Err(error) => {
                trace!(context = "socket_error", ?error, ?from, "Received invalid message");
                return None;
            }
        };

        // Trust the address the message came from, not the one it claims.
        let contact = Contact::new(message.sender.id, from).with_position(
            message
                .position
                .as_deref()
                .and_then(VivaldiPosition::from_bytes),
        );
        let transaction_id = message.transaction_id;

        match message.message_type {
            MessageType::Request(request) => Some(Incoming::Request {
                from: contact,
                transaction_id,
                request,
            }),
            MessageType::Response(response) => {
                let rtt = self.inflight_requests.remove(transaction_id, &from)?;

                Some(Incoming::Response {
                    from: contact,
                    transaction_id,
                    response,
                    rtt,
                })
            }
            MessageType::Error(error) => {
                self.inflight_requests.remove(transaction_id, &from)?;

                Some(Incoming::Error {
                    from: contact,
                    transaction_id,
                    error,
                })
            }
        }
    }

    fn inflight(&self, transaction_id: u32) -> bool {
        self.inflight_requests.contains(transaction_id)
    }

    fn set_local_position(&mut self, position: VivaldiPosition) {
        self.position = Some(position);
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.disconnect(&self.address);
    }
}
