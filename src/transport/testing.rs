//! Deterministic transport and overlay for unit tests.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;

use crate::common::{
    Contact, ContactInfo, ErrorSpecific, FindNodeResponseArguments, FindValueResponseArguments,
    Id, PingArguments, RemoveResponseArguments, RequestSpecific, ResponseSpecific,
    StoreResponseArguments, TransportValue,
};

use super::{Incoming, Transport};

#[derive(Debug)]
/// A [Transport] that records what it sends and lets the test decide what comes back.
pub(crate) struct ScriptedTransport {
    local: Contact,
    next_tid: u32,
    sent: Vec<(u32, SocketAddrV4, RequestSpecific)>,
    inflight: HashSet<u32>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            local: Contact::unique(60_000),
            next_tid: 0,
            sent: Vec::new(),
            inflight: HashSet::new(),
        }
    }

    pub fn local_id(&self) -> &Id {
        self.local.id()
    }

    /// Requests sent since the last call.
    pub fn take_sent(&mut self) -> Vec<(u32, SocketAddrV4, RequestSpecific)> {
        std::mem::take(&mut self.sent)
    }

    /// The request got its response.
    pub fn complete(&mut self, tid: u32) {
        self.inflight.remove(&tid);
    }

    /// The request timed out.
    pub fn expire(&mut self, tid: u32) {
        self.inflight.remove(&tid);
    }
}

impl Transport for ScriptedTransport {
    fn local_contact(&self) -> Contact {
        self.local.clone()
    }

    fn request(&mut self, to: SocketAddrV4, request: RequestSpecific) -> u32 {
        let tid = self.next_tid;
        self.next_tid += 1;

        self.inflight.insert(tid);
        self.sent.push((tid, to, request));

        tid
    }

    fn respond(&mut self, _to: SocketAddrV4, _transaction_id: u32, _response: ResponseSpecific) {}

    fn error(&mut self, _to: SocketAddrV4, _transaction_id: u32, _error: ErrorSpecific) {}

    fn recv(&mut self) -> Option<Incoming> {
        None
    }

    fn inflight(&self, transaction_id: u32) -> bool {
        self.inflight.contains(&transaction_id)
    }
}

#[derive(Debug)]
/// A simulated set of remote nodes answering requests synchronously.
pub(crate) struct Overlay {
    contacts: Vec<Contact>,
    by_address: HashMap<SocketAddrV4, usize>,
    values: HashMap<Id, HashMap<Id, Vec<TransportValue>>>,
    offline: HashSet<Id>,
}

impl Overlay {
    pub fn new(size: usize) -> Self {
        let contacts: Vec<Contact> = (1..=size).map(Contact::unique).collect();
        let by_address = contacts
            .iter()
            .enumerate()
            .map(|(i, contact)| (contact.address(), i))
            .collect();

        Self {
            contacts,
            by_address,
            values: HashMap::new(),
            offline: HashSet::new(),
        }
    }

    pub fn random_contacts(&self, n: usize) -> Vec<Contact> {
        self.contacts.iter().take(n).cloned().collect()
    }

    pub fn closest(&self, target: &Id, n: usize) -> Vec<Contact> {
        let mut contacts = self.contacts.clone();
        contacts.sort_by(|a, b| a.id().compute_and_compare_distances(b.id(), target));
        contacts.truncate(n);
        contacts
    }

    pub fn disconnect(&mut self, id: &Id) {
        self.offline.insert(*id);
    }

    pub fn store(&mut self, node: &Id, key: Id, value: TransportValue) {
        self.values
            .entry(*node)
            .or_default()
            .entry(key)
            .or_default()
            .push(value);
    }

    /// What the node at `to` answers, None if it is offline or unknown.
    pub fn answer(
        &self,
        to: &SocketAddrV4,
        request: &RequestSpecific,
    ) -> Option<(Contact, ResponseSpecific)> {
        let node = self.contacts.get(*self.by_address.get(to)?)?;

        if self.offline.contains(node.id()) {
            return None;
        }

        let closest = |target: &Id| {
            self.closest(target, 20)
                .iter()
                .map(ContactInfo::from)
                .collect::<Vec<_>>()
        };

        let response = match request {
            RequestSpecific::Ping(_) => ResponseSpecific::Ping(PingArguments {}),
            RequestSpecific::FindNode(args) => {
                ResponseSpecific::FindNode(FindNodeResponseArguments {
                    contacts: closest(&args.target),
                })
            }
            RequestSpecific::FindValue(args) => {
                let values = self
                    .values
                    .get(node.id())
                    .and_then(|keys| keys.get(&args.key))
                    .cloned()
                    .unwrap_or_default();

                let contacts = if values.is_empty() {
                    closest(&args.key)
                } else {
                    Vec::new()
                };

                ResponseSpecific::FindValue(FindValueResponseArguments { values, contacts })
            }
            RequestSpecific::Store(args) => ResponseSpecific::Store(StoreResponseArguments {
                stored: args.values.len() as u32,
            }),
            RequestSpecific::Remove(_) => {
                ResponseSpecific::Remove(RemoveResponseArguments { removed: 1 })
            }
        };

        Some((node.clone(), response))
    }
}
