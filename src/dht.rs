//! Dht node.

use std::net::SocketAddrV4;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, Sender};
use tracing::{debug, info};

use crate::actor::{Actor, ActorMessage, Stop};
use crate::common::{Contact, Id, Record, Router, StoredValue};
use crate::control::{Config, Control, GetRequest, GetResult, Info, PutReport, PutRequest};
use crate::core::activity::{Activity, ActivityEvent};
use crate::core::server::RequestFilter;
use crate::database::Database;
use crate::transport::{MemoryNetwork, MemoryTransport, Transport};
use crate::DhtError;

#[derive(Debug, Clone)]
/// DHT node handle, cheap to clone, every clone talks to the same node thread.
pub struct Dht(pub(crate) Sender<ActorMessage>);

#[derive(Debug, Default)]
/// A builder for [Dht] nodes.
pub struct DhtBuilder {
    config: Config,
    router: Option<Box<dyn Router>>,
    database: Option<Box<dyn Database>>,
    filter: Option<Box<dyn RequestFilter>>,
}

impl DhtBuilder {
    /// Set bootstrap nodes, see [Config::bootstrap].
    pub fn bootstrap(mut self, bootstrap: &[SocketAddrV4]) -> Self {
        self.config.bootstrap = bootstrap.to_vec();

        self
    }

    /// Add more bootstrap nodes to the list.
    pub fn extra_bootstrap(mut self, extra_bootstrap: &[SocketAddrV4]) -> Self {
        for address in extra_bootstrap {
            if !self.config.bootstrap.contains(address) {
                self.config.bootstrap.push(*address);
            }
        }

        self
    }

    /// Replication factor, see [Config::k].
    pub fn k(mut self, k: usize) -> Self {
        self.config.k = k;

        self
    }

    /// See [Config::encode_keys].
    pub fn encode_keys(mut self, encode_keys: bool) -> Self {
        self.config.encode_keys = encode_keys;

        self
    }

    /// See [Config::prefer_low_latency].
    pub fn prefer_low_latency(mut self, prefer_low_latency: bool) -> Self {
        self.config.prefer_low_latency = prefer_low_latency;

        self
    }

    /// Deadline of operations that don't set their own.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout = timeout;

        self
    }

    /// Operations running at once while awake and while sleeping.
    pub fn max_active_operations(mut self, awake: usize, sleeping: usize) -> Self {
        self.config.max_active_operations = awake;
        self.config.sleeping_max_active_operations = sleeping;

        self
    }

    /// Replace the whole [Config], keeping nothing set before.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;

        self
    }

    /// Use a custom [Router] instead of the default [crate::common::RoutingTable].
    pub fn router(mut self, router: Box<dyn Router>) -> Self {
        self.router = Some(router);

        self
    }

    /// Use a custom [Database] instead of the default [crate::database::MemoryDatabase].
    pub fn database(mut self, database: Box<dyn Database>) -> Self {
        self.database = Some(database);

        self
    }

    /// Filter incoming requests before they are answered.
    pub fn request_filter(mut self, filter: Box<dyn RequestFilter>) -> Self {
        self.filter = Some(filter);

        self
    }

    /// Create a Dht node over `transport` and spawn its thread.
    pub fn build(self, transport: impl Transport + 'static) -> Result<Dht, std::io::Error> {
        let mut control = Control::new(self.config, Box::new(transport));

        if let Some(router) = self.router {
            control = control.with_router(router);
        }
        if let Some(database) = self.database {
            control = control.with_database(database);
        }
        if let Some(filter) = self.filter {
            control = control.with_request_filter(filter);
        }

        Dht::spawn(control)
    }
}

impl Dht {
    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    /// Run an already configured [Control] on its own thread.
    pub fn spawn(control: Control) -> Result<Dht, std::io::Error> {
        let (sender, receiver) = flume::unbounded();

        thread::Builder::new()
            .name("dht-control".to_string())
            .spawn(move || run(control, receiver))?;

        Ok(Dht(sender))
    }

    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub fn info(&self) -> Result<Info, DhtWasShutdown> {
        self.request(ActorMessage::Info)?
            .recv()
            .map_err(|_| DhtWasShutdown)
    }

    /// Returns true once a seed found at least one responding contact.
    pub fn is_seeded(&self) -> Result<bool, DhtWasShutdown> {
        Ok(self.info()?.seeded())
    }

    /// Returns true if more than one distinct value was seen under `key`.
    pub fn is_diversified(&self, key: &[u8]) -> Result<bool, DhtWasShutdown> {
        let key = Bytes::copy_from_slice(key);

        self.request(|sender| ActorMessage::IsDiversified(key, sender))?
            .recv()
            .map_err(|_| DhtWasShutdown)
    }

    /// The value this node published under `key`, if any.
    pub fn local_value(&self, key: &[u8]) -> Result<Option<Record>, DhtWasShutdown> {
        let key = Bytes::copy_from_slice(key);

        self.request(|sender| ActorMessage::LocalValue(key, sender))?
            .recv()
            .map_err(|_| DhtWasShutdown)
    }

    /// Every value in this node's database, by key.
    pub fn stored_values(&self) -> Result<Vec<(Id, Vec<StoredValue>)>, DhtWasShutdown> {
        self.request(ActorMessage::StoredValues)?
            .recv()
            .map_err(|_| DhtWasShutdown)
    }

    /// Every contact in this node's router.
    pub fn contacts(&self) -> Result<Vec<Contact>, DhtWasShutdown> {
        self.request(ActorMessage::Contacts)?
            .recv()
            .map_err(|_| DhtWasShutdown)
    }

    /// Snapshot of the live activities.
    pub fn activities(&self) -> Result<Vec<Activity>, DhtWasShutdown> {
        self.request(ActorMessage::Activities)?
            .recv()
            .map_err(|_| DhtWasShutdown)
    }

    /// Receive [ActivityEvent]s, starting with an `Added` event for every live activity.
    ///
    /// Dropping the receiver unsubscribes.
    pub fn subscribe_activities(&self) -> Result<Receiver<ActivityEvent>, DhtWasShutdown> {
        let (sender, receiver) = flume::unbounded();

        self.0
            .send(ActorMessage::SubscribeActivities(sender))
            .map_err(|_| DhtWasShutdown)?;

        Ok(receiver)
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop, and wait for it to stop.
    pub fn shutdown(&self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv();
    }

    /// Populate the router through the bootstrap nodes.
    ///
    /// With `full_wait` blocks until seeding is done, otherwise just starts it.
    /// Returns whether the node is seeded.
    pub fn seed(&self, full_wait: bool) -> Result<bool, DhtWasShutdown> {
        self.request(|sender| ActorMessage::Seed(full_wait, sender))?
            .recv()
            .map_err(|_| DhtWasShutdown)
    }

    /// Find the closest contacts to `target`.
    pub fn lookup(
        &self,
        target: Id,
        description: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<Contact>, DhtOperationError> {
        let description = description.to_string();

        let receiver =
            self.request(|sender| ActorMessage::Lookup(target, description, timeout, sender))?;

        Ok(receiver.recv().map_err(|_| DhtWasShutdown)??)
    }

    /// Find the closest contacts to the obfuscated form of `key`.
    pub fn lookup_encoded(
        &self,
        key: &[u8],
        description: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<Contact>, DhtOperationError> {
        let key = Bytes::copy_from_slice(key);
        let description = description.to_string();

        let receiver = self.request(|sender| {
            ActorMessage::LookupEncoded(key, description, timeout, sender)
        })?;

        Ok(receiver.recv().map_err(|_| DhtWasShutdown)??)
    }

    /// Find the values stored under a key.
    pub fn get(&self, request: GetRequest) -> Result<GetResult, DhtOperationError> {
        let receiver = self.request(|sender| ActorMessage::Get(request, sender))?;

        Ok(receiver.recv().map_err(|_| DhtWasShutdown)??)
    }

    /// Publish a value, and keep republishing it until it is removed.
    pub fn put(&self, request: PutRequest) -> Result<PutReport, DhtOperationError> {
        let receiver = self.request(|sender| ActorMessage::Put(request, sender))?;

        Ok(receiver.recv().map_err(|_| DhtWasShutdown)??)
    }

    /// Stop publishing the value under `key`, and ask the closest contacts to drop it.
    pub fn remove(&self, key: &[u8], description: &str) -> Result<PutReport, DhtOperationError> {
        self.remove_inner(key, description, None)
    }

    /// Stop publishing the value under `key`, and ask exactly `contacts` to drop it.
    pub fn remove_from(
        &self,
        contacts: Vec<Contact>,
        key: &[u8],
        description: &str,
    ) -> Result<PutReport, DhtOperationError> {
        self.remove_inner(key, description, Some(contacts))
    }

    /// Ping a contact, returns true if it answered.
    pub fn verify_contact(&self, contact: Contact, direct: bool) -> Result<bool, DhtWasShutdown> {
        self.request(|sender| ActorMessage::Verify(contact, direct, sender))?
            .recv()
            .map_err(|_| DhtWasShutdown)
    }

    /// While suspended no queued operation starts and no maintenance runs.
    pub fn set_suspended(&self, suspended: bool) -> Result<(), DhtWasShutdown> {
        self.0
            .send(ActorMessage::SetSuspended(suspended))
            .map_err(|_| DhtWasShutdown)
    }

    /// While sleeping fewer operations run at once and no random poke happens.
    pub fn set_sleeping(&self, sleeping: bool) -> Result<(), DhtWasShutdown> {
        self.0
            .send(ActorMessage::SetSleeping(sleeping))
            .map_err(|_| DhtWasShutdown)
    }

    /// Serialize up to `max` router contacts, to be passed to [Dht::import_state] later.
    pub fn export_state(&self, max: usize) -> Result<Bytes, DhtOperationError> {
        let receiver = self.request(|sender| ActorMessage::ExportState(max, sender))?;

        Ok(receiver.recv().map_err(|_| DhtWasShutdown)??)
    }

    /// Add the contacts of an exported state to the router, returns how many were added.
    pub fn import_state(&self, bytes: &[u8]) -> Result<usize, DhtOperationError> {
        let bytes = Bytes::copy_from_slice(bytes);

        let receiver = self.request(|sender| ActorMessage::ImportState(bytes, sender))?;

        Ok(receiver.recv().map_err(|_| DhtWasShutdown)??)
    }

    // === Private Methods ===

    pub(crate) fn request<T>(
        &self,
        message: impl FnOnce(Sender<T>) -> ActorMessage,
    ) -> Result<Receiver<T>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<T>(1);

        self.0.send(message(sender)).map_err(|_| DhtWasShutdown)?;

        Ok(receiver)
    }

    fn remove_inner(
        &self,
        key: &[u8],
        description: &str,
        contacts: Option<Vec<Contact>>,
    ) -> Result<PutReport, DhtOperationError> {
        let key = Bytes::copy_from_slice(key);
        let description = description.to_string();

        let receiver =
            self.request(|sender| ActorMessage::Remove(key, description, contacts, sender))?;

        Ok(receiver.recv().map_err(|_| DhtWasShutdown)??)
    }
}

fn run(control: Control, receiver: Receiver<ActorMessage>) {
    let mut actor = Actor::new(control, receiver);

    let stop = loop {
        if let Err(stop) = actor.tick() {
            break stop;
        }
    };

    // Dropping the transport detaches the node before acknowledging.
    drop(actor);

    if let Stop::Shutdown(sender) = stop {
        info!("DHT node shutdown");
        let _ = sender.send(());
    }
}

/// Create a testnet of Dht nodes over an in-memory network to run tests against instead of a real network.
#[derive(Debug)]
pub struct Testnet {
    pub bootstrap: Vec<SocketAddrV4>,
    pub nodes: Vec<Dht>,
    network: MemoryNetwork,
}

impl Testnet {
    pub fn new(count: usize) -> Result<Testnet, std::io::Error> {
        let network = MemoryNetwork::new();

        let mut nodes: Vec<Dht> = vec![];
        let mut bootstrap = vec![];

        for i in 0..count {
            let transport = network.transport();

            if i == 0 {
                bootstrap.push(transport.address());
            }

            let node = Dht::builder().bootstrap(&bootstrap).build(transport)?;

            if i > 0 {
                node.seed(true).map_err(std::io::Error::other)?;
            }

            nodes.push(node);
        }

        // The first node had nobody to seed from until the others joined.
        for node in &nodes {
            if !node.is_seeded().map_err(std::io::Error::other)? {
                node.seed(true).map_err(std::io::Error::other)?;
            }
        }

        debug!(count, "Testnet ready");

        Ok(Self {
            bootstrap,
            nodes,
            network,
        })
    }

    /// A new transport on this testnet, to build more nodes with.
    pub fn transport(&self) -> MemoryTransport {
        self.network.transport()
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("The Dht was shutdown")]
/// The node thread is gone, either after [Dht::shutdown] or a panic.
pub struct DhtWasShutdown;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
/// Error returned by operations that run against the network.
pub enum DhtOperationError {
    #[error(transparent)]
    Dht(#[from] DhtError),

    #[error(transparent)]
    Shutdown(#[from] DhtWasShutdown),
}
