//! Control implementation - I/O orchestration layer for the DHT.

pub(crate) mod config;
mod info;
mod request;

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use flume::Sender;
use tracing::{debug, error, info, trace, warn};

use crate::common::{
    encode_key, obfuscated_key, Contact, ErrorSpecific, FindNodeRequestArguments,
    FindValueRequestArguments, Id, MessageType, Record, RemoveRequestArguments, RequestSpecific,
    ResponseSpecific, Router, RoutingTable, StoreRequestArguments, StoredValue, TransportValue,
};
use crate::core::activity::{Activity, ActivityEvent, ActivityId, ActivityKind, ActivityTracker};
use crate::core::iterative_query::{IterativeQuery, QuerySettings};
use crate::core::maintenance::Maintenance;
use crate::core::put_query::PutQuery;
use crate::core::replication::{
    cache_targets, distinct_values, prefer_low_latency, replication_targets, Diversification,
};
use crate::core::server::{RequestFilter, Server};
use crate::core::state::{export_contacts, import_contacts};
use crate::core::statistics::DhtStatistics;
use crate::core::vivaldi::VivaldiPosition;
use crate::database::{Database, MemoryDatabase};
use crate::transport::{Incoming, Transport};
use crate::DhtError;

pub use config::Config;
pub use info::Info;
pub use request::{GetRequest, GetResult, PutReport, PutRequest};

/// Handle of an operation started on a [Control], reported back in [TickReport::done].
pub type OperationId = u64;

/// Incoming messages handled per [Control::tick].
const MAX_MESSAGES_PER_TICK: usize = 64;

#[derive(Debug)]
/// The DHT control plane, called in the Dht thread loop, useful to create your own actor setup.
///
/// Owns the router, the database, the Vivaldi position and every running
/// operation. Nothing here blocks: operations are started by the public methods
/// and advanced by [Control::tick], which reports the ones that completed.
pub struct Control {
    config: Config,

    transport: Box<dyn Transport>,
    router: Box<dyn Router>,
    database: Box<dyn Database>,
    server: Server,

    position: VivaldiPosition,
    maintenance: Maintenance,
    statistics: DhtStatistics,
    diversification: Diversification,
    activities: ActivityTracker,

    next_operation_id: OperationId,
    operations: HashMap<OperationId, Operation>,
    /// Operations waiting for a free slot, next to start first.
    queue: VecDeque<OperationId>,
    seed_operation: Option<OperationId>,
    /// Completed since the last tick.
    done: Vec<(OperationId, OperationResult)>,

    seeded: bool,
    suspended: bool,
    sleeping: bool,
}

/// Results from a single [`Control::tick`] call.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Operations completed since the last tick, with their single result.
    pub done: Vec<(OperationId, OperationResult)>,
}

#[derive(Debug, Clone, PartialEq)]
/// The single result of an operation.
pub enum OperationResult {
    /// Closest contacts to the target, closest first.
    Lookup(Result<Vec<Contact>, DhtError>),
    Get(Result<GetResult, DhtError>),
    Put(Result<PutReport, DhtError>),
    Remove(Result<PutReport, DhtError>),
    /// Whether the contact answered.
    Verify(bool),
    /// Whether the node is now seeded.
    Seed(bool),
}

#[derive(Debug)]
enum Task {
    Lookup,
    Seed,
    /// Lookup of a random id to keep the router fresh.
    Poke,
    Get {
        flags: u16,
        max_values: usize,
        exhaustive: bool,
    },
    Put {
        values: Vec<TransportValue>,
        replicas: usize,
        republish: bool,
    },
    Remove,
    RemoveFrom {
        contacts: Vec<Contact>,
    },
    /// Store a value found by a get at the closest responders missing it.
    Cache {
        values: Vec<TransportValue>,
        contacts: Vec<Contact>,
    },
    Verify {
        contact: Contact,
        direct: bool,
    },
}

impl Task {
    fn activity_kind(&self) -> Option<ActivityKind> {
        match self {
            Task::Lookup | Task::Get { .. } => Some(ActivityKind::ExternalGet),
            Task::Seed | Task::Poke => Some(ActivityKind::InternalGet),
            Task::Put {
                republish: false, ..
            }
            | Task::Remove
            | Task::RemoveFrom { .. } => Some(ActivityKind::ExternalPut),
            Task::Put { republish: true, .. } | Task::Cache { .. } => {
                Some(ActivityKind::InternalPut)
            }
            Task::Verify { .. } => None,
        }
    }

    /// Failed before producing anything.
    fn failed(&self, error: DhtError) -> Outcome {
        match self {
            Task::Get { .. } => Outcome::Values(Err(error)),
            Task::Put { .. } | Task::Remove | Task::RemoveFrom { .. } | Task::Cache { .. } => {
                Outcome::Stored(Err(error))
            }
            Task::Verify { .. } => Outcome::Verified(false),
            Task::Lookup | Task::Seed | Task::Poke => Outcome::Contacts(Err(error)),
        }
    }
}

#[derive(Debug)]
enum Stage {
    Queued,
    Lookup(IterativeQuery),
    Store(PutQuery),
    Ping(u32),
}

#[derive(Debug)]
struct Operation {
    target: Id,
    task: Task,
    stage: Stage,
    activity: Option<ActivityId>,
    timeout: Duration,
    deadline: Instant,
    started: Instant,
}

#[derive(Debug)]
enum Outcome {
    Contacts(Result<Vec<Contact>, DhtError>),
    Values(Result<GetResult, DhtError>),
    Stored(Result<PutReport, DhtError>),
    Verified(bool),
}

impl Control {
    /// Creates a new Control over `transport`, with a [RoutingTable] and a
    /// [MemoryDatabase]. Does not perform network I/O; call [`Control::tick`].
    pub fn new(config: Config, transport: Box<dyn Transport>) -> Self {
        let local = transport.local_contact();

        info!(id = ?local.id(), address = ?local.address(), "DHT control plane started");

        Control {
            transport,
            router: Box::new(RoutingTable::with_bucket_size(*local.id(), config.k)),
            database: Box::new(MemoryDatabase::default()),
            server: Server::new(config.k),

            position: VivaldiPosition::default(),
            maintenance: Maintenance::new(
                config.original_republish_interval,
                config.cache_republish_interval,
                config.random_poke_interval,
            ),
            statistics: DhtStatistics::new(config.k),
            diversification: Diversification::new(),
            activities: ActivityTracker::new(),

            next_operation_id: 0,
            operations: HashMap::new(),
            queue: VecDeque::new(),
            seed_operation: None,
            done: Vec::new(),

            seeded: false,
            suspended: false,
            sleeping: false,

            config,
        }
    }

    /// Replace the default [RoutingTable].
    ///
    /// The router's local id has to be the transport's.
    pub fn with_router(mut self, router: Box<dyn Router>) -> Self {
        self.router = router;
        self
    }

    /// Replace the default [MemoryDatabase].
    pub fn with_database(mut self, database: Box<dyn Database>) -> Self {
        self.database = database;
        self
    }

    /// Filter incoming requests before answering them.
    pub fn with_request_filter(mut self, filter: Box<dyn RequestFilter>) -> Self {
        self.server = Server::new(self.config.k).with_filter(filter);
        self
    }

    // === Getters ===

    /// Returns the node's Id
    pub fn id(&self) -> Id {
        self.router.local_id()
    }

    /// Returns the address other nodes reach this node at.
    pub fn address(&self) -> std::net::SocketAddrV4 {
        self.transport.local_contact().address()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> &dyn Router {
        self.router.as_ref()
    }

    /// This node's Vivaldi coordinates.
    pub fn position(&self) -> &VivaldiPosition {
        &self.position
    }

    /// Returns true once a seed found at least one responding contact.
    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    /// Returns true if more than one distinct value was seen under `key`.
    pub fn is_diversified(&self, key: &[u8]) -> bool {
        encode_key(key, self.config.encode_keys)
            .map(|key| self.diversification.is_diversified(&key))
            .unwrap_or(false)
    }

    /// Returns:
    ///  1. Normal Dht size estimate based on the closest responders of lookups.
    ///  2. Standard deviaiton as a function of the number of samples used in this estimate.
    pub fn dht_size_estimate(&self) -> (usize, f64) {
        self.statistics.dht_size_estimate()
    }

    /// Operations started and not yet completed.
    pub fn active_operations(&self) -> usize {
        self.operations.len() - self.queue.len()
    }

    /// Operations waiting for a free slot.
    pub fn queued_operations(&self) -> usize {
        self.queue.len()
    }

    /// Returns a thread safe and lightweight summary of this node's
    /// information and statistics.
    pub fn info(&self) -> Info {
        Info::from(self)
    }

    /// Every contact in the router.
    pub fn contacts(&self) -> Vec<Contact> {
        self.router.contacts()
    }

    /// Owned copies of every live activity.
    pub fn activities(&self) -> Vec<Activity> {
        self.activities.snapshot()
    }

    /// The value the local node published under `key`, if any.
    pub fn local_value(&mut self, key: &[u8]) -> Option<Record> {
        let key = encode_key(key, self.config.encode_keys).ok()?;

        self.database
            .local(&key)
            .map(|stored| stored.to_record(key))
    }

    /// Every value in the local database, by key.
    pub fn stored_values(&mut self) -> Vec<(Id, Vec<StoredValue>)> {
        self.database
            .keys()
            .into_iter()
            .map(|key| {
                let values = self.database.get(&key, 0);
                (key, values)
            })
            .collect()
    }

    // === Public Methods ===

    /// Advances incoming messages, running operations and scheduled maintenance by one step.
    ///
    /// Call periodically; delays degrade query completion and routing table quality.
    pub fn tick(&mut self) -> TickReport {
        self.handle_messages();

        self.tick_operations();

        self.periodic_maintenance();

        self.start_queued();

        TickReport {
            done: std::mem::take(&mut self.done),
        }
    }

    /// Populate the router with a lookup of the local id, visiting the bootstrap nodes.
    ///
    /// Returns None if already seeded, otherwise the id of the (possibly already
    /// running) seed operation.
    pub fn seed(&mut self) -> Option<OperationId> {
        if self.seeded {
            return None;
        }

        if let Some(id) = self.seed_operation {
            return Some(id);
        }

        let target = self.id();
        let id = self.enqueue(target, Task::Seed, "Seed", self.config.operation_timeout, true);
        self.seed_operation = Some(id);
        self.start_queued();

        Some(id)
    }

    /// Find the closest contacts to `target`.
    pub fn lookup(&mut self, target: Id, description: &str, timeout: Option<Duration>) -> OperationId {
        let timeout = timeout.unwrap_or(self.config.operation_timeout);

        let id = self.enqueue(target, Task::Lookup, description, timeout, false);
        self.start_queued();

        id
    }

    /// Find the closest contacts to the obfuscated form of an encoded `key`, so
    /// the lookup lands near the key without revealing it.
    pub fn lookup_encoded(
        &mut self,
        key: &[u8],
        description: &str,
        timeout: Option<Duration>,
    ) -> Result<OperationId, DhtError> {
        let target = obfuscated_key(&encode_key(key, self.config.encode_keys)?);

        Ok(self.lookup(target, description, timeout))
    }

    /// Find the values stored under a key.
    pub fn get(&mut self, request: GetRequest) -> Result<OperationId, DhtError> {
        let key = encode_key(&request.key, self.config.encode_keys)?;

        let id = self.enqueue(
            key,
            Task::Get {
                flags: request.flags,
                max_values: request.max_values as usize,
                exhaustive: request.exhaustive,
            },
            &request.description,
            request.timeout.unwrap_or(self.config.operation_timeout),
            request.high_priority,
        );
        self.start_queued();

        Ok(id)
    }

    /// Store a value locally as original, schedule its republish, and store it
    /// at the K (plus `replication_control`) closest contacts.
    ///
    /// An empty value is refused, removal goes through [Control::remove].
    pub fn put(&mut self, request: PutRequest) -> Result<OperationId, DhtError> {
        let key = encode_key(&request.key, self.config.encode_keys)?;

        if request.value.is_empty() {
            return Err(DhtError::EncodeFailure("empty value".to_string()));
        }

        let record = Record {
            key,
            value: request.value,
            flags: request.flags,
            life_hours: request.life_hours,
            replication_control: request.replication_control,
            original: true,
            high_priority: request.high_priority,
        };
        let value = TransportValue::from_record(&record, self.id());

        self.database
            .store(key, StoredValue::new(value.clone(), true));
        self.maintenance.schedule_original(key);

        let id = self.enqueue(
            key,
            Task::Put {
                values: vec![value],
                replicas: self.config.k + record.replication_control as usize,
                republish: false,
            },
            &request.description,
            self.config.operation_timeout,
            record.high_priority,
        );
        self.start_queued();

        Ok(id)
    }

    /// Remove the local value under `key`, and ask the closest contacts to drop it.
    pub fn remove(&mut self, key: &[u8], description: &str) -> Result<OperationId, DhtError> {
        let key = encode_key(key, self.config.encode_keys)?;

        self.forget_local(&key);

        let id = self.enqueue(key, Task::Remove, description, self.config.operation_timeout, false);
        self.start_queued();

        Ok(id)
    }

    /// Remove the local value under `key`, and ask exactly `contacts` to drop it.
    pub fn remove_from(
        &mut self,
        contacts: Vec<Contact>,
        key: &[u8],
        description: &str,
    ) -> Result<OperationId, DhtError> {
        let key = encode_key(key, self.config.encode_keys)?;

        self.forget_local(&key);

        let id = self.enqueue(
            key,
            Task::RemoveFrom { contacts },
            description,
            self.config.operation_timeout,
            false,
        );
        self.start_queued();

        Ok(id)
    }

    /// Ping a contact, `direct` bypasses any relay the transport might use.
    ///
    /// Never queued.
    pub fn verify_contact(&mut self, contact: Contact, direct: bool) -> OperationId {
        let target = *contact.id();
        let id = self.enqueue(
            target,
            Task::Verify { contact, direct },
            "Verify",
            self.config.operation_timeout,
            true,
        );

        self.queue.retain(|queued| *queued != id);
        self.start_operation(id);

        id
    }

    /// While suspended no queued operation starts and no maintenance runs.
    pub fn set_suspended(&mut self, suspended: bool) {
        if self.suspended != suspended {
            info!(suspended, "DHT suspension changed");
        }

        self.suspended = suspended;
    }

    /// While sleeping fewer operations run at once and no random poke happens.
    pub fn set_sleeping(&mut self, sleeping: bool) {
        if self.sleeping != sleeping {
            info!(sleeping, "DHT sleeping changed");
        }

        self.sleeping = sleeping;
    }

    /// Subscribe to activity events, starting with every live activity.
    pub fn subscribe_activities(&mut self, sender: Sender<ActivityEvent>) {
        self.activities.subscribe(sender);
    }

    /// Serialize up to `max` router contacts, see [crate::core::state].
    pub fn export_state(&self, max: usize) -> Result<Vec<u8>, DhtError> {
        export_contacts(&self.id(), &self.router.contacts(), max)
    }

    /// Add every contact of exported state to the router, returns how many were added.
    ///
    /// Nothing is added if the state is corrupt.
    pub fn import_state(&mut self, bytes: &[u8]) -> Result<usize, DhtError> {
        let contacts = import_contacts(bytes)?;

        let added = contacts
            .into_iter()
            .filter(|contact| self.router.add(contact.clone()))
            .count();

        debug!(added, "Imported router state");

        Ok(added)
    }

    // === Private Methods ===

    fn forget_local(&mut self, key: &Id) {
        let local = self.id();

        self.database.remove(key, &local);
        self.maintenance.unschedule(key);
    }

    fn enqueue(
        &mut self,
        target: Id,
        task: Task,
        description: &str,
        timeout: Duration,
        high_priority: bool,
    ) -> OperationId {
        let id = self.next_operation_id;
        self.next_operation_id += 1;

        let activity = task.activity_kind().map(|kind| {
            self.activities.start(
                self.transport.local_contact(),
                target,
                description,
                kind,
                true,
            )
        });

        trace!(id, ?target, ?task, "Queued operation");

        let now = Instant::now();
        self.operations.insert(
            id,
            Operation {
                target,
                task,
                stage: Stage::Queued,
                activity,
                timeout,
                deadline: now + timeout,
                started: now,
            },
        );

        if high_priority {
            self.queue.push_front(id);
        } else {
            self.queue.push_back(id);
        }

        id
    }

    fn max_active_operations(&self) -> usize {
        if self.sleeping {
            self.config.sleeping_max_active_operations
        } else {
            self.config.max_active_operations
        }
    }

    /// Start queued operations while there are free slots.
    fn start_queued(&mut self) {
        if self.suspended {
            return;
        }

        while self.active_operations() < self.max_active_operations() {
            let Some(id) = self.queue.pop_front() else {
                break;
            };

            self.start_operation(id);
        }
    }

    fn start_operation(&mut self, id: OperationId) {
        let Some(mut operation) = self.operations.remove(&id) else {
            return;
        };

        if let Some(activity) = operation.activity {
            self.activities.set_queued(activity, false);
        }

        let now = Instant::now();
        operation.started = now;
        operation.deadline = now + operation.timeout;

        let started = match &operation.task {
            Task::Verify { contact, direct } => {
                let tid = if *direct {
                    self.transport
                        .request_direct(contact.address(), RequestSpecific::ping())
                } else {
                    self.transport
                        .request(contact.address(), RequestSpecific::ping())
                };

                Ok(Stage::Ping(tid))
            }
            Task::RemoveFrom { contacts } => {
                let contacts = contacts.clone();
                let request = RequestSpecific::Remove(RemoveRequestArguments {
                    key: operation.target,
                });

                self.start_store(&operation, &contacts, request)
            }
            Task::Cache { values, contacts } => {
                let contacts = contacts.clone();
                let request = RequestSpecific::Store(StoreRequestArguments {
                    key: operation.target,
                    values: values.clone(),
                });

                self.start_store(&operation, &contacts, request)
            }
            _ => self.start_lookup(&operation),
        };

        match started {
            Ok(stage) => {
                operation.stage = stage;
                self.operations.insert(id, operation);
            }
            Err(error) => {
                let outcome = operation.task.failed(error);
                self.complete(id, operation, outcome);
            }
        }
    }

    fn start_lookup(&mut self, operation: &Operation) -> Result<Stage, DhtError> {
        let target = operation.target;
        let k = self.config.k;

        let (request, accuracy, exhaustive, max_values) = match &operation.task {
            Task::Get {
                flags,
                max_values,
                exhaustive,
            } => (
                RequestSpecific::FindValue(FindValueRequestArguments {
                    key: target,
                    flags: *flags,
                    max_values: (*max_values).min(u8::MAX as usize) as u8,
                }),
                k,
                *exhaustive,
                *max_values,
            ),
            Task::Put { replicas, .. } => (
                RequestSpecific::FindNode(FindNodeRequestArguments { target }),
                *replicas,
                false,
                0,
            ),
            _ => (
                RequestSpecific::FindNode(FindNodeRequestArguments { target }),
                k,
                false,
                0,
            ),
        };

        let mut query = IterativeQuery::new(
            self.id(),
            target,
            request,
            QuerySettings {
                accuracy,
                lookup_concurrency: self.config.lookup_concurrency,
                search_concurrency: self.config.search_concurrency,
                exhaustive,
                max_values,
                prefer_low_latency: self.config.prefer_low_latency,
                deadline: operation.deadline,
            },
        );

        // Seed this query with the closest contacts we know about.
        for contact in self.router.closest_contacts(&target, accuracy, false) {
            query.add_candidate(contact, None);
        }

        // If we are seeding, or don't know anyone, call the bootstrapping nodes.
        if matches!(operation.task, Task::Seed) || query.candidates().is_empty() {
            for address in self.config.bootstrap.clone() {
                if address != self.address() {
                    query.visit(self.transport.as_mut(), address);
                }
            }
        }

        if query.candidates().is_empty() && !query.has_inflight() {
            debug!(?target, "No contacts to start a lookup from");
            return Err(DhtError::NoRoute(target));
        }

        let position = self.config.prefer_low_latency.then_some(&self.position);
        query.start(self.transport.as_mut(), position);

        if let Some(activity) = operation.activity {
            self.record_visits(activity, &mut query);
        }

        Ok(Stage::Lookup(query))
    }

    fn start_store(
        &mut self,
        operation: &Operation,
        contacts: &[Contact],
        request: RequestSpecific,
    ) -> Result<Stage, DhtError> {
        let mut query = PutQuery::new(operation.target, request);
        query.start(self.transport.as_mut(), contacts)?;

        if let Some(activity) = operation.activity {
            for contact in contacts {
                self.activities.add_node(activity, None, contact.clone());
            }
        }

        Ok(Stage::Store(query))
    }

    fn record_visits(&mut self, activity: ActivityId, query: &mut IterativeQuery) {
        for (parent, contact) in query.drain_visits() {
            self.activities
                .add_node(activity, parent.as_ref(), contact);
        }
    }

    // === tick() helpers ===

    /// Handle incoming messages, either requests or responses, until none is left.
    fn handle_messages(&mut self) {
        for _ in 0..MAX_MESSAGES_PER_TICK {
            let Some(incoming) = self.transport.recv() else {
                break;
            };

            match incoming {
                Incoming::Request {
                    from,
                    transaction_id,
                    request,
                } => self.handle_request(from, transaction_id, request),
                Incoming::Response {
                    from,
                    transaction_id,
                    response,
                    rtt,
                } => self.handle_response(from, transaction_id, response, rtt),
                Incoming::Error {
                    from,
                    transaction_id,
                    error,
                } => self.handle_error(from, transaction_id, error),
            }
        }
    }

    fn handle_request(&mut self, from: Contact, transaction_id: u32, request: RequestSpecific) {
        trace!(context = "request_received", ?from, ?request);

        match self.server.handle_request(
            self.router.as_ref(),
            self.database.as_mut(),
            &mut self.maintenance,
            &from,
            request,
        ) {
            Some(MessageType::Response(response)) => {
                self.transport
                    .respond(from.address(), transaction_id, response)
            }
            Some(MessageType::Error(error)) => {
                self.transport.error(from.address(), transaction_id, error)
            }
            _ => {}
        }

        // Learn about the requester, unverified until it answers us.
        self.router.add(from);
    }

    fn handle_response(
        &mut self,
        from: Contact,
        transaction_id: u32,
        response: ResponseSpecific,
        rtt: Duration,
    ) {
        self.router.mark_alive(&from);
        self.update_position(&from, rtt);

        let Some(id) = self.operation_for(transaction_id) else {
            trace!(context = "late_response", ?from, "Response matches no running operation");
            return;
        };

        let Some(operation) = self.operations.get_mut(&id) else {
            return;
        };

        match &mut operation.stage {
            Stage::Lookup(query) => query.response(transaction_id, &from, &response),
            Stage::Store(query) => query.response(transaction_id, &response),
            Stage::Ping(_) => {
                if let Some(operation) = self.operations.remove(&id) {
                    self.complete(id, operation, Outcome::Verified(true));
                }
            }
            Stage::Queued => {}
        }
    }

    fn handle_error(&mut self, from: Contact, transaction_id: u32, error: ErrorSpecific) {
        debug!(?from, ?error, "Received error response");

        let Some(id) = self.operation_for(transaction_id) else {
            return;
        };

        let Some(operation) = self.operations.get_mut(&id) else {
            return;
        };

        match &mut operation.stage {
            Stage::Lookup(query) => query.failure(transaction_id),
            Stage::Store(query) => query.error(transaction_id, &error),
            Stage::Ping(_) => {
                if let Some(operation) = self.operations.remove(&id) {
                    self.complete(id, operation, Outcome::Verified(false));
                }
            }
            Stage::Queued => {}
        }
    }

    /// Feed a measured RTT to the Vivaldi estimator, and share the new position.
    fn update_position(&mut self, from: &Contact, rtt: Duration) {
        let Some(peer) = from.position() else {
            return;
        };

        let rtt = rtt.as_secs_f32() * 1000.0;

        if self.position.update_with(rtt, peer) {
            self.transport.set_local_position(self.position);
        }
    }

    fn operation_for(&self, transaction_id: u32) -> Option<OperationId> {
        self.operations
            .iter()
            .find(|(_, operation)| match &operation.stage {
                Stage::Lookup(query) => query.inflight(transaction_id),
                Stage::Store(query) => query.inflight(transaction_id),
                Stage::Ping(tid) => *tid == transaction_id,
                Stage::Queued => false,
            })
            .map(|(id, _)| *id)
    }

    /// Advance all running operations, completing the done ones.
    fn tick_operations(&mut self) {
        let now = Instant::now();
        let ids: Vec<OperationId> = self.operations.keys().copied().collect();

        for id in ids {
            let Some(mut operation) = self.operations.remove(&id) else {
                continue;
            };

            match self.advance(&mut operation, now) {
                Some(outcome) => self.complete(id, operation, outcome),
                None => {
                    self.operations.insert(id, operation);
                }
            }
        }
    }

    /// Returns the outcome once the operation is done.
    fn advance(&mut self, operation: &mut Operation, now: Instant) -> Option<Outcome> {
        match &mut operation.stage {
            Stage::Queued => None,
            Stage::Lookup(query) => {
                let position = self.config.prefer_low_latency.then_some(&self.position);
                let done = query.tick(self.transport.as_mut(), position, now);

                for id in query.drain_failures() {
                    self.router.mark_failed(&id);
                }
                if let Some(activity) = operation.activity {
                    self.record_visits(activity, query);
                }

                if done {
                    self.lookup_done(operation)
                } else {
                    None
                }
            }
            Stage::Store(query) => {
                let done = query.tick(self.transport.as_ref());

                for id in query.drain_timeouts() {
                    self.router.mark_failed(&id);
                }

                if !done {
                    return None;
                }

                let report = PutReport {
                    key: operation.target,
                    stored_at: query.stored_at().to_vec(),
                    failed: query.failed().to_vec(),
                };

                Some(Outcome::Stored(query.result().map(|_| report)))
            }
            Stage::Ping(tid) => {
                if self.transport.inflight(*tid) {
                    return None;
                }

                if let Task::Verify { contact, .. } = &operation.task {
                    self.router.mark_failed(contact.id());
                }

                Some(Outcome::Verified(false))
            }
        }
    }

    /// A lookup converged: produce the result, or move on to storing.
    fn lookup_done(&mut self, operation: &mut Operation) -> Option<Outcome> {
        let Stage::Lookup(query) = &operation.stage else {
            return None;
        };

        let target = operation.target;
        let k = self.config.k;

        self.statistics
            .record_lookup(query.responders(), query.timed_out());

        if let Err(error) = query.result() {
            return Some(operation.task.failed(error));
        }

        let position = self.config.prefer_low_latency.then_some(self.position);

        let (contacts, request) = match &operation.task {
            Task::Lookup | Task::Seed | Task::Poke => {
                let mut closest: Vec<Contact> =
                    query.responders().contacts().iter().take(k).cloned().collect();

                if let Some(position) = &position {
                    prefer_low_latency(&mut closest, &target, position);
                }

                return Some(Outcome::Contacts(Ok(closest)));
            }
            Task::Get {
                max_values,
                exhaustive,
                ..
            } => {
                let mut values = distinct_values(query.values());
                let diversified =
                    self.diversification
                        .observe(target, values.len(), *exhaustive);

                if values.len() == 1 && self.config.cache_at_closest_n > 0 {
                    let contacts = cache_targets(
                        query.responders().contacts(),
                        query.holders(),
                        self.config.cache_at_closest_n,
                    );

                    if !contacts.is_empty() {
                        self.enqueue(
                            target,
                            Task::Cache {
                                values: values.clone(),
                                contacts,
                            },
                            "Cache",
                            self.config.operation_timeout,
                            false,
                        );
                    }
                }

                if *max_values > 0 {
                    values.truncate(*max_values);
                }

                debug!(?target, values = values.len(), diversified, "Get done");

                return Some(Outcome::Values(Ok(GetResult {
                    key: target,
                    values,
                    diversified,
                })));
            }
            Task::Put {
                values, replicas, ..
            } => (
                replication_targets(
                    query.responders().contacts(),
                    &target,
                    *replicas,
                    self.config.max_rep_per_node,
                    position.as_ref(),
                ),
                RequestSpecific::Store(StoreRequestArguments {
                    key: target,
                    values: values.clone(),
                }),
            ),
            Task::Remove => (
                replication_targets(
                    query.responders().contacts(),
                    &target,
                    k,
                    self.config.max_rep_per_node,
                    position.as_ref(),
                ),
                RequestSpecific::Remove(RemoveRequestArguments { key: target }),
            ),
            Task::RemoveFrom { .. } | Task::Cache { .. } | Task::Verify { .. } => return None,
        };

        match self.start_store(operation, &contacts, request) {
            Ok(stage) => {
                operation.stage = stage;
                None
            }
            Err(error) => Some(operation.task.failed(error)),
        }
    }

    /// Finish an operation: close its activity and report its result.
    fn complete(&mut self, id: OperationId, operation: Operation, outcome: Outcome) {
        let elapsed = operation.started.elapsed().as_millis();

        if let Some(activity) = operation.activity {
            let state = match &outcome {
                Outcome::Values(Ok(result)) => {
                    format!("{} hits, time={}ms", result.values.len(), elapsed)
                }
                Outcome::Contacts(Err(DhtError::Timeout))
                | Outcome::Values(Err(DhtError::Timeout))
                | Outcome::Stored(Err(DhtError::Timeout)) => "Timeout".to_string(),
                Outcome::Contacts(Err(error))
                | Outcome::Values(Err(error))
                | Outcome::Stored(Err(error)) => error.to_string(),
                _ => format!("time={}ms", elapsed),
            };

            self.activities.finish(activity, state);
        }

        let result = match (&operation.task, outcome) {
            (Task::Lookup, Outcome::Contacts(result)) => OperationResult::Lookup(result),
            (Task::Seed, Outcome::Contacts(result)) => {
                self.seed_operation = None;
                self.seeded = result.is_ok();
                self.log_seed();

                if self.seeded {
                    self.refresh_buckets();
                }

                OperationResult::Seed(self.seeded)
            }
            (Task::Get { .. }, Outcome::Values(result)) => OperationResult::Get(result),
            (
                Task::Put {
                    republish: false, ..
                },
                Outcome::Stored(result),
            ) => OperationResult::Put(result),
            (Task::Put { republish: true, .. }, Outcome::Stored(Err(error))) => {
                warn!(target = ?operation.target, ?error, "Republish failed");
                return;
            }
            (Task::Remove | Task::RemoveFrom { .. }, Outcome::Stored(result)) => {
                OperationResult::Remove(result)
            }
            (Task::Verify { .. }, Outcome::Verified(alive)) => OperationResult::Verify(alive),
            (task, outcome) => {
                trace!(?task, ?outcome, "Internal operation done");
                return;
            }
        };

        self.done.push((id, result));
    }

    fn log_seed(&self) {
        let table_size = self.router.size();

        if table_size == 0 {
            error!("Could not bootstrap the routing table");
        } else {
            debug!(id = ?self.id(), table_size, "Populated the routing table");
        }
    }

    /// Look up a random id in each bucket the seed lookup left unfilled.
    fn refresh_buckets(&mut self) {
        let targets = self.router.refresh_targets();

        debug!(buckets = targets.len(), "Refreshing routing table buckets");

        for target in targets {
            self.enqueue(
                target,
                Task::Poke,
                "Refresh bucket",
                self.config.operation_timeout,
                false,
            );
        }
    }

    /// Run republishes and random pokes that are due.
    fn periodic_maintenance(&mut self) {
        if self.suspended {
            return;
        }

        let decisions = self
            .maintenance
            .periodic_maintenance_decisions(self.seeded && !self.sleeping);

        if decisions.should_poke {
            self.enqueue(
                Id::random(),
                Task::Poke,
                "Random poke",
                self.config.operation_timeout,
                false,
            );
        }

        for key in decisions.originals_due {
            self.republish_original(key);
        }

        for key in decisions.caches_due {
            self.republish_cache(key);
        }
    }

    fn republish_original(&mut self, key: Id) {
        let Some(stored) = self.database.local(&key) else {
            self.maintenance.unschedule(&key);
            return;
        };

        debug!(?key, "Republishing original value");

        self.enqueue(
            key,
            Task::Put {
                replicas: self.config.k + stored.value.replication_control as usize,
                values: vec![stored.value],
                republish: true,
            },
            "Republish",
            self.config.operation_timeout,
            false,
        );
    }

    /// Republish cached values under `key`, or drop them once K contacts are
    /// closer to it than the local node.
    fn republish_cache(&mut self, key: Id) {
        let local = self.id();
        let k = self.config.k;

        let closer = self
            .router
            .closest_contacts(&key, k, false)
            .iter()
            .filter(|contact| {
                contact.id().compute_and_compare_distances(&local, &key) == Ordering::Less
            })
            .count();

        let cached: Vec<TransportValue> = self
            .database
            .get(&key, 0)
            .into_iter()
            .filter(|stored| !stored.original)
            .map(|stored| stored.value)
            .collect();

        if closer >= k {
            debug!(?key, dropped = cached.len(), "No longer among the closest, dropping cached values");

            for value in &cached {
                self.database.remove(&key, &value.originator);
            }
            self.maintenance.unschedule(&key);

            return;
        }

        if cached.is_empty() {
            self.maintenance.unschedule(&key);
            return;
        }

        self.enqueue(
            key,
            Task::Put {
                values: cached,
                replicas: k,
                republish: true,
            },
            "Republish cached",
            self.config.operation_timeout,
            false,
        );
    }
}
