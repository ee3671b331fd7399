//! Manage iterative queries and their corresponding request/response.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;
use std::time::Instant;

use tracing::{debug, trace};

use crate::common::{
    ClosestContacts, Contact, FindNodeResponseArguments, FindValueResponseArguments, Id,
    RequestSpecific, ResponseSpecific, TransportValue,
};
use crate::core::replication::distinct_values;
use crate::core::vivaldi::VivaldiPosition;
use crate::transport::Transport;
use crate::DhtError;

#[derive(Debug, Clone)]
/// Knobs of a single [IterativeQuery].
pub struct QuerySettings {
    /// Number of closest contacts that must all have been queried to converge.
    pub accuracy: usize,
    /// Contacts queried in parallel per round.
    pub lookup_concurrency: usize,
    /// Useful results to accumulate before a FIND_VALUE stops early.
    pub search_concurrency: usize,
    /// Keep going to the full closest frontier even after enough values were found.
    pub exhaustive: bool,
    /// Stop a FIND_VALUE once this many distinct values were found, 0 for no limit.
    pub max_values: usize,
    /// Fill the first round with the lowest latency candidates.
    pub prefer_low_latency: bool,
    pub deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Rounds,
    Done,
}

/// An iterative process of concurrently sending a request to the closest known contacts
/// to the target, adding closer contacts discovered in the responses as candidates, and
/// repeating this process until no closer contacts (that aren't already queried) are found.
///
/// Each round queries up to `lookup_concurrency` unqueried candidates. When a round
/// ends without discovering a contact closer than the best one known when it
/// started, every unqueried contact among the `accuracy` closest is queried at once.
/// The query converges once all of the `accuracy` closest candidates responded or failed.
#[derive(Debug)]
pub(crate) struct IterativeQuery {
    pub request: RequestSpecific,
    target: Id,
    local_id: Id,
    settings: QuerySettings,

    /// Not yet failed contacts, closest first.
    candidates: ClosestContacts,
    /// Contacts that responded, closest first.
    responders: ClosestContacts,

    queried: HashSet<Id>,
    failed: HashSet<Id>,
    visited: HashSet<SocketAddrV4>,
    inflight_requests: HashMap<u32, (SocketAddrV4, Option<Id>)>,

    /// Which responder introduced each candidate.
    introduced_by: HashMap<Id, Id>,
    /// Contacts queried since the last [Self::drain_visits].
    visits: Vec<(Option<Id>, Contact)>,
    /// Contacts that failed since the last [Self::drain_failures].
    failures: Vec<Id>,

    values: Vec<TransportValue>,
    holders: HashSet<Id>,
    value_responses: usize,

    closest_at_round_start: Option<Id>,
    improved: bool,
    rounds: usize,
    timed_out: bool,
    phase: Phase,
}

impl IterativeQuery {
    pub fn new(local_id: Id, target: Id, request: RequestSpecific, settings: QuerySettings) -> Self {
        trace!(?target, ?request, "New Query");

        Self {
            request,
            target,
            local_id,
            settings,

            candidates: ClosestContacts::new(target),
            responders: ClosestContacts::new(target),

            queried: HashSet::new(),
            failed: HashSet::new(),
            visited: HashSet::new(),
            inflight_requests: HashMap::new(),

            introduced_by: HashMap::new(),
            visits: Vec::new(),
            failures: Vec::new(),

            values: Vec::new(),
            holders: HashSet::new(),
            value_responses: 0,

            closest_at_round_start: None,
            improved: false,
            rounds: 0,
            timed_out: false,
            phase: Phase::Rounds,
        }
    }

    // === Getters ===

    /// Closest contacts according to other contacts, failed ones excluded.
    pub fn candidates(&self) -> &ClosestContacts {
        &self.candidates
    }

    /// Return the closest responding contacts.
    pub fn responders(&self) -> &ClosestContacts {
        &self.responders
    }

    /// Every value received, in arrival order, duplicates included.
    pub fn values(&self) -> &[TransportValue] {
        &self.values
    }

    /// Ids of responders that returned at least one value.
    pub fn holders(&self) -> &HashSet<Id> {
        &self.holders
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn is_find_value(&self) -> bool {
        matches!(self.request, RequestSpecific::FindValue(_))
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Ok once at least one contact responded, [DhtError::Timeout] otherwise.
    pub fn result(&self) -> Result<(), DhtError> {
        if self.responders.is_empty() {
            Err(DhtError::Timeout)
        } else {
            Ok(())
        }
    }

    /// Return true if a response (by transaction_id) is expected by this query.
    pub fn inflight(&self, tid: u32) -> bool {
        self.inflight_requests.contains_key(&tid)
    }

    /// Any request still awaiting a response or failure.
    pub fn has_inflight(&self) -> bool {
        !self.inflight_requests.is_empty()
    }

    // === Public Methods ===

    /// Add a candidate contact to query if it is among the closest contacts.
    pub fn add_candidate(&mut self, contact: Contact, introduced_by: Option<Id>) {
        let id = *contact.id();

        if id == self.local_id || self.failed.contains(&id) {
            return;
        }

        if !self.candidates.add(contact) {
            return;
        }

        if let Some(parent) = introduced_by {
            self.introduced_by.entry(id).or_insert(parent);
        }

        let closer = match &self.closest_at_round_start {
            Some(best) => self.candidates.is_closer(&id, best),
            None => true,
        };

        if closer {
            self.improved = true;
        }
    }

    /// Visit an address whose node id is unknown, used for bootstrapping.
    pub fn visit(&mut self, transport: &mut dyn Transport, address: SocketAddrV4) {
        if !self.visited.insert(address) {
            return;
        }

        let tid = transport.request(address, self.request.clone());
        self.inflight_requests.insert(tid, (address, None));
    }

    /// Force start query traversal by querying the closest candidates.
    pub fn start(&mut self, transport: &mut dyn Transport, local: Option<&VivaldiPosition>) {
        self.round(transport, local, false);
    }

    /// Handle a response to one of this query's requests.
    pub fn response(&mut self, tid: u32, from: &Contact, response: &ResponseSpecific) {
        if self.inflight_requests.remove(&tid).is_none() {
            return;
        }

        let from_id = *from.id();

        debug!(target = ?self.target, ?from, "Query got response");

        self.queried.insert(from_id);
        self.candidates.add(from.clone());
        self.responders.add(from.clone());

        match response {
            ResponseSpecific::FindNode(FindNodeResponseArguments { contacts })
            | ResponseSpecific::FindValue(FindValueResponseArguments {
                values: _,
                contacts,
            }) => {
                for info in contacts {
                    self.add_candidate(Contact::from(info), Some(from_id));
                }
            }
            _ => {}
        }

        if let ResponseSpecific::FindValue(FindValueResponseArguments { values, .. }) = response {
            if !values.is_empty() {
                self.value_responses += 1;
                self.holders.insert(from_id);
                self.values.extend(values.iter().cloned());
            }
        }
    }

    /// A request failed, either with an error response or a timeout.
    pub fn failure(&mut self, tid: u32) {
        let Some((_, id)) = self.inflight_requests.remove(&tid) else {
            return;
        };

        if let Some(id) = id {
            self.candidates.remove(&id);
            self.failed.insert(id);
            self.failures.push(id);
        }
    }

    /// Contacts queried since the last call, with the responder that introduced them.
    pub fn drain_visits(&mut self) -> Vec<(Option<Id>, Contact)> {
        std::mem::take(&mut self.visits)
    }

    /// Ids of contacts that failed since the last call.
    pub fn drain_failures(&mut self) -> Vec<Id> {
        std::mem::take(&mut self.failures)
    }

    /// Advance the query: expire timed out requests, and start the next round
    /// once the current one is over.
    ///
    /// Returns true if it is done.
    pub fn tick(
        &mut self,
        transport: &mut dyn Transport,
        local: Option<&VivaldiPosition>,
        now: Instant,
    ) -> bool {
        if self.is_done() {
            return true;
        }

        let expired = self
            .inflight_requests
            .keys()
            .filter(|tid| !transport.inflight(**tid))
            .copied()
            .collect::<Vec<_>>();

        for tid in expired {
            self.failure(tid);
        }

        if self.found_enough() {
            debug!(target = ?self.target, values = self.values.len(), "Query found enough values");
            return self.finish();
        }

        if now >= self.settings.deadline {
            debug!(target = ?self.target, responders = self.responders.len(), "Query deadline passed");
            self.timed_out = true;
            return self.finish();
        }

        if !self.inflight_requests.is_empty() {
            return false;
        }

        if self.converged() {
            return self.finish();
        }

        // No closer contact in the last round, query all the remaining closest at once.
        let sweep = !self.improved;

        if self.round(transport, local, sweep) == 0 {
            return self.finish();
        }

        false
    }

    // === Private Methods ===

    fn finish(&mut self) -> bool {
        self.phase = Phase::Done;

        debug!(
            target = ?self.target,
            candidates = self.candidates.len(),
            queried = self.queried.len(),
            responders = self.responders.len(),
            rounds = self.rounds,
            "Done query"
        );

        true
    }

    /// All of the `accuracy` closest candidates were queried.
    fn converged(&self) -> bool {
        self.candidates
            .contacts()
            .iter()
            .take(self.settings.accuracy)
            .all(|contact| self.queried.contains(contact.id()))
    }

    fn found_enough(&self) -> bool {
        if self.settings.exhaustive || !self.is_find_value() || self.values.is_empty() {
            return false;
        }

        let distinct = distinct_values(&self.values).len();

        distinct >= self.settings.search_concurrency
            || (self.settings.max_values > 0 && distinct >= self.settings.max_values)
            || self.value_responses >= self.settings.search_concurrency
    }

    /// Send the next round of requests, returns how many were sent.
    fn round(
        &mut self,
        transport: &mut dyn Transport,
        local: Option<&VivaldiPosition>,
        sweep: bool,
    ) -> usize {
        self.closest_at_round_start = self.candidates.first().map(|contact| *contact.id());
        self.improved = false;
        self.rounds += 1;

        let to_query: Vec<Contact> = if sweep {
            self.candidates
                .contacts()
                .iter()
                .take(self.settings.accuracy)
                .filter(|contact| !self.queried.contains(contact.id()))
                .cloned()
                .collect()
        } else {
            let mut selected = Vec::with_capacity(self.settings.lookup_concurrency);

            while selected.len() < self.settings.lookup_concurrency {
                match self.next_candidate(local) {
                    Some(contact) => {
                        self.queried.insert(*contact.id());
                        selected.push(contact);
                    }
                    None => break,
                }
            }

            selected
        };

        trace!(target = ?self.target, sweep, count = to_query.len(), "Query round");

        for contact in &to_query {
            self.query(transport, contact);
        }

        to_query.len()
    }

    /// The closest unqueried candidate.
    ///
    /// Until `lookup_concurrency` contacts were queried, the lowest latency candidate
    /// among the next `2 * lookup_concurrency - queried` closest is preferred.
    fn next_candidate(&self, local: Option<&VivaldiPosition>) -> Option<Contact> {
        let concurrency = self.settings.lookup_concurrency;

        let mut unqueried = self
            .candidates
            .contacts()
            .iter()
            .filter(|contact| !self.queried.contains(contact.id()));

        let local = local.filter(|local| {
            self.settings.prefer_low_latency
                && !local.at_origin()
                && self.queried.len() < concurrency
        });

        let Some(local) = local else {
            return unqueried.next().cloned();
        };

        let window = (2 * concurrency).saturating_sub(self.queried.len()).max(1);
        let window: Vec<&Contact> = unqueried.take(window).collect();

        window
            .iter()
            .map(|contact| (contact.estimate_rtt(local), *contact))
            .filter(|(rtt, _)| rtt.is_finite())
            .min_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, contact)| contact)
            .or(window.first().copied())
            .cloned()
    }

    fn query(&mut self, transport: &mut dyn Transport, contact: &Contact) {
        let id = *contact.id();

        let tid = transport.request(contact.address(), self.request.clone());

        self.inflight_requests
            .insert(tid, (contact.address(), Some(id)));
        self.queried.insert(id);
        self.visited.insert(contact.address());

        self.visits
            .push((self.introduced_by.get(&id).copied(), contact.clone()));
    }
}
