use std::collections::HashMap;

use tracing::{debug, trace};

use crate::common::{Contact, ErrorSpecific, Id, RequestSpecific, ResponseSpecific};
use crate::transport::Transport;
use crate::DhtError;

#[derive(Debug)]
/// Once an [super::iterative_query::IterativeQuery] found the closest contacts,
/// we can store (or remove) values at them using this PutQuery, that keeps track of
/// acknowledging contacts, and failing ones.
pub(crate) struct PutQuery {
    pub target: Id,
    pub request: RequestSpecific,
    inflight_requests: HashMap<u32, Contact>,
    /// Contacts that confirmed success
    stored_at: Vec<Contact>,
    failed: Vec<Contact>,
    /// Ids of contacts that timed out since the last [Self::drain_timeouts].
    timeouts: Vec<Id>,
    started: bool,
}

impl PutQuery {
    pub fn new(target: Id, request: RequestSpecific) -> Self {
        Self {
            target,
            request,
            inflight_requests: HashMap::new(),
            stored_at: Vec::new(),
            failed: Vec::new(),
            timeouts: Vec::new(),
            started: false,
        }
    }

    // === Getters ===

    pub fn stored_at(&self) -> &[Contact] {
        &self.stored_at
    }

    pub fn failed(&self) -> &[Contact] {
        &self.failed
    }

    pub fn inflight(&self, tid: u32) -> bool {
        self.inflight_requests.contains_key(&tid)
    }

    pub fn is_done(&self) -> bool {
        self.started && self.inflight_requests.is_empty()
    }

    /// Ok if at least one contact acknowledged the request.
    pub fn result(&self) -> Result<(), DhtError> {
        if self.stored_at.is_empty() {
            Err(DhtError::AllContactsFailed(self.failed.len()))
        } else {
            Ok(())
        }
    }

    // === Public Methods ===

    pub fn start(&mut self, transport: &mut dyn Transport, contacts: &[Contact]) -> Result<(), DhtError> {
        let target = self.target;
        trace!(?target, count = contacts.len(), "PutQuery start");

        if contacts.is_empty() {
            Err(DhtError::NoRoute(target))?;
        }

        self.started = true;

        for contact in contacts {
            let tid = transport.request(contact.address(), self.request.clone());
            self.inflight_requests.insert(tid, contact.clone());
        }

        Ok(())
    }

    pub fn response(&mut self, tid: u32, response: &ResponseSpecific) {
        let Some(contact) = self.inflight_requests.remove(&tid) else {
            return;
        };

        let acknowledged = match response {
            ResponseSpecific::Store(args) => args.stored > 0,
            ResponseSpecific::Remove(_) => true,
            _ => false,
        };

        if acknowledged {
            debug!(target = ?self.target, ?contact, "PutQuery got success response");
            self.stored_at.push(contact);
        } else {
            debug!(target = ?self.target, ?contact, "PutQuery got rejected");
            self.failed.push(contact);
        }
    }

    pub fn error(&mut self, tid: u32, error: &ErrorSpecific) {
        if let Some(contact) = self.inflight_requests.remove(&tid) {
            debug!(target = ?self.target, ?error, "PutQuery got error");
            self.failed.push(contact);
        }
    }

    /// Ids of contacts that timed out since the last call.
    pub fn drain_timeouts(&mut self) -> Vec<Id> {
        std::mem::take(&mut self.timeouts)
    }

    /// Check if the query is done, moving timed out requests to the failed contacts.
    pub fn tick(&mut self, transport: &dyn Transport) -> bool {
        if !self.started {
            return false;
        }

        let expired = self
            .inflight_requests
            .keys()
            .filter(|tid| !transport.inflight(**tid))
            .copied()
            .collect::<Vec<_>>();

        for tid in expired {
            if let Some(contact) = self.inflight_requests.remove(&tid) {
                self.timeouts.push(*contact.id());
                self.failed.push(contact);
            }
        }

        if self.is_done() {
            debug!(
                target = ?self.target,
                stored_at = self.stored_at.len(),
                failed = self.failed.len(),
                "PutQuery done"
            );

            return true;
        }

        false
    }
}
