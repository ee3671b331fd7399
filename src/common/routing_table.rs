//! Router port and a simplified Kademlia routing table implementing it.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::slice::Iter;

use crate::common::{ClosestContacts, Contact, Id, MAX_DISTANCE};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;
/// Buckets refreshed after seeding, farthest first.
pub const MAX_REFRESH_TARGETS: usize = 8;

/// Routing table storage consulted by the control plane.
///
/// The control plane never persists contacts itself, it only reads transient
/// copies and reports liveness back through this trait.
pub trait Router: Send + Debug {
    /// The [Id] of the local node, where distances are measured from.
    fn local_id(&self) -> Id;

    /// Up to `n` contacts closest to `target`, closest first.
    ///
    /// With `live_only` contacts that are currently failing are skipped.
    fn closest_contacts(&self, target: &Id, n: usize, live_only: bool) -> Vec<Contact>;

    /// Learn about a contact, or refresh what is known about it.
    ///
    /// Returns `true` if the contact is now in the router.
    fn add(&mut self, contact: Contact) -> bool;

    /// The contact answered one of our requests.
    fn mark_alive(&mut self, contact: &Contact);

    /// A request to the contact failed or timed out.
    fn mark_failed(&mut self, id: &Id);

    fn remove(&mut self, id: &Id);

    /// Owned copies of every contact in the router.
    fn contacts(&self) -> Vec<Contact>;

    fn size(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Targets to look up once seeded, filling buckets the seed lookup did not reach.
    ///
    /// Defaults to none.
    fn refresh_targets(&self) -> Vec<Id> {
        Vec::new()
    }
}

#[derive(Debug, Clone)]
/// Simplified Kademlia routing table
pub struct RoutingTable {
    id: Id,
    k: usize,
    buckets: BTreeMap<u8, KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        Self::with_bucket_size(id, MAX_BUCKET_SIZE_K)
    }

    /// Create a new [RoutingTable] whose buckets hold up to `k` contacts.
    pub fn with_bucket_size(id: Id, k: usize) -> Self {
        RoutingTable {
            id,
            k: k.max(1),
            buckets: BTreeMap::new(),
        }
    }

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Returns an iterator over the contacts in this routing table, closest buckets first.
    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.buckets.values().flat_map(|bucket| bucket.iter())
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.buckets
            .get(&self.id.distance(id))
            .map(|bucket| bucket.contains(id))
            .unwrap_or(false)
    }

    fn bucket_mut(&mut self, id: &Id) -> Option<&mut KBucket> {
        let distance = self.id.distance(id);
        self.buckets.get_mut(&distance)
    }
}

impl Router for RoutingTable {
    fn local_id(&self) -> Id {
        self.id
    }

    fn closest_contacts(&self, target: &Id, n: usize, live_only: bool) -> Vec<Contact> {
        let mut closest = ClosestContacts::new(*target);

        for contact in self.iter() {
            if live_only && contact.is_failing() {
                continue;
            }
            closest.add(contact.clone());
        }

        closest.truncate(n);
        closest.into_iter().collect()
    }

    fn add(&mut self, contact: Contact) -> bool {
        let distance = self.id.distance(contact.id());

        if distance == 0 || !contact.is_valid() {
            // Do not add self, or unreachable contacts, to the routing_table
            return false;
        }

        let k = self.k;
        let bucket = self.buckets.entry(distance).or_insert_with(|| KBucket::new(k));

        bucket.add(contact)
    }

    fn mark_alive(&mut self, contact: &Contact) {
        if let Some(bucket) = self.bucket_mut(contact.id()) {
            if bucket.mark_alive(contact) {
                return;
            }
        }

        let mut verified = contact.clone();
        verified.mark_alive();
        self.add(verified);
    }

    fn mark_failed(&mut self, id: &Id) {
        if let Some(bucket) = self.bucket_mut(id) {
            bucket.mark_failed(id);
        }
    }

    fn remove(&mut self, id: &Id) {
        if let Some(bucket) = self.bucket_mut(id) {
            bucket.remove(id)
        }
    }

    fn contacts(&self) -> Vec<Contact> {
        self.iter().cloned().collect()
    }

    fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.contacts.len())
    }

    /// A random id in every bucket farther than the closest occupied one
    /// that is not full, up to [MAX_REFRESH_TARGETS].
    fn refresh_targets(&self) -> Vec<Id> {
        let Some(closest) = self
            .buckets
            .iter()
            .find(|(_, bucket)| !bucket.is_empty())
            .map(|(distance, _)| *distance)
        else {
            return Vec::new();
        };

        ((closest + 1)..=MAX_DISTANCE)
            .rev()
            .filter(|distance| {
                self.buckets
                    .get(distance)
                    .map_or(true, |bucket| bucket.contacts.len() < self.k)
            })
            .take(MAX_REFRESH_TARGETS)
            .map(|distance| self.id.random_at_distance(distance))
            .collect()
    }
}

/// Kbuckets are similar to LRU caches that checks and evicts unresponsive contacts,
/// without dropping any responsive contacts in the process.
#[derive(Debug, Clone)]
pub struct KBucket {
    k: usize,
    /// Contacts in the k-bucket, sorted by the least recently seen.
    contacts: Vec<Contact>,
}

impl KBucket {
    pub fn new(k: usize) -> Self {
        KBucket {
            k,
            contacts: Vec::with_capacity(k),
        }
    }

    // === Public Methods ===

    pub fn add(&mut self, incoming: Contact) -> bool {
        if let Some(index) = self.position(incoming.id()) {
            // Same id, possibly a new port. Refresh what we know and move it to
            // the end of the bucket as the most recently seen.
            let mut existing = self.contacts.remove(index);
            existing.refresh(&incoming);
            self.contacts.push(existing);

            true
        } else if self.contacts.len() < self.k {
            self.contacts.push(incoming);
            true
        } else if let Some(index) = self.contacts.iter().position(|c| c.is_failing()) {
            // Replace the least recently seen failing contact
            self.contacts.remove(index);
            self.contacts.push(incoming);

            true
        } else {
            false
        }
    }

    /// Returns false if the contact is not in this bucket.
    pub fn mark_alive(&mut self, contact: &Contact) -> bool {
        match self.position(contact.id()) {
            Some(index) => {
                let mut existing = self.contacts.remove(index);
                existing.refresh(contact);
                existing.mark_alive();
                self.contacts.push(existing);

                true
            }
            None => false,
        }
    }

    pub fn mark_failed(&mut self, id: &Id) {
        if let Some(index) = self.position(id) {
            self.contacts[index].mark_failed();

            if self.contacts[index].is_stale() {
                self.contacts.remove(index);
            }
        }
    }

    pub fn remove(&mut self, id: &Id) {
        self.contacts.retain(|contact| contact.id() != id);
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, Contact> {
        self.contacts.iter()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.position(id).is_some()
    }

    fn position(&self, id: &Id) -> Option<usize> {
        self.contacts.iter().position(|contact| contact.id() == id)
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddrV4;

    use super::*;
    use crate::common::Liveness;

    #[test]
    fn table_is_empty() {
        let mut table = RoutingTable::new(Id::random());
        assert!(table.is_empty());

        table.add(Contact::unique(1));
        assert!(!table.is_empty());
    }

    #[test]
    fn to_vec() {
        let mut table = RoutingTable::new(Id::random());

        let expected: Vec<Contact> = (1..=MAX_BUCKET_SIZE_K).map(Contact::unique).collect();

        for contact in &expected {
            table.add(contact.clone());
        }

        let mut sorted_table = table.contacts();
        sorted_table.sort_by(|a, b| a.id().cmp(b.id()));

        let mut sorted_expected = expected.to_vec();
        sorted_expected.sort_by(|a, b| a.id().cmp(b.id()));

        assert_eq!(sorted_table, sorted_expected);
    }

    #[test]
    fn does_not_add_self_or_unreachable() {
        let local = Id::random();
        let mut table = RoutingTable::new(local);

        assert!(!table.add(Contact::new(local, "1.1.1.1:1".parse().unwrap())));
        assert!(!table.add(Contact::random()));
        assert!(table.is_empty());
    }

    #[test]
    fn remove() {
        let mut table = RoutingTable::new(Id::random());

        let contact = Contact::unique(1);

        table.add(contact.clone());
        assert!(table.contains(contact.id()));

        table.remove(contact.id());
        assert!(!table.contains(contact.id()));
    }

    #[test]
    fn buckets_are_sets() {
        let mut table = RoutingTable::new(Id::random());

        let contact = Contact::unique(1);
        let moved = Contact::new(*contact.id(), SocketAddrV4::new([1, 2, 3, 4].into(), 7));

        table.add(contact.clone());
        table.add(moved.clone());

        assert_eq!(table.size(), 1);
        assert_eq!(table.contacts()[0].address(), moved.address());
    }

    #[test]
    fn full_bucket_replaces_failing_contacts() {
        let mut bucket = KBucket::new(2);

        let first = Contact::unique(1);
        let second = Contact::unique(2);
        let third = Contact::unique(3);

        assert!(bucket.add(first.clone()));
        assert!(bucket.add(second.clone()));
        assert!(!bucket.add(third.clone()));

        bucket.mark_failed(second.id());
        assert!(bucket.add(third.clone()));

        assert!(bucket.contains(first.id()));
        assert!(!bucket.contains(second.id()));
        assert!(bucket.contains(third.id()));
    }

    #[test]
    fn stale_contacts_are_dropped() {
        let mut table = RoutingTable::new(Id::random());
        let contact = Contact::unique(1);

        table.add(contact.clone());

        table.mark_failed(contact.id());
        assert!(matches!(table.contacts()[0].liveness(), Liveness::Failing(1)));
        assert!(table
            .closest_contacts(contact.id(), 20, true)
            .is_empty());

        table.mark_failed(contact.id());
        assert!(table.is_empty());
    }

    #[test]
    fn mark_alive_inserts_verified() {
        let mut table = RoutingTable::new(Id::random());
        let contact = Contact::unique(1);

        table.mark_alive(&contact);

        assert!(table.contacts()[0].is_verified());
    }

    #[test]
    fn refresh_targets_skip_full_and_nearer_buckets() {
        let local = Id::random();
        let mut table = RoutingTable::with_bucket_size(local, 2);

        assert!(table.refresh_targets().is_empty());

        let contact = |distance: u8, port: u16| {
            Contact::new(
                local.random_at_distance(distance),
                SocketAddrV4::new([10, 0, 0, 1].into(), port),
            )
        };

        table.add(contact(150, 1));
        table.add(contact(MAX_DISTANCE, 2));
        table.add(contact(MAX_DISTANCE, 3));

        let distances: Vec<u8> = table
            .refresh_targets()
            .iter()
            .map(|target| local.distance(target))
            .collect();

        // 160 is full, 150 is the closest occupied bucket.
        assert_eq!(distances, vec![159, 158, 157, 156, 155, 154, 153, 152]);
    }

    #[test]
    fn closest() {
        let mut table = RoutingTable::new(Id::random());

        let contacts: Vec<Contact> = (1..200).map(Contact::unique).collect();
        for contact in &contacts {
            table.add(contact.clone());
        }

        let target = Id::random();
        let closest = table.closest_contacts(&target, MAX_BUCKET_SIZE_K, false);

        let mut expected = table.contacts();
        expected.sort_by(|a, b| a.id().compute_and_compare_distances(b.id(), &target));
        expected.truncate(MAX_BUCKET_SIZE_K);

        assert_eq!(closest, expected);
    }
}
