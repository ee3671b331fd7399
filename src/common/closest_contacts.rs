use std::{convert::TryInto, vec::IntoIter};

use crate::common::{Contact, Id};

#[derive(Debug, Clone)]
/// Contacts sorted by XOR distance to a target, closest first, without duplicates.
///
/// Distances between distinct ids never tie, so the order is fully determined by
/// the set of contacts, never by insertion order.
pub struct ClosestContacts {
    target: Id,
    contacts: Vec<Contact>,
}

impl ClosestContacts {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            contacts: Vec::with_capacity(200),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn first(&self) -> Option<&Contact> {
        self.contacts.first()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.position(id).is_ok()
    }

    // === Public Methods ===

    /// Insert a contact, returns false if a contact with the same id is already present.
    pub fn add(&mut self, contact: Contact) -> bool {
        match self.position(contact.id()) {
            Err(pos) => {
                self.contacts.insert(pos, contact);
                true
            }
            Ok(_) => false,
        }
    }

    pub fn remove(&mut self, id: &Id) -> Option<Contact> {
        self.position(id).ok().map(|pos| self.contacts.remove(pos))
    }

    /// Keep only the `n` closest contacts.
    pub fn truncate(&mut self, n: usize) {
        self.contacts.truncate(n)
    }

    /// Returns true if `id` is strictly closer to the target than `other`.
    pub fn is_closer(&self, id: &Id, other: &Id) -> bool {
        id.compute_and_compare_distances(other, &self.target)
            .is_lt()
    }

    /// An estimation of the Dht size from the distribution of closest contacts
    /// responding to a query.
    ///
    /// Seeing `i` contacts within XOR distance `d_i` of a uniformly random target
    /// suggests the key space holds about `i * d_max / d_i` nodes. The estimate is
    /// the average over the first K closest contacts.
    ///
    /// Read more at [A New Method for Estimating P2P Network Size](https://eli.sohl.com/2020/06/05/dht-size-estimation.html#fnref:query-count)
    pub fn dht_size_estimate(&self, k: usize) -> usize {
        if self.is_empty() {
            return 0;
        };

        let mut sum: usize = 0;
        let mut count = 0;

        for contact in &self.contacts {
            if count >= k {
                break;
            }

            count += 1;

            let xor = contact.id().xor(&self.target);

            // Round up the lower 4 bytes to get a u128 from u160.
            let distance =
                u128::from_be_bytes(xor.as_bytes()[0..16].try_into().unwrap_or([0xff; 16]))
                    .saturating_add(1);

            let intervals = (u128::MAX / distance) as usize;
            let estimated_n = intervals.saturating_mul(count);

            sum = sum.saturating_add(estimated_n);
        }

        sum / count
    }

    // === Private Methods ===

    fn position(&self, id: &Id) -> Result<usize, usize> {
        let target = self.target;

        self.contacts
            .binary_search_by(|probe| probe.id().compute_and_compare_distances(id, &target))
    }
}

impl IntoIterator for ClosestContacts {
    type Item = Contact;
    type IntoIter = IntoIter<Contact>;

    fn into_iter(self) -> Self::IntoIter {
        self.contacts.into_iter()
    }
}

impl<'a> IntoIterator for &'a ClosestContacts {
    type Item = &'a Contact;
    type IntoIter = std::slice::Iter<'a, Contact>;

    fn into_iter(self) -> Self::IntoIter {
        self.contacts.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add() {
        let target = Id::random();

        let mut closest_contacts = ClosestContacts::new(target);

        for _ in 0..10 {
            let contact = Contact::random();
            assert!(closest_contacts.add(contact.clone()));
            assert!(!closest_contacts.add(contact));
        }

        assert_eq!(closest_contacts.len(), 10);

        let distances = closest_contacts
            .contacts()
            .iter()
            .map(|c| c.id().xor(&target))
            .collect::<Vec<_>>();

        let mut sorted = distances.clone();
        sorted.sort();

        assert_eq!(sorted, distances);
    }

    #[test]
    fn order_is_independent_of_insertion() {
        let target = Id::random();
        let contacts = (0..30).map(|_| Contact::random()).collect::<Vec<_>>();

        let mut forward = ClosestContacts::new(target);
        let mut backward = ClosestContacts::new(target);

        for contact in &contacts {
            forward.add(contact.clone());
        }
        for contact in contacts.iter().rev() {
            backward.add(contact.clone());
        }

        assert_eq!(forward.contacts(), backward.contacts());
    }

    #[test]
    fn remove() {
        let mut closest_contacts = ClosestContacts::new(Id::random());
        let contact = Contact::random();

        closest_contacts.add(contact.clone());
        closest_contacts.add(Contact::random());

        assert_eq!(closest_contacts.remove(contact.id()), Some(contact.clone()));
        assert!(!closest_contacts.contains(contact.id()));
        assert_eq!(closest_contacts.len(), 1);
    }

    #[test]
    fn simulation() {
        let lookups = 50;
        let acceptable_margin = 0.6;

        let tests = [2500, 25000];

        for dht_size in tests {
            let estimate = simulate(dht_size, lookups) as f64;

            let margin = (estimate - (dht_size as f64)).abs() / dht_size as f64;

            assert!(
                margin <= acceptable_margin,
                "estimated {estimate} for {dht_size} nodes"
            );
        }
    }

    /// Median of the estimates from the 20 XOR closest contacts to random targets.
    fn simulate(dht_size: usize, lookups: usize) -> usize {
        let mut contacts: Vec<Contact> = (0..dht_size).map(|_| Contact::random()).collect();

        let mut estimates = vec![];

        for _ in 0..lookups {
            let target = Id::random();

            contacts.select_nth_unstable_by(19, |a, b| {
                a.id().compute_and_compare_distances(b.id(), &target)
            });

            let mut closest_contacts = ClosestContacts::new(target);

            for contact in &contacts[..20] {
                closest_contacts.add(contact.clone());
            }

            estimates.push(closest_contacts.dht_size_estimate(20))
        }

        estimates.sort_unstable();

        estimates[estimates.len() / 2]
    }
}
