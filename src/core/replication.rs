//! Replica placement and diversification detection.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::num::NonZeroUsize;

use bytes::Bytes;
use lru::LruCache;

use crate::common::{Contact, Id, TransportValue};
use crate::core::vivaldi::VivaldiPosition;

/// Default maximum replicas placed on a single physical node (IP address).
pub const MAX_REP_PER_NODE_DEFAULT: usize = 5;
/// Default number of closest responders that receive a cached copy after a get.
pub const CACHE_AT_CLOSEST_N_DEFAULT: usize = 1;

const MAX_DIVERSIFIED_KEYS: usize = 1000;

/// Pick up to `count` contacts to store a value at.
///
/// `responders` must be sorted closest to `target` first. No more than
/// `max_rep_per_node` contacts are taken from any single IP address. Contacts
/// at the same log distance from the target are ordered by estimated RTT from
/// `local`, lowest first, unknown RTTs last.
pub fn replication_targets(
    responders: &[Contact],
    target: &Id,
    count: usize,
    max_rep_per_node: usize,
    local: Option<&VivaldiPosition>,
) -> Vec<Contact> {
    let mut per_ip: HashMap<Ipv4Addr, usize> = HashMap::new();

    let mut targets: Vec<Contact> = responders
        .iter()
        .filter(|contact| {
            let replicas = per_ip.entry(*contact.address().ip()).or_default();
            *replicas += 1;
            *replicas <= max_rep_per_node
        })
        .take(count)
        .cloned()
        .collect();

    if let Some(local) = local {
        prefer_low_latency(&mut targets, target, local);
    }

    targets
}

/// Stable sort contacts at equal log distance from `target` by estimated RTT.
pub fn prefer_low_latency(contacts: &mut [Contact], target: &Id, local: &VivaldiPosition) {
    contacts.sort_by(|a, b| {
        target
            .distance(a.id())
            .cmp(&target.distance(b.id()))
            .then_with(|| rtt_key(a, local).total_cmp(&rtt_key(b, local)))
    });
}

fn rtt_key(contact: &Contact, local: &VivaldiPosition) -> f32 {
    let rtt = contact.estimate_rtt(local);

    if rtt.is_nan() {
        f32::INFINITY
    } else {
        rtt
    }
}

/// Responders, among the `n` closest, that did not return a value and
/// should receive a cached copy of it.
pub fn cache_targets(responders: &[Contact], holders: &HashSet<Id>, n: usize) -> Vec<Contact> {
    responders
        .iter()
        .take(n)
        .filter(|contact| !holders.contains(contact.id()))
        .cloned()
        .collect()
}

/// Distinct values by their bytes, in first seen order.
///
/// Identical bytes from different originators are one value.
pub fn distinct_values<'a>(values: impl IntoIterator<Item = &'a TransportValue>) -> Vec<TransportValue> {
    let mut seen: HashSet<Bytes> = HashSet::new();

    values
        .into_iter()
        .filter(|value| seen.insert(value.value.clone()))
        .cloned()
        .collect()
}

#[derive(Debug)]
/// Keys observed holding more than one distinct value.
pub struct Diversification {
    keys: LruCache<Id, ()>,
}

impl Default for Diversification {
    fn default() -> Self {
        Self::new()
    }
}

impl Diversification {
    pub fn new() -> Self {
        Self {
            keys: LruCache::new(
                NonZeroUsize::new(MAX_DIVERSIFIED_KEYS).unwrap_or(NonZeroUsize::MIN),
            ),
        }
    }

    pub fn is_diversified(&self, key: &Id) -> bool {
        self.keys.contains(key)
    }

    /// Record the outcome of a get that found `distinct` values under `key`.
    ///
    /// Only an exhaustive get saw every replica, so only it can clear the flag.
    pub fn observe(&mut self, key: Id, distinct: usize, exhaustive: bool) -> bool {
        if distinct > 1 {
            self.keys.put(key, ());
        } else if exhaustive {
            self.keys.pop(&key);
        }

        self.is_diversified(&key)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddrV4;

    use super::*;
    use crate::common::Record;
    use crate::core::vivaldi::HeightCoordinates;

    fn sorted(target: &Id, contacts: Vec<Contact>) -> Vec<Contact> {
        let mut contacts = contacts;
        contacts.sort_by(|a, b| a.id().compute_and_compare_distances(b.id(), target));
        contacts
    }

    #[test]
    fn bounded_per_physical_node() {
        let target = Id::random();

        let same_host: Vec<Contact> = (1..=8)
            .map(|port| Contact::new(Id::random(), SocketAddrV4::new([1, 1, 1, 1].into(), port)))
            .collect();
        let others: Vec<Contact> = (1..=8).map(|i| Contact::unique(100 + i)).collect();

        let responders = sorted(&target, [same_host, others].concat());

        let targets = replication_targets(&responders, &target, 12, 5, None);

        assert_eq!(targets.len(), 12);
        assert_eq!(
            targets
                .iter()
                .filter(|c| *c.address().ip() == std::net::Ipv4Addr::new(1, 1, 1, 1))
                .count(),
            5
        );
    }

    #[test]
    fn k_plus_replication_control() {
        let target = Id::random();
        let responders = sorted(&target, (1..=40).map(Contact::unique).collect());

        let targets = replication_targets(&responders, &target, 20 + 3, 5, None);

        assert_eq!(targets.len(), 23);
        assert_eq!(targets, responders[..23].to_vec());
    }

    #[test]
    fn ties_prefer_lower_rtt() {
        let local = VivaldiPosition::with_error(HeightCoordinates::new(1.0, 0.0, 0.0), 1.0);
        let target = Id::zero();

        let mut near = [0_u8; 20];
        near[0] = 0b1000_0000;
        let mut far = near;
        far[19] = 1;

        let slow = Contact::new(Id::from(near), "1.1.1.1:1".parse().unwrap()).with_position(Some(
            VivaldiPosition::with_error(HeightCoordinates::new(500.0, 0.0, 0.0), 1.0),
        ));
        let fast = Contact::new(Id::from(far), "2.2.2.2:2".parse().unwrap()).with_position(Some(
            VivaldiPosition::with_error(HeightCoordinates::new(10.0, 0.0, 0.0), 1.0),
        ));

        let targets = replication_targets(&[slow.clone(), fast.clone()], &target, 2, 5, Some(&local));

        assert_eq!(targets, vec![fast, slow]);
    }

    #[test]
    fn cache_only_at_closest_without_value() {
        let target = Id::random();
        let responders = sorted(&target, (1..=5).map(Contact::unique).collect());

        let holders: HashSet<Id> = [*responders[0].id()].into();

        assert!(cache_targets(&responders, &holders, 1).is_empty());
        assert_eq!(
            cache_targets(&responders, &holders, 2),
            vec![responders[1].clone()]
        );
    }

    #[test]
    fn diversification() {
        let key = Id::random();
        let originator = Id::random();

        let a = TransportValue::from_record(&Record::new(key, "a".into()), originator);
        let b = TransportValue::from_record(&Record::new(key, "b".into()), Id::random());

        assert_eq!(distinct_values([&a, &a.clone()]).len(), 1);
        assert_eq!(distinct_values([&a, &b, &a]).len(), 2);

        let mut diversification = Diversification::new();

        let same_bytes = TransportValue::from_record(&Record::new(key, "a".into()), Id::random());
        assert_eq!(distinct_values([&a, &same_bytes]), vec![a.clone()]);

        assert!(diversification.observe(key, 2, false));
        // A partial view can not clear the flag.
        assert!(diversification.observe(key, 1, false));
        assert!(!diversification.observe(key, 1, true));
    }
}
