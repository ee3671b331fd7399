//! Answers requests from other nodes.

use std::fmt::Debug;

use tracing::debug;

use crate::common::{
    Contact, ContactInfo, ErrorSpecific, FindNodeRequestArguments, FindNodeResponseArguments,
    FindValueRequestArguments, FindValueResponseArguments, MessageType, PingArguments,
    RemoveRequestArguments, RemoveResponseArguments, RequestSpecific, ResponseSpecific, Router,
    StoreRequestArguments, StoreResponseArguments, StoredValue,
};
use crate::core::maintenance::Maintenance;
use crate::database::Database;

/// Default maximum size of a single stored value in bytes.
pub const MAX_VALUE_SIZE: usize = 1024;

/// A trait for filtering incoming requests to a DHT node and
/// decide whether to allow handling it or rate limit or ban
/// the requester, or prohibit specific requests' details.
pub trait RequestFilter: Send + Debug {
    /// Returns true if the request from this source is allowed.
    fn allow_request(&self, request: &RequestSpecific, from: &Contact) -> bool;
}

#[derive(Debug, Clone)]
struct DefaultFilter;

impl RequestFilter for DefaultFilter {
    fn allow_request(&self, _request: &RequestSpecific, _from: &Contact) -> bool {
        true
    }
}

#[derive(Debug)]
/// A server that handles incoming requests against the local router and database.
///
/// It doesn't implement any rate-limiting or blocking, see [RequestFilter].
pub struct Server {
    k: usize,
    max_value_size: usize,
    filter: Box<dyn RequestFilter>,
}

impl Server {
    /// Creates a new [Server] answering FIND_NODE with the `k` closest contacts.
    pub fn new(k: usize) -> Self {
        Self {
            k,
            max_value_size: MAX_VALUE_SIZE,
            filter: Box::new(DefaultFilter),
        }
    }

    pub fn with_filter(mut self, filter: Box<dyn RequestFilter>) -> Self {
        self.filter = filter;
        self
    }

    /// Returns an optional response or an error for a request.
    ///
    /// Values stored on behalf of other nodes are scheduled for cache republish.
    pub fn handle_request(
        &mut self,
        router: &dyn Router,
        database: &mut dyn Database,
        maintenance: &mut Maintenance,
        from: &Contact,
        request: RequestSpecific,
    ) -> Option<MessageType> {
        if !self.filter.allow_request(&request, from) {
            return None;
        }

        Some(match request {
            RequestSpecific::Ping(_) => {
                MessageType::Response(ResponseSpecific::Ping(PingArguments {}))
            }
            RequestSpecific::FindNode(FindNodeRequestArguments { target }) => {
                MessageType::Response(ResponseSpecific::FindNode(FindNodeResponseArguments {
                    contacts: self.closest(router, &target),
                }))
            }
            RequestSpecific::FindValue(FindValueRequestArguments {
                key, max_values, ..
            }) => {
                let values: Vec<_> = database
                    .get(&key, max_values as usize)
                    .into_iter()
                    .map(|stored| stored.value)
                    .collect();

                let contacts = if values.is_empty() {
                    self.closest(router, &key)
                } else {
                    Vec::new()
                };

                MessageType::Response(ResponseSpecific::FindValue(FindValueResponseArguments {
                    values,
                    contacts,
                }))
            }
            RequestSpecific::Store(StoreRequestArguments { key, values }) => {
                if let Some(value) = values.iter().find(|v| v.value.len() > self.max_value_size) {
                    debug!(?key, ?from, size = value.value.len(), "Value too big.");

                    return Some(MessageType::Error(ErrorSpecific {
                        code: 205,
                        description: "Value too big.".to_string(),
                    }));
                }

                let mut stored = 0;

                for value in values {
                    if database.store(key, StoredValue::new(value, false)) {
                        stored += 1;
                    }
                }

                if stored > 0 {
                    maintenance.schedule_cache(key);
                }

                MessageType::Response(ResponseSpecific::Store(StoreResponseArguments { stored }))
            }
            RequestSpecific::Remove(RemoveRequestArguments { key }) => {
                let removed = database.remove(&key, from.id()).map_or(0, |_| 1);

                MessageType::Response(ResponseSpecific::Remove(RemoveResponseArguments {
                    removed,
                }))
            }
        })
    }

    fn closest(&self, router: &dyn Router, target: &crate::common::Id) -> Vec<ContactInfo> {
        router
            .closest_contacts(target, self.k, true)
            .iter()
            .map(ContactInfo::from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Id, Record, RoutingTable, TransportValue};
    use crate::database::MemoryDatabase;

    struct Fixture {
        server: Server,
        router: RoutingTable,
        database: MemoryDatabase,
        maintenance: Maintenance,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                server: Server::new(20),
                router: RoutingTable::new(Id::random()),
                database: MemoryDatabase::default(),
                maintenance: Maintenance::default(),
            }
        }

        fn handle(&mut self, from: &Contact, request: RequestSpecific) -> Option<MessageType> {
            self.server.handle_request(
                &self.router,
                &mut self.database,
                &mut self.maintenance,
                from,
                request,
            )
        }
    }

    fn value(key: Id, originator: Id, bytes: &'static [u8]) -> TransportValue {
        TransportValue::from_record(&Record::new(key, bytes.into()), originator)
    }

    #[test]
    fn find_node_returns_closest() {
        let mut fixture = Fixture::new();
        for i in 1..=30 {
            fixture.router.add(Contact::unique(i));
        }

        let target = Id::random();
        let Some(MessageType::Response(ResponseSpecific::FindNode(args))) = fixture.handle(
            &Contact::unique(100),
            RequestSpecific::FindNode(FindNodeRequestArguments { target }),
        ) else {
            panic!("expected find_node response");
        };

        assert_eq!(args.contacts.len(), 20);
    }

    #[test]
    fn store_then_find_value() {
        let mut fixture = Fixture::new();
        let from = Contact::unique(1);
        let key = Id::random();

        let response = fixture.handle(
            &from,
            RequestSpecific::Store(StoreRequestArguments {
                key,
                values: vec![value(key, *from.id(), b"hello")],
            }),
        );

        assert_eq!(
            response,
            Some(MessageType::Response(ResponseSpecific::Store(
                StoreResponseArguments { stored: 1 }
            )))
        );
        assert!(fixture.maintenance.is_scheduled(&key));

        let Some(MessageType::Response(ResponseSpecific::FindValue(args))) = fixture.handle(
            &Contact::unique(2),
            RequestSpecific::FindValue(FindValueRequestArguments {
                key,
                flags: 0,
                max_values: 0,
            }),
        ) else {
            panic!("expected find_value response");
        };

        assert_eq!(args.values.len(), 1);
        assert!(args.contacts.is_empty());
    }

    #[test]
    fn oversized_values_are_rejected() {
        let mut fixture = Fixture::new();
        let from = Contact::unique(1);
        let key = Id::random();

        let big = TransportValue::from_record(
            &Record::new(key, vec![0; MAX_VALUE_SIZE + 1].into()),
            *from.id(),
        );

        let response = fixture.handle(
            &from,
            RequestSpecific::Store(StoreRequestArguments {
                key,
                values: vec![big],
            }),
        );

        assert!(matches!(response, Some(MessageType::Error(ErrorSpecific { code: 205, .. }))));
        assert!(fixture.database.keys().is_empty());
    }

    #[test]
    fn remove_only_own_value() {
        let mut fixture = Fixture::new();
        let owner = Contact::unique(1);
        let other = Contact::unique(2);
        let key = Id::random();

        fixture.handle(
            &owner,
            RequestSpecific::Store(StoreRequestArguments {
                key,
                values: vec![value(key, *owner.id(), b"mine")],
            }),
        );

        let remove = RequestSpecific::Remove(RemoveRequestArguments { key });

        assert_eq!(
            fixture.handle(&other, remove.clone()),
            Some(MessageType::Response(ResponseSpecific::Remove(
                RemoveResponseArguments { removed: 0 }
            )))
        );
        assert_eq!(
            fixture.handle(&owner, remove),
            Some(MessageType::Response(ResponseSpecific::Remove(
                RemoveResponseArguments { removed: 1 }
            )))
        );
    }

    #[derive(Debug)]
    struct DenyAll;

    impl RequestFilter for DenyAll {
        fn allow_request(&self, _request: &RequestSpecific, _from: &Contact) -> bool {
            false
        }
    }

    #[test]
    fn filtered_requests_are_ignored() {
        let mut fixture = Fixture::new();
        fixture.server = Server::new(20).with_filter(Box::new(DenyAll));

        assert!(fixture
            .handle(&Contact::unique(1), RequestSpecific::ping())
            .is_none());
    }
}
