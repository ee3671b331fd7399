//! End to end behaviour of Dht nodes over an in-memory testnet.
//!
//! Run with: cargo test --test testnet

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dht_control::{
    control::Control,
    transport::{MemoryNetwork, Transport},
    ActivityEvent, ActivityKind, Config, Contact, Dht, DhtError, DhtOperationError, GetRequest,
    Id, PutRequest, Testnet,
};
use tracing::Level;

/// Print node logs with `cargo test -- --nocapture`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn node(testnet: &Testnet) -> Dht {
    init_tracing();

    let dht = Dht::builder()
        .bootstrap(&testnet.bootstrap)
        .build(testnet.transport())
        .unwrap();

    assert!(dht.seed(true).unwrap());

    dht
}

#[test]
fn put_then_get_from_another_node() {
    let testnet = Testnet::new(20).unwrap();

    let a = node(&testnet);
    let b = node(&testnet);

    let report = a
        .put(
            PutRequest::new("profile", "hello")
                .description("publish profile")
                .life_hours(2),
        )
        .unwrap();
    assert!(report.stored_at.len() >= 10);

    let result = b.get(GetRequest::new("profile")).unwrap();

    assert_eq!(result.values.len(), 1);
    assert_eq!(result.values[0].value, "hello");
    assert_eq!(result.values[0].life_hours, 2);
    assert!(!result.diversified);
}

#[test]
fn replication_control_adds_replicas_beyond_k() {
    let testnet = Testnet::new(12).unwrap();
    init_tracing();

    let dht = Dht::builder()
        .bootstrap(&testnet.bootstrap)
        .k(4)
        .build(testnet.transport())
        .unwrap();
    assert!(dht.seed(true).unwrap());

    let report = dht
        .put(PutRequest::new("replicated", "value").replication_control(2))
        .unwrap();
    assert_eq!(report.stored_at.len(), 4 + 2);
    assert!(report.failed.is_empty());

    let report = dht.put(PutRequest::new("plain", "value")).unwrap();
    assert_eq!(report.stored_at.len(), 4);
}

#[test]
fn remove_stops_serving_the_value() {
    let testnet = Testnet::new(15).unwrap();

    let a = node(&testnet);
    let b = node(&testnet);

    a.put(PutRequest::new("temporary", "value")).unwrap();
    a.remove(b"temporary", "cleanup").unwrap();

    assert!(a.local_value(b"temporary").unwrap().is_none());

    let result = b
        .get(GetRequest::new("temporary").exhaustive(true))
        .unwrap();
    assert!(result.values.is_empty());
}

#[test]
fn remove_from_explicit_contacts() {
    let testnet = Testnet::new(10).unwrap();

    let a = node(&testnet);
    a.put(PutRequest::new("key", "value")).unwrap();

    let contacts: Vec<Contact> = a.contacts().unwrap().into_iter().take(3).collect();

    let report = a.remove_from(contacts.clone(), b"key", "targeted").unwrap();

    assert_eq!(report.stored_at.len() + report.failed.len(), contacts.len());
}

#[test]
fn two_publishers_diversify_a_key() {
    let testnet = Testnet::new(20).unwrap();

    let a = node(&testnet);
    let b = node(&testnet);
    let c = node(&testnet);

    a.put(PutRequest::new("shared", "from a")).unwrap();
    b.put(PutRequest::new("shared", "from b")).unwrap();

    let result = c.get(GetRequest::new("shared").exhaustive(true)).unwrap();

    assert_eq!(result.values.len(), 2);
    assert!(result.diversified);
    assert!(c.is_diversified(b"shared").unwrap());
}

#[test]
fn max_values_caps_the_result() {
    let testnet = Testnet::new(20).unwrap();

    let publishers: Vec<Dht> = (0..3).map(|_| node(&testnet)).collect();
    for (i, publisher) in publishers.iter().enumerate() {
        publisher
            .put(PutRequest::new("crowded", format!("value {i}")))
            .unwrap();
    }

    let reader = node(&testnet);
    let result = reader
        .get(GetRequest::new("crowded").max_values(1))
        .unwrap();

    assert_eq!(result.values.len(), 1);
}

#[test]
fn raw_keys_need_twenty_bytes() {
    let testnet = Testnet::new(5).unwrap();

    let dht = Dht::builder()
        .bootstrap(&testnet.bootstrap)
        .encode_keys(false)
        .build(testnet.transport())
        .unwrap();

    assert!(matches!(
        dht.put(PutRequest::new("short", "value")),
        Err(DhtOperationError::Dht(DhtError::EncodeFailure(_)))
    ));
}

#[test]
fn lookups_return_closest_first() {
    let testnet = Testnet::new(30).unwrap();

    let dht = node(&testnet);
    let target = Id::random();

    let contacts = dht.lookup(target, "closest", None).unwrap();

    assert!(!contacts.is_empty());
    assert!(contacts.len() <= 20);

    let encoded = dht.lookup_encoded(b"some key", "encoded", None).unwrap();
    assert!(!encoded.is_empty());
}

#[test]
fn offline_contacts_fail_verification() {
    let testnet = Testnet::new(5).unwrap();

    let dht = node(&testnet);

    let alive = dht.contacts().unwrap().remove(0);
    assert!(dht.verify_contact(alive, false).unwrap());

    let offline = testnet.transport();
    let contact = offline.local_contact();
    drop(offline);

    assert!(!dht.verify_contact(contact, true).unwrap());
}

#[test]
fn survives_failing_nodes() {
    let testnet = Testnet::new(20).unwrap();

    let a = node(&testnet);
    let b = node(&testnet);

    for dead in testnet.nodes.iter().take(5) {
        dead.shutdown();
    }

    let report = a.put(PutRequest::new("resilient", "value")).unwrap();
    assert!(!report.stored_at.is_empty());

    let result = b.get(GetRequest::new("resilient")).unwrap();
    assert_eq!(result.values.len(), 1);
}

#[test]
fn exported_state_seeds_a_new_node() {
    let testnet = Testnet::new(10).unwrap();

    let state = testnet.nodes[2].export_state(32).unwrap();

    // No bootstrap nodes, only what was exported.
    let fresh = Dht::builder().build(testnet.transport()).unwrap();
    assert!(fresh.import_state(&state).unwrap() > 0);
    assert!(fresh.seed(true).unwrap());

    let mut corrupt = state.to_vec();
    let last = corrupt.len() - 1;
    corrupt[last] ^= 0xff;

    let other = Dht::builder().build(testnet.transport()).unwrap();
    assert!(matches!(
        other.import_state(&corrupt),
        Err(DhtOperationError::Dht(DhtError::ImportCorrupt(_)))
    ));
    assert!(other.contacts().unwrap().is_empty());
}

#[test]
fn suspended_operations_wait() {
    let testnet = Testnet::new(10).unwrap();

    let dht = node(&testnet);
    dht.set_suspended(true).unwrap();

    let handle = dht.clone();
    let get = std::thread::spawn(move || handle.get(GetRequest::new("later")));

    std::thread::sleep(Duration::from_millis(100));

    let activities = dht.activities().unwrap();
    assert!(activities
        .iter()
        .any(|activity| activity.is_queued() && activity.kind() == ActivityKind::ExternalGet));
    assert_eq!(dht.info().unwrap().queued_operations(), 1);

    dht.set_suspended(false).unwrap();

    assert!(get.join().unwrap().is_ok());
}

#[test]
fn activity_events() {
    let testnet = Testnet::new(10).unwrap();

    let dht = node(&testnet);
    let events = dht.subscribe_activities().unwrap();

    dht.get(GetRequest::new("watched").description("watched get"))
        .unwrap();

    let events: Vec<ActivityEvent> = events.try_iter().collect();

    assert!(events.iter().any(|event| matches!(
        event,
        ActivityEvent::Added(activity) if activity.description() == "watched get"
    )));
    assert!(events
        .iter()
        .any(|event| matches!(event, ActivityEvent::Removed(_))));
}

#[derive(Clone, Default)]
struct Logs(Arc<Mutex<Vec<u8>>>);

impl Write for Logs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn control_logs_through_tracing() {
    let logs = Logs::default();
    let writer = logs.clone();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();

    let network = MemoryNetwork::new();

    tracing::subscriber::with_default(subscriber, || {
        let mut control = Control::new(Config::default(), Box::new(network.transport()));
        control.set_suspended(true);
    });

    let logs = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();

    assert!(logs.contains("DHT control plane started"));
    assert!(logs.contains("suspended=true"));
}
