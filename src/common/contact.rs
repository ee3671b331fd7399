//! Struct and implementation of a Contact as known by the router.
use std::{
    fmt::{self, Debug, Formatter},
    net::SocketAddrV4,
    time::{Duration, Instant},
};

use crate::common::Id;
use crate::core::vivaldi::VivaldiPosition;

/// Number of consecutive failed requests after which a contact is considered stale.
pub const MAX_FAILURES: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Whether a contact has ever answered us.
pub enum Liveness {
    /// Learned from someone else or imported, verification pending.
    Unverified,
    /// Responded to at least one of our requests.
    Verified,
    /// Stopped responding, the value is the number of consecutive failures.
    Failing(u8),
}

#[derive(Clone)]
/// A remote DHT node: its id, address, liveness and last known Vivaldi position.
///
/// Contacts are owned by the router, everything else holds transient copies.
pub struct Contact {
    id: Id,
    address: SocketAddrV4,
    liveness: Liveness,
    position: Option<VivaldiPosition>,
    /// When this contact was last verified alive after being unknown or failing.
    alive_since: Option<Instant>,
    last_seen: Instant,
    /// Restored from exported state rather than learned this session.
    imported: bool,
}

impl Contact {
    /// Creates a new unverified contact from an id and socket address.
    pub fn new(id: Id, address: SocketAddrV4) -> Contact {
        Contact {
            id,
            address,
            liveness: Liveness::Unverified,
            position: None,
            alive_since: None,
            last_seen: Instant::now(),
            imported: false,
        }
    }

    /// Creates a contact with a random Id for testing purposes.
    pub fn random() -> Contact {
        Contact::new(Id::random(), SocketAddrV4::new(0.into(), 0))
    }

    /// Creates a contact with a unique address for testing purposes.
    pub fn unique(i: usize) -> Contact {
        Contact::new(
            Id::random(),
            SocketAddrV4::new((i as u32).into(), (i % u16::MAX as usize) as u16),
        )
    }

    // === Options ===

    pub fn with_position(mut self, position: Option<VivaldiPosition>) -> Self {
        self.position = position;
        self
    }

    pub fn with_liveness(mut self, liveness: Liveness) -> Self {
        if liveness == Liveness::Verified && self.alive_since.is_none() {
            self.alive_since = Some(Instant::now());
        }
        self.liveness = liveness;
        self
    }

    pub fn with_imported(mut self, imported: bool) -> Self {
        self.imported = imported;
        self
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    /// Last Vivaldi position this contact reported.
    pub fn position(&self) -> Option<&VivaldiPosition> {
        self.position.as_ref()
    }

    pub fn is_verified(&self) -> bool {
        self.liveness == Liveness::Verified
    }

    pub fn is_imported(&self) -> bool {
        self.imported
    }

    pub fn is_failing(&self) -> bool {
        matches!(self.liveness, Liveness::Failing(_))
    }

    /// Failed too many consecutive requests to be worth keeping.
    pub fn is_stale(&self) -> bool {
        matches!(self.liveness, Liveness::Failing(failures) if failures >= MAX_FAILURES)
    }

    /// A contact with an unspecified address or port can never be reached.
    pub fn is_valid(&self) -> bool {
        !self.address.ip().is_unspecified() && self.address.port() != 0
    }

    /// How long this contact has been continuously verified alive.
    pub fn time_alive(&self) -> Duration {
        self.alive_since
            .map(|since| since.elapsed())
            .unwrap_or_default()
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Two contacts on the same IP are the same physical node for replica placement.
    pub fn same_ip(&self, other: &Self) -> bool {
        self.address.ip() == other.address.ip()
    }

    /// Estimated RTT in milliseconds from `local` to this contact, NaN if unknown.
    pub fn estimate_rtt(&self, local: &VivaldiPosition) -> f32 {
        self.position
            .as_ref()
            .map(|position| local.estimate_rtt(position))
            .unwrap_or(f32::NAN)
    }

    // === Public Methods ===

    /// This contact answered a request.
    pub fn mark_alive(&mut self) {
        if self.alive_since.is_none() {
            self.alive_since = Some(Instant::now());
        }
        self.liveness = Liveness::Verified;
        self.last_seen = Instant::now();
    }

    /// A request to this contact timed out or errored.
    pub fn mark_failed(&mut self) {
        self.alive_since = None;
        self.liveness = match self.liveness {
            Liveness::Failing(failures) => Liveness::Failing(failures.saturating_add(1)),
            _ => Liveness::Failing(1),
        };
    }

    /// Merge fresher information about the same contact.
    pub fn refresh(&mut self, newer: &Contact) {
        self.address = newer.address;

        if newer.position.is_some() {
            self.position = newer.position;
        }

        if newer.is_verified() {
            self.mark_alive();
        }
    }

    /// Restore how long this contact has been alive, used when importing state.
    pub(crate) fn set_time_alive(&mut self, time_alive: Duration) {
        if time_alive.is_zero() {
            return;
        }

        self.alive_since = Instant::now().checked_sub(time_alive).or(Some(Instant::now()));
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.address == other.address
    }
}

impl Eq for Contact {}

impl Debug for Contact {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contact")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("liveness", &self.liveness)
            .finish()
    }
}
