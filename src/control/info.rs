use std::net::SocketAddrV4;

use crate::core::vivaldi::VivaldiPosition;
use crate::Id;

use super::Control;

/// Information and statistics about this DHT node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    address: SocketAddrV4,
    seeded: bool,
    suspended: bool,
    sleeping: bool,
    routing_table_size: usize,
    dht_size_estimate: (usize, f64),
    position: VivaldiPosition,
    active_operations: usize,
    queued_operations: usize,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Address other nodes reach this node at.
    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    pub fn seeded(&self) -> bool {
        self.seeded
    }

    pub fn suspended(&self) -> bool {
        self.suspended
    }

    pub fn sleeping(&self) -> bool {
        self.sleeping
    }

    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }

    /// Returns:
    ///  1. Normal Dht size estimate based on the closest responders of lookups.
    ///  2. Standard deviaiton as a function of the number of samples used in this estimate.
    pub fn dht_size_estimate(&self) -> (usize, f64) {
        self.dht_size_estimate
    }

    /// This node's Vivaldi coordinates.
    pub fn position(&self) -> &VivaldiPosition {
        &self.position
    }

    pub fn active_operations(&self) -> usize {
        self.active_operations
    }

    pub fn queued_operations(&self) -> usize {
        self.queued_operations
    }
}

impl From<&Control> for Info {
    fn from(control: &Control) -> Self {
        Self {
            id: control.id(),
            address: control.address(),
            seeded: control.is_seeded(),
            suspended: control.is_suspended(),
            sleeping: control.is_sleeping(),
            routing_table_size: control.router().size(),
            dht_size_estimate: control.dht_size_estimate(),
            position: *control.position(),
            active_operations: control.active_operations(),
            queued_operations: control.queued_operations(),
        }
    }
}
