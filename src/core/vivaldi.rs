//! Vivaldi synthetic network coordinates.
//!
//! Every node keeps a position in a two dimensional plane plus a height (the
//! queuing delay of its access link). The estimated round trip time between two
//! nodes is the planar distance between their positions plus both heights.
//!
//! Positions are pulled towards or pushed away from a peer after every RTT sample,
//! weighted by how confident each side is in its own position (`error`).

use std::fmt::{self, Debug, Formatter};

use rand::Rng;

/// Confidence a node starts with, and falls back to after an invalid update.
pub const INITIAL_ERROR: f32 = 10.0;
/// Lower bound of the error, a node is never fully confident of its position.
pub const ERROR_MIN: f32 = 0.1;
/// Fraction of the weighted sample error folded into the node's own error.
pub const CE: f32 = 0.5;
/// Fraction of the weighted sample error applied as a coordinate move.
pub const CC: f32 = 0.25;
/// Largest accepted RTT sample in milliseconds.
pub const MAX_RTT: f32 = 5.0 * 60.0 * 1000.0;
/// Number of non-origin samples between two forced convergence steps.
pub const CONVERGE_EVERY: u32 = 5;
/// Peer error used for the forced convergence step towards the origin.
pub const CONVERGE_FACTOR: f32 = 50.0;
/// RTT used for the forced convergence step towards the origin.
const CONVERGE_RTT: f32 = 10.0;

/// Largest accepted magnitude of any coordinate component.
pub const MAX_X: f32 = 30_000.0;
pub const MAX_Y: f32 = 30_000.0;
pub const MAX_H: f32 = 30_000.0;

/// Size of [VivaldiPosition::to_bytes].
pub const SERIALIZED_SIZE: usize = 16;

#[derive(Clone, Copy, Default, PartialEq)]
/// A point in the plane with a height above it.
///
/// The height is never negative: every operation folds it back with `abs`.
pub struct HeightCoordinates {
    pub x: f32,
    pub y: f32,
    pub h: f32,
}

impl HeightCoordinates {
    pub fn new(x: f32, y: f32, h: f32) -> Self {
        Self { x, y, h }
    }

    pub fn origin() -> Self {
        Self::default()
    }

    pub fn add(&self, other: &HeightCoordinates) -> HeightCoordinates {
        HeightCoordinates::new(self.x + other.x, self.y + other.y, (self.h + other.h).abs())
    }

    pub fn sub(&self, other: &HeightCoordinates) -> HeightCoordinates {
        HeightCoordinates::new(self.x - other.x, self.y - other.y, (self.h + other.h).abs())
    }

    pub fn scale(&self, factor: f32) -> HeightCoordinates {
        HeightCoordinates::new(factor * self.x, factor * self.y, (factor * self.h).abs())
    }

    /// Planar length plus height.
    pub fn measure(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt() + self.h
    }

    pub fn distance(&self, other: &HeightCoordinates) -> f32 {
        self.sub(other).measure()
    }

    /// Vector of [Self::measure] one pointing the same way, or a random one for
    /// the zero vector.
    pub fn unity(&self) -> HeightCoordinates {
        let measure = self.measure();

        if measure == 0.0 {
            let mut rng = rand::thread_rng();
            let x: f32 = rng.gen_range(0.1..1.0);
            let y: f32 = rng.gen_range(0.1..1.0);

            return HeightCoordinates::new(x, y, 0.0).unity();
        }

        self.scale(1.0 / measure)
    }

    pub fn at_origin(&self) -> bool {
        self.x == 0.0 && self.y == 0.0
    }

    /// Finite and within bounds.
    pub fn is_valid(&self) -> bool {
        valid(self.x)
            && valid(self.y)
            && valid(self.h)
            && self.x.abs() <= MAX_X
            && self.y.abs() <= MAX_Y
            && self.h.abs() <= MAX_H
    }
}

impl Debug for HeightCoordinates {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2}, h={:.2})", self.x, self.y, self.h)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// A node's Vivaldi position and the confidence in it.
pub struct VivaldiPosition {
    coordinates: HeightCoordinates,
    error: f32,
    /// Accepted samples in total.
    update_count: u32,
    /// Accepted samples from non-origin peers since the last convergence step.
    since_converge: u32,
}

impl Default for VivaldiPosition {
    fn default() -> Self {
        Self::new(HeightCoordinates::origin())
    }
}

impl VivaldiPosition {
    /// A position with [INITIAL_ERROR].
    pub fn new(coordinates: HeightCoordinates) -> Self {
        Self::with_error(coordinates, INITIAL_ERROR)
    }

    pub fn with_error(coordinates: HeightCoordinates, error: f32) -> Self {
        Self {
            coordinates,
            error,
            update_count: 0,
            since_converge: 0,
        }
    }

    // === Getters ===

    pub fn coordinates(&self) -> &HeightCoordinates {
        &self.coordinates
    }

    pub fn error(&self) -> f32 {
        self.error
    }

    /// Number of accepted RTT samples.
    pub fn update_count(&self) -> u32 {
        self.update_count
    }

    pub fn at_origin(&self) -> bool {
        self.coordinates.at_origin()
    }

    pub fn is_valid(&self) -> bool {
        self.coordinates.is_valid() && valid(self.error)
    }

    // === Public Methods ===

    /// Feed one RTT sample (milliseconds) against a peer's position.
    ///
    /// Returns `false` if the sample was rejected without touching the position.
    pub fn update(&mut self, rtt: f32, peer: &HeightCoordinates, peer_error: f32) -> bool {
        if !valid(rtt) || !valid(peer_error) || !peer.is_valid() {
            return false;
        }

        if rtt <= 0.0 || rtt > MAX_RTT {
            return false;
        }

        if self.error + peer_error == 0.0 {
            return false;
        }

        // Sample weight, trust the more accurate side more.
        let w = self.error / (peer_error + self.error);

        // Real error.
        let re = rtt - self.coordinates.distance(peer);

        // Sample error.
        let es = re.abs() / rtt;

        let new_error = es * CE * w + self.error * (1.0 - CE * w);

        let scale = CC * w * re;

        let jitter = {
            let mut rng = rand::thread_rng();
            HeightCoordinates::new(rng.gen::<f32>() / 10.0, rng.gen::<f32>() / 10.0, 0.0)
        };

        let direction = self.coordinates.sub(&peer.add(&jitter)).unity();
        let new_coordinates = self.coordinates.add(&direction.scale(scale));

        if valid(new_error) && new_coordinates.is_valid() {
            self.coordinates = new_coordinates;
            self.error = new_error.max(ERROR_MIN);
        } else {
            self.coordinates = HeightCoordinates::origin();
            self.error = INITIAL_ERROR;
        }

        self.update_count = self.update_count.saturating_add(1);

        if !peer.at_origin() {
            self.since_converge += 1;
        }

        if self.since_converge >= CONVERGE_EVERY {
            self.since_converge = 0;
            self.update(CONVERGE_RTT, &HeightCoordinates::origin(), CONVERGE_FACTOR);
        }

        true
    }

    /// Feed one RTT sample against another node's full position.
    pub fn update_with(&mut self, rtt: f32, peer: &VivaldiPosition) -> bool {
        self.update(rtt, &peer.coordinates, peer.error)
    }

    /// Estimated RTT in milliseconds, NaN if either position never received a sample.
    pub fn estimate_rtt(&self, other: &VivaldiPosition) -> f32 {
        if self.at_origin() || other.at_origin() {
            return f32::NAN;
        }

        self.coordinates.distance(&other.coordinates)
    }

    /// `x, y, height, error` as big-endian IEEE-754 floats.
    pub fn to_bytes(&self) -> [u8; SERIALIZED_SIZE] {
        let mut bytes = [0_u8; SERIALIZED_SIZE];

        let fields = [
            self.coordinates.x,
            self.coordinates.y,
            self.coordinates.h,
            self.error,
        ];

        for (chunk, field) in bytes.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_be_bytes());
        }

        bytes
    }

    /// Decode [Self::to_bytes]. Returns None for the wrong length, an
    /// invalid position, or an error below [ERROR_MIN].
    pub fn from_bytes(bytes: &[u8]) -> Option<VivaldiPosition> {
        if bytes.len() != SERIALIZED_SIZE {
            return None;
        }

        let mut fields = [0_f32; 4];

        for (field, chunk) in fields.iter_mut().zip(bytes.chunks_exact(4)) {
            *field = f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        let position = VivaldiPosition::with_error(
            HeightCoordinates::new(fields[0], fields[1], fields[2]),
            fields[3],
        );

        (position.is_valid() && position.error >= ERROR_MIN).then_some(position)
    }
}

fn valid(value: f32) -> bool {
    value.is_finite()
}
