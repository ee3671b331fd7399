//! Kademlia node Id, record key or lookup target.
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    cmp::Ordering,
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::DhtError;

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits, also the largest [Id::distance].
pub const MAX_DISTANCE: u8 = ID_SIZE as u8 * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id, record key or lookup target.
///
/// The derived [Ord] is raw lexicographic order, only ever used to break ties
/// deterministically. Proximity is always measured through [Id::xor].
pub struct Id([u8; ID_SIZE]);

impl Id {
    /// Generate a random Id.
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// A random Id at `distance` (see [Id::distance]) from this one.
    ///
    /// Distances above [MAX_DISTANCE] are clamped.
    pub fn random_at_distance(&self, distance: u8) -> Id {
        let distance = distance.min(MAX_DISTANCE);

        if distance == 0 {
            return *self;
        }

        let mut xor: [u8; ID_SIZE] = rand::thread_rng().gen();

        // First bit that differs from self, counted from the most significant.
        let bit = (MAX_DISTANCE - distance) as usize;
        let (byte, shift) = (bit / 8, 7 - bit % 8);

        for b in xor.iter_mut().take(byte) {
            *b = 0;
        }
        xor[byte] = (xor[byte] & ((1_u8 << shift) - 1)) | (1 << shift);

        Id(xor).xor(self)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE](crate::common::ID_SIZE).
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id, DhtError> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(DhtError::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// The Id with all bits unset.
    pub const fn zero() -> Id {
        Id([0; ID_SIZE])
    }

    /// Simplified XOR distance between this Id and a target Id.
    ///
    /// The distance is the number of trailing non zero bits in the XOR result.
    ///
    /// Distance to self is 0
    /// Distance to the furthest Id is 160
    /// Distance to an Id with 5 leading matching bits is 155
    pub fn distance(&self, other: &Id) -> u8 {
        for i in 0..ID_SIZE {
            let a = self.0[i];
            let b = other.0[i];

            if a != b {
                // leading zeros so far + leading zeros of this byte
                let leading_zeros = (i as u32 * 8 + (a ^ b).leading_zeros()) as u8;

                return MAX_DISTANCE - leading_zeros;
            }
        }

        0
    }

    /// Full XOR distance between this Id and another, as an Id.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            result[i] = a ^ b;
        }

        result.into()
    }

    /// Compare two XOR distances (as returned by [Id::xor]) as big-endian integers.
    ///
    /// [Ordering::Less] means `self` is the shorter distance.
    pub fn compare_distances(&self, other: &Id) -> Ordering {
        self.0.cmp(&other.0)
    }

    /// Compare the distances of `self` and `other` to the `pivot`, without allocating
    /// the intermediate XOR results.
    ///
    /// [Ordering::Less] means `self` is closer to the pivot than `other`.
    pub fn compute_and_compare_distances(&self, other: &Id, pivot: &Id) -> Ordering {
        for i in 0..ID_SIZE {
            let d1 = self.0[i] ^ pivot.0[i];
            let d2 = other.0[i] ^ pivot.0[i];

            match d1.cmp(&d2) {
                Ordering::Equal => continue,
                ordering => return ordering,
            }
        }

        Ordering::Equal
    }

    /// Returns a byte slice of this Id.
    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

impl From<Id> for [u8; ID_SIZE] {
    fn from(value: Id) -> Self {
        value.0
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;

        Id::from_bytes(bytes).map_err(serde::de::Error::custom)
    }
}

impl FromStr for Id {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Id, DhtError> {
        if s.len() % 2 != 0 {
            return Err(DhtError::InvalidIdEncoding(
                "Number of Hex characters should be even".into(),
            ));
        }

        let mut bytes = Vec::with_capacity(s.len() / 2);

        for i in 0..s.len() / 2 {
            let byte = s
                .get(i * 2..i * 2 + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| DhtError::InvalidIdEncoding("Invalid hex character".into()))?;

            bytes.push(byte);
        }

        Id::from_bytes(bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn distance_to_self() {
        let id = Id::random();
        let distance = id.distance(&id);
        assert_eq!(distance, 0)
    }

    #[test]
    fn distance_to_id() {
        let id = Id::from_str("0639A1E24FBB8AB277DF033476AB0DE10FAB3BDC").unwrap();

        let target = Id::from_str("035b1aeb9737ade1a80933594f405d3f772aa08e").unwrap();

        let distance = id.distance(&target);

        assert_eq!(distance, 155)
    }

    #[test]
    fn distance_to_random_id() {
        let id = Id::random();
        let target = Id::random();

        let distance = id.distance(&target);

        assert_ne!(distance, 0)
    }

    #[test]
    fn distance_to_furthest() {
        let id = Id::random();

        let mut opposite = [0_u8; 20];
        for (i, &value) in id.as_bytes().iter().enumerate() {
            opposite[i] = value ^ 0xff;
        }
        let target = Id::from_bytes(opposite).unwrap();

        let distance = id.distance(&target);

        assert_eq!(distance, MAX_DISTANCE)
    }

    #[test]
    fn random_at_distance() {
        let id = Id::random();

        for distance in [1, 7, 8, 9, 100, 159, MAX_DISTANCE] {
            assert_eq!(id.distance(&id.random_at_distance(distance)), distance);
        }

        assert_eq!(id.random_at_distance(0), id);
        assert_eq!(id.distance(&id.random_at_distance(200)), MAX_DISTANCE);
    }

    #[test]
    fn xor_is_symmetric_and_zero_only_for_identity() {
        for _ in 0..100 {
            let a = Id::random();
            let b = Id::random();

            assert_eq!(a.xor(&a), Id::zero());
            assert_eq!(a.xor(&b), b.xor(&a));
            assert_ne!(a.xor(&b), Id::zero());
        }
    }

    #[test]
    fn compute_and_compare_matches_xor_ordering() {
        for _ in 0..100 {
            let a = Id::random();
            let b = Id::random();
            let pivot = Id::random();

            let expected = a.xor(&pivot).compare_distances(&b.xor(&pivot));

            assert_eq!(a.compute_and_compare_distances(&b, &pivot), expected);
            assert_eq!(
                b.compute_and_compare_distances(&a, &pivot),
                expected.reverse()
            );
        }
    }

    #[test]
    fn compare_is_total_order() {
        let pivot = Id::random();
        let mut ids = (0..50).map(|_| Id::random()).collect::<Vec<_>>();

        ids.sort_by(|a, b| a.compute_and_compare_distances(b, &pivot));

        for pair in ids.windows(2) {
            assert_ne!(
                pair[0].compute_and_compare_distances(&pair[1], &pivot),
                Ordering::Greater
            );
            assert!(pair[0].distance(&pivot) <= pair[1].distance(&pivot));
        }
    }

    #[test]
    fn display_round_trip() {
        let id = Id::random();

        assert_eq!(Id::from_str(&id.to_string()).unwrap(), id);
    }
}
