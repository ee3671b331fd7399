//! Mapping user keys to [Id]s.

use sha1_smol::Sha1;

use crate::common::{Id, ID_SIZE};
use crate::DhtError;

/// Bytes at the start of a key kept by [obfuscated_key], so a lookup for the
/// obfuscated key still lands in the same region of the key space.
const OBFUSCATION_PREFIX: usize = 5;
/// Bytes at the end of a key kept by [obfuscated_key].
const OBFUSCATION_SUFFIX: usize = 2;

/// Turn an arbitrary user key into an [Id].
///
/// With `encode` the key is hashed with SHA-1, otherwise it has to already be
/// exactly [ID_SIZE] bytes long.
pub fn encode_key(key: &[u8], encode: bool) -> Result<Id, DhtError> {
    if encode {
        return Ok(Id::from(Sha1::from(key).digest().bytes()));
    }

    Id::from_bytes(key).map_err(|_| {
        DhtError::EncodeFailure(format!(
            "expected a {ID_SIZE} bytes key when key encoding is disabled, got {}",
            key.len()
        ))
    })
}

/// A deterministic, one-way transform of `plain` used on the wire in place of
/// a sensitive key.
///
/// The first 5 and last 2 bytes are kept, every byte in between is derived
/// from the SHA-1 of the plain key and differs from the plain byte at the same
/// position past the sixth, so the result never equals `plain`.
pub fn obfuscated_key(plain: &Id) -> Id {
    let plain = plain.as_bytes();
    let digest = Sha1::from(plain).digest().bytes();

    let mut obfuscated = [0_u8; ID_SIZE];

    obfuscated[..OBFUSCATION_PREFIX].copy_from_slice(&plain[..OBFUSCATION_PREFIX]);

    for i in OBFUSCATION_PREFIX..ID_SIZE - OBFUSCATION_SUFFIX {
        obfuscated[i] = digest[i];

        if i > OBFUSCATION_PREFIX && obfuscated[i] == plain[i] {
            obfuscated[i] ^= 1;
        }
    }

    obfuscated[ID_SIZE - OBFUSCATION_SUFFIX..]
        .copy_from_slice(&plain[ID_SIZE - OBFUSCATION_SUFFIX..]);

    Id::from(obfuscated)
}
