//! Router state export and import, so a restarted node does not have to seed from scratch.
//!
//! Layout, all integers big endian:
//!
//! ```text
//! count: u32
//! count * { time_alive_ms: u64, length: u16, contact: [u8; length] (bencoded) }
//! crc32: u32 (over everything before it)
//! ```

use std::cmp::Ordering;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use crc::{Crc, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};

use crate::common::{Contact, Id};
use crate::core::vivaldi::VivaldiPosition;
use crate::DhtError;

const CHECKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, Serialize, Deserialize)]
struct ContactRecord {
    #[serde(rename = "i")]
    id: Id,
    #[serde(rename = "a")]
    ip: u32,
    #[serde(rename = "p")]
    port: u16,
    #[serde(
        rename = "v",
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_bytes"
    )]
    position: Option<Vec<u8>>,
}

/// Most valuable first: imported and still alive, alive, imported and not failing, the rest.
fn group(contact: &Contact) -> u8 {
    match (contact.is_imported(), contact.is_verified()) {
        (true, true) => 0,
        (false, true) => 1,
        (true, false) if !contact.is_failing() => 2,
        _ => 3,
    }
}

/// Serialize up to `max` valid contacts, most valuable and closest to `local_id` first.
pub fn export_contacts(local_id: &Id, contacts: &[Contact], max: usize) -> Result<Vec<u8>, DhtError> {
    let mut contacts: Vec<&Contact> = contacts.iter().filter(|c| c.is_valid()).collect();

    contacts.sort_by(|a, b| match group(a).cmp(&group(b)) {
        Ordering::Equal => a.id().compute_and_compare_distances(b.id(), local_id),
        ordering => ordering,
    });
    contacts.truncate(max);

    let mut bytes = Vec::with_capacity(4 + contacts.len() * 64);
    bytes.extend_from_slice(&(contacts.len() as u32).to_be_bytes());

    for contact in contacts {
        let record = ContactRecord {
            id: *contact.id(),
            ip: (*contact.address().ip()).into(),
            port: contact.address().port(),
            position: contact.position().map(|p| p.to_bytes().to_vec()),
        };

        let encoded = serde_bencode::to_bytes(&record)
            .map_err(|error| DhtError::EncodeFailure(error.to_string()))?;
        let length = u16::try_from(encoded.len())
            .map_err(|_| DhtError::EncodeFailure("contact record too large".to_string()))?;

        bytes.extend_from_slice(&(contact.time_alive().as_millis() as u64).to_be_bytes());
        bytes.extend_from_slice(&length.to_be_bytes());
        bytes.extend_from_slice(&encoded);
    }

    let checksum = CHECKSUM.checksum(&bytes);
    bytes.extend_from_slice(&checksum.to_be_bytes());

    Ok(bytes)
}

/// Parse exported state, all or nothing.
///
/// Returned contacts are marked imported, with their time alive restored.
pub fn import_contacts(bytes: &[u8]) -> Result<Vec<Contact>, DhtError> {
    let corrupt = |reason: &str| DhtError::ImportCorrupt(reason.to_string());

    if bytes.len() < 8 {
        return Err(corrupt("too short"));
    }

    let (body, trailer) = bytes.split_at(bytes.len() - 4);
    let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);

    if CHECKSUM.checksum(body) != expected {
        return Err(corrupt("checksum mismatch"));
    }

    let mut reader = Reader { bytes: body };
    let count = u32::from_be_bytes(reader.array().ok_or_else(|| corrupt("missing count"))?);

    let mut contacts = Vec::with_capacity((count as usize).min(1024));

    for _ in 0..count {
        let time_alive = u64::from_be_bytes(reader.array().ok_or_else(|| corrupt("truncated"))?);
        let length = u16::from_be_bytes(reader.array().ok_or_else(|| corrupt("truncated"))?);
        let encoded = reader
            .take(length as usize)
            .ok_or_else(|| corrupt("truncated"))?;

        let record: ContactRecord = serde_bencode::from_bytes(encoded)
            .map_err(|error| DhtError::ImportCorrupt(error.to_string()))?;

        let position = match record.position {
            Some(bytes) => {
                Some(VivaldiPosition::from_bytes(&bytes).ok_or_else(|| corrupt("invalid position"))?)
            }
            None => None,
        };

        let mut contact = Contact::new(
            record.id,
            SocketAddrV4::new(Ipv4Addr::from(record.ip), record.port),
        )
        .with_position(position)
        .with_imported(true);
        contact.set_time_alive(Duration::from_millis(time_alive));

        contacts.push(contact);
    }

    if !reader.bytes.is_empty() {
        return Err(corrupt("trailing bytes"));
    }

    Ok(contacts)
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.bytes.len() < n {
            return None;
        }

        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;

        Some(head)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vivaldi::HeightCoordinates;

    #[test]
    fn export_import() {
        let local = Id::random();

        let mut alive = Contact::unique(1).with_position(Some(VivaldiPosition::with_error(
            HeightCoordinates::new(1.0, 2.0, 3.0),
            0.5,
        )));
        alive.mark_alive();

        let contacts = vec![Contact::unique(2), alive.clone(), Contact::random()];

        let bytes = export_contacts(&local, &contacts, 100).unwrap();
        let imported = import_contacts(&bytes).unwrap();

        // The invalid random contact is skipped, the alive one comes first.
        assert_eq!(imported.len(), 2);
        assert_eq!(imported[0], alive);
        assert_eq!(imported[0].position(), alive.position());
        assert!(imported.iter().all(|c| c.is_imported()));
    }

    #[test]
    fn export_respects_max_and_distance() {
        let local = Id::random();
        let contacts: Vec<Contact> = (1..=10).map(Contact::unique).collect();

        let imported = import_contacts(&export_contacts(&local, &contacts, 3).unwrap()).unwrap();

        let mut expected = contacts.clone();
        expected.sort_by(|a, b| a.id().compute_and_compare_distances(b.id(), &local));

        assert_eq!(imported, expected[..3].to_vec());
    }

    #[test]
    fn corrupt_state_imports_nothing() {
        let contacts: Vec<Contact> = (1..=3).map(Contact::unique).collect();
        let mut bytes = export_contacts(&Id::random(), &contacts, 100).unwrap();

        bytes[10] ^= 0xff;

        assert!(matches!(
            import_contacts(&bytes),
            Err(DhtError::ImportCorrupt(_))
        ));
        assert!(matches!(
            import_contacts(&[0, 0]),
            Err(DhtError::ImportCorrupt(_))
        ));
    }

    #[test]
    fn empty_state() {
        let bytes = export_contacts(&Id::random(), &[], 100).unwrap();

        assert_eq!(import_contacts(&bytes).unwrap(), vec![]);
    }
}
