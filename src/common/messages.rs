//! Messages exchanged between DHT nodes.
//!
//! The control plane only builds and consumes [RequestSpecific] and
//! [ResponseSpecific]; transports decide how to frame them. [Message] is the
//! bencoded envelope used by the in-memory transport and available to others.

use std::net::{Ipv4Addr, SocketAddrV4};

use serde::{Deserialize, Serialize};

use crate::common::{Contact, Id, TransportValue};
use crate::core::vivaldi::VivaldiPosition;
use crate::DhtError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "t")]
    pub transaction_id: u32,

    /// The node sending this message.
    #[serde(rename = "s")]
    pub sender: ContactInfo,

    /// Sender's Vivaldi position as four floats.
    #[serde(
        rename = "p",
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_bytes"
    )]
    pub position: Option<Vec<u8>>,

    #[serde(rename = "y")]
    pub message_type: MessageType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "q")]
    Request(RequestSpecific),
    #[serde(rename = "r")]
    Response(ResponseSpecific),
    #[serde(rename = "e")]
    Error(ErrorSpecific),
}

impl Message {
    pub fn to_bytes(&self) -> Result<Vec<u8>, DhtError> {
        serde_bencode::to_bytes(self).map_err(|error| DhtError::EncodeFailure(error.to_string()))
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message, DhtError> {
        serde_bencode::from_bytes(bytes.as_ref())
            .map_err(|error| DhtError::EncodeFailure(error.to_string()))
    }

    /// The sender as a contact carrying its decoded position, if any.
    pub fn sender_contact(&self) -> Contact {
        Contact::from(&self.sender).with_position(
            self.position
                .as_deref()
                .and_then(VivaldiPosition::from_bytes),
        )
    }
}

// === Requests ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestSpecific {
    #[serde(rename = "ping")]
    Ping(PingArguments),
    #[serde(rename = "find_node")]
    FindNode(FindNodeRequestArguments),
    #[serde(rename = "find_value")]
    FindValue(FindValueRequestArguments),
    #[serde(rename = "store")]
    Store(StoreRequestArguments),
    #[serde(rename = "remove")]
    Remove(RemoveRequestArguments),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingArguments {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindValueRequestArguments {
    pub key: Id,
    pub flags: u16,
    /// 0 for as many as the responder has.
    pub max_values: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRequestArguments {
    pub key: Id,
    pub values: Vec<TransportValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveRequestArguments {
    pub key: Id,
}

impl RequestSpecific {
    pub fn ping() -> Self {
        RequestSpecific::Ping(PingArguments {})
    }
}

// === Responses ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseSpecific {
    #[serde(rename = "ping")]
    Ping(PingArguments),
    #[serde(rename = "find_node")]
    FindNode(FindNodeResponseArguments),
    #[serde(rename = "find_value")]
    FindValue(FindValueResponseArguments),
    #[serde(rename = "store")]
    Store(StoreResponseArguments),
    #[serde(rename = "remove")]
    Remove(RemoveResponseArguments),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindNodeResponseArguments {
    pub contacts: Vec<ContactInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindValueResponseArguments {
    /// Values stored under the key, empty if the responder has none.
    pub values: Vec<TransportValue>,
    /// Closer contacts, only when no values are returned.
    pub contacts: Vec<ContactInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreResponseArguments {
    pub stored: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveResponseArguments {
    pub removed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSpecific {
    pub code: i32,
    pub description: String,
}

// === Contacts on the wire ===

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Compact contact as carried in FIND_NODE and FIND_VALUE responses.
pub struct ContactInfo {
    pub id: Id,
    pub ip: u32,
    pub port: u16,
}

impl ContactInfo {
    pub fn address(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.ip), self.port)
    }
}

impl From<&Contact> for ContactInfo {
    fn from(contact: &Contact) -> Self {
        Self {
            id: *contact.id(),
            ip: (*contact.address().ip()).into(),
            port: contact.address().port(),
        }
    }
}

impl From<&ContactInfo> for Contact {
    fn from(info: &ContactInfo) -> Self {
        Contact::new(info.id, info.address())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::core::vivaldi::HeightCoordinates;

    #[test]
    fn find_value_response_with_position() {
        let position = VivaldiPosition::with_error(HeightCoordinates::new(1.0, 2.0, 0.5), 3.0);
        let sender = Contact::new(Id::random(), "1.2.3.4:6881".parse().unwrap());

        let message = Message {
            transaction_id: 7,
            sender: ContactInfo::from(&sender),
            position: Some(position.to_bytes().to_vec()),
            message_type: MessageType::Response(ResponseSpecific::FindValue(
                FindValueResponseArguments {
                    values: vec![TransportValue {
                        value: Bytes::from_static(b"hello"),
                        flags: 1,
                        life_hours: 2,
                        replication_control: 0,
                        originator: *sender.id(),
                        created: 1_700_000_000,
                    }],
                    contacts: vec![],
                },
            )),
        };

        let bytes = message.to_bytes().unwrap();
        let decoded = Message::from_bytes(bytes).unwrap();

        assert_eq!(decoded, message);

        let contact = decoded.sender_contact();
        assert_eq!(contact, sender);
        assert_eq!(
            contact.position().map(|p| *p.coordinates()),
            Some(*position.coordinates())
        );
    }

    #[test]
    fn ping_request_without_position() {
        let message = Message {
            transaction_id: 1,
            sender: ContactInfo::from(&Contact::new(
                Id::random(),
                "127.0.0.1:1".parse().unwrap(),
            )),
            position: None,
            message_type: MessageType::Request(RequestSpecific::ping()),
        };

        let decoded = Message::from_bytes(message.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded, message);
        assert!(decoded.sender_contact().position().is_none());
    }

    #[test]
    fn garbage_is_an_encode_failure() {
        assert!(matches!(
            Message::from_bytes(b"not bencode"),
            Err(DhtError::EncodeFailure(_))
        ));
    }
}
