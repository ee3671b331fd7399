//! Miscellaneous common structs used throughout the library.

mod closest_contacts;
mod contact;
mod id;
mod key;
pub mod messages;
mod record;
mod routing_table;

pub use closest_contacts::*;
pub use contact::*;
pub use id::*;
pub use key::*;
pub use messages::*;
pub use record::*;
pub use routing_table::*;
