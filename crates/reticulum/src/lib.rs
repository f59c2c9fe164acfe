pub mod buffer;
pub mod bytes;
pub mod channel;
pub mod config;
pub mod crypt;
pub mod destination;
pub mod error;
pub mod hash;
pub mod identity;
pub mod iface;
pub mod node;
pub mod packet;
pub mod ratchet;
pub mod receipt;
pub mod resource;
pub mod slots;
pub mod storage;
pub mod time;
pub mod transport;

pub use crate::bytes::Bytes;
pub use crate::config::{NodeConfig, TransportConfig};
pub use crate::destination::{group_decrypt, group_encrypt, DestinationName};
pub use crate::error::RnsError;
pub use crate::hash::{AddressHash, Hash};
pub use crate::identity::{Identity, PrivateIdentity};
pub use crate::node::Node;
pub use crate::packet::Packet;
pub use crate::receipt::{PacketReceipt, ReceiptStatus};
pub use crate::transport::{Transport, TransportEvent};
