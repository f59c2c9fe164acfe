use core::fmt;

use sha2::Digest;

use crate::buffer::StaticBuffer;
use crate::crypt::fernet::{FERNET_MAX_PADDING_SIZE, FERNET_OVERHEAD_SIZE};
use crate::error::RnsError;
use crate::hash::{AddressHash, Hash, ADDRESS_HASH_SIZE};

// Default MTU (500) minus the worst-case header: flags + hops + two address
// fields + context. 500 - (2 + 16*2 + 1) = 465, held one lower for parity
// with transports that reserve a framing byte.
pub const PACKET_MDU: usize = 464;
pub const MAX_HOPS: u8 = 127;

pub const ENCRYPTED_MDU: usize = PACKET_MDU - FERNET_OVERHEAD_SIZE - FERNET_MAX_PADDING_SIZE;

/// Flags-byte bit assignment:
/// bit 7 IFAC, bit 6 header type, bit 5 context flag, bits 4-3 destination
/// type, bits 2-1 packet type, bit 0 transport type.
const FLAG_IFAC: u8 = 7;
const FLAG_HEADER_TYPE: u8 = 6;
const FLAG_CONTEXT: u8 = 5;
const FLAG_DESTINATION_TYPE: u8 = 3;
const FLAG_PACKET_TYPE: u8 = 1;

/// Bits of the flags byte covered by the packet hash: context flag,
/// destination type and packet type. IFAC, header type and transport type
/// vary in transit and must not change the hash.
const HASHABLE_FLAGS_MASK: u8 = 0b0011_1110;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum IfacFlag {
    Open = 0b0,
    Authenticated = 0b1,
}

impl From<u8> for IfacFlag {
    fn from(value: u8) -> Self {
        match value & 0b1 {
            0b1 => IfacFlag::Authenticated,
            _ => IfacFlag::Open,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum HeaderType {
    Type1 = 0b0,
    Type2 = 0b1,
}

impl From<u8> for HeaderType {
    fn from(value: u8) -> Self {
        match value & 0b1 {
            0b1 => HeaderType::Type2,
            _ => HeaderType::Type1,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ContextFlag {
    Unset = 0b0,
    Set = 0b1,
}

impl From<u8> for ContextFlag {
    fn from(value: u8) -> Self {
        match value & 0b1 {
            0b1 => ContextFlag::Set,
            _ => ContextFlag::Unset,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum TransportType {
    Broadcast = 0b0,
    Transport = 0b1,
}

impl From<u8> for TransportType {
    fn from(value: u8) -> Self {
        match value & 0b1 {
            0b1 => TransportType::Transport,
            _ => TransportType::Broadcast,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum DestinationType {
    Single = 0b00,
    Group = 0b01,
    Plain = 0b10,
    Link = 0b11,
}

impl From<u8> for DestinationType {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b01 => DestinationType::Group,
            0b10 => DestinationType::Plain,
            0b11 => DestinationType::Link,
            _ => DestinationType::Single,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PacketType {
    Data = 0b00,
    Announce = 0b01,
    LinkRequest = 0b10,
    Proof = 0b11,
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b01 => PacketType::Announce,
            0b10 => PacketType::LinkRequest,
            0b11 => PacketType::Proof,
            _ => PacketType::Data,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PacketContext {
    None = 0x00,
    Resource = 0x01,
    ResourceAdvertisement = 0x02,
    ResourceRequest = 0x03,
    ResourceHashUpdate = 0x04,
    ResourceProof = 0x05,
    ResourceInitiatorCancel = 0x06,
    ResourceReceiverCancel = 0x07,
    CacheRequest = 0x08,
    Request = 0x09,
    Response = 0x0A,
    PathResponse = 0x0B,
    Command = 0x0C,
    CommandStatus = 0x0D,
    Channel = 0x0E,
    KeepAlive = 0xFA,
    LinkIdentify = 0xFB,
    LinkClose = 0xFC,
    LinkProof = 0xFD,
    LinkRtt = 0xFE,
    LinkRequestProof = 0xFF,
}

impl From<u8> for PacketContext {
    fn from(value: u8) -> Self {
        match value {
            0x01 => PacketContext::Resource,
            0x02 => PacketContext::ResourceAdvertisement,
            0x03 => PacketContext::ResourceRequest,
            0x04 => PacketContext::ResourceHashUpdate,
            0x05 => PacketContext::ResourceProof,
            0x06 => PacketContext::ResourceInitiatorCancel,
            0x07 => PacketContext::ResourceReceiverCancel,
            0x08 => PacketContext::CacheRequest,
            0x09 => PacketContext::Request,
            0x0A => PacketContext::Response,
            0x0B => PacketContext::PathResponse,
            0x0C => PacketContext::Command,
            0x0D => PacketContext::CommandStatus,
            0x0E => PacketContext::Channel,
            0xFA => PacketContext::KeepAlive,
            0xFB => PacketContext::LinkIdentify,
            0xFC => PacketContext::LinkClose,
            0xFD => PacketContext::LinkProof,
            0xFE => PacketContext::LinkRtt,
            0xFF => PacketContext::LinkRequestProof,
            _ => PacketContext::None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Header {
    pub ifac_flag: IfacFlag,
    pub header_type: HeaderType,
    pub context_flag: ContextFlag,
    pub transport_type: TransportType,
    pub destination_type: DestinationType,
    pub packet_type: PacketType,
    pub hops: u8,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            ifac_flag: IfacFlag::Open,
            header_type: HeaderType::Type1,
            context_flag: ContextFlag::Unset,
            transport_type: TransportType::Broadcast,
            destination_type: DestinationType::Single,
            packet_type: PacketType::Data,
            hops: 0,
        }
    }
}

impl Header {
    pub fn to_meta(&self) -> u8 {
        (self.ifac_flag as u8) << FLAG_IFAC
            | (self.header_type as u8) << FLAG_HEADER_TYPE
            | (self.context_flag as u8) << FLAG_CONTEXT
            | (self.destination_type as u8) << FLAG_DESTINATION_TYPE
            | (self.packet_type as u8) << FLAG_PACKET_TYPE
            | (self.transport_type as u8)
    }

    pub fn from_meta(meta: u8) -> Self {
        Self {
            ifac_flag: IfacFlag::from(meta >> FLAG_IFAC),
            header_type: HeaderType::from(meta >> FLAG_HEADER_TYPE),
            context_flag: ContextFlag::from(meta >> FLAG_CONTEXT),
            destination_type: DestinationType::from(meta >> FLAG_DESTINATION_TYPE),
            packet_type: PacketType::from(meta >> FLAG_PACKET_TYPE),
            transport_type: TransportType::from(meta),
            hops: 0,
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0>8b}.{}", self.to_meta(), self.hops)
    }
}

pub type PacketDataBuffer = StaticBuffer<PACKET_MDU>;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Packet {
    pub header: Header,
    pub destination: AddressHash,
    pub transport: Option<AddressHash>,
    pub context: PacketContext,
    pub data: PacketDataBuffer,
}

impl Packet {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RnsError> {
        let min_len = 2 + ADDRESS_HASH_SIZE + 1;
        if bytes.len() < min_len {
            return Err(RnsError::Truncated);
        }

        let mut header = Header::from_meta(bytes[0]);
        let hops = bytes[1];
        if hops > MAX_HOPS {
            return Err(RnsError::MalformedPacket);
        }
        header.hops = hops;

        let mut idx = 2;

        let destination = AddressHash::try_from_slice(&bytes[idx..idx + ADDRESS_HASH_SIZE])
            .map_err(|_| RnsError::Truncated)?;
        idx += ADDRESS_HASH_SIZE;

        let transport = if header.header_type == HeaderType::Type2 {
            if bytes.len() < idx + ADDRESS_HASH_SIZE + 1 {
                return Err(RnsError::Truncated);
            }
            let transport = AddressHash::try_from_slice(&bytes[idx..idx + ADDRESS_HASH_SIZE])
                .map_err(|_| RnsError::Truncated)?;
            idx += ADDRESS_HASH_SIZE;
            Some(transport)
        } else {
            None
        };

        if bytes.len() < idx + 1 {
            return Err(RnsError::Truncated);
        }

        let context = PacketContext::from(bytes[idx]);
        idx += 1;

        if bytes.len() - idx > PACKET_MDU {
            return Err(RnsError::MalformedPacket);
        }

        Ok(Self {
            header,
            destination,
            transport,
            context,
            data: PacketDataBuffer::new_from_slice(&bytes[idx..]),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RnsError> {
        if self.header.hops > MAX_HOPS {
            return Err(RnsError::MalformedPacket);
        }

        let mut out = Vec::with_capacity(2 + ADDRESS_HASH_SIZE * 2 + 1 + self.data.len());
        out.push(self.header.to_meta());
        out.push(self.header.hops);

        out.extend_from_slice(self.destination.as_slice());

        if self.header.header_type == HeaderType::Type2 {
            let transport = self.transport.ok_or(RnsError::MalformedPacket)?;
            out.extend_from_slice(transport.as_slice());
        }

        out.push(self.context as u8);
        out.extend_from_slice(self.data.as_slice());
        Ok(out)
    }

    /// The serialized packet with hops zeroed and the transit-variant header
    /// bits masked out; the stable input of the packet hash.
    fn hashable_part(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + ADDRESS_HASH_SIZE + 1 + self.data.len());
        out.push(self.header.to_meta() & HASHABLE_FLAGS_MASK);
        out.push(0);
        out.extend_from_slice(self.destination.as_slice());
        out.push(self.context as u8);
        out.extend_from_slice(self.data.as_slice());
        out
    }

    /// SHA-256(destination hash || hashable part); the wire-stable packet
    /// identifier. Truncate to 16 bytes for table keys.
    pub fn hash(&self) -> Hash {
        Hash::new(
            Hash::generator()
                .chain_update(self.destination.as_slice())
                .chain_update(&self.hashable_part())
                .finalize()
                .into(),
        )
    }

    pub fn truncated_hash(&self) -> AddressHash {
        AddressHash::new_from_hash(&self.hash())
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            header: Header::default(),
            destination: AddressHash::new_empty(),
            transport: None,
            context: PacketContext::None,
            data: PacketDataBuffer::new(),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.header)?;
        if let Some(transport) = self.transport {
            write!(f, " via {}", transport)?;
        }
        write!(f, " {} {}B]", self.destination, self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ContextFlag, DestinationType, Header, HeaderType, IfacFlag, Packet, PacketContext,
        PacketDataBuffer, PacketType, TransportType,
    };
    use crate::hash::AddressHash;

    fn sample_packet() -> Packet {
        Packet {
            header: Header {
                ifac_flag: IfacFlag::Open,
                header_type: HeaderType::Type1,
                context_flag: ContextFlag::Set,
                transport_type: TransportType::Broadcast,
                destination_type: DestinationType::Single,
                packet_type: PacketType::Announce,
                hops: 3,
            },
            destination: AddressHash::new_from_slice(b"destination"),
            transport: None,
            context: PacketContext::None,
            data: PacketDataBuffer::new_from_slice(b"payload bytes"),
        }
    }

    #[test]
    fn meta_bit_assignment_matches_wire_layout() {
        let header = Header {
            ifac_flag: IfacFlag::Authenticated,
            header_type: HeaderType::Type2,
            context_flag: ContextFlag::Set,
            transport_type: TransportType::Transport,
            destination_type: DestinationType::Link,
            packet_type: PacketType::Proof,
            hops: 0,
        };

        // 1 1 1 11 11 1
        assert_eq!(header.to_meta(), 0b1111_1111);

        let header = Header {
            ifac_flag: IfacFlag::Open,
            header_type: HeaderType::Type1,
            context_flag: ContextFlag::Unset,
            transport_type: TransportType::Transport,
            destination_type: DestinationType::Plain,
            packet_type: PacketType::Announce,
            hops: 0,
        };

        // dest type Plain = 10 at bits 4-3, packet type Announce = 01 at
        // bits 2-1, transport bit set.
        assert_eq!(header.to_meta(), 0b0001_0011);
        assert_eq!(Header::from_meta(0b0001_0011), header);
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let packet = sample_packet();
        let bytes = packet.to_bytes().expect("serialized");
        let restored = Packet::from_bytes(&bytes).expect("parsed");
        assert_eq!(restored, packet);
    }

    #[test]
    fn pack_unpack_roundtrip_with_transport_id() {
        let mut packet = sample_packet();
        packet.header.header_type = HeaderType::Type2;
        packet.header.transport_type = TransportType::Transport;
        packet.transport = Some(AddressHash::new_from_slice(b"next-hop"));

        let bytes = packet.to_bytes().expect("serialized");
        let restored = Packet::from_bytes(&bytes).expect("parsed");
        assert_eq!(restored, packet);
    }

    #[test]
    fn hash_is_stable_modulo_hops_and_transport() {
        let packet = sample_packet();

        let mut hopped = packet;
        hopped.header.hops = 90;
        assert_eq!(packet.hash(), hopped.hash());

        let mut forwarded = packet;
        forwarded.header.header_type = HeaderType::Type2;
        forwarded.header.transport_type = TransportType::Transport;
        forwarded.transport = Some(AddressHash::new_from_slice(b"relay"));
        assert_eq!(packet.hash(), forwarded.hash());
    }

    #[test]
    fn hash_depends_on_payload_and_destination() {
        let packet = sample_packet();

        let mut other_payload = packet;
        other_payload.data = PacketDataBuffer::new_from_slice(b"other payload");
        assert_ne!(packet.hash(), other_payload.hash());

        let mut other_destination = packet;
        other_destination.destination = AddressHash::new_from_slice(b"elsewhere");
        assert_ne!(packet.hash(), other_destination.hash());
    }

    #[test]
    fn hops_boundary() {
        let mut packet = sample_packet();
        packet.header.hops = 127;
        let bytes = packet.to_bytes().expect("hops 127 is valid");
        assert!(Packet::from_bytes(&bytes).is_ok());

        packet.header.hops = 128;
        assert!(packet.to_bytes().is_err());

        let mut raw = sample_packet().to_bytes().expect("serialized");
        raw[1] = 128;
        assert!(Packet::from_bytes(&raw).is_err());
    }

    #[test]
    fn empty_payload_survives_roundtrip() {
        let mut packet = sample_packet();
        packet.data = PacketDataBuffer::new();
        let bytes = packet.to_bytes().expect("serialized");
        let restored = Packet::from_bytes(&bytes).expect("parsed");
        assert!(restored.data.is_empty());
        assert_eq!(restored, packet);
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let packet = sample_packet();
        let bytes = packet.to_bytes().expect("serialized");

        assert!(Packet::from_bytes(&bytes[..10]).is_err());

        let mut type2 = sample_packet();
        type2.header.header_type = HeaderType::Type2;
        type2.transport = Some(AddressHash::new_from_slice(b"next-hop"));
        let bytes = type2.to_bytes().expect("serialized");
        // Cut inside the transport id field.
        assert!(Packet::from_bytes(&bytes[..2 + 16 + 8]).is_err());
    }

    #[test]
    fn type2_serialization_requires_transport_id() {
        let mut packet = sample_packet();
        packet.header.header_type = HeaderType::Type2;
        packet.transport = None;
        assert!(packet.to_bytes().is_err());
    }
}
