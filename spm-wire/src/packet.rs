//! Parsed packet field snapshots.
//!
//! The classifier never looks at raw frame bytes directly. Packet intake builds a
//! [`PacketFields`] snapshot (either by hand or with [`PacketFields::parse`]) and hands it
//! to the rule engine together with the packet's current priority.

use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
};

use bytes::Buf;
use thiserror::Error;

/// EtherType for IPv4 packets (0x0800).
pub const ETH_P_IP: u16 = 0x0800;

/// EtherType for IPv6 packets (0x86DD).
pub const ETH_P_IPV6: u16 = 0x86DD;

/// EtherType for 802.1Q VLAN tagged frames (0x8100).
pub const ETH_P_8021Q: u16 = 0x8100;

/// EtherType for IEEE 1905.1 control messages (0x893A).
pub const ETH_P_1905: u16 = 0x893A;

/// IP protocol number for TCP.
pub const IPPROTO_TCP: u8 = 6;

/// IP protocol number for UDP.
pub const IPPROTO_UDP: u8 = 17;

const ETH_HLEN: usize = 14;
const VLAN_HLEN: usize = 4;
const IPV4_MIN_HLEN: usize = 20;
const IPV6_HLEN: usize = 40;
const TCP_MIN_HLEN: usize = 20;
const UDP_HLEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Frame truncated: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },
}

/// A 48-bit Ethernet hardware address.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    #[inline]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// An 802.1Q tag as carried in the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VlanTag {
    /// Tag control information: PCP (3 bits), DEI (1 bit), VID (12 bits).
    pub tci: u16,
}

impl VlanTag {
    /// Returns the 12-bit VLAN identifier.
    #[inline]
    pub const fn id(&self) -> u16 {
        self.tci & 0x0FFF
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Fields {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    /// The full differentiated services byte (DSCP in the upper 6 bits, ECN in the lower 2).
    pub dsfield: u8,
    pub protocol: u8,
}

impl Ipv4Fields {
    /// The 6-bit differentiated services code point.
    #[inline]
    pub const fn dscp(&self) -> u8 {
        self.dsfield >> 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Fields {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    /// The traffic class byte, laid out like the IPv4 differentiated services byte.
    pub traffic_class: u8,
    pub next_header: u8,
}

/// The network layer of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Ipv4(Ipv4Fields),
    Ipv6(Ipv6Fields),
    /// Anything that is not (parseable as) IP. Carries the EtherType.
    Other(u16),
}

impl Network {
    #[inline]
    pub const fn ipv4(&self) -> Option<&Ipv4Fields> {
        match self {
            Self::Ipv4(v4) => Some(v4),
            _ => None,
        }
    }

    #[inline]
    pub const fn ipv6(&self) -> Option<&Ipv6Fields> {
        match self {
            Self::Ipv6(v6) => Some(v6),
            _ => None,
        }
    }
}

/// Source and destination ports of a TCP or UDP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ports {
    pub src: u16,
    pub dst: u16,
}

/// The header fields of one packet that rules can match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketFields {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    /// The EtherType of the outermost Ethernet header.
    pub ether_type: u16,
    /// The in-band 802.1Q tag, if the frame carries one.
    pub vlan: Option<VlanTag>,
    pub network: Network,
    /// Present only for TCP and UDP with a complete L4 header.
    pub ports: Option<Ports>,
}

impl PacketFields {
    /// Creates a snapshot of a non-IP frame between the given hardware addresses.
    pub const fn ethernet(src_mac: MacAddr, dst_mac: MacAddr, ether_type: u16) -> Self {
        Self {
            src_mac,
            dst_mac,
            ether_type,
            vlan: None,
            network: Network::Other(ether_type),
            ports: None,
        }
    }

    /// Parses an Ethernet frame. Only a truncated Ethernet header is an error: a truncated or
    /// malformed network or transport header degrades to [`Network::Other`] or missing ports,
    /// since rules on those layers then simply don't match.
    ///
    /// Does not allocate.
    pub fn parse(frame: &[u8]) -> Result<Self, ParseError> {
        let mut buf = frame;
        ensure(buf.remaining(), ETH_HLEN)?;

        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        buf.copy_to_slice(&mut dst);
        buf.copy_to_slice(&mut src);
        let ether_type = buf.get_u16();

        let mut fields = Self::ethernet(MacAddr(src), MacAddr(dst), ether_type);

        let mut inner_type = ether_type;
        if ether_type == ETH_P_8021Q {
            if buf.remaining() < VLAN_HLEN {
                tracing::trace!("truncated 802.1Q header");
                return Ok(fields);
            }
            fields.vlan = Some(VlanTag { tci: buf.get_u16() });
            inner_type = buf.get_u16();
            fields.network = Network::Other(inner_type);
        }

        match inner_type {
            ETH_P_IP => fields.parse_ipv4(buf),
            ETH_P_IPV6 => fields.parse_ipv6(buf),
            _ => {}
        }

        Ok(fields)
    }

    fn parse_ipv4(&mut self, mut buf: &[u8]) {
        if buf.remaining() < IPV4_MIN_HLEN {
            return;
        }

        let header = buf;
        let version_ihl = header[0];
        let ihl = usize::from(version_ihl & 0x0F) * 4;
        if version_ihl >> 4 != 4 || ihl < IPV4_MIN_HLEN || ihl > header.len() {
            tracing::trace!(version_ihl, "malformed IPv4 header");
            return;
        }

        let dsfield = header[1];
        let protocol = header[9];
        buf.advance(12);
        let src = Ipv4Addr::from(buf.get_u32());
        let dst = Ipv4Addr::from(buf.get_u32());

        self.network = Network::Ipv4(Ipv4Fields { src, dst, dsfield, protocol });
        self.ports = parse_ports(protocol, &header[ihl..]);
    }

    fn parse_ipv6(&mut self, mut buf: &[u8]) {
        if buf.remaining() < IPV6_HLEN {
            return;
        }

        let first = buf.get_u32();
        if first >> 28 != 6 {
            tracing::trace!("malformed IPv6 header");
            return;
        }
        let traffic_class = ((first >> 20) & 0xFF) as u8;
        let _payload_len = buf.get_u16();
        let next_header = buf.get_u8();
        let _hop_limit = buf.get_u8();
        let src = Ipv6Addr::from(buf.get_u128());
        let dst = Ipv6Addr::from(buf.get_u128());

        self.network = Network::Ipv6(Ipv6Fields { src, dst, traffic_class, next_header });
        self.ports = parse_ports(next_header, buf);
    }
}

/// Reads the port pair of a TCP or UDP header, requiring the full minimum header length.
fn parse_ports(protocol: u8, mut buf: &[u8]) -> Option<Ports> {
    let needed = match protocol {
        IPPROTO_TCP => TCP_MIN_HLEN,
        IPPROTO_UDP => UDP_HLEN,
        _ => return None,
    };

    if buf.remaining() < needed {
        return None;
    }

    Some(Ports { src: buf.get_u16(), dst: buf.get_u16() })
}

#[inline]
fn ensure(available: usize, needed: usize) -> Result<(), ParseError> {
    if available < needed {
        return Err(ParseError::Truncated { needed, available });
    }

    Ok(())
}

/// A packet travelling through the classifier: its parsed fields and the priority attribute
/// that the engine reads (user priority) and writes (the marking result).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub fields: PacketFields,
    pub priority: u32,
}

impl Packet {
    pub const fn new(fields: PacketFields, priority: u32) -> Self {
        Self { fields, priority }
    }
}
