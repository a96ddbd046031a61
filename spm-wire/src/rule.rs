//! Service prioritization rules and their binary encoding.
//!
//! # Wire format
//!
//! A rule is encoded as a fixed-size, big-endian record of [`RULE_WIRE_LEN`] bytes:
//!
//! ```text
//! id:u32 cmd:u8 precedence:u8 output:u16 flags:u32 up:u8 sa:[u8;6] da:[u8;6]
//! src_ipv4:u32 dst_ipv4:u32 src_ipv6:u128 dst_ipv6:u128 src_port:u16 dst_port:u16
//! vlan_id:u16 protocol:u8 dscp:u8 si_dl:u8 si_ul:u8 burst_dl:u32 burst_ul:u32
//! ```
//!
//! An empty payload decodes to `None`, which the update gateway reports as a null rule.

use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
    ops::{BitOr, BitOrAssign},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::packet::MacAddr;

/// The length of an encoded rule in bytes.
pub const RULE_WIRE_LEN: usize = 83;

/// Output selector value: derive the priority from the DSCP field.
pub const OUTPUT_USE_DSCP: u16 = 0x08;

/// Output selector value: copy the packet's existing (user) priority.
pub const OUTPUT_USE_UP: u16 = 0x09;

/// Output selector value reserved for "no rule matched". Not valid inside a rule.
pub const OUTPUT_NO_MATCH: u16 = 0x0A;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Rule payload truncated: need 83 bytes, got {0}")]
    Truncated(usize),
}

/// Bitmask selecting the predicates of a rule, and their sense (inversion) bits.
///
/// Bit values are part of the control-plane ABI and must not change.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MatchFlags(u32);

impl MatchFlags {
    pub const ALWAYS_TRUE: Self = Self(0x01);
    pub const UP: Self = Self(0x02);
    pub const UP_SENSE: Self = Self(0x04);
    pub const SRC_MAC: Self = Self(0x08);
    pub const SRC_MAC_SENSE: Self = Self(0x10);
    pub const DST_MAC: Self = Self(0x20);
    pub const DST_MAC_SENSE: Self = Self(0x40);
    pub const SRC_IPV4: Self = Self(0x80);
    pub const SRC_IPV4_SENSE: Self = Self(0x100);
    pub const SRC_IPV6: Self = Self(0x200);
    pub const SRC_IPV6_SENSE: Self = Self(0x400);
    pub const DST_IPV4: Self = Self(0x800);
    pub const DST_IPV4_SENSE: Self = Self(0x1000);
    pub const DST_IPV6: Self = Self(0x2000);
    pub const DST_IPV6_SENSE: Self = Self(0x4000);
    pub const SRC_PORT: Self = Self(0x8000);
    pub const SRC_PORT_SENSE: Self = Self(0x10000);
    pub const DST_PORT: Self = Self(0x20000);
    pub const DST_PORT_SENSE: Self = Self(0x40000);
    pub const PROTOCOL: Self = Self(0x80000);
    pub const PROTOCOL_SENSE: Self = Self(0x100000);
    pub const VLAN_ID: Self = Self(0x200000);
    pub const VLAN_ID_SENSE: Self = Self(0x400000);
    pub const DSCP: Self = Self(0x800000);
    pub const DSCP_SENSE: Self = Self(0x1000000);

    /// Predicates that need an IPv4 header.
    pub const IPV4_GROUP: Self = Self(
        Self::SRC_IPV4.0 |
            Self::DST_IPV4.0 |
            Self::SRC_PORT.0 |
            Self::DST_PORT.0 |
            Self::DSCP.0 |
            Self::PROTOCOL.0,
    );

    /// Predicates that need an IPv6 header.
    pub const IPV6_GROUP: Self = Self(Self::SRC_IPV6.0 | Self::DST_IPV6.0);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if all bits of `other` are set.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if any bit of `other` is set.
    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for MatchFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for MatchFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for MatchFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MatchFlags({:#x})", self.0)
    }
}

/// The command carried by a rule update. Add is 1, delete is 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Delete,
    Add,
    /// Any other value. Rejected by the update gateway.
    Unknown(u8),
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Delete,
            1 => Self::Add,
            other => Self::Unknown(other),
        }
    }
}

impl From<Command> for u8 {
    fn from(cmd: Command) -> Self {
        match cmd {
            Command::Delete => 0,
            Command::Add => 1,
            Command::Unknown(other) => other,
        }
    }
}

/// How a matching rule derives the packet priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutput {
    /// An explicit priority, 0-7.
    Priority(u8),
    /// Copy the packet's existing priority.
    UserPriority,
    /// Derive the priority from the IP differentiated services field.
    Dscp,
}

impl TryFrom<u16> for RuleOutput {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0..=7 => Ok(Self::Priority(value as u8)),
            OUTPUT_USE_DSCP => Ok(Self::Dscp),
            OUTPUT_USE_UP => Ok(Self::UserPriority),
            other => Err(other),
        }
    }
}

impl From<RuleOutput> for u16 {
    fn from(output: RuleOutput) -> Self {
        match output {
            RuleOutput::Priority(p) => Self::from(p),
            RuleOutput::Dscp => OUTPUT_USE_DSCP,
            RuleOutput::UserPriority => OUTPUT_USE_UP,
        }
    }
}

/// Wi-Fi latency parameters attached to a rule. All zero is the invalid sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyParams {
    /// Downlink service interval in milliseconds.
    pub service_interval_dl: u8,
    /// Downlink burst size in bytes.
    pub burst_size_dl: u32,
    /// Uplink service interval in milliseconds.
    pub service_interval_ul: u8,
    /// Uplink burst size in bytes.
    pub burst_size_ul: u32,
}

impl LatencyParams {
    pub const INVALID: Self = Self {
        service_interval_dl: 0,
        burst_size_dl: 0,
        service_interval_ul: 0,
        burst_size_ul: 0,
    };

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

/// The match/action payload of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleInner {
    /// Raw output selector, see [`RuleOutput`]. Kept raw so that invalid selectors can be
    /// reported by the update gateway.
    pub output: u16,
    pub flags: MatchFlags,
    /// 802.11 user priority.
    pub user_priority: u8,
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub src_ipv4: Ipv4Addr,
    pub dst_ipv4: Ipv4Addr,
    pub src_ipv6: Ipv6Addr,
    pub dst_ipv6: Ipv6Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub vlan_id: u16,
    pub protocol: u8,
    /// 6-bit DSCP value compared against `dsfield >> 2`.
    pub dscp: u8,
    pub latency: LatencyParams,
}

impl Default for RuleInner {
    fn default() -> Self {
        Self {
            output: 0,
            flags: MatchFlags::empty(),
            user_priority: 0,
            src_mac: MacAddr::default(),
            dst_mac: MacAddr::default(),
            src_ipv4: Ipv4Addr::UNSPECIFIED,
            dst_ipv4: Ipv4Addr::UNSPECIFIED,
            src_ipv6: Ipv6Addr::UNSPECIFIED,
            dst_ipv6: Ipv6Addr::UNSPECIFIED,
            src_port: 0,
            dst_port: 0,
            vlan_id: 0,
            protocol: 0,
            dscp: 0,
            latency: LatencyParams::INVALID,
        }
    }
}

impl RuleInner {
    /// Creates a payload with the given output and no predicates. A rule without any enabled
    /// predicate matches every packet.
    pub fn new(output: RuleOutput) -> Self {
        Self { output: output.into(), ..Default::default() }
    }

    /// Sets a raw output selector, valid or not.
    pub fn with_raw_output(mut self, output: u16) -> Self {
        self.output = output;
        self
    }

    /// Matches every packet.
    pub fn always(mut self) -> Self {
        self.flags |= MatchFlags::ALWAYS_TRUE;
        self
    }

    /// Inverts the given predicate(s). Pass the `*_SENSE` flag.
    pub fn invert(mut self, sense: MatchFlags) -> Self {
        self.flags |= sense;
        self
    }

    pub fn user_priority(mut self, up: u8) -> Self {
        self.flags |= MatchFlags::UP;
        self.user_priority = up;
        self
    }

    pub fn src_mac(mut self, mac: MacAddr) -> Self {
        self.flags |= MatchFlags::SRC_MAC;
        self.src_mac = mac;
        self
    }

    pub fn dst_mac(mut self, mac: MacAddr) -> Self {
        self.flags |= MatchFlags::DST_MAC;
        self.dst_mac = mac;
        self
    }

    pub fn src_ipv4(mut self, addr: Ipv4Addr) -> Self {
        self.flags |= MatchFlags::SRC_IPV4;
        self.src_ipv4 = addr;
        self
    }

    pub fn dst_ipv4(mut self, addr: Ipv4Addr) -> Self {
        self.flags |= MatchFlags::DST_IPV4;
        self.dst_ipv4 = addr;
        self
    }

    pub fn src_ipv6(mut self, addr: Ipv6Addr) -> Self {
        self.flags |= MatchFlags::SRC_IPV6;
        self.src_ipv6 = addr;
        self
    }

    pub fn dst_ipv6(mut self, addr: Ipv6Addr) -> Self {
        self.flags |= MatchFlags::DST_IPV6;
        self.dst_ipv6 = addr;
        self
    }

    pub fn src_port(mut self, port: u16) -> Self {
        self.flags |= MatchFlags::SRC_PORT;
        self.src_port = port;
        self
    }

    pub fn dst_port(mut self, port: u16) -> Self {
        self.flags |= MatchFlags::DST_PORT;
        self.dst_port = port;
        self
    }

    pub fn vlan_id(mut self, vid: u16) -> Self {
        self.flags |= MatchFlags::VLAN_ID;
        self.vlan_id = vid;
        self
    }

    pub fn protocol(mut self, protocol: u8) -> Self {
        self.flags |= MatchFlags::PROTOCOL;
        self.protocol = protocol;
        self
    }

    pub fn dscp(mut self, dscp: u8) -> Self {
        self.flags |= MatchFlags::DSCP;
        self.dscp = dscp;
        self
    }

    pub fn latency(mut self, latency: LatencyParams) -> Self {
        self.latency = latency;
        self
    }
}

/// A service prioritization rule update, as submitted by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    /// Rule identifier, unique among live rules.
    pub id: u32,
    pub command: Command,
    /// 0 (lowest) to 254 (highest). 255 is the "default" sentinel and lands in bucket 0.
    pub precedence: u8,
    pub inner: RuleInner,
}

impl Rule {
    /// Creates an add (or modify, if `id` exists) update.
    pub const fn add(id: u32, precedence: u8, inner: RuleInner) -> Self {
        Self { id, command: Command::Add, precedence, inner }
    }

    /// Creates a delete update for `id`.
    pub fn delete(id: u32) -> Self {
        Self { id, command: Command::Delete, precedence: 0, inner: RuleInner::default() }
    }

    /// Encodes the rule into `dst`.
    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        let inner = &self.inner;
        dst.put_u32(self.id);
        dst.put_u8(self.command.into());
        dst.put_u8(self.precedence);
        dst.put_u16(inner.output);
        dst.put_u32(inner.flags.bits());
        dst.put_u8(inner.user_priority);
        dst.put_slice(&inner.src_mac.0);
        dst.put_slice(&inner.dst_mac.0);
        dst.put_u32(inner.src_ipv4.into());
        dst.put_u32(inner.dst_ipv4.into());
        dst.put_u128(inner.src_ipv6.into());
        dst.put_u128(inner.dst_ipv6.into());
        dst.put_u16(inner.src_port);
        dst.put_u16(inner.dst_port);
        dst.put_u16(inner.vlan_id);
        dst.put_u8(inner.protocol);
        dst.put_u8(inner.dscp);
        dst.put_u8(inner.latency.service_interval_dl);
        dst.put_u8(inner.latency.service_interval_ul);
        dst.put_u32(inner.latency.burst_size_dl);
        dst.put_u32(inner.latency.burst_size_ul);
    }

    /// Encodes the rule into a new buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RULE_WIRE_LEN);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes one rule from `src`. Returns `Ok(None)` if `src` is empty.
    pub fn decode<B: Buf>(src: &mut B) -> Result<Option<Self>, CodecError> {
        if !src.has_remaining() {
            return Ok(None);
        }

        if src.remaining() < RULE_WIRE_LEN {
            return Err(CodecError::Truncated(src.remaining()));
        }

        let id = src.get_u32();
        let command = Command::from(src.get_u8());
        let precedence = src.get_u8();
        let output = src.get_u16();
        let flags = MatchFlags::from_bits(src.get_u32());
        let user_priority = src.get_u8();
        let mut sa = [0u8; 6];
        src.copy_to_slice(&mut sa);
        let mut da = [0u8; 6];
        src.copy_to_slice(&mut da);

        let inner = RuleInner {
            output,
            flags,
            user_priority,
            src_mac: MacAddr(sa),
            dst_mac: MacAddr(da),
            src_ipv4: Ipv4Addr::from(src.get_u32()),
            dst_ipv4: Ipv4Addr::from(src.get_u32()),
            src_ipv6: Ipv6Addr::from(src.get_u128()),
            dst_ipv6: Ipv6Addr::from(src.get_u128()),
            src_port: src.get_u16(),
            dst_port: src.get_u16(),
            vlan_id: src.get_u16(),
            protocol: src.get_u8(),
            dscp: src.get_u8(),
            latency: {
                let service_interval_dl = src.get_u8();
                let service_interval_ul = src.get_u8();
                LatencyParams {
                    service_interval_dl,
                    service_interval_ul,
                    burst_size_dl: src.get_u32(),
                    burst_size_ul: src.get_u32(),
                }
            },
        };

        Ok(Some(Self { id, command, precedence, inner }))
    }
}
