use spm_wire::{
    packet::{IPPROTO_TCP, IPPROTO_UDP},
    MatchFlags, PacketFields, RuleInner,
};

/// Evaluates the predicates of `rule` against one packet.
///
/// Enabled predicates are checked in a fixed order: user priority, source MAC, destination
/// MAC, VLAN id, the IPv4 group (DSCP, source/destination address, protocol, ports) and the
/// IPv6 address group. Each raw comparison is XORed with the predicate's sense bit and the
/// first failure ends the evaluation. A predicate whose header is missing never matches,
/// whatever its sense.
pub fn rule_matches(rule: &RuleInner, fields: &PacketFields, priority: u32) -> bool {
    let flags = rule.flags;

    if flags.contains(MatchFlags::ALWAYS_TRUE) {
        return true;
    }

    if flags.contains(MatchFlags::UP) &&
        !holds(flags, MatchFlags::UP_SENSE, priority == u32::from(rule.user_priority))
    {
        return fail("user_priority");
    }

    if flags.contains(MatchFlags::SRC_MAC) &&
        !holds(flags, MatchFlags::SRC_MAC_SENSE, fields.src_mac == rule.src_mac)
    {
        return fail("src_mac");
    }

    if flags.contains(MatchFlags::DST_MAC) &&
        !holds(flags, MatchFlags::DST_MAC_SENSE, fields.dst_mac == rule.dst_mac)
    {
        return fail("dst_mac");
    }

    if flags.contains(MatchFlags::VLAN_ID) {
        let Some(tag) = fields.vlan else {
            return fail("vlan_tag");
        };

        if !holds(flags, MatchFlags::VLAN_ID_SENSE, tag.id() == rule.vlan_id) {
            return fail("vlan_id");
        }
    }

    if flags.intersects(MatchFlags::IPV4_GROUP) && !ipv4_matches(rule, fields) {
        return false;
    }

    if flags.intersects(MatchFlags::IPV6_GROUP) && !ipv6_matches(rule, fields) {
        return false;
    }

    true
}

fn ipv4_matches(rule: &RuleInner, fields: &PacketFields) -> bool {
    let flags = rule.flags;

    let Some(ip) = fields.network.ipv4() else {
        return fail("ipv4_header");
    };

    // The predicate compares the 6-bit code point, unlike the >> 5 priority fallback.
    if flags.contains(MatchFlags::DSCP) &&
        !holds(flags, MatchFlags::DSCP_SENSE, ip.dscp() == rule.dscp)
    {
        return fail("dscp");
    }

    if flags.contains(MatchFlags::SRC_IPV4) &&
        !holds(flags, MatchFlags::SRC_IPV4_SENSE, ip.src == rule.src_ipv4)
    {
        return fail("src_ipv4");
    }

    if flags.contains(MatchFlags::DST_IPV4) &&
        !holds(flags, MatchFlags::DST_IPV4_SENSE, ip.dst == rule.dst_ipv4)
    {
        return fail("dst_ipv4");
    }

    if flags.contains(MatchFlags::PROTOCOL) &&
        !holds(flags, MatchFlags::PROTOCOL_SENSE, ip.protocol == rule.protocol)
    {
        return fail("protocol");
    }

    if !flags.intersects(MatchFlags::SRC_PORT | MatchFlags::DST_PORT) {
        return true;
    }

    let ports = match (ip.protocol, fields.ports) {
        (IPPROTO_TCP | IPPROTO_UDP, Some(ports)) => ports,
        _ => return fail("l4_header"),
    };

    if flags.contains(MatchFlags::SRC_PORT) &&
        !holds(flags, MatchFlags::SRC_PORT_SENSE, ports.src == rule.src_port)
    {
        return fail("src_port");
    }

    if flags.contains(MatchFlags::DST_PORT) &&
        !holds(flags, MatchFlags::DST_PORT_SENSE, ports.dst == rule.dst_port)
    {
        return fail("dst_port");
    }

    true
}

fn ipv6_matches(rule: &RuleInner, fields: &PacketFields) -> bool {
    let flags = rule.flags;

    let Some(ip) = fields.network.ipv6() else {
        return fail("ipv6_header");
    };

    if flags.contains(MatchFlags::SRC_IPV6) &&
        !holds(flags, MatchFlags::SRC_IPV6_SENSE, ip.src == rule.src_ipv6)
    {
        return fail("src_ipv6");
    }

    if flags.contains(MatchFlags::DST_IPV6) &&
        !holds(flags, MatchFlags::DST_IPV6_SENSE, ip.dst == rule.dst_ipv6)
    {
        return fail("dst_ipv6");
    }

    true
}

#[inline]
fn holds(flags: MatchFlags, sense: MatchFlags, raw: bool) -> bool {
    raw ^ flags.contains(sense)
}

#[inline]
fn fail(predicate: &'static str) -> bool {
    tracing::trace!(predicate, "rule predicate failed");
    false
}
