use std::sync::Arc;

use spm_wire::{packet::Network, LatencyParams, Packet, RuleOutput};
use tracing::trace;

use crate::{matcher::rule_matches, store::TableSnapshot, RuleNode};

impl TableSnapshot {
    /// Returns the first rule matching `packet`: highest precedence first, insertion order
    /// within a precedence.
    pub fn search(&self, packet: &Packet) -> Option<&Arc<RuleNode>> {
        if self.is_empty() {
            return None;
        }

        self.iter().find(|node| rule_matches(&node.inner, &packet.fields, packet.priority))
    }

    /// Computes the priority `packet` would be marked with, without marking it.
    pub fn classify(&self, packet: &Packet, default_priority: u8) -> u32 {
        resolve(self.search(packet).map(|node| node.output()), packet, default_priority)
    }

    /// Marks `packet` with the priority of the winning rule, or with the DSCP-derived fallback
    /// if nothing matches, and bumps the winner's match counter.
    pub fn apply(&self, packet: &mut Packet, default_priority: u8) {
        let winner = self.search(packet);

        let priority = match winner {
            Some(node) => {
                node.record_hit();
                trace!(id = node.id, precedence = node.precedence, "rule matched");
                resolve(Some(node.output()), packet, default_priority)
            }
            None => resolve(None, packet, default_priority),
        };

        trace!(priority, "marking packet");
        packet.priority = priority;
    }

    /// The latency parameters of the winning rule, or [`LatencyParams::INVALID`].
    pub fn latency_params(&self, packet: &Packet) -> LatencyParams {
        self.search(packet).map_or(LatencyParams::INVALID, |node| node.inner.latency)
    }
}

/// Resolves the output of the winning rule (if any) into a priority.
fn resolve(output: Option<RuleOutput>, packet: &Packet, default_priority: u8) -> u32 {
    match output {
        Some(RuleOutput::Priority(priority)) => u32::from(priority),
        Some(RuleOutput::UserPriority) => packet.priority,
        Some(RuleOutput::Dscp) | None => u32::from(fallback(packet, default_priority)),
    }
}

/// The precedence bits of the DS field (IPv4) or traffic class (IPv6).
fn fallback(packet: &Packet, default_priority: u8) -> u8 {
    match packet.fields.network {
        Network::Ipv4(ref ip) => ip.dsfield >> 5,
        Network::Ipv6(ref ip) => ip.traffic_class >> 5,
        Network::Other(_) => default_priority,
    }
}
