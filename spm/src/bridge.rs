//! Bridge hook decision logic.
//!
//! A [`Bridge`] sits on the bridged forwarding path and decides, per frame, whether the rule
//! table is consulted. IEEE 1905.1 control frames and VLAN-tagged frames, whether the tag is
//! in-band or was offloaded to hardware, are always passed through untouched.

use std::sync::Arc;

use spm_rules::RuleDb;
use spm_wire::{
    packet::{ParseError, ETH_P_1905},
    Packet, PacketFields,
};
use tracing::trace;

/// Where in the bridge a frame is intercepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    /// On ingress, before the forwarding decision.
    PreRouting,
    /// On egress, after the forwarding decision.
    PostRouting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeOptions {
    /// Apply rules on ingress. Default: on.
    pub pre_routing: bool,
    /// Apply rules on egress to frames that changed interface. Default: off.
    pub post_routing: bool,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self { pre_routing: true, post_routing: false }
    }
}

impl BridgeOptions {
    pub fn pre_routing(mut self, enabled: bool) -> Self {
        self.pre_routing = enabled;
        self
    }

    pub fn post_routing(mut self, enabled: bool) -> Self {
        self.post_routing = enabled;
        self
    }

    /// Creates options from the legacy enable bitmask: `0x1` pre-routing, `0x2` post-routing.
    pub fn from_bits(bits: u32) -> Self {
        Self { pre_routing: bits & 0x1 != 0, post_routing: bits & 0x2 != 0 }
    }

    pub fn enabled(&self, hook: HookPoint) -> bool {
        match hook {
            HookPoint::PreRouting => self.pre_routing,
            HookPoint::PostRouting => self.post_routing,
        }
    }
}

/// A frame crossing the bridge.
#[derive(Debug)]
pub struct Frame<'a> {
    /// The raw Ethernet frame.
    pub data: &'a [u8],
    /// The frame's priority attribute. Overwritten when rules are applied.
    pub priority: u32,
    /// The VLAN tag was stripped by hardware.
    pub vlan_offloaded: bool,
    pub ingress_ifindex: u32,
    pub egress_ifindex: u32,
}

impl<'a> Frame<'a> {
    pub fn new(data: &'a [u8], priority: u32) -> Self {
        Self { data, priority, vlan_offloaded: false, ingress_ifindex: 0, egress_ifindex: 0 }
    }

    pub fn with_vlan_offload(mut self) -> Self {
        self.vlan_offloaded = true;
        self
    }

    pub fn with_interfaces(mut self, ingress: u32, egress: u32) -> Self {
        self.ingress_ifindex = ingress;
        self.egress_ifindex = egress;
        self
    }
}

/// Why a frame was passed through without consulting the rule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    HookDisabled,
    /// An IEEE 1905.1 control message.
    Cmdu,
    VlanOffload,
    /// The frame carries an in-band 802.1Q tag.
    Vlan,
    /// Post-routing only: the frame leaves through the interface it arrived on.
    SameInterface,
    /// The Ethernet header is truncated.
    Malformed,
}

/// The outcome of [`Bridge::process`]. Frames are never dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Rules were applied and the frame now carries this priority.
    Marked(u32),
    Skipped(Skip),
}

#[derive(Debug)]
pub struct Bridge {
    db: Arc<RuleDb>,
    options: BridgeOptions,
}

impl Bridge {
    pub fn new(db: Arc<RuleDb>, options: BridgeOptions) -> Self {
        Self { db, options }
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    /// Runs the hook at `hook` over `frame`, marking its priority if rules apply.
    pub fn process(&self, hook: HookPoint, frame: &mut Frame<'_>) -> Verdict {
        if !self.options.enabled(hook) {
            return Verdict::Skipped(Skip::HookDisabled);
        }

        let fields = match PacketFields::parse(frame.data) {
            Ok(fields) => fields,
            Err(ParseError::Truncated { available, .. }) => {
                trace!(?hook, available, "Skipping truncated frame");
                return Verdict::Skipped(Skip::Malformed);
            }
        };

        if fields.ether_type == ETH_P_1905 {
            return Verdict::Skipped(Skip::Cmdu);
        }

        if frame.vlan_offloaded {
            return Verdict::Skipped(Skip::VlanOffload);
        }

        if let Some(tag) = fields.vlan {
            trace!(?hook, vid = tag.id(), "Skipping 802.1Q tagged frame");
            return Verdict::Skipped(Skip::Vlan);
        }

        if hook == HookPoint::PostRouting && frame.ingress_ifindex == frame.egress_ifindex {
            return Verdict::Skipped(Skip::SameInterface);
        }

        trace!(?hook, src = %fields.src_mac, dst = %fields.dst_mac, "Applying rules");

        let mut packet = Packet::new(fields, frame.priority);
        self.db.apply(&mut packet);
        frame.priority = packet.priority;

        Verdict::Marked(packet.priority)
    }
}
