#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod bridge;
mod service;

pub use bridge::{Bridge, BridgeOptions, Frame, HookPoint, Skip, Verdict};
pub use service::Service;

pub use spm_rules::*;
pub use spm_wire::{
    packet, rule, Command, LatencyParams, MacAddr, MatchFlags, Packet, PacketFields, Rule,
    RuleInner, RuleOutput,
};
