//! Wire-level types for service prioritization.
//!
//! - [`packet`]: the parsed header snapshot that the classifier matches on.
//! - [`rule`]: rules as submitted by the control plane, and their binary encoding.

pub mod packet;
pub mod rule;

pub use packet::{MacAddr, Packet, PacketFields};
pub use rule::{Command, LatencyParams, MatchFlags, Rule, RuleInner, RuleOutput};
