use spm_rules::{RuleDb, UpdateError, UpdateOutcome, DEFAULT_PRIORITY};
use spm_wire::{MacAddr, MatchFlags, Rule, RuleInner, RuleOutput};

use crate::{l2_packet, tcp_packet, HOST};

fn priority(p: u8) -> RuleInner {
    RuleInner::new(RuleOutput::Priority(p))
}

#[test]
fn add_then_lookup_and_enumerate() {
    let _ = tracing_subscriber::fmt::try_init();

    let db = RuleDb::new();
    for (id, precedence) in [(1, 0), (2, 17), (3, 254), (4, 17)] {
        assert_eq!(db.apply_update(&Rule::add(id, precedence, priority(1))), Ok(UpdateOutcome::Added));
        assert_eq!(db.lookup(id).unwrap().precedence, precedence);
    }

    let snapshot = db.snapshot();
    let groups: Vec<(u8, Vec<u32>)> =
        snapshot.groups().map(|(p, rules)| (p, rules.iter().map(|n| n.id).collect())).collect();
    assert_eq!(groups, vec![(254, vec![3]), (17, vec![2, 4]), (0, vec![1])]);
}

#[test]
fn re_add_acts_as_modify() {
    let db = RuleDb::new();
    db.apply_update(&Rule::add(5, 10, priority(1))).unwrap();
    assert_eq!(db.apply_update(&Rule::add(5, 90, priority(1))), Ok(UpdateOutcome::Modified));

    assert_eq!(db.len(), 1);
    assert_eq!(db.lookup(5).unwrap().precedence, 90);
    assert!(db.snapshot().bucket(10).is_empty());
    assert_eq!(db.scan().filter(|n| n.id == 5).count(), 1);
}

#[test]
fn add_then_delete() {
    let db = RuleDb::new();
    db.apply_update(&Rule::add(1, 3, priority(1))).unwrap();
    db.apply_update(&Rule::add(2, 3, priority(1))).unwrap();

    assert_eq!(db.apply_update(&Rule::delete(2)), Ok(UpdateOutcome::Deleted));
    assert!(db.lookup(2).is_none());
    assert_eq!(db.len(), 1);
    assert_eq!(db.apply_update(&Rule::delete(2)), Err(UpdateError::RuleNotFound(2)));
}

#[test]
fn source_mac_sense_bit() {
    let other = MacAddr([0x02, 0, 0, 0, 0, 0x99]);

    let db = RuleDb::new();
    db.apply_update(&Rule::add(1, 1, priority(6).src_mac(HOST))).unwrap();
    assert_eq!(db.classify(&l2_packet(HOST)), 6);
    assert_eq!(db.classify(&l2_packet(other)), u32::from(DEFAULT_PRIORITY));

    let inverted = priority(6).src_mac(HOST).invert(MatchFlags::SRC_MAC_SENSE);
    db.apply_update(&Rule::add(1, 1, inverted)).unwrap();
    assert_eq!(db.classify(&l2_packet(HOST)), u32::from(DEFAULT_PRIORITY));
    assert_eq!(db.classify(&l2_packet(other)), 6);
}

#[test]
fn empty_table_fallback() {
    let db = RuleDb::new();

    let mut v4 = tcp_packet(32, 443, 5);
    db.apply(&mut v4);
    assert_eq!(v4.priority, 1);

    let mut non_ip = l2_packet(HOST);
    non_ip.priority = 5;
    db.apply(&mut non_ip);
    assert_eq!(non_ip.priority, u32::from(DEFAULT_PRIORITY));
}

#[test]
fn flush_removes_everything() {
    let db = RuleDb::new();
    for id in 0..50 {
        db.apply_update(&Rule::add(id, (id * 5) as u8, priority(2))).unwrap();
    }

    assert_eq!(db.flush(), Ok(50));
    assert_eq!(db.len(), 0);
    assert!((0..50).all(|id| db.lookup(id).is_none()));
    assert_eq!(db.flush(), Err(UpdateError::TableEmpty));
}

#[test]
fn user_priority_and_dscp_scenario() {
    let db = RuleDb::new();
    db.apply_update(&Rule::add(1, 10, RuleInner::new(RuleOutput::UserPriority).dst_port(80)))
        .unwrap();
    db.apply_update(&Rule::add(2, 5, RuleInner::new(RuleOutput::Dscp).always())).unwrap();

    let mut web = tcp_packet(0xA0, 80, 3);
    db.apply(&mut web);
    assert_eq!(web.priority, 3);

    let mut other = tcp_packet(0xA0, 81, 3);
    db.apply(&mut other);
    assert_eq!(other.priority, 5);

    assert_eq!(db.lookup(1).unwrap().hits(), 1);
    assert_eq!(db.lookup(2).unwrap().hits(), 1);

    let dump = db.snapshot().to_string();
    assert!(dump.contains("[id=1, precedence=10, output=9, hits=1]"));
    assert!(dump.contains("[id=2, precedence=5, output=8, hits=1]"));
}

#[test]
fn encoded_round_trip_through_db() {
    let db = RuleDb::new();
    let rule = Rule::add(77, 200, priority(4).dst_port(443));

    assert_eq!(db.apply_encoded(&rule.to_bytes()), Ok(UpdateOutcome::Added));
    assert_eq!(db.lookup(77).unwrap().inner, rule.inner);
    assert_eq!(db.classify(&tcp_packet(0, 443, 0)), 4);
    assert_eq!(db.apply_encoded(&Rule::delete(77).to_bytes()), Ok(UpdateOutcome::Deleted));
    assert_eq!(db.apply_encoded(&[]), Err(UpdateError::NullRule));
}
