use rand::{seq::SliceRandom, Rng};
use spm_rules::{RuleDb, DEFAULT_PRECEDENCE};
use spm_wire::{Rule, RuleInner, RuleOutput};

use crate::tcp_packet;

#[test]
fn highest_precedence_wins_in_any_insertion_order() {
    let mut rng = rand::thread_rng();

    for _ in 0..32 {
        let db = RuleDb::new();
        let count = rng.gen_range(2..=40);

        let all: Vec<u8> = (0..DEFAULT_PRECEDENCE).collect();
        let precedences: Vec<u8> = all.choose_multiple(&mut rng, count).copied().collect();

        for (id, &precedence) in precedences.iter().enumerate() {
            let inner = RuleInner::new(RuleOutput::Priority(precedence % 8)).dst_port(80);
            db.apply_update(&Rule::add(id as u32, precedence, inner)).unwrap();
        }

        let highest = *precedences.iter().max().unwrap();
        let mut packet = tcp_packet(0, 80, 0);

        let winner = db.snapshot().search(&packet).map(|n| n.precedence);
        assert_eq!(winner, Some(highest));

        db.apply(&mut packet);
        assert_eq!(packet.priority, u32::from(highest % 8));

        let scanned: Vec<u8> = db.scan().map(|n| n.precedence).collect();
        assert!(scanned.windows(2).all(|w| w[0] > w[1]));
    }
}

#[test]
fn default_precedence_is_lowest() {
    let db = RuleDb::new();
    db.apply_update(&Rule::add(1, DEFAULT_PRECEDENCE, RuleInner::new(RuleOutput::Priority(7))))
        .unwrap();
    db.apply_update(&Rule::add(2, 1, RuleInner::new(RuleOutput::Priority(2)))).unwrap();
    // Same bucket as the defaulted rule, inserted later.
    db.apply_update(&Rule::add(3, 0, RuleInner::new(RuleOutput::Priority(3)))).unwrap();

    assert_eq!(db.lookup(1).unwrap().precedence, 0);
    assert_eq!(db.classify(&tcp_packet(0, 80, 0)), 2);

    db.apply_update(&Rule::delete(2)).unwrap();
    assert_eq!(db.classify(&tcp_packet(0, 80, 0)), 7);
}
