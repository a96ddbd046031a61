//! The rule store.
//!
//! Rules live in an immutable [`TableSnapshot`]: 255 precedence buckets plus an identifier
//! index. The current snapshot is published through an [`ArcSwap`]. Readers load it once per
//! traversal, which neither blocks nor allocates, and always see a consistent table. Writers
//! serialize on a mutex, build the next snapshot (unchanged buckets are shared, not copied)
//! and publish it with a single atomic store. A superseded snapshot, and every node only it
//! references, is freed when the last reader holding it lets go.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use arc_swap::{ArcSwap, Guard};
use derive_more::Deref;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use spm_wire::{Rule, RuleOutput};

use crate::{
    error::{Allocation, UpdateError},
    DEFAULT_PRECEDENCE, MAX_RULES, PRECEDENCE_LEVELS,
};

/// A live rule, linked into exactly one precedence bucket and the identifier index.
#[derive(Debug, Deref)]
pub struct RuleNode {
    #[deref]
    rule: Arc<Rule>,
    /// The validated output selector.
    output: RuleOutput,
    /// The number of packets this rule has won. Shared with the nodes that replace it.
    hits: Arc<AtomicU64>,
}

impl RuleNode {
    /// Creates a node for `rule`. The sentinel precedence is normalized to bucket 0.
    pub fn new(mut rule: Rule, output: RuleOutput) -> Self {
        if rule.precedence == DEFAULT_PRECEDENCE {
            rule.precedence = 0;
        }

        Self { rule: Arc::new(rule), output, hits: Arc::new(AtomicU64::new(0)) }
    }

    /// A copy of `self` that counts into the counter of `prev`.
    fn succeeding(&self, prev: &Self) -> Self {
        Self { rule: Arc::clone(&self.rule), output: self.output, hits: Arc::clone(&prev.hits) }
    }

    /// The rule content, shared with notifications.
    #[inline]
    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    #[inline]
    pub fn output(&self) -> RuleOutput {
        self.output
    }

    #[inline]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn bucket(&self) -> usize {
        usize::from(self.rule.precedence)
    }
}

type Bucket = Arc<Vec<Arc<RuleNode>>>;

/// An immutable version of the rule table.
#[derive(Clone)]
pub struct TableSnapshot {
    /// One ordered list per precedence value, indexed by precedence.
    buckets: Vec<Bucket>,
    /// Rule id to node.
    index: Arc<FxHashMap<u32, Arc<RuleNode>>>,
}

impl TableSnapshot {
    pub fn empty() -> Self {
        let empty = Arc::new(Vec::new());
        Self { buckets: vec![empty; PRECEDENCE_LEVELS], index: Arc::new(FxHashMap::default()) }
    }

    /// The number of live rules.
    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[inline]
    pub fn get(&self, id: u32) -> Option<&Arc<RuleNode>> {
        self.index.get(&id)
    }

    /// The rules of one precedence bucket, in insertion order.
    pub fn bucket(&self, precedence: u8) -> &[Arc<RuleNode>] {
        self.buckets.get(usize::from(precedence)).map(|b| b.as_slice()).unwrap_or_default()
    }

    /// All rules, highest precedence first, insertion order within a bucket.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<RuleNode>> + '_ {
        self.buckets.iter().rev().flat_map(|bucket| bucket.iter())
    }

    /// Non-empty buckets as `(precedence, rules)`, highest precedence first.
    pub fn groups(&self) -> impl Iterator<Item = (u8, &[Arc<RuleNode>])> + '_ {
        self.buckets
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(precedence, bucket)| (precedence as u8, bucket.as_slice()))
    }

    /// Builds the snapshot that follows `self` after linking `node`, replacing `prev` if given.
    fn with_linked(
        &self,
        node: &Arc<RuleNode>,
        prev: Option<&Arc<RuleNode>>,
    ) -> Result<Self, UpdateError> {
        let mut next = self.clone();
        let to = node.bucket();

        match prev {
            Some(prev) if prev.bucket() == to => {
                let mut bucket = copy_bucket(&self.buckets[to], 0)?;
                if let Some(slot) = bucket.iter_mut().find(|n| n.id == node.id) {
                    *slot = Arc::clone(node);
                }
                next.buckets[to] = Arc::new(bucket);
            }
            Some(prev) => {
                let from = prev.bucket();
                let mut old = copy_bucket(&self.buckets[from], 0)?;
                old.retain(|n| n.id != node.id);
                let mut new = copy_bucket(&self.buckets[to], 1)?;
                new.push(Arc::clone(node));
                next.buckets[from] = Arc::new(old);
                next.buckets[to] = Arc::new(new);
            }
            None => {
                let mut new = copy_bucket(&self.buckets[to], 1)?;
                new.push(Arc::clone(node));
                next.buckets[to] = Arc::new(new);
            }
        }

        let mut index = copy_index(&self.index, usize::from(prev.is_none()))?;
        index.insert(node.id, Arc::clone(node));
        next.index = Arc::new(index);

        Ok(next)
    }

    /// Builds the snapshot that follows `self` after unlinking `node`.
    fn with_unlinked(&self, node: &Arc<RuleNode>) -> Result<Self, UpdateError> {
        let mut next = self.clone();
        let from = node.bucket();

        let mut bucket = copy_bucket(&self.buckets[from], 0)?;
        bucket.retain(|n| n.id != node.id);
        next.buckets[from] = Arc::new(bucket);

        let mut index = copy_index(&self.index, 0)?;
        index.remove(&node.id);
        next.index = Arc::new(index);

        Ok(next)
    }
}

impl fmt::Debug for TableSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.groups()).finish()
    }
}

/// Renders the rule table dump: total count, then every non-empty bucket from the highest
/// precedence down.
impl fmt::Display for TableSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "====Rule table start====")?;
        writeln!(f, "Total rule count = {}", self.len())?;
        for (precedence, rules) in self.groups() {
            writeln!(f, "\nPrecedence={precedence}:")?;
            for node in rules {
                writeln!(
                    f,
                    "[id={}, precedence={}, output={}, hits={}]",
                    node.id,
                    node.precedence,
                    node.inner.output,
                    node.hits()
                )?;
            }
        }
        writeln!(f, "====Rule table ends====")
    }
}

fn copy_bucket(old: &[Arc<RuleNode>], extra: usize) -> Result<Vec<Arc<RuleNode>>, UpdateError> {
    let mut bucket = Vec::new();
    bucket
        .try_reserve_exact(old.len() + extra)
        .map_err(|_| UpdateError::AllocFailed(Allocation::Node))?;
    bucket.extend(old.iter().cloned());
    Ok(bucket)
}

fn copy_index(
    old: &FxHashMap<u32, Arc<RuleNode>>,
    extra: usize,
) -> Result<FxHashMap<u32, Arc<RuleNode>>, UpdateError> {
    let mut index = FxHashMap::default();
    index.try_reserve(old.len() + extra).map_err(|_| UpdateError::AllocFailed(Allocation::Index))?;
    index.extend(old.iter().map(|(id, node)| (*id, Arc::clone(node))));
    Ok(index)
}

/// An iterator over a pinned snapshot, highest precedence first.
#[derive(Debug)]
pub struct Scan {
    snapshot: Arc<TableSnapshot>,
    /// One past the bucket being scanned.
    bucket: usize,
    pos: usize,
}

impl Iterator for Scan {
    type Item = Arc<RuleNode>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.bucket > 0 {
            if let Some(node) = self.snapshot.buckets[self.bucket - 1].get(self.pos) {
                self.pos += 1;
                return Some(Arc::clone(node));
            }

            self.bucket -= 1;
            self.pos = 0;
        }

        None
    }
}

/// The owner of the published rule table.
pub struct RuleStore {
    table: ArcSwap<TableSnapshot>,
    /// Serializes structural mutation. Held only while the next snapshot is built and stored.
    lock: Mutex<()>,
    capacity: usize,
}

impl RuleStore {
    /// Creates an empty store. `capacity` is clamped to [`MAX_RULES`].
    pub fn new(capacity: usize) -> Self {
        Self {
            table: ArcSwap::from_pointee(TableSnapshot::empty()),
            lock: Mutex::new(()),
            capacity: capacity.min(MAX_RULES),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enters a read-side section: the returned guard pins the current snapshot until dropped.
    /// Lock-free and allocation-free; meant for the per-packet path.
    #[inline]
    pub fn load(&self) -> Guard<Arc<TableSnapshot>> {
        self.table.load()
    }

    /// Returns an owned handle to the current snapshot.
    pub fn snapshot(&self) -> Arc<TableSnapshot> {
        self.table.load_full()
    }

    pub fn lookup(&self, id: u32) -> Option<Arc<RuleNode>> {
        self.table.load().get(id).cloned()
    }

    /// Returns true if inserting `id` would fail with [`UpdateError::TableFull`].
    pub fn is_full_for(&self, id: u32) -> bool {
        let table = self.table.load();
        table.len() >= self.capacity && table.get(id).is_none()
    }

    /// Iterates one consistent snapshot of the table, highest precedence first.
    pub fn scan_by_precedence_desc(&self) -> Scan {
        Scan { snapshot: self.snapshot(), bucket: PRECEDENCE_LEVELS, pos: 0 }
    }

    /// Links `node` into the table. If a rule with the same id is live it is replaced and
    /// returned; the replacement keeps counting into its match counter. Only a new id can fail with
    /// [`UpdateError::TableFull`].
    pub fn insert(&self, node: Arc<RuleNode>) -> Result<Option<Arc<RuleNode>>, UpdateError> {
        let _guard = self.lock.lock();
        let current = self.table.load_full();

        let prev = current.get(node.id).cloned();
        if prev.is_none() && current.len() >= self.capacity {
            return Err(UpdateError::TableFull { capacity: self.capacity });
        }

        self.link(&current, node, prev.as_ref())?;
        Ok(prev)
    }

    /// Replaces the live rule `id` with `node`, moving it to another bucket if the precedence
    /// changed. Returns the superseded node.
    pub fn replace(&self, id: u32, node: Arc<RuleNode>) -> Result<Arc<RuleNode>, UpdateError> {
        debug_assert_eq!(id, node.id);

        let _guard = self.lock.lock();
        let current = self.table.load_full();

        let prev = current.get(id).cloned().ok_or(UpdateError::RuleNotFound(id))?;
        self.link(&current, node, Some(&prev))?;
        Ok(prev)
    }

    /// Unlinks rule `id` from both the bucket and the index and returns it.
    pub fn remove(&self, id: u32) -> Result<Arc<RuleNode>, UpdateError> {
        let _guard = self.lock.lock();
        let current = self.table.load_full();

        if current.is_empty() {
            return Err(UpdateError::TableEmpty);
        }

        let node = current.get(id).cloned().ok_or(UpdateError::RuleNotFound(id))?;
        let next = current.with_unlinked(&node)?;
        self.table.store(Arc::new(next));

        Ok(node)
    }

    /// Atomically empties the table. Returns the number of rules removed.
    pub fn flush(&self) -> Result<usize, UpdateError> {
        let _guard = self.lock.lock();
        let count = self.table.load().len();

        if count == 0 {
            return Err(UpdateError::TableEmpty);
        }

        self.table.store(Arc::new(TableSnapshot::empty()));
        Ok(count)
    }

    /// Builds and publishes the next snapshot. Must be called with the lock held.
    fn link(
        &self,
        current: &TableSnapshot,
        node: Arc<RuleNode>,
        prev: Option<&Arc<RuleNode>>,
    ) -> Result<(), UpdateError> {
        let node = match prev {
            Some(prev) => Arc::new(node.succeeding(prev)),
            None => node,
        };

        let next = current.with_linked(&node, prev)?;
        self.table.store(Arc::new(next));
        Ok(())
    }
}

impl fmt::Debug for RuleStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleStore")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use spm_wire::{Command, RuleInner};

    use super::*;

    fn node(id: u32, precedence: u8) -> Arc<RuleNode> {
        let rule = Rule::add(id, precedence, RuleInner::new(RuleOutput::Priority(1)).always());
        Arc::new(RuleNode::new(rule, RuleOutput::Priority(1)))
    }

    fn ids(store: &RuleStore) -> Vec<u32> {
        store.scan_by_precedence_desc().map(|n| n.id).collect()
    }

    #[test]
    fn insert_and_lookup() {
        let store = RuleStore::new(255);
        assert_eq!(store.insert(node(7, 42)).unwrap().map(|n| n.id), None);

        let found = store.lookup(7).unwrap();
        assert_eq!(found.precedence, 42);
        assert_eq!(found.command, Command::Add);
        assert_eq!(store.len(), 1);
        assert_eq!(store.snapshot().bucket(42).len(), 1);
    }

    #[test]
    fn sentinel_precedence_lands_in_bucket_zero() {
        let store = RuleStore::new(255);
        store.insert(node(1, DEFAULT_PRECEDENCE)).unwrap();

        assert_eq!(store.lookup(1).unwrap().precedence, 0);
        assert_eq!(store.snapshot().bucket(0).len(), 1);
    }

    #[test]
    fn scan_is_descending_then_insertion_order() {
        let store = RuleStore::new(255);
        store.insert(node(1, 5)).unwrap();
        store.insert(node(2, 200)).unwrap();
        store.insert(node(3, 5)).unwrap();
        store.insert(node(4, 0)).unwrap();
        store.insert(node(5, 254)).unwrap();

        assert_eq!(ids(&store), vec![5, 2, 1, 3, 4]);
    }

    #[test]
    fn replace_same_precedence_keeps_position() {
        let store = RuleStore::new(255);
        store.insert(node(1, 9)).unwrap();
        store.insert(node(2, 9)).unwrap();
        store.insert(node(3, 9)).unwrap();

        let prev = store.replace(2, node(2, 9)).unwrap();
        assert_eq!(prev.id, 2);
        assert_eq!(ids(&store), vec![1, 2, 3]);
        assert!(!Arc::ptr_eq(&prev, &store.lookup(2).unwrap()));
    }

    #[test]
    fn replace_moves_bucket() {
        let store = RuleStore::new(255);
        store.insert(node(1, 9)).unwrap();
        store.insert(node(2, 9)).unwrap();

        store.replace(1, node(1, 100)).unwrap();

        assert_eq!(ids(&store), vec![1, 2]);
        assert_eq!(store.snapshot().bucket(9).len(), 1);
        assert_eq!(store.lookup(1).unwrap().precedence, 100);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn replace_unknown_id() {
        let store = RuleStore::new(255);
        assert_eq!(store.replace(3, node(3, 1)).unwrap_err(), UpdateError::RuleNotFound(3));
    }

    #[test]
    fn replacement_inherits_hits() {
        let store = RuleStore::new(255);
        store.insert(node(1, 9)).unwrap();
        let first = store.lookup(1).unwrap();
        first.record_hit();
        first.record_hit();

        store.insert(node(1, 10)).unwrap();
        assert_eq!(store.lookup(1).unwrap().hits(), 2);
    }

    #[test]
    fn replacement_shares_counter_with_pinned_readers() {
        let store = RuleStore::new(255);
        store.insert(node(1, 9)).unwrap();
        let old = store.lookup(1).unwrap();

        store.insert(node(1, 9)).unwrap();
        // A reader still holding the superseded node keeps counting into the live counter.
        old.record_hit();
        assert_eq!(store.lookup(1).unwrap().hits(), 1);
    }

    #[test]
    fn capacity_is_clamped() {
        assert_eq!(RuleStore::new(1000).capacity(), MAX_RULES);
    }

    #[test]
    fn full_for_new_ids_only() {
        let store = RuleStore::new(1);
        assert!(!store.is_full_for(1));
        store.insert(node(1, 1)).unwrap();
        assert!(store.is_full_for(2));
        assert!(!store.is_full_for(1));
    }

    #[test]
    fn capacity_only_limits_new_ids() {
        let store = RuleStore::new(2);
        store.insert(node(1, 1)).unwrap();
        store.insert(node(2, 2)).unwrap();

        assert_eq!(store.insert(node(3, 3)).unwrap_err(), UpdateError::TableFull { capacity: 2 });
        assert!(store.insert(node(2, 7)).unwrap().is_some());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn remove_errors() {
        let store = RuleStore::new(255);
        assert_eq!(store.remove(1).unwrap_err(), UpdateError::TableEmpty);

        store.insert(node(1, 1)).unwrap();
        assert_eq!(store.remove(2).unwrap_err(), UpdateError::RuleNotFound(2));
        assert_eq!(store.remove(1).unwrap().id, 1);
        assert!(store.lookup(1).is_none());
        assert!(store.snapshot().bucket(1).is_empty());
    }

    #[test]
    fn flush_empties_everything() {
        let store = RuleStore::new(255);
        assert_eq!(store.flush().unwrap_err(), UpdateError::TableEmpty);

        for id in 0..10 {
            store.insert(node(id, (id * 20) as u8)).unwrap();
        }
        assert_eq!(store.flush().unwrap(), 10);
        assert!(store.is_empty());
        assert!((0..10).all(|id| store.lookup(id).is_none()));
    }

    #[test]
    fn pinned_snapshot_survives_updates() {
        let store = RuleStore::new(255);
        store.insert(node(1, 1)).unwrap();

        let pinned = store.load();
        store.remove(1).unwrap();
        store.insert(node(2, 2)).unwrap();

        // The reader still sees the version it entered with.
        assert_eq!(pinned.len(), 1);
        assert!(pinned.get(1).is_some());
        assert!(pinned.get(2).is_none());
        assert!(store.lookup(1).is_none());
    }

    #[test]
    fn unchanged_buckets_are_shared() {
        let store = RuleStore::new(255);
        store.insert(node(1, 1)).unwrap();
        let before = store.snapshot();
        store.insert(node(2, 2)).unwrap();
        let after = store.snapshot();

        assert!(Arc::ptr_eq(&before.buckets[1], &after.buckets[1]));
        assert!(!Arc::ptr_eq(&before.buckets[2], &after.buckets[2]));
    }

    #[test]
    fn display_dump() {
        let store = RuleStore::new(255);
        store.insert(node(1, 3)).unwrap();
        store.insert(node(2, 8)).unwrap();

        let dump = store.snapshot().to_string();
        assert!(dump.starts_with("====Rule table start====\nTotal rule count = 2\n"));
        let p8 = dump.find("Precedence=8:").unwrap();
        let p3 = dump.find("Precedence=3:").unwrap();
        assert!(p8 < p3);
        assert!(dump.contains("[id=2, precedence=8, output=1, hits=0]"));
        assert!(dump.ends_with("====Rule table ends====\n"));
    }
}
