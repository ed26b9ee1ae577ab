//! C1: an in-memory, per-repo FIFO of waiting run keys, ordered by creation
//! time.
//!
//! Backed by a binary heap keyed on `(creation_time, insertion_sequence)`
//! plus a side map for O(1) presence tests and "logical" O(log n) removal.
//! `BinaryHeap` has no native decrease-key/remove-arbitrary operation, so
//! `remove` just drops the key from the side map; the stale heap entry is
//! discarded lazily the next time it would otherwise surface from `peek`
//! or `pop_item`. This queue is not internally synchronized — callers
//! (the queue manager) hold their own lock for the duration of any
//! operation.
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;

#[derive(Debug, Clone, Copy)]
struct Ticket {
    creation_time: i64,
    seq: u64,
}

/// A single waiting entry as returned by `peek`/`pop_item`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry<K> {
    pub key: K,
    /// Creation time as nanoseconds since the Unix epoch.
    pub creation_time: i64,
}

pub struct PriorityQueue<K: Eq + Hash + Clone + Ord> {
    heap: BinaryHeap<Reverse<(i64, u64, K)>>,
    present: HashMap<K, Ticket>,
    next_seq: u64,
}

impl<K: Eq + Hash + Clone + Ord> Default for PriorityQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone + Ord> PriorityQueue<K> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            present: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Add `key` ordered by `creation_time` (nanoseconds since epoch).
    /// A no-op if `key` is already present — re-adding never changes its
    /// position.
    pub fn add(&mut self, key: K, creation_time: i64) {
        if self.present.contains_key(&key) {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.present.insert(key.clone(), Ticket { creation_time, seq });
        self.heap.push(Reverse((creation_time, seq, key)));
    }

    /// Remove `key` if present. Silent (no error) when absent.
    pub fn remove(&mut self, key: &K) {
        self.present.remove(key);
        self.compact_if_needed();
    }

    /// The head entry (smallest creation time; ties broken by insertion
    /// order), without removing it.
    pub fn peek(&mut self) -> Option<QueueEntry<K>> {
        self.drop_stale();
        self.heap.peek().map(|Reverse((ct, _seq, k))| QueueEntry {
            key: k.clone(),
            creation_time: *ct,
        })
    }

    /// Remove and return the head entry, or `None` if empty.
    pub fn pop_item(&mut self) -> Option<QueueEntry<K>> {
        self.drop_stale();
        let Reverse((ct, _seq, key)) = self.heap.pop()?;
        self.present.remove(&key);
        Some(QueueEntry {
            key,
            creation_time: ct,
        })
    }

    pub fn contains(&self, key: &K) -> bool {
        self.present.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.present.len()
    }

    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }

    /// All currently-queued keys, in raw heap-array order. NOT sorted by
    /// creation time; callers that need sorted output should drain a clone
    /// via repeated `peek`/`pop_item`.
    pub fn pending_items(&self) -> Vec<K> {
        self.heap
            .iter()
            .filter_map(|Reverse((ct, seq, key))| match self.present.get(key) {
                Some(ticket) if ticket.creation_time == *ct && ticket.seq == *seq => {
                    Some(key.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Discard heap entries at the head that are stale (their key was
    /// removed, or re-added and is now represented by a different entry).
    fn drop_stale(&mut self) {
        while let Some(Reverse((ct, seq, key))) = self.heap.peek() {
            match self.present.get(key) {
                Some(ticket) if ticket.creation_time == *ct && ticket.seq == *seq => break,
                _ => {
                    self.heap.pop();
                }
            }
        }
    }

    /// Rebuild the heap from `present` once enough logically-removed
    /// tombstones have accumulated, so a queue with heavy churn doesn't
    /// grow unboundedly between pops.
    fn compact_if_needed(&mut self) {
        if self.heap.len() <= self.present.len().saturating_mul(2) + 16 {
            return;
        }
        self.heap = self
            .present
            .iter()
            .map(|(k, t)| Reverse((t.creation_time, t.seq, k.clone())))
            .collect();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fifo_by_creation_time() {
        let mut q = PriorityQueue::new();
        q.add("rB", 100);
        q.add("rA", 50);
        assert_eq!(q.peek().unwrap().key, "rA");
    }

    #[test]
    fn ties_broken_by_insertion_order() {
        let mut q = PriorityQueue::new();
        q.add("first", 10);
        q.add("second", 10);
        assert_eq!(q.pop_item().unwrap().key, "first");
        assert_eq!(q.pop_item().unwrap().key, "second");
    }

    #[test]
    fn add_is_idempotent_and_keeps_original_position() {
        let mut q = PriorityQueue::new();
        q.add("k", 10);
        assert!(q.contains(&"k"));
        q.add("k", 999999);
        assert_eq!(q.len(), 1);
        assert_eq!(q.peek().unwrap().creation_time, 10);
    }

    #[test]
    fn remove_is_silent_when_absent() {
        let mut q: PriorityQueue<&str> = PriorityQueue::new();
        q.remove(&"nope");
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn remove_then_peek_skips_stale_entry() {
        let mut q = PriorityQueue::new();
        q.add("a", 1);
        q.add("b", 2);
        q.remove(&"a");
        assert_eq!(q.peek().unwrap().key, "b");
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn pending_items_unordered_matches_contents() {
        let mut q = PriorityQueue::new();
        q.add("a", 3);
        q.add("b", 1);
        q.add("c", 2);
        q.remove(&"b");
        let mut items = q.pending_items();
        items.sort();
        assert_eq!(items, vec!["a", "c"]);
    }

    #[test]
    fn pop_empty_returns_none() {
        let mut q: PriorityQueue<&str> = PriorityQueue::new();
        assert!(q.pop_item().is_none());
        assert!(q.peek().is_none());
    }

    #[test]
    fn heavy_churn_compacts() {
        let mut q = PriorityQueue::new();
        for i in 0..1000 {
            q.add(i, i as i64);
            q.remove(&i);
        }
        q.add(12345, 12345);
        assert_eq!(q.len(), 1);
        assert_eq!(q.peek().unwrap().key, 12345);
    }
}
