//! Thread-safe result cache with pluggable eviction.
//!
//! Entries are keyed by object id in a chained hash table that doubles
//! when the population reaches twice the bucket count. Eviction follows
//! one of two policies: a plain LRU list with move-to-front on touch, or
//! 2Q (Johnson & Shasha) with an `Am` main list, an `A1in` nursery and an
//! `A1out` ghost list bounded by `kin = 1` and `kout = capacity / 2`. An
//! application predicate can veto individual reclaims; entries it spares
//! stay cached.

use slab::Slab;

use parking_lot::Mutex;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const NIL: usize = usize::MAX;

/// Eviction policy selector, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Single recency list.
    Lru,
    /// Am + A1in + A1out.
    TwoQ,
}

/// Where an entry currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Inserted but not yet placed in a policy list.
    New,
    /// Dropped from the table; the next release frees it.
    Evicted,
    /// In the LRU recency list.
    InLru,
    /// In the 2Q main list.
    In2qAm,
    /// In the 2Q nursery.
    In2qA1in,
    /// In the 2Q ghost list.
    In2qA1out,
}

/// Reclaim veto: `true` lets the entry go, `false` keeps it and stops the
/// current reclaim pass.
pub type EvictFn<V> = dyn Fn(usize, &V) -> bool + Send + Sync;

struct Node<V> {
    oid: u64,
    value: Arc<V>,
    state: EntryState,
    hash_next: usize,
    prev: usize,
    next: usize,
}

/// Intrusive list head over slab indices.
#[derive(Clone, Copy)]
struct List {
    head: usize,
    tail: usize,
    len: usize,
}

impl List {
    const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }
}

fn list_push_front<V>(nodes: &mut Slab<Node<V>>, list: &mut List, at: usize) {
    nodes[at].prev = NIL;
    nodes[at].next = list.head;
    if list.head != NIL {
        nodes[list.head].prev = at;
    } else {
        list.tail = at;
    }
    list.head = at;
    list.len += 1;
}

fn list_unlink<V>(nodes: &mut Slab<Node<V>>, list: &mut List, at: usize) {
    let (prev, next) = (nodes[at].prev, nodes[at].next);
    if prev != NIL {
        nodes[prev].next = next;
    } else {
        list.head = next;
    }
    if next != NIL {
        nodes[next].prev = prev;
    } else {
        list.tail = prev;
    }
    nodes[at].prev = NIL;
    nodes[at].next = NIL;
    list.len -= 1;
}

fn list_move_front<V>(nodes: &mut Slab<Node<V>>, list: &mut List, at: usize) {
    if list.head != at {
        list_unlink(nodes, list, at);
        list_push_front(nodes, list, at);
    }
}

enum Lists {
    Lru(List),
    TwoQ {
        am: List,
        a1in: List,
        a1out: List,
        kin: usize,
        kout: usize,
    },
}

struct Inner<V> {
    nodes: Slab<Node<V>>,
    buckets: Vec<usize>,
    used: usize,
    lists: Lists,
}

/// The cache itself; clones of returned values share the entry.
pub struct Cache<V> {
    inner: Mutex<Inner<V>>,
    capacity: usize,
    evict: Option<Box<EvictFn<V>>>,
    hit: AtomicU64,
    miss: AtomicU64,
}

impl<V> Inner<V> {
    fn bucket(&self, oid: u64) -> usize {
        reef_types::bits::mix64(oid) as usize & (self.buckets.len() - 1)
    }

    fn find(&self, oid: u64) -> Option<usize> {
        let mut at = self.buckets[self.bucket(oid)];
        while at != NIL {
            if self.nodes[at].oid == oid {
                return Some(at);
            }
            at = self.nodes[at].hash_next;
        }
        None
    }

    fn table_insert(&mut self, at: usize) {
        let bucket = self.bucket(self.nodes[at].oid);
        self.nodes[at].hash_next = self.buckets[bucket];
        self.buckets[bucket] = at;
        self.used += 1;
        if self.used >= self.buckets.len() * 2 {
            self.resize();
        }
    }

    fn table_remove(&mut self, at: usize) {
        let bucket = self.bucket(self.nodes[at].oid);
        let mut slot = self.buckets[bucket];
        if slot == at {
            self.buckets[bucket] = self.nodes[at].hash_next;
        } else {
            while slot != NIL {
                let next = self.nodes[slot].hash_next;
                if next == at {
                    self.nodes[slot].hash_next = self.nodes[at].hash_next;
                    break;
                }
                slot = next;
            }
        }
        self.nodes[at].hash_next = NIL;
        self.used -= 1;
    }

    fn resize(&mut self) {
        let new_size = self.buckets.len() * 2;
        self.buckets = vec![NIL; new_size];
        let indices: Vec<usize> = self.nodes.iter().map(|(at, _)| at).collect();
        for at in indices {
            let bucket = self.bucket(self.nodes[at].oid);
            self.nodes[at].hash_next = self.buckets[bucket];
            self.buckets[bucket] = at;
        }
    }

    /// Policy touch on insert or lookup hit.
    fn touch(&mut self, at: usize) {
        match &mut self.lists {
            Lists::Lru(lru) => match self.nodes[at].state {
                EntryState::New => {
                    list_push_front(&mut self.nodes, lru, at);
                    self.nodes[at].state = EntryState::InLru;
                }
                EntryState::InLru => list_move_front(&mut self.nodes, lru, at),
                _ => {}
            },
            Lists::TwoQ { am, a1in, a1out, .. } => match self.nodes[at].state {
                EntryState::In2qAm => list_move_front(&mut self.nodes, am, at),
                EntryState::In2qA1out => {
                    // a ghost hit promotes into the main list
                    list_unlink(&mut self.nodes, a1out, at);
                    list_push_front(&mut self.nodes, am, at);
                    self.nodes[at].state = EntryState::In2qAm;
                }
                EntryState::In2qA1in => list_move_front(&mut self.nodes, a1in, at),
                EntryState::New => {
                    list_push_front(&mut self.nodes, a1in, at);
                    self.nodes[at].state = EntryState::In2qA1in;
                }
                _ => {}
            },
        }
    }

    fn unlink_from_policy(&mut self, at: usize) {
        match (&mut self.lists, self.nodes[at].state) {
            (Lists::Lru(lru), EntryState::InLru) => list_unlink(&mut self.nodes, lru, at),
            (Lists::TwoQ { am, .. }, EntryState::In2qAm) => list_unlink(&mut self.nodes, am, at),
            (Lists::TwoQ { a1in, .. }, EntryState::In2qA1in) => {
                list_unlink(&mut self.nodes, a1in, at)
            }
            (Lists::TwoQ { a1out, .. }, EntryState::In2qA1out) => {
                list_unlink(&mut self.nodes, a1out, at)
            }
            _ => {}
        }
    }

    /// Drop an entry from the table and its list; `Evicted` marks the
    /// final reference as the releasing one.
    fn reclaim_entry(&mut self, at: usize) {
        self.unlink_from_policy(at);
        self.table_remove(at);
        self.nodes[at].state = EntryState::Evicted;
        self.nodes.remove(at);
    }

    fn reclaim(&mut self, capacity: usize, evict: Option<&EvictFn<V>>) {
        match &mut self.lists {
            Lists::Lru(lru) => {
                let mut tail = lru.tail;
                while self.used > capacity && tail != NIL {
                    let prev = self.nodes[tail].prev;
                    if let Some(evict) = evict {
                        if !evict(self.used, &self.nodes[tail].value) {
                            break;
                        }
                    }
                    self.reclaim_entry(tail);
                    tail = prev;
                }
            }
            Lists::TwoQ { .. } => self.reclaim_2q(capacity, evict),
        }
    }

    fn reclaim_2q(&mut self, capacity: usize, evict: Option<&EvictFn<V>>) {
        loop {
            if self.used <= capacity {
                return;
            }
            let Lists::TwoQ {
                a1in,
                a1out,
                am,
                kin,
                kout,
            } = &mut self.lists
            else {
                unreachable!();
            };

            if a1in.len > 0 && a1in.len > *kin {
                // page the nursery tail out into the ghost list
                let tail = a1in.tail;
                list_unlink(&mut self.nodes, a1in, tail);
                list_push_front(&mut self.nodes, a1out, tail);
                self.nodes[tail].state = EntryState::In2qA1out;

                if a1out.len > *kout {
                    let ghost = a1out.tail;
                    if let Some(evict) = evict {
                        if !evict(self.used, &self.nodes[ghost].value) {
                            return;
                        }
                    }
                    self.reclaim_entry(ghost);
                }
            } else if am.len > 0 {
                // an aged main-list tail goes straight out
                let tail = am.tail;
                if let Some(evict) = evict {
                    if !evict(self.used, &self.nodes[tail].value) {
                        return;
                    }
                }
                self.reclaim_entry(tail);
            } else if a1in.len > 0 {
                let tail = a1in.tail;
                if let Some(evict) = evict {
                    if !evict(self.used, &self.nodes[tail].value) {
                        return;
                    }
                }
                self.reclaim_entry(tail);
            } else {
                return;
            }
        }
    }
}

impl<V> Cache<V> {
    /// Cache with the given policy and capacity.
    pub fn new(policy: Policy, capacity: usize) -> Self {
        Self::with_evict_fn(policy, capacity, None)
    }

    /// Cache with an application reclaim veto.
    pub fn with_evict_fn(
        policy: Policy,
        capacity: usize,
        evict: Option<Box<EvictFn<V>>>,
    ) -> Self {
        let lists = match policy {
            Policy::Lru => Lists::Lru(List::new()),
            Policy::TwoQ => Lists::TwoQ {
                am: List::new(),
                a1in: List::new(),
                a1out: List::new(),
                kin: 1,
                kout: capacity / 2,
            },
        };
        Self {
            inner: Mutex::new(Inner {
                nodes: Slab::new(),
                buckets: vec![NIL; reef_types::bits::pow2_at_least(capacity.max(4))],
                used: 0,
                lists,
            }),
            capacity,
            evict,
            hit: AtomicU64::new(0),
            miss: AtomicU64::new(0),
        }
    }

    /// Insert a value, returning the cached entry.
    ///
    /// When another caller already inserted `oid`, the existing entry wins
    /// and is returned touched; the new value is dropped.
    pub fn insert(&self, oid: u64, value: V) -> Arc<V> {
        let mut inner = self.inner.lock();
        if let Some(at) = inner.find(oid) {
            inner.touch(at);
            return inner.nodes[at].value.clone();
        }

        let value = Arc::new(value);
        let at = inner.nodes.insert(Node {
            oid,
            value: value.clone(),
            state: EntryState::New,
            hash_next: NIL,
            prev: NIL,
            next: NIL,
        });
        inner.table_insert(at);
        inner.touch(at);
        inner.reclaim(self.capacity, self.evict.as_deref());
        value
    }

    /// Look an entry up, touching it for the eviction policy.
    pub fn lookup(&self, oid: u64) -> Option<Arc<V>> {
        let mut inner = self.inner.lock();
        match inner.find(oid) {
            Some(at) => {
                self.hit.fetch_add(1, Ordering::Relaxed);
                inner.touch(at);
                Some(inner.nodes[at].value.clone())
            }
            None => {
                self.miss.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Drop an entry by id.
    pub fn remove(&self, oid: u64) -> Option<Arc<V>> {
        let mut inner = self.inner.lock();
        let at = inner.find(oid)?;
        let value = inner.nodes[at].value.clone();
        inner.reclaim_entry(at);
        Some(value)
    }

    /// Live entry count.
    pub fn len(&self) -> usize {
        self.inner.lock().used
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lookup hits so far.
    pub fn hits(&self) -> u64 {
        self.hit.load(Ordering::Relaxed)
    }

    /// Lookup misses so far.
    pub fn misses(&self) -> u64 {
        self.miss.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_evicts_least_recently_used() {
        let cache: Cache<u64> = Cache::new(Policy::Lru, 3);
        for oid in 0..3 {
            cache.insert(oid, oid * 10);
        }
        // touch 0 so 1 becomes the coldest
        assert_eq!(*cache.lookup(0).unwrap(), 0);
        cache.insert(3, 30);

        assert_eq!(cache.len(), 3);
        assert!(cache.lookup(1).is_none());
        assert!(cache.lookup(0).is_some());
        assert!(cache.lookup(3).is_some());
    }

    #[test]
    fn insert_race_returns_winner() {
        let cache: Cache<&'static str> = Cache::new(Policy::Lru, 8);
        let first = cache.insert(7, "first");
        let second = cache.insert(7, "second");
        assert_eq!(*first, "first");
        assert_eq!(*second, "first");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evict_predicate_can_veto() {
        let cache: Cache<u64> = Cache::with_evict_fn(
            Policy::Lru,
            2,
            Some(Box::new(|_, value| *value != 0)),
        );
        cache.insert(0, 0); // protected by the predicate
        cache.insert(1, 1);
        cache.insert(2, 2);
        cache.insert(3, 3);

        // entry 0 sits at the LRU tail and refuses to leave, which stalls
        // the reclaim pass entirely
        assert!(cache.lookup(0).is_some());
        assert!(cache.len() > 2);
    }

    #[test]
    fn two_q_nursery_and_promotion() {
        let cache: Cache<u64> = Cache::new(Policy::TwoQ, 4);
        for oid in 0..4 {
            cache.insert(oid, oid);
        }
        assert_eq!(cache.len(), 4);

        // overflow pushes nursery tails through A1out and out of the table
        for oid in 4..10 {
            cache.insert(oid, oid);
        }
        assert!(cache.len() <= 6, "ghost list is bounded by kout");

        // a hit in the ghost list promotes to Am and survives further churn
        let ghost = (0..10).find(|oid| cache.lookup(*oid).is_some()).unwrap();
        for oid in 10..16 {
            cache.insert(oid, oid);
        }
        assert!(cache.lookup(ghost).is_some());
    }

    #[test]
    fn removed_entries_survive_through_their_arc() {
        let cache: Cache<String> = Cache::new(Policy::Lru, 4);
        let held = cache.insert(1, "held".to_string());
        cache.remove(1);
        assert!(cache.lookup(1).is_none());
        assert_eq!(*held, "held");
        assert_eq!(Arc::strong_count(&held), 1);
    }

    #[test]
    fn hit_miss_accounting() {
        let cache: Cache<u64> = Cache::new(Policy::Lru, 4);
        cache.insert(1, 1);
        let _ = cache.lookup(1);
        let _ = cache.lookup(2);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }
}
