// # Execution Plan Cache
//
// Compiled plans are cached under three indexes: query text, plan id, and a
// class-oid multimap for invalidation. All three are serialized by one
// reader-writer critical section; entries are immutable after install
// except for the counter fields, which are mutated under that section. A
// fixed-size slot pool amortizes entry allocation, spilling to growth when
// exhausted. Entries in use by a transaction are never freed; a victim
// pass that cannot meet its budget marks in-use entries deleted instead,
// and a marked entry stays reachable only through its plan id until the
// last user drops it.

pub mod clone_cache;

use crate::common::{Oid, ReprId, TransactionId, Vpid};
use crate::error::{DbError, Result};
use clone_cache::CloneCache;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// On-disk plan identifier: two vpids plus the stored time; all four words
/// participate in equality and hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlanId {
    pub first_vpid: Vpid,
    pub temp_file_id: u32,
    pub stored_time: u64,
}

impl PlanId {
    pub fn new(first_vpid: Vpid, temp_file_id: u32, stored_time: u64) -> Self {
        Self { first_vpid, temp_file_id, stored_time }
    }
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct PlanCacheConfig {
    pub max_entries: usize,
    /// Entry time-to-live; `None` disables timeout eviction
    pub ttl: Option<Duration>,
    /// Pre-sized entry slot pool; growth beyond it falls back to the heap
    pub pool_size: usize,
    /// Process-wide clone LRU capacity
    pub clone_lru_capacity: usize,
}

impl Default for PlanCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            ttl: None,
            pool_size: 1024,
            clone_lru_capacity: 256,
        }
    }
}

/// What a lookup hands out
#[derive(Clone)]
pub struct CachedPlan {
    pub entry: usize,
    pub plan_id: PlanId,
    pub stream: Arc<Vec<u8>>,
    pub param_count: usize,
}

/// Result of an install attempt
pub enum InsertOutcome {
    Installed(CachedPlan),
    /// A racing installer won; the caller's plan id should be destroyed and
    /// the winner's used instead.
    Adopted(CachedPlan),
}

impl InsertOutcome {
    pub fn plan(&self) -> &CachedPlan {
        match self {
            InsertOutcome::Installed(p) | InsertOutcome::Adopted(p) => p,
        }
    }
}

struct Entry {
    query_text: String,
    plan_id: PlanId,
    creator: String,
    class_oids: Vec<Oid>,
    repr_ids: Vec<ReprId>,
    param_count: usize,
    stream: Arc<Vec<u8>>,
    ref_count: u64,
    created_at: Instant,
    last_used: Instant,
    tran_ids: Vec<TransactionId>,
    deleted: bool,
}

struct CacheInner {
    by_query: HashMap<String, usize>,
    by_plan: HashMap<PlanId, usize>,
    by_class: HashMap<Oid, Vec<usize>>,
    slots: Vec<Option<Entry>>,
    free_slots: Vec<usize>,
    /// Live, non-deleted entries
    live_count: usize,
}

/// The plan cache, generic over the decoded plan type held by the clone
/// cache.
pub struct PlanCache<P> {
    config: PlanCacheConfig,
    cs: RwLock<CacheInner>,
    clones: CloneCache<P>,
}

impl<P> PlanCache<P> {
    pub fn new(config: PlanCacheConfig) -> Self {
        let mut slots = Vec::with_capacity(config.pool_size);
        let mut free_slots = Vec::with_capacity(config.pool_size);
        for i in 0..config.pool_size {
            slots.push(None);
            free_slots.push(config.pool_size - 1 - i);
        }
        let clone_lru_capacity = config.clone_lru_capacity;
        Self {
            config,
            cs: RwLock::new(CacheInner {
                by_query: HashMap::new(),
                by_plan: HashMap::new(),
                by_class: HashMap::new(),
                slots,
                free_slots,
                live_count: 0,
            }),
            clones: CloneCache::new(clone_lru_capacity),
        }
    }

    /// Number of live (non-deleted) entries
    pub fn entry_count(&self) -> usize {
        self.cs.read().live_count
    }

    /// Look up by query text. Verifies the entry is live, was compiled by
    /// the same user, has not timed out, and that every referenced class
    /// still carries the representation id captured at compile time; any
    /// failure evicts the entry and reports a miss. A hit registers the
    /// transaction in the entry's in-use list.
    pub fn find(
        &self,
        query_text: &str,
        user: &str,
        tran_id: TransactionId,
        repr_of: &dyn Fn(Oid) -> Option<ReprId>,
    ) -> Option<CachedPlan> {
        let guard = self.cs.upgradable_read();
        let slot = *guard.by_query.get(query_text)?;
        let entry = guard.slots[slot].as_ref()?;

        let mut stale = entry.deleted || entry.creator != user;
        if let Some(ttl) = self.config.ttl {
            stale = stale || entry.last_used.elapsed() > ttl;
        }
        if !stale {
            for (oid, compiled_repr) in entry.class_oids.iter().zip(entry.repr_ids.iter()) {
                if repr_of(*oid) != Some(*compiled_repr) {
                    stale = true;
                    break;
                }
            }
        }

        let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
        if stale {
            evict_slot(&mut guard, slot, &self.clones);
            return None;
        }

        let entry = guard.slots[slot].as_mut()?;
        if !entry.tran_ids.contains(&tran_id) {
            entry.tran_ids.push(tran_id);
        }
        entry.last_used = Instant::now();
        entry.ref_count += 1;
        Some(CachedPlan {
            entry: slot,
            plan_id: entry.plan_id,
            stream: Arc::clone(&entry.stream),
            param_count: entry.param_count,
        })
    }

    /// Install a freshly compiled plan. If a matching entry raced in
    /// meanwhile it is adopted instead and the caller's plan id is left for
    /// the caller to destroy. A duplicate plan id is an error. When the
    /// cache is full, victim selection runs first.
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &self,
        query_text: &str,
        plan_id: PlanId,
        user: &str,
        class_oids: Vec<Oid>,
        repr_ids: Vec<ReprId>,
        param_count: usize,
        stream: Vec<u8>,
        tran_id: TransactionId,
    ) -> Result<InsertOutcome> {
        if class_oids.len() != repr_ids.len() {
            return Err(DbError::InvalidInput(
                "class list and representation list differ in length".to_string(),
            ));
        }
        let mut guard = self.cs.write();

        // Racing-winner check
        if let Some(&slot) = guard.by_query.get(query_text) {
            if let Some(entry) = guard.slots[slot].as_mut() {
                if !entry.deleted {
                    if !entry.tran_ids.contains(&tran_id) {
                        entry.tran_ids.push(tran_id);
                    }
                    entry.last_used = Instant::now();
                    entry.ref_count += 1;
                    return Ok(InsertOutcome::Adopted(CachedPlan {
                        entry: slot,
                        plan_id: entry.plan_id,
                        stream: Arc::clone(&entry.stream),
                        param_count: entry.param_count,
                    }));
                }
            }
        }

        if guard.by_plan.contains_key(&plan_id) {
            return Err(DbError::AlreadyExists(format!(
                "plan id {:?} already installed",
                plan_id
            )));
        }

        if guard.live_count >= self.config.max_entries {
            self.select_victims(&mut guard);
        }

        let now = Instant::now();
        let entry = Entry {
            query_text: query_text.to_string(),
            plan_id,
            creator: user.to_string(),
            class_oids: class_oids.clone(),
            repr_ids,
            param_count,
            stream: Arc::new(stream),
            ref_count: 1,
            created_at: now,
            last_used: now,
            tran_ids: vec![tran_id],
            deleted: false,
        };
        let stream = Arc::clone(&entry.stream);

        let slot = match guard.free_slots.pop() {
            Some(slot) => {
                guard.slots[slot] = Some(entry);
                slot
            }
            None => {
                // Pool exhausted: heap fallback
                guard.slots.push(Some(entry));
                guard.slots.len() - 1
            }
        };
        guard.by_query.insert(query_text.to_string(), slot);
        guard.by_plan.insert(plan_id, slot);
        for oid in class_oids {
            guard.by_class.entry(oid).or_default().push(slot);
        }
        guard.live_count += 1;

        Ok(InsertOutcome::Installed(CachedPlan {
            entry: slot,
            plan_id,
            stream,
            param_count,
        }))
    }

    /// Drop one entry. With users still attached the entry is marked
    /// deleted and stays reachable only through its plan id; the last
    /// user's release frees it.
    pub fn delete(&self, plan_id: &PlanId) -> Result<()> {
        let mut guard = self.cs.write();
        let slot = *guard
            .by_plan
            .get(plan_id)
            .ok_or_else(|| DbError::NotFound(format!("plan {:?} not cached", plan_id)))?;
        evict_slot(&mut guard, slot, &self.clones);
        Ok(())
    }

    /// A transaction finished with its plan.
    pub fn release(&self, plan_id: &PlanId, tran_id: TransactionId) {
        let mut guard = self.cs.write();
        let slot = match guard.by_plan.get(plan_id) {
            Some(s) => *s,
            None => return,
        };
        let free_now = {
            let entry = match guard.slots[slot].as_mut() {
                Some(e) => e,
                None => return,
            };
            entry.tran_ids.retain(|t| *t != tran_id);
            entry.deleted && entry.tran_ids.is_empty()
        };
        if free_now {
            free_slot(&mut guard, slot, &self.clones);
        }
    }

    /// Schema change: delete or mark every entry compiled against a class.
    pub fn invalidate_class(&self, class_oid: Oid) {
        let mut guard = self.cs.write();
        let slots = guard.by_class.get(&class_oid).cloned().unwrap_or_default();
        for slot in slots {
            evict_slot(&mut guard, slot, &self.clones);
        }
        debug!(class = %class_oid, "plan cache invalidated for class change");
    }

    /// Check out a pre-decoded clone, decoding the entry's stream on a
    /// miss.
    pub fn checkout_clone(
        &self,
        plan: &CachedPlan,
        decode: impl FnOnce(&[u8]) -> Result<Box<P>>,
    ) -> Result<Box<P>> {
        let stream = Arc::clone(&plan.stream);
        self.clones.checkout(plan.entry, move || decode(&stream))
    }

    /// Return a clone to the entry's list and the process-wide LRU.
    pub fn return_clone(&self, plan: &CachedPlan, clone: Box<P>) {
        self.clones.give_back(plan.entry, clone);
    }

    /// In-use transaction count for an entry, by plan id.
    pub fn in_use_count(&self, plan_id: &PlanId) -> usize {
        let guard = self.cs.read();
        guard
            .by_plan
            .get(plan_id)
            .and_then(|slot| guard.slots[*slot].as_ref())
            .map(|e| e.tran_ids.len())
            .unwrap_or(0)
    }

    /// Whether an entry is reachable from the query-text index.
    pub fn query_text_reachable(&self, query_text: &str) -> bool {
        self.cs.read().by_query.contains_key(query_text)
    }

    /// Two candidate sets are collected in one pass: the oldest-created
    /// and the least-referenced, each capped at 5% of capacity. Victims
    /// are their intersection capped at 2%, topped up from the union. A
    /// first pass skips in-use entries; if the budget is still unmet the
    /// pass repeats allowing in-use entries to be marked deleted.
    fn select_victims(&self, guard: &mut CacheInner) {
        let candidate_budget = (self.config.max_entries / 20).max(1);
        let victim_cap = (self.config.max_entries / 50).max(1);

        let mut evicted = 0usize;
        for allow_in_use in [false, true] {
            let mut candidates: Vec<(usize, Instant, u64, bool)> = Vec::new();
            for (slot, entry) in guard.slots.iter().enumerate() {
                if let Some(entry) = entry {
                    if entry.deleted {
                        continue;
                    }
                    let in_use = !entry.tran_ids.is_empty();
                    if in_use && !allow_in_use {
                        continue;
                    }
                    candidates.push((slot, entry.created_at, entry.ref_count, in_use));
                }
            }

            let mut oldest = candidates.clone();
            oldest.sort_by_key(|(_, created, _, _)| *created);
            oldest.truncate(candidate_budget);

            let mut least = candidates;
            least.sort_by_key(|(_, _, refs, _)| *refs);
            least.truncate(candidate_budget);

            let mut victims: Vec<usize> = oldest
                .iter()
                .filter(|(slot, ..)| least.iter().any(|(s, ..)| s == slot))
                .map(|(slot, ..)| *slot)
                .collect();
            victims.truncate(victim_cap);
            if victims.len() < victim_cap {
                for (slot, ..) in oldest.iter().chain(least.iter()) {
                    if victims.len() >= victim_cap {
                        break;
                    }
                    if !victims.contains(slot) {
                        victims.push(*slot);
                    }
                }
            }

            for slot in victims {
                evict_slot(guard, slot, &self.clones);
                evicted += 1;
            }
            if evicted >= victim_cap || guard.live_count < self.config.max_entries {
                break;
            }
        }
        debug!(evicted, "plan cache victim selection completed");
    }
}

/// Delete an entry: full removal when idle, mark-deleted when in use (then
/// reachable only via the plan-id index).
fn evict_slot<P>(inner: &mut CacheInner, slot: usize, clones: &CloneCache<P>) {
    let (query_text, class_oids, in_use, was_deleted) = {
        let entry = match inner.slots[slot].as_mut() {
            Some(e) => e,
            None => return,
        };
        let info = (
            entry.query_text.clone(),
            entry.class_oids.clone(),
            !entry.tran_ids.is_empty(),
            entry.deleted,
        );
        info
    };
    if was_deleted {
        return;
    }

    if inner.by_query.get(&query_text) == Some(&slot) {
        inner.by_query.remove(&query_text);
    }
    for oid in &class_oids {
        if let Some(list) = inner.by_class.get_mut(oid) {
            list.retain(|s| *s != slot);
            if list.is_empty() {
                inner.by_class.remove(oid);
            }
        }
    }
    inner.live_count -= 1;

    if in_use {
        if let Some(entry) = inner.slots[slot].as_mut() {
            entry.deleted = true;
        }
    } else {
        free_slot(inner, slot, clones);
    }
}

/// Physically free a slot; all index reachability is removed atomically
/// with respect to the critical section.
fn free_slot<P>(inner: &mut CacheInner, slot: usize, clones: &CloneCache<P>) {
    if let Some(entry) = inner.slots[slot].take() {
        inner.by_plan.remove(&entry.plan_id);
        if inner.by_query.get(&entry.query_text) == Some(&slot) {
            inner.by_query.remove(&entry.query_text);
        }
        for oid in &entry.class_oids {
            if let Some(list) = inner.by_class.get_mut(oid) {
                list.retain(|s| *s != slot);
                if list.is_empty() {
                    inner.by_class.remove(oid);
                }
            }
        }
        if !entry.deleted {
            inner.live_count -= 1;
        }
        clones.purge(slot);
        inner.free_slots.push(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_id(n: u32) -> PlanId {
        PlanId::new(Vpid::new(0, n), n, n as u64)
    }

    fn cache(max: usize) -> PlanCache<String> {
        PlanCache::new(PlanCacheConfig {
            max_entries: max,
            ttl: None,
            pool_size: max,
            clone_lru_capacity: 8,
        })
    }

    fn no_classes(_: Oid) -> Option<ReprId> {
        None
    }

    fn install(cache: &PlanCache<String>, text: &str, id: u32, tran: TransactionId) -> CachedPlan {
        match cache
            .insert(text, plan_id(id), "dba", vec![], vec![], 0, vec![1, 2, 3], tran)
            .unwrap()
        {
            InsertOutcome::Installed(p) => p,
            InsertOutcome::Adopted(_) => panic!("unexpected adoption"),
        }
    }

    #[test]
    fn test_insert_then_find() {
        let cache = cache(16);
        install(&cache, "select 1", 1, 10);
        let found = cache.find("select 1", "dba", 11, &no_classes).unwrap();
        assert_eq!(found.plan_id, plan_id(1));
        assert_eq!(cache.in_use_count(&plan_id(1)), 2);
    }

    #[test]
    fn test_find_wrong_user_evicts() {
        let cache = cache(16);
        install(&cache, "select 1", 1, 10);
        assert!(cache.find("select 1", "intruder", 11, &no_classes).is_none());
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn test_repr_mismatch_evicts() {
        let cache = cache(16);
        let class = Oid::new(0, 5, 1);
        cache
            .insert("select * from t", plan_id(1), "dba", vec![class], vec![3], 0, vec![], 10)
            .unwrap();
        assert!(cache
            .find("select * from t", "dba", 11, &|_| Some(4))
            .is_none());
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn test_racing_insert_adopts_winner() {
        let cache = cache(16);
        let winner = install(&cache, "select 2", 1, 10);
        match cache
            .insert("select 2", plan_id(2), "dba", vec![], vec![], 0, vec![], 11)
            .unwrap()
        {
            InsertOutcome::Adopted(p) => assert_eq!(p.plan_id, winner.plan_id),
            InsertOutcome::Installed(_) => panic!("expected adoption"),
        }
        assert_eq!(cache.entry_count(), 1);
        // The loser's plan id never entered the index
        assert!(cache.delete(&plan_id(2)).is_err());
    }

    #[test]
    fn test_duplicate_plan_id_rejected() {
        let cache = cache(16);
        install(&cache, "q1", 1, 10);
        assert!(matches!(
            cache.insert("q2", plan_id(1), "dba", vec![], vec![], 0, vec![], 11),
            Err(DbError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_delete_then_find_misses_then_reinsert() {
        let cache = cache(16);
        install(&cache, "q", 1, 10);
        cache.release(&plan_id(1), 10);
        cache.delete(&plan_id(1)).unwrap();
        assert!(cache.find("q", "dba", 11, &no_classes).is_none());
        let fresh = install(&cache, "q", 2, 11);
        assert_ne!(fresh.plan_id, plan_id(1));
    }

    #[test]
    fn test_in_use_delete_defers_free() {
        let cache = cache(16);
        install(&cache, "held", 1, 10);
        cache.delete(&plan_id(1)).unwrap();
        // Gone from the query index, still reachable via plan id
        assert!(!cache.query_text_reachable("held"));
        assert_eq!(cache.in_use_count(&plan_id(1)), 1);
        // A replacement can install immediately
        install(&cache, "held", 2, 11);
        // Last user's release frees the marked entry
        cache.release(&plan_id(1), 10);
        assert_eq!(cache.in_use_count(&plan_id(1)), 0);
    }

    #[test]
    fn test_class_invalidation() {
        let cache = cache(16);
        let class = Oid::new(0, 9, 0);
        cache
            .insert("qa", plan_id(1), "dba", vec![class], vec![1], 0, vec![], 10)
            .unwrap();
        cache
            .insert("qb", plan_id(2), "dba", vec![class], vec![1], 0, vec![], 10)
            .unwrap();
        cache.release(&plan_id(1), 10);
        cache.release(&plan_id(2), 10);
        cache.invalidate_class(class);
        assert_eq!(cache.entry_count(), 0);
        assert!(cache.find("qa", "dba", 11, &no_classes).is_none());
    }

    #[test]
    fn test_victim_selection_when_full() {
        let cache = cache(4);
        for i in 0..4 {
            let p = install(&cache, &format!("q{}", i), i as u32 + 1, 10 + i as u64);
            cache.release(&p.plan_id, 10 + i as u64);
        }
        assert_eq!(cache.entry_count(), 4);
        install(&cache, "overflow", 99, 50);
        assert!(cache.entry_count() <= 4);
        assert!(cache.query_text_reachable("overflow"));
    }

    #[test]
    fn test_full_cache_all_in_use_marks_deleted() {
        let cache = cache(2);
        install(&cache, "a", 1, 10);
        install(&cache, "b", 2, 11);
        // Every entry has a live user; the installer must not block
        install(&cache, "c", 3, 12);
        assert!(cache.query_text_reachable("c"));
        // Someone was marked deleted yet survives for its user
        let marked = [plan_id(1), plan_id(2)]
            .iter()
            .filter(|p| cache.in_use_count(p) > 0 && !cache.query_text_reachable(if **p == plan_id(1) { "a" } else { "b" }))
            .count();
        assert!(marked >= 1);
    }

    #[test]
    fn test_ttl_eviction() {
        let cache: PlanCache<String> = PlanCache::new(PlanCacheConfig {
            max_entries: 8,
            ttl: Some(Duration::from_millis(0)),
            pool_size: 8,
            clone_lru_capacity: 8,
        });
        cache
            .insert("old", plan_id(1), "dba", vec![], vec![], 0, vec![], 10)
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.find("old", "dba", 11, &no_classes).is_none());
    }

    #[test]
    fn test_clone_checkout_and_return() {
        let cache = cache(8);
        let plan = install(&cache, "cloned", 1, 10);
        let clone = cache
            .checkout_clone(&plan, |stream| Ok(Box::new(format!("{} bytes", stream.len()))))
            .unwrap();
        assert_eq!(*clone, "3 bytes");
        cache.return_clone(&plan, clone);
        let again = cache
            .checkout_clone(&plan, |_| panic!("must reuse the cached clone"))
            .unwrap();
        assert_eq!(*again, "3 bytes");
    }

    #[test]
    fn test_concurrent_race_single_winner() {
        let cache = Arc::new(cache(64));
        let mut handles = Vec::new();
        for t in 0..8u32 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                cache.insert(
                    "raced",
                    plan_id(100 + t),
                    "dba",
                    vec![],
                    vec![],
                    0,
                    vec![],
                    t as u64,
                )
            }));
        }
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect();
        let installed = outcomes
            .iter()
            .filter(|o| matches!(o, InsertOutcome::Installed(_)))
            .count();
        assert_eq!(installed, 1);
        assert_eq!(cache.entry_count(), 1);
        // Every loser sees the winner's plan id
        let winner = outcomes
            .iter()
            .find_map(|o| match o {
                InsertOutcome::Installed(p) => Some(p.plan_id),
                _ => None,
            })
            .unwrap();
        for o in &outcomes {
            assert_eq!(o.plan().plan_id, winner);
        }
    }
}
