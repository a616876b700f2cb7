// # Storage Collaborators
//
// The opaque services the interpreter calls into: the class catalog with
// representation ids and partition maps, the heap store, unique indexes
// with (nulls, keys, oids) statistics, the lock manager, and the
// transaction service with savepoints and interrupt flags. These carry the
// contract surface the execution engine needs; the physical layouts behind
// them are out of scope here and kept in memory.

use crate::common::{NodeId, Oid, ReprId, TranIndex, LOCAL_NODE_ID};
use crate::error::{DbError, Result};
use crate::runtime::value::{sort_compare, Domain, Value};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

// ============================================================================
// Catalog
// ============================================================================

/// One attribute of a class
#[derive(Debug, Clone)]
pub struct AttrDef {
    pub id: u32,
    pub name: String,
    pub domain: Domain,
    pub not_null: bool,
}

/// Range partition: rows route to the first partition whose upper bound is
/// above the key; `None` is the catch-all.
#[derive(Debug, Clone)]
pub struct PartitionDef {
    pub class_oid: Oid,
    pub upper_bound: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct PartitionSpec {
    pub key_attr: u32,
    pub partitions: Vec<PartitionDef>,
}

/// Class metadata as the engine sees it
#[derive(Debug, Clone)]
pub struct ClassMeta {
    pub oid: Oid,
    pub name: String,
    pub attrs: Vec<AttrDef>,
    pub repr_id: ReprId,
    /// Owning node; a non-local class is scanned remotely
    pub node_id: NodeId,
    pub partition: Option<PartitionSpec>,
}

pub struct Catalog {
    classes: Mutex<HashMap<Oid, ClassMeta>>,
    by_name: Mutex<HashMap<String, Oid>>,
    next_class_page: AtomicU32,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            classes: Mutex::new(HashMap::new()),
            by_name: Mutex::new(HashMap::new()),
            next_class_page: AtomicU32::new(1),
        }
    }

    pub fn define_class(
        &self,
        name: &str,
        attrs: Vec<AttrDef>,
        node_id: NodeId,
        partition: Option<PartitionSpec>,
    ) -> Result<Oid> {
        let mut by_name = self.by_name.lock();
        if by_name.contains_key(name) {
            return Err(DbError::AlreadyExists(format!("class '{}'", name)));
        }
        let oid = Oid::new(0, self.next_class_page.fetch_add(1, AtomicOrdering::SeqCst), 0);
        let meta = ClassMeta {
            oid,
            name: name.to_string(),
            attrs,
            repr_id: 1,
            node_id,
            partition,
        };
        self.classes.lock().insert(oid, meta);
        by_name.insert(name.to_string(), oid);
        Ok(oid)
    }

    pub fn class(&self, oid: Oid) -> Option<ClassMeta> {
        self.classes.lock().get(&oid).cloned()
    }

    pub fn class_by_name(&self, name: &str) -> Option<ClassMeta> {
        let oid = *self.by_name.lock().get(name)?;
        self.class(oid)
    }

    pub fn repr_id(&self, oid: Oid) -> Option<ReprId> {
        self.classes.lock().get(&oid).map(|c| c.repr_id)
    }

    /// DDL bumped the class's physical schema version.
    pub fn bump_repr(&self, oid: Oid) -> Result<ReprId> {
        let mut classes = self.classes.lock();
        let meta = classes
            .get_mut(&oid)
            .ok_or_else(|| DbError::Catalog(format!("no class {}", oid)))?;
        meta.repr_id += 1;
        Ok(meta.repr_id)
    }

    pub fn is_local(&self, oid: Oid) -> bool {
        self.class(oid).map(|c| c.node_id == LOCAL_NODE_ID).unwrap_or(false)
    }

    /// Route a partition key to its partition class.
    pub fn partition_for(&self, class: &ClassMeta, key: &Value) -> Result<Oid> {
        let spec = class
            .partition
            .as_ref()
            .ok_or_else(|| DbError::Catalog(format!("class '{}' is not partitioned", class.name)))?;
        for part in &spec.partitions {
            match &part.upper_bound {
                None => return Ok(part.class_oid),
                Some(bound) => {
                    if sort_compare(key, bound)? == Ordering::Less {
                        return Ok(part.class_oid);
                    }
                }
            }
        }
        Err(DbError::Execution(format!(
            "no partition of '{}' accepts key {:?}",
            class.name, key
        )))
    }
}

// ============================================================================
// Heap store
// ============================================================================

/// Rows of one class, keyed by instance oid in allocation order.
pub struct HeapStore {
    rows: DashMap<Oid, BTreeMap<Oid, Vec<Value>>>,
    next_page: AtomicU32,
}

/// Rows per heap "page" as seen by block-wise scans
pub const HEAP_PAGE_ROWS: usize = 64;

impl Default for HeapStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapStore {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            next_page: AtomicU32::new(1),
        }
    }

    pub fn insert(&self, class: Oid, values: Vec<Value>) -> Oid {
        let page = self.next_page.fetch_add(1, AtomicOrdering::SeqCst);
        let oid = Oid::new(1, page, 0);
        self.rows.entry(class).or_default().insert(oid, values);
        oid
    }

    pub fn fetch(&self, class: Oid, oid: Oid) -> Option<Vec<Value>> {
        self.rows.get(&class)?.get(&oid).cloned()
    }

    pub fn update(&self, class: Oid, oid: Oid, values: Vec<Value>) -> Result<Vec<Value>> {
        let mut rows = self
            .rows
            .get_mut(&class)
            .ok_or_else(|| DbError::Storage(format!("class {} has no heap", class)))?;
        let slot = rows
            .get_mut(&oid)
            .ok_or_else(|| DbError::NotFound(format!("object {}", oid)))?;
        Ok(std::mem::replace(slot, values))
    }

    pub fn delete(&self, class: Oid, oid: Oid) -> Result<Vec<Value>> {
        let mut rows = self
            .rows
            .get_mut(&class)
            .ok_or_else(|| DbError::Storage(format!("class {} has no heap", class)))?;
        rows.remove(&oid)
            .ok_or_else(|| DbError::NotFound(format!("object {}", oid)))
    }

    /// Put a row back under a known oid (statement rollback).
    pub fn restore(&self, class: Oid, oid: Oid, values: Vec<Value>) {
        self.rows.entry(class).or_default().insert(oid, values);
    }

    /// Snapshot of (oid, row) pairs in oid order.
    pub fn scan_all(&self, class: Oid) -> Vec<(Oid, Vec<Value>)> {
        self.rows
            .get(&class)
            .map(|rows| rows.iter().map(|(o, v)| (*o, v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, class: Oid) -> usize {
        self.rows.get(&class).map(|r| r.len()).unwrap_or(0)
    }
}

// ============================================================================
// Unique indexes
// ============================================================================

/// Key wrapper ordering values with nulls below everything
#[derive(Debug, Clone)]
pub struct SortableKey(pub Vec<Value>);

impl PartialEq for SortableKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortableKey {}

impl PartialOrd for SortableKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortableKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            let ord = sort_compare(a, b).unwrap_or(Ordering::Equal);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

impl SortableKey {
    pub fn has_null(&self) -> bool {
        self.0.iter().any(|v| v.is_null())
    }
}

/// Root-page statistics of a unique index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UniqueStats {
    pub nulls: i64,
    pub keys: i64,
    pub oids: i64,
}

pub struct UniqueIndex {
    pub name: String,
    pub class: Oid,
    pub key_attrs: Vec<u32>,
    entries: Mutex<BTreeMap<SortableKey, Oid>>,
    stats: Mutex<UniqueStats>,
}

impl UniqueIndex {
    pub fn new(name: &str, class: Oid, key_attrs: Vec<u32>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            class,
            key_attrs,
            entries: Mutex::new(BTreeMap::new()),
            stats: Mutex::new(UniqueStats::default()),
        })
    }

    /// Build the key for a row, by attribute position.
    pub fn key_of(&self, row: &[Value]) -> SortableKey {
        SortableKey(
            self.key_attrs
                .iter()
                .map(|a| row.get(*a as usize).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }

    /// Probe for the holder of a key. Null keys are never stored.
    pub fn probe(&self, key: &SortableKey) -> Option<Oid> {
        if key.has_null() {
            return None;
        }
        self.entries.lock().get(key).copied()
    }

    /// Insert a key, immediately reflecting single-row statistics. Null
    /// keys count as nulls and are not stored.
    pub fn insert_key(&self, key: SortableKey, oid: Oid) -> Result<()> {
        let mut stats = self.stats.lock();
        if key.has_null() {
            stats.nulls += 1;
            stats.oids += 1;
            return Ok(());
        }
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return Err(DbError::DuplicateKey(self.name.clone()));
        }
        entries.insert(key, oid);
        stats.keys += 1;
        stats.oids += 1;
        Ok(())
    }

    pub fn delete_key(&self, key: &SortableKey) {
        let mut stats = self.stats.lock();
        if key.has_null() {
            stats.nulls -= 1;
            stats.oids -= 1;
            return;
        }
        if self.entries.lock().remove(key).is_some() {
            stats.keys -= 1;
            stats.oids -= 1;
        }
    }

    /// Insert without touching statistics; the caller accumulates a delta
    /// and reflects it separately.
    pub fn insert_raw(&self, key: SortableKey, oid: Oid) -> Result<()> {
        if key.has_null() {
            return Ok(());
        }
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return Err(DbError::DuplicateKey(self.name.clone()));
        }
        entries.insert(key, oid);
        Ok(())
    }

    /// Remove without touching statistics.
    pub fn remove_raw(&self, key: &SortableKey) -> bool {
        if key.has_null() {
            return true;
        }
        self.entries.lock().remove(key).is_some()
    }

    /// Fold an accumulated multi-row delta into the root statistics.
    pub fn reflect_delta(&self, delta: UniqueStats) {
        let mut stats = self.stats.lock();
        stats.nulls += delta.nulls;
        stats.keys += delta.keys;
        stats.oids += delta.oids;
    }

    pub fn stats(&self) -> UniqueStats {
        *self.stats.lock()
    }

    /// Ordered (key, oid) pairs within a closed key range.
    pub fn range(
        &self,
        low: Option<&SortableKey>,
        high: Option<&SortableKey>,
    ) -> Vec<(SortableKey, Oid)> {
        let entries = self.entries.lock();
        entries
            .iter()
            .filter(|(k, _)| {
                low.map(|l| (*k).cmp(l) != Ordering::Less).unwrap_or(true)
                    && high.map(|h| (*k).cmp(h) != Ordering::Greater).unwrap_or(true)
            })
            .map(|(k, o)| (k.clone(), *o))
            .collect()
    }
}

// ============================================================================
// Lock manager
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Whether the lock came without waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockGrant {
    pub instant: bool,
}

struct LockState {
    holder: TranIndex,
    mode: LockMode,
    count: u32,
}

pub struct LockManager {
    locks: Mutex<HashMap<Oid, LockState>>,
    released: Condvar,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    /// Acquire a lock, waiting up to `timeout`. `None` never blocks.
    pub fn acquire(
        &self,
        tran: TranIndex,
        oid: Oid,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<LockGrant> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut locks = self.locks.lock();
        let mut instant = true;
        loop {
            match locks.get_mut(&oid) {
                None => {
                    locks.insert(oid, LockState { holder: tran, mode, count: 1 });
                    return Ok(LockGrant { instant });
                }
                Some(state) if state.holder == tran => {
                    state.count += 1;
                    if mode == LockMode::Exclusive {
                        state.mode = LockMode::Exclusive;
                    }
                    return Ok(LockGrant { instant });
                }
                Some(state)
                    if state.mode == LockMode::Shared && mode == LockMode::Shared =>
                {
                    state.count += 1;
                    return Ok(LockGrant { instant });
                }
                Some(_) => {
                    instant = false;
                    match deadline {
                        None => return Err(DbError::LockTimeout),
                        Some(deadline) => {
                            if self.released.wait_until(&mut locks, deadline).timed_out() {
                                return Err(DbError::LockTimeout);
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn release(&self, tran: TranIndex, oid: Oid) {
        let mut locks = self.locks.lock();
        if let Some(state) = locks.get_mut(&oid) {
            if state.holder == tran {
                state.count -= 1;
                if state.count == 0 {
                    locks.remove(&oid);
                }
            }
        }
        drop(locks);
        self.released.notify_all();
    }

    pub fn release_all(&self, tran: TranIndex) {
        let mut locks = self.locks.lock();
        locks.retain(|_, state| state.holder != tran);
        drop(locks);
        self.released.notify_all();
    }

    pub fn held_count(&self, tran: TranIndex) -> usize {
        self.locks
            .lock()
            .values()
            .filter(|s| s.holder == tran)
            .count()
    }
}

// ============================================================================
// Transaction service
// ============================================================================

/// Undo record for statement-level rollback. Index undo bypasses the root
/// statistics: deltas are only reflected after the statement succeeds.
pub enum UndoOp {
    HeapInsert { class: Oid, oid: Oid },
    HeapDelete { class: Oid, oid: Oid, row: Vec<Value> },
    HeapUpdate { class: Oid, oid: Oid, old_row: Vec<Value> },
    IndexInsert { index: Arc<UniqueIndex>, key: SortableKey },
    IndexDelete { index: Arc<UniqueIndex>, key: SortableKey, oid: Oid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavepointId(usize);

struct TranState {
    interrupted: Arc<AtomicBool>,
    query_in_progress: bool,
    undo: Vec<UndoOp>,
    participants: Vec<NodeId>,
}

pub struct TransactionService {
    states: DashMap<TranIndex, Mutex<TranState>>,
}

impl Default for TransactionService {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionService {
    pub fn new() -> Self {
        Self { states: DashMap::new() }
    }

    pub fn begin(&self, tran: TranIndex) {
        self.states.insert(
            tran,
            Mutex::new(TranState {
                interrupted: Arc::new(AtomicBool::new(false)),
                query_in_progress: false,
                undo: Vec::new(),
                participants: Vec::new(),
            }),
        );
    }

    pub fn interrupt_flag(&self, tran: TranIndex) -> Option<Arc<AtomicBool>> {
        self.states
            .get(&tran)
            .map(|s| Arc::clone(&s.lock().interrupted))
    }

    pub fn interrupt(&self, tran: TranIndex) {
        if let Some(state) = self.states.get(&tran) {
            state.lock().interrupted.store(true, AtomicOrdering::SeqCst);
        }
    }

    pub fn is_interrupted(&self, tran: TranIndex) -> bool {
        self.states
            .get(&tran)
            .map(|s| s.lock().interrupted.load(AtomicOrdering::SeqCst))
            .unwrap_or(false)
    }

    /// Queries mark themselves in progress so teardown defers to them.
    pub fn set_query_in_progress(&self, tran: TranIndex, in_progress: bool) {
        if let Some(state) = self.states.get(&tran) {
            state.lock().query_in_progress = in_progress;
        }
    }

    pub fn query_in_progress(&self, tran: TranIndex) -> bool {
        self.states
            .get(&tran)
            .map(|s| s.lock().query_in_progress)
            .unwrap_or(false)
    }

    pub fn register_participant(&self, tran: TranIndex, node: NodeId) {
        if let Some(state) = self.states.get(&tran) {
            let mut state = state.lock();
            if !state.participants.contains(&node) {
                state.participants.push(node);
            }
        }
    }

    pub fn participants(&self, tran: TranIndex) -> Vec<NodeId> {
        self.states
            .get(&tran)
            .map(|s| s.lock().participants.clone())
            .unwrap_or_default()
    }

    pub fn record_undo(&self, tran: TranIndex, op: UndoOp) {
        if let Some(state) = self.states.get(&tran) {
            state.lock().undo.push(op);
        }
    }

    pub fn savepoint(&self, tran: TranIndex) -> SavepointId {
        let len = self
            .states
            .get(&tran)
            .map(|s| s.lock().undo.len())
            .unwrap_or(0);
        SavepointId(len)
    }

    /// Pop undo records back to a savepoint and apply them against the
    /// heap.
    pub fn rollback_to(&self, tran: TranIndex, sp: SavepointId, heap: &HeapStore) -> Result<()> {
        let state = self
            .states
            .get(&tran)
            .ok_or_else(|| DbError::InvalidState(format!("no transaction {}", tran)))?;
        let mut state = state.lock();
        while state.undo.len() > sp.0 {
            let op = match state.undo.pop() {
                Some(op) => op,
                None => break,
            };
            match op {
                UndoOp::HeapInsert { class, oid } => {
                    let _ = heap.delete(class, oid);
                }
                UndoOp::HeapDelete { class, oid, row } => {
                    heap.restore(class, oid, row);
                }
                UndoOp::HeapUpdate { class, oid, old_row } => {
                    heap.update(class, oid, old_row)?;
                }
                UndoOp::IndexInsert { index, key } => {
                    index.remove_raw(&key);
                }
                UndoOp::IndexDelete { index, key, oid } => {
                    let _ = index.insert_raw(key, oid);
                }
            }
        }
        debug!(tran, "rolled back to savepoint");
        Ok(())
    }

    /// Success path: the statement's changes stay; its undo records remain
    /// part of the surrounding transaction scope.
    pub fn release_savepoint(&self, _tran: TranIndex, _sp: SavepointId) {}

    pub fn finish(&self, tran: TranIndex) {
        self.states.remove(&tran);
    }
}

// ============================================================================
// Method registry and the service bundle
// ============================================================================

/// Method scan callback: one output value per input row.
pub type MethodFn = dyn Fn(&[Value]) -> Result<Value> + Send + Sync;

pub struct MethodRegistry {
    methods: Mutex<HashMap<String, Arc<MethodFn>>>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self { methods: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self, name: &str, f: Arc<MethodFn>) {
        self.methods.lock().insert(name.to_string(), f);
    }

    pub fn get(&self, name: &str) -> Option<Arc<MethodFn>> {
        self.methods.lock().get(name).cloned()
    }
}

/// Everything the interpreter needs from the storage side.
pub struct StorageServices {
    pub catalog: Catalog,
    pub heap: HeapStore,
    pub indexes: Mutex<Vec<Arc<UniqueIndex>>>,
    pub locks: LockManager,
    pub tran: TransactionService,
    pub methods: MethodRegistry,
}

impl Default for StorageServices {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageServices {
    pub fn new() -> Self {
        Self {
            catalog: Catalog::new(),
            heap: HeapStore::new(),
            indexes: Mutex::new(Vec::new()),
            locks: LockManager::new(),
            tran: TransactionService::new(),
            methods: MethodRegistry::new(),
        }
    }

    pub fn add_index(&self, index: Arc<UniqueIndex>) {
        self.indexes.lock().push(index);
    }

    pub fn indexes_of(&self, class: Oid) -> Vec<Arc<UniqueIndex>> {
        self.indexes
            .lock()
            .iter()
            .filter(|i| i.class == class)
            .cloned()
            .collect()
    }

    pub fn index_by_name(&self, name: &str) -> Option<Arc<UniqueIndex>> {
        self.indexes.lock().iter().find(|i| i.name == name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(n: usize) -> Vec<AttrDef> {
        (0..n)
            .map(|i| AttrDef {
                id: i as u32,
                name: format!("a{}", i),
                domain: Domain::int(),
                not_null: false,
            })
            .collect()
    }

    #[test]
    fn test_catalog_define_and_repr_bump() {
        let catalog = Catalog::new();
        let oid = catalog.define_class("t", attrs(2), LOCAL_NODE_ID, None).unwrap();
        assert_eq!(catalog.repr_id(oid), Some(1));
        assert_eq!(catalog.bump_repr(oid).unwrap(), 2);
        assert!(catalog.is_local(oid));
        assert!(catalog.define_class("t", attrs(1), LOCAL_NODE_ID, None).is_err());
    }

    #[test]
    fn test_partition_routing() {
        let catalog = Catalog::new();
        let p1 = catalog.define_class("t_p1", attrs(2), LOCAL_NODE_ID, None).unwrap();
        let p2 = catalog.define_class("t_p2", attrs(2), LOCAL_NODE_ID, None).unwrap();
        let spec = PartitionSpec {
            key_attr: 0,
            partitions: vec![
                PartitionDef { class_oid: p1, upper_bound: Some(Value::Int(100)) },
                PartitionDef { class_oid: p2, upper_bound: None },
            ],
        };
        let root = catalog
            .define_class("t", attrs(2), LOCAL_NODE_ID, Some(spec))
            .unwrap();
        let meta = catalog.class(root).unwrap();
        assert_eq!(catalog.partition_for(&meta, &Value::Int(5)).unwrap(), p1);
        assert_eq!(catalog.partition_for(&meta, &Value::Int(100)).unwrap(), p2);
    }

    #[test]
    fn test_heap_crud() {
        let heap = HeapStore::new();
        let class = Oid::new(0, 1, 0);
        let oid = heap.insert(class, vec![Value::Int(1), Value::Str("x".into())]);
        assert_eq!(heap.row_count(class), 1);
        let old = heap
            .update(class, oid, vec![Value::Int(2), Value::Str("y".into())])
            .unwrap();
        assert!(matches!(old[0], Value::Int(1)));
        let removed = heap.delete(class, oid).unwrap();
        assert!(matches!(removed[0], Value::Int(2)));
        assert_eq!(heap.row_count(class), 0);
    }

    #[test]
    fn test_unique_index_duplicate_and_stats() {
        let class = Oid::new(0, 1, 0);
        let index = UniqueIndex::new("pk", class, vec![0]);
        let row_a = vec![Value::Int(1)];
        index.insert_key(index.key_of(&row_a), Oid::new(1, 1, 0)).unwrap();
        assert!(matches!(
            index.insert_key(index.key_of(&row_a), Oid::new(1, 2, 0)),
            Err(DbError::DuplicateKey(_))
        ));
        index.insert_key(SortableKey(vec![Value::Null]), Oid::new(1, 3, 0)).unwrap();
        let stats = index.stats();
        assert_eq!(stats, UniqueStats { nulls: 1, keys: 1, oids: 2 });
        assert_eq!(stats.nulls + stats.keys, stats.oids);
    }

    #[test]
    fn test_index_range_scan_ordered() {
        let class = Oid::new(0, 1, 0);
        let index = UniqueIndex::new("pk", class, vec![0]);
        for v in [5, 1, 9, 3] {
            index
                .insert_key(SortableKey(vec![Value::Int(v)]), Oid::new(1, v as u32, 0))
                .unwrap();
        }
        let low = SortableKey(vec![Value::Int(2)]);
        let high = SortableKey(vec![Value::Int(8)]);
        let hits: Vec<i32> = index
            .range(Some(&low), Some(&high))
            .into_iter()
            .map(|(k, _)| match k.0[0] {
                Value::Int(v) => v,
                _ => panic!(),
            })
            .collect();
        assert_eq!(hits, vec![3, 5]);
    }

    #[test]
    fn test_lock_instant_vs_timeout() {
        let locks = LockManager::new();
        let oid = Oid::new(1, 1, 0);
        let grant = locks
            .acquire(1, oid, LockMode::Exclusive, Some(Duration::from_millis(10)))
            .unwrap();
        assert!(grant.instant);
        assert!(matches!(
            locks.acquire(2, oid, LockMode::Exclusive, Some(Duration::from_millis(30))),
            Err(DbError::LockTimeout)
        ));
        locks.release(1, oid);
        let grant2 = locks
            .acquire(2, oid, LockMode::Exclusive, Some(Duration::from_millis(10)))
            .unwrap();
        assert!(grant2.instant);
    }

    #[test]
    fn test_lock_wait_then_grant() {
        let locks = Arc::new(LockManager::new());
        let oid = Oid::new(1, 2, 0);
        locks.acquire(1, oid, LockMode::Exclusive, None).unwrap();
        let locks2 = Arc::clone(&locks);
        let waiter = std::thread::spawn(move || {
            locks2.acquire(2, oid, LockMode::Exclusive, Some(Duration::from_secs(5)))
        });
        std::thread::sleep(Duration::from_millis(50));
        locks.release(1, oid);
        let grant = waiter.join().unwrap().unwrap();
        assert!(!grant.instant);
    }

    #[test]
    fn test_savepoint_rollback() {
        let services = StorageServices::new();
        let class = services
            .catalog
            .define_class("t", attrs(1), LOCAL_NODE_ID, None)
            .unwrap();
        services.tran.begin(7);

        let sp = services.tran.savepoint(7);
        let oid = services.heap.insert(class, vec![Value::Int(1)]);
        services.tran.record_undo(7, UndoOp::HeapInsert { class, oid });
        assert_eq!(services.heap.row_count(class), 1);

        services.tran.rollback_to(7, sp, &services.heap).unwrap();
        assert_eq!(services.heap.row_count(class), 0);
    }

    #[test]
    fn test_interrupt_flag() {
        let tran = TransactionService::new();
        tran.begin(3);
        assert!(!tran.is_interrupted(3));
        tran.interrupt(3);
        assert!(tran.is_interrupted(3));
    }

    #[test]
    fn test_two_phase_participants_dedup() {
        let tran = TransactionService::new();
        tran.begin(1);
        tran.register_participant(1, 5);
        tran.register_participant(1, 5);
        tran.register_participant(1, 6);
        assert_eq!(tran.participants(1), vec![5, 6]);
    }
}
