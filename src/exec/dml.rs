// # Update / Delete / Insert Procedures
//
// Each procedure runs over the rows its source sub-plan produced, under a
// statement savepoint opened at entry: any failure rolls the statement
// back atomically. Unique-index maintenance goes through the raw entry
// operations with per-index statistic deltas reflected into each root
// once the statement succeeds; multi-row deletes past the threshold batch
// that reflection. Partitioned classes re-evaluate the partition key per
// row, moving rows across partitions with a delete-insert pair.

use crate::common::{Oid, TranIndex};
use crate::error::{DbError, Result};
use crate::exec::xasl::{DeleteSpec, InsertSpec, UpdateSpec};
use crate::runtime::list_file::ListFile;
use crate::runtime::value::Value;
use crate::storage::{
    ClassMeta, LockMode, SortableKey, StorageServices, UndoOp, UniqueIndex, UniqueStats,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Row count above which a delete batches its unique-stat reflection
pub const UNIQUE_STAT_REFLECT_THRESHOLD: usize = 20;

pub struct DmlContext<'a> {
    pub services: &'a StorageServices,
    pub tran: TranIndex,
    pub lock_timeout: Option<Duration>,
    pub interrupted: Option<&'a AtomicBool>,
}

impl<'a> DmlContext<'a> {
    fn check_interrupt(&self) -> Result<()> {
        if let Some(flag) = self.interrupted {
            if flag.load(Ordering::SeqCst) {
                return Err(DbError::Interrupted);
            }
        }
        Ok(())
    }
}

/// Cached per-class lookup state, reused across consecutive same-class
/// rows.
struct ClassCache {
    meta: ClassMeta,
    indexes: Vec<Arc<UniqueIndex>>,
}

struct ClassCacheSlot {
    current: Option<(Oid, ClassCache)>,
}

impl ClassCacheSlot {
    fn new() -> Self {
        Self { current: None }
    }

    fn get(&mut self, services: &StorageServices, class: Oid) -> Result<&ClassCache> {
        let refresh = match &self.current {
            Some((cached, _)) => *cached != class,
            None => true,
        };
        if refresh {
            let meta = services
                .catalog
                .class(class)
                .ok_or_else(|| DbError::Catalog(format!("no class {}", class)))?;
            let indexes = services.indexes_of(class);
            self.current = Some((class, ClassCache { meta, indexes }));
        }
        match &self.current {
            Some((_, cache)) => Ok(cache),
            None => Err(DbError::Internal("class cache not primed".to_string())),
        }
    }
}

#[derive(Default)]
struct StatDeltas {
    by_index: HashMap<String, UniqueStats>,
}

impl StatDeltas {
    fn removed(&mut self, index: &UniqueIndex, key: &SortableKey) {
        let delta = self.by_index.entry(index.name.clone()).or_default();
        if key.has_null() {
            delta.nulls -= 1;
        } else {
            delta.keys -= 1;
        }
        delta.oids -= 1;
    }

    fn inserted(&mut self, index: &UniqueIndex, key: &SortableKey) {
        let delta = self.by_index.entry(index.name.clone()).or_default();
        if key.has_null() {
            delta.nulls += 1;
        } else {
            delta.keys += 1;
        }
        delta.oids += 1;
    }

    fn reflect(self, services: &StorageServices) {
        for (name, delta) in self.by_index {
            if let Some(index) = services.index_by_name(&name) {
                index.reflect_delta(delta);
            }
        }
    }
}

fn oid_of(value: &Value) -> Result<Oid> {
    match value {
        Value::Oid(oid) => Ok(*oid),
        other => Err(DbError::Execution(format!("expected an oid, got {:?}", other))),
    }
}

fn check_not_null(meta: &ClassMeta, row: &[Value]) -> Result<()> {
    for attr in &meta.attrs {
        if attr.not_null {
            if let Some(Value::Null) | None = row.get(attr.id as usize) {
                return Err(DbError::NotNullViolation(attr.name.clone()));
            }
        }
    }
    Ok(())
}

/// Route a row of a partitioned root class to its partition; a plain class
/// routes to itself.
fn route_partition(services: &StorageServices, root: &ClassMeta, row: &[Value]) -> Result<Oid> {
    match &root.partition {
        None => Ok(root.oid),
        Some(spec) => {
            let key = row.get(spec.key_attr as usize).cloned().unwrap_or(Value::Null);
            services.catalog.partition_for(root, &key)
        }
    }
}

fn remove_from_indexes(
    indexes: &[Arc<UniqueIndex>],
    row: &[Value],
    oid: Oid,
    deltas: &mut StatDeltas,
    ctx: &DmlContext,
) {
    for index in indexes {
        let key = index.key_of(row);
        if index.remove_raw(&key) {
            deltas.removed(index, &key);
            ctx.services.tran.record_undo(
                ctx.tran,
                UndoOp::IndexDelete { index: Arc::clone(index), key, oid },
            );
        } else if key.has_null() {
            deltas.removed(index, &key);
        }
    }
}

fn add_to_indexes(
    indexes: &[Arc<UniqueIndex>],
    row: &[Value],
    oid: Oid,
    deltas: &mut StatDeltas,
    ctx: &DmlContext,
) -> Result<()> {
    for index in indexes {
        let key = index.key_of(row);
        index.insert_raw(key.clone(), oid)?;
        deltas.inserted(index, &key);
        ctx.services.tran.record_undo(
            ctx.tran,
            UndoOp::IndexInsert { index: Arc::clone(index), key },
        );
    }
    Ok(())
}

/// UPDATE: the source rows are (instance oid, class oid, new values...).
/// Every touched row counts as affected whether or not its stored image
/// changed.
pub fn execute_update(
    spec: &UpdateSpec,
    source: &Arc<ListFile>,
    ctx: &DmlContext,
) -> Result<u64> {
    let sp = ctx.services.tran.savepoint(ctx.tran);
    let result = update_rows(spec, source, ctx);
    match result {
        Ok(affected) => {
            ctx.services.tran.release_savepoint(ctx.tran, sp);
            Ok(affected)
        }
        Err(e) => {
            ctx.services.tran.rollback_to(ctx.tran, sp, &ctx.services.heap)?;
            Err(e)
        }
    }
}

fn update_rows(spec: &UpdateSpec, source: &Arc<ListFile>, ctx: &DmlContext) -> Result<u64> {
    let root = ctx
        .services
        .catalog
        .class(spec.class_oid)
        .ok_or_else(|| DbError::Catalog(format!("no class {}", spec.class_oid)))?;
    let mut cache = ClassCacheSlot::new();
    let mut deltas = StatDeltas::default();
    let mut affected = 0u64;

    let mut scan = source.open_scan();
    while let Some(row) = scan.next_tuple()? {
        ctx.check_interrupt()?;
        if row.len() < 2 + spec.attr_ids.len() {
            return Err(DbError::Execution("short update source row".to_string()));
        }
        let oid = oid_of(&row[0])?;
        let class_oid = oid_of(&row[1])?;
        ctx.services
            .locks
            .acquire(ctx.tran, oid, LockMode::Exclusive, ctx.lock_timeout)?;

        let entry = cache.get(ctx.services, class_oid)?;
        let old_row = ctx
            .services
            .heap
            .fetch(class_oid, oid)
            .ok_or_else(|| DbError::NotFound(format!("object {}", oid)))?;

        let mut new_row = old_row.clone();
        for (i, attr) in spec.attr_ids.iter().enumerate() {
            let value = row[2 + i].clone();
            let slot = new_row.get_mut(*attr as usize).ok_or_else(|| {
                DbError::Execution(format!("class has no attribute {}", attr))
            })?;
            *slot = value;
        }
        check_not_null(&entry.meta, &new_row)?;

        let target = route_partition(ctx.services, &root, &new_row)?;
        if target != class_oid {
            // The row moves to a different partition: delete here, insert
            // there.
            let indexes_here = entry.indexes.clone();
            let removed = ctx.services.heap.delete(class_oid, oid)?;
            ctx.services.tran.record_undo(
                ctx.tran,
                UndoOp::HeapDelete { class: class_oid, oid, row: removed.clone() },
            );
            remove_from_indexes(&indexes_here, &removed, oid, &mut deltas, ctx);

            let new_oid = ctx.services.heap.insert(target, new_row.clone());
            ctx.services
                .tran
                .record_undo(ctx.tran, UndoOp::HeapInsert { class: target, oid: new_oid });
            let target_entry = cache.get(ctx.services, target)?;
            let target_indexes = target_entry.indexes.clone();
            add_to_indexes(&target_indexes, &new_row, new_oid, &mut deltas, ctx)?;
            debug!(%oid, from = %class_oid, to = %target, "row moved across partitions");
        } else {
            let indexes = entry.indexes.clone();
            let replaced = ctx.services.heap.update(class_oid, oid, new_row.clone())?;
            ctx.services.tran.record_undo(
                ctx.tran,
                UndoOp::HeapUpdate { class: class_oid, oid, old_row: replaced.clone() },
            );
            for index in &indexes {
                let old_key = index.key_of(&replaced);
                let new_key = index.key_of(&new_row);
                if old_key != new_key {
                    if index.remove_raw(&old_key) || old_key.has_null() {
                        deltas.removed(index, &old_key);
                        ctx.services.tran.record_undo(
                            ctx.tran,
                            UndoOp::IndexDelete {
                                index: Arc::clone(index),
                                key: old_key,
                                oid,
                            },
                        );
                    }
                    index.insert_raw(new_key.clone(), oid)?;
                    deltas.inserted(index, &new_key);
                    ctx.services.tran.record_undo(
                        ctx.tran,
                        UndoOp::IndexInsert { index: Arc::clone(index), key: new_key },
                    );
                }
            }
        }
        affected += 1;
    }

    deltas.reflect(ctx.services);
    Ok(affected)
}

/// DELETE: source rows are (instance oid, class oid).
pub fn execute_delete(
    spec: &DeleteSpec,
    source: &Arc<ListFile>,
    ctx: &DmlContext,
) -> Result<u64> {
    let sp = ctx.services.tran.savepoint(ctx.tran);
    let result = delete_rows(spec, source, ctx);
    match result {
        Ok(affected) => {
            ctx.services.tran.release_savepoint(ctx.tran, sp);
            Ok(affected)
        }
        Err(e) => {
            ctx.services.tran.rollback_to(ctx.tran, sp, &ctx.services.heap)?;
            Err(e)
        }
    }
}

fn delete_rows(_spec: &DeleteSpec, source: &Arc<ListFile>, ctx: &DmlContext) -> Result<u64> {
    let total = source.tuple_count();
    let batch = total > UNIQUE_STAT_REFLECT_THRESHOLD;
    let mut cache = ClassCacheSlot::new();
    let mut deltas = StatDeltas::default();
    let mut affected = 0u64;

    let mut scan = source.open_scan();
    while let Some(row) = scan.next_tuple()? {
        ctx.check_interrupt()?;
        if row.len() < 2 {
            return Err(DbError::Execution("short delete source row".to_string()));
        }
        let oid = oid_of(&row[0])?;
        let class_oid = oid_of(&row[1])?;
        ctx.services
            .locks
            .acquire(ctx.tran, oid, LockMode::Exclusive, ctx.lock_timeout)?;

        let entry = cache.get(ctx.services, class_oid)?;
        let indexes = entry.indexes.clone();
        let removed = ctx.services.heap.delete(class_oid, oid)?;
        ctx.services.tran.record_undo(
            ctx.tran,
            UndoOp::HeapDelete { class: class_oid, oid, row: removed.clone() },
        );

        if batch {
            remove_from_indexes(&indexes, &removed, oid, &mut deltas, ctx);
        } else {
            // Below the threshold each row reflects immediately
            let mut row_deltas = StatDeltas::default();
            remove_from_indexes(&indexes, &removed, oid, &mut row_deltas, ctx);
            row_deltas.reflect(ctx.services);
        }
        affected += 1;
    }

    if batch {
        deltas.reflect(ctx.services);
    }
    Ok(affected)
}

/// How the interpreter runs the dependent ON DUPLICATE KEY UPDATE plan:
/// the duplicate's oid is handed over, the closure binds it into the
/// reserved slot and executes the sub-plan.
pub type DupUpdateFn<'a> = dyn FnMut(Oid) -> Result<u64> + 'a;

/// INSERT: rows are full attribute tuples for the target class.
pub fn execute_insert(
    spec: &InsertSpec,
    rows: Vec<Vec<Value>>,
    ctx: &DmlContext,
    dup_update: Option<&mut DupUpdateFn>,
) -> Result<u64> {
    let sp = ctx.services.tran.savepoint(ctx.tran);
    let result = insert_rows(spec, rows, ctx, dup_update);
    match result {
        Ok(affected) => {
            ctx.services.tran.release_savepoint(ctx.tran, sp);
            Ok(affected)
        }
        Err(e) => {
            ctx.services.tran.rollback_to(ctx.tran, sp, &ctx.services.heap)?;
            Err(e)
        }
    }
}

fn insert_rows(
    spec: &InsertSpec,
    rows: Vec<Vec<Value>>,
    ctx: &DmlContext,
    mut dup_update: Option<&mut DupUpdateFn>,
) -> Result<u64> {
    let root = ctx
        .services
        .catalog
        .class(spec.class_oid)
        .ok_or_else(|| DbError::Catalog(format!("no class {}", spec.class_oid)))?;
    let mut cache = ClassCacheSlot::new();
    let mut deltas = StatDeltas::default();
    let mut affected = 0u64;

    'rows: for row in rows {
        ctx.check_interrupt()?;
        check_not_null(&root, &row)?;
        for attr in &spec.not_null_attrs {
            if row.get(*attr as usize).map(|v| v.is_null()).unwrap_or(true) {
                let name = root
                    .attrs
                    .get(*attr as usize)
                    .map(|a| a.name.clone())
                    .unwrap_or_else(|| attr.to_string());
                return Err(DbError::NotNullViolation(name));
            }
        }

        let target = route_partition(ctx.services, &root, &row)?;
        let entry = cache.get(ctx.services, target)?;
        let indexes = entry.indexes.clone();

        if spec.replace {
            // Probe each unique key; an existing holder is deleted under
            // an exclusive lock taken after the probe.
            for index in &indexes {
                let key = index.key_of(&row);
                if let Some(existing) = index.probe(&key) {
                    ctx.services.locks.acquire(
                        ctx.tran,
                        existing,
                        LockMode::Exclusive,
                        ctx.lock_timeout,
                    )?;
                    let removed = ctx.services.heap.delete(target, existing)?;
                    ctx.services.tran.record_undo(
                        ctx.tran,
                        UndoOp::HeapDelete { class: target, oid: existing, row: removed.clone() },
                    );
                    remove_from_indexes(&indexes, &removed, existing, &mut deltas, ctx);
                }
            }
        } else if let Some(dup_fn) = dup_update.as_mut() {
            for index in &indexes {
                let key = index.key_of(&row);
                if let Some(existing) = index.probe(&key) {
                    // Duplicate found: run the dependent update instead of
                    // inserting this row
                    affected += dup_fn(existing)?;
                    continue 'rows;
                }
            }
        }

        let oid = ctx.services.heap.insert(target, row.clone());
        ctx.services
            .tran
            .record_undo(ctx.tran, UndoOp::HeapInsert { class: target, oid });
        add_to_indexes(&indexes, &row, oid, &mut deltas, ctx)?;
        affected += 1;
    }

    deltas.reflect(ctx.services);
    Ok(affected)
}
