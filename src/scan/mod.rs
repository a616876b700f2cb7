// # Scan Drivers
//
// One cursor contract over six source kinds: heap-sequential, heap-indexed,
// class-attribute, list-file, set, and method. A scan advances block-wise
// (`next_block`) and tuple-wise within the block (`next_tuple`), binding
// each tuple's columns into the value-list slots and re-evaluating its
// predicate per tuple. Grouped mode batches qualification for a whole block
// when the source allows it; fixed mode is dropped whenever the node
// updates the class it scans or takes composite locks.

use crate::common::{NodeId, Oid};
use crate::error::{DbError, Result};
use crate::exec::regu::{eval_pred, eval_regu, EvalEnv, Tri};
use crate::exec::xasl::{AccessSpec, ScanSourceSpec};
use crate::runtime::list_file::{ListFile, ListScan, ListScanPos};
use crate::runtime::value::Value;
use crate::storage::{MethodFn, SortableKey, StorageServices, HEAP_PAGE_ROWS};
use std::sync::Arc;
use tracing::debug;

/// Cursor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Closed,
    Started,
    Suspended,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanResult {
    Success,
    End,
}

/// Saved cursor position for positional jumps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPos {
    List(ListScanPos),
    Rowset { block: usize, row: usize },
}

/// Fetches a non-local class into a local list file through the connection
/// layer.
pub trait RemoteClassFetcher: Send + Sync {
    fn fetch_class(&self, node: NodeId, class: Oid) -> Result<Arc<ListFile>>;
}

/// Everything a scan needs at open time
pub struct OpenContext<'a> {
    pub services: &'a StorageServices,
    /// Resolves `aptr_index` references to materialized sibling lists
    pub lists: &'a dyn Fn(usize) -> Option<Arc<ListFile>>,
    /// Current slot values, for correlated key ranges and set sources
    pub slots: &'a [Value],
    pub remote: Option<&'a dyn RemoteClassFetcher>,
    /// Class this node updates, if any; disables fixed mode on its scans
    pub updates_class: Option<Oid>,
    pub composite_locking: bool,
    /// This scan is the inner of an outer join
    pub inner_of_outer_join: bool,
}

enum Driver {
    /// Materialized (oid, row) pairs scanned in blocks
    Rowset {
        rows: Vec<(Option<Oid>, Vec<Value>)>,
        block: usize,
        row: usize,
        /// Whether `next_block` has positioned on a block yet
        entered: bool,
        /// Per-block qualification bitmap when grouped
        qualified: Option<Vec<bool>>,
    },
    List {
        scan: ListScan,
        started: bool,
    },
}

/// Runtime state of one open cursor
pub struct ScanId {
    pub status: ScanStatus,
    spec: AccessSpec,
    driver: Driver,
    /// Slot receiving the current row's oid, when the source has one
    oid_slot: Option<usize>,
}

impl ScanId {
    /// Open a cursor over an access spec. Grouped and fixed requests that
    /// the source cannot honor are dropped here.
    pub fn open(spec: &AccessSpec, ctx: &OpenContext) -> Result<ScanId> {
        let mut spec = spec.clone();

        // Fixed is illegal when the node updates the scanned class or
        // accumulates composite locks.
        if ctx.composite_locking {
            spec.fixed = false;
        }
        if let ScanSourceSpec::Heap { class_oid, .. } = &spec.source {
            if ctx.updates_class == Some(*class_oid) {
                spec.fixed = false;
            }
        }

        // Grouped legality
        let grouped_legal = match &spec.source {
            ScanSourceSpec::ClassAttr { .. } => false,
            ScanSourceSpec::Index { ranges, .. } => ranges.iter().all(|r| r.is_constant()),
            _ => true,
        } && !ctx.composite_locking
            && !ctx.inner_of_outer_join;
        if !grouped_legal {
            spec.grouped = false;
        }

        let driver = build_driver(&spec, ctx)?;
        debug!(grouped = spec.grouped, fixed = spec.fixed, "scan opened");
        Ok(ScanId {
            status: ScanStatus::Started,
            spec,
            driver,
            oid_slot: None,
        })
    }

    /// Bind the produced row's oid into a slot as well.
    pub fn with_oid_slot(mut self, slot: usize) -> Self {
        self.oid_slot = Some(slot);
        self
    }

    /// Advance to the next scan block. Must be called before the first
    /// `next_tuple`.
    pub fn next_block(&mut self, slots: &[Value]) -> Result<ScanResult> {
        if self.status == ScanStatus::Closed {
            return Err(DbError::InvalidState("scan is closed".to_string()));
        }
        match &mut self.driver {
            Driver::Rowset { rows, block, row, entered, qualified } => {
                let next = if *entered { *block + 1 } else { 0 };
                if next * HEAP_PAGE_ROWS >= rows.len() {
                    self.status = ScanStatus::Ended;
                    return Ok(ScanResult::End);
                }
                *block = next;
                *row = 0;
                *entered = true;

                // Grouped: qualify the whole block up front
                *qualified = if self.spec.grouped {
                    let start = *block * HEAP_PAGE_ROWS;
                    let end = ((*block + 1) * HEAP_PAGE_ROWS).min(rows.len());
                    let mut bits = Vec::with_capacity(end - start);
                    for (_, values) in &rows[start..end] {
                        bits.push(qualifies(&self.spec, values, slots)?);
                    }
                    Some(bits)
                } else {
                    None
                };
                self.status = ScanStatus::Started;
                Ok(ScanResult::Success)
            }
            Driver::List { started, .. } => {
                if *started {
                    self.status = ScanStatus::Ended;
                    Ok(ScanResult::End)
                } else {
                    *started = true;
                    Ok(ScanResult::Success)
                }
            }
        }
    }

    /// Produce the next qualifying tuple of the current block, binding its
    /// columns into `slots`.
    pub fn next_tuple(&mut self, slots: &mut [Value]) -> Result<ScanResult> {
        if self.status == ScanStatus::Closed {
            return Err(DbError::InvalidState("scan is closed".to_string()));
        }
        loop {
            let row = match &mut self.driver {
                Driver::Rowset { rows, block, row, entered, qualified } => {
                    if !*entered {
                        return Ok(ScanResult::End);
                    }
                    let start = *block * HEAP_PAGE_ROWS;
                    let end = ((*block + 1) * HEAP_PAGE_ROWS).min(rows.len());
                    if start + *row >= end {
                        self.status = ScanStatus::Suspended;
                        return Ok(ScanResult::End);
                    }
                    let idx = start + *row;
                    let pre_qualified = qualified.as_ref().map(|bits| bits[*row]);
                    *row += 1;
                    let (oid, values) = &rows[idx];
                    Some((*oid, values.clone(), pre_qualified))
                }
                Driver::List { scan, .. } => match scan.next_tuple()? {
                    Some(values) => Some((None, values, None)),
                    None => {
                        self.status = ScanStatus::Ended;
                        return Ok(ScanResult::End);
                    }
                },
            };

            let (oid, values, pre_qualified) = match row {
                Some(r) => r,
                None => return Ok(ScanResult::End),
            };

            let ok = match pre_qualified {
                Some(bit) => bit,
                None => qualifies(&self.spec, &values, slots)?,
            };
            if !ok {
                continue;
            }

            bind_row(&self.spec.bind_slots, &values, slots)?;
            if let (Some(slot), Some(oid)) = (self.oid_slot, oid) {
                if let Some(target) = slots.get_mut(slot) {
                    *target = Value::Oid(oid);
                }
            }
            self.status = ScanStatus::Started;
            return Ok(ScanResult::Success);
        }
    }

    /// Restart the current block from its first tuple.
    pub fn reset_block(&mut self) {
        if let Driver::Rowset { row, .. } = &mut self.driver {
            *row = 0;
        }
    }

    /// Restart the whole scan.
    pub fn reset(&mut self) {
        match &mut self.driver {
            Driver::Rowset { block, row, entered, qualified, .. } => {
                *block = 0;
                *row = 0;
                *entered = false;
                *qualified = None;
            }
            Driver::List { scan, started } => {
                scan.jump_to(ListScanPos { index: 0 });
                *started = false;
            }
        }
        self.status = ScanStatus::Started;
    }

    pub fn position(&self) -> ScanPos {
        match &self.driver {
            Driver::List { scan, .. } => ScanPos::List(scan.position()),
            Driver::Rowset { block, row, .. } => ScanPos::Rowset { block: *block, row: *row },
        }
    }

    pub fn jump_to_position(&mut self, pos: ScanPos) -> Result<()> {
        match (&mut self.driver, pos) {
            (Driver::List { scan, .. }, ScanPos::List(p)) => {
                scan.jump_to(p);
                Ok(())
            }
            (Driver::Rowset { block, row, entered, qualified, .. }, ScanPos::Rowset { block: b, row: r }) => {
                *block = b;
                *row = r;
                *entered = true;
                *qualified = None;
                Ok(())
            }
            _ => Err(DbError::InvalidState("position kind does not match scan".to_string())),
        }
    }

    pub fn close(&mut self) {
        self.status = ScanStatus::Closed;
    }

    pub fn is_grouped(&self) -> bool {
        self.spec.grouped
    }

    pub fn is_fixed(&self) -> bool {
        self.spec.fixed
    }
}

fn qualifies(spec: &AccessSpec, values: &[Value], slots: &[Value]) -> Result<bool> {
    match &spec.where_pred {
        None => Ok(true),
        Some(pred) => {
            // The predicate sees the row as if already bound
            let mut shadow = slots.to_vec();
            bind_row(&spec.bind_slots, values, &mut shadow)?;
            let env = EvalEnv::new(&shadow);
            Ok(eval_pred(pred, &env)? == Tri::True)
        }
    }
}

fn bind_row(bind_slots: &[usize], values: &[Value], slots: &mut [Value]) -> Result<()> {
    for (i, slot) in bind_slots.iter().enumerate() {
        let value = values.get(i).cloned().unwrap_or(Value::Null);
        let target = slots.get_mut(*slot).ok_or_else(|| {
            DbError::Internal(format!("value list has no slot {}", slot))
        })?;
        *target = value;
    }
    Ok(())
}

fn build_driver(spec: &AccessSpec, ctx: &OpenContext) -> Result<Driver> {
    match &spec.source {
        ScanSourceSpec::Heap { class_oid, node_id } => {
            if *node_id != crate::common::LOCAL_NODE_ID {
                // Non-local class: stream through the connection layer into
                // a local list file, then scan that.
                let remote = ctx.remote.ok_or_else(|| {
                    DbError::Network("remote class scan without a fetcher".to_string())
                })?;
                let list = remote.fetch_class(*node_id, *class_oid)?;
                return Ok(Driver::List { scan: list.open_scan(), started: false });
            }
            let rows = ctx
                .services
                .heap
                .scan_all(*class_oid)
                .into_iter()
                .map(|(oid, values)| (Some(oid), values))
                .collect();
            Ok(rowset(rows))
        }
        ScanSourceSpec::Index { index_name, class_oid, ranges } => {
            let index = ctx
                .services
                .index_by_name(index_name)
                .ok_or_else(|| DbError::NotFound(format!("index '{}'", index_name)))?;
            let env = EvalEnv::new(ctx.slots);
            let mut hits: Vec<(Oid, SortableKey)> = Vec::new();
            for range in ranges {
                let low = range
                    .low
                    .as_ref()
                    .map(|r| eval_regu(r, &env))
                    .transpose()?
                    .map(|v| SortableKey(vec![v]));
                let high = range
                    .high
                    .as_ref()
                    .map(|r| eval_regu(r, &env))
                    .transpose()?
                    .map(|v| SortableKey(vec![v]));
                for (key, oid) in index.range(low.as_ref(), high.as_ref()) {
                    hits.push((oid, key));
                }
            }
            if spec.iscan_oid_order {
                hits.sort_by_key(|(oid, _)| *oid);
            }
            let mut rows = Vec::with_capacity(hits.len());
            for (oid, _) in hits {
                if let Some(values) = ctx.services.heap.fetch(*class_oid, oid) {
                    rows.push((Some(oid), values));
                }
            }
            Ok(rowset(rows))
        }
        ScanSourceSpec::ClassAttr { class_oid } => {
            let meta = ctx
                .services
                .catalog
                .class(*class_oid)
                .ok_or_else(|| DbError::Catalog(format!("no class {}", class_oid)))?;
            let rows = meta
                .attrs
                .iter()
                .map(|attr| {
                    (
                        None,
                        vec![
                            Value::Int(attr.id as i32),
                            Value::Str(attr.name.clone()),
                            Value::Int(attr.not_null as i32),
                        ],
                    )
                })
                .collect();
            Ok(rowset(rows))
        }
        ScanSourceSpec::List { aptr_index } => {
            let list = (ctx.lists)(*aptr_index).ok_or_else(|| {
                DbError::Internal(format!("no materialized list for child {}", aptr_index))
            })?;
            Ok(Driver::List { scan: list.open_scan(), started: false })
        }
        ScanSourceSpec::Set { source } => {
            let env = EvalEnv::new(ctx.slots);
            let value = eval_regu(source, &env)?;
            let items = match value {
                Value::Set(items) | Value::Multiset(items) | Value::Sequence(items) => items,
                Value::Null => Vec::new(),
                other => {
                    return Err(DbError::Execution(format!(
                        "set scan over non-collection {:?}",
                        other
                    )))
                }
            };
            Ok(rowset(items.into_iter().map(|v| (None, vec![v])).collect()))
        }
        ScanSourceSpec::Method { aptr_index, method_name } => {
            let list = (ctx.lists)(*aptr_index).ok_or_else(|| {
                DbError::Internal(format!("no materialized list for child {}", aptr_index))
            })?;
            let method: Arc<MethodFn> =
                ctx.services.methods.get(method_name).ok_or_else(|| {
                    DbError::NotFound(format!("method '{}'", method_name))
                })?;
            // Materialize input rows with the method result appended
            let mut rows = Vec::new();
            let mut scan = list.open_scan();
            while let Some(row) = scan.next_tuple()? {
                let result = method(&row)?;
                let mut out = row;
                out.push(result);
                rows.push((None, out));
            }
            Ok(rowset(rows))
        }
    }
}

fn rowset(rows: Vec<(Option<Oid>, Vec<Value>)>) -> Driver {
    Driver::Rowset {
        rows,
        block: 0,
        row: 0,
        entered: false,
        qualified: None,
    }
}
