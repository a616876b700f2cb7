// # Plan Interpreter
//
// Structured recursion over the plan tree. Each build node allocates its
// output list, drives its access specs block-by-block, pushes every
// qualifying tuple through the path-expression fetches, correlated
// subqueries, join and where predicates, the nested-loop spine, and the
// instance-number gate, then appends through the output pointer list.
// Group-by, order-by, and the hierarchy builder run as passes over the
// materialized lists. DML kinds hand their source lists to the update,
// delete, and insert procedures.

use crate::common::{Oid, QueryId, TranIndex};
use crate::error::{DbError, Result};
use crate::exec::connect_by::{execute_connect_by, ConnectByNode};
use crate::exec::dml::{self, DmlContext};
use crate::exec::eval::{AggAcc, InstnumSignal, InstnumState};
use crate::exec::group_by::execute_group_by;
use crate::exec::order_by::execute_order_by;
use crate::exec::regu::{eval_pred, eval_regu, EvalEnv, Tri};
use crate::exec::xasl::{
    FetchKind, FetchSpec, NodeStatus, XaslKind, XaslNode, XaslPlan,
};
use crate::runtime::list_file::{ListFile, ListFlags, SetOpKind};
use crate::runtime::merge_join::merge_join;
use crate::runtime::sort::{ListSorter, SinkPut, SortConfig, SortKey, SortKeyInfo, SortPayloadKind};
use crate::runtime::value::{arith_add, sort_compare, Value};
use crate::scan::{OpenContext, RemoteClassFetcher, ScanId, ScanResult};
use crate::stats::{StatBlock, StatKind};
use crate::storage::{LockMode, StorageServices, UndoOp};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Tunables for one execution
#[derive(Clone)]
pub struct ExecOptions {
    pub sort_config: SortConfig,
    pub lock_timeout: Option<Duration>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            sort_config: SortConfig::default(),
            lock_timeout: Some(Duration::from_secs(10)),
        }
    }
}

struct NodeState {
    status: NodeStatus,
    out_list: Option<Arc<ListFile>>,
}

impl NodeState {
    fn cleared() -> Self {
        Self { status: NodeStatus::Cleared, out_list: None }
    }
}

/// Per-execution state: the value-list arena, node statuses, and the
/// collaborator handles.
pub struct ExecContext<'a> {
    pub services: &'a StorageServices,
    pub stats: Option<Arc<StatBlock>>,
    pub remote: Option<&'a dyn RemoteClassFetcher>,
    pub query_id: QueryId,
    pub tran_index: TranIndex,
    pub options: ExecOptions,
    slots: Vec<Value>,
    params: Vec<Value>,
    node_states: HashMap<usize, NodeState>,
    sorter: ListSorter,
    interrupted: Option<Arc<AtomicBool>>,
    /// Class the enclosing UPDATE/DELETE targets; its source scans must
    /// not pin pages
    updates_class: Option<Oid>,
}

impl<'a> ExecContext<'a> {
    pub fn new(services: &'a StorageServices, query_id: QueryId, tran_index: TranIndex) -> Self {
        let options = ExecOptions::default();
        let sorter = ListSorter::new(options.sort_config.clone());
        Self {
            services,
            stats: None,
            remote: None,
            query_id,
            tran_index,
            options,
            slots: Vec::new(),
            params: Vec::new(),
            node_states: HashMap::new(),
            sorter,
            interrupted: None,
            updates_class: None,
        }
    }

    pub fn with_stats(mut self, stats: Arc<StatBlock>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn with_remote(mut self, remote: &'a dyn RemoteClassFetcher) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_options(mut self, options: ExecOptions) -> Self {
        self.sorter = ListSorter::new(options.sort_config.clone());
        self.options = options;
        self
    }

    pub fn node_status(&self, id: usize) -> NodeStatus {
        self.node_states
            .get(&id)
            .map(|s| s.status)
            .unwrap_or(NodeStatus::Cleared)
    }

    fn bump(&self, kind: StatKind) {
        if let Some(stats) = &self.stats {
            stats.increment(kind);
        }
    }

    fn check_interrupt(&self) -> Result<()> {
        if let Some(flag) = &self.interrupted {
            if flag.load(AtomicOrdering::SeqCst) {
                return Err(DbError::Interrupted);
            }
        }
        Ok(())
    }

    fn out_list_of(&self, id: usize) -> Option<Arc<ListFile>> {
        self.node_states.get(&id).and_then(|s| s.out_list.clone())
    }

    fn state_mut(&mut self, id: usize) -> &mut NodeState {
        self.node_states.entry(id).or_insert_with(NodeState::cleared)
    }
}

/// Execute a plan tree, producing the query's result list.
pub fn execute_plan(plan: &XaslPlan, ctx: &mut ExecContext) -> Result<Arc<ListFile>> {
    ctx.slots = vec![Value::Null; plan.slot_count];
    for (i, slot) in plan.param_slots.iter().enumerate() {
        let value = ctx.params.get(i).cloned().unwrap_or(Value::Null);
        if let Some(target) = ctx.slots.get_mut(*slot) {
            *target = value;
        }
    }
    ctx.node_states.clear();
    ctx.interrupted = ctx.services.tran.interrupt_flag(ctx.tran_index);

    // Queries in flight must not have their plan torn down under them
    ctx.services.tran.set_query_in_progress(ctx.tran_index, true);
    let result = run_node(&plan.root, ctx);
    ctx.services.tran.set_query_in_progress(ctx.tran_index, false);

    if result.is_ok() {
        match &plan.root.kind {
            XaslKind::Update(_) => ctx.bump(StatKind::QueryUpdates),
            XaslKind::Delete(_) => ctx.bump(StatKind::QueryDeletes),
            XaslKind::Insert(_) => ctx.bump(StatKind::QueryInserts),
            _ => ctx.bump(StatKind::QuerySelects),
        }
    }
    result
}

fn run_node(node: &XaslNode, ctx: &mut ExecContext) -> Result<Arc<ListFile>> {
    ctx.state_mut(node.id).status = NodeStatus::Running;

    // While a DML node runs, its source scans must know which class the
    // statement updates so they drop fixed-page mode on it.
    let saved_updates_class = ctx.updates_class;
    match &node.kind {
        XaslKind::Update(spec) => ctx.updates_class = Some(spec.class_oid),
        XaslKind::Delete(spec) => ctx.updates_class = Some(spec.class_oid),
        _ => {}
    }

    let result = run_node_inner(node, ctx);
    ctx.updates_class = saved_updates_class;
    match &result {
        Ok(list) => {
            let state = ctx.state_mut(node.id);
            state.status = NodeStatus::Success;
            state.out_list = Some(Arc::clone(list));
        }
        Err(e) => {
            // A failed node's output is discarded
            let state = ctx.state_mut(node.id);
            state.status = NodeStatus::Failure;
            state.out_list = None;
            debug!(node = node.id, error = %e, "plan node failed");
        }
    }
    result
}

fn run_node_inner(node: &XaslNode, ctx: &mut ExecContext) -> Result<Arc<ListFile>> {
    ctx.check_interrupt()?;

    // Uncorrelated inputs run first
    for child in &node.aptr_list {
        run_node(child, ctx)?;
    }

    match &node.kind {
        XaslKind::BuildList | XaslKind::BuildValue { .. } => run_build(node, ctx),
        XaslKind::Union { left, right } => {
            run_set_op(node, SetOpKind::Union, *left, *right, ctx)
        }
        XaslKind::Difference { left, right } => {
            run_set_op(node, SetOpKind::Difference, *left, *right, ctx)
        }
        XaslKind::Intersect { left, right } => {
            run_set_op(node, SetOpKind::Intersect, *left, *right, ctx)
        }
        XaslKind::MergeList { left, right, keys, join } => {
            ctx.bump(StatKind::QueryJoins);
            let left_list = child_list(node, *left, ctx)?;
            let right_list = child_list(node, *right, ctx)?;
            let flags = ListFlags {
                distinct: node.distinct,
                final_result: node.is_final,
                set_op: None,
            };
            let out = merge_join(&left_list, &right_list, keys, *join, ctx.query_id, flags)?;
            finish_passes(node, out, ctx)
        }
        XaslKind::Update(spec) => {
            let source = child_list(node, 0, ctx)?;
            let dml_ctx = dml_context(ctx);
            let affected = dml::execute_update(spec, &source, &dml_ctx)?;
            ctx.bump(StatKind::QueryUpdates);
            affected_list(ctx, affected)
        }
        XaslKind::Delete(spec) => {
            let source = child_list(node, 0, ctx)?;
            let dml_ctx = dml_context(ctx);
            let affected = dml::execute_delete(spec, &source, &dml_ctx)?;
            ctx.bump(StatKind::QueryDeletes);
            affected_list(ctx, affected)
        }
        XaslKind::Insert(spec) => {
            let rows = match &spec.values {
                Some(exprs) => {
                    let env = EvalEnv::new(&ctx.slots);
                    vec![exprs
                        .iter()
                        .map(|e| eval_regu(e, &env))
                        .collect::<Result<Vec<_>>>()?]
                }
                None => {
                    let source = child_list(node, 0, ctx)?;
                    let mut scan = source.open_scan();
                    let mut rows = Vec::new();
                    while let Some(row) = scan.next_tuple()? {
                        rows.push(row);
                    }
                    rows
                }
            };

            let affected = if let (Some(dep), Some(dup_slot)) =
                (&spec.on_dup_update, spec.dup_oid_slot)
            {
                // The procedure reaches storage through plain shared
                // handles, so the closure may re-enter the interpreter
                // from inside the row loop. The interrupt flag is cloned
                // out so the context does not hold a borrow of `ctx`.
                let interrupt_flag = ctx.interrupted.clone();
                let dml_ctx = DmlContext {
                    services: ctx.services,
                    tran: ctx.tran_index,
                    lock_timeout: ctx.options.lock_timeout,
                    interrupted: interrupt_flag.as_deref(),
                };
                let mut dup = |oid: Oid| -> Result<u64> {
                    if let Some(target) = ctx.slots.get_mut(dup_slot) {
                        *target = Value::Oid(oid);
                    }
                    let list = run_node(dep, ctx)?;
                    affected_of(&list)
                };
                dml::execute_insert(spec, rows, &dml_ctx, Some(&mut dup))?
            } else {
                let dml_ctx = dml_context(ctx);
                dml::execute_insert(spec, rows, &dml_ctx, None)?
            };
            ctx.bump(StatKind::QueryInserts);
            affected_list(ctx, affected)
        }
        XaslKind::Do { exprs } => {
            let env = EvalEnv::new(&ctx.slots);
            for expr in exprs {
                eval_regu(expr, &env)?;
            }
            let out = Arc::new(ListFile::new(ctx.query_id, vec![], ListFlags::default()));
            out.close();
            Ok(out)
        }
        XaslKind::ObjFetch(fetch) | XaslKind::SetFetch(fetch) => {
            let out = Arc::new(ListFile::new(
                ctx.query_id,
                node.out_types.clone(),
                ListFlags::default(),
            ));
            if run_fetch(fetch, ctx)? {
                let env = EvalEnv::new(&ctx.slots);
                let row = node
                    .outptr_list
                    .iter()
                    .map(|r| eval_regu(r, &env))
                    .collect::<Result<Vec<_>>>()?;
                out.append_values(&row)?;
            }
            out.close();
            Ok(out)
        }
        XaslKind::Scan => Err(DbError::Internal(
            "a nested-loop spine node cannot be evaluated on its own".to_string(),
        )),
        XaslKind::ConnectBy => Err(DbError::Internal(
            "a hierarchy node is reached through its owner's connect-by link".to_string(),
        )),
    }
}

fn dml_context<'b>(ctx: &'b ExecContext) -> DmlContext<'b> {
    DmlContext {
        services: ctx.services,
        tran: ctx.tran_index,
        lock_timeout: ctx.options.lock_timeout,
        interrupted: ctx.interrupted.as_deref(),
    }
}

fn child_list(node: &XaslNode, idx: usize, ctx: &ExecContext) -> Result<Arc<ListFile>> {
    let child = node.aptr_list.get(idx).ok_or_else(|| {
        DbError::Internal(format!("node {} has no input child {}", node.id, idx))
    })?;
    ctx.out_list_of(child.id).ok_or_else(|| {
        DbError::Internal(format!("input child {} produced no list", child.id))
    })
}

fn affected_list(ctx: &ExecContext, affected: u64) -> Result<Arc<ListFile>> {
    let out = Arc::new(ListFile::new(
        ctx.query_id,
        vec![crate::runtime::value::Domain::bigint()],
        ListFlags::default(),
    ));
    out.append_values(&[Value::Bigint(affected as i64)])?;
    out.close();
    Ok(out)
}

fn affected_of(list: &Arc<ListFile>) -> Result<u64> {
    match list.read_index(0)?.first() {
        Some(Value::Bigint(n)) => Ok(*n as u64),
        other => Err(DbError::Internal(format!("not an affected count: {:?}", other))),
    }
}

// ============================================================================
// Build nodes: the scan loop
// ============================================================================

struct BuildState {
    out: Arc<ListFile>,
    aggs: Vec<AggAcc>,
    instnum: InstnumState,
    /// Raw input rows forwarded to the hierarchy builder
    connect_rows: Vec<Vec<Value>>,
    lock_set: Vec<(Oid, Oid)>,
    stop: bool,
    selupd_instant_only: bool,
}

fn run_build(node: &XaslNode, ctx: &mut ExecContext) -> Result<Arc<ListFile>> {
    // start_iterations
    let flags = ListFlags {
        distinct: node.distinct,
        final_result: node.is_final,
        set_op: None,
    };
    let aggs = match &node.kind {
        XaslKind::BuildValue { aggs } => aggs.iter().map(AggAcc::new).collect(),
        _ => Vec::new(),
    };
    let mut st = BuildState {
        out: Arc::new(ListFile::new(ctx.query_id, node.out_types.clone(), flags)),
        aggs,
        instnum: InstnumState::new(),
        connect_rows: Vec::new(),
        lock_set: Vec::new(),
        stop: false,
        selupd_instant_only: true,
    };

    let sp = ctx.services.tran.savepoint(ctx.tran_index);

    if node.spec_list.is_empty() && node.connect_by.is_none() {
        // Constant projection: a source-less build emits one candidate row
        process_candidate(node, node, ctx, &mut st)?;
    } else {
        scan_level(node, node, ctx, &mut st)?;
    }

    // end_iterations: composite lock sets escalate in one batch
    if node.composite_locking {
        let escalation: Result<()> = st
            .lock_set
            .iter()
            .try_for_each(|(instance, _class)| {
                ctx.services
                    .locks
                    .acquire(ctx.tran_index, *instance, LockMode::Exclusive, ctx.options.lock_timeout)
                    .map(|_| ())
            });
        if let Err(e) = escalation {
            ctx.services.tran.rollback_to(ctx.tran_index, sp, &ctx.services.heap)?;
            return Err(e);
        }
        if let Some(stats) = &ctx.stats {
            stats.add(StatKind::LockAcquires, st.lock_set.len() as u64);
        }
    }

    // Hierarchy pass replaces the output entirely
    if let Some(cb) = &node.connect_by {
        let bind_slots = node
            .spec_list
            .first()
            .map(|s| s.bind_slots.clone())
            .unwrap_or_default();
        let cb_node = ConnectByNode {
            spec: cb,
            bind_slots: &bind_slots,
            outptr_list: &node.outptr_list,
            out_types: &node.out_types,
            instnum_pred: &node.instnum_pred,
            instnum_mode: node.instnum_mode,
        };
        let rows = std::mem::take(&mut st.connect_rows);
        let mut slots = std::mem::take(&mut ctx.slots);
        let result = execute_connect_by(&cb_node, &rows, &mut slots, ctx.query_id, &ctx.sorter);
        ctx.slots = slots;
        let out = result?;
        return finish_passes(node, out, ctx);
    }

    // A value builder emits exactly one row of finalized aggregates
    if let XaslKind::BuildValue { .. } = &node.kind {
        let agg_values = st
            .aggs
            .iter()
            .map(|a| a.finalize())
            .collect::<Result<Vec<_>>>()?;
        let mut env = EvalEnv::new(&ctx.slots);
        env.aggs = Some(&agg_values);
        let row = node
            .outptr_list
            .iter()
            .map(|r| eval_regu(r, &env))
            .collect::<Result<Vec<_>>>()?;
        st.out.append_values(&row)?;
    }

    finish_passes(node, st.out, ctx)
}

/// Group-by, order-by, and bare-distinct passes over a node's list.
fn finish_passes(
    node: &XaslNode,
    mut out: Arc<ListFile>,
    ctx: &mut ExecContext,
) -> Result<Arc<ListFile>> {
    if let Some(group_by) = &node.group_by {
        out = execute_group_by(group_by, &out, ctx.query_id, &ctx.sorter)?;
    }
    if let Some(order_by) = &node.order_by {
        out = execute_order_by(order_by, &out, ctx.query_id, &ctx.sorter)?;
    } else if node.distinct {
        out = distinct_pass(&out, ctx)?;
    }
    out.close();
    Ok(out)
}

fn distinct_pass(input: &Arc<ListFile>, ctx: &ExecContext) -> Result<Arc<ListFile>> {
    let out = Arc::new(ListFile::new(
        ctx.query_id,
        input.type_list().clone(),
        ListFlags { distinct: true, ..Default::default() },
    ));
    let keys: Vec<SortKey> = (0..input.type_list().len()).map(SortKey::asc).collect();
    let key_info = SortKeyInfo { keys, payload: SortPayloadKind::SelfContained };
    {
        let out = Arc::clone(&out);
        ctx.sorter.sort(input, &key_info, true, move |row| {
            out.append_values(&row)?;
            Ok(SinkPut::Continue)
        })?;
    }
    Ok(out)
}

/// One level of the scan loop. `top` owns the output, the instance-number
/// state, and the output pointer list; `level` is the node whose specs are
/// iterated (the top node itself or a nested-loop spine node).
fn scan_level(
    top: &XaslNode,
    level: &XaslNode,
    ctx: &mut ExecContext,
    st: &mut BuildState,
) -> Result<bool> {
    // A spine level's uncorrelated inputs run on first entry
    for child in &level.aptr_list {
        if ctx.out_list_of(child.id).is_none() {
            run_node(child, ctx)?;
        }
    }

    let mut emitted_any = false;
    for spec in &level.spec_list {
        if spec.known_empty {
            continue;
        }
        ctx.bump(StatKind::QueryScans);

        let child_lists: Vec<Option<Arc<ListFile>>> = level
            .aptr_list
            .iter()
            .map(|c| ctx.out_list_of(c.id))
            .collect();
        let resolver = move |i: usize| child_lists.get(i).cloned().flatten();
        let snapshot = ctx.slots.clone();
        let open = OpenContext {
            services: ctx.services,
            lists: &resolver,
            slots: &snapshot,
            remote: ctx.remote,
            updates_class: ctx.updates_class,
            composite_locking: top.composite_locking,
            inner_of_outer_join: level.outer_join_inner,
        };
        let mut scan = ScanId::open(spec, &open)?;
        if let Some(oid_slot) = spec.oid_slot {
            scan = scan.with_oid_slot(oid_slot);
        }

        'blocks: loop {
            let block_snapshot = ctx.slots.clone();
            match scan.next_block(&block_snapshot)? {
                ScanResult::End => break 'blocks,
                ScanResult::Success => {}
            }
            loop {
                ctx.check_interrupt()?;
                match scan.next_tuple(&mut ctx.slots)? {
                    ScanResult::End => break,
                    ScanResult::Success => {}
                }
                if process_tuple(top, level, ctx, st)? {
                    emitted_any = true;
                }
                if st.stop {
                    break 'blocks;
                }
            }
        }
        scan.close();
        if st.stop {
            break;
        }
    }
    Ok(emitted_any)
}

/// Steps 1-6 of the per-tuple pipeline.
fn process_tuple(
    top: &XaslNode,
    level: &XaslNode,
    ctx: &mut ExecContext,
    st: &mut BuildState,
) -> Result<bool> {
    // Prior path-expression fetches
    for fetch in &level.bptr_list {
        if !run_fetch(fetch, ctx)? {
            return Ok(false);
        }
    }

    // Correlated subqueries rerun per outer tuple; their previous results
    // are dropped first
    for dptr in &level.dptr_list {
        if let Some(old) = ctx.out_list_of(dptr.id) {
            old.clear();
        }
        run_node(dptr, ctx)?;
    }

    for pred in [&level.after_join_pred, &level.if_pred] {
        if let Some(pred) = pred {
            let env = EvalEnv::new(&ctx.slots);
            if eval_pred(pred, &env)? != Tri::True {
                return Ok(false);
            }
        }
    }

    // Forward path-expression fetches
    for fetch in &level.fptr_list {
        if !run_fetch(fetch, ctx)? {
            return Ok(false);
        }
    }

    // Nested-loop successor: reset and recurse; this level emits only when
    // at least one inner tuple emits
    if let Some(inner) = &level.scan_ptr {
        ctx.bump(StatKind::QueryJoins);
        return scan_level(top, inner, ctx, st);
    }

    process_candidate(top, level, ctx, st)
}

/// The innermost step: hierarchy forwarding or the instance-number gate
/// plus one output iteration.
fn process_candidate(
    top: &XaslNode,
    _level: &XaslNode,
    ctx: &mut ExecContext,
    st: &mut BuildState,
) -> Result<bool> {
    if top.connect_by.is_some() {
        let bind_slots = top
            .spec_list
            .first()
            .map(|s| s.bind_slots.as_slice())
            .unwrap_or(&[]);
        let row: Vec<Value> = bind_slots
            .iter()
            .map(|s| ctx.slots.get(*s).cloned().unwrap_or(Value::Null))
            .collect();
        st.connect_rows.push(row);
        return Ok(true);
    }

    let signal = {
        let mut env = EvalEnv::new(&ctx.slots);
        st.instnum.evaluate(&top.instnum_pred, top.instnum_mode, &mut env)?
    };
    match signal {
        InstnumSignal::Stop => {
            st.stop = true;
            Ok(false)
        }
        InstnumSignal::NotQualified => Ok(false),
        InstnumSignal::Qualified => {
            one_iteration(top, ctx, st)?;
            Ok(true)
        }
    }
}

/// Emit one qualified row.
fn one_iteration(top: &XaslNode, ctx: &mut ExecContext, st: &mut BuildState) -> Result<()> {
    // SELECT ... FOR UPDATE increments happen as the row is selected; a
    // contended lock skips the increment rather than failing the query
    for selupd in &top.selupd_list {
        let oid = match ctx.slots.get(selupd.oid_slot) {
            Some(Value::Oid(oid)) => *oid,
            _ => continue,
        };
        match ctx
            .services
            .locks
            .acquire(ctx.tran_index, oid, LockMode::Exclusive, None)
        {
            Err(DbError::LockTimeout) => {
                st.selupd_instant_only = false;
                debug!(%oid, "increment skipped: lock not instantly available");
                continue;
            }
            Err(e) => return Err(e),
            Ok(_grant) => {}
        }
        let mut row = ctx
            .services
            .heap
            .fetch(selupd.class_oid, oid)
            .ok_or_else(|| DbError::NotFound(format!("object {}", oid)))?;
        let old = row
            .get(selupd.attr_id as usize)
            .cloned()
            .unwrap_or(Value::Null);
        let new = arith_add(&old, &Value::Bigint(selupd.delta))?;
        if let Some(slot) = row.get_mut(selupd.attr_id as usize) {
            *slot = new;
        }
        let replaced = ctx.services.heap.update(selupd.class_oid, oid, row)?;
        ctx.services.tran.record_undo(
            ctx.tran_index,
            UndoOp::HeapUpdate { class: selupd.class_oid, oid, old_row: replaced },
        );
    }

    if let XaslKind::BuildValue { .. } = &top.kind {
        let env = EvalEnv::new(&ctx.slots);
        for acc in &mut st.aggs {
            acc.accumulate(&env)?;
        }
        return Ok(());
    }

    let row = {
        let mut env = EvalEnv::new(&ctx.slots);
        env.instnum = st.instnum.counter - 1;
        top.outptr_list
            .iter()
            .map(|r| eval_regu(r, &env))
            .collect::<Result<Vec<_>>>()?
    };

    // With composite locking the first two columns carry the pair to lock
    if top.composite_locking {
        if let (Some(Value::Oid(instance)), Some(Value::Oid(class))) = (row.first(), row.get(1)) {
            st.lock_set.push((*instance, *class));
        }
    }

    st.out.append_values(&row)?;
    Ok(())
}

/// Path-expression fetch: bind the target's attributes and check the
/// selector. A failed selector disqualifies the tuple.
fn run_fetch(fetch: &FetchSpec, ctx: &mut ExecContext) -> Result<bool> {
    let source = {
        let env = EvalEnv::new(&ctx.slots);
        eval_regu(&fetch.source, &env)?
    };

    match fetch.kind {
        FetchKind::Object => {
            let row = match source {
                Value::Oid(oid) => match ctx.services.heap.fetch(fetch.class_oid, oid) {
                    Some(row) => Some(row),
                    None => return Ok(false),
                },
                Value::Vobj { real, .. } => match ctx.services.heap.fetch(fetch.class_oid, real) {
                    Some(row) => Some(row),
                    None => return Ok(false),
                },
                Value::Null => None,
                other => {
                    return Err(DbError::Execution(format!(
                        "object fetch over non-oid {:?}",
                        other
                    )))
                }
            };
            for (attr, slot) in &fetch.binds {
                let value = row
                    .as_ref()
                    .and_then(|r| r.get(*attr as usize).cloned())
                    .unwrap_or(Value::Null);
                if let Some(target) = ctx.slots.get_mut(*slot) {
                    *target = value;
                }
            }
        }
        FetchKind::Set => {
            let items = match source {
                Value::Set(items) | Value::Multiset(items) | Value::Sequence(items) => items,
                Value::Null => Vec::new(),
                other => {
                    return Err(DbError::Execution(format!(
                        "set fetch over non-collection {:?}",
                        other
                    )))
                }
            };
            for (pos, slot) in &fetch.binds {
                let value = items.get(*pos as usize).cloned().unwrap_or(Value::Null);
                if let Some(target) = ctx.slots.get_mut(*slot) {
                    *target = value;
                }
            }
        }
    }

    if let Some(selector) = &fetch.selector {
        let env = EvalEnv::new(&ctx.slots);
        if eval_pred(selector, &env)? != Tri::True {
            return Ok(false);
        }
    }
    Ok(true)
}

// ============================================================================
// Set operations
// ============================================================================

fn run_set_op(
    node: &XaslNode,
    kind: SetOpKind,
    left: usize,
    right: usize,
    ctx: &mut ExecContext,
) -> Result<Arc<ListFile>> {
    let left_list = child_list(node, left, ctx)?;
    let right_list = child_list(node, right, ctx)?;

    let left_rows = sorted_distinct_rows(&left_list, ctx)?;
    let right_rows = sorted_distinct_rows(&right_list, ctx)?;

    let out = Arc::new(ListFile::new(
        ctx.query_id,
        node.out_types.clone(),
        ListFlags {
            distinct: true,
            final_result: node.is_final,
            set_op: Some(kind),
        },
    ));

    let (mut i, mut j) = (0usize, 0usize);
    match kind {
        SetOpKind::Union => {
            while i < left_rows.len() || j < right_rows.len() {
                let pick_left = match (left_rows.get(i), right_rows.get(j)) {
                    (Some(l), Some(r)) => match row_cmp(l, r)? {
                        Ordering::Less => true,
                        Ordering::Greater => false,
                        Ordering::Equal => {
                            j += 1;
                            true
                        }
                    },
                    (Some(_), None) => true,
                    (None, Some(_)) => false,
                    (None, None) => break,
                };
                if pick_left {
                    out.append_values(&left_rows[i])?;
                    i += 1;
                } else {
                    out.append_values(&right_rows[j])?;
                    j += 1;
                }
            }
        }
        SetOpKind::Intersect => {
            while i < left_rows.len() && j < right_rows.len() {
                match row_cmp(&left_rows[i], &right_rows[j])? {
                    Ordering::Less => i += 1,
                    Ordering::Greater => j += 1,
                    Ordering::Equal => {
                        out.append_values(&left_rows[i])?;
                        i += 1;
                        j += 1;
                    }
                }
            }
        }
        SetOpKind::Difference => {
            while i < left_rows.len() {
                match right_rows.get(j) {
                    None => {
                        out.append_values(&left_rows[i])?;
                        i += 1;
                    }
                    Some(r) => match row_cmp(&left_rows[i], r)? {
                        Ordering::Less => {
                            out.append_values(&left_rows[i])?;
                            i += 1;
                        }
                        Ordering::Greater => j += 1,
                        Ordering::Equal => {
                            i += 1;
                            j += 1;
                        }
                    },
                }
            }
        }
    }

    finish_passes(node, out, ctx)
}

fn sorted_distinct_rows(list: &Arc<ListFile>, ctx: &ExecContext) -> Result<Vec<Vec<Value>>> {
    let keys: Vec<SortKey> = (0..list.type_list().len()).map(SortKey::asc).collect();
    let key_info = SortKeyInfo { keys, payload: SortPayloadKind::SelfContained };
    let mut rows = Vec::new();
    ctx.sorter.sort(list, &key_info, true, |row| {
        rows.push(row);
        Ok(SinkPut::Continue)
    })?;
    Ok(rows)
}

fn row_cmp(a: &[Value], b: &[Value]) -> Result<Ordering> {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = sort_compare(x, y)?;
        if ord != Ordering::Equal {
            return Ok(ord);
        }
    }
    Ok(a.len().cmp(&b.len()))
}
