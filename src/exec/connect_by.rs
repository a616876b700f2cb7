// # Hierarchical Queries
//
// Breadth-first expansion of a self-join. Parents are appended to the
// output list before their children so the parent-position back-pointer
// stored in each child is always valid. Every row carries a string index
// key `<parent-index>.<sibling-position>` with zero-padded components so a
// plain lexicographic sort of the index column yields depth-first
// preorder; after that sort the parent positions are rewritten to the
// post-sort positions. Cycle candidates are compared against their
// ancestor chain, nearest first: with NOCYCLE the offending child's parent
// is flagged and the child is emitted but never expanded, without it the
// statement fails.

use crate::common::QueryId;
use crate::error::{DbError, Result};
use crate::exec::eval::{InstnumSignal, InstnumState};
use crate::exec::regu::{eval_pred, eval_regu, EvalEnv, PredExpr, PseudoCol, ReguVar, Tri};
use crate::exec::xasl::{ConnectBySpec, InstnumMode};
use crate::runtime::list_file::{ListFile, ListFlags};
use crate::runtime::sort::{compare_keys, ListSorter, SinkPut, SortKey, SortKeyInfo, SortPayloadKind};
use crate::runtime::value::{sort_compare, Domain, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Sibling positions are zero-padded so the string index compares as ASCII
const SIBLING_PAD: usize = 8;

/// What the hierarchy builder needs from its owning node
pub struct ConnectByNode<'a> {
    pub spec: &'a ConnectBySpec,
    pub bind_slots: &'a [usize],
    pub outptr_list: &'a [ReguVar],
    pub out_types: &'a [Domain],
    pub instnum_pred: &'a Option<PredExpr>,
    pub instnum_mode: InstnumMode,
}

struct HierEntry {
    input_idx: usize,
    level: i64,
    str_index: String,
    outputs: Vec<Value>,
    parent: Option<usize>,
    /// Index of this entry's row in the build list
    list_idx: usize,
    child_count: usize,
}

/// Run the hierarchy over the node's qualifying input rows, producing the
/// final user-facing list.
pub fn execute_connect_by(
    node: &ConnectByNode,
    input_rows: &[Vec<Value>],
    slots: &mut [Value],
    out_query: QueryId,
    sorter: &ListSorter,
) -> Result<Arc<ListFile>> {
    let user_width = node.outptr_list.len();
    let col_level = user_width;
    let col_isleaf = user_width + 1;
    let col_iscycle = user_width + 2;
    let col_strindex = user_width + 3;
    let col_parentpos = user_width + 4;
    let col_oldpos = user_width + 5;

    let mut internal_types = node.out_types.to_vec();
    internal_types.extend([
        Domain::bigint(),
        Domain::bigint(),
        Domain::bigint(),
        Domain::string(),
        Domain::bigint(),
        Domain::bigint(),
    ]);
    let build = Arc::new(ListFile::new(out_query, internal_types.clone(), ListFlags::default()));

    let cycle_cols: Vec<usize> = if node.spec.cycle_cols.is_empty() {
        (0..user_width).collect()
    } else {
        node.spec.cycle_cols.clone()
    };

    let mut entries: Vec<HierEntry> = Vec::new();
    let mut queue: VecDeque<usize> = VecDeque::new();

    // Initial frontier: the START WITH subset
    let mut roots: Vec<(usize, Vec<Value>)> = Vec::new();
    for (idx, row) in input_rows.iter().enumerate() {
        bind_row(node.bind_slots, row, slots)?;
        let mut env = EvalEnv::new(slots);
        env.level = 1;
        let qualifies = match &node.spec.start_with {
            None => true,
            Some(pred) => eval_pred(pred, &env)? == Tri::True,
        };
        if qualifies {
            let outputs = eval_outputs(node.outptr_list, &env)?;
            roots.push((idx, outputs));
        }
    }
    sort_siblings(&mut roots, &node.spec.order_siblings_by);

    for (pos, (input_idx, outputs)) in roots.into_iter().enumerate() {
        let str_index = format!("{:0pad$}", pos + 1, pad = SIBLING_PAD);
        let entry_idx = entries.len();
        append_entry(
            &build,
            &outputs,
            1,
            &str_index,
            -1,
            entry_idx,
        )?;
        entries.push(HierEntry {
            input_idx,
            level: 1,
            str_index,
            outputs,
            parent: None,
            list_idx: entry_idx,
            child_count: 0,
        });
        queue.push_back(entry_idx);
    }

    // Level-by-level expansion
    while let Some(parent_idx) = queue.pop_front() {
        let parent_input = entries[parent_idx].input_idx;
        let child_level = entries[parent_idx].level + 1;

        // The prior value list rebinds from the parent tuple for every
        // child iteration
        bind_row(node.bind_slots, &input_rows[parent_input], slots)?;
        let prior_snapshot: Vec<Value> = slots.to_vec();

        let connect_pred = match &node.spec.connect_by {
            Some(p) => p,
            None => continue,
        };

        let mut children: Vec<(usize, Vec<Value>, bool)> = Vec::new();
        for (idx, row) in input_rows.iter().enumerate() {
            bind_row(node.bind_slots, row, slots)?;
            let mut env = EvalEnv::new(slots);
            env.prior = Some(&prior_snapshot);
            env.level = child_level;
            if eval_pred(connect_pred, &env)? != Tri::True {
                continue;
            }
            let outputs = eval_outputs(node.outptr_list, &env)?;

            // Ancestor walk, nearest first
            let cyclic = walk_finds_match(&entries, parent_idx, &outputs, &cycle_cols)?;
            if cyclic && !node.spec.nocycle {
                return Err(DbError::CycleDetected);
            }
            if cyclic {
                // Flag the parent; the child still joins the output but is
                // never expanded
                let parent_list_idx = entries[parent_idx].list_idx;
                build.rewrite_fixed(
                    parent_list_idx,
                    col_iscycle,
                    &Value::Bigint(1),
                    &Domain::bigint(),
                )?;
            }
            children.push((idx, outputs, cyclic));
        }

        sort_siblings_cyclic(&mut children, &node.spec.order_siblings_by);

        for (pos, (input_idx, outputs, cyclic)) in children.into_iter().enumerate() {
            let str_index = format!(
                "{}.{:0pad$}",
                entries[parent_idx].str_index,
                pos + 1,
                pad = SIBLING_PAD
            );
            let entry_idx = entries.len();
            append_entry(
                &build,
                &outputs,
                child_level,
                &str_index,
                entries[parent_idx].list_idx as i64,
                entry_idx,
            )?;
            entries.push(HierEntry {
                input_idx,
                level: child_level,
                str_index,
                outputs,
                parent: Some(parent_idx),
                list_idx: entry_idx,
                child_count: 0,
            });
            entries[parent_idx].child_count += 1;
            if !cyclic {
                queue.push_back(entry_idx);
            }
        }
    }

    // Backfill ISLEAF now that every child is known
    for entry in &entries {
        if entry.child_count > 0 {
            build.rewrite_fixed(entry.list_idx, col_isleaf, &Value::Bigint(0), &Domain::bigint())?;
        }
    }

    // Depth-first preorder: lexicographic sort of the string index
    let sorted = Arc::new(ListFile::new(out_query, internal_types, ListFlags::default()));
    let key_info = SortKeyInfo {
        keys: vec![SortKey::asc(col_strindex)],
        payload: SortPayloadKind::SelfContained,
    };
    {
        let sorted = Arc::clone(&sorted);
        sorter.sort(&build, &key_info, false, move |row| {
            sorted.append_values(&row)?;
            Ok(SinkPut::Continue)
        })?;
    }

    // Post-sort positions differ from build positions: rewrite every
    // parent-position column through the old-to-new map
    let mut old_to_new: HashMap<i64, i64> = HashMap::new();
    for new_idx in 0..sorted.tuple_count() {
        let row = sorted.read_index(new_idx)?;
        if let Value::Bigint(old) = row[col_oldpos] {
            old_to_new.insert(old, new_idx as i64);
        }
    }
    for new_idx in 0..sorted.tuple_count() {
        let row = sorted.read_index(new_idx)?;
        if let Value::Bigint(old_parent) = row[col_parentpos] {
            if old_parent >= 0 {
                let new_parent = *old_to_new.get(&old_parent).ok_or_else(|| {
                    DbError::Internal("dangling parent position after hierarchy sort".to_string())
                })?;
                sorted.rewrite_fixed(
                    new_idx,
                    col_parentpos,
                    &Value::Bigint(new_parent),
                    &Domain::bigint(),
                )?;
            }
        }
    }

    // Final scan: bind the pseudo-columns, run the instance-number gate,
    // and emit the user columns
    let out = Arc::new(ListFile::new(out_query, node.out_types.to_vec(), ListFlags::default()));
    let mut instnum = InstnumState::new();
    let mut scan = sorted.open_scan();
    while let Some(row) = scan.next_tuple()? {
        let level = bigint_at(&row, col_level);
        let isleaf = bigint_at(&row, col_isleaf);
        let iscycle = bigint_at(&row, col_iscycle);
        let parent_pos = bigint_at(&row, col_parentpos);

        let empty_slots: Vec<Value> = Vec::new();
        let mut env = EvalEnv::new(&empty_slots);
        env.level = level;
        env.isleaf = isleaf;
        env.iscycle = iscycle;
        env.parent_pos = parent_pos;

        match instnum.evaluate(node.instnum_pred, node.instnum_mode, &mut env)? {
            InstnumSignal::Stop => break,
            InstnumSignal::NotQualified => continue,
            InstnumSignal::Qualified => {}
        }

        let emitted: Vec<Value> = node
            .outptr_list
            .iter()
            .enumerate()
            .map(|(col, regu)| match regu {
                ReguVar::Pseudo(PseudoCol::Level) => Value::Bigint(level),
                ReguVar::Pseudo(PseudoCol::ConnectByIsLeaf) => Value::Bigint(isleaf),
                ReguVar::Pseudo(PseudoCol::ConnectByIsCycle) => Value::Bigint(iscycle),
                ReguVar::Pseudo(PseudoCol::ParentPos) => Value::Bigint(parent_pos),
                _ => row[col].clone(),
            })
            .collect();
        out.append_values(&emitted)?;
    }
    out.close();
    Ok(out)
}

fn bigint_at(row: &[Value], col: usize) -> i64 {
    match row.get(col) {
        Some(Value::Bigint(v)) => *v,
        _ => 0,
    }
}

fn bind_row(bind_slots: &[usize], row: &[Value], slots: &mut [Value]) -> Result<()> {
    for (i, slot) in bind_slots.iter().enumerate() {
        let target = slots
            .get_mut(*slot)
            .ok_or_else(|| DbError::Internal(format!("value list has no slot {}", slot)))?;
        *target = row.get(i).cloned().unwrap_or(Value::Null);
    }
    Ok(())
}

fn eval_outputs(outptr_list: &[ReguVar], env: &EvalEnv) -> Result<Vec<Value>> {
    outptr_list.iter().map(|r| eval_regu(r, env)).collect()
}

fn append_entry(
    build: &Arc<ListFile>,
    outputs: &[Value],
    level: i64,
    str_index: &str,
    parent_pos: i64,
    own_pos: usize,
) -> Result<()> {
    let mut row = outputs.to_vec();
    row.push(Value::Bigint(level));
    row.push(Value::Bigint(1)); // leaf until a child shows up
    row.push(Value::Bigint(0));
    row.push(Value::Str(str_index.to_string()));
    row.push(Value::Bigint(parent_pos));
    row.push(Value::Bigint(own_pos as i64));
    build.append_values(&row)?;
    Ok(())
}

/// Compare the candidate's cycle columns against every ancestor's, the
/// parent first.
fn walk_finds_match(
    entries: &[HierEntry],
    parent_idx: usize,
    child_outputs: &[Value],
    cycle_cols: &[usize],
) -> Result<bool> {
    let mut cursor = Some(parent_idx);
    while let Some(idx) = cursor {
        let ancestor = &entries[idx];
        let mut all_equal = true;
        for col in cycle_cols {
            let a = child_outputs.get(*col).unwrap_or(&Value::Null);
            let b = ancestor.outputs.get(*col).unwrap_or(&Value::Null);
            if sort_compare(a, b)? != Ordering::Equal {
                all_equal = false;
                break;
            }
        }
        if all_equal && !cycle_cols.is_empty() {
            return Ok(true);
        }
        cursor = ancestor.parent;
    }
    Ok(false)
}

fn sort_siblings(siblings: &mut [(usize, Vec<Value>)], keys: &[SortKey]) {
    if keys.is_empty() {
        return;
    }
    siblings.sort_by(|(_, a), (_, b)| {
        let ka: Vec<Value> = keys.iter().map(|k| a.get(k.column).cloned().unwrap_or(Value::Null)).collect();
        let kb: Vec<Value> = keys.iter().map(|k| b.get(k.column).cloned().unwrap_or(Value::Null)).collect();
        compare_keys(&ka, &kb, keys)
    });
}

fn sort_siblings_cyclic(siblings: &mut [(usize, Vec<Value>, bool)], keys: &[SortKey]) {
    if keys.is_empty() {
        return;
    }
    siblings.sort_by(|(_, a, _), (_, b, _)| {
        let ka: Vec<Value> = keys.iter().map(|k| a.get(k.column).cloned().unwrap_or(Value::Null)).collect();
        let kb: Vec<Value> = keys.iter().map(|k| b.get(k.column).cloned().unwrap_or(Value::Null)).collect();
        compare_keys(&ka, &kb, keys)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::regu::{cmp, slot, CmpOp};

    // Input rows: (id, parent, name)
    fn rows(data: &[(i64, Option<i64>, &str)]) -> Vec<Vec<Value>> {
        data.iter()
            .map(|(id, parent, name)| {
                vec![
                    Value::Bigint(*id),
                    parent.map(Value::Bigint).unwrap_or(Value::Null),
                    Value::Str((*name).to_string()),
                ]
            })
            .collect()
    }

    fn connect_spec(nocycle: bool) -> ConnectBySpec {
        ConnectBySpec {
            start_with: Some(PredExpr::IsNull(slot(1))),
            // PRIOR id = parent
            connect_by: Some(cmp(CmpOp::Eq, ReguVar::PriorSlot(0), slot(1))),
            nocycle,
            order_siblings_by: vec![],
            // Compare names during the ancestor walk
            cycle_cols: vec![0],
        }
    }

    fn run(
        data: &[(i64, Option<i64>, &str)],
        spec: &ConnectBySpec,
    ) -> Result<Vec<(String, i64, i64, i64)>> {
        let input = rows(data);
        let mut slots = vec![Value::Null; 3];
        let instnum = None;
        let outptr = vec![
            slot(2),
            ReguVar::Pseudo(PseudoCol::Level),
            ReguVar::Pseudo(PseudoCol::ConnectByIsLeaf),
            ReguVar::Pseudo(PseudoCol::ConnectByIsCycle),
        ];
        let out_types = vec![
            Domain::string(),
            Domain::bigint(),
            Domain::bigint(),
            Domain::bigint(),
        ];
        let node = ConnectByNode {
            spec,
            bind_slots: &[0, 1, 2],
            outptr_list: &outptr,
            out_types: &out_types,
            instnum_pred: &instnum,
            instnum_mode: InstnumMode::Continue,
        };
        let sorter = ListSorter::with_default_config();
        let out = execute_connect_by(&node, &input, &mut slots, 5, &sorter)?;
        let mut scan = out.open_scan();
        let mut result = Vec::new();
        while let Some(row) = scan.next_tuple()? {
            let name = match &row[0] {
                Value::Str(s) => s.clone(),
                other => panic!("unexpected {:?}", other),
            };
            result.push((name, bigint_at(&row, 1), bigint_at(&row, 2), bigint_at(&row, 3)));
        }
        Ok(result)
    }

    #[test]
    fn test_linear_chain_with_cycle_mark() {
        // The chain's fourth row repeats an ancestor's name: its parent is
        // flagged, the row itself is emitted as an unexpanded leaf.
        let got = run(
            &[(1, None, "A"), (2, Some(1), "B"), (3, Some(2), "C"), (4, Some(3), "B")],
            &connect_spec(true),
        )
        .unwrap();
        assert_eq!(
            got,
            vec![
                ("A".to_string(), 1, 0, 0),
                ("B".to_string(), 2, 0, 0),
                ("C".to_string(), 3, 0, 1),
                ("B".to_string(), 4, 1, 0),
            ]
        );
    }

    #[test]
    fn test_cycle_without_nocycle_fails() {
        let err = run(
            &[(1, None, "A"), (2, Some(1), "B"), (3, Some(2), "B")],
            &connect_spec(false),
        )
        .unwrap_err();
        assert!(matches!(err, DbError::CycleDetected));
    }

    #[test]
    fn test_depth_first_order_with_branches() {
        // Root with two subtrees: every descendant is contiguous after its
        // parent and before the next sibling subtree.
        let got = run(
            &[
                (1, None, "root"),
                (2, Some(1), "a"),
                (3, Some(1), "b"),
                (4, Some(2), "a1"),
                (5, Some(3), "b1"),
            ],
            &connect_spec(true),
        )
        .unwrap();
        let names: Vec<&str> = got.iter().map(|(n, ..)| n.as_str()).collect();
        assert_eq!(names, vec!["root", "a", "a1", "b", "b1"]);
        // Levels follow the tree
        let levels: Vec<i64> = got.iter().map(|(_, l, ..)| *l).collect();
        assert_eq!(levels, vec![1, 2, 3, 2, 3]);
        // Leaves marked
        let leaves: Vec<i64> = got.iter().map(|(_, _, lf, _)| *lf).collect();
        assert_eq!(leaves, vec![0, 0, 1, 0, 1]);
    }

    #[test]
    fn test_order_siblings_by() {
        let mut spec = connect_spec(true);
        // Order siblings by name descending
        spec.order_siblings_by = vec![SortKey::desc(0)];
        let got = run(
            &[
                (1, None, "root"),
                (2, Some(1), "a"),
                (3, Some(1), "b"),
            ],
            &spec,
        )
        .unwrap();
        let names: Vec<&str> = got.iter().map(|(n, ..)| n.as_str()).collect();
        assert_eq!(names, vec!["root", "b", "a"]);
    }

    #[test]
    fn test_empty_input_empty_output() {
        let got = run(&[], &connect_spec(true)).unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn test_multiple_roots_sorted_independently() {
        let got = run(
            &[(1, None, "r1"), (2, None, "r2"), (3, Some(1), "c1")],
            &connect_spec(true),
        )
        .unwrap();
        let names: Vec<&str> = got.iter().map(|(n, ..)| n.as_str()).collect();
        assert_eq!(names, vec!["r1", "c1", "r2"]);
    }
}
