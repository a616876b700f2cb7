// # Sorted Merge Join
//
// Single-pass join over two key-sorted list files. Equal-key groups are
// cross-producted by backtracking the inner scan to a saved position; outer
// variants emit unmatched rows with null padding. A null merge key sorts
// below every non-null value and never compares equal to anything, itself
// included, so null keys can only surface as null-padded outer rows.

use crate::common::QueryId;
use crate::error::{DbError, Result};
use crate::runtime::list_file::{ListFile, ListFlags, ListScan, ListScanPos};
use crate::runtime::value::{sort_compare, value_compare, CmpResult, Value};
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
}

impl JoinType {
    fn emits_unmatched_left(&self) -> bool {
        matches!(self, JoinType::LeftOuter | JoinType::FullOuter)
    }

    fn emits_unmatched_right(&self) -> bool {
        matches!(self, JoinType::RightOuter | JoinType::FullOuter)
    }
}

/// Merge-join two sorted list files on `keys` (left column, right column)
/// pairs, producing a new list file whose tuples are left columns followed
/// by right columns.
pub fn merge_join(
    left: &Arc<ListFile>,
    right: &Arc<ListFile>,
    keys: &[(usize, usize)],
    join: JoinType,
    out_query_id: QueryId,
    flags: ListFlags,
) -> Result<Arc<ListFile>> {
    if keys.is_empty() {
        return Err(DbError::InvalidInput("merge join requires at least one key".to_string()));
    }

    let mut out_types = left.type_list().clone();
    out_types.extend(right.type_list().iter().cloned());
    let out = Arc::new(ListFile::new(out_query_id, out_types, flags));

    let left_width = left.type_list().len();
    let right_width = right.type_list().len();

    let mut lscan = left.open_scan();
    let mut rscan = right.open_scan();

    let mut lrow = lscan.next_tuple()?;
    let (mut rpos, mut rrow) = advance(&mut rscan)?;

    while let (Some(l), Some(r)) = (&lrow, &rrow) {
        if key_has_null(l, keys, Side::Left) {
            if join.emits_unmatched_left() {
                emit_padded_left(&out, l, right_width)?;
            }
            lrow = lscan.next_tuple()?;
            continue;
        }
        if key_has_null(r, keys, Side::Right) {
            if join.emits_unmatched_right() {
                emit_padded_right(&out, r, left_width)?;
            }
            let next = advance(&mut rscan)?;
            rpos = next.0;
            rrow = next.1;
            continue;
        }

        match compare_key_prefix(l, r, keys)? {
            Ordering::Less => {
                if join.emits_unmatched_left() {
                    emit_padded_left(&out, l, right_width)?;
                }
                lrow = lscan.next_tuple()?;
            }
            Ordering::Greater => {
                if join.emits_unmatched_right() {
                    emit_padded_right(&out, r, left_width)?;
                }
                let next = advance(&mut rscan)?;
                rpos = next.0;
                rrow = next.1;
            }
            Ordering::Equal => {
                // Cross-product the equal-key groups: each left group row
                // backtracks the inner scan to the saved group start.
                let group_start = rpos;
                let group_key = extract_key(l, keys, Side::Left);
                loop {
                    let l_current = match &lrow {
                        Some(l) if key_equals(l, &group_key, keys, Side::Left)? => l.clone(),
                        _ => break,
                    };
                    rscan.jump_to(group_start);
                    loop {
                        let (pos, row) = advance(&mut rscan)?;
                        match row {
                            Some(r)
                                if !key_has_null(&r, keys, Side::Right)
                                    && key_equals(&r, &group_key, keys, Side::Right)? =>
                            {
                                emit_joined(&out, &l_current, &r)?;
                            }
                            other => {
                                rpos = pos;
                                rrow = other;
                                break;
                            }
                        }
                    }
                    lrow = lscan.next_tuple()?;
                }
            }
        }
    }

    // Tail: one side exhausted
    while let Some(l) = &lrow {
        if join.emits_unmatched_left() {
            emit_padded_left(&out, l, right_width)?;
        }
        lrow = lscan.next_tuple()?;
    }
    while let Some(r) = &rrow {
        if join.emits_unmatched_right() {
            emit_padded_right(&out, r, left_width)?;
        }
        rrow = advance(&mut rscan)?.1;
    }

    Ok(out)
}

#[derive(Clone, Copy)]
enum Side {
    Left,
    Right,
}

fn key_column(keys: &[(usize, usize)], i: usize, side: Side) -> usize {
    match side {
        Side::Left => keys[i].0,
        Side::Right => keys[i].1,
    }
}

fn key_has_null(row: &[Value], keys: &[(usize, usize)], side: Side) -> bool {
    (0..keys.len()).any(|i| {
        row.get(key_column(keys, i, side))
            .map(|v| v.is_null())
            .unwrap_or(true)
    })
}

fn extract_key(row: &[Value], keys: &[(usize, usize)], side: Side) -> Vec<Value> {
    (0..keys.len())
        .map(|i| row.get(key_column(keys, i, side)).cloned().unwrap_or(Value::Null))
        .collect()
}

fn key_equals(row: &[Value], key: &[Value], keys: &[(usize, usize)], side: Side) -> Result<bool> {
    for (i, expected) in key.iter().enumerate() {
        let actual = row.get(key_column(keys, i, side)).unwrap_or(&Value::Null);
        if value_compare(actual, expected)? != CmpResult::Eq {
            return Ok(false);
        }
    }
    Ok(true)
}

fn compare_key_prefix(l: &[Value], r: &[Value], keys: &[(usize, usize)]) -> Result<Ordering> {
    for (lc, rc) in keys {
        let lv = l.get(*lc).unwrap_or(&Value::Null);
        let rv = r.get(*rc).unwrap_or(&Value::Null);
        let ord = sort_compare(lv, rv)?;
        if ord != Ordering::Equal {
            return Ok(ord);
        }
    }
    Ok(Ordering::Equal)
}

fn advance(scan: &mut ListScan) -> Result<(ListScanPos, Option<Vec<Value>>)> {
    let pos = scan.position();
    let row = scan.next_tuple()?;
    Ok((pos, row))
}

fn emit_joined(out: &Arc<ListFile>, l: &[Value], r: &[Value]) -> Result<()> {
    let mut row = l.to_vec();
    row.extend(r.iter().cloned());
    out.append_values(&row)?;
    Ok(())
}

fn emit_padded_left(out: &Arc<ListFile>, l: &[Value], right_width: usize) -> Result<()> {
    let mut row = l.to_vec();
    row.extend(std::iter::repeat(Value::Null).take(right_width));
    out.append_values(&row)?;
    Ok(())
}

fn emit_padded_right(out: &Arc<ListFile>, r: &[Value], left_width: usize) -> Result<()> {
    let mut row: Vec<Value> = std::iter::repeat(Value::Null).take(left_width).collect();
    row.extend(r.iter().cloned());
    out.append_values(&row)?;
    Ok(())
}
