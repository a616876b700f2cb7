// # Sorted Group-By
//
// External sort on the group keys followed by a streaming fold. The sort
// record keeps a back-pointer to the original tuple unless the keys cover
// every column. WITH ROLLUP maintains one extra aggregate list per prefix
// of the key list; a key change at prefix depth k finalizes every deeper
// rollup level, nulling out the suppressed key columns.

use crate::common::QueryId;
use crate::error::Result;
use crate::exec::eval::AggAcc;
use crate::exec::regu::{eval_pred, EvalEnv, Tri};
use crate::exec::xasl::{GroupBySpec, GroupOutCol};
use crate::runtime::list_file::{ListFile, ListFlags};
use crate::runtime::sort::{ListSorter, SinkPut, SortKey, SortKeyInfo, SortPayloadKind};
use crate::runtime::value::{sort_compare, Value};
use std::cmp::Ordering;
use std::sync::Arc;

struct GroupLevel {
    /// Number of leading key columns this level groups by; the full level
    /// uses them all
    prefix_len: usize,
    aggs: Vec<AggAcc>,
}

struct GroupByState<'a> {
    spec: &'a GroupBySpec,
    out: Arc<ListFile>,
    /// Index 0 is the full grouping; deeper indexes are rollup prefixes in
    /// decreasing prefix length
    levels: Vec<GroupLevel>,
    current_key: Option<Vec<Value>>,
    groupbynum: i64,
}

/// Run the group-by pass over a node's materialized input list.
pub fn execute_group_by(
    spec: &GroupBySpec,
    input: &Arc<ListFile>,
    out_query: QueryId,
    sorter: &ListSorter,
) -> Result<Arc<ListFile>> {
    let out = Arc::new(ListFile::new(out_query, spec.out_types.clone(), ListFlags::default()));

    // Empty input yields zero groups, not one row of initial values
    if input.tuple_count() == 0 {
        out.close();
        return Ok(out);
    }

    let mut levels = vec![GroupLevel {
        prefix_len: spec.key_cols.len(),
        aggs: spec.aggs.iter().map(AggAcc::new).collect(),
    }];
    if spec.with_rollup {
        for prefix_len in (0..spec.key_cols.len()).rev() {
            levels.push(GroupLevel {
                prefix_len,
                aggs: spec.aggs.iter().map(AggAcc::new).collect(),
            });
        }
    }

    let mut state = GroupByState {
        spec,
        out: Arc::clone(&out),
        levels,
        current_key: None,
        groupbynum: 1,
    };

    // Back-reference records unless the keys already cover every column
    let payload = if spec.key_cols.len() >= input.type_list().len() {
        SortPayloadKind::SelfContained
    } else {
        SortPayloadKind::BackReference
    };
    let key_info = SortKeyInfo {
        keys: spec.key_cols.iter().map(|c| SortKey::asc(*c)).collect(),
        payload,
    };

    sorter.sort(input, &key_info, false, |row| {
        state.fold_row(&row)?;
        Ok(SinkPut::Continue)
    })?;

    // End of input: finalize the in-flight group and every rollup level
    state.finalize_tail()?;
    out.close();
    Ok(out)
}

impl<'a> GroupByState<'a> {
    fn key_of(&self, row: &[Value]) -> Vec<Value> {
        self.spec
            .key_cols
            .iter()
            .map(|c| row.get(*c).cloned().unwrap_or(Value::Null))
            .collect()
    }

    fn fold_row(&mut self, row: &[Value]) -> Result<()> {
        let key = self.key_of(row);
        let change = match &self.current_key {
            // The first tuple starts every level's group
            None => None,
            Some(current) => first_diff(current, &key)?.map(|depth| (depth, current.clone())),
        };
        if self.current_key.is_none() {
            self.current_key = Some(key);
        } else if let Some((depth, old_key)) = change {
            // Full group closes first, then the rollup prefixes deeper
            // than the change point, deepest first
            self.finalize_level(0, &old_key)?;
            let rollup_levels: Vec<usize> = (1..self.levels.len())
                .filter(|i| self.levels[*i].prefix_len > depth)
                .collect();
            for level in rollup_levels {
                self.finalize_level(level, &old_key)?;
            }
            self.current_key = Some(key);
        }

        let env = EvalEnv::new(row);
        for level in &mut self.levels {
            for acc in &mut level.aggs {
                acc.accumulate(&env)?;
            }
        }
        Ok(())
    }

    fn finalize_tail(&mut self) -> Result<()> {
        let key = match self.current_key.clone() {
            Some(k) => k,
            None => return Ok(()),
        };
        for level in 0..self.levels.len() {
            self.finalize_level(level, &key)?;
        }
        Ok(())
    }

    /// Emit one finished group at the given level, restarting its
    /// accumulators.
    fn finalize_level(&mut self, level: usize, key: &[Value]) -> Result<()> {
        let prefix_len = self.levels[level].prefix_len;
        let agg_values = self.levels[level]
            .aggs
            .iter()
            .map(|a| a.finalize())
            .collect::<Result<Vec<_>>>()?;
        for acc in &mut self.levels[level].aggs {
            acc.restart();
        }

        // Rollup rows null out the suppressed key columns
        let visible_key: Vec<Value> = key
            .iter()
            .enumerate()
            .map(|(i, v)| if i < prefix_len { v.clone() } else { Value::Null })
            .collect();

        // HAVING and the group-by-number gate see [keys..., aggregates...]
        let synthesized: Vec<Value> = visible_key
            .iter()
            .cloned()
            .chain(agg_values.iter().cloned())
            .collect();
        let mut env = EvalEnv::new(&synthesized);
        env.aggs = Some(&agg_values);

        if let Some(having) = &self.spec.having {
            if eval_pred(having, &env)? != Tri::True {
                return Ok(());
            }
        }
        env.groupbynum = self.groupbynum;
        let qualified = match &self.spec.groupbynum_pred {
            None => true,
            Some(pred) => eval_pred(pred, &env)? == Tri::True,
        };
        self.groupbynum += 1;
        if !qualified {
            return Ok(());
        }

        let out_row: Vec<Value> = self
            .spec
            .out_cols
            .iter()
            .map(|col| match col {
                GroupOutCol::Key(i) => visible_key.get(*i).cloned().unwrap_or(Value::Null),
                GroupOutCol::Agg(i) => agg_values.get(*i).cloned().unwrap_or(Value::Null),
                GroupOutCol::GroupbyNum => Value::Bigint(self.groupbynum - 1),
            })
            .collect();
        self.out.append_values(&out_row)?;
        Ok(())
    }
}

/// First key position where two keys differ, under sort-order equality.
fn first_diff(a: &[Value], b: &[Value]) -> Result<Option<usize>> {
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        if sort_compare(x, y)? != Ordering::Equal {
            return Ok(Some(i));
        }
    }
    Ok(None)
}
