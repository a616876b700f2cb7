// # Order-By / Distinct Pass
//
// One sort pass that imposes order, projects positional expressions,
// gates rows through the order-by-number predicate, and eliminates
// duplicates. The gate stops the sort once a row past the qualifying
// range is seen; the sorter discards the rest of its input. When the
// plan's existing order already covers the requirement the sort is
// skipped and the input streams through the same pipeline.

use crate::common::QueryId;
use crate::error::Result;
use crate::exec::eval::{InstnumSignal, InstnumState};
use crate::exec::regu::{eval_pred, EvalEnv, Tri};
use crate::exec::xasl::OrderBySpec;
use crate::runtime::list_file::{ListFile, ListFlags};
use crate::runtime::sort::{ListSorter, SinkPut, SortKeyInfo, SortPayloadKind};
use crate::runtime::value::{sort_compare, Value};
use std::cmp::Ordering;
use std::sync::Arc;

/// Run the order-by pass over a node's output list.
pub fn execute_order_by(
    spec: &OrderBySpec,
    input: &Arc<ListFile>,
    out_query: QueryId,
    sorter: &ListSorter,
) -> Result<Arc<ListFile>> {
    let out_types = match &spec.out_cols {
        Some(cols) => cols
            .iter()
            .map(|c| {
                input
                    .type_list()
                    .get(*c)
                    .cloned()
                    .unwrap_or(crate::runtime::value::Domain::int())
            })
            .collect(),
        None => input.type_list().clone(),
    };
    let out = Arc::new(ListFile::new(out_query, out_types, ListFlags::default()));

    let mut pipeline = Pipeline {
        spec,
        out: Arc::clone(&out),
        ordbynum: InstnumState::new(),
        prev_projected: None,
    };

    if spec.already_ordered {
        let mut scan = input.open_scan();
        while let Some(row) = scan.next_tuple()? {
            if pipeline.put(row)? == SinkPut::Stop {
                break;
            }
        }
    } else {
        // Distinct on unprojected output is handled by the sorter itself;
        // projected output dedups adjacent rows after projection.
        let sorter_distinct = spec.distinct && spec.out_cols.is_none();
        let key_info = SortKeyInfo {
            keys: spec.keys.clone(),
            payload: SortPayloadKind::SelfContained,
        };
        sorter.sort(input, &key_info, sorter_distinct, |row| pipeline.put(row))?;
    }

    out.close();
    Ok(out)
}

struct Pipeline<'a> {
    spec: &'a OrderBySpec,
    out: Arc<ListFile>,
    ordbynum: InstnumState,
    prev_projected: Option<Vec<Value>>,
}

impl<'a> Pipeline<'a> {
    fn put(&mut self, row: Vec<Value>) -> Result<SinkPut> {
        // Gate first: the number counts sorted rows, not emitted ones
        if let Some(pred) = &self.spec.ordbynum_pred {
            let mut env = EvalEnv::new(&row);
            env.ordbynum = self.ordbynum.counter;
            let outcome = match eval_pred(pred, &env)? {
                Tri::True => {
                    self.ordbynum.counter += 1;
                    InstnumSignal::Qualified
                }
                _ => {
                    // A contiguous range that already produced a row is
                    // exhausted; earlier misses just skip.
                    let past_range = self.ordbynum.counter > 1
                        && self.produced_any();
                    self.ordbynum.counter += 1;
                    if past_range {
                        InstnumSignal::Stop
                    } else {
                        InstnumSignal::NotQualified
                    }
                }
            };
            match outcome {
                InstnumSignal::Stop => return Ok(SinkPut::Stop),
                InstnumSignal::NotQualified => return Ok(SinkPut::Continue),
                InstnumSignal::Qualified => {}
            }
        }

        let projected = match &self.spec.out_cols {
            Some(cols) => cols
                .iter()
                .map(|c| row.get(*c).cloned().unwrap_or(Value::Null))
                .collect(),
            None => row,
        };

        if self.spec.distinct && self.spec.out_cols.is_some() {
            if let Some(prev) = &self.prev_projected {
                if rows_equal(prev, &projected) {
                    return Ok(SinkPut::Continue);
                }
            }
            self.prev_projected = Some(projected.clone());
        }

        self.out.append_values(&projected)?;
        Ok(SinkPut::Continue)
    }

    fn produced_any(&self) -> bool {
        self.out.tuple_count() > 0
    }
}

fn rows_equal(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| sort_compare(x, y).map(|o| o == Ordering::Equal).unwrap_or(false))
}
