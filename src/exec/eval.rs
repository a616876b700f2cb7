// # Evaluation Helpers
//
// Aggregate accumulators shared by the value builder and group-by fold,
// and the instance-number gate with its three scan signals.

use crate::error::Result;
use crate::exec::regu::{eval_pred, eval_regu, EvalEnv, PredExpr, Tri};
use crate::exec::xasl::{AggFunc, AggSpec, InstnumMode};
use crate::runtime::value::{arith_add, sort_compare, Value};
use std::cmp::Ordering;

/// One aggregate in flight
pub struct AggAcc {
    spec: AggSpec,
    count: i64,
    sum: Option<Value>,
    min: Option<Value>,
    max: Option<Value>,
    /// Values already counted, for DISTINCT aggregates
    seen: Vec<Value>,
}

impl AggAcc {
    pub fn new(spec: &AggSpec) -> Self {
        Self {
            spec: spec.clone(),
            count: 0,
            sum: None,
            min: None,
            max: None,
            seen: Vec::new(),
        }
    }

    pub fn restart(&mut self) {
        self.count = 0;
        self.sum = None;
        self.min = None;
        self.max = None;
        self.seen.clear();
    }

    /// Fold one row into the accumulator.
    pub fn accumulate(&mut self, env: &EvalEnv) -> Result<()> {
        if matches!(self.spec.func, AggFunc::CountStar) {
            self.count += 1;
            return Ok(());
        }
        let operand = match &self.spec.operand {
            Some(regu) => eval_regu(regu, env)?,
            None => Value::Null,
        };
        if operand.is_null() {
            return Ok(());
        }
        if self.spec.distinct {
            let dup = self.seen.iter().any(|v| {
                sort_compare(v, &operand)
                    .map(|o| o == Ordering::Equal)
                    .unwrap_or(false)
            });
            if dup {
                return Ok(());
            }
            self.seen.push(operand.clone());
        }

        self.count += 1;
        match self.spec.func {
            AggFunc::Count | AggFunc::CountStar => {}
            AggFunc::Sum | AggFunc::Avg => {
                self.sum = Some(match self.sum.take() {
                    None => operand.clone(),
                    Some(sum) => arith_add(&sum, &operand)?,
                });
            }
            AggFunc::Min => {
                let replace = match &self.min {
                    None => true,
                    Some(cur) => sort_compare(&operand, cur)? == Ordering::Less,
                };
                if replace {
                    self.min = Some(operand.clone());
                }
            }
            AggFunc::Max => {
                let replace = match &self.max {
                    None => true,
                    Some(cur) => sort_compare(&operand, cur)? == Ordering::Greater,
                };
                if replace {
                    self.max = Some(operand.clone());
                }
            }
        }
        Ok(())
    }

    /// Close the group and produce the aggregate value.
    pub fn finalize(&self) -> Result<Value> {
        Ok(match self.spec.func {
            AggFunc::CountStar | AggFunc::Count => Value::Bigint(self.count),
            AggFunc::Sum => self.sum.clone().unwrap_or(Value::Null),
            AggFunc::Avg => match &self.sum {
                None => Value::Null,
                Some(sum) => {
                    let total = match sum {
                        Value::Bigint(v) => *v as f64,
                        Value::Int(v) => *v as f64,
                        Value::Short(v) => *v as f64,
                        Value::Double(v) => *v,
                        Value::Float(v) => *v as f64,
                        other => {
                            return Err(crate::error::DbError::Execution(format!(
                                "cannot average {:?}",
                                other
                            )))
                        }
                    };
                    Value::Double(total / self.count as f64)
                }
            },
            AggFunc::Min => self.min.clone().unwrap_or(Value::Null),
            AggFunc::Max => self.max.clone().unwrap_or(Value::Null),
        })
    }
}

/// What the instance-number gate decided for the current row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstnumSignal {
    Qualified,
    NotQualified,
    /// No further row can qualify; short-circuit the scan
    Stop,
}

/// Per-scan instance-number state
pub struct InstnumState {
    pub counter: i64,
    seen_true: bool,
}

impl InstnumState {
    pub fn new() -> Self {
        Self { counter: 1, seen_true: false }
    }

    /// Evaluate the gate for the row about to be emitted, then advance the
    /// counter. The mode decides whether a false outcome ends the scan.
    pub fn evaluate(
        &mut self,
        pred: &Option<PredExpr>,
        mode: InstnumMode,
        env: &mut EvalEnv,
    ) -> Result<InstnumSignal> {
        env.instnum = self.counter;
        let outcome = match pred {
            None => Tri::True,
            Some(p) => eval_pred(p, env)?,
        };
        self.counter += 1;

        Ok(match outcome {
            Tri::True => {
                self.seen_true = true;
                InstnumSignal::Qualified
            }
            Tri::False | Tri::Unknown => match mode {
                InstnumMode::Continue => InstnumSignal::NotQualified,
                InstnumMode::Stop => InstnumSignal::Stop,
                InstnumMode::Check => {
                    if self.seen_true {
                        InstnumSignal::Stop
                    } else {
                        InstnumSignal::NotQualified
                    }
                }
            },
        })
    }
}

impl Default for InstnumState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::regu::{cmp, constant, CmpOp, PseudoCol, ReguVar};

    fn agg(func: AggFunc, operand: Option<ReguVar>, distinct: bool) -> AggSpec {
        AggSpec { func, operand, distinct }
    }

    #[test]
    fn test_count_star_counts_nulls() {
        let mut acc = AggAcc::new(&agg(AggFunc::CountStar, None, false));
        let slots = vec![Value::Null];
        let env = EvalEnv::new(&slots);
        acc.accumulate(&env).unwrap();
        acc.accumulate(&env).unwrap();
        assert!(matches!(acc.finalize().unwrap(), Value::Bigint(2)));
    }

    #[test]
    fn test_count_skips_nulls() {
        let mut acc = AggAcc::new(&agg(AggFunc::Count, Some(ReguVar::Slot(0)), false));
        for v in [Value::Int(1), Value::Null, Value::Int(2)] {
            let slots = vec![v];
            acc.accumulate(&EvalEnv::new(&slots)).unwrap();
        }
        assert!(matches!(acc.finalize().unwrap(), Value::Bigint(2)));
    }

    #[test]
    fn test_sum_avg_min_max() {
        let specs = [
            agg(AggFunc::Sum, Some(ReguVar::Slot(0)), false),
            agg(AggFunc::Avg, Some(ReguVar::Slot(0)), false),
            agg(AggFunc::Min, Some(ReguVar::Slot(0)), false),
            agg(AggFunc::Max, Some(ReguVar::Slot(0)), false),
        ];
        let mut accs: Vec<AggAcc> = specs.iter().map(AggAcc::new).collect();
        for v in [10, 20, 30] {
            let slots = vec![Value::Int(v)];
            let env = EvalEnv::new(&slots);
            for acc in &mut accs {
                acc.accumulate(&env).unwrap();
            }
        }
        assert!(matches!(accs[0].finalize().unwrap(), Value::Bigint(60)));
        match accs[1].finalize().unwrap() {
            Value::Double(v) => assert!((v - 20.0).abs() < 1e-9),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(accs[2].finalize().unwrap(), Value::Int(10)));
        assert!(matches!(accs[3].finalize().unwrap(), Value::Int(30)));
    }

    #[test]
    fn test_distinct_sum() {
        let mut acc = AggAcc::new(&agg(AggFunc::Sum, Some(ReguVar::Slot(0)), true));
        for v in [5, 5, 7] {
            let slots = vec![Value::Int(v)];
            acc.accumulate(&EvalEnv::new(&slots)).unwrap();
        }
        assert!(matches!(acc.finalize().unwrap(), Value::Bigint(12)));
    }

    #[test]
    fn test_empty_aggregates() {
        let acc = AggAcc::new(&agg(AggFunc::Sum, Some(ReguVar::Slot(0)), false));
        assert!(acc.finalize().unwrap().is_null());
        let count = AggAcc::new(&agg(AggFunc::Count, Some(ReguVar::Slot(0)), false));
        assert!(matches!(count.finalize().unwrap(), Value::Bigint(0)));
    }

    fn instnum_le(n: i64) -> Option<PredExpr> {
        Some(cmp(
            CmpOp::Le,
            ReguVar::Pseudo(PseudoCol::InstNum),
            constant(Value::Bigint(n)),
        ))
    }

    #[test]
    fn test_instnum_stop_short_circuits() {
        let slots = vec![];
        let mut env = EvalEnv::new(&slots);
        let pred = instnum_le(2);
        let mut state = InstnumState::new();
        assert_eq!(
            state.evaluate(&pred, InstnumMode::Stop, &mut env).unwrap(),
            InstnumSignal::Qualified
        );
        assert_eq!(
            state.evaluate(&pred, InstnumMode::Stop, &mut env).unwrap(),
            InstnumSignal::Qualified
        );
        assert_eq!(
            state.evaluate(&pred, InstnumMode::Stop, &mut env).unwrap(),
            InstnumSignal::Stop
        );
    }

    #[test]
    fn test_instnum_check_mode_waits_for_first_true() {
        let slots = vec![];
        let mut env = EvalEnv::new(&slots);
        // inst_num() between 2 and 3
        let pred = Some(PredExpr::Between {
            value: ReguVar::Pseudo(PseudoCol::InstNum),
            low: constant(Value::Bigint(2)),
            high: constant(Value::Bigint(3)),
        });
        let mut state = InstnumState::new();
        assert_eq!(
            state.evaluate(&pred, InstnumMode::Check, &mut env).unwrap(),
            InstnumSignal::NotQualified
        );
        assert_eq!(
            state.evaluate(&pred, InstnumMode::Check, &mut env).unwrap(),
            InstnumSignal::Qualified
        );
        assert_eq!(
            state.evaluate(&pred, InstnumMode::Check, &mut env).unwrap(),
            InstnumSignal::Qualified
        );
        assert_eq!(
            state.evaluate(&pred, InstnumMode::Check, &mut env).unwrap(),
            InstnumSignal::Stop
        );
    }

    #[test]
    fn test_instnum_continue_never_stops() {
        let slots = vec![];
        let mut env = EvalEnv::new(&slots);
        let pred = instnum_le(1);
        let mut state = InstnumState::new();
        state.evaluate(&pred, InstnumMode::Continue, &mut env).unwrap();
        assert_eq!(
            state.evaluate(&pred, InstnumMode::Continue, &mut env).unwrap(),
            InstnumSignal::NotQualified
        );
    }
}
