// # Regu Variables
//
// Expression trees evaluated against the current row binding. A regu
// variable reads a value-list slot, a prior-row slot (hierarchical
// queries), a pseudo-column counter, or a constant, and composes through
// arithmetic. Cross-tree references are slot indices, never pointers, so
// teardown owns nothing it must not free.

use crate::error::{DbError, Result};
use crate::runtime::value::{
    arith_add, arith_div, arith_mul, arith_neg, arith_sub, value_compare, CmpResult, Value,
};
use serde::{Deserialize, Serialize};

/// Interpreter-produced columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum PseudoCol {
    Level,
    ConnectByIsLeaf,
    ConnectByIsCycle,
    InstNum,
    OrdbyNum,
    GroupbyNum,
    /// List-file position of the parent row in a hierarchy
    ParentPos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
}

/// An expression node yielding a value against the current binding
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum ReguVar {
    Const(Value),
    /// Read a value-list slot
    Slot(usize),
    /// Read the prior (parent) row's value list
    PriorSlot(usize),
    Pseudo(PseudoCol),
    Arith {
        op: ArithOp,
        lhs: Box<ReguVar>,
        rhs: Option<Box<ReguVar>>,
    },
    /// Read a finalized aggregate accumulator
    AggRef(usize),
}

impl ReguVar {
    /// Rewrite slot reads into prior-list reads. Used when a PRIOR(expr)
    /// inside the connect-by predicate targets a caller-visible slot.
    pub fn rewrite_to_prior(&mut self) {
        match self {
            ReguVar::Slot(idx) => *self = ReguVar::PriorSlot(*idx),
            ReguVar::Arith { lhs, rhs, .. } => {
                lhs.rewrite_to_prior();
                if let Some(rhs) = rhs {
                    rhs.rewrite_to_prior();
                }
            }
            _ => {}
        }
    }

    /// Whether this expression is a compile-time constant
    pub fn is_constant(&self) -> bool {
        match self {
            ReguVar::Const(_) => true,
            ReguVar::Arith { lhs, rhs, .. } => {
                lhs.is_constant() && rhs.as_ref().map(|r| r.is_constant()).unwrap_or(true)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Three-valued predicate tree
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum PredExpr {
    True,
    Cmp { op: CmpOp, lhs: ReguVar, rhs: ReguVar },
    And(Vec<PredExpr>),
    Or(Vec<PredExpr>),
    Not(Box<PredExpr>),
    IsNull(ReguVar),
    IsNotNull(ReguVar),
    Between { value: ReguVar, low: ReguVar, high: ReguVar },
}

/// Three-valued logic outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tri {
    True,
    False,
    Unknown,
}

impl Tri {
    pub fn is_true(&self) -> bool {
        matches!(self, Tri::True)
    }
}

/// The binding a regu variable evaluates against
pub struct EvalEnv<'a> {
    pub slots: &'a [Value],
    pub prior: Option<&'a [Value]>,
    /// Finalized aggregate values, when evaluating output expressions
    pub aggs: Option<&'a [Value]>,
    pub instnum: i64,
    pub ordbynum: i64,
    pub groupbynum: i64,
    pub level: i64,
    pub isleaf: i64,
    pub iscycle: i64,
    pub parent_pos: i64,
}

impl<'a> EvalEnv<'a> {
    pub fn new(slots: &'a [Value]) -> Self {
        Self {
            slots,
            prior: None,
            aggs: None,
            instnum: 1,
            ordbynum: 1,
            groupbynum: 1,
            level: 0,
            isleaf: 0,
            iscycle: 0,
            parent_pos: -1,
        }
    }
}

/// Evaluate a regu variable against the current binding.
pub fn eval_regu(regu: &ReguVar, env: &EvalEnv) -> Result<Value> {
    match regu {
        ReguVar::Const(v) => Ok(v.clone()),
        ReguVar::Slot(idx) => env
            .slots
            .get(*idx)
            .cloned()
            .ok_or_else(|| DbError::Internal(format!("value list has no slot {}", idx))),
        ReguVar::PriorSlot(idx) => match env.prior {
            Some(prior) => prior.get(*idx).cloned().ok_or_else(|| {
                DbError::Internal(format!("prior value list has no slot {}", idx))
            }),
            // Outside a hierarchy PRIOR yields null
            None => Ok(Value::Null),
        },
        ReguVar::Pseudo(col) => Ok(match col {
            PseudoCol::Level => Value::Bigint(env.level),
            PseudoCol::ConnectByIsLeaf => Value::Bigint(env.isleaf),
            PseudoCol::ConnectByIsCycle => Value::Bigint(env.iscycle),
            PseudoCol::InstNum => Value::Bigint(env.instnum),
            PseudoCol::OrdbyNum => Value::Bigint(env.ordbynum),
            PseudoCol::GroupbyNum => Value::Bigint(env.groupbynum),
            PseudoCol::ParentPos => Value::Bigint(env.parent_pos),
        }),
        ReguVar::Arith { op, lhs, rhs } => {
            let l = eval_regu(lhs, env)?;
            match op {
                ArithOp::Neg => arith_neg(&l),
                _ => {
                    let rhs = rhs.as_ref().ok_or_else(|| {
                        DbError::Internal("binary arithmetic without right operand".to_string())
                    })?;
                    let r = eval_regu(rhs, env)?;
                    match op {
                        ArithOp::Add => arith_add(&l, &r),
                        ArithOp::Sub => arith_sub(&l, &r),
                        ArithOp::Mul => arith_mul(&l, &r),
                        ArithOp::Div => arith_div(&l, &r),
                        ArithOp::Mod => arith_mod(&l, &r),
                        ArithOp::Neg => unreachable!(),
                    }
                }
            }
        }
        ReguVar::AggRef(idx) => match env.aggs {
            Some(aggs) => aggs.get(*idx).cloned().ok_or_else(|| {
                DbError::Internal(format!("no aggregate accumulator {}", idx))
            }),
            None => Err(DbError::Internal(
                "aggregate reference outside an aggregation context".to_string(),
            )),
        },
    }
}

fn arith_mod(a: &Value, b: &Value) -> Result<Value> {
    if a.is_null() || b.is_null() {
        return Ok(Value::Null);
    }
    match (a, b) {
        (Value::Int(x), Value::Int(y)) if *y != 0 => Ok(Value::Int(x % y)),
        (Value::Bigint(x), Value::Bigint(y)) if *y != 0 => Ok(Value::Bigint(x % y)),
        (Value::Int(x), Value::Bigint(y)) if *y != 0 => Ok(Value::Bigint(*x as i64 % y)),
        (Value::Bigint(x), Value::Int(y)) if *y != 0 => Ok(Value::Bigint(x % *y as i64)),
        (_, Value::Int(0)) | (_, Value::Bigint(0)) => {
            Err(DbError::Execution("division by zero".to_string()))
        }
        _ => Err(DbError::Execution(format!("cannot take {:?} mod {:?}", a, b))),
    }
}

/// Evaluate a predicate under three-valued logic.
pub fn eval_pred(pred: &PredExpr, env: &EvalEnv) -> Result<Tri> {
    match pred {
        PredExpr::True => Ok(Tri::True),
        PredExpr::Cmp { op, lhs, rhs } => {
            let l = eval_regu(lhs, env)?;
            let r = eval_regu(rhs, env)?;
            Ok(match value_compare(&l, &r)? {
                CmpResult::Unknown => Tri::Unknown,
                cmp => tri_of(cmp_holds(*op, cmp)),
            })
        }
        PredExpr::And(parts) => {
            let mut result = Tri::True;
            for part in parts {
                match eval_pred(part, env)? {
                    Tri::False => return Ok(Tri::False),
                    Tri::Unknown => result = Tri::Unknown,
                    Tri::True => {}
                }
            }
            Ok(result)
        }
        PredExpr::Or(parts) => {
            let mut result = Tri::False;
            for part in parts {
                match eval_pred(part, env)? {
                    Tri::True => return Ok(Tri::True),
                    Tri::Unknown => result = Tri::Unknown,
                    Tri::False => {}
                }
            }
            Ok(result)
        }
        PredExpr::Not(inner) => Ok(match eval_pred(inner, env)? {
            Tri::True => Tri::False,
            Tri::False => Tri::True,
            Tri::Unknown => Tri::Unknown,
        }),
        PredExpr::IsNull(regu) => Ok(tri_of(eval_regu(regu, env)?.is_null())),
        PredExpr::IsNotNull(regu) => Ok(tri_of(!eval_regu(regu, env)?.is_null())),
        PredExpr::Between { value, low, high } => {
            let v = eval_regu(value, env)?;
            let lo = eval_regu(low, env)?;
            let hi = eval_regu(high, env)?;
            let above = value_compare(&v, &lo)?;
            let below = value_compare(&v, &hi)?;
            if above == CmpResult::Unknown || below == CmpResult::Unknown {
                return Ok(Tri::Unknown);
            }
            Ok(tri_of(
                above != CmpResult::Lt && below != CmpResult::Gt,
            ))
        }
    }
}

fn cmp_holds(op: CmpOp, cmp: CmpResult) -> bool {
    match op {
        CmpOp::Eq => cmp == CmpResult::Eq,
        CmpOp::Ne => cmp != CmpResult::Eq,
        CmpOp::Lt => cmp == CmpResult::Lt,
        CmpOp::Le => cmp != CmpResult::Gt,
        CmpOp::Gt => cmp == CmpResult::Gt,
        CmpOp::Ge => cmp != CmpResult::Lt,
    }
}

fn tri_of(b: bool) -> Tri {
    if b {
        Tri::True
    } else {
        Tri::False
    }
}

// Convenience constructors used by plan builders and tests

pub fn slot(idx: usize) -> ReguVar {
    ReguVar::Slot(idx)
}

pub fn constant(v: Value) -> ReguVar {
    ReguVar::Const(v)
}

pub fn cmp(op: CmpOp, lhs: ReguVar, rhs: ReguVar) -> PredExpr {
    PredExpr::Cmp { op, lhs, rhs }
}
