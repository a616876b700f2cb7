// # Typed Values
//
// The tagged value union used throughout the execution engine. Every value
// travels with its domain (type + precision/scale/collation); comparisons
// follow three-valued logic, with a separate total order for sort keys.

use crate::common::Oid;
use crate::error::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Scalar and collection type tags
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash,
    Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum ValueType {
    Short,
    Int,
    Bigint,
    Float,
    Double,
    Numeric,
    String,
    Date,
    Time,
    Timestamp,
    Oid,
    Set,
    Multiset,
    Sequence,
    Vobj,
}

/// A value's declared domain
#[derive(
    Debug, Clone, Copy, PartialEq, Eq,
    Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Domain {
    pub ty: ValueType,
    pub precision: u16,
    pub scale: u8,
    pub collation: u32,
}

impl Domain {
    pub fn new(ty: ValueType) -> Self {
        Self { ty, precision: 0, scale: 0, collation: 0 }
    }

    pub fn with_precision(ty: ValueType, precision: u16, scale: u8) -> Self {
        Self { ty, precision, scale, collation: 0 }
    }

    pub fn int() -> Self {
        Self::new(ValueType::Int)
    }

    pub fn bigint() -> Self {
        Self::new(ValueType::Bigint)
    }

    pub fn double() -> Self {
        Self::new(ValueType::Double)
    }

    pub fn string() -> Self {
        Self::new(ValueType::String)
    }

    pub fn oid() -> Self {
        Self::new(ValueType::Oid)
    }

    /// Fixed-width domains support in-place tuple rewrites
    pub fn is_fixed_width(&self) -> bool {
        self.fixed_width().is_some()
    }

    /// Encoded payload size for fixed-width domains
    pub fn fixed_width(&self) -> Option<usize> {
        match self.ty {
            ValueType::Short => Some(2),
            ValueType::Int | ValueType::Float | ValueType::Date | ValueType::Time => Some(4),
            ValueType::Bigint | ValueType::Double | ValueType::Timestamp => Some(8),
            ValueType::Oid => Some(8),
            ValueType::Vobj => Some(16),
            _ => None,
        }
    }
}

/// The value union. A set element may itself be null.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum Value {
    Null,
    Short(i16),
    Int(i32),
    Bigint(i64),
    Float(f32),
    Double(f64),
    /// Decimal with an unscaled integer and a power-of-ten scale
    Numeric { unscaled: i128, scale: u8 },
    Str(String),
    /// Days since epoch
    Date(i32),
    /// Seconds since midnight
    Time(i32),
    /// Seconds since epoch
    Timestamp(i64),
    Oid(Oid),
    Set(Vec<Value>),
    Multiset(Vec<Value>),
    Sequence(Vec<Value>),
    /// Virtual object: (proxy class, real instance)
    Vobj { proxy: Oid, real: Oid },
}

/// Comparison outcome under three-valued logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpResult {
    Lt,
    Eq,
    Gt,
    /// At least one side is null; never equal, not ordered
    Unknown,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The discriminant's natural type, where one exists
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Null => None,
            Value::Short(_) => Some(ValueType::Short),
            Value::Int(_) => Some(ValueType::Int),
            Value::Bigint(_) => Some(ValueType::Bigint),
            Value::Float(_) => Some(ValueType::Float),
            Value::Double(_) => Some(ValueType::Double),
            Value::Numeric { .. } => Some(ValueType::Numeric),
            Value::Str(_) => Some(ValueType::String),
            Value::Date(_) => Some(ValueType::Date),
            Value::Time(_) => Some(ValueType::Time),
            Value::Timestamp(_) => Some(ValueType::Timestamp),
            Value::Oid(_) => Some(ValueType::Oid),
            Value::Set(_) => Some(ValueType::Set),
            Value::Multiset(_) => Some(ValueType::Multiset),
            Value::Sequence(_) => Some(ValueType::Sequence),
            Value::Vobj { .. } => Some(ValueType::Vobj),
        }
    }

    /// A value conforms to a domain when null or matching its type tag
    pub fn conforms_to(&self, domain: &Domain) -> bool {
        match self.value_type() {
            None => true,
            Some(ty) => ty == domain.ty,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Short(v) => Some(*v as f64),
            Value::Int(v) => Some(*v as f64),
            Value::Bigint(v) => Some(*v as f64),
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::Numeric { unscaled, scale } => {
                Some(*unscaled as f64 / 10f64.powi(*scale as i32))
            }
            _ => None,
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Short(v) => Some(*v as i128),
            Value::Int(v) => Some(*v as i128),
            Value::Bigint(v) => Some(*v as i128),
            _ => None,
        }
    }

    fn is_numeric_family(&self) -> bool {
        matches!(
            self,
            Value::Short(_)
                | Value::Int(_)
                | Value::Bigint(_)
                | Value::Float(_)
                | Value::Double(_)
                | Value::Numeric { .. }
        )
    }
}

/// Three-valued comparison. Null on either side yields `Unknown`:
/// `compare(null, null) != Eq` always holds.
pub fn value_compare(a: &Value, b: &Value) -> Result<CmpResult> {
    if a.is_null() || b.is_null() {
        return Ok(CmpResult::Unknown);
    }
    let ord = ordered_compare(a, b)?;
    Ok(match ord {
        Ordering::Less => CmpResult::Lt,
        Ordering::Equal => CmpResult::Eq,
        Ordering::Greater => CmpResult::Gt,
    })
}

/// Total order for sort keys: null sorts below every non-null value, and two
/// nulls are adjacent. Equality between nulls here is an ordering artifact
/// only; predicate and merge-key equality goes through `value_compare`.
pub fn sort_compare(a: &Value, b: &Value) -> Result<Ordering> {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ok(Ordering::Equal),
        (true, false) => Ok(Ordering::Less),
        (false, true) => Ok(Ordering::Greater),
        (false, false) => ordered_compare(a, b),
    }
}

fn ordered_compare(a: &Value, b: &Value) -> Result<Ordering> {
    // Numeric families compare cross-type through widening
    if a.is_numeric_family() && b.is_numeric_family() {
        if let (Some(x), Some(y)) = (a.as_i128(), b.as_i128()) {
            return Ok(x.cmp(&y));
        }
        let x = a.as_f64().ok_or_else(|| incomparable(a, b))?;
        let y = b.as_f64().ok_or_else(|| incomparable(a, b))?;
        return x.partial_cmp(&y).ok_or_else(|| incomparable(a, b));
    }

    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Ok(x.as_str().cmp(y.as_str())),
        (Value::Date(x), Value::Date(y)) => Ok(x.cmp(y)),
        (Value::Time(x), Value::Time(y)) => Ok(x.cmp(y)),
        (Value::Timestamp(x), Value::Timestamp(y)) => Ok(x.cmp(y)),
        (Value::Oid(x), Value::Oid(y)) => Ok(x.cmp(y)),
        (Value::Vobj { proxy: px, real: rx }, Value::Vobj { proxy: py, real: ry }) => {
            Ok((px, rx).cmp(&(py, ry)))
        }
        (Value::Sequence(x), Value::Sequence(y)) => seq_compare(x, y),
        _ => Err(incomparable(a, b)),
    }
}

fn seq_compare(a: &[Value], b: &[Value]) -> Result<Ordering> {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = sort_compare(x, y)?;
        if ord != Ordering::Equal {
            return Ok(ord);
        }
    }
    Ok(a.len().cmp(&b.len()))
}

fn incomparable(a: &Value, b: &Value) -> DbError {
    DbError::Execution(format!("incomparable values: {:?} vs {:?}", a, b))
}

// ============================================================================
// Arithmetic - null-propagating, used by aggregates and SELUPD increments
// ============================================================================

pub fn arith_add(a: &Value, b: &Value) -> Result<Value> {
    numeric_binop(a, b, i128::checked_add, |x, y| x + y)
}

pub fn arith_sub(a: &Value, b: &Value) -> Result<Value> {
    numeric_binop(a, b, i128::checked_sub, |x, y| x - y)
}

pub fn arith_mul(a: &Value, b: &Value) -> Result<Value> {
    numeric_binop(a, b, i128::checked_mul, |x, y| x * y)
}

pub fn arith_div(a: &Value, b: &Value) -> Result<Value> {
    if a.is_null() || b.is_null() {
        return Ok(Value::Null);
    }
    let y = b.as_f64().ok_or_else(|| incomparable(a, b))?;
    if y == 0.0 {
        return Err(DbError::Execution("division by zero".to_string()));
    }
    let x = a.as_f64().ok_or_else(|| incomparable(a, b))?;
    Ok(Value::Double(x / y))
}

pub fn arith_neg(a: &Value) -> Result<Value> {
    match a {
        Value::Null => Ok(Value::Null),
        Value::Short(v) => Ok(Value::Short(-v)),
        Value::Int(v) => Ok(Value::Int(-v)),
        Value::Bigint(v) => Ok(Value::Bigint(-v)),
        Value::Float(v) => Ok(Value::Float(-v)),
        Value::Double(v) => Ok(Value::Double(-v)),
        Value::Numeric { unscaled, scale } => Ok(Value::Numeric { unscaled: -unscaled, scale: *scale }),
        other => Err(DbError::Execution(format!("cannot negate {:?}", other))),
    }
}

fn numeric_binop(
    a: &Value,
    b: &Value,
    int_op: fn(i128, i128) -> Option<i128>,
    f_op: fn(f64, f64) -> f64,
) -> Result<Value> {
    if a.is_null() || b.is_null() {
        return Ok(Value::Null);
    }
    if let (Some(x), Some(y)) = (a.as_i128(), b.as_i128()) {
        let r = int_op(x, y)
            .ok_or_else(|| DbError::Execution("integer overflow".to_string()))?;
        if r >= i64::MIN as i128 && r <= i64::MAX as i128 {
            return Ok(Value::Bigint(r as i64));
        }
        return Err(DbError::Execution("integer overflow".to_string()));
    }
    let x = a.as_f64().ok_or_else(|| incomparable(a, b))?;
    let y = b.as_f64().ok_or_else(|| incomparable(a, b))?;
    Ok(Value::Double(f_op(x, y)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_never_equal() {
        assert_eq!(value_compare(&Value::Null, &Value::Null).unwrap(), CmpResult::Unknown);
        assert_eq!(value_compare(&Value::Null, &Value::Int(1)).unwrap(), CmpResult::Unknown);
    }

    #[test]
    fn test_sort_order_nulls_low() {
        assert_eq!(sort_compare(&Value::Null, &Value::Int(i32::MIN)).unwrap(), Ordering::Less);
        assert_eq!(sort_compare(&Value::Int(1), &Value::Null).unwrap(), Ordering::Greater);
        assert_eq!(sort_compare(&Value::Null, &Value::Null).unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_cross_type_numeric_compare() {
        assert_eq!(
            value_compare(&Value::Int(3), &Value::Double(3.0)).unwrap(),
            CmpResult::Eq
        );
        assert_eq!(
            value_compare(&Value::Short(2), &Value::Bigint(10)).unwrap(),
            CmpResult::Lt
        );
        assert_eq!(
            value_compare(
                &Value::Numeric { unscaled: 250, scale: 2 },
                &Value::Double(2.5)
            )
            .unwrap(),
            CmpResult::Eq
        );
    }

    #[test]
    fn test_arith_null_propagates() {
        assert!(arith_add(&Value::Null, &Value::Int(1)).unwrap().is_null());
    }

    #[test]
    fn test_arith_add_widens() {
        match arith_add(&Value::Int(1), &Value::Int(2)).unwrap() {
            Value::Bigint(3) => {}
            other => panic!("unexpected {:?}", other),
        }
        match arith_add(&Value::Int(1), &Value::Double(0.5)).unwrap() {
            Value::Double(v) => assert!((v - 1.5).abs() < 1e-9),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_division_by_zero() {
        assert!(arith_div(&Value::Int(1), &Value::Int(0)).is_err());
    }

    #[test]
    fn test_domain_conformance() {
        assert!(Value::Int(5).conforms_to(&Domain::int()));
        assert!(Value::Null.conforms_to(&Domain::int()));
        assert!(!Value::Str("x".into()).conforms_to(&Domain::int()));
    }

    #[test]
    fn test_fixed_width() {
        assert_eq!(Domain::int().fixed_width(), Some(4));
        assert_eq!(Domain::bigint().fixed_width(), Some(8));
        assert!(Domain::string().fixed_width().is_none());
    }
}
