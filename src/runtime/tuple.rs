// # Binary Tuple Codec
//
// Tuples are sequences of values matching a type list. The encoded form
// carries a 4-byte big-endian length header per value; a zero length encodes
// null. Fixed-width payloads can be rewritten in place.

use crate::common::Oid;
use crate::error::{DbError, Result};
use crate::runtime::value::{Domain, Value, ValueType};
use bytes::{BufMut, BytesMut};

/// The schema of a tuple: one domain per column
pub type TypeList = Vec<Domain>;

/// Header bytes per value
pub const VALUE_HEADER_SIZE: usize = 4;

// Tags for self-describing collection elements
const TAG_NULL: u8 = 0;
const TAG_SHORT: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_BIGINT: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_DOUBLE: u8 = 5;
const TAG_NUMERIC: u8 = 6;
const TAG_STR: u8 = 7;
const TAG_DATE: u8 = 8;
const TAG_TIME: u8 = 9;
const TAG_TIMESTAMP: u8 = 10;
const TAG_OID: u8 = 11;
const TAG_SET: u8 = 12;
const TAG_MULTISET: u8 = 13;
const TAG_SEQUENCE: u8 = 14;
const TAG_VOBJ: u8 = 15;

/// Encode a tuple against its type list. Fails on a domain mismatch.
pub fn encode_tuple(values: &[Value], types: &TypeList) -> Result<Vec<u8>> {
    if values.len() != types.len() {
        return Err(DbError::Execution(format!(
            "tuple arity {} does not match type list arity {}",
            values.len(),
            types.len()
        )));
    }
    let mut out = BytesMut::new();
    for (value, domain) in values.iter().zip(types.iter()) {
        if !value.conforms_to(domain) {
            return Err(DbError::Execution(format!(
                "value {:?} does not conform to domain {:?}",
                value, domain
            )));
        }
        if value.is_null() {
            out.put_u32(0);
            continue;
        }
        let payload = encode_payload(value)?;
        out.put_u32(payload.len() as u32);
        out.extend_from_slice(&payload);
    }
    Ok(out.to_vec())
}

/// Decode a full tuple
pub fn decode_tuple(bytes: &[u8], types: &TypeList) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(types.len());
    let mut pos = 0usize;
    for domain in types {
        let (slice, next) = read_field(bytes, pos)?;
        pos = next;
        match slice {
            None => values.push(Value::Null),
            Some(payload) => values.push(decode_payload(domain.ty, payload)?),
        }
    }
    if pos != bytes.len() {
        return Err(DbError::Execution("trailing bytes after last tuple value".to_string()));
    }
    Ok(values)
}

/// Raw access to one column's payload: `None` means null.
pub fn tuple_value_at(bytes: &[u8], column: usize) -> Result<Option<&[u8]>> {
    let mut pos = 0usize;
    let mut col = 0usize;
    while pos < bytes.len() {
        let (slice, next) = read_field(bytes, pos)?;
        if col == column {
            return Ok(slice);
        }
        pos = next;
        col += 1;
    }
    Err(DbError::Execution(format!("tuple has no column {}", column)))
}

/// In-place rewrite of a fixed-width, non-null column.
pub fn tuple_set_value(bytes: &mut [u8], column: usize, value: &Value, domain: &Domain) -> Result<()> {
    let width = domain.fixed_width().ok_or_else(|| {
        DbError::InvalidInput(format!("domain {:?} is not fixed-width", domain))
    })?;
    if value.is_null() {
        return Err(DbError::InvalidInput(
            "cannot set null in place; the length header would change".to_string(),
        ));
    }
    if !value.conforms_to(domain) {
        return Err(DbError::Execution(format!(
            "value {:?} does not conform to domain {:?}",
            value, domain
        )));
    }

    let mut pos = 0usize;
    let mut col = 0usize;
    while pos < bytes.len() {
        let len = field_len(bytes, pos)?;
        if col == column {
            if len != width {
                return Err(DbError::Execution(format!(
                    "column {} holds {} bytes, expected fixed width {}",
                    column, len, width
                )));
            }
            let payload = encode_payload(value)?;
            bytes[pos + VALUE_HEADER_SIZE..pos + VALUE_HEADER_SIZE + width]
                .copy_from_slice(&payload);
            return Ok(());
        }
        pos += VALUE_HEADER_SIZE + len;
        col += 1;
    }
    Err(DbError::Execution(format!("tuple has no column {}", column)))
}

fn field_len(bytes: &[u8], pos: usize) -> Result<usize> {
    if pos + VALUE_HEADER_SIZE > bytes.len() {
        return Err(DbError::Execution("truncated tuple value header".to_string()));
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&bytes[pos..pos + VALUE_HEADER_SIZE]);
    Ok(u32::from_be_bytes(len_bytes) as usize)
}

fn read_field(bytes: &[u8], pos: usize) -> Result<(Option<&[u8]>, usize)> {
    let len = field_len(bytes, pos)?;
    let start = pos + VALUE_HEADER_SIZE;
    if len == 0 {
        return Ok((None, start));
    }
    if start + len > bytes.len() {
        return Err(DbError::Execution("truncated tuple value payload".to_string()));
    }
    Ok((Some(&bytes[start..start + len]), start + len))
}

fn encode_payload(value: &Value) -> Result<Vec<u8>> {
    let mut out = BytesMut::new();
    match value {
        Value::Null => unreachable!("null encodes as a zero-length header"),
        Value::Short(v) => out.put_i16(*v),
        Value::Int(v) => out.put_i32(*v),
        Value::Bigint(v) => out.put_i64(*v),
        Value::Float(v) => out.put_f32(*v),
        Value::Double(v) => out.put_f64(*v),
        Value::Numeric { unscaled, scale } => {
            out.put_i128(*unscaled);
            out.put_u8(*scale);
        }
        Value::Str(s) => out.extend_from_slice(s.as_bytes()),
        Value::Date(v) | Value::Time(v) => out.put_i32(*v),
        Value::Timestamp(v) => out.put_i64(*v),
        Value::Oid(oid) => put_oid(&mut out, oid),
        Value::Vobj { proxy, real } => {
            put_oid(&mut out, proxy);
            put_oid(&mut out, real);
        }
        Value::Set(items) | Value::Multiset(items) | Value::Sequence(items) => {
            out.put_u32(items.len() as u32);
            for item in items {
                encode_tagged(&mut out, item)?;
            }
        }
    }
    Ok(out.to_vec())
}

fn decode_payload(ty: ValueType, bytes: &[u8]) -> Result<Value> {
    match ty {
        ValueType::Short => Ok(Value::Short(i16::from_be_bytes(fixed(bytes)?))),
        ValueType::Int => Ok(Value::Int(i32::from_be_bytes(fixed(bytes)?))),
        ValueType::Bigint => Ok(Value::Bigint(i64::from_be_bytes(fixed(bytes)?))),
        ValueType::Float => Ok(Value::Float(f32::from_be_bytes(fixed(bytes)?))),
        ValueType::Double => Ok(Value::Double(f64::from_be_bytes(fixed(bytes)?))),
        ValueType::Numeric => {
            if bytes.len() != 17 {
                return Err(DbError::Execution("bad numeric payload".to_string()));
            }
            let unscaled = i128::from_be_bytes(fixed(&bytes[..16])?);
            Ok(Value::Numeric { unscaled, scale: bytes[16] })
        }
        ValueType::String => Ok(Value::Str(
            String::from_utf8(bytes.to_vec())
                .map_err(|_| DbError::Execution("non-UTF8 string payload".to_string()))?,
        )),
        ValueType::Date => Ok(Value::Date(i32::from_be_bytes(fixed(bytes)?))),
        ValueType::Time => Ok(Value::Time(i32::from_be_bytes(fixed(bytes)?))),
        ValueType::Timestamp => Ok(Value::Timestamp(i64::from_be_bytes(fixed(bytes)?))),
        ValueType::Oid => Ok(Value::Oid(get_oid(bytes)?)),
        ValueType::Vobj => {
            if bytes.len() != 16 {
                return Err(DbError::Execution("bad vobj payload".to_string()));
            }
            Ok(Value::Vobj { proxy: get_oid(&bytes[..8])?, real: get_oid(&bytes[8..])? })
        }
        ValueType::Set | ValueType::Multiset | ValueType::Sequence => {
            if bytes.len() < 4 {
                return Err(DbError::Execution("bad collection payload".to_string()));
            }
            let count = u32::from_be_bytes(fixed(&bytes[..4])?) as usize;
            let mut items = Vec::with_capacity(count);
            let mut pos = 4usize;
            for _ in 0..count {
                let (item, next) = decode_tagged(bytes, pos)?;
                items.push(item);
                pos = next;
            }
            Ok(match ty {
                ValueType::Set => Value::Set(items),
                ValueType::Multiset => Value::Multiset(items),
                _ => Value::Sequence(items),
            })
        }
    }
}

fn encode_tagged(out: &mut BytesMut, value: &Value) -> Result<()> {
    match value {
        Value::Null => out.put_u8(TAG_NULL),
        _ => {
            out.put_u8(value_tag(value));
            let payload = encode_payload(value)?;
            out.put_u32(payload.len() as u32);
            out.extend_from_slice(&payload);
        }
    }
    Ok(())
}

fn decode_tagged(bytes: &[u8], pos: usize) -> Result<(Value, usize)> {
    let tag = *bytes
        .get(pos)
        .ok_or_else(|| DbError::Execution("truncated collection element".to_string()))?;
    if tag == TAG_NULL {
        return Ok((Value::Null, pos + 1));
    }
    let len = field_len(bytes, pos + 1)? as usize;
    let start = pos + 1 + VALUE_HEADER_SIZE;
    if start + len > bytes.len() {
        return Err(DbError::Execution("truncated collection element".to_string()));
    }
    let ty = tag_type(tag)?;
    let value = decode_payload(ty, &bytes[start..start + len])?;
    Ok((value, start + len))
}

fn value_tag(value: &Value) -> u8 {
    match value {
        Value::Null => TAG_NULL,
        Value::Short(_) => TAG_SHORT,
        Value::Int(_) => TAG_INT,
        Value::Bigint(_) => TAG_BIGINT,
        Value::Float(_) => TAG_FLOAT,
        Value::Double(_) => TAG_DOUBLE,
        Value::Numeric { .. } => TAG_NUMERIC,
        Value::Str(_) => TAG_STR,
        Value::Date(_) => TAG_DATE,
        Value::Time(_) => TAG_TIME,
        Value::Timestamp(_) => TAG_TIMESTAMP,
        Value::Oid(_) => TAG_OID,
        Value::Set(_) => TAG_SET,
        Value::Multiset(_) => TAG_MULTISET,
        Value::Sequence(_) => TAG_SEQUENCE,
        Value::Vobj { .. } => TAG_VOBJ,
    }
}

fn tag_type(tag: u8) -> Result<ValueType> {
    Ok(match tag {
        TAG_SHORT => ValueType::Short,
        TAG_INT => ValueType::Int,
        TAG_BIGINT => ValueType::Bigint,
        TAG_FLOAT => ValueType::Float,
        TAG_DOUBLE => ValueType::Double,
        TAG_NUMERIC => ValueType::Numeric,
        TAG_STR => ValueType::String,
        TAG_DATE => ValueType::Date,
        TAG_TIME => ValueType::Time,
        TAG_TIMESTAMP => ValueType::Timestamp,
        TAG_OID => ValueType::Oid,
        TAG_SET => ValueType::Set,
        TAG_MULTISET => ValueType::Multiset,
        TAG_SEQUENCE => ValueType::Sequence,
        TAG_VOBJ => ValueType::Vobj,
        other => {
            return Err(DbError::Execution(format!("unknown value tag {}", other)))
        }
    })
}

fn put_oid(out: &mut BytesMut, oid: &Oid) {
    out.put_u16(oid.volid);
    out.put_u32(oid.pageid);
    out.put_u16(oid.slotid);
}

fn get_oid(bytes: &[u8]) -> Result<Oid> {
    if bytes.len() < 8 {
        return Err(DbError::Execution("bad oid payload".to_string()));
    }
    Ok(Oid {
        volid: u16::from_be_bytes(fixed(&bytes[..2])?),
        pageid: u32::from_be_bytes(fixed(&bytes[2..6])?),
        slotid: u16::from_be_bytes(fixed(&bytes[6..8])?),
    })
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| DbError::Execution("bad fixed-width payload".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types() -> TypeList {
        vec![Domain::int(), Domain::string(), Domain::double()]
    }

    #[test]
    fn test_round_trip() {
        let values = vec![Value::Int(7), Value::Str("abc".into()), Value::Double(1.5)];
        let bytes = encode_tuple(&values, &types()).unwrap();
        let decoded = decode_tuple(&bytes, &types()).unwrap();
        assert_eq!(format!("{:?}", decoded), format!("{:?}", values));
    }

    #[test]
    fn test_null_is_zero_length() {
        let values = vec![Value::Null, Value::Str("x".into()), Value::Null];
        let bytes = encode_tuple(&values, &types()).unwrap();
        assert!(tuple_value_at(&bytes, 0).unwrap().is_none());
        assert_eq!(tuple_value_at(&bytes, 1).unwrap().unwrap(), b"x");
        assert!(tuple_value_at(&bytes, 2).unwrap().is_none());
    }

    #[test]
    fn test_in_place_set_fixed_width() {
        let values = vec![Value::Int(7), Value::Str("abc".into()), Value::Double(0.0)];
        let mut bytes = encode_tuple(&values, &types()).unwrap();
        tuple_set_value(&mut bytes, 0, &Value::Int(42), &Domain::int()).unwrap();
        let decoded = decode_tuple(&bytes, &types()).unwrap();
        assert!(matches!(decoded[0], Value::Int(42)));
    }

    #[test]
    fn test_in_place_set_rejects_variable_width() {
        let values = vec![Value::Int(7), Value::Str("abc".into()), Value::Double(0.0)];
        let mut bytes = encode_tuple(&values, &types()).unwrap();
        assert!(
            tuple_set_value(&mut bytes, 1, &Value::Str("xy".into()), &Domain::string()).is_err()
        );
    }

    #[test]
    fn test_collection_with_null_element() {
        let types = vec![Domain::new(ValueType::Set)];
        let values = vec![Value::Set(vec![Value::Int(1), Value::Null, Value::Str("s".into())])];
        let bytes = encode_tuple(&values, &types).unwrap();
        let decoded = decode_tuple(&bytes, &types).unwrap();
        match &decoded[0] {
            Value::Set(items) => {
                assert_eq!(items.len(), 3);
                assert!(items[1].is_null());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_domain_mismatch_rejected() {
        let values = vec![Value::Str("oops".into()), Value::Null, Value::Null];
        assert!(encode_tuple(&values, &types()).is_err());
    }
}
