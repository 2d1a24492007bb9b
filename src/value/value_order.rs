//! Total ordering and equality across value types.
//!
//! Types sort as: null, booleans, numbers, timestamps, pending server
//! timestamps, strings, bytes, references, geo points, arrays, maps.
//! Integers and doubles share one numeric space; NaN sorts before every
//! other number and equals itself.

use std::cmp::Ordering;

use crate::value::{Value, ValueKind};

pub(crate) fn type_order(value: &Value) -> u8 {
    match value.kind() {
        ValueKind::Null => 0,
        ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 2,
        ValueKind::Timestamp(_) => 3,
        ValueKind::ServerTimestamp { .. } => 4,
        ValueKind::String(_) => 5,
        ValueKind::Bytes(_) => 6,
        ValueKind::Reference(_) => 7,
        ValueKind::GeoPoint(_) => 8,
        ValueKind::Array(_) => 9,
        ValueKind::Map(_) => 10,
        ValueKind::Sentinel(_) => 11,
    }
}

pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    let by_type = type_order(left).cmp(&type_order(right));
    if by_type != Ordering::Equal {
        return by_type;
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Double(r)) => compare_mixed(*l, *r),
        (ValueKind::Double(l), ValueKind::Integer(r)) => compare_mixed(*r, *l).reverse(),
        (ValueKind::Double(l), ValueKind::Double(r)) => compare_doubles(*l, *r),
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
        (
            ValueKind::ServerTimestamp {
                local_write_time: l,
                ..
            },
            ValueKind::ServerTimestamp {
                local_write_time: r,
                ..
            },
        ) => l.cmp(r),
        (ValueKind::String(l), ValueKind::String(r)) => l.cmp(r),
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.cmp(r),
        (ValueKind::Reference(l), ValueKind::Reference(r)) => l.cmp(r),
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => {
            compare_doubles(l.latitude(), r.latitude())
                .then_with(|| compare_doubles(l.longitude(), r.longitude()))
        }
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            for (lv, rv) in l.values().iter().zip(r.values().iter()) {
                let cmp = compare_values(lv, rv);
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            l.values().len().cmp(&r.values().len())
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            for ((lk, lv), (rk, rv)) in l.fields().iter().zip(r.fields().iter()) {
                let cmp = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            l.fields().len().cmp(&r.fields().len())
        }
        _ => Ordering::Equal,
    }
}

fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_mixed(integer: i64, double: f64) -> Ordering {
    if double.is_nan() {
        return Ordering::Greater;
    }
    let widened = integer as f64;
    match widened.partial_cmp(&double).unwrap_or(Ordering::Equal) {
        // Widening may round; fall back to integer comparison when the double
        // is integral and in range.
        Ordering::Equal if double >= i64::MIN as f64 && double < i64::MAX as f64 => {
            integer.cmp(&(double as i64))
        }
        other => other,
    }
}

/// Semantic equality: integers never equal doubles, NaN equals NaN.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.kind(), right.kind()) {
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l == r,
        (ValueKind::Double(l), ValueKind::Double(r)) => {
            (l.is_nan() && r.is_nan()) || l.to_bits() == r.to_bits()
        }
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            l.values().len() == r.values().len()
                && l
                    .values()
                    .iter()
                    .zip(r.values().iter())
                    .all(|(lv, rv)| values_equal(lv, rv))
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            l.fields().len() == r.fields().len()
                && l
                    .fields()
                    .iter()
                    .zip(r.fields().iter())
                    .all(|((lk, lv), (rk, rv))| lk == rk && values_equal(lv, rv))
        }
        (ValueKind::Sentinel(l), ValueKind::Sentinel(r)) => l == r,
        (l, r) => {
            std::mem::discriminant(l) == std::mem::discriminant(r)
                && compare_values(left, right) == Ordering::Equal
        }
    }
}

/// Stable string form used in query canonical ids.
pub fn canonical_id(value: &Value) -> String {
    match value.kind() {
        ValueKind::Null => "null".to_string(),
        ValueKind::Boolean(value) => value.to_string(),
        ValueKind::Integer(value) => value.to_string(),
        ValueKind::Double(value) => format!("{value:?}"),
        ValueKind::Timestamp(ts) => format!("time({},{})", ts.seconds, ts.nanos),
        ValueKind::ServerTimestamp {
            local_write_time, ..
        } => format!(
            "pending_time({},{})",
            local_write_time.seconds, local_write_time.nanos
        ),
        ValueKind::String(value) => value.clone(),
        ValueKind::Bytes(bytes) => bytes.to_base64(),
        ValueKind::Reference(key) => key.path().canonical_string(),
        ValueKind::GeoPoint(point) => format!("geo({},{})", point.latitude(), point.longitude()),
        ValueKind::Array(array) => {
            let inner: Vec<String> = array.values().iter().map(canonical_id).collect();
            format!("[{}]", inner.join(","))
        }
        ValueKind::Map(map) => {
            let inner: Vec<String> = map
                .fields()
                .iter()
                .map(|(key, value)| format!("{key}:{}", canonical_id(value)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        ValueKind::Sentinel(sentinel) => format!("sentinel({sentinel:?})"),
    }
}
