use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use crate::firestore::model::{GeoPoint, Timestamp};
use crate::firestore::value::{ArrayValue, BytesValue, MapValue};

/// A single field value stored in a document.
///
/// Equality follows the database's rules rather than Rust's: integers and
/// doubles never compare equal, `NaN` equals `NaN`, and `0.0` differs from
/// `-0.0`. Use [`FirestoreValue::compare`] for the total ordering used by
/// queries.
#[derive(Clone, Debug)]
pub struct FirestoreValue {
    kind: ValueKind,
}

#[derive(Clone, Debug)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    String(String),
    Bytes(BytesValue),
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
}

impl FirestoreValue {
    pub fn null() -> Self {
        Self {
            kind: ValueKind::Null,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    pub fn from_reference(path: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Reference(path.into()),
        }
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self {
            kind: ValueKind::GeoPoint(value),
        }
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Array(ArrayValue::new(values)),
        }
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(map)),
        }
    }

    pub fn from_map_value(map: MapValue) -> Self {
        Self {
            kind: ValueKind::Map(map),
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn into_kind(self) -> ValueKind {
        self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match &self.kind {
            ValueKind::Array(array) => Some(array),
            _ => None,
        }
    }

    /// Rank of the value's type in the cross-type sort order.
    pub fn type_order(&self) -> u8 {
        match self.kind {
            ValueKind::Null => 0,
            ValueKind::Boolean(_) => 1,
            ValueKind::Integer(_) | ValueKind::Double(_) => 2,
            ValueKind::Timestamp(_) => 3,
            ValueKind::String(_) => 5,
            ValueKind::Bytes(_) => 6,
            ValueKind::Reference(_) => 7,
            ValueKind::GeoPoint(_) => 8,
            ValueKind::Array(_) => 9,
            ValueKind::Map(_) => 10,
        }
    }

    /// Total order over all values: first by type, then by value.
    pub fn compare(&self, other: &FirestoreValue) -> Ordering {
        let by_type = self.type_order().cmp(&other.type_order());
        if by_type != Ordering::Equal {
            return by_type;
        }

        match (&self.kind, &other.kind) {
            (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
            (ValueKind::Boolean(left), ValueKind::Boolean(right)) => left.cmp(right),
            (ValueKind::Integer(left), ValueKind::Integer(right)) => left.cmp(right),
            (ValueKind::Integer(left), ValueKind::Double(right)) => {
                compare_doubles(*left as f64, *right)
            }
            (ValueKind::Double(left), ValueKind::Integer(right)) => {
                compare_doubles(*left, *right as f64)
            }
            (ValueKind::Double(left), ValueKind::Double(right)) => compare_doubles(*left, *right),
            (ValueKind::Timestamp(left), ValueKind::Timestamp(right)) => left.cmp(right),
            (ValueKind::String(left), ValueKind::String(right)) => left.cmp(right),
            (ValueKind::Bytes(left), ValueKind::Bytes(right)) => {
                left.as_slice().cmp(right.as_slice())
            }
            (ValueKind::Reference(left), ValueKind::Reference(right)) => {
                left.split('/').cmp(right.split('/'))
            }
            (ValueKind::GeoPoint(left), ValueKind::GeoPoint(right)) => {
                compare_doubles(left.latitude(), right.latitude())
                    .then_with(|| compare_doubles(left.longitude(), right.longitude()))
            }
            (ValueKind::Array(left), ValueKind::Array(right)) => {
                for (l, r) in left.values().iter().zip(right.values()) {
                    let ordering = l.compare(r);
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                left.values().len().cmp(&right.values().len())
            }
            (ValueKind::Map(left), ValueKind::Map(right)) => {
                for ((left_key, left_value), (right_key, right_value)) in
                    left.fields().iter().zip(right.fields())
                {
                    let ordering = left_key
                        .cmp(right_key)
                        .then_with(|| left_value.compare(right_value));
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                left.fields().len().cmp(&right.fields().len())
            }
            _ => Ordering::Equal,
        }
    }

    /// Stable textual form used to build canonical target ids.
    pub fn canonical_id(&self) -> String {
        match &self.kind {
            ValueKind::Null => "null".to_string(),
            ValueKind::Boolean(value) => value.to_string(),
            ValueKind::Integer(value) => value.to_string(),
            ValueKind::Double(value) => format!("{value:?}"),
            ValueKind::Timestamp(value) => format!("time({},{})", value.seconds, value.nanos),
            ValueKind::String(value) => value.clone(),
            ValueKind::Bytes(value) => value.to_base64(),
            ValueKind::Reference(value) => value.clone(),
            ValueKind::GeoPoint(value) => {
                format!("geo({},{})", value.latitude(), value.longitude())
            }
            ValueKind::Array(array) => {
                let parts: Vec<String> = array.values().iter().map(Self::canonical_id).collect();
                format!("[{}]", parts.join(","))
            }
            ValueKind::Map(map) => {
                let parts: Vec<String> = map
                    .fields()
                    .iter()
                    .map(|(key, value)| format!("{key}:{}", value.canonical_id()))
                    .collect();
                format!("{{{}}}", parts.join(","))
            }
        }
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

fn doubles_equal(left: f64, right: f64) -> bool {
    if left.is_nan() && right.is_nan() {
        return true;
    }
    left == right && left.is_sign_negative() == right.is_sign_negative()
}

impl PartialEq for FirestoreValue {
    fn eq(&self, other: &Self) -> bool {
        match (&self.kind, &other.kind) {
            (ValueKind::Null, ValueKind::Null) => true,
            (ValueKind::Boolean(left), ValueKind::Boolean(right)) => left == right,
            (ValueKind::Integer(left), ValueKind::Integer(right)) => left == right,
            (ValueKind::Double(left), ValueKind::Double(right)) => doubles_equal(*left, *right),
            (ValueKind::Timestamp(left), ValueKind::Timestamp(right)) => left == right,
            (ValueKind::String(left), ValueKind::String(right)) => left == right,
            (ValueKind::Bytes(left), ValueKind::Bytes(right)) => left == right,
            (ValueKind::Reference(left), ValueKind::Reference(right)) => left == right,
            (ValueKind::GeoPoint(left), ValueKind::GeoPoint(right)) => {
                doubles_equal(left.latitude(), right.latitude())
                    && doubles_equal(left.longitude(), right.longitude())
            }
            (ValueKind::Array(left), ValueKind::Array(right)) => left == right,
            (ValueKind::Map(left), ValueKind::Map(right)) => left == right,
            _ => false,
        }
    }
}

impl Display for FirestoreValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_id())
    }
}

impl From<i64> for FirestoreValue {
    fn from(value: i64) -> Self {
        Self::from_integer(value)
    }
}

impl From<f64> for FirestoreValue {
    fn from(value: f64) -> Self {
        Self::from_double(value)
    }
}

impl From<bool> for FirestoreValue {
    fn from(value: bool) -> Self {
        Self::from_bool(value)
    }
}

impl From<&str> for FirestoreValue {
    fn from(value: &str) -> Self {
        Self::from_string(value)
    }
}

impl From<String> for FirestoreValue {
    fn from(value: String) -> Self {
        Self::from_string(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_basic_values() {
        let v = FirestoreValue::from_string("hello");
        match v.kind() {
            ValueKind::String(value) => assert_eq!(value, "hello"),
            _ => panic!("unexpected kind"),
        }
    }

    #[test]
    fn numbers_compare_across_integer_and_double() {
        let one = FirestoreValue::from_integer(1);
        let one_and_half = FirestoreValue::from_double(1.5);
        let nan = FirestoreValue::from_double(f64::NAN);
        assert_eq!(one.compare(&one_and_half), Ordering::Less);
        assert_eq!(nan.compare(&one), Ordering::Less);
        assert_eq!(
            FirestoreValue::from_integer(2).compare(&FirestoreValue::from_double(2.0)),
            Ordering::Equal
        );
    }

    #[test]
    fn equality_distinguishes_integers_from_doubles() {
        assert_ne!(FirestoreValue::from_integer(1), FirestoreValue::from_double(1.0));
        assert_eq!(
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_double(f64::NAN)
        );
        assert_ne!(FirestoreValue::from_double(0.0), FirestoreValue::from_double(-0.0));
    }

    #[test]
    fn types_order_before_values() {
        let null = FirestoreValue::null();
        let boolean = FirestoreValue::from_bool(true);
        let string = FirestoreValue::from_string("a");
        let array = FirestoreValue::from_array(vec![]);
        assert_eq!(null.compare(&boolean), Ordering::Less);
        assert_eq!(boolean.compare(&string), Ordering::Less);
        assert_eq!(string.compare(&array), Ordering::Less);
    }

    #[test]
    fn canonical_id_is_stable_for_maps() {
        let mut fields = BTreeMap::new();
        fields.insert("b".to_string(), FirestoreValue::from_integer(2));
        fields.insert(
            "a".to_string(),
            FirestoreValue::from_array(vec![FirestoreValue::from_bool(true)]),
        );
        let value = FirestoreValue::from_map(fields);
        assert_eq!(value.canonical_id(), "{a:[true],b:2}");
    }
}
