use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::model::{FieldMask, FieldPath, Timestamp};

/// A single Firestore-style field value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    String(String),
    Bytes(Vec<u8>),
    Reference(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Deep value equality with cross-type numeric comparison, the equality
    /// array transforms and filters use.
    pub fn value_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Integer(a), Value::Double(b)) | (Value::Double(b), Value::Integer(a)) => {
                (*a as f64) == *b
            }
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(l, r)| l.value_equals(r))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|((lk, lv), (rk, rv))| {
                        lk == rk && lv.value_equals(rv)
                    })
            }
            _ => self == other,
        }
    }

    fn type_order(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) | Value::Double(_) => 2,
            Value::Timestamp(_) => 3,
            Value::String(_) => 4,
            Value::Bytes(_) => 5,
            Value::Reference(_) => 6,
            Value::Array(_) => 7,
            Value::Map(_) => 8,
        }
    }

    /// Total order across all value types, used for query ordering and
    /// cursor comparisons. Mixed types order by type tag.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (Value::Integer(a), Value::Double(b)) => {
                (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (Value::Double(a), Value::Integer(b)) => {
                a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal)
            }
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Reference(a), Value::Reference(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (l, r) in a.iter().zip(b.iter()) {
                    let ordering = l.compare(r);
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Map(a), Value::Map(b)) => {
                for ((lk, lv), (rk, rv)) in a.iter().zip(b.iter()) {
                    let key_ordering = lk.cmp(rk);
                    if key_ordering != Ordering::Equal {
                        return key_ordering;
                    }
                    let value_ordering = lv.compare(rv);
                    if value_ordering != Ordering::Equal {
                        return value_ordering;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.type_order().cmp(&other.type_order()),
        }
    }
}

/// An immutable-by-convention map of document fields with path-based access.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectValue {
    fields: BTreeMap<String, Value>,
}

impl ObjectValue {
    pub fn new(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn field(&self, path: &FieldPath) -> Option<&Value> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            match current {
                Value::Map(map) => current = map.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn set(&mut self, path: &FieldPath, value: Value) {
        set_in_map(&mut self.fields, path.segments(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        delete_in_map(&mut self.fields, path.segments());
    }

    /// Applies `data` restricted to `mask` on top of this value: covered
    /// paths present in `data` are copied, covered paths absent from `data`
    /// are deleted.
    pub fn apply_masked(&mut self, data: &ObjectValue, mask: &FieldMask) {
        for path in mask.paths() {
            match data.field(path) {
                Some(value) => self.set(path, value.clone()),
                None => self.delete(path),
            }
        }
    }
}

fn set_in_map(fields: &mut BTreeMap<String, Value>, segments: &[String], value: Value) {
    match segments {
        [] => {}
        [last] => {
            fields.insert(last.clone(), value);
        }
        [first, rest @ ..] => {
            let entry = fields
                .entry(first.clone())
                .or_insert_with(|| Value::Map(BTreeMap::new()));
            if !matches!(entry, Value::Map(_)) {
                *entry = Value::Map(BTreeMap::new());
            }
            if let Value::Map(child) = entry {
                set_in_map(child, rest, value);
            }
        }
    }
}

fn delete_in_map(fields: &mut BTreeMap<String, Value>, segments: &[String]) {
    match segments {
        [] => {}
        [last] => {
            fields.remove(last);
        }
        [first, rest @ ..] => {
            if let Some(Value::Map(child)) = fields.get_mut(first) {
                delete_in_map(child, rest);
            }
        }
    }
}

/// Server-timestamp sentinel values.
///
/// While a `ServerTimestamp` transform is pending locally, the field holds a
/// sentinel map carrying the local write time and the previous value; the
/// real timestamp replaces it once the backend acknowledges the write.
pub mod server_timestamp {
    use super::*;

    const TYPE_KEY: &str = "__type__";
    const SENTINEL_TYPE: &str = "server_timestamp";
    const LOCAL_WRITE_TIME_KEY: &str = "__local_write_time__";
    const PREVIOUS_VALUE_KEY: &str = "__previous_value__";

    pub fn sentinel(local_write_time: Timestamp, previous: Option<&Value>) -> Value {
        let mut map = BTreeMap::new();
        map.insert(
            TYPE_KEY.to_string(),
            Value::String(SENTINEL_TYPE.to_string()),
        );
        map.insert(
            LOCAL_WRITE_TIME_KEY.to_string(),
            Value::Timestamp(local_write_time),
        );
        // Nest a pending sentinel's own previous value rather than the
        // sentinel itself, so chained writes resolve to the oldest concrete
        // value.
        let previous = previous.map(|value| {
            if is_sentinel(value) {
                previous_value(value).cloned().unwrap_or(Value::Null)
            } else {
                value.clone()
            }
        });
        if let Some(previous) = previous {
            map.insert(PREVIOUS_VALUE_KEY.to_string(), previous);
        }
        Value::Map(map)
    }

    pub fn is_sentinel(value: &Value) -> bool {
        matches!(value, Value::Map(map)
            if map.get(TYPE_KEY) == Some(&Value::String(SENTINEL_TYPE.to_string())))
    }

    pub fn local_write_time(value: &Value) -> Option<Timestamp> {
        match value {
            Value::Map(map) => match map.get(LOCAL_WRITE_TIME_KEY) {
                Some(Value::Timestamp(timestamp)) => Some(*timestamp),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn previous_value(value: &Value) -> Option<&Value> {
        match value {
            Value::Map(map) => map.get(PREVIOUS_VALUE_KEY),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> FieldPath {
        FieldPath::from_dot_separated(p).unwrap()
    }

    #[test]
    fn nested_set_and_get() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b.c"), Value::Integer(1));
        assert_eq!(object.field(&path("a.b.c")), Some(&Value::Integer(1)));
        assert!(matches!(object.field(&path("a.b")), Some(Value::Map(_))));
    }

    #[test]
    fn delete_removes_leaf() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b"), Value::Integer(1));
        object.set(&path("a.c"), Value::Integer(2));
        object.delete(&path("a.b"));
        assert_eq!(object.field(&path("a.b")), None);
        assert_eq!(object.field(&path("a.c")), Some(&Value::Integer(2)));
    }

    #[test]
    fn numeric_cross_type_equality() {
        assert!(Value::Integer(3).value_equals(&Value::Double(3.0)));
        assert!(!Value::Integer(3).value_equals(&Value::Double(3.5)));
    }

    #[test]
    fn mixed_types_order_by_type_tag() {
        assert_eq!(
            Value::Boolean(true).compare(&Value::String("a".into())),
            Ordering::Less
        );
        assert_eq!(
            Value::Integer(5).compare(&Value::Double(4.5)),
            Ordering::Greater
        );
    }

    #[test]
    fn server_timestamp_sentinel_round_trip() {
        let now = Timestamp::new(10, 0);
        let sentinel = server_timestamp::sentinel(now, Some(&Value::Integer(7)));
        assert!(server_timestamp::is_sentinel(&sentinel));
        assert_eq!(server_timestamp::local_write_time(&sentinel), Some(now));
        assert_eq!(
            server_timestamp::previous_value(&sentinel),
            Some(&Value::Integer(7))
        );
    }

    #[test]
    fn chained_sentinels_keep_oldest_previous_value() {
        let first = server_timestamp::sentinel(Timestamp::new(1, 0), Some(&Value::Integer(7)));
        let second = server_timestamp::sentinel(Timestamp::new(2, 0), Some(&first));
        assert_eq!(
            server_timestamp::previous_value(&second),
            Some(&Value::Integer(7))
        );
    }
}
