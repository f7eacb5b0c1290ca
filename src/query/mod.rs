//! Client-side query model and matching.
//!
//! Queries are evaluated locally against cached documents; the backend
//! evaluates the same shape server-side, so matching and ordering here must
//! agree with the wire protocol's semantics.

use std::cmp::Ordering;

use crate::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    In,
    ArrayContainsAny,
    NotIn,
}

impl FilterOperator {
    fn canonical_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::In => "in",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::NotIn => "not-in",
        }
    }
}

/// A single field comparison.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    op: FilterOperator,
    value: Value,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: FilterOperator, value: Value) -> Self {
        Self { field, op, value }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn op(&self) -> FilterOperator {
        self.op
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn matches(&self, doc: &MutableDocument) -> bool {
        let field_value = doc.data().field(&self.field);
        match self.op {
            FilterOperator::Equal => match field_value {
                Some(value) => value.value_equals(&self.value),
                None => false,
            },
            FilterOperator::NotEqual => match field_value {
                // Null never matches an inequality, mirroring the backend.
                Some(Value::Null) | None => false,
                Some(value) => !value.value_equals(&self.value),
            },
            FilterOperator::LessThan
            | FilterOperator::LessThanOrEqual
            | FilterOperator::GreaterThan
            | FilterOperator::GreaterThanOrEqual => match field_value {
                Some(value) => {
                    // Range comparisons only apply within one type family.
                    if !same_type_family(value, &self.value) {
                        return false;
                    }
                    let ordering = value.compare(&self.value);
                    match self.op {
                        FilterOperator::LessThan => ordering == Ordering::Less,
                        FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
                        FilterOperator::GreaterThan => ordering == Ordering::Greater,
                        FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
                        _ => unreachable!(),
                    }
                }
                None => false,
            },
            FilterOperator::ArrayContains => match field_value {
                Some(Value::Array(values)) => {
                    values.iter().any(|value| value.value_equals(&self.value))
                }
                _ => false,
            },
            FilterOperator::In => match (field_value, &self.value) {
                (Some(value), Value::Array(candidates)) => {
                    candidates.iter().any(|candidate| candidate.value_equals(value))
                }
                _ => false,
            },
            FilterOperator::ArrayContainsAny => match (field_value, &self.value) {
                (Some(Value::Array(values)), Value::Array(candidates)) => values
                    .iter()
                    .any(|value| candidates.iter().any(|candidate| candidate.value_equals(value))),
                _ => false,
            },
            FilterOperator::NotIn => match (field_value, &self.value) {
                (Some(Value::Null), _) | (None, _) => false,
                (Some(value), Value::Array(candidates)) => {
                    !candidates.iter().any(|candidate| candidate.value_equals(value))
                }
                _ => false,
            },
        }
    }
}

fn same_type_family(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Integer(_) | Value::Double(_), Value::Integer(_) | Value::Double(_))
    ) || std::mem::discriminant(a) == std::mem::discriminant(b)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    field: FieldPath,
    direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn ascending(field: FieldPath) -> Self {
        Self::new(field, Direction::Ascending)
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

/// Whether a limit trims from the start or the end of the ordered results.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitType {
    First,
    Last,
}

/// A query over a single collection.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<usize>,
    limit_type: LimitType,
}

impl Query {
    pub fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
        }
    }

    pub fn for_document(key: &DocumentKey) -> Self {
        Self::at_path(key.path().clone())
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn with_limit_to_first(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn with_limit_to_last(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    /// A document query targets exactly one key: an even-length path with no
    /// filters or limit.
    pub fn is_document_query(&self) -> bool {
        DocumentKey::from_path(self.path.clone()).is_ok()
            && self.filters.is_empty()
            && self.limit.is_none()
    }

    /// The effective ordering: explicit order-bys followed by the implicit
    /// key order, which breaks all remaining ties.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut order_by = self.explicit_order_by.clone();
        let key_direction = order_by
            .last()
            .map(|last| last.direction)
            .unwrap_or(Direction::Ascending);
        if !order_by
            .iter()
            .any(|order| order.field == FieldPath::document_id())
        {
            order_by.push(OrderBy::new(FieldPath::document_id(), key_direction));
        }
        order_by
    }

    pub fn matches(&self, doc: &MutableDocument) -> bool {
        doc.is_found_document()
            && self.matches_path(doc.key())
            && self.matches_order_by(doc)
            && self.filters.iter().all(|filter| filter.matches(doc))
    }

    fn matches_path(&self, key: &DocumentKey) -> bool {
        if DocumentKey::from_path(self.path.clone()).is_ok() {
            key.path() == &self.path
        } else {
            self.path.is_immediate_parent_of(key.path())
        }
    }

    /// Documents missing an explicitly ordered field are excluded, matching
    /// backend semantics.
    fn matches_order_by(&self, doc: &MutableDocument) -> bool {
        self.explicit_order_by
            .iter()
            .all(|order| doc.data().field(&order.field).is_some())
    }

    pub fn compare(&self, a: &MutableDocument, b: &MutableDocument) -> Ordering {
        for order in self.normalized_order_by() {
            let ordering = if order.field == FieldPath::document_id() {
                a.key().cmp(b.key())
            } else {
                let left = a.data().field(&order.field);
                let right = b.data().field(&order.field);
                match (left, right) {
                    (Some(left), Some(right)) => left.compare(right),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                }
            };
            let ordering = match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Stable identity string used for target-cache keying and dedup of
    /// identical listens.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.field.canonical_string());
            id.push_str(filter.op.canonical_str());
            id.push_str(&format!("{:?}", filter.value));
            id.push(',');
        }
        id.push_str("|ob:");
        for order in self.normalized_order_by() {
            id.push_str(&order.field.canonical_string());
            id.push(match order.direction {
                Direction::Ascending => 'a',
                Direction::Descending => 'd',
            });
            id.push(',');
        }
        if let Some(limit) = self.limit {
            id.push_str("|l:");
            id.push_str(&limit.to_string());
            id.push(match self.limit_type {
                LimitType::First => 'f',
                LimitType::Last => 'l',
            });
        }
        id
    }
}
