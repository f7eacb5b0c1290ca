use std::collections::BTreeMap;

use crate::model::value::server_timestamp;
use crate::model::{
    DocumentKey, FieldMask, FieldPath, MutableDocument, ObjectValue, SnapshotVersion, Timestamp,
    Value,
};

/// A transform applied to a single field as part of a write.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    field: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<Value>),
    ArrayRemove(Vec<Value>),
    Increment(Value),
}

/// Condition the backend (and the local view) checks before applying a
/// mutation. A failed precondition makes the mutation a no-op locally.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Precondition {
    exists: Option<bool>,
    update_time: Option<SnapshotVersion>,
}

impl Precondition {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn exists(exists: bool) -> Self {
        Self {
            exists: Some(exists),
            update_time: None,
        }
    }

    pub fn update_time(version: SnapshotVersion) -> Self {
        Self {
            exists: None,
            update_time: Some(version),
        }
    }

    pub fn is_none(&self) -> bool {
        self.exists.is_none() && self.update_time.is_none()
    }

    pub fn exists_value(&self) -> Option<bool> {
        self.exists
    }

    pub fn update_time_value(&self) -> Option<SnapshotVersion> {
        self.update_time
    }

    pub fn is_validated_by(&self, doc: &MutableDocument) -> bool {
        if let Some(update_time) = self.update_time {
            return doc.is_found_document() && doc.version() == update_time;
        }
        if let Some(exists) = self.exists {
            return exists == doc.is_found_document();
        }
        true
    }
}

/// A pending write. A closed sum so mutation application lives in one
/// exhaustive match instead of being scattered across implementations.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Set {
        key: DocumentKey,
        value: ObjectValue,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    Patch {
        key: DocumentKey,
        data: ObjectValue,
        field_mask: FieldMask,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: ObjectValue) -> Self {
        Mutation::Set {
            key,
            value,
            precondition: Precondition::none(),
            field_transforms: Vec::new(),
        }
    }

    pub fn patch(key: DocumentKey, data: ObjectValue, field_mask: FieldMask) -> Self {
        Mutation::Patch {
            key,
            data,
            field_mask,
            precondition: Precondition::exists(true),
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::none(),
        }
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> &Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => precondition,
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Set {
                field_transforms, ..
            }
            | Mutation::Patch {
                field_transforms, ..
            } => field_transforms,
            Mutation::Delete { .. } | Mutation::Verify { .. } => &[],
        }
    }

    pub fn with_transforms(self, field_transforms: Vec<FieldTransform>) -> Self {
        match self {
            Mutation::Set {
                key,
                value,
                precondition,
                ..
            } => Mutation::Set {
                key,
                value,
                precondition,
                field_transforms,
            },
            Mutation::Patch {
                key,
                data,
                field_mask,
                precondition,
                ..
            } => Mutation::Patch {
                key,
                data,
                field_mask,
                precondition,
                field_transforms,
            },
            other => other,
        }
    }
}

/// Per-mutation acknowledgement from the backend.
#[derive(Clone, Debug)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<Value>,
}

/// Applies a mutation to the local (latency-compensated) view of `doc`.
///
/// Returns the accumulated mask of locally changed fields: patches extend
/// `previous_mask` with the fields they touch; sets and deletes replace the
/// whole document and reset the mask to `None`. A failed precondition leaves
/// both the document and the mask untouched.
pub fn apply_mutation_to_local_view(
    mutation: &Mutation,
    doc: &mut MutableDocument,
    previous_mask: Option<FieldMask>,
    local_write_time: Timestamp,
) -> Option<FieldMask> {
    if !mutation.precondition().is_validated_by(doc) {
        return previous_mask;
    }

    match mutation {
        Mutation::Set { value, .. } => {
            let mut new_data = value.clone();
            apply_local_transforms(mutation, doc, &mut new_data, local_write_time);
            // A mutated existing document keeps its server version; only a
            // purely local creation sits at the minimum version. The ack
            // path later adopts the commit version either way.
            let version = doc.version();
            doc.convert_to_found_document(version, new_data);
            doc.set_has_local_mutations();
            None
        }
        Mutation::Patch {
            data, field_mask, ..
        } => {
            let mut new_data = doc.data().clone();
            new_data.apply_masked(data, field_mask);
            apply_local_transforms(mutation, doc, &mut new_data, local_write_time);
            let version = doc.version();
            doc.convert_to_found_document(version, new_data);
            doc.set_has_local_mutations();

            let mut mask = previous_mask.unwrap_or_default().union(field_mask);
            for transform in mutation.field_transforms() {
                mask.insert(transform.field().clone());
            }
            Some(mask)
        }
        Mutation::Delete { .. } => {
            doc.convert_to_no_document(SnapshotVersion::min());
            doc.set_has_local_mutations();
            None
        }
        Mutation::Verify { .. } => previous_mask,
    }
}

/// Applies an acknowledged mutation using the transform results the backend
/// computed. Unlike the local path, a failed patch precondition produces an
/// `UnknownDocument`: the server applied something we cannot reconstruct.
pub fn apply_mutation_to_remote_document(
    mutation: &Mutation,
    doc: &mut MutableDocument,
    result: &MutationResult,
) {
    match mutation {
        Mutation::Set { value, .. } => {
            let mut new_data = value.clone();
            apply_server_transforms(mutation, doc, &mut new_data, &result.transform_results);
            doc.convert_to_found_document(result.version, new_data);
            doc.set_has_committed_mutations();
        }
        Mutation::Patch {
            data, field_mask, ..
        } => {
            if !mutation.precondition().is_validated_by(doc) {
                doc.convert_to_unknown_document(result.version);
                return;
            }
            let mut new_data = doc.data().clone();
            new_data.apply_masked(data, field_mask);
            apply_server_transforms(mutation, doc, &mut new_data, &result.transform_results);
            doc.convert_to_found_document(result.version, new_data);
            doc.set_has_committed_mutations();
        }
        Mutation::Delete { .. } => {
            doc.convert_to_no_document(result.version);
            doc.set_has_committed_mutations();
        }
        Mutation::Verify { .. } => {}
    }
}

fn apply_local_transforms(
    mutation: &Mutation,
    doc: &MutableDocument,
    data: &mut ObjectValue,
    local_write_time: Timestamp,
) {
    for transform in mutation.field_transforms() {
        let previous = data
            .field(transform.field())
            .cloned()
            .or_else(|| doc.data().field(transform.field()).cloned());
        let result = local_transform_result(transform.operation(), previous, local_write_time);
        data.set(transform.field(), result);
    }
}

fn apply_server_transforms(
    mutation: &Mutation,
    doc: &MutableDocument,
    data: &mut ObjectValue,
    transform_results: &[Value],
) {
    for (index, transform) in mutation.field_transforms().iter().enumerate() {
        // The backend returns one result per transform, positionally. Fall
        // back to local evaluation if a result is missing.
        let value = match transform_results.get(index) {
            Some(value) => value.clone(),
            None => {
                let previous = doc.data().field(transform.field()).cloned();
                local_transform_result(transform.operation(), previous, Timestamp::now())
            }
        };
        data.set(transform.field(), value);
    }
}

fn local_transform_result(
    operation: &TransformOperation,
    previous: Option<Value>,
    local_write_time: Timestamp,
) -> Value {
    match operation {
        TransformOperation::ServerTimestamp => {
            server_timestamp::sentinel(local_write_time, previous.as_ref())
        }
        TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
        TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
        TransformOperation::Increment(operand) => numeric_increment(previous, operand),
    }
}

fn array_union(existing: Option<Value>, additions: &[Value]) -> Value {
    let mut values = match existing {
        Some(Value::Array(values)) => values,
        _ => Vec::new(),
    };
    for element in additions {
        if !values.iter().any(|candidate| candidate.value_equals(element)) {
            values.push(element.clone());
        }
    }
    Value::Array(values)
}

fn array_remove(existing: Option<Value>, removals: &[Value]) -> Value {
    let values = match existing {
        Some(Value::Array(values)) => values,
        _ => Vec::new(),
    };
    Value::Array(
        values
            .into_iter()
            .filter(|candidate| !removals.iter().any(|needle| needle.value_equals(candidate)))
            .collect(),
    )
}

fn numeric_increment(existing: Option<Value>, operand: &Value) -> Value {
    let base = match existing {
        Some(Value::Integer(value)) => Value::Integer(value),
        Some(Value::Double(value)) => Value::Double(value),
        // Non-numeric and missing fields both increment from zero.
        _ => Value::Integer(0),
    };

    match (base, operand) {
        (Value::Integer(current), Value::Integer(delta)) => match current.checked_add(*delta) {
            Some(sum) => Value::Integer(sum),
            None => Value::Double(current as f64 + *delta as f64),
        },
        (Value::Integer(current), Value::Double(delta)) => Value::Double(current as f64 + delta),
        (Value::Double(current), Value::Integer(delta)) => Value::Double(current + *delta as f64),
        (Value::Double(current), Value::Double(delta)) => Value::Double(current + delta),
        (_, operand) => operand.clone(),
    }
}

/// Records the pre-transform values a retried increment needs so resending
/// the batch stays idempotent. Returns `None` when the mutation carries no
/// increments.
pub fn extract_transform_base_value(
    mutation: &Mutation,
    doc: &MutableDocument,
) -> Option<ObjectValue> {
    let mut base: Option<ObjectValue> = None;
    for transform in mutation.field_transforms() {
        if !matches!(transform.operation(), TransformOperation::Increment(_)) {
            continue;
        }
        let existing = doc.data().field(transform.field());
        let base_value = match existing {
            Some(value @ (Value::Integer(_) | Value::Double(_))) => value.clone(),
            _ => Value::Integer(0),
        };
        base.get_or_insert_with(ObjectValue::empty)
            .set(transform.field(), base_value);
    }
    base
}

/// Converts the accumulated local changes of `doc` into the single mutation
/// that reproduces them: the memoized overlay.
///
/// `mask == None` means the whole document was replaced (set or delete);
/// `Some(mask)` lists the patched fields. An empty mask means no local
/// change survives, so there is no overlay.
pub fn calculate_overlay_mutation(
    doc: &MutableDocument,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    match mask {
        None => {
            if doc.is_no_document() {
                Some(Mutation::delete(doc.key().clone()))
            } else {
                Some(Mutation::Set {
                    key: doc.key().clone(),
                    value: doc.data().clone(),
                    precondition: Precondition::none(),
                    field_transforms: Vec::new(),
                })
            }
        }
        Some(mask) if mask.is_empty() => None,
        Some(mask) => {
            let mut patch_data = ObjectValue::new(BTreeMap::new());
            let mut patch_mask = FieldMask::empty();
            for path in mask.paths() {
                if let Some(value) = doc.data().field(path) {
                    patch_data.set(path, value.clone());
                }
                // Paths missing from the document stay in the mask so the
                // overlay deletes them.
                patch_mask.insert(path.clone());
            }
            Some(Mutation::Patch {
                key: doc.key().clone(),
                data: patch_data,
                field_mask: patch_mask,
                precondition: Precondition::none(),
                field_transforms: Vec::new(),
            })
        }
    }
}
