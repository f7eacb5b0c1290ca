//! JSON wire codec for the listen and write protocols.
//!
//! Values use the proto-JSON shape the backend speaks: 64-bit integers as
//! strings, timestamps as RFC 3339, bytes as base64.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Map, Value as Json};

use crate::error::{invalid_argument, SyncError, SyncErrorCode, SyncResult};
use crate::model::mutation_batch::MutationBatch;
use crate::model::target::{TargetData, TargetId};
use crate::model::{
    DatabaseId, DocumentKey, MutableDocument, Mutation, MutationResult, ObjectValue, Precondition,
    SnapshotVersion, Timestamp, TransformOperation, Value,
};
use crate::query::{Direction, FilterOperator, Query};
use crate::remote::existence_filter::{BloomFilter, ExistenceFilter};
use crate::remote::watch_change::{WatchChange, WatchTargetChange, WatchTargetChangeState};

pub fn database_name(database_id: &DatabaseId) -> String {
    format!(
        "projects/{}/databases/{}",
        database_id.project_id(),
        database_id.database()
    )
}

pub fn document_name(database_id: &DatabaseId, key: &DocumentKey) -> String {
    format!(
        "{}/documents/{}",
        database_name(database_id),
        key.path().canonical_string()
    )
}

fn decode_document_key(database_id: &DatabaseId, name: &str) -> SyncResult<DocumentKey> {
    let prefix = format!("{}/documents/", database_name(database_id));
    let path = name
        .strip_prefix(&prefix)
        .ok_or_else(|| invalid_argument(format!("unexpected document name: {name}")))?;
    DocumentKey::from_string(path)
}

pub fn encode_timestamp(timestamp: Timestamp) -> String {
    let datetime: DateTime<Utc> = Utc
        .timestamp_opt(timestamp.seconds, timestamp.nanos as u32)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().expect("epoch is valid"));
    datetime.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

pub fn decode_timestamp(value: &str) -> SyncResult<Timestamp> {
    let datetime = DateTime::parse_from_rfc3339(value)
        .map_err(|err| invalid_argument(format!("bad timestamp '{value}': {err}")))?;
    Ok(Timestamp::new(
        datetime.timestamp(),
        datetime.timestamp_subsec_nanos() as i32,
    ))
}

fn decode_version(json: Option<&Json>) -> SyncResult<SnapshotVersion> {
    match json.and_then(Json::as_str) {
        Some(text) => Ok(SnapshotVersion::new(decode_timestamp(text)?)),
        None => Ok(SnapshotVersion::min()),
    }
}

pub fn encode_value(value: &Value) -> Json {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Boolean(b) => json!({ "booleanValue": b }),
        Value::Integer(i) => json!({ "integerValue": i.to_string() }),
        Value::Double(d) => json!({ "doubleValue": d }),
        Value::Timestamp(ts) => json!({ "timestampValue": encode_timestamp(*ts) }),
        Value::String(s) => json!({ "stringValue": s }),
        Value::Bytes(bytes) => json!({ "bytesValue": BASE64.encode(bytes) }),
        Value::Reference(name) => json!({ "referenceValue": name }),
        Value::Array(values) => json!({
            "arrayValue": { "values": values.iter().map(encode_value).collect::<Vec<_>>() }
        }),
        Value::Map(fields) => json!({
            "mapValue": { "fields": fields.iter()
                .map(|(k, v)| (k.clone(), encode_value(v)))
                .collect::<Map<String, Json>>() }
        }),
    }
}

pub fn decode_value(json: &Json) -> SyncResult<Value> {
    let object = json
        .as_object()
        .ok_or_else(|| invalid_argument("value is not an object"))?;
    let (kind, inner) = object
        .iter()
        .next()
        .ok_or_else(|| invalid_argument("empty value object"))?;
    match kind.as_str() {
        "nullValue" => Ok(Value::Null),
        "booleanValue" => Ok(Value::Boolean(
            inner.as_bool().ok_or_else(|| invalid_argument("bad booleanValue"))?,
        )),
        "integerValue" => {
            let i = match inner {
                Json::String(s) => s
                    .parse::<i64>()
                    .map_err(|_| invalid_argument("bad integerValue"))?,
                Json::Number(n) => n
                    .as_i64()
                    .ok_or_else(|| invalid_argument("bad integerValue"))?,
                _ => return Err(invalid_argument("bad integerValue")),
            };
            Ok(Value::Integer(i))
        }
        "doubleValue" => Ok(Value::Double(
            inner.as_f64().ok_or_else(|| invalid_argument("bad doubleValue"))?,
        )),
        "timestampValue" => Ok(Value::Timestamp(decode_timestamp(
            inner.as_str().ok_or_else(|| invalid_argument("bad timestampValue"))?,
        )?)),
        "stringValue" => Ok(Value::String(
            inner
                .as_str()
                .ok_or_else(|| invalid_argument("bad stringValue"))?
                .to_string(),
        )),
        "bytesValue" => {
            let encoded = inner.as_str().ok_or_else(|| invalid_argument("bad bytesValue"))?;
            Ok(Value::Bytes(BASE64.decode(encoded).map_err(|err| {
                invalid_argument(format!("bad bytesValue base64: {err}"))
            })?))
        }
        "referenceValue" => Ok(Value::Reference(
            inner
                .as_str()
                .ok_or_else(|| invalid_argument("bad referenceValue"))?
                .to_string(),
        )),
        "arrayValue" => {
            let values = inner
                .get("values")
                .and_then(Json::as_array)
                .map(|values| values.iter().map(decode_value).collect::<SyncResult<Vec<_>>>())
                .transpose()?
                .unwrap_or_default();
            Ok(Value::Array(values))
        }
        "mapValue" => Ok(Value::Map(
            decode_fields(inner.get("fields"))?.fields().clone(),
        )),
        other => Err(invalid_argument(format!("unknown value kind: {other}"))),
    }
}

fn encode_fields(value: &ObjectValue) -> Json {
    Json::Object(
        value
            .fields()
            .iter()
            .map(|(k, v)| (k.clone(), encode_value(v)))
            .collect(),
    )
}

fn decode_fields(json: Option<&Json>) -> SyncResult<ObjectValue> {
    let mut fields = std::collections::BTreeMap::new();
    if let Some(object) = json.and_then(Json::as_object) {
        for (name, value) in object {
            fields.insert(name.clone(), decode_value(value)?);
        }
    }
    Ok(ObjectValue::new(fields))
}

fn encode_precondition(precondition: &Precondition) -> Option<Json> {
    if let Some(update_time) = precondition.update_time_value() {
        return Some(json!({ "updateTime": encode_timestamp(update_time.timestamp()) }));
    }
    precondition
        .exists_value()
        .map(|exists| json!({ "exists": exists }))
}

fn encode_field_transforms(mutation: &Mutation) -> Vec<Json> {
    mutation
        .field_transforms()
        .iter()
        .map(|transform| {
            let mut object = Map::new();
            object.insert(
                "fieldPath".to_string(),
                Json::String(transform.field().canonical_string()),
            );
            match transform.operation() {
                TransformOperation::ServerTimestamp => {
                    object.insert(
                        "setToServerValue".to_string(),
                        Json::String("REQUEST_TIME".to_string()),
                    );
                }
                TransformOperation::ArrayUnion(elements) => {
                    object.insert(
                        "appendMissingElements".to_string(),
                        json!({ "values": elements.iter().map(encode_value).collect::<Vec<_>>() }),
                    );
                }
                TransformOperation::ArrayRemove(elements) => {
                    object.insert(
                        "removeAllFromArray".to_string(),
                        json!({ "values": elements.iter().map(encode_value).collect::<Vec<_>>() }),
                    );
                }
                TransformOperation::Increment(operand) => {
                    object.insert("increment".to_string(), encode_value(operand));
                }
            }
            Json::Object(object)
        })
        .collect()
}

pub fn encode_mutation(database_id: &DatabaseId, mutation: &Mutation) -> Json {
    let mut object = Map::new();
    match mutation {
        Mutation::Set { key, value, .. } => {
            object.insert(
                "update".to_string(),
                json!({
                    "name": document_name(database_id, key),
                    "fields": encode_fields(value),
                }),
            );
        }
        Mutation::Patch {
            key,
            data,
            field_mask,
            ..
        } => {
            object.insert(
                "update".to_string(),
                json!({
                    "name": document_name(database_id, key),
                    "fields": encode_fields(data),
                }),
            );
            object.insert(
                "updateMask".to_string(),
                json!({
                    "fieldPaths": field_mask
                        .paths()
                        .map(|path| path.canonical_string())
                        .collect::<Vec<_>>(),
                }),
            );
        }
        Mutation::Delete { key, .. } => {
            object.insert(
                "delete".to_string(),
                Json::String(document_name(database_id, key)),
            );
        }
        Mutation::Verify { key, .. } => {
            object.insert(
                "verify".to_string(),
                Json::String(document_name(database_id, key)),
            );
        }
    }
    let transforms = encode_field_transforms(mutation);
    if !transforms.is_empty() {
        object.insert("updateTransforms".to_string(), Json::Array(transforms));
    }
    if let Some(precondition) = encode_precondition(mutation.precondition()) {
        object.insert("currentDocument".to_string(), precondition);
    }
    Json::Object(object)
}

fn encode_filter(filter: &crate::query::FieldFilter) -> Json {
    let op = match filter.op() {
        FilterOperator::LessThan => "LESS_THAN",
        FilterOperator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
        FilterOperator::Equal => "EQUAL",
        FilterOperator::NotEqual => "NOT_EQUAL",
        FilterOperator::GreaterThan => "GREATER_THAN",
        FilterOperator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
        FilterOperator::ArrayContains => "ARRAY_CONTAINS",
        FilterOperator::In => "IN",
        FilterOperator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
        FilterOperator::NotIn => "NOT_IN",
    };
    json!({
        "fieldFilter": {
            "field": { "fieldPath": filter.field().canonical_string() },
            "op": op,
            "value": encode_value(filter.value()),
        }
    })
}

fn encode_structured_query(query: &Query) -> Json {
    let mut structured = Map::new();
    let collection_id = query.path().last_segment().unwrap_or_default();
    structured.insert(
        "from".to_string(),
        json!([{ "collectionId": collection_id }]),
    );
    if !query.filters().is_empty() {
        let filters: Vec<Json> = query.filters().iter().map(encode_filter).collect();
        let filter = if filters.len() == 1 {
            filters.into_iter().next().expect("one filter")
        } else {
            json!({ "compositeFilter": { "op": "AND", "filters": filters } })
        };
        structured.insert("where".to_string(), filter);
    }
    let order_by: Vec<Json> = query
        .normalized_order_by()
        .iter()
        .map(|order| {
            json!({
                "field": { "fieldPath": order.field().canonical_string() },
                "direction": match order.direction() {
                    Direction::Ascending => "ASCENDING",
                    Direction::Descending => "DESCENDING",
                },
            })
        })
        .collect();
    structured.insert("orderBy".to_string(), Json::Array(order_by));
    if let Some(limit) = query.limit() {
        // limit-to-last is a client-side construct; the wire query always
        // limits from the front with inverted ordering handled locally.
        structured.insert("limit".to_string(), json!(limit));
    }
    Json::Object(structured)
}

/// Encodes an AddTarget listen request.
pub fn encode_listen_request(database_id: &DatabaseId, target_data: &TargetData) -> Json {
    let mut add_target = Map::new();
    add_target.insert("targetId".to_string(), json!(target_data.target_id()));

    let query = target_data.target().query();
    if target_data.target().is_document_target() {
        add_target.insert(
            "documents".to_string(),
            json!({
                "documents": [format!(
                    "{}/documents/{}",
                    database_name(database_id),
                    query.path().canonical_string()
                )],
            }),
        );
    } else {
        let parent_path = query.path().without_last();
        let parent = if parent_path.is_empty() {
            format!("{}/documents", database_name(database_id))
        } else {
            format!(
                "{}/documents/{}",
                database_name(database_id),
                parent_path.canonical_string()
            )
        };
        add_target.insert(
            "query".to_string(),
            json!({
                "parent": parent,
                "structuredQuery": encode_structured_query(query),
            }),
        );
    }

    if !target_data.resume_token().is_empty() {
        add_target.insert(
            "resumeToken".to_string(),
            Json::String(BASE64.encode(target_data.resume_token())),
        );
        if let Some(expected_count) = target_data.expected_count() {
            add_target.insert("expectedCount".to_string(), json!(expected_count));
        }
    }

    json!({ "database": database_name(database_id), "addTarget": add_target })
}

pub fn encode_unlisten_request(database_id: &DatabaseId, target_id: TargetId) -> Json {
    json!({ "database": database_name(database_id), "removeTarget": target_id })
}

/// The write stream handshake carrying no mutations, only identity.
pub fn encode_write_handshake(database_id: &DatabaseId) -> Json {
    json!({ "database": database_name(database_id), "writes": [] })
}

pub fn encode_write_request(
    database_id: &DatabaseId,
    batch: &MutationBatch,
    stream_token: &[u8],
) -> Json {
    json!({
        "streamToken": BASE64.encode(stream_token),
        "writes": batch
            .mutations()
            .iter()
            .map(|mutation| encode_mutation(database_id, mutation))
            .collect::<Vec<_>>(),
    })
}

/// A decoded write stream response: the new stream token plus, after the
/// handshake, the commit version and per-write results.
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: SnapshotVersion,
    pub results: Vec<MutationResult>,
}

pub fn decode_write_response(json: &Json) -> SyncResult<WriteResponse> {
    let stream_token = match json.get("streamToken").and_then(Json::as_str) {
        Some(token) => BASE64
            .decode(token)
            .map_err(|err| invalid_argument(format!("bad streamToken: {err}")))?,
        None => Vec::new(),
    };
    let commit_version = decode_version(json.get("commitTime"))?;
    let mut results = Vec::new();
    if let Some(write_results) = json.get("writeResults").and_then(Json::as_array) {
        for write_result in write_results {
            let version = match write_result.get("updateTime").and_then(Json::as_str) {
                Some(text) => SnapshotVersion::new(decode_timestamp(text)?),
                // Deletes carry no update time; use the commit version.
                None => commit_version,
            };
            let transform_results = write_result
                .get("transformResults")
                .and_then(Json::as_array)
                .map(|values| values.iter().map(decode_value).collect::<SyncResult<Vec<_>>>())
                .transpose()?
                .unwrap_or_default();
            results.push(MutationResult {
                version,
                transform_results,
            });
        }
    }
    Ok(WriteResponse {
        stream_token,
        commit_version,
        results,
    })
}

fn decode_target_ids(json: Option<&Json>) -> Vec<TargetId> {
    json.and_then(Json::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(|id| id.as_i64().map(|id| id as TargetId))
                .collect()
        })
        .unwrap_or_default()
}

fn decode_cause(json: Option<&Json>) -> Option<SyncError> {
    let cause = json?;
    let code = cause
        .get("code")
        .and_then(Json::as_i64)
        .and_then(|code| SyncErrorCode::from_grpc_code(code as i32))
        .unwrap_or(SyncErrorCode::Internal);
    let message = cause
        .get("message")
        .and_then(Json::as_str)
        .unwrap_or("target error")
        .to_string();
    Some(SyncError::new(code, message))
}

/// Decodes one listen stream message into a watch change plus the snapshot
/// version the message carries (minimum when absent).
pub fn decode_watch_message(
    database_id: &DatabaseId,
    json: &Json,
) -> SyncResult<(WatchChange, SnapshotVersion)> {
    if let Some(target_change) = json.get("targetChange") {
        let state = match target_change
            .get("targetChangeType")
            .and_then(Json::as_str)
            .unwrap_or("NO_CHANGE")
        {
            "NO_CHANGE" => WatchTargetChangeState::NoChange,
            "ADD" => WatchTargetChangeState::Added,
            "REMOVE" => WatchTargetChangeState::Removed,
            "CURRENT" => WatchTargetChangeState::Current,
            "RESET" => WatchTargetChangeState::Reset,
            other => {
                return Err(invalid_argument(format!(
                    "unknown targetChangeType: {other}"
                )))
            }
        };
        let mut change = WatchTargetChange::new(state, decode_target_ids(target_change.get("targetIds")));
        if let Some(token) = target_change.get("resumeToken").and_then(Json::as_str) {
            change.resume_token = BASE64
                .decode(token)
                .map_err(|err| invalid_argument(format!("bad resumeToken: {err}")))?;
        }
        change.cause = decode_cause(target_change.get("cause"));
        let version = decode_version(target_change.get("readTime"))?;
        return Ok((WatchChange::Target(change), version));
    }

    if let Some(document_change) = json.get("documentChange") {
        let document = document_change
            .get("document")
            .ok_or_else(|| invalid_argument("documentChange without document"))?;
        let name = document
            .get("name")
            .and_then(Json::as_str)
            .ok_or_else(|| invalid_argument("document without name"))?;
        let key = decode_document_key(database_id, name)?;
        let version = decode_version(document.get("updateTime"))?;
        let data = decode_fields(document.get("fields"))?;
        let doc = MutableDocument::found_document(key.clone(), version, data);
        return Ok((
            WatchChange::Document {
                updated_target_ids: decode_target_ids(document_change.get("targetIds")),
                removed_target_ids: decode_target_ids(document_change.get("removedTargetIds")),
                key,
                new_document: Some(doc),
            },
            SnapshotVersion::min(),
        ));
    }

    if let Some(document_delete) = json.get("documentDelete") {
        let name = document_delete
            .get("document")
            .and_then(Json::as_str)
            .ok_or_else(|| invalid_argument("documentDelete without document"))?;
        let key = decode_document_key(database_id, name)?;
        let version = decode_version(document_delete.get("readTime"))?;
        let doc = MutableDocument::no_document(key.clone(), version);
        return Ok((
            WatchChange::Document {
                updated_target_ids: Vec::new(),
                removed_target_ids: decode_target_ids(document_delete.get("removedTargetIds")),
                key,
                new_document: Some(doc),
            },
            SnapshotVersion::min(),
        ));
    }

    if let Some(document_remove) = json.get("documentRemove") {
        let name = document_remove
            .get("document")
            .and_then(Json::as_str)
            .ok_or_else(|| invalid_argument("documentRemove without document"))?;
        let key = decode_document_key(database_id, name)?;
        return Ok((
            WatchChange::Document {
                updated_target_ids: Vec::new(),
                removed_target_ids: decode_target_ids(document_remove.get("removedTargetIds")),
                key,
                new_document: None,
            },
            SnapshotVersion::min(),
        ));
    }

    if let Some(filter) = json.get("filter") {
        let target_id = filter
            .get("targetId")
            .and_then(Json::as_i64)
            .ok_or_else(|| invalid_argument("filter without targetId"))? as TargetId;
        let count = filter.get("count").and_then(Json::as_i64).unwrap_or(0) as i32;
        let mut existence_filter = ExistenceFilter::new(count);
        if let Some(unchanged) = filter.get("unchangedNames") {
            let bitmap = unchanged
                .get("bits")
                .and_then(|bits| bits.get("bitmap"))
                .and_then(Json::as_str)
                .unwrap_or("");
            let padding = unchanged
                .get("bits")
                .and_then(|bits| bits.get("padding"))
                .and_then(Json::as_i64)
                .unwrap_or(0) as u32;
            let hash_count = unchanged
                .get("hashCount")
                .and_then(Json::as_i64)
                .unwrap_or(0) as u32;
            let bits = BASE64
                .decode(bitmap)
                .map_err(|err| invalid_argument(format!("bad bloom bitmap: {err}")))?;
            if let Some(bloom) = BloomFilter::new(bits, padding, hash_count) {
                existence_filter = existence_filter.with_unchanged_names(bloom);
            }
        }
        return Ok((
            WatchChange::ExistenceFilter {
                target_id,
                filter: existence_filter,
            },
            SnapshotVersion::min(),
        ));
    }

    Err(invalid_argument("unrecognized watch message"))
}
