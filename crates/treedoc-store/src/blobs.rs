//! Blob reference discovery
//!
//! Binary content lives outside the records; a record only stores blob keys
//! in the `data` sub-field of its blob-typed fields. Garbage collection marks
//! every key still referenced by some record.

use crate::schema::{FieldType, TypeCatalog, BLOB_DATA};
use crate::state::{State, Value};

/// Whether a field type holds blobs anywhere below it.
pub fn contains_blob(field_type: &FieldType) -> bool {
    match field_type {
        FieldType::Blob => true,
        FieldType::Complex(fields) | FieldType::ComplexList(fields) => {
            fields.values().any(contains_blob)
        }
        FieldType::Scalar(_) | FieldType::ScalarList(_) => false,
    }
}

/// Top-level fields of the catalog that may reference blobs, sorted.
pub fn blob_fields(catalog: &TypeCatalog) -> Vec<&str> {
    let mut fields: Vec<&str> = catalog
        .fields()
        .filter(|(_, t)| contains_blob(t))
        .map(|(name, _)| name.as_str())
        .collect();
    fields.sort_unstable();
    fields
}

fn collect(value: &Value, field_type: &FieldType, out: &mut Vec<String>) {
    match (field_type, value) {
        (FieldType::Blob, Value::State(blob)) => {
            if let Some(key) = blob.get(BLOB_DATA).and_then(Value::as_str) {
                if !key.is_empty() {
                    out.push(key.to_string());
                }
            }
        }
        (FieldType::Complex(fields), Value::State(state)) => collect_state(state, fields, out),
        (FieldType::ComplexList(fields), Value::List(items)) => {
            for item in items {
                collect_state(item, fields, out);
            }
        }
        _ => {}
    }
}

fn collect_state(
    state: &State,
    fields: &std::collections::BTreeMap<String, FieldType>,
    out: &mut Vec<String>,
) {
    for (name, field_type) in fields {
        if let Some(value) = state.get(name) {
            collect(value, field_type, out);
        }
    }
}

/// Blob keys referenced by one record.
pub fn referenced_blob_keys(state: &State, catalog: &TypeCatalog) -> Vec<String> {
    let mut out = Vec::new();
    for name in blob_fields(catalog) {
        if let (Some(value), Some(field_type)) = (state.get(name), catalog.field(name)) {
            collect(value, field_type, &mut out);
        }
    }
    out
}
