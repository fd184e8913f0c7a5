//! Field type catalogs loaded from JSON.
//!
//! A catalog file maps field keys to types:
//!
//! ```json
//! {
//!   "dc:title": "string",
//!   "dc:subjects": "string[]",
//!   "file:content": "blob",
//!   "files:files": [{ "file": "blob", "label": "string" }],
//!   "geo:point": { "lat": "double", "lon": "double" }
//! }
//! ```

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use treedoc_store::{FieldType, TypeCatalog, WireType};

fn field_type(key: &str, decl: &Value) -> Result<FieldType> {
    match decl {
        Value::String(name) if name == "blob" => Ok(FieldType::Blob),
        Value::String(name) => match name.strip_suffix("[]") {
            Some(member) => Ok(FieldType::ScalarList(wire_type(key, member)?)),
            None => Ok(FieldType::Scalar(wire_type(key, name)?)),
        },
        Value::Object(fields) => Ok(FieldType::complex(sub_fields(fields)?)),
        Value::Array(items) => match items.as_slice() {
            [Value::Object(fields)] => Ok(FieldType::complex_list(sub_fields(fields)?)),
            _ => bail!("{key}: a complex list is declared as [{{...}}]"),
        },
        other => bail!("{key}: unsupported type declaration {other}"),
    }
}

fn wire_type(key: &str, name: &str) -> Result<WireType> {
    name.parse::<WireType>().map_err(|e| anyhow!("{key}: {e}"))
}

fn sub_fields(fields: &serde_json::Map<String, Value>) -> Result<Vec<(String, FieldType)>> {
    fields
        .iter()
        .map(|(name, decl)| Ok((name.clone(), field_type(name, decl)?)))
        .collect()
}

/// Build a catalog from the JSON form above.
pub fn parse_catalog(json: &str) -> Result<TypeCatalog> {
    let declared: serde_json::Map<String, Value> =
        serde_json::from_str(json).context("catalog is not a JSON object")?;
    declared
        .iter()
        .try_fold(TypeCatalog::new(), |catalog, (key, decl)| {
            Ok(catalog.with_field(key.as_str(), field_type(key, decl)?))
        })
}

/// Load a catalog file; no file means system fields only.
pub fn load_catalog(path: Option<&Path>) -> Result<TypeCatalog> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read catalog {}", path.display()))?;
            parse_catalog(&json)
        }
        None => Ok(TypeCatalog::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_catalog() {
        let catalog = parse_catalog(
            r#"{
                "dc:title": "string",
                "dc:subjects": "string[]",
                "files:files": [{ "file": "blob", "label": "string" }],
                "geo:point": { "lat": "double" }
            }"#,
        )
        .unwrap();
        assert_eq!(
            catalog.field("dc:title"),
            Some(&FieldType::Scalar(WireType::String))
        );
        assert_eq!(
            catalog.field("dc:subjects"),
            Some(&FieldType::ScalarList(WireType::String))
        );
        assert!(matches!(
            catalog.field("files:files"),
            Some(FieldType::ComplexList(_))
        ));
        assert_eq!(
            catalog.field("geo:point").and_then(|t| t.sub_field("lat")),
            Some(&FieldType::Scalar(WireType::Double))
        );
    }

    #[test]
    fn test_rejects_unknown_types() {
        assert!(parse_catalog(r#"{ "x": "integer" }"#).is_err());
        assert!(parse_catalog(r#"{ "x": 3 }"#).is_err());
        assert!(parse_catalog("[]").is_err());
    }
}
