//! Patch builder
//!
//! Turns a [`StateDiff`] into tree-fragment operations anchored at the record
//! root. Numeric deltas become [`PatchOp::ApplyDelta`] so the backend
//! increments in place instead of the adapter reading then writing.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::codec;
use crate::error::StoreError;
use crate::query::ElementPath;
use crate::schema::{FieldType, TypeCatalog};
use crate::state::{Delta, DiffValue, ListDiff, ListEntry, StateDiff, Value};
use crate::tree::{self, Element};
use crate::Result;

/// One fragment operation of a patch.
///
/// Item positions are 1-based, counted among the `__array_item` children of
/// the list element.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp {
    /// Replace the child of `parent` named like `fragment`, or append it
    Upsert { parent: ElementPath, fragment: Element },
    /// Remove a node; absent nodes are ignored
    Delete { path: ElementPath },
    ReplaceItem {
        list: ElementPath,
        position: usize,
        fragment: Element,
    },
    DeleteItem { list: ElementPath, position: usize },
    InsertLast { list: ElementPath, fragment: Element },
    /// Add `delta` to the numeric leaf at `path` (created when absent)
    ApplyDelta { path: ElementPath, delta: Delta },
}

/// Numeric increment as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum WireDelta {
    Long(i64),
    Double(f64),
}

impl From<Delta> for WireDelta {
    fn from(delta: Delta) -> Self {
        match delta {
            Delta::Long(l) => WireDelta::Long(l),
            Delta::Double(d) => WireDelta::Double(d),
        }
    }
}

impl From<WireDelta> for Delta {
    fn from(delta: WireDelta) -> Self {
        match delta {
            WireDelta::Long(l) => Delta::Long(l),
            WireDelta::Double(d) => Delta::Double(d),
        }
    }
}

struct Builder<'a> {
    catalog: &'a TypeCatalog,
    ops: Vec<PatchOp>,
    // (list, 0-based indexes), emitted after everything else
    removals: Vec<(ElementPath, Vec<usize>)>,
}

/// Build the operations applying `diff` to a stored record.
pub fn build_patch(diff: &StateDiff, catalog: &TypeCatalog) -> Result<Vec<PatchOp>> {
    let mut builder = Builder {
        catalog,
        ops: Vec::new(),
        removals: Vec::new(),
    };
    builder.state(diff, &ElementPath::new(), None, "")?;

    let Builder {
        mut ops, removals, ..
    } = builder;
    for (list, mut indexes) in removals {
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        indexes.dedup();
        ops.extend(indexes.into_iter().map(|i| PatchOp::DeleteItem {
            list: list.clone(),
            position: i + 1,
        }));
    }
    trace!(ops = ops.len(), "built patch");
    Ok(ops)
}

fn qualified(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}/{key}")
    }
}

impl<'a> Builder<'a> {
    fn field_type(&self, owner: Option<&'a FieldType>, key: &str) -> Option<&'a FieldType> {
        match owner {
            None => self.catalog.field(key),
            Some(t) => t.sub_field(key),
        }
    }

    fn state(
        &mut self,
        diff: &StateDiff,
        parent: &ElementPath,
        owner: Option<&'a FieldType>,
        prefix: &str,
    ) -> Result<()> {
        for (key, change) in diff.iter() {
            let path = parent.child(key);
            let name = qualified(prefix, key);
            let field_type = self.field_type(owner, key);
            match change {
                DiffValue::Remove | DiffValue::Set(Value::Null) => {
                    self.ops.push(PatchOp::Delete { path });
                }
                DiffValue::Set(value) => {
                    let wire_name = codec::serialize_key(key);
                    match tree::value_to_element(&wire_name, value) {
                        Some(fragment) => self.ops.push(PatchOp::Upsert {
                            parent: parent.clone(),
                            fragment,
                        }),
                        // an empty nested state is stored as absence
                        None => self.ops.push(PatchOp::Delete { path }),
                    }
                }
                DiffValue::Diff(nested) => {
                    if let Some(t) = field_type {
                        if !matches!(t, FieldType::Complex(_) | FieldType::Blob) {
                            return Err(StoreError::InvalidDiff {
                                field: name,
                                reason: "nested diff on a non-complex field".into(),
                            });
                        }
                    }
                    self.state(nested, &path, field_type, &name)?;
                }
                DiffValue::List(list) => self.list(list, &path, field_type, &name)?,
                DiffValue::Delta(delta) => {
                    check_numeric(field_type, &name, delta)?;
                    self.ops.push(PatchOp::ApplyDelta {
                        path,
                        delta: *delta,
                    });
                }
            }
        }
        Ok(())
    }

    fn list(
        &mut self,
        diff: &ListDiff,
        path: &ElementPath,
        field_type: Option<&'a FieldType>,
        name: &str,
    ) -> Result<()> {
        if let Some(t) = field_type {
            if !t.is_list() {
                return Err(StoreError::InvalidDiff {
                    field: name.to_string(),
                    reason: "list diff on a non-list field".into(),
                });
            }
        }
        if let Some(entries) = &diff.diff {
            let mut removed = Vec::new();
            for (i, entry) in entries.iter().enumerate() {
                match entry {
                    ListEntry::Nop => {}
                    ListEntry::Set(value) => self.ops.push(PatchOp::ReplaceItem {
                        list: path.clone(),
                        position: i + 1,
                        fragment: tree::item_to_element(value),
                    }),
                    ListEntry::Diff(nested) => {
                        let item = path.item(Some(i));
                        let item_type =
                            field_type.filter(|t| matches!(t, FieldType::ComplexList(_)));
                        self.state(nested, &item, item_type, &format!("{name}/{i}"))?;
                    }
                    ListEntry::Remove => removed.push(i),
                }
            }
            if !removed.is_empty() {
                self.removals.push((path.clone(), removed));
            }
        }
        if let Some(tail) = &diff.rpush {
            for value in tail {
                self.ops.push(PatchOp::InsertLast {
                    list: path.clone(),
                    fragment: tree::item_to_element(value),
                });
            }
        }
        Ok(())
    }
}

fn check_numeric(field_type: Option<&FieldType>, name: &str, delta: &Delta) -> Result<()> {
    match field_type {
        Some(FieldType::Scalar(t)) if t.is_numeric() => Ok(()),
        Some(other) => Err(StoreError::InvalidDiff {
            field: name.to_string(),
            reason: format!(
                "{} delta on a field of type {:?}",
                codec::WireType::classify_delta(delta),
                other
            ),
        }),
        None => Err(StoreError::InvalidDiff {
            field: name.to_string(),
            reason: "delta on a field not declared numeric".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WireType;
    use crate::query::Step;

    fn catalog() -> TypeCatalog {
        TypeCatalog::new()
            .with_field("count", FieldType::Scalar(WireType::Long))
            .with_field("dc:title", FieldType::Scalar(WireType::String))
            .with_field("tags", FieldType::ScalarList(WireType::String))
            .with_field(
                "views",
                FieldType::complex_list([("width", FieldType::Scalar(WireType::Long))]),
            )
    }

    #[test]
    fn test_scalar_set_and_remove() {
        let diff = StateDiff::new().set("dc:title", "Hello").remove("old");
        let ops = build_patch(&diff, &catalog()).unwrap();
        assert_eq!(
            ops,
            vec![
                PatchOp::Upsert {
                    parent: ElementPath::new(),
                    fragment: Element::leaf("dc__title", "string", "Hello"),
                },
                PatchOp::Delete {
                    path: ElementPath::field("old"),
                },
            ]
        );
    }

    #[test]
    fn test_list_overlay_and_push() {
        let diff = StateDiff::new().list(
            "tags",
            ListDiff::overlay(vec![
                ListEntry::Remove,
                ListEntry::Nop,
                ListEntry::Set("c".into()),
                ListEntry::Remove,
            ])
            .with_push(vec!["z".into()]),
        );
        let ops = build_patch(&diff, &catalog()).unwrap();
        let tags = ElementPath::field("tags");
        assert_eq!(
            ops,
            vec![
                PatchOp::ReplaceItem {
                    list: tags.clone(),
                    position: 3,
                    fragment: Element::leaf("__array_item", "string", "c"),
                },
                PatchOp::InsertLast {
                    list: tags.clone(),
                    fragment: Element::leaf("__array_item", "string", "z"),
                },
                PatchOp::DeleteItem {
                    list: tags.clone(),
                    position: 4,
                },
                PatchOp::DeleteItem {
                    list: tags,
                    position: 1,
                },
            ]
        );
    }

    #[test]
    fn test_nested_list_item_diff() {
        let diff = StateDiff::new().list(
            "views",
            ListDiff::overlay(vec![
                ListEntry::Nop,
                ListEntry::Diff(StateDiff::new().delta("width", Delta::Long(5))),
            ]),
        );
        let ops = build_patch(&diff, &catalog()).unwrap();
        assert_eq!(
            ops,
            vec![PatchOp::ApplyDelta {
                path: ElementPath::from_steps(vec![
                    Step::Element("views".into()),
                    Step::Item(Some(1)),
                    Step::Element("width".into()),
                ]),
                delta: Delta::Long(5),
            }]
        );
    }

    #[test]
    fn test_delta_requires_numeric_field() {
        let ok = StateDiff::new().delta("count", Delta::Long(1));
        assert!(build_patch(&ok, &catalog()).is_ok());

        let on_string = StateDiff::new().delta("dc:title", Delta::Long(1));
        assert!(matches!(
            build_patch(&on_string, &catalog()),
            Err(StoreError::InvalidDiff { .. })
        ));

        let unknown = StateDiff::new().delta("mystery", Delta::Double(1.5));
        assert!(matches!(
            build_patch(&unknown, &catalog()),
            Err(StoreError::InvalidDiff { .. })
        ));
    }

    #[test]
    fn test_empty_state_is_deleted() {
        let diff = StateDiff::new().set("blob", crate::state::State::new());
        assert_eq!(
            build_patch(&diff, &catalog()).unwrap(),
            vec![PatchOp::Delete {
                path: ElementPath::field("blob"),
            }]
        );
    }
}
