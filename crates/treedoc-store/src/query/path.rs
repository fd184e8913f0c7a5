//! Field references resolved to element paths
//!
//! A reference such as `files/*1/file/length` becomes the element path
//! `files/__array_item/file/length` plus what the catalog knows about the
//! leaf: wire type, list-ness, blob-ness and the true-or-absent convention.

use std::fmt;

use crate::codec::{self, WireType, ARRAY_ITEM};
use crate::error::StoreError;
use crate::schema::{FieldType, TypeCatalog};
use crate::state::KEY_ACP;
use crate::Result;

/// Pseudo-field mapped onto the stored access control policies.
pub const KEY_ACL: &str = "ecm:acl";

/// One step of an [`ElementPath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Step {
    /// Child element (escaped name)
    Element(String),
    /// List member: any (`None`) or the 0-based n-th
    Item(Option<usize>),
}

/// Path of elements below a document or scope root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ElementPath {
    steps: Vec<Step>,
}

impl ElementPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path to a top-level field, escaping the key.
    pub fn field(key: &str) -> Self {
        Self::new().child(key)
    }

    pub fn from_steps(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// Extend with a field key (escaped here).
    pub fn child(&self, key: &str) -> Self {
        let mut steps = self.steps.clone();
        steps.push(Step::Element(codec::serialize_key(key)));
        Self { steps }
    }

    pub fn item(&self, index: Option<usize>) -> Self {
        let mut steps = self.steps.clone();
        steps.push(Step::Item(index));
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// First `n` steps.
    pub fn prefix(&self, n: usize) -> ElementPath {
        Self {
            steps: self.steps[..n.min(self.steps.len())].to_vec(),
        }
    }

    pub fn starts_with(&self, prefix: &ElementPath) -> bool {
        self.steps.starts_with(&prefix.steps)
    }

    /// Remaining steps after `prefix`, if this path starts with it.
    pub fn strip_prefix(&self, prefix: &ElementPath) -> Option<ElementPath> {
        self.steps
            .strip_prefix(prefix.steps.as_slice())
            .map(|rest| Self {
                steps: rest.to_vec(),
            })
    }

    /// Parent path and the final step.
    pub fn split_last(&self) -> Option<(ElementPath, &Step)> {
        self.steps.split_last().map(|(last, parent)| {
            (
                Self {
                    steps: parent.to_vec(),
                },
                last,
            )
        })
    }

    /// Escaped name of the last element step.
    pub fn last_element(&self) -> Option<&str> {
        self.steps.iter().rev().find_map(|s| match s {
            Step::Element(name) => Some(name.as_str()),
            Step::Item(_) => None,
        })
    }

    pub fn has_wildcard(&self) -> bool {
        self.steps.iter().any(|s| matches!(s, Step::Item(None)))
    }
}

impl fmt::Display for ElementPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.steps.is_empty() {
            return f.write_str(".");
        }
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            match step {
                Step::Element(name) => f.write_str(name)?,
                Step::Item(None) => f.write_str(ARRAY_ITEM)?,
                Step::Item(Some(n)) => write!(f, "{}[{}]", ARRAY_ITEM, n + 1)?,
            }
        }
        Ok(())
    }
}

/// Wildcard segment of a resolved reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wildcard {
    /// Index of the `Item(None)` step in the path
    pub step: usize,
    /// Correlation label of a named wildcard (`*1` has label `1`)
    pub label: Option<String>,
}

/// What the compiler knows about a field reference.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    pub name: String,
    pub path: ElementPath,
    pub wildcards: Vec<Wildcard>,
    pub wire_type: Option<WireType>,
    pub is_list: bool,
    pub true_or_absent: bool,
    pub is_blob: bool,
}

impl FieldInfo {
    pub fn has_wildcard(&self) -> bool {
        !self.wildcards.is_empty()
    }

    /// First wildcard carrying a correlation label.
    pub fn first_named(&self) -> Option<&Wildcard> {
        self.wildcards.iter().find(|w| w.label.is_some())
    }

    pub fn last_wildcard(&self) -> Option<&Wildcard> {
        self.wildcards.last()
    }

    /// Canonical key of the leaf field, used for range index lookups.
    pub fn leaf_key(&self) -> Option<String> {
        self.path.last_element().map(codec::deserialize_key)
    }
}

/// Split a reference into its `/` segments.
pub fn segments(name: &str) -> Vec<&str> {
    name.split('/').collect()
}

/// Whether a reference segment is `*` or `*label`.
pub fn is_wildcard(segment: &str) -> bool {
    segment.starts_with('*')
}

pub fn wildcard_label(segment: &str) -> Option<&str> {
    segment.strip_prefix('*').filter(|l| !l.is_empty())
}

/// `ecm:acl/*1/principal` addresses the stored `ecm:acp/*1/acl/*1.ace/user`.
fn expand_acl(segments: Vec<&str>, name: &str) -> Result<Vec<String>> {
    if segments.len() != 3 || !is_wildcard(segments[1]) {
        return Err(StoreError::parse(format!(
            "{name}: ACL references take the form {KEY_ACL}/*N/<field>"
        )));
    }
    let outer = segments[1];
    let inner = match wildcard_label(outer) {
        Some(label) => format!("*{label}.ace"),
        None => "*".to_string(),
    };
    let leaf = match segments[2] {
        "name" => return Ok(vec![KEY_ACP.into(), outer.into(), "name".into()]),
        "principal" => "user",
        "permission" => "perm",
        "grant" => "grant",
        "creator" => "creator",
        "begin" => "begin",
        "end" => "end",
        other => {
            return Err(StoreError::parse(format!(
                "{name}: unknown ACL field {other}"
            )))
        }
    };
    Ok(vec![
        KEY_ACP.into(),
        outer.into(),
        "acl".into(),
        inner,
        leaf.into(),
    ])
}

/// Segments of a reference, with ACL pseudo-paths mapped onto stored ones.
pub(crate) fn reference_segments(name: &str) -> Result<Vec<String>> {
    let raw = segments(name);
    if raw[0] == KEY_ACL {
        expand_acl(raw, name)
    } else {
        Ok(raw.into_iter().map(str::to_string).collect())
    }
}

#[derive(Clone, Copy)]
enum Cursor<'a> {
    Unknown,
    Field(&'a FieldType),
    Member(&'a FieldType),
}

/// Resolve a field reference against the catalog.
pub fn resolve(name: &str, catalog: &TypeCatalog) -> Result<FieldInfo> {
    if name.is_empty() || name.split('/').any(str::is_empty) {
        return Err(StoreError::parse(format!("invalid field reference: {name:?}")));
    }
    let owned = reference_segments(name)?;

    let first = owned[0].as_str();
    if is_wildcard(first) || first.parse::<usize>().is_ok() {
        return Err(StoreError::parse(format!(
            "{name}: reference must start with a field"
        )));
    }

    let mut path = ElementPath::field(first);
    let mut wildcards = Vec::new();
    let mut cursor = catalog
        .field(first)
        .map(Cursor::Field)
        .unwrap_or(Cursor::Unknown);

    for segment in &owned[1..] {
        let segment = segment.as_str();
        let index = segment.parse::<usize>().ok();
        if is_wildcard(segment) || index.is_some() {
            cursor = match cursor {
                Cursor::Field(t) if t.is_list() => Cursor::Member(t),
                Cursor::Unknown => Cursor::Unknown,
                _ => {
                    return Err(StoreError::parse(format!(
                        "{name}: {segment} applied to a non-list field"
                    )))
                }
            };
            if index.is_none() {
                wildcards.push(Wildcard {
                    step: path.len(),
                    label: wildcard_label(segment).map(str::to_string),
                });
            }
            path = path.item(index);
        } else {
            cursor = match cursor {
                Cursor::Field(t) | Cursor::Member(t) => t
                    .sub_field(segment)
                    .map(Cursor::Field)
                    .unwrap_or(Cursor::Unknown),
                Cursor::Unknown => Cursor::Unknown,
            };
            path = path.child(segment);
        }
    }

    let (wire_type, is_list, is_blob) = match cursor {
        Cursor::Field(t) => (t.wire_type(), t.is_list(), matches!(t, FieldType::Blob)),
        Cursor::Member(t) => (t.wire_type(), false, false),
        Cursor::Unknown => (None, false, false),
    };

    Ok(FieldInfo {
        name: name.to_string(),
        path,
        wildcards,
        wire_type,
        is_list,
        true_or_absent: owned.len() == 1 && catalog.is_true_or_absent(first),
        is_blob,
    })
}
