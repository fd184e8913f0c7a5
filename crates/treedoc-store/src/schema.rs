//! Static type knowledge consulted by the query compiler, the patch builder
//! and blob discovery.
//!
//! The catalog knows:
//! - field types (`dc:title` is a string, `dc:contributors` a string list, ...)
//! - document types and the facets they declare
//! - which facets may be added to individual records
//! - which booleans are stored "true or absent" (false is never written)

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::codec::WireType;
use crate::state::{
    KEY_ANCESTOR_IDS, KEY_ID, KEY_IS_PROXY, KEY_IS_TRASHED, KEY_IS_VERSION, KEY_LIFECYCLE_STATE,
    KEY_LOCK_CREATED, KEY_LOCK_OWNER, KEY_MIXIN_TYPES, KEY_NAME, KEY_PARENT_ID, KEY_PRIMARY_TYPE,
    KEY_READ_ACL,
};

/// Key of the blob key inside a blob value.
pub const BLOB_DATA: &str = "data";

/// Static type of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Scalar(WireType),
    ScalarList(WireType),
    Complex(BTreeMap<String, FieldType>),
    ComplexList(BTreeMap<String, FieldType>),
    /// Reference to externally stored binary content; the blob key lives in
    /// the `data` sub-field
    Blob,
}

impl FieldType {
    pub fn complex<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, FieldType)>,
        K: Into<String>,
    {
        FieldType::Complex(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn complex_list<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, FieldType)>,
        K: Into<String>,
    {
        FieldType::ComplexList(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_list(&self) -> bool {
        matches!(self, FieldType::ScalarList(_) | FieldType::ComplexList(_))
    }

    /// Wire type of the scalar (or scalar list member), if any.
    pub fn wire_type(&self) -> Option<WireType> {
        match self {
            FieldType::Scalar(t) | FieldType::ScalarList(t) => Some(*t),
            _ => None,
        }
    }

    /// Type of a named sub-field of a complex type.
    pub fn sub_field(&self, name: &str) -> Option<&FieldType> {
        match self {
            FieldType::Complex(fields) | FieldType::ComplexList(fields) => fields.get(name),
            FieldType::Blob => blob_sub_field(name),
            _ => None,
        }
    }
}

static BLOB_STRING: FieldType = FieldType::Scalar(WireType::String);
static BLOB_LENGTH: FieldType = FieldType::Scalar(WireType::Long);

fn blob_sub_field(name: &str) -> Option<&'static FieldType> {
    match name {
        "name" | "mime-type" | "encoding" | "digest" | BLOB_DATA => Some(&BLOB_STRING),
        "length" => Some(&BLOB_LENGTH),
        _ => None,
    }
}

/// A document type and the facets it declares.
#[derive(Debug, Clone, Default)]
pub struct DocumentType {
    pub name: String,
    pub facets: HashSet<String>,
}

/// A facet (mixin type).
#[derive(Debug, Clone)]
pub struct Facet {
    pub name: String,
    /// Whether the facet may be added to an individual record
    pub per_instance: bool,
}

/// Field, type and facet registry.
#[derive(Debug, Clone, Default)]
pub struct TypeCatalog {
    fields: HashMap<String, FieldType>,
    true_or_absent: HashSet<String>,
    document_types: BTreeMap<String, DocumentType>,
    facets: HashMap<String, Facet>,
}

impl TypeCatalog {
    /// Empty catalog with only the system fields registered.
    pub fn new() -> Self {
        let mut catalog = Self::default();
        catalog.register_system_fields();
        catalog
    }

    fn register_system_fields(&mut self) {
        let string = FieldType::Scalar(WireType::String);
        for key in [
            KEY_ID,
            KEY_PARENT_ID,
            KEY_NAME,
            KEY_PRIMARY_TYPE,
            KEY_LIFECYCLE_STATE,
            KEY_LOCK_OWNER,
        ] {
            self.fields.insert(key.to_string(), string.clone());
        }
        self.fields
            .insert(KEY_LOCK_CREATED.to_string(), FieldType::Scalar(WireType::Calendar));
        for key in [KEY_MIXIN_TYPES, KEY_ANCESTOR_IDS, KEY_READ_ACL] {
            self.fields
                .insert(key.to_string(), FieldType::ScalarList(WireType::String));
        }
        for key in [KEY_IS_PROXY, KEY_IS_VERSION, KEY_IS_TRASHED] {
            self.fields
                .insert(key.to_string(), FieldType::Scalar(WireType::Boolean));
            self.true_or_absent.insert(key.to_string());
        }
        self.fields.insert(
            crate::state::KEY_ACP.to_string(),
            FieldType::complex_list([
                ("name", FieldType::Scalar(WireType::String)),
                (
                    "acl",
                    FieldType::complex_list([
                        ("user", FieldType::Scalar(WireType::String)),
                        ("perm", FieldType::Scalar(WireType::String)),
                        ("grant", FieldType::Scalar(WireType::Boolean)),
                        ("creator", FieldType::Scalar(WireType::String)),
                        ("begin", FieldType::Scalar(WireType::Calendar)),
                        ("end", FieldType::Scalar(WireType::Calendar)),
                    ]),
                ),
            ]),
        );
    }

    /// Register a top-level field.
    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(name.into(), field_type);
        self
    }

    /// Register a boolean stored only when true.
    pub fn with_true_or_absent(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.fields
            .insert(name.clone(), FieldType::Scalar(WireType::Boolean));
        self.true_or_absent.insert(name);
        self
    }

    pub fn with_document_type<I, S>(mut self, name: impl Into<String>, facets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        self.document_types.insert(
            name.clone(),
            DocumentType {
                name,
                facets: facets.into_iter().map(Into::into).collect(),
            },
        );
        self
    }

    pub fn with_facet(mut self, name: impl Into<String>, per_instance: bool) -> Self {
        let name = name.into();
        self.facets.insert(name.clone(), Facet { name, per_instance });
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldType> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &FieldType)> {
        self.fields.iter()
    }

    pub fn is_true_or_absent(&self, name: &str) -> bool {
        self.true_or_absent.contains(name)
    }

    /// Document types whose definition includes `facet`, sorted by name.
    pub fn document_types_with_facet(&self, facet: &str) -> Vec<String> {
        self.document_types
            .values()
            .filter(|t| t.facets.contains(facet))
            .map(|t| t.name.clone())
            .collect()
    }

    /// Facets that can never be added to a single record.
    ///
    /// Unknown facets are treated as per-instance.
    pub fn is_never_per_instance(&self, facet: &str) -> bool {
        self.facets.get(facet).map(|f| !f.per_instance).unwrap_or(false)
    }
}
