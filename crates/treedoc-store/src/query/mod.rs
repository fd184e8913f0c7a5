//! Query compilation
//!
//! An already-parsed [`Expression`](crate::expr::Expression) is turned into
//! a [`CompiledQuery`]: a native boolean [`QueryNode`] tree, sort directives
//! and a projection. Compilation is pure; all validation errors surface here
//! before any backend call.

mod compiler;
pub mod node;
pub mod path;
pub mod projection;

pub use compiler::{CompilerConfig, PathResolver, QueryCompiler, TrashMode};
pub(crate) use compiler::{like_to_wildcard, wildcard_match};
pub use node::{MatchOptions, QueryNode, RangeOp};
pub use path::{resolve, ElementPath, FieldInfo, Step, Wildcard};
pub use projection::{Rematch, WildcardRematch};

use crate::codec::WireType;
use crate::expr::Expression;

/// Query pseudo-field addressing the record hierarchy.
pub const KEY_PATH: &str = "ecm:path";
/// Query pseudo-field for fulltext search (`ecm:fulltext.<field>` restricts it).
pub const KEY_FULLTEXT: &str = "ecm:fulltext";
/// Query pseudo-field for facet membership.
pub const KEY_MIXIN_TYPE: &str = "ecm:mixinType";

/// One sort key of a compiled query.
#[derive(Debug, Clone, PartialEq)]
pub enum SortDirective {
    /// Fulltext relevance, best first
    Relevance,
    /// Range index order
    Index {
        field: String,
        path: ElementPath,
        wire_type: WireType,
        descending: bool,
    },
}

/// A field extracted server-side.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedField {
    pub name: String,
    /// `None` for the relevance score, which is not stored
    pub path: Option<ElementPath>,
}

/// How result rows are produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Whole records
    Full,
    /// Native field extraction
    Fields(Vec<ProjectedField>),
    /// Whole records re-evaluated client side, one row per matching binding
    /// of the wildcards in `fields`
    Manual { fields: Vec<String> },
}

/// Output of the compiler.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub query: QueryNode,
    pub order_by: Vec<SortDirective>,
    pub projection: Projection,
    pub has_fulltext: bool,
    /// Source filter, kept for client-side re-evaluation
    pub filter: Expression,
}

impl CompiledQuery {
    /// Native query text.
    pub fn render(&self) -> String {
        self.query.to_string()
    }

    pub fn is_manual_projection(&self) -> bool {
        matches!(self.projection, Projection::Manual { .. })
    }
}
