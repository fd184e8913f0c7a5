//! Native boolean query tree
//!
//! Compiled queries are immutable values. Negation is a pure transform that
//! pushes the inversion down (De Morgan on composites, operator flip on
//! single-valued ranges) so rendered queries stay compact.

use std::fmt;

use crate::codec::WireType;
use crate::query::path::ElementPath;

/// Comparison operator of a range query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RangeOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl RangeOp {
    /// Complementary operator.
    pub fn flip(self) -> RangeOp {
        match self {
            RangeOp::Eq => RangeOp::Ne,
            RangeOp::Ne => RangeOp::Eq,
            RangeOp::Lt => RangeOp::Ge,
            RangeOp::Ge => RangeOp::Lt,
            RangeOp::Gt => RangeOp::Le,
            RangeOp::Le => RangeOp::Gt,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            RangeOp::Eq => "=",
            RangeOp::Ne => "!=",
            RangeOp::Lt => "<",
            RangeOp::Le => "<=",
            RangeOp::Gt => ">",
            RangeOp::Ge => ">=",
        }
    }
}

/// Options of a value query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MatchOptions {
    pub case_insensitive: bool,
    /// `*` and `?` in the values are wildcards (`\` escapes them)
    pub wildcarded: bool,
}

impl MatchOptions {
    pub fn exact() -> Self {
        Self::default()
    }

    pub fn pattern(case_insensitive: bool) -> Self {
        Self {
            case_insensitive,
            wildcarded: true,
        }
    }
}

/// Compiled query node.
///
/// Paths are relative to the enclosing [`QueryNode::Scoped`] element, or to
/// the document root at top level. Value, range and word queries reaching a
/// list element match against its members.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryNode {
    And(Vec<QueryNode>),
    Or(Vec<QueryNode>),
    Not(Box<QueryNode>),
    /// Some value at `path` equals one of `values`
    Value {
        path: ElementPath,
        values: Vec<String>,
        options: MatchOptions,
    },
    /// Typed comparison of the value at `path`; `list` marks list fields,
    /// whose negation must read "no member matches"
    Range {
        path: ElementPath,
        wire_type: WireType,
        op: RangeOp,
        value: String,
        list: bool,
    },
    /// An element is stored at `path`
    Exists { path: ElementPath },
    /// `query` holds within one single element reached by `prefix`
    Scoped {
        prefix: ElementPath,
        query: Box<QueryNode>,
    },
    /// Fulltext word or phrase, anywhere below `path` (or the document)
    Word {
        path: Option<ElementPath>,
        text: String,
        phrase: bool,
    },
}

impl QueryNode {
    /// Matches every document.
    pub fn all() -> QueryNode {
        QueryNode::And(Vec::new())
    }

    /// Matches no document.
    pub fn none() -> QueryNode {
        QueryNode::Or(Vec::new())
    }

    pub fn value(path: ElementPath, value: impl Into<String>) -> QueryNode {
        QueryNode::Value {
            path,
            values: vec![value.into()],
            options: MatchOptions::exact(),
        }
    }

    pub fn values<I, S>(path: ElementPath, values: I) -> QueryNode
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        QueryNode::Value {
            path,
            values: values.into_iter().map(Into::into).collect(),
            options: MatchOptions::exact(),
        }
    }

    pub fn exists(path: ElementPath) -> QueryNode {
        QueryNode::Exists { path }
    }

    pub fn scoped(prefix: ElementPath, query: QueryNode) -> QueryNode {
        QueryNode::Scoped {
            prefix,
            query: Box::new(query),
        }
    }

    /// Conjunction, flattening nested conjunctions and dropping match-alls.
    pub fn and(children: Vec<QueryNode>) -> QueryNode {
        let mut flat = Vec::with_capacity(children.len());
        for child in children {
            match child {
                QueryNode::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.pop().unwrap_or_else(QueryNode::all)
        } else {
            QueryNode::And(flat)
        }
    }

    /// Disjunction, flattening nested disjunctions.
    pub fn or(children: Vec<QueryNode>) -> QueryNode {
        let mut flat = Vec::with_capacity(children.len());
        for child in children {
            match child {
                QueryNode::Or(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.pop().unwrap_or_else(QueryNode::none)
        } else {
            QueryNode::Or(flat)
        }
    }

    /// Logical inverse of this node.
    pub fn negate(self) -> QueryNode {
        match self {
            QueryNode::And(children) => {
                QueryNode::Or(children.into_iter().map(QueryNode::negate).collect())
            }
            QueryNode::Or(children) => {
                QueryNode::And(children.into_iter().map(QueryNode::negate).collect())
            }
            QueryNode::Not(inner) => *inner,
            QueryNode::Range {
                path,
                wire_type,
                op,
                value,
                list: false,
            } => QueryNode::Range {
                path,
                wire_type,
                op: op.flip(),
                value,
                list: false,
            },
            other => QueryNode::Not(Box::new(other)),
        }
    }

    /// Rewrite every path of this node relative to `prefix`.
    ///
    /// Paths not under `prefix` are left untouched.
    pub fn relative_to(self, prefix: &ElementPath) -> QueryNode {
        let strip = |p: ElementPath| p.strip_prefix(prefix).unwrap_or(p);
        match self {
            QueryNode::And(c) => QueryNode::And(c.into_iter().map(|n| n.relative_to(prefix)).collect()),
            QueryNode::Or(c) => QueryNode::Or(c.into_iter().map(|n| n.relative_to(prefix)).collect()),
            QueryNode::Not(inner) => QueryNode::Not(Box::new(inner.relative_to(prefix))),
            QueryNode::Value {
                path,
                values,
                options,
            } => QueryNode::Value {
                path: strip(path),
                values,
                options,
            },
            QueryNode::Range {
                path,
                wire_type,
                op,
                value,
                list,
            } => QueryNode::Range {
                path: strip(path),
                wire_type,
                op,
                value,
                list,
            },
            QueryNode::Exists { path } => QueryNode::Exists { path: strip(path) },
            QueryNode::Scoped { prefix: p, query } => QueryNode::Scoped {
                prefix: strip(p),
                query,
            },
            QueryNode::Word { path, text, phrase } => QueryNode::Word {
                path: path.map(strip),
                text,
                phrase,
            },
        }
    }

    /// Whether any fulltext word query appears in this tree.
    pub fn has_words(&self) -> bool {
        match self {
            QueryNode::And(c) | QueryNode::Or(c) => c.iter().any(QueryNode::has_words),
            QueryNode::Not(inner) => inner.has_words(),
            QueryNode::Scoped { query, .. } => query.has_words(),
            QueryNode::Word { .. } => true,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn quote(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\"\"")?,
            '&' => f.write_str("&amp;")?,
            c => write!(f, "{c}")?,
        }
    }
    f.write_str("\"")
}

fn list(f: &mut fmt::Formatter<'_>, children: &[QueryNode]) -> fmt::Result {
    f.write_str("(")?;
    for (i, c) in children.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{c}")?;
    }
    f.write_str(")")
}

/// Renders the native query text sent to the server.
impl fmt::Display for QueryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryNode::And(children) => {
                f.write_str("and-query(")?;
                list(f, children)?;
                f.write_str(")")
            }
            QueryNode::Or(children) => {
                f.write_str("or-query(")?;
                list(f, children)?;
                f.write_str(")")
            }
            QueryNode::Not(inner) => write!(f, "not-query({inner})"),
            QueryNode::Value {
                path,
                values,
                options,
            } => {
                write!(f, "element-value-query({path}, (")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    quote(f, v)?;
                }
                f.write_str("), (")?;
                let mut opts = Vec::new();
                opts.push(if options.case_insensitive {
                    "\"case-insensitive\""
                } else {
                    "\"case-sensitive\""
                });
                if options.wildcarded {
                    opts.push("\"wildcarded\"");
                }
                write!(f, "{}))", opts.join(", "))
            }
            QueryNode::Range {
                path,
                wire_type,
                op,
                value,
                ..
            } => {
                write!(f, "element-range-query({path}, \"{}\", xs:{wire_type}(", op.symbol())?;
                quote(f, value)?;
                f.write_str("))")
            }
            QueryNode::Exists { path } => write!(f, "element-query({path}, and-query(()))"),
            QueryNode::Scoped { prefix, query } => write!(f, "element-query({prefix}, {query})"),
            QueryNode::Word { path, text, phrase } => {
                match path {
                    Some(p) => write!(f, "element-word-query({p}, ")?,
                    None => f.write_str("word-query(")?,
                }
                quote(f, text)?;
                let kind = if *phrase { ", \"phrase\"" } else { "" };
                write!(
                    f,
                    ", (\"case-insensitive\", \"diacritic-sensitive\", \"stemmed\"{kind}))"
                )
            }
        }
    }
}
