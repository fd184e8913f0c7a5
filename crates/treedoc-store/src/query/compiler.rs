use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::{self, WireType};
use crate::error::StoreError;
use crate::expr::{Expression, Literal, Operand, Operator, OrderByClause, Reference, SelectClause};
use crate::fulltext::{self, FulltextQuery};
use crate::query::node::{MatchOptions, QueryNode, RangeOp};
use crate::query::path::{self, ElementPath, FieldInfo, Wildcard};
use crate::query::{
    CompiledQuery, ProjectedField, Projection, SortDirective, KEY_FULLTEXT, KEY_MIXIN_TYPE,
    KEY_PATH,
};
use crate::schema::TypeCatalog;
use crate::state::{
    KEY_ANCESTOR_IDS, KEY_FULLTEXT_SCORE, KEY_ID, KEY_IS_TRASHED, KEY_LIFECYCLE_STATE,
    KEY_MIXIN_TYPES, KEY_PRIMARY_TYPE, KEY_READ_ACL,
};
use crate::Result;

const DATE_CAST: &str = "DATE";
const DELETED_STATE: &str = "deleted";

/// Resolves a hierarchy path (`/a/b`) to a record id.
pub trait PathResolver: Send + Sync {
    fn resolve(&self, path: &str) -> Option<String>;
}

impl<F> PathResolver for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn resolve(&self, path: &str) -> Option<String> {
        self(path)
    }
}

/// How trashed records are marked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrashMode {
    /// `ecm:lifeCycleState = "deleted"`
    #[default]
    LifeCycle,
    /// `ecm:isTrashed = true`
    Property,
    /// Either marker, while records are being migrated
    Migration,
}

impl FromStr for TrashMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lifecycle" | "life_cycle" => Ok(TrashMode::LifeCycle),
            "property" => Ok(TrashMode::Property),
            "migration" => Ok(TrashMode::Migration),
            other => Err(format!("unknown trash mode: {other}")),
        }
    }
}

impl fmt::Display for TrashMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrashMode::LifeCycle => "lifecycle",
            TrashMode::Property => "property",
            TrashMode::Migration => "migration",
        })
    }
}

/// Server capabilities consulted while compiling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Range-indexed fields and their index type
    #[serde(default)]
    pub range_indexes: BTreeMap<String, WireType>,
    #[serde(default)]
    pub fulltext_disabled: bool,
    #[serde(default)]
    pub trash_mode: TrashMode,
}

impl CompilerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_range_index(mut self, field: impl Into<String>, wire_type: WireType) -> Self {
        self.range_indexes.insert(field.into(), wire_type);
        self
    }

    pub fn with_fulltext_disabled(mut self, disabled: bool) -> Self {
        self.fulltext_disabled = disabled;
        self
    }

    pub fn with_trash_mode(mut self, mode: TrashMode) -> Self {
        self.trash_mode = mode;
        self
    }
}

/// A compiled predicate whose wildcard scoping is still open.
///
/// Paths in `node` are absolute; `field` carries the reference path and its
/// wildcards so sibling predicates can be correlated before scoping.
struct Pending {
    node: QueryNode,
    field: Option<(ElementPath, Vec<Wildcard>)>,
}

impl Pending {
    fn done(node: QueryNode) -> Self {
        Self { node, field: None }
    }

    fn on(info: &FieldInfo, node: QueryNode) -> Self {
        Self {
            node,
            field: Some((info.path.clone(), info.wildcards.clone())),
        }
    }

    /// Correlation key: the path up to the first named wildcard, and its label.
    fn correlation(&self) -> Option<(ElementPath, String)> {
        let (path, wildcards) = self.field.as_ref()?;
        let w = wildcards.iter().find(|w| w.label.is_some())?;
        Some((path.prefix(w.step + 1), w.label.clone()?))
    }

    /// Scope the predicate to the element reached by its last wildcard.
    fn finish(self) -> QueryNode {
        match self.field {
            Some((path, wildcards)) => match wildcards.last() {
                Some(w) => {
                    let prefix = path.prefix(w.step + 1);
                    let relative = self.node.relative_to(&prefix);
                    QueryNode::scoped(prefix, relative)
                }
                None => self.node,
            },
            None => self.node,
        }
    }

    /// Re-base onto `prefix`, dropping the wildcards it consumes.
    fn rebase(self, prefix: &ElementPath) -> Pending {
        let node = self.node.relative_to(prefix);
        let field = self.field.map(|(path, wildcards)| {
            let rest = path.strip_prefix(prefix).unwrap_or(path);
            let shift = prefix.len();
            let wildcards = wildcards
                .into_iter()
                .filter(|w| w.step >= shift)
                .map(|w| Wildcard {
                    step: w.step - shift,
                    label: w.label,
                })
                .collect();
            (rest, wildcards)
        });
        Pending { node, field }
    }
}

/// Merge predicates sharing a named wildcard prefix into correlated scopes.
fn correlate(items: Vec<Pending>) -> Vec<QueryNode> {
    enum Slot {
        Node(QueryNode),
        Group(usize),
    }
    let mut slots = Vec::new();
    let mut groups: Vec<(ElementPath, String, Vec<Pending>)> = Vec::new();
    for item in items {
        match item.correlation() {
            Some((prefix, label)) => {
                match groups
                    .iter()
                    .position(|(p, l, _)| *p == prefix && *l == label)
                {
                    Some(i) => groups[i].2.push(item),
                    None => {
                        slots.push(Slot::Group(groups.len()));
                        groups.push((prefix, label, vec![item]));
                    }
                }
            }
            None => slots.push(Slot::Node(item.finish())),
        }
    }

    let mut groups: Vec<Option<(ElementPath, Vec<Pending>)>> = groups
        .into_iter()
        .map(|(prefix, _, members)| Some((prefix, members)))
        .collect();
    slots
        .into_iter()
        .filter_map(|slot| match slot {
            Slot::Node(node) => Some(node),
            Slot::Group(i) => {
                let (prefix, mut members) = groups[i].take()?;
                if members.len() == 1 {
                    return members.pop().map(Pending::finish);
                }
                let rebased = members.into_iter().map(|m| m.rebase(&prefix)).collect();
                Some(QueryNode::scoped(
                    prefix,
                    QueryNode::and(correlate(rebased)),
                ))
            }
        })
        .collect()
}

/// Translates expression trees into native queries.
pub struct QueryCompiler<'a> {
    catalog: &'a TypeCatalog,
    config: &'a CompilerConfig,
    path_resolver: Option<&'a dyn PathResolver>,
    principals: Option<&'a [String]>,
    has_fulltext: bool,
    wildcard_projection: bool,
}

impl<'a> QueryCompiler<'a> {
    pub fn new(catalog: &'a TypeCatalog, config: &'a CompilerConfig) -> Self {
        Self {
            catalog,
            config,
            path_resolver: None,
            principals: None,
            has_fulltext: false,
            wildcard_projection: false,
        }
    }

    pub fn with_path_resolver(mut self, resolver: &'a dyn PathResolver) -> Self {
        self.path_resolver = Some(resolver);
        self
    }

    /// Restrict results to records readable by one of `principals`.
    pub fn with_principals(mut self, principals: &'a [String]) -> Self {
        self.principals = Some(principals);
        self
    }

    pub fn has_fulltext(&self) -> bool {
        self.has_fulltext
    }

    pub fn wildcard_projection(&self) -> bool {
        self.wildcard_projection
    }

    /// Compile filter, projection and ordering.
    pub fn compile(
        mut self,
        filter: &Expression,
        select: &SelectClause,
        order_by: &OrderByClause,
    ) -> Result<CompiledQuery> {
        let query = self.compile_filter(filter)?;
        let projection = self.projection(select)?;
        let order_by = self.order_by(order_by)?;
        debug!(query = %query, ?projection, "compiled query");
        Ok(CompiledQuery {
            query,
            order_by,
            projection,
            has_fulltext: self.has_fulltext,
            filter: filter.clone(),
        })
    }

    /// Compile the filter alone, including the read-ACL restriction.
    pub fn compile_filter(&mut self, filter: &Expression) -> Result<QueryNode> {
        let node = self.expression(filter)?.finish();
        Ok(match self.principals {
            Some(principals) => QueryNode::and(vec![
                node,
                QueryNode::values(ElementPath::field(KEY_READ_ACL), principals.iter().cloned()),
            ]),
            None => node,
        })
    }

    fn index_type(&self, info: &FieldInfo) -> Option<WireType> {
        info.leaf_key()
            .and_then(|key| self.config.range_indexes.get(&key).copied())
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn expression(&mut self, expr: &Expression) -> Result<Pending> {
        match expr {
            Expression::Multi { op, children } => match op {
                Operator::And => self.and(children.iter()),
                Operator::Or => self.or(children.iter()),
                other => Err(StoreError::parse(format!(
                    "{} cannot combine several expressions",
                    other.symbol()
                ))),
            },
            Expression::Binary { op, lhs, rhs } => match (op, lhs, rhs) {
                (Operator::And, Operand::Expression(l), Some(Operand::Expression(r))) => {
                    self.and([l.as_ref(), r.as_ref()].into_iter())
                }
                (Operator::Or, Operand::Expression(l), Some(Operand::Expression(r))) => {
                    self.or([l.as_ref(), r.as_ref()].into_iter())
                }
                (Operator::Not, Operand::Expression(inner), None) => {
                    Ok(Pending::done(self.expression(inner)?.finish().negate()))
                }
                (op, Operand::Reference(reference), rhs) => {
                    self.predicate(*op, reference, rhs.as_ref())
                }
                (op, _, _) => Err(StoreError::parse(format!(
                    "unsupported operands for {}",
                    op.symbol()
                ))),
            },
        }
    }

    fn and<'e>(&mut self, children: impl Iterator<Item = &'e Expression>) -> Result<Pending> {
        let pending = children
            .map(|c| self.expression(c))
            .collect::<Result<Vec<_>>>()?;
        Ok(Pending::done(QueryNode::and(correlate(pending))))
    }

    fn or<'e>(&mut self, children: impl Iterator<Item = &'e Expression>) -> Result<Pending> {
        let nodes = children
            .map(|c| self.expression(c).map(Pending::finish))
            .collect::<Result<Vec<_>>>()?;
        Ok(Pending::done(QueryNode::or(nodes)))
    }

    fn predicate(
        &mut self,
        op: Operator,
        reference: &Reference,
        rhs: Option<&Operand>,
    ) -> Result<Pending> {
        let name = reference.name.as_str();
        if name == KEY_FULLTEXT || name.starts_with("ecm:fulltext.") {
            return self.fulltext(op, name, rhs).map(Pending::done);
        }
        match name {
            KEY_PATH => return self.path_predicate(op, rhs).map(Pending::done),
            KEY_MIXIN_TYPE => return self.mixin(op, rhs).map(Pending::done),
            KEY_IS_TRASHED => return self.trashed(op, rhs).map(Pending::done),
            _ => {}
        }

        let info = path::resolve(name, self.catalog)?;
        let date_cast = match reference.cast.as_deref() {
            None => false,
            Some(cast) if cast.eq_ignore_ascii_case(DATE_CAST) => {
                if info.wire_type != Some(WireType::Calendar) {
                    return Err(StoreError::parse(format!(
                        "{DATE_CAST}() cast requires a date field: {name}"
                    )));
                }
                true
            }
            Some(cast) => {
                return Err(StoreError::parse(format!("unsupported cast {cast}({name})")))
            }
        };

        let negated = matches!(
            op,
            Operator::NotEq
                | Operator::NotLike
                | Operator::NotILike
                | Operator::NotIn
                | Operator::IsNull
                | Operator::NotBetween
        );
        let node = match op {
            Operator::Eq
            | Operator::NotEq
            | Operator::Lt
            | Operator::Gt
            | Operator::LtEq
            | Operator::GtEq => {
                let lit = literal(op, rhs)?;
                let positive = if op == Operator::NotEq {
                    Operator::Eq
                } else {
                    op
                };
                self.comparison(&info, positive, lit, date_cast)?
            }
            Operator::Like | Operator::ILike | Operator::NotLike | Operator::NotILike => {
                let pattern = literal(op, rhs)?.as_str().ok_or_else(|| {
                    StoreError::parse(format!("{} requires a string literal", op.symbol()))
                })?;
                let case_insensitive = matches!(op, Operator::ILike | Operator::NotILike);
                QueryNode::Value {
                    path: info.path.clone(),
                    values: vec![like_to_wildcard(pattern)],
                    options: MatchOptions::pattern(case_insensitive),
                }
            }
            Operator::In | Operator::NotIn => {
                let lits = literal_list(op, rhs)?;
                self.membership(&info, lits)
            }
            Operator::IsNull | Operator::IsNotNull => {
                if rhs.is_some() {
                    return Err(StoreError::parse(format!("{} takes no operand", op.symbol())));
                }
                QueryNode::exists(info.path.clone())
            }
            Operator::Between | Operator::NotBetween => {
                let lits = literal_list(op, rhs)?;
                let [low, high] = lits else {
                    return Err(StoreError::parse(format!(
                        "{} requires exactly two values",
                        op.symbol()
                    )));
                };
                QueryNode::and(vec![
                    self.comparison(&info, Operator::GtEq, low, date_cast)?,
                    self.comparison(&info, Operator::LtEq, high, date_cast)?,
                ])
            }
            Operator::StartsWith => {
                let prefix = string_literal(op, rhs)?;
                let prefix = prefix.trim_end_matches('/');
                QueryNode::or(vec![
                    QueryNode::value(info.path.clone(), prefix),
                    QueryNode::Value {
                        path: info.path.clone(),
                        values: vec![format!("{}/*", escape_wildcards(prefix))],
                        options: MatchOptions::pattern(false),
                    },
                ])
            }
            Operator::And | Operator::Or | Operator::Not => {
                return Err(StoreError::parse(format!(
                    "{} cannot apply to field {name}",
                    op.symbol()
                )))
            }
        };
        // A negated wildcard predicate reads "no element matches": scope the
        // positive form first, then invert the scoped node.
        Ok(match (negated, info.wildcards.is_empty()) {
            (false, _) => Pending::on(&info, node),
            (true, true) => Pending::on(&info, node.negate()),
            (true, false) => Pending::done(Pending::on(&info, node).finish().negate()),
        })
    }

    /// Positive comparison (`=`, `<`, `>`, `<=`, `>=`).
    fn comparison(
        &self,
        info: &FieldInfo,
        op: Operator,
        lit: &Literal,
        date_cast: bool,
    ) -> Result<QueryNode> {
        if info.true_or_absent && op == Operator::Eq {
            if let Some(b) = boolean_literal(lit) {
                let path = info.path.clone();
                return Ok(if b {
                    QueryNode::value(path, "true")
                } else {
                    QueryNode::exists(path).negate()
                });
            }
        }

        if date_cast || lit.is_date_only() {
            let Literal::Date { value, .. } = lit else {
                return Err(StoreError::parse(format!(
                    "{}: a date literal is required",
                    info.name
                )));
            };
            return Ok(self.day_comparison(info, op, value));
        }

        let text = literal_text(info, lit);
        let index = self.index_type(info);
        let range_op = match op {
            Operator::Eq => {
                return Ok(match index {
                    Some(wire_type) => self.range(info, wire_type, RangeOp::Eq, text),
                    None => QueryNode::value(info.path.clone(), text),
                })
            }
            Operator::Lt => RangeOp::Lt,
            Operator::Gt => RangeOp::Gt,
            Operator::LtEq => RangeOp::Le,
            Operator::GtEq => RangeOp::Ge,
            other => {
                return Err(StoreError::parse(format!(
                    "{} is not a comparison",
                    other.symbol()
                )))
            }
        };
        let wire_type = index.unwrap_or_else(|| literal_type(info, lit));
        Ok(self.range(info, wire_type, range_op, text))
    }

    fn range(&self, info: &FieldInfo, wire_type: WireType, op: RangeOp, value: String) -> QueryNode {
        QueryNode::Range {
            path: info.path.clone(),
            wire_type,
            op,
            value,
            list: info.is_list,
        }
    }

    /// Comparison against a whole calendar day.
    fn day_comparison(&self, info: &FieldInfo, op: Operator, value: &DateTime<Utc>) -> QueryNode {
        let start = value.date_naive().and_time(NaiveTime::MIN).and_utc();
        let next = start + Duration::days(1);
        let bound = |op, at: DateTime<Utc>| {
            self.range(info, WireType::Calendar, op, codec::format_calendar(&at))
        };
        match op {
            Operator::Eq => match self.index_type(info) {
                Some(_) => QueryNode::and(vec![bound(RangeOp::Ge, start), bound(RangeOp::Lt, next)]),
                None => QueryNode::Value {
                    path: info.path.clone(),
                    values: vec![format!("{}*", codec::calendar_day(&start))],
                    options: MatchOptions::pattern(false),
                },
            },
            Operator::Lt => bound(RangeOp::Lt, start),
            Operator::LtEq => bound(RangeOp::Lt, next),
            Operator::Gt => bound(RangeOp::Ge, next),
            _ => bound(RangeOp::Ge, start),
        }
    }

    fn membership(&self, info: &FieldInfo, lits: &[Literal]) -> QueryNode {
        let texts = lits.iter().map(|l| literal_text(info, l));
        match self.index_type(info) {
            Some(wire_type) => QueryNode::or(
                texts
                    .map(|t| self.range(info, wire_type, RangeOp::Eq, t))
                    .collect(),
            ),
            None => QueryNode::values(info.path.clone(), texts),
        }
    }

    // -----------------------------------------------------------------------
    // System pseudo-fields
    // -----------------------------------------------------------------------

    fn never_matches() -> QueryNode {
        QueryNode::exists(ElementPath::field(KEY_ID)).negate()
    }

    fn path_predicate(&self, op: Operator, rhs: Option<&Operand>) -> Result<QueryNode> {
        let path = string_literal(op, rhs)?;
        let resolver = self
            .path_resolver
            .ok_or_else(|| StoreError::parse(format!("{KEY_PATH} requires a path resolver")))?;
        let id = resolver.resolve(path);
        match op {
            Operator::Eq | Operator::NotEq => {
                let node = match id {
                    Some(id) => QueryNode::value(ElementPath::field(KEY_ID), id),
                    None => Self::never_matches(),
                };
                Ok(if op == Operator::NotEq {
                    node.negate()
                } else {
                    node
                })
            }
            Operator::StartsWith => Ok(match id {
                Some(id) => QueryNode::value(ElementPath::field(KEY_ANCESTOR_IDS), id),
                None => Self::never_matches(),
            }),
            other => Err(StoreError::parse(format!(
                "{} is not supported on {KEY_PATH}",
                other.symbol()
            ))),
        }
    }

    fn mixin(&self, op: Operator, rhs: Option<&Operand>) -> Result<QueryNode> {
        let facets: Vec<&str> = match op {
            Operator::Eq | Operator::NotEq => vec![string_literal(op, rhs)?],
            Operator::In | Operator::NotIn => literal_list(op, rhs)?
                .iter()
                .map(|l| {
                    l.as_str().ok_or_else(|| {
                        StoreError::parse(format!("{KEY_MIXIN_TYPE} values must be strings"))
                    })
                })
                .collect::<Result<_>>()?,
            other => {
                return Err(StoreError::parse(format!(
                    "{} is not supported on {KEY_MIXIN_TYPE}",
                    other.symbol()
                )))
            }
        };

        let mut types = Vec::new();
        for facet in &facets {
            for t in self.catalog.document_types_with_facet(facet) {
                if !types.contains(&t) {
                    types.push(t);
                }
            }
        }
        let per_instance: Vec<&str> = facets
            .iter()
            .copied()
            .filter(|f| !self.catalog.is_never_per_instance(f))
            .collect();

        let mut branches = Vec::new();
        if !types.is_empty() {
            branches.push(QueryNode::values(ElementPath::field(KEY_PRIMARY_TYPE), types));
        }
        if !per_instance.is_empty() {
            branches.push(QueryNode::values(
                ElementPath::field(KEY_MIXIN_TYPES),
                per_instance,
            ));
        }
        let node = QueryNode::or(branches);
        Ok(if matches!(op, Operator::NotEq | Operator::NotIn) {
            node.negate()
        } else {
            node
        })
    }

    fn trashed(&self, op: Operator, rhs: Option<&Operand>) -> Result<QueryNode> {
        let lit = literal(op, rhs)?;
        let value = boolean_literal(lit).ok_or_else(|| {
            StoreError::parse(format!("{KEY_IS_TRASHED} compares to a boolean"))
        })?;
        let wanted = match op {
            Operator::Eq => value,
            Operator::NotEq => !value,
            other => {
                return Err(StoreError::parse(format!(
                    "{} is not supported on {KEY_IS_TRASHED}",
                    other.symbol()
                )))
            }
        };
        let lifecycle = QueryNode::value(ElementPath::field(KEY_LIFECYCLE_STATE), DELETED_STATE);
        let property = QueryNode::value(ElementPath::field(KEY_IS_TRASHED), "true");
        let node = match self.config.trash_mode {
            TrashMode::LifeCycle => lifecycle,
            TrashMode::Property => property,
            TrashMode::Migration => QueryNode::or(vec![lifecycle, property]),
        };
        Ok(if wanted { node } else { node.negate() })
    }

    fn fulltext(&mut self, op: Operator, name: &str, rhs: Option<&Operand>) -> Result<QueryNode> {
        if self.config.fulltext_disabled {
            return Err(StoreError::parse("fulltext search is disabled"));
        }
        let text = string_literal(op, rhs)?;
        let path = match name.strip_prefix("ecm:fulltext.") {
            Some(field) => Some(path::resolve(field, self.catalog)?.path),
            None => None,
        };
        let analyzed = fulltext::analyze(text)
            .ok_or_else(|| StoreError::parse(format!("nothing searchable in {text:?}")))?;
        self.has_fulltext = true;
        let node = translate_fulltext(analyzed, &path);
        match op {
            Operator::Eq => Ok(node),
            Operator::NotEq => Ok(node.negate()),
            other => Err(StoreError::parse(format!(
                "{} is not supported on {KEY_FULLTEXT}",
                other.symbol()
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Projection and ordering
    // -----------------------------------------------------------------------

    fn projection(&mut self, select: &SelectClause) -> Result<Projection> {
        if select.is_empty() {
            return Ok(Projection::Full);
        }
        for r in &select.references {
            if r.name == KEY_FULLTEXT_SCORE && !self.has_fulltext {
                return Err(StoreError::parse(format!(
                    "{KEY_FULLTEXT_SCORE} requires a fulltext predicate"
                )));
            }
        }
        let wildcard = select
            .references
            .iter()
            .any(|r| r.name.split('/').any(path::is_wildcard));
        if wildcard {
            self.wildcard_projection = true;
            return Ok(Projection::Manual {
                fields: select.references.iter().map(|r| r.name.clone()).collect(),
            });
        }
        let fields = select
            .references
            .iter()
            .map(|r| {
                let path = if r.name == KEY_FULLTEXT_SCORE {
                    None
                } else {
                    Some(path::resolve(&r.name, self.catalog)?.path)
                };
                Ok(ProjectedField {
                    name: r.name.clone(),
                    path,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Projection::Fields(fields))
    }

    fn order_by(&self, clause: &OrderByClause) -> Result<Vec<SortDirective>> {
        let mut seen = HashSet::new();
        let mut directives = Vec::new();
        for element in &clause.elements {
            let name = element.reference.name.as_str();
            if !seen.insert(name) {
                continue;
            }
            if name == KEY_FULLTEXT_SCORE {
                if !self.has_fulltext {
                    return Err(StoreError::parse(format!(
                        "{KEY_FULLTEXT_SCORE} ordering requires a fulltext predicate"
                    )));
                }
                if !element.descending {
                    return Err(StoreError::parse(format!(
                        "{KEY_FULLTEXT_SCORE} can only be ordered descending"
                    )));
                }
                directives.push(SortDirective::Relevance);
                continue;
            }
            let info = path::resolve(name, self.catalog)?;
            if info.has_wildcard() {
                return Err(StoreError::parse(format!("cannot order by wildcard field {name}")));
            }
            let wire_type = self.index_type(&info).ok_or_else(|| {
                StoreError::parse(format!("cannot order by {name}: no range index"))
            })?;
            directives.push(SortDirective::Index {
                field: name.to_string(),
                path: info.path,
                wire_type,
                descending: element.descending,
            });
        }
        if directives.len() > 1 && directives.contains(&SortDirective::Relevance) {
            return Err(StoreError::parse(format!(
                "{KEY_FULLTEXT_SCORE} cannot be combined with other sort keys"
            )));
        }
        Ok(directives)
    }
}

// ---------------------------------------------------------------------------
// Literal helpers
// ---------------------------------------------------------------------------

fn literal(op: Operator, rhs: Option<&Operand>) -> Result<&Literal> {
    match rhs {
        Some(Operand::Literal(lit)) => Ok(lit),
        _ => Err(StoreError::parse(format!("{} requires a literal", op.symbol()))),
    }
}

fn string_literal(op: Operator, rhs: Option<&Operand>) -> Result<&str> {
    literal(op, rhs)?
        .as_str()
        .ok_or_else(|| StoreError::parse(format!("{} requires a string literal", op.symbol())))
}

fn literal_list(op: Operator, rhs: Option<&Operand>) -> Result<&[Literal]> {
    match rhs {
        Some(Operand::List(lits)) if !lits.is_empty() => Ok(lits),
        _ => Err(StoreError::parse(format!(
            "{} requires a non-empty literal list",
            op.symbol()
        ))),
    }
}

/// Booleans may be written `true`/`false` or `1`/`0`.
fn boolean_literal(lit: &Literal) -> Option<bool> {
    match lit {
        Literal::Boolean(b) => Some(*b),
        Literal::Integer(0) => Some(false),
        Literal::Integer(1) => Some(true),
        _ => None,
    }
}

fn literal_type(info: &FieldInfo, lit: &Literal) -> WireType {
    if info.wire_type == Some(WireType::Boolean) && boolean_literal(lit).is_some() {
        return WireType::Boolean;
    }
    WireType::classify(&lit.to_value())
}

fn literal_text(info: &FieldInfo, lit: &Literal) -> String {
    if info.wire_type == Some(WireType::Boolean) {
        if let Some(b) = boolean_literal(lit) {
            return b.to_string();
        }
    }
    lit.to_value().to_wire_text().unwrap_or_default()
}

/// Escape `*`, `?` and `\` so they match literally in a wildcard pattern.
pub(crate) fn escape_wildcards(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// SQL `LIKE` pattern to wildcard pattern: `%` → `*`, `_` → `?`, `\x` → `x`.
pub(crate) fn like_to_wildcard(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => out.push('*'),
            '_' => out.push('?'),
            '\\' => match chars.next() {
                Some(next) => out.push_str(&escape_wildcards(&next.to_string())),
                None => out.push_str("\\\\"),
            },
            '*' | '?' => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PatternToken {
    Literal(char),
    One,
    Many,
}

/// Match `text` against a wildcard pattern (`*`, `?`, `\` escapes).
pub(crate) fn wildcard_match(pattern: &str, text: &str, case_insensitive: bool) -> bool {
    let fold = |c: char| {
        if case_insensitive {
            c.to_lowercase().next().unwrap_or(c)
        } else {
            c
        }
    };
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '*' => PatternToken::Many,
            '?' => PatternToken::One,
            '\\' => PatternToken::Literal(fold(chars.next().unwrap_or('\\'))),
            c => PatternToken::Literal(fold(c)),
        });
    }
    let text: Vec<char> = text.chars().map(fold).collect();

    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match tokens.get(p) {
            Some(PatternToken::Many) => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(PatternToken::One) => {
                p += 1;
                t += 1;
            }
            Some(PatternToken::Literal(c)) if *c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, from)) => {
                    p = star + 1;
                    t = from + 1;
                    backtrack = Some((star, from + 1));
                }
                None => return false,
            },
        }
    }
    tokens[p..].iter().all(|tok| *tok == PatternToken::Many)
}

fn translate_fulltext(query: FulltextQuery, path: &Option<ElementPath>) -> QueryNode {
    match query {
        FulltextQuery::Word(text) => QueryNode::Word {
            path: path.clone(),
            text,
            phrase: false,
        },
        FulltextQuery::Phrase(text) => QueryNode::Word {
            path: path.clone(),
            text,
            phrase: true,
        },
        FulltextQuery::And(children) => QueryNode::and(
            children
                .into_iter()
                .map(|c| translate_fulltext(c, path))
                .collect(),
        ),
        FulltextQuery::Or(children) => QueryNode::or(
            children
                .into_iter()
                .map(|c| translate_fulltext(c, path))
                .collect(),
        ),
        FulltextQuery::Not(inner) => translate_fulltext(*inner, path).negate(),
    }
}
