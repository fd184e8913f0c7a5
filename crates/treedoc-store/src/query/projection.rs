//! Client-side projection of wildcard fields
//!
//! Native field extraction cannot tell which list element satisfied a
//! correlated predicate. When the select list goes through a wildcard the
//! repository fetches whole records and a [`Rematch`] re-evaluates the filter
//! for every binding of the wildcards, emitting one row per match.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::codec;
use crate::error::StoreError;
use crate::expr::{Expression, Literal, Operand, Operator, Reference};
use crate::query::path::{self, wildcard_label};
use crate::query::{like_to_wildcard, wildcard_match, KEY_FULLTEXT, KEY_MIXIN_TYPE, KEY_PATH};
use crate::schema::TypeCatalog;
use crate::state::{State, Value, KEY_IS_TRASHED};
use crate::Result;

/// Re-evaluates a filter against a full record to produce projection rows.
pub trait Rematch: Send + Sync {
    fn rematch(&self, record: &State, filter: &Expression, fields: &[String]) -> Result<Vec<State>>;
}

#[derive(Debug, Clone, PartialEq)]
enum Seg {
    Key(String),
    Any,
    Label(String),
    Index(usize),
}

type Bindings = BTreeMap<String, Option<usize>>;

#[derive(Clone, Copy)]
enum Cursor<'a> {
    State(&'a State),
    Value(&'a Value),
}

fn parse_segments(name: &str, implicit: Option<usize>) -> Result<Vec<Seg>> {
    let segments = path::reference_segments(name)?;
    Ok(segments
        .into_iter()
        .enumerate()
        .map(|(i, s)| {
            if path::is_wildcard(&s) {
                match (wildcard_label(&s), implicit) {
                    (Some(label), _) => Seg::Label(label.to_string()),
                    // anonymous wildcards of the select list each get their own binding
                    (None, Some(field)) => Seg::Label(format!("#{field}.{i}")),
                    (None, None) => Seg::Any,
                }
            } else if let Ok(index) = s.parse::<usize>() {
                Seg::Index(index)
            } else {
                Seg::Key(s)
            }
        })
        .collect())
}

fn chosen(seg: &Seg, len: usize, bindings: &Bindings) -> Vec<usize> {
    match seg {
        Seg::Any => (0..len).collect(),
        Seg::Index(i) if *i < len => vec![*i],
        Seg::Label(label) => match bindings.get(label) {
            Some(Some(i)) if *i < len => vec![*i],
            Some(_) => Vec::new(),
            None => (0..len).collect(),
        },
        _ => Vec::new(),
    }
}

fn walk(cursor: Cursor<'_>, segs: &[Seg], bindings: &Bindings, out: &mut Vec<Value>) {
    let Some((seg, rest)) = segs.split_first() else {
        out.push(match cursor {
            Cursor::State(s) => Value::State(s.clone()),
            Cursor::Value(v) => v.clone(),
        });
        return;
    };
    match (seg, cursor) {
        (Seg::Key(key), Cursor::State(s)) | (Seg::Key(key), Cursor::Value(Value::State(s))) => {
            if let Some(v) = s.get(key) {
                walk(Cursor::Value(v), rest, bindings, out);
            }
        }
        (Seg::Key(_), _) => {}
        (item, Cursor::Value(Value::Array(items))) => {
            for i in chosen(item, items.len(), bindings) {
                walk(Cursor::Value(&items[i]), rest, bindings, out);
            }
        }
        (item, Cursor::Value(Value::List(states))) => {
            for i in chosen(item, states.len(), bindings) {
                walk(Cursor::State(&states[i]), rest, bindings, out);
            }
        }
        _ => {}
    }
}

fn lookup(record: &State, segs: &[Seg], bindings: &Bindings) -> Vec<Value> {
    let mut out = Vec::new();
    walk(Cursor::State(record), segs, bindings, &mut out);
    out
}

/// Scalar values reached by a reference; list values contribute their members.
fn scalars(record: &State, segs: &[Seg], bindings: &Bindings) -> Vec<Value> {
    lookup(record, segs, bindings)
        .into_iter()
        .flat_map(|v| match v {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        })
        .collect()
}

fn compare(value: &Value, lit: &Literal, by_day: bool) -> Option<Ordering> {
    match (value, lit) {
        (Value::Long(a), Literal::Integer(b)) => Some(a.cmp(b)),
        (Value::Long(a), Literal::Double(b)) => (*a as f64).partial_cmp(b),
        (Value::Double(a), Literal::Integer(b)) => a.partial_cmp(&(*b as f64)),
        (Value::Double(a), Literal::Double(b)) => a.partial_cmp(b),
        (Value::String(a), Literal::String(b)) => Some(a.as_str().cmp(b.as_str())),
        (Value::Boolean(a), Literal::Boolean(b)) => Some(a.cmp(b)),
        (Value::Boolean(a), Literal::Integer(b @ (0 | 1))) => Some(a.cmp(&(*b == 1))),
        (Value::Calendar(a), Literal::Date { value, date_only }) => {
            if by_day || *date_only {
                Some(a.date_naive().cmp(&value.date_naive()))
            } else {
                Some(a.cmp(value))
            }
        }
        (Value::Calendar(a), Literal::String(s)) => {
            codec::parse_calendar(s).ok().map(|b| a.cmp(&b))
        }
        _ => None,
    }
}

/// Default [`Rematch`]: evaluates the filter with the catalog's conventions.
#[derive(Debug, Clone)]
pub struct WildcardRematch {
    catalog: Arc<TypeCatalog>,
}

impl WildcardRematch {
    pub fn new(catalog: Arc<TypeCatalog>) -> Self {
        Self { catalog }
    }

    fn eval(&self, record: &State, expr: &Expression, bindings: &Bindings) -> Result<bool> {
        match expr {
            Expression::Multi { op: Operator::And, children } => {
                for child in children {
                    if !self.eval(record, child, bindings)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Expression::Multi { op: Operator::Or, children } => {
                for child in children {
                    if self.eval(record, child, bindings)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Expression::Multi { op, .. } => Err(StoreError::parse(format!(
                "{} cannot combine several expressions",
                op.symbol()
            ))),
            Expression::Binary { op, lhs, rhs } => match (op, lhs, rhs) {
                (Operator::And, Operand::Expression(l), Some(Operand::Expression(r))) => {
                    Ok(self.eval(record, l, bindings)? && self.eval(record, r, bindings)?)
                }
                (Operator::Or, Operand::Expression(l), Some(Operand::Expression(r))) => {
                    Ok(self.eval(record, l, bindings)? || self.eval(record, r, bindings)?)
                }
                (Operator::Not, Operand::Expression(inner), None) => {
                    Ok(!self.eval(record, inner, bindings)?)
                }
                (op, Operand::Reference(r), rhs) => {
                    self.predicate(record, *op, r, rhs.as_ref(), bindings)
                }
                (op, _, _) => Err(StoreError::parse(format!(
                    "unsupported operands for {}",
                    op.symbol()
                ))),
            },
        }
    }

    fn predicate(
        &self,
        record: &State,
        op: Operator,
        reference: &Reference,
        rhs: Option<&Operand>,
        bindings: &Bindings,
    ) -> Result<bool> {
        let name = reference.name.as_str();
        // already decided by the server for this record
        if name.starts_with(KEY_FULLTEXT)
            || matches!(name, KEY_PATH | KEY_MIXIN_TYPE | KEY_IS_TRASHED)
        {
            return Ok(true);
        }

        let segs = parse_segments(name, None)?;
        let mut values = scalars(record, &segs, bindings);
        if values.is_empty() && self.catalog.is_true_or_absent(name) {
            values.push(Value::Boolean(false));
        }
        let by_day = reference.cast.is_some();

        let literal = || match rhs {
            Some(Operand::Literal(lit)) => Ok(lit),
            _ => Err(StoreError::parse(format!("{} requires a literal", op.symbol()))),
        };
        let list = || match rhs {
            Some(Operand::List(lits)) => Ok(lits.as_slice()),
            _ => Err(StoreError::parse(format!("{} requires a literal list", op.symbol()))),
        };
        let any = |lit: &Literal, accept: fn(Ordering) -> bool| {
            values
                .iter()
                .any(|v| compare(v, lit, by_day).map(accept).unwrap_or(false))
        };

        Ok(match op {
            Operator::Eq => any(literal()?, Ordering::is_eq),
            Operator::NotEq => !any(literal()?, Ordering::is_eq),
            Operator::Lt => any(literal()?, Ordering::is_lt),
            Operator::Gt => any(literal()?, Ordering::is_gt),
            Operator::LtEq => any(literal()?, Ordering::is_le),
            Operator::GtEq => any(literal()?, Ordering::is_ge),
            Operator::Like | Operator::ILike | Operator::NotLike | Operator::NotILike => {
                let pattern = literal()?.as_str().ok_or_else(|| {
                    StoreError::parse(format!("{} requires a string literal", op.symbol()))
                })?;
                let pattern = like_to_wildcard(pattern);
                let ci = matches!(op, Operator::ILike | Operator::NotILike);
                let found = values.iter().any(|v| {
                    v.to_wire_text()
                        .map(|t| wildcard_match(&pattern, &t, ci))
                        .unwrap_or(false)
                });
                found != matches!(op, Operator::NotLike | Operator::NotILike)
            }
            Operator::In => list()?.iter().any(|l| any(l, Ordering::is_eq)),
            Operator::NotIn => !list()?.iter().any(|l| any(l, Ordering::is_eq)),
            Operator::IsNull => values.is_empty(),
            Operator::IsNotNull => !values.is_empty(),
            Operator::Between | Operator::NotBetween => {
                let [low, high] = list()? else {
                    return Err(StoreError::parse(format!(
                        "{} requires exactly two values",
                        op.symbol()
                    )));
                };
                let inside = values.iter().any(|v| {
                    compare(v, low, by_day).map(Ordering::is_ge).unwrap_or(false)
                        && compare(v, high, by_day).map(Ordering::is_le).unwrap_or(false)
                });
                inside != (op == Operator::NotBetween)
            }
            Operator::StartsWith => {
                let prefix = literal()?.as_str().unwrap_or_default().trim_end_matches('/');
                values.iter().any(|v| {
                    v.as_str()
                        .map(|s| s == prefix || s.starts_with(&format!("{prefix}/")))
                        .unwrap_or(false)
                })
            }
            Operator::And | Operator::Or | Operator::Not => {
                return Err(StoreError::parse(format!(
                    "{} cannot apply to field {name}",
                    op.symbol()
                )))
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn enumerate(
        &self,
        record: &State,
        filter: &Expression,
        labels: &[(String, Vec<Seg>)],
        fields: &[(String, Vec<Seg>)],
        bindings: &mut Bindings,
        rows: &mut Vec<State>,
    ) -> Result<()> {
        let Some(((label, prefix), rest)) = labels.split_first() else {
            if self.eval(record, filter, bindings)? {
                let row: State = fields
                    .iter()
                    .map(|(name, segs)| {
                        let mut found = lookup(record, segs, bindings);
                        let value = if found.len() == 1 {
                            found.pop().unwrap_or(Value::Null)
                        } else if found.is_empty() {
                            Value::Null
                        } else {
                            Value::Array(found)
                        };
                        (name.clone(), value)
                    })
                    .collect();
                if !rows.contains(&row) {
                    rows.push(row);
                }
            }
            return Ok(());
        };

        let len = lookup(record, prefix, bindings)
            .iter()
            .map(|v| match v {
                Value::Array(items) => items.len(),
                Value::List(states) => states.len(),
                _ => 0,
            })
            .max()
            .unwrap_or(0);
        if len == 0 {
            bindings.insert(label.clone(), None);
            self.enumerate(record, filter, rest, fields, bindings, rows)?;
        } else {
            for i in 0..len {
                bindings.insert(label.clone(), Some(i));
                self.enumerate(record, filter, rest, fields, bindings, rows)?;
            }
        }
        bindings.remove(label);
        Ok(())
    }
}

fn collect_labels(segs: &[Seg], labels: &mut Vec<(String, Vec<Seg>)>) {
    for (i, seg) in segs.iter().enumerate() {
        if let Seg::Label(label) = seg {
            if !labels.iter().any(|(l, _)| l == label) {
                labels.push((label.clone(), segs[..i].to_vec()));
            }
        }
    }
}

fn filter_references<'e>(expr: &'e Expression, out: &mut Vec<&'e str>) {
    match expr {
        Expression::Multi { children, .. } => {
            for c in children {
                filter_references(c, out);
            }
        }
        Expression::Binary { lhs, rhs, .. } => {
            for operand in std::iter::once(lhs).chain(rhs.iter()) {
                match operand {
                    Operand::Reference(r) => out.push(&r.name),
                    Operand::Expression(e) => filter_references(e, out),
                    _ => {}
                }
            }
        }
    }
}

impl Rematch for WildcardRematch {
    fn rematch(&self, record: &State, filter: &Expression, fields: &[String]) -> Result<Vec<State>> {
        let fields = fields
            .iter()
            .enumerate()
            .map(|(i, name)| Ok((name.clone(), parse_segments(name, Some(i))?)))
            .collect::<Result<Vec<_>>>()?;

        let mut labels = Vec::new();
        for (_, segs) in &fields {
            collect_labels(segs, &mut labels);
        }
        let mut references = Vec::new();
        filter_references(filter, &mut references);
        for name in references {
            if name.starts_with(KEY_FULLTEXT) {
                continue;
            }
            if let Ok(segs) = parse_segments(name, None) {
                collect_labels(&segs, &mut labels);
            }
        }

        let mut rows = Vec::new();
        let mut bindings = Bindings::new();
        self.enumerate(record, filter, &labels, &fields, &mut bindings, &mut rows)?;
        Ok(rows)
    }
}
