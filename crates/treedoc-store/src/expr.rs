//! Already-parsed query expression trees
//!
//! The document layer hands the adapter a typed AST: references to fields,
//! literals, and operator nodes. Field references use `/` separated paths
//! where a segment may be `*` (any list element), `*N` (a named wildcard
//! shared by every reference using the same label) or a numeric index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::Value;

/// Query operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    Like,
    ILike,
    NotLike,
    NotILike,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    Between,
    NotBetween,
    And,
    Or,
    Not,
    StartsWith,
}

impl Operator {
    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::NotEq => "<>",
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::LtEq => "<=",
            Operator::GtEq => ">=",
            Operator::Like => "LIKE",
            Operator::ILike => "ILIKE",
            Operator::NotLike => "NOT LIKE",
            Operator::NotILike => "NOT ILIKE",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::IsNull => "IS NULL",
            Operator::IsNotNull => "IS NOT NULL",
            Operator::Between => "BETWEEN",
            Operator::NotBetween => "NOT BETWEEN",
            Operator::And => "AND",
            Operator::Or => "OR",
            Operator::Not => "NOT",
            Operator::StartsWith => "STARTSWITH",
        }
    }
}

/// Field reference, optionally cast (`DATE(dc:created)`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cast: Option<String>,
}

impl Reference {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cast: None,
        }
    }

    pub fn with_cast(name: impl Into<String>, cast: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cast: Some(cast.into()),
        }
    }
}

/// Typed literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    Boolean(bool),
    Integer(i64),
    Double(f64),
    String(String),
    /// Timestamp; `date_only` literals carry no time component
    Date {
        value: DateTime<Utc>,
        #[serde(default)]
        date_only: bool,
    },
}

impl Literal {
    pub fn string(s: impl Into<String>) -> Self {
        Literal::String(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Literal::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_date_only(&self) -> bool {
        matches!(self, Literal::Date { date_only: true, .. })
    }

    pub fn to_value(&self) -> Value {
        match self {
            Literal::Boolean(b) => Value::Boolean(*b),
            Literal::Integer(i) => Value::Long(*i),
            Literal::Double(d) => Value::Double(*d),
            Literal::String(s) => Value::String(s.clone()),
            Literal::Date { value, .. } => Value::Calendar(*value),
        }
    }
}

/// Operand of an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Reference(Reference),
    Literal(Literal),
    List(Vec<Literal>),
    Expression(Box<Expression>),
}

/// Expression node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expression {
    Binary {
        op: Operator,
        lhs: Operand,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rhs: Option<Operand>,
    },
    /// N-ary `AND`/`OR`
    Multi {
        op: Operator,
        children: Vec<Expression>,
    },
}

impl Expression {
    pub fn new(lhs: Operand, op: Operator, rhs: Option<Operand>) -> Self {
        Expression::Binary { op, lhs, rhs }
    }

    /// `field <op> literal`
    pub fn compare(field: &str, op: Operator, literal: Literal) -> Self {
        Expression::Binary {
            op,
            lhs: Operand::Reference(Reference::new(field)),
            rhs: Some(Operand::Literal(literal)),
        }
    }

    /// `field <op> (literals...)`, for `IN`, `NOT IN` and `BETWEEN`
    pub fn compare_list(field: &str, op: Operator, literals: Vec<Literal>) -> Self {
        Expression::Binary {
            op,
            lhs: Operand::Reference(Reference::new(field)),
            rhs: Some(Operand::List(literals)),
        }
    }

    /// `field IS NULL` / `field IS NOT NULL`
    pub fn unary(field: &str, op: Operator) -> Self {
        Expression::Binary {
            op,
            lhs: Operand::Reference(Reference::new(field)),
            rhs: None,
        }
    }

    pub fn and(children: Vec<Expression>) -> Self {
        Expression::Multi {
            op: Operator::And,
            children,
        }
    }

    pub fn or(children: Vec<Expression>) -> Self {
        Expression::Multi {
            op: Operator::Or,
            children,
        }
    }

    pub fn not(inner: Expression) -> Self {
        Expression::Binary {
            op: Operator::Not,
            lhs: Operand::Expression(Box::new(inner)),
            rhs: None,
        }
    }

    pub fn op(&self) -> Operator {
        match self {
            Expression::Binary { op, .. } | Expression::Multi { op, .. } => *op,
        }
    }

    /// Left-hand reference of a simple predicate.
    pub fn reference(&self) -> Option<&Reference> {
        match self {
            Expression::Binary {
                lhs: Operand::Reference(r),
                ..
            } => Some(r),
            _ => None,
        }
    }
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderByExpr {
    pub reference: Reference,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderByClause {
    pub elements: Vec<OrderByExpr>,
}

impl OrderByClause {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asc(mut self, field: &str) -> Self {
        self.elements.push(OrderByExpr {
            reference: Reference::new(field),
            descending: false,
        });
        self
    }

    pub fn desc(mut self, field: &str) -> Self {
        self.elements.push(OrderByExpr {
            reference: Reference::new(field),
            descending: true,
        });
        self
    }
}

/// Requested output fields; empty means "whole records".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectClause {
    pub references: Vec<Reference>,
}

impl SelectClause {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str) -> Self {
        self.references.push(Reference::new(name));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }
}
