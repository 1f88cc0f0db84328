//! Parsed selector representation.
//!
//! A query is an AND-conjunction of predicates over labels; predicate order
//! never affects results. `Display` reconstructs a canonical selector string
//! that parses back to the same query.

use std::fmt;

use crate::Value;

/// Predicate operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `L` — label present (empty string counts as absent)
    Exists,
    /// `!L`
    NotExists,
    /// `L = v` / `L == v`
    Eq,
    /// `L != v`
    Ne,
    /// `L < v`
    Lt,
    /// `L > v`
    Gt,
    /// `L in (v1, v2, ...)`
    In,
    /// `L notin (v1, v2, ...)`
    NotIn,
}

/// One predicate of a selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub label: String,
    pub op: Operator,
    /// Empty for existence predicates, one value for comparisons, one or
    /// more for set membership.
    pub values: Vec<Value>,
}

impl Predicate {
    pub fn new(label: impl Into<String>, op: Operator, values: Vec<Value>) -> Self {
        Self {
            label: label.into(),
            op,
            values,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            Operator::Exists => write!(f, "{}", self.label),
            Operator::NotExists => write!(f, "!{}", self.label),
            Operator::Eq => write!(f, "{} = {}", self.label, self.values[0]),
            Operator::Ne => write!(f, "{} != {}", self.label, self.values[0]),
            Operator::Lt => write!(f, "{} < {}", self.label, self.values[0]),
            Operator::Gt => write!(f, "{} > {}", self.label, self.values[0]),
            Operator::In | Operator::NotIn => {
                let values: Vec<String> = self.values.iter().map(|v| v.to_string()).collect();
                let word = if self.op == Operator::In { "in" } else { "notin" };
                write!(f, "{} {} ({})", self.label, word, values.join(", "))
            }
        }
    }
}

/// A parsed selector.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Query {
    pub predicates: Vec<Predicate>,
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.predicates.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", parts.join(", "))
    }
}
