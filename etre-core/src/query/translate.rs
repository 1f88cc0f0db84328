//! Translation from the parsed selector to a backend-neutral filter.
//!
//! Translation is a pure function; the one storage-aware caveat is that
//! `_id` comparison values which look like valid object ids are normalised
//! to the backend's lower-hex form. Existence maps to "present and not the
//! empty string": an empty string value is indistinguishable from an unset
//! label in existence checks.

use crate::query::ast::{Operator, Query};
use crate::{Value, META_LABEL_ID};

/// A single condition on a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cond {
    /// Present with a non-empty value.
    Exists,
    /// Absent, or present with the empty string.
    NotExists,
    Eq(Value),
    /// Matches when the field is absent or differs (the backing store's
    /// `$ne` semantics).
    Ne(Value),
    Lt(Value),
    Gt(Value),
    In(Vec<Value>),
    /// Matches when the field is absent or not in the set.
    NotIn(Vec<Value>),
}

/// A backend-neutral conjunctive filter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Filter {
    pub conds: Vec<(String, Cond)>,

    /// Entity ids excluded from matching. The update loop adds each
    /// already-updated id here so a patch that does not change a queried
    /// label still terminates.
    pub exclude_ids: Vec<String>,
}

impl Filter {
    /// Filter matching exactly one entity by id.
    pub fn by_id(id: &str) -> Self {
        Filter {
            conds: vec![(
                META_LABEL_ID.to_string(),
                Cond::Eq(Value::String(normalize_id(id))),
            )],
            exclude_ids: Vec::new(),
        }
    }

    pub fn exclude(mut self, id: &str) -> Self {
        self.exclude_ids.push(id.to_string());
        self
    }
}

/// Translate a parsed query into a filter.
pub fn translate(query: &Query) -> Filter {
    let conds = query
        .predicates
        .iter()
        .map(|p| {
            let cond = match p.op {
                Operator::Exists => Cond::Exists,
                Operator::NotExists => Cond::NotExists,
                Operator::Eq => Cond::Eq(id_aware(&p.label, &p.values[0])),
                Operator::Ne => Cond::Ne(id_aware(&p.label, &p.values[0])),
                Operator::Lt => Cond::Lt(p.values[0].clone()),
                Operator::Gt => Cond::Gt(p.values[0].clone()),
                Operator::In => Cond::In(p.values.iter().map(|v| id_aware(&p.label, v)).collect()),
                Operator::NotIn => {
                    Cond::NotIn(p.values.iter().map(|v| id_aware(&p.label, v)).collect())
                }
            };
            (p.label.clone(), cond)
        })
        .collect();
    Filter {
        conds,
        exclude_ids: Vec::new(),
    }
}

/// True when the string is a plausible object-id hex string (the 24-char
/// legacy form or the 32-char form minted by this server).
pub fn is_object_id_hex(s: &str) -> bool {
    (s.len() == 24 || s.len() == 32) && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn normalize_id(id: &str) -> String {
    if is_object_id_hex(id) {
        id.to_ascii_lowercase()
    } else {
        id.to_string()
    }
}

fn id_aware(label: &str, value: &Value) -> Value {
    match value {
        Value::String(s) if label == META_LABEL_ID => Value::String(normalize_id(s)),
        _ => value.clone(),
    }
}
