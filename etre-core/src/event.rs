//! Change-data-capture events.
//!
//! Every successful entity mutation emits exactly one event; events are
//! append-only and never mutated. `old`/`new` carry only the changed labels
//! (full entity on insert and delete), so consumers can reconstruct the
//! delta without a second read.

use serde::{Deserialize, Serialize};

use crate::Entity;

/// Mutation kind, encoded on the wire as `i`, `u`, or `d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    #[serde(rename = "i")]
    Insert,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Op::Insert => "i",
            Op::Update => "u",
            Op::Delete => "d",
        };
        write!(f, "{}", s)
    }
}

/// One immutable record describing one entity mutation.
///
/// For `i`: `old` is absent, `new` is the full inserted entity.
/// For `u`: `old`/`new` carry only the labels whose values changed.
/// For `d`: `old` is the full prior entity, `new` is absent.
/// `rev` is the entity's `_rev` after the mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdcEvent {
    #[serde(rename = "eventId")]
    pub id: String,

    /// Server wall-clock at emission, epoch milliseconds.
    pub ts: i64,

    pub op: Op,

    /// Authenticated principal that caused the mutation.
    pub caller: String,

    pub entity_id: String,
    pub entity_type: String,

    #[serde(rename = "rev")]
    pub entity_rev: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Entity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Entity>,

    /// Caller-assigned change-set tags, copied onto every event of a
    /// multi-entity operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_op: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_size: Option<i64>,
}

/// Filter for reading event history. All criteria are conjunctive; an unset
/// criterion matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    /// Only events with `ts >= since_ts`.
    pub since_ts: Option<i64>,

    pub entity_types: Option<Vec<String>>,

    pub entity_ids: Option<Vec<String>>,
}

impl EventFilter {
    pub fn since(ts: i64) -> Self {
        Self {
            since_ts: Some(ts),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &CdcEvent) -> bool {
        if let Some(since) = self.since_ts {
            if event.ts < since {
                return false;
            }
        }
        if let Some(types) = &self.entity_types {
            if !types.iter().any(|t| t == &event.entity_type) {
                return false;
            }
        }
        if let Some(ids) = &self.entity_ids {
            if !ids.iter().any(|i| i == &event.entity_id) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    fn event(id: &str, ts: i64, entity_type: &str, entity_id: &str) -> CdcEvent {
        CdcEvent {
            id: id.to_string(),
            ts,
            op: Op::Insert,
            caller: "test".to_string(),
            entity_id: entity_id.to_string(),
            entity_type: entity_type.to_string(),
            entity_rev: 0,
            old: None,
            new: None,
            set_id: None,
            set_op: None,
            set_size: None,
        }
    }

    #[test]
    fn test_event_wire_format() {
        let mut ev = event("e1", 1000, "node", "abc");
        ev.op = Op::Update;
        ev.old = Some(Entity::from([("y", Value::from("a"))]));
        ev.new = Some(Entity::from([("y", Value::from("b"))]));
        ev.set_id = Some("222".to_string());

        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["eventId"], "e1");
        assert_eq!(json["op"], "u");
        assert_eq!(json["rev"], 0);
        assert_eq!(json["entityId"], "abc");
        assert_eq!(json["entityType"], "node");
        assert_eq!(json["old"]["y"], "a");
        assert_eq!(json["new"]["y"], "b");
        assert_eq!(json["setId"], "222");
        // Absent optional fields are omitted entirely.
        assert!(json.get("setOp").is_none());
        assert!(json.get("setSize").is_none());

        let back: CdcEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn test_event_filter() {
        let ev = event("e1", 1000, "node", "abc");

        assert!(EventFilter::default().matches(&ev));
        assert!(EventFilter::since(1000).matches(&ev));
        assert!(!EventFilter::since(1001).matches(&ev));

        let f = EventFilter {
            entity_types: Some(vec!["host".to_string()]),
            ..Default::default()
        };
        assert!(!f.matches(&ev));

        let f = EventFilter {
            since_ts: Some(500),
            entity_types: Some(vec!["node".to_string()]),
            entity_ids: Some(vec!["abc".to_string()]),
        };
        assert!(f.matches(&ev));
    }
}
