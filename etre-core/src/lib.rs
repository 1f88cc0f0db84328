//! Etre core types.
//!
//! Pure data structures and the selector query language. The service crate
//! depends on this; nothing here touches storage or the network.

mod entity;
mod error;
mod event;
mod filter;
pub mod query;

pub use entity::{is_meta_label, Entity, Value};
pub use error::{Error, ErrorKind, Result};
pub use event::{CdcEvent, EventFilter, Op};
pub use filter::QueryFilter;

/// Server-issued entity identifier, unique within an entity type.
pub const META_LABEL_ID: &str = "_id";

/// The entity type; each type maps to one backing collection.
pub const META_LABEL_TYPE: &str = "_type";

/// Monotonic per-entity write counter, starting at 0 on insertion.
pub const META_LABEL_REV: &str = "_rev";

/// Caller-supplied change-set id, carried on CDC events but never stored.
pub const SET_LABEL_ID: &str = "_setId";

/// Caller-supplied change-set operation name.
pub const SET_LABEL_OP: &str = "_setOp";

/// Caller-supplied change-set size.
pub const SET_LABEL_SIZE: &str = "_setSize";

/// Base path of the HTTP API.
pub const API_ROOT: &str = "/api/v1";

/// Header carrying `key=value,key=value` trace pairs for the caller.
pub const TRACE_HEADER: &str = "X-Etre-Trace";
