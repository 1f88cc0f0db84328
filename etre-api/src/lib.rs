//! Etre API - entity service with change-data-capture.
//!
//! The service reads and writes labeled entities through a selector query
//! language, emits one CDC event per mutation, fans the live event stream
//! out to websocket subscribers, and reconciles declarative entity schemas
//! against the backing store at boot.

pub mod auth;
pub mod cdc;
pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod routes;
pub mod schema;
pub mod state;
pub mod store;

pub use cdc::{CdcStore, CdcWriter, ChangeStreamServer, NoopCdcWriter, StreamerFactory};
pub use config::Config;
pub use db::{DbError, EntityBackend, EventBackend, MemoryBackend};
pub use error::{ApiError, ApiResult, ErrorBody};
pub use metrics::Metrics;
pub use routes::create_router;
pub use schema::{SchemaConfig, SchemaManager};
pub use state::AppState;
pub use store::{Store, WriteOp, WriteResult};
