//! HTTP API surface.
//!
//! Thin adapters over the store and the CDC pipeline: routing, parameter
//! parsing, auth at the edge, and the write-result envelope that carries
//! partial-success data alongside an error.

mod changes;
mod entities;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use etre_core::{Error, ErrorKind, QueryFilter};
use serde::Deserialize;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::auth::{Action, Caller};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::store::WriteOp;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/v1/entities/{type}",
            get(entities::list_entities)
                .post(entities::post_entities)
                .put(entities::put_entities)
                .delete(entities::delete_entities),
        )
        .route("/api/v1/query/{type}", axum::routing::post(entities::query_entities))
        .route("/api/v1/entity/{type}/{id}/labels", get(entities::get_labels))
        .route(
            "/api/v1/entity/{type}/{id}/labels/{label}",
            axum::routing::delete(entities::delete_label),
        )
        .route("/api/v1/entity-types", get(entity_types))
        .route("/api/v1/schemas", get(get_schemas))
        .route("/api/v1/schemas/{type}", get(get_schema))
        .route("/api/v1/changes", get(changes::changes))
        .fallback(endpoint_not_found)
        .with_state(state)
}

async fn endpoint_not_found() -> ApiError {
    ApiError(Error::new(ErrorKind::EndpointNotFound, "API endpoint not found"))
}

// ============================================================================
// SHARED PARAMETERS & HELPERS
// ============================================================================

/// Query-string parameters for reads.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ReadParams {
    pub query: Option<String>,
    /// Comma-separated return labels.
    pub labels: Option<String>,
    pub distinct: Option<bool>,
}

impl ReadParams {
    pub fn filter(&self) -> QueryFilter {
        let return_labels = self
            .labels
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        QueryFilter {
            return_labels,
            distinct: self.distinct.unwrap_or(false),
        }
    }
}

/// Query-string parameters for writes.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WriteParams {
    pub query: Option<String>,
    pub set_id: Option<String>,
    pub set_op: Option<String>,
    pub set_size: Option<i64>,
}

impl WriteParams {
    pub fn write_op(&self, caller: &Caller, entity_type: &str) -> WriteOp {
        WriteOp {
            caller: caller.name.clone(),
            entity_type: entity_type.to_string(),
            entity_id: None,
            set_id: self.set_id.clone(),
            set_op: self.set_op.clone(),
            set_size: self.set_size,
        }
    }
}

pub(crate) fn required_query(query: &Option<String>) -> ApiResult<&str> {
    match query.as_deref() {
        Some(q) if !q.trim().is_empty() => Ok(q),
        _ => Err(ApiError(Error::missing_param("query"))),
    }
}

/// Per-request cancellation token. The guard cancels the token when the
/// handler future is dropped, so detached work observes the disconnect.
pub(crate) fn request_token() -> (CancellationToken, DropGuard) {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    (token, guard)
}

pub(crate) async fn authenticate(state: &AppState, headers: &HeaderMap) -> ApiResult<Caller> {
    Ok(state.auth.authenticate(headers).await?)
}

pub(crate) async fn authorize(
    state: &AppState,
    caller: &Caller,
    action: Action,
) -> ApiResult<()> {
    Ok(state.auth.authorize(caller, &action).await?)
}

// ============================================================================
// DISCOVERY ENDPOINTS
// ============================================================================

/// GET /api/v1/entity-types
async fn entity_types(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.store.entity_types().to_vec())
}

/// GET /api/v1/schemas
async fn get_schemas(State(state): State<AppState>) -> Json<crate::schema::SchemaConfig> {
    Json((*state.schemas).clone())
}

/// GET /api/v1/schemas/{type}
async fn get_schema(
    State(state): State<AppState>,
    axum::extract::Path(entity_type): axum::extract::Path<String>,
) -> ApiResult<Json<crate::schema::EntitySchema>> {
    if !state.store.entity_types().iter().any(|t| t == &entity_type) {
        return Err(ApiError(Error::invalid_param(format!(
            "unknown entity type: {}",
            entity_type
        ))));
    }
    Ok(Json(
        state
            .schemas
            .entities
            .get(&entity_type)
            .cloned()
            .unwrap_or_default(),
    ))
}
