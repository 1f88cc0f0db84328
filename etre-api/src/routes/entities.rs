//! Entity CRUD and label endpoints.

use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use etre_core::{query, Entity, Error, QueryFilter, Value, META_LABEL_ID};
use serde::Serialize;

use crate::auth::{Action, Caller};
use crate::error::{error_body, ApiError, ApiResult, ErrorBody};
use crate::state::AppState;
use crate::store::WriteResult;

use super::{authenticate, authorize, request_token, required_query, ReadParams, WriteParams};

/// By-id lookups are expressed as `_id=<id>` selectors through the query
/// path, the way clients express them.
fn by_id_query(id: &str) -> query::Query {
    query::Query {
        predicates: vec![query::Predicate::new(
            META_LABEL_ID,
            query::Operator::Eq,
            vec![Value::from(id)],
        )],
    }
}

/// Envelope for write endpoints: committed items plus the terminal error,
/// so partial-success data always reaches the caller.
#[derive(Debug, Serialize)]
struct WriteResponse<T: Serialize> {
    writes: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

fn write_response<T: Serialize>(
    state: &AppState,
    caller: &Caller,
    result: WriteResult<T>,
    success: StatusCode,
) -> Response {
    match result.error {
        None => (
            success,
            Json(WriteResponse {
                writes: result.committed,
                error: None,
            }),
        )
            .into_response(),
        Some(error) => {
            record_error(state, caller);
            let body = error_body(&error);
            let status = StatusCode::from_u16(body.http_status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                Json(WriteResponse {
                    writes: result.committed,
                    error: Some(body),
                }),
            )
                .into_response()
        }
    }
}

fn record_error(state: &AppState, caller: &Caller) {
    for group in &caller.metric_groups {
        state.metrics.group(group).error.fetch_add(1, Ordering::Relaxed);
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes, expected: &str) -> ApiResult<T> {
    if body.is_empty() {
        return Err(ApiError(Error::no_content()));
    }
    serde_json::from_slice(body).map_err(|e| {
        ApiError(Error::invalid_content(format!(
            "HTTP payload is not valid JSON: expected {}: {}",
            expected, e
        )))
    })
}

// ============================================================================
// READ
// ============================================================================

async fn read_with_query(
    state: &AppState,
    headers: &HeaderMap,
    entity_type: &str,
    selector: &str,
    params: &ReadParams,
) -> ApiResult<Json<Vec<Entity>>> {
    let caller = authenticate(state, headers).await?;
    authorize(state, &caller, Action::read(entity_type)).await?;

    let (ctx, _guard) = request_token();
    let parsed = query::parse(selector)?;
    let started = Instant::now();
    let result = state
        .store
        .read_entities(&ctx, entity_type, &parsed, &params.filter())
        .await;
    for group in &caller.metric_groups {
        state.metrics.group(group).read.fetch_add(1, Ordering::Relaxed);
        state.metrics.observe_query_latency(group, started.elapsed());
    }

    match result {
        Ok(entities) => Ok(Json(entities)),
        Err(e) => {
            record_error(state, &caller);
            Err(e.into())
        }
    }
}

/// GET /api/v1/entities/{type}?query=...
pub(crate) async fn list_entities(
    State(state): State<AppState>,
    Path(entity_type): Path<String>,
    Query(params): Query<ReadParams>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Entity>>> {
    let selector = required_query(&params.query)?.to_string();
    read_with_query(&state, &headers, &entity_type, &selector, &params).await
}

/// POST /api/v1/query/{type} — the query in the body, for selectors too
/// long for a URL.
pub(crate) async fn query_entities(
    State(state): State<AppState>,
    Path(entity_type): Path<String>,
    Query(params): Query<ReadParams>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Vec<Entity>>> {
    if body.trim().is_empty() {
        return Err(ApiError(Error::missing_param("query")));
    }
    read_with_query(&state, &headers, &entity_type, &body, &params).await
}

/// GET /api/v1/entity/{type}/{id}/labels
pub(crate) async fn get_labels(
    State(state): State<AppState>,
    Path((entity_type, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<String>>> {
    let caller = authenticate(&state, &headers).await?;
    authorize(&state, &caller, Action::read(&entity_type)).await?;

    let (ctx, _guard) = request_token();
    let entities = state
        .store
        .read_entities(&ctx, &entity_type, &by_id_query(&id), &QueryFilter::default())
        .await?;
    let entity = entities
        .into_iter()
        .next()
        .ok_or_else(|| ApiError(Error::entity_not_found(&id)))?;
    for group in &caller.metric_groups {
        state.metrics.group(group).read.fetch_add(1, Ordering::Relaxed);
    }
    Ok(Json(entity.labels()))
}

// ============================================================================
// WRITE
// ============================================================================

/// POST /api/v1/entities/{type} — insert a batch.
pub(crate) async fn post_entities(
    State(state): State<AppState>,
    Path(entity_type): Path<String>,
    Query(params): Query<WriteParams>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let caller = authenticate(&state, &headers).await?;
    authorize(&state, &caller, Action::write(&entity_type)).await?;

    let (ctx, _guard) = request_token();
    let entities: Vec<Entity> = parse_body(&body, "[]Entity for POST")?;
    let wo = params.write_op(&caller, &entity_type);
    let result = state.store.create_entities(&ctx, &wo, entities).await;
    for group in &caller.metric_groups {
        state.metrics.group(group).insert.fetch_add(1, Ordering::Relaxed);
    }
    Ok(write_response(&state, &caller, result, StatusCode::CREATED))
}

/// PUT /api/v1/entities/{type}?query=... — update by query.
pub(crate) async fn put_entities(
    State(state): State<AppState>,
    Path(entity_type): Path<String>,
    Query(params): Query<WriteParams>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let caller = authenticate(&state, &headers).await?;
    authorize(&state, &caller, Action::write(&entity_type)).await?;

    let (ctx, _guard) = request_token();
    let selector = required_query(&params.query)?;
    let parsed = query::parse(selector)?;
    let patch: Entity = parse_body(&body, "Entity for PUT")?;

    let wo = params.write_op(&caller, &entity_type);
    let result = state.store.update_entities(&ctx, &wo, &parsed, patch).await;
    for group in &caller.metric_groups {
        state.metrics.group(group).update.fetch_add(1, Ordering::Relaxed);
    }
    Ok(write_response(&state, &caller, result, StatusCode::OK))
}

/// DELETE /api/v1/entities/{type}?query=... — delete by query.
pub(crate) async fn delete_entities(
    State(state): State<AppState>,
    Path(entity_type): Path<String>,
    Query(params): Query<WriteParams>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let caller = authenticate(&state, &headers).await?;
    authorize(&state, &caller, Action::write(&entity_type)).await?;

    let (ctx, _guard) = request_token();
    let selector = required_query(&params.query)?;
    let parsed = query::parse(selector)?;

    let wo = params.write_op(&caller, &entity_type);
    let result = state.store.delete_entities(&ctx, &wo, &parsed).await;
    for group in &caller.metric_groups {
        state.metrics.group(group).delete.fetch_add(1, Ordering::Relaxed);
    }
    Ok(write_response(&state, &caller, result, StatusCode::OK))
}

/// DELETE /api/v1/entity/{type}/{id}/labels/{label}
pub(crate) async fn delete_label(
    State(state): State<AppState>,
    Path((entity_type, id, label)): Path<(String, String, String)>,
    Query(params): Query<WriteParams>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let caller = authenticate(&state, &headers).await?;
    authorize(&state, &caller, Action::write(&entity_type)).await?;

    let (ctx, _guard) = request_token();
    let mut wo = params.write_op(&caller, &entity_type);
    wo.entity_id = Some(id);
    let result = state.store.delete_label(&ctx, &wo, &label).await;
    for group in &caller.metric_groups {
        state
            .metrics
            .group(group)
            .delete_label
            .fetch_add(1, Ordering::Relaxed);
    }

    match result {
        Ok(prior) => Ok(Json(prior).into_response()),
        Err(e) => {
            record_error(&state, &caller);
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{app_state, TYPE};
    use crate::routes::create_router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use etre_core::{Entity, Value};
    use tower::ServiceExt;

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn insert(app: &Router, payload: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(
                Request::post(format!("/api/v1/entities/{}", TYPE))
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        (status, body_json(response).await)
    }

    async fn read(app: &Router, query: &str) -> Vec<Entity> {
        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/api/v1/entities/{}?query={}", TYPE, query))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        serde_json::from_value(body_json(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_read() {
        let app = create_router(app_state().await);

        let (status, json) = insert(&app, r#"[{"x":7},{"x":8}]"#).await;
        assert_eq!(status, StatusCode::CREATED);
        let writes = json["writes"].as_array().unwrap();
        assert_eq!(writes.len(), 2);
        assert!(json.get("error").is_none());

        let entities = read(&app, "x%3E6").await; // x>6
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].rev(), Some(0));
        assert_eq!(entities[0].entity_type(), Some(TYPE));
        assert!(entities[0].id().is_some());
    }

    #[tokio::test]
    async fn test_insert_duplicate_partial_envelope() {
        let app = create_router(app_state().await);
        insert(&app, r#"[{"x":6}]"#).await;

        let (status, json) = insert(&app, r#"[{"x":5},{"x":6},{"x":7}]"#).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["writes"].as_array().unwrap().len(), 1);
        assert_eq!(json["error"]["type"], "duplicate-entity");
        assert_eq!(json["error"]["httpStatus"], 409);
    }

    #[tokio::test]
    async fn test_insert_bad_bodies() {
        let app = create_router(app_state().await);

        let (status, json) = insert(&app, "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["type"], "no-content");

        let (status, json) = insert(&app, "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["type"], "invalid-content");

        let (status, json) = insert(&app, "[]").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["type"], "no-content");
    }

    #[tokio::test]
    async fn test_read_requires_query_param() {
        let app = create_router(app_state().await);
        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/api/v1/entities/{}", TYPE))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["type"], "missing-param");
    }

    #[tokio::test]
    async fn test_read_invalid_query() {
        let app = create_router(app_state().await);
        let response = app
            .oneshot(
                Request::get(format!("/api/v1/entities/{}?query=y%3D", TYPE)) // y=
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["type"], "invalid-query");
    }

    #[tokio::test]
    async fn test_query_in_body() {
        let app = create_router(app_state().await);
        insert(&app, r#"[{"x":1,"y":"a"}]"#).await;

        let response = app
            .oneshot(
                Request::post(format!("/api/v1/query/{}", TYPE))
                    .body(Body::from("y=a"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let entities: Vec<Entity> = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(entities.len(), 1);
    }

    #[tokio::test]
    async fn test_update_by_query() {
        let app = create_router(app_state().await);
        insert(&app, r#"[{"x":1,"y":"b"},{"x":2,"y":"b"}]"#).await;

        let response = app
            .clone()
            .oneshot(
                Request::put(format!(
                    "/api/v1/entities/{}?query=y%3Db&setId=222",
                    TYPE
                ))
                .header("content-type", "application/json")
                .body(Body::from(r#"{"y":"c"}"#))
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let writes = json["writes"].as_array().unwrap();
        assert_eq!(writes.len(), 2);
        // Diffs carry the previous value and the pre-update revision.
        assert_eq!(writes[0]["y"], "b");
        assert_eq!(writes[0]["_rev"], 0);

        let entities = read(&app, "y%3Dc").await;
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].rev(), Some(1));
    }

    #[tokio::test]
    async fn test_delete_by_query() {
        let app = create_router(app_state().await);
        insert(&app, r#"[{"x":1,"y":"a"},{"x":2,"y":"b"}]"#).await;

        let response = app
            .clone()
            .oneshot(
                Request::delete(format!("/api/v1/entities/{}?query=y%3Da", TYPE))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["writes"].as_array().unwrap().len(), 1);
        assert_eq!(json["writes"][0]["y"], "a");

        assert_eq!(read(&app, "y").await.len(), 1);
    }

    #[tokio::test]
    async fn test_labels_endpoints() {
        let app = create_router(app_state().await);
        let (_, json) = insert(&app, r#"[{"x":1,"y":"a","foo":""}]"#).await;
        let id = json["writes"][0].as_str().unwrap().to_string();

        // By-id reads go through the query endpoint as _id=<id> selectors.
        let entities = read(&app, &format!("_id%3D{}", id)).await;
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].get("y"), Some(&Value::from("a")));

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/api/v1/entity/{}/{}/labels", TYPE, id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            body_json(response).await,
            serde_json::json!(["foo", "x", "y"])
        );

        // Delete a label, then it is gone and _rev advanced.
        let response = app
            .clone()
            .oneshot(
                Request::delete(format!("/api/v1/entity/{}/{}/labels/foo", TYPE, id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let prior = body_json(response).await;
        assert_eq!(prior["foo"], "");
        assert_eq!(prior["_rev"], 0);

        let entities = read(&app, "y%3Da").await;
        assert!(!entities[0].contains_label("foo"));
        assert_eq!(entities[0].rev(), Some(1));

        // Unknown entity id is a 404.
        let response = app
            .oneshot(
                Request::get(format!(
                    "/api/v1/entity/{}/ffffffffffffffffffffffffffffffff/labels",
                    TYPE
                ))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["type"], "entity-not-found");
    }

    #[tokio::test]
    async fn test_distinct_projection() {
        let app = create_router(app_state().await);
        insert(
            &app,
            r#"[{"x":1,"y":"a"},{"x":2,"y":"b"},{"x":3,"y":"b"}]"#,
        )
        .await;

        let response = app
            .oneshot(
                Request::get(format!(
                    "/api/v1/entities/{}?query=y&labels=y&distinct=true",
                    TYPE
                ))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let got: Vec<Entity> = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(
            got,
            vec![
                Entity::from([("y", Value::from("a"))]),
                Entity::from([("y", Value::from("b"))]),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let app = create_router(app_state().await);
        let response = app
            .oneshot(
                Request::get("/api/v1/entities/bogus?query=y")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["type"], "invalid-param");
    }
}
