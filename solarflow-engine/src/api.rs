//! Operator HTTP surface.

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use solarflow_client::{
    domain::{AuditEntry, AuditTarget, RelayCommand, RelayMode, RelayState},
    RecordStore,
};

use crate::billing::BillingSummary;
use crate::coordinator::CommandReceipt;
use crate::engine::{Engine, LatestTelemetry};
use crate::error::EngineError;

pub const OPERATOR_HEADER: &str = "x-operator-id";
pub const ANONYMOUS_OPERATOR: &str = "anonymous";

pub fn router<S: RecordStore>(engine: Arc<Engine<S>>) -> Router {
    Router::new()
        .route("/relays", get(get_relays::<S>))
        .route("/relays/:unit", post(set_relay::<S>))
        .route("/mode", post(set_mode::<S>))
        .route("/telemetry/latest", get(latest_telemetry::<S>))
        .route("/telemetry/history", get(telemetry_history::<S>))
        .route("/audit", get(audit::<S>))
        .route("/billing", get(billing::<S>))
        .route("/billing/reset", post(reset_billing::<S>))
        .with_state(engine)
}

fn operator(headers: &HeaderMap) -> String {
    headers
        .get(OPERATOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(ANONYMOUS_OPERATOR)
        .to_string()
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    unit: Option<String>,
    requested: Option<String>,
    reason: String,
}

pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            EngineError::InterlockViolation { .. }
            | EngineError::GlobalInterlockViolation { .. }
            | EngineError::ConcurrentModification { .. } => StatusCode::CONFLICT,
            EngineError::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let (unit, requested) = match &err {
            EngineError::InterlockViolation { unit, requested, .. } => {
                (Some(unit.to_string()), Some(requested.to_string()))
            }
            EngineError::GlobalInterlockViolation { requested } => {
                (Some(AuditTarget::AllUnits.to_string()), Some(requested.to_string()))
            }
            EngineError::ConcurrentModification { target, attempted, .. }
            | EngineError::StoreUnavailable { target, attempted, .. } => {
                (Some(target.clone()), Some(attempted.clone()))
            }
            EngineError::Validation(_) | EngineError::Corrupt(_) => (None, None),
        };
        let body = ErrorBody {
            error: err.kind(),
            unit,
            requested,
            reason: err.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct RelaysResponse {
    relays: BTreeMap<u8, RelayCommand>,
    manual_override: bool,
    interlock_violated: bool,
}

async fn get_relays<S: RecordStore>(State(engine): State<Arc<Engine<S>>>) -> Json<RelaysResponse> {
    let view = engine.relay_view().await;
    Json(RelaysResponse {
        relays: view.to_map(),
        manual_override: view.is_manual_override(),
        interlock_violated: view.interlock_violated(),
    })
}

#[derive(Debug, Deserialize)]
struct RelayRequest {
    mode: RelayMode,
    state: RelayState,
}

async fn set_relay<S: RecordStore>(
    State(engine): State<Arc<Engine<S>>>,
    Path(unit): Path<u8>,
    headers: HeaderMap,
    Json(req): Json<RelayRequest>,
) -> Result<Json<CommandReceipt>, ApiError> {
    let receipt = engine
        .set_relay_command(unit, req.mode, req.state, Some(operator(&headers)))
        .await?;
    Ok(Json(receipt))
}

#[derive(Debug, Deserialize)]
struct ModeRequest {
    mode: RelayMode,
}

async fn set_mode<S: RecordStore>(
    State(engine): State<Arc<Engine<S>>>,
    headers: HeaderMap,
    Json(req): Json<ModeRequest>,
) -> Result<Json<CommandReceipt>, ApiError> {
    let receipt = engine.set_global_mode(req.mode, Some(operator(&headers))).await?;
    Ok(Json(receipt))
}

async fn latest_telemetry<S: RecordStore>(
    State(engine): State<Arc<Engine<S>>>,
) -> Result<Json<LatestTelemetry>, StatusCode> {
    engine.latest_telemetry().await.map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn telemetry_history<S: RecordStore>(State(engine): State<Arc<Engine<S>>>) -> impl IntoResponse {
    Json(engine.telemetry_history().await)
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct AuditRow {
    id: String,
    #[serde(flatten)]
    entry: AuditEntry,
}

async fn audit<S: RecordStore>(
    State(engine): State<Arc<Engine<S>>>,
    Query(query): Query<AuditQuery>,
) -> Json<Vec<AuditRow>> {
    let limit = query.limit.unwrap_or(engine.settings().audit_view_limit);
    let rows = engine
        .recent_audit(limit)
        .await
        .into_iter()
        .map(|entry| AuditRow {
            id: entry.id.clone(),
            entry,
        })
        .collect();
    Json(rows)
}

async fn billing<S: RecordStore>(State(engine): State<Arc<Engine<S>>>) -> Result<Json<BillingSummary>, ApiError> {
    Ok(Json(engine.billing_summary().await?))
}

async fn reset_billing<S: RecordStore>(
    State(engine): State<Arc<Engine<S>>>,
    headers: HeaderMap,
) -> Result<Json<CommandReceipt>, ApiError> {
    let receipt = engine.reset_billing(Some(operator(&headers))).await?;
    Ok(Json(receipt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::EngineSettings;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use solarflow_client::db::MemoryStore;
    use time::macros::datetime;
    use tower::ServiceExt;

    fn app() -> Router {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 10:00:00 UTC)));
        let engine = Engine::new(Arc::new(MemoryStore::new()), clock, EngineSettings::default());
        router(Arc::new(engine))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .header(OPERATOR_HEADER, "op-42");
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn interlock_denial_maps_to_conflict_with_details() {
        let app = app();
        let (status, _) = call(&app, "POST", "/relays/3", Some(json!({ "mode": "manual", "state": true }))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, "POST", "/relays/2", Some(json!({ "mode": "manual", "state": true }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "interlock_violation");
        assert_eq!(body["unit"], "R2");
        assert_eq!(body["requested"], "ON");
        assert!(body["reason"].as_str().unwrap().contains("R3"));
    }

    #[tokio::test]
    async fn refused_global_manual_reports_the_global_request() {
        let app = app();
        for unit in [2, 3] {
            let (status, _) = call(&app, "POST", &format!("/relays/{unit}"), Some(json!({ "mode": "auto", "state": true }))).await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, body) = call(&app, "POST", "/mode", Some(json!({ "mode": "manual" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "interlock_violation");
        assert_eq!(body["unit"], "GLOBAL");
        assert_eq!(body["requested"], "manual");
    }

    #[tokio::test]
    async fn unknown_unit_is_bad_request() {
        let app = app();
        let (status, body) = call(&app, "POST", "/relays/7", Some(json!({ "mode": "auto", "state": false }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation");
    }

    #[tokio::test]
    async fn receipt_reports_recorded_audit_entry() {
        let app = app();
        let (status, body) = call(&app, "POST", "/mode", Some(json!({ "mode": "manual" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["target"], "GLOBAL");
        assert_eq!(body["audit"]["status"], "recorded");
    }

    #[tokio::test]
    async fn billing_reset_and_summary() {
        let app = app();
        let (status, body) = call(&app, "POST", "/billing/reset", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["target"], "BILLING");

        let (status, body) = call(&app, "GET", "/billing", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["energy_sold_kwh"], 0.0);
        assert_eq!(body["last_reset_at"], "2024-05-01T10:00:00Z");
    }

    #[tokio::test]
    async fn latest_telemetry_is_not_found_before_any_sample() {
        let app = app();
        let (status, _) = call(&app, "GET", "/telemetry/latest", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn operator_defaults_to_anonymous() {
        let mut headers = HeaderMap::new();
        assert_eq!(operator(&headers), ANONYMOUS_OPERATOR);
        headers.insert(OPERATOR_HEADER, "  ".parse().unwrap());
        assert_eq!(operator(&headers), ANONYMOUS_OPERATOR);
        headers.insert(OPERATOR_HEADER, "op-3".parse().unwrap());
        assert_eq!(operator(&headers), "op-3");
    }
}
