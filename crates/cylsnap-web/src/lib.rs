//! JSON read surface over the cylinder inventory.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use cylsnap_core::{HiddenTypeMarker, Language, TypeKey};
use cylsnap_inventory::{InventoryError, InventoryQuery, InventoryService};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "cylsnap-web";

#[derive(Clone)]
pub struct AppState {
    pub inventory: InventoryService,
}

impl AppState {
    pub fn new(inventory: InventoryService) -> Self {
        Self { inventory }
    }
}

#[derive(Debug, Deserialize, Default)]
struct LangQuery {
    lang: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct HideRequest {
    note: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    service: &'static str,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/inventory", get(inventory_handler))
        .route("/inventory/rows", get(inventory_rows_handler))
        .route("/alerts", get(alerts_handler))
        .route("/types/{type_key}/hide", post(hide_handler))
        .route("/types/{type_key}/unhide", post(unhide_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "inventory http surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        service: CRATE_NAME,
    })
}

async fn inventory_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InventoryQuery>,
) -> Response {
    match state.inventory.groups(&query).await {
        Ok(groups) => Json(groups).into_response(),
        Err(err) => server_error(err),
    }
}

async fn inventory_rows_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InventoryQuery>,
) -> Response {
    match state.inventory.rows(&query).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn alerts_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InventoryQuery>,
    Query(lang): Query<LangQuery>,
) -> Response {
    let lang = match lang.lang.as_deref().map(str::parse::<Language>) {
        None => Language::default(),
        Some(Ok(lang)) => lang,
        Some(Err(message)) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
        }
    };
    match state.inventory.alerts(&query, lang).await {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => server_error(err),
    }
}

async fn hide_handler(
    State(state): State<Arc<AppState>>,
    Path(type_key): Path<String>,
    Query(req): Query<HideRequest>,
) -> Response {
    let note = req.note.filter(|n| !n.trim().is_empty());
    let marker = HiddenTypeMarker {
        type_key: TypeKey::new(type_key),
        hidden_at: Utc::now(),
        note,
    };
    match state.inventory.hide(&marker).await {
        Ok(()) => Json(marker).into_response(),
        Err(err) => server_error(err),
    }
}

async fn unhide_handler(
    State(state): State<Arc<AppState>>,
    Path(type_key): Path<String>,
) -> Response {
    match state.inventory.unhide(&TypeKey::new(type_key)).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: InventoryError) -> Response {
    warn!(error = %err, "inventory request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::TimeZone;
    use cylsnap_core::SnapshotRecord;
    use cylsnap_inventory::RiskThresholds;
    use cylsnap_storage::{MemoryStore, SnapshotStore};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn snapshot(id: &str, key: &str, status: &str) -> SnapshotRecord {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 9, 0, 0).single().unwrap();
        SnapshotRecord {
            cylinder_id: id.to_string(),
            gas_name: "SiH4".to_string(),
            capacity: Some(10.0),
            valve_spec: "CGA350".to_string(),
            cylinder_spec: "MN".to_string(),
            location_code: String::new(),
            usage_code: String::new(),
            enduser_code: "E01".to_string(),
            condition_code: String::new(),
            status: Some(status.to_string()),
            valve_format: "CGA350".to_string(),
            valve_material: String::new(),
            cylinder_format: String::new(),
            cylinder_material: "MN".to_string(),
            usage_place: "FAB1".to_string(),
            type_key: TypeKey::new(key),
            is_available: None,
            pressure_due_date: None,
            last_event_at: None,
            source_updated_at: at,
            refreshed_at: at,
        }
    }

    async fn test_app() -> Router {
        let store = Arc::new(MemoryStore::new());
        for record in [
            snapshot("C-1", "k1", "shipped"),
            snapshot("C-2", "k1", "shipped"),
            snapshot("C-3", "k2", "stored_collected"),
        ] {
            store.upsert(&record).await.unwrap();
        }
        app(AppState::new(InventoryService::new(
            store,
            RiskThresholds::default(),
        )))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn handler_smoke_health() {
        let (status, body) = get_json(test_app().await, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn inventory_groups_and_rows() {
        let app = test_app().await;
        let (status, groups) = get_json(app.clone(), "/inventory").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(groups.as_array().unwrap().len(), 2);
        assert_eq!(groups[0]["type_key"], "k1");
        assert_eq!(groups[0]["risk"], "HIGH");
        assert_eq!(groups[0]["by_family"]["outbound"], 2);

        let (_, rows) = get_json(app.clone(), "/inventory/rows?type_key=k2").await;
        assert_eq!(rows.as_array().unwrap().len(), 1);
        assert_eq!(rows[0]["status"], "stored_collected");

        let (_, filtered) = get_json(app, "/inventory?status=available").await;
        assert_eq!(filtered.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn alerts_honor_language_parameter() {
        let app = test_app().await;
        let (status, alerts) = get_json(app.clone(), "/alerts?lang=ja").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(alerts.as_array().unwrap().len(), 1);
        assert!(alerts[0]["advisory"].as_str().unwrap().contains("在庫がありません"));

        let (status, _) = get_json(app, "/alerts?lang=fr").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn hidden_type_drops_out_of_inventory() {
        let app = test_app().await;
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/types/k1/hide")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let (_, groups) = get_json(app.clone(), "/inventory").await;
        assert_eq!(groups.as_array().unwrap().len(), 1);
        let (_, alerts) = get_json(app.clone(), "/alerts").await;
        assert!(alerts.as_array().unwrap().is_empty());

        let (_, all) = get_json(app.clone(), "/inventory?include_hidden=true").await;
        assert_eq!(all.as_array().unwrap().len(), 2);

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/types/k1/unhide")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }
}
