//! Administrative API (§6) — runtime config, backups, and the flow log.
//!
//! Every route is gated on `X-Admin-Key` via `authorize`: when
//! `App::admin_key` is absent, the gate is a no-op and the surface is open.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tracing::warn;

use crate::backup;
use crate::config::RuntimeConfigPatch;
use crate::state::App;

pub fn router() -> Router<Arc<App>> {
    Router::new()
        .route("/api/admin/config", get(get_config).post(patch_config))
        .route("/api/admin/backup", post(create_backup))
        .route("/api/admin/backups", get(list_backups))
        .route("/api/flows", get(get_flows).delete(clear_flows))
}

/// §6: missing admin key in config ⇒ open access; present ⇒ the header
/// must match exactly.
fn authorize(app: &App, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(configured) = &app.admin_key else {
        return Ok(());
    };
    let provided = headers
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided == configured.expose().as_str() {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

async fn get_config(State(app): State<Arc<App>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(status) = authorize(&app, &headers) {
        return status.into_response();
    }
    let runtime = app.runtime_config.read().await.clone();
    Json(runtime).into_response()
}

async fn patch_config(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(patch): Json<RuntimeConfigPatch>,
) -> impl IntoResponse {
    if let Err(status) = authorize(&app, &headers) {
        return status.into_response();
    }

    let requires_restart = {
        let mut runtime = app.runtime_config.write().await;
        runtime.apply_patch(patch)
    };
    app.persist_runtime_config().await;

    let new_capacity = app.runtime_config.read().await.max_flow_entries as usize;
    app.flow_log.set_capacity(new_capacity).await;

    Json(serde_json::json!({ "requiresRestart": requires_restart })).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct BackupRequest {
    #[serde(default)]
    label: Option<String>,
}

async fn create_backup(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    if let Err(status) = authorize(&app, &headers) {
        return status.into_response();
    }

    let label = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<BackupRequest>(&body)
            .ok()
            .and_then(|b| b.label)
    };
    let credential_store_path = app.pool.credential_store().path().to_path_buf();
    let runtime_config_path = app.runtime_config_path();
    let backup_dir = app.state_dir.join("backups");

    match backup::create_backup(&backup_dir, &credential_store_path, &runtime_config_path, label)
        .await
    {
        Ok(info) => Json(info).into_response(),
        Err(e) => {
            warn!(error = %e, "backup creation failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn list_backups(State(app): State<Arc<App>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(status) = authorize(&app, &headers) {
        return status.into_response();
    }
    let backup_dir = app.state_dir.join("backups");
    match backup::list_backups(&backup_dir).await {
        Ok(backups) => Json(backups).into_response(),
        Err(e) => {
            warn!(error = %e, "listing backups failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct FlowsQuery {
    limit: Option<usize>,
    day: Option<String>,
    days: Option<u32>,
    export: Option<String>,
}

/// `GET /api/flows?limit=N&export=json|file&days=N&day=YYYY-MM-DD` (§6).
///
/// `day` selects a single persisted day, `days` a trailing window of
/// persisted days, and with neither the in-memory ring (`limit`) is used.
/// `export=file` returns the same events as a downloadable NDJSON
/// attachment instead of a JSON array.
async fn get_flows(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Query(query): Query<FlowsQuery>,
) -> impl IntoResponse {
    if let Err(status) = authorize(&app, &headers) {
        return status.into_response();
    }

    let events = if let Some(day) = &query.day {
        app.flow_log.read_day(day).await
    } else if let Some(days) = query.days {
        app.flow_log.read_last_days(days).await
    } else {
        app.flow_log.recent(query.limit.unwrap_or(100)).await
    };

    if query.export.as_deref() == Some("file") {
        let ndjson = events
            .iter()
            .map(|e| serde_json::to_string(e).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\n");
        return (
            [
                (header::CONTENT_TYPE, "application/x-ndjson"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"flows.ndjson\"",
                ),
            ],
            ndjson,
        )
            .into_response();
    }

    Json(events).into_response()
}

async fn clear_flows(State(app): State<Arc<App>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(status) = authorize(&app, &headers) {
        return status.into_response();
    }
    app.flow_log.clear().await;
    StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Secret;

    #[test]
    fn open_access_when_no_admin_key_configured() {
        let app_like = TestAuth { admin_key: None };
        assert!(authorize_test(&app_like, &HeaderMap::new()).is_ok());
    }

    #[test]
    fn rejects_missing_header_when_key_configured() {
        let app_like = TestAuth {
            admin_key: Some(Secret::new("s3cret".to_string())),
        };
        assert_eq!(
            authorize_test(&app_like, &HeaderMap::new()),
            Err(StatusCode::UNAUTHORIZED)
        );
    }

    #[test]
    fn accepts_matching_header() {
        let app_like = TestAuth {
            admin_key: Some(Secret::new("s3cret".to_string())),
        };
        let mut headers = HeaderMap::new();
        headers.insert("x-admin-key", "s3cret".parse().unwrap());
        assert!(authorize_test(&app_like, &headers).is_ok());
    }

    struct TestAuth {
        admin_key: Option<Secret<String>>,
    }

    fn authorize_test(app: &TestAuth, headers: &HeaderMap) -> Result<(), StatusCode> {
        let Some(configured) = &app.admin_key else {
            return Ok(());
        };
        let provided = headers
            .get("x-admin-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided == configured.expose().as_str() {
            Ok(())
        } else {
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
