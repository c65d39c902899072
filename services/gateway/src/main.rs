//! Multi-tenant gateway fronting the upstream Claude Code service via a
//! pool of OAuth-style credentials, speaking both an Anthropic-style
//! Messages dialect and an OpenAI-style Chat Completions dialect.

mod admin;
mod backup;
mod config;
mod error;
mod flow;
mod metrics;
mod pipeline;
mod state;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::error::GatewayError;
use crate::state::App;

static REQUESTS_TOTAL: AtomicU64 = AtomicU64::new(0);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting gateway");

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let listen_addr = config.listen_addr;
    info!(
        listen_addr = %listen_addr,
        upstream_url = %config.upstream_base_url(),
        state_dir = %config.state_dir.display(),
        "configuration loaded"
    );

    let prometheus_handle = metrics::install_recorder();

    let app = App::build(config, prometheus_handle)
        .await
        .context("failed to build application state")?;

    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/messages", post(messages_handler))
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/v1/models", get(models_handler))
        .route("/account-limits", get(account_limits_handler))
        .route("/refresh-token", post(refresh_token_handler))
        .merge(admin::router())
        .with_state(app);

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    info!(addr = %listen_addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

async fn health_handler(State(app): State<Arc<App>>) -> impl IntoResponse {
    let uptime = app.started_at.elapsed().as_secs();
    let requests = REQUESTS_TOTAL.load(Ordering::Relaxed);
    let pool_health = app.pool.health().await;

    axum::Json(serde_json::json!({
        "status": "healthy",
        "uptime_seconds": uptime,
        "requests_served": requests,
        "pool": pool_health,
    }))
}

async fn metrics_handler(State(app): State<Arc<App>>) -> impl IntoResponse {
    (StatusCode::OK, app.prometheus_handle.render())
}

async fn models_handler() -> impl IntoResponse {
    axum::Json(dialect::list_models())
}

#[derive(serde::Serialize)]
struct AccountLimitRow {
    email: String,
    status: &'static str,
    health_score: i32,
    recommended: bool,
    success_count: u64,
    error_count: u64,
    cooldown_remaining_ms: u64,
}

/// §6 `GET /account-limits`: aggregated per-account quota/health snapshot.
///
/// Per-*account* is as far as this aggregates — the Account data model
/// carries no per-model quota dimension, only pool-wide success/error
/// counters and rate-limit state (see DESIGN.md). `Accept: text/plain`
/// renders the same rows as an ASCII table instead of JSON.
async fn account_limits_handler(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let accounts = app.pool.accounts().await;
    let now = common::now_millis();

    let rows: Vec<AccountLimitRow> = accounts
        .into_iter()
        .map(|account| {
            let status = if account.is_invalid {
                "invalid"
            } else if account.is_rate_limited {
                "cooling_down"
            } else {
                "available"
            };
            let cooldown_remaining_ms = account
                .rate_limit_reset_time
                .map(|t| t.saturating_sub(now))
                .unwrap_or(0);
            AccountLimitRow {
                email: account.email,
                status,
                health_score: account.health_score,
                recommended: account.recommended,
                success_count: account.stats.success_count,
                error_count: account.stats.error_count,
                cooldown_remaining_ms,
            }
        })
        .collect();

    let wants_table = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/plain"));

    if wants_table {
        render_account_limits_table(&rows).into_response()
    } else {
        axum::Json(rows).into_response()
    }
}

fn render_account_limits_table(rows: &[AccountLimitRow]) -> String {
    let mut table = String::from(
        "EMAIL                          STATUS        HEALTH  RECOMMENDED  OK    ERR   COOLDOWN_MS\n",
    );
    for row in rows {
        table.push_str(&format!(
            "{:<30} {:<13} {:<7} {:<12} {:<5} {:<5} {}\n",
            row.email,
            row.status,
            row.health_score,
            row.recommended,
            row.success_count,
            row.error_count,
            row.cooldown_remaining_ms,
        ));
    }
    table
}

async fn refresh_token_handler(State(app): State<Arc<App>>) -> impl IntoResponse {
    app.token_resolver.clear_token_cache(None).await;
    app.token_resolver.clear_project_cache(None).await;
    StatusCode::NO_CONTENT
}

async fn messages_handler(
    State(app): State<Arc<App>>,
    body: std::result::Result<
        axum::Json<dialect::MessagesRequest>,
        axum::extract::rejection::JsonRejection,
    >,
) -> axum::response::Response {
    let request = match body {
        Ok(axum::Json(request)) => request,
        Err(rejection) => {
            return GatewayError::InvalidRequest(rejection.body_text()).into_response();
        }
    };
    REQUESTS_TOTAL.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let result = pipeline::run_messages(app, request).await;
    record_outcome(&result, started);
    into_response_or_error(result)
}

async fn chat_completions_handler(
    State(app): State<Arc<App>>,
    body: std::result::Result<
        axum::Json<dialect::ChatCompletionsRequest>,
        axum::extract::rejection::JsonRejection,
    >,
) -> axum::response::Response {
    let request = match body {
        Ok(axum::Json(request)) => request,
        Err(rejection) => {
            return GatewayError::InvalidRequest(rejection.body_text()).into_response();
        }
    };
    REQUESTS_TOTAL.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let result = pipeline::run_chat_completions(app, request).await;
    record_outcome(&result, started);
    into_response_or_error(result)
}

fn record_outcome(result: &error::Result<axum::response::Response>, started: Instant) {
    let status = match result {
        Ok(response) => response.status().as_u16(),
        Err(_) => 500,
    };
    metrics::record_request(status, "POST", started.elapsed().as_secs_f64());
}

fn into_response_or_error(
    result: error::Result<axum::response::Response>,
) -> axum::response::Response {
    match result {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
