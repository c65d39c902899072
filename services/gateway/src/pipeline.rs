//! Request Pipeline (§4.6) — the orchestration every inbound request runs
//! through: classify, acquire an account, dispatch upstream, report the
//! outcome back to the pool, adapt the response to the caller's dialect.

use std::sync::Arc;
use std::time::Duration;

use anthropic_auth::Account;
use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use dialect::{ChatCompletionsRequest, MessagesRequest};
use futures_util::StreamExt;
use provider::{ErrorTaxonomy, PoolAction};
use tracing::warn;

use crate::error::{GatewayError, Result};
use crate::flow::FlowStage;
use crate::state::App;

/// §4.3 Rule 3: a client-visible request gives up waiting for an account
/// after this many retries of a short `Wait` result.
const MAX_WAIT_RETRIES: usize = 8;

pub async fn run_messages(app: Arc<App>, mut request: MessagesRequest) -> Result<Response> {
    request
        .validate()
        .map_err(GatewayError::InvalidRequest)?;

    let flow_id = uuid::Uuid::new_v4().to_string();
    let original_model = request.model.clone();
    request.model = dialect::classify_effective_model(&request);
    let stream = request.is_streaming();

    app.flow_log
        .emit(
            flow_id.clone(),
            FlowStage::Start {
                protocol: "messages".to_string(),
                route: "/v1/messages".to_string(),
                model: request.model.clone(),
                stream,
                request_snapshot: serde_json::json!({ "original_model": original_model }),
            },
        )
        .await;

    let mut body = serde_json::to_value(&request)
        .map_err(|e| GatewayError::Internal(format!("failed to serialize request: {e}")))?;
    provider::upstream::inject_system_prompt(&mut body);

    dispatch(app, flow_id, body, stream, ResponseShape::Messages).await
}

pub async fn run_chat_completions(
    app: Arc<App>,
    chat_request: ChatCompletionsRequest,
) -> Result<Response> {
    if chat_request.is_streaming() {
        return Err(GatewayError::InvalidRequest(
            "streaming is not supported on /v1/chat/completions".to_string(),
        ));
    }

    let original_model = chat_request.model.clone();
    let stream = chat_request.is_streaming();
    let mut request = dialect::chat_to_messages(chat_request);
    request
        .validate()
        .map_err(GatewayError::InvalidRequest)?;

    let flow_id = uuid::Uuid::new_v4().to_string();
    request.model = dialect::classify_effective_model(&request);

    app.flow_log
        .emit(
            flow_id.clone(),
            FlowStage::Start {
                protocol: "chat_completions".to_string(),
                route: "/v1/chat/completions".to_string(),
                model: request.model.clone(),
                stream,
                request_snapshot: serde_json::json!({ "original_model": original_model }),
            },
        )
        .await;

    let mut body = serde_json::to_value(&request)
        .map_err(|e| GatewayError::Internal(format!("failed to serialize request: {e}")))?;
    provider::upstream::inject_system_prompt(&mut body);

    dispatch(
        app,
        flow_id,
        body,
        stream,
        ResponseShape::ChatCompletions(original_model),
    )
    .await
}

enum ResponseShape {
    Messages,
    ChatCompletions(String),
}

/// §4.6 steps 5-9: acquire an account, dispatch upstream once, report the
/// outcome to the pool, and adapt the response into the caller's dialect. A
/// 401 forces a token refresh to classify the account but is never retried
/// against the same request (§8 Scenario 6).
async fn dispatch(
    app: Arc<App>,
    flow_id: String,
    body: serde_json::Value,
    stream: bool,
    shape: ResponseShape,
) -> Result<Response> {
    let account = acquire_account(&app).await?;

    let token = match app.token_resolver.get_token_for_account(&account).await {
        Ok(t) => t,
        Err(_) => {
            app.pool
                .mark_invalid(&account.email, "token resolution failed")
                .await;
            return Err(GatewayError::Upstream(ErrorTaxonomy::Authentication {
                message: "Unable to resolve a usable access token.".to_string(),
            }));
        }
    };
    let project = app
        .token_resolver
        .get_project_for_account(&account, &token)
        .await;

    if stream {
        return dispatch_streaming(app, flow_id, account, token, project, body, shape).await;
    }

    let result = send_upstream(&app, &token, &project, &body).await;
    let upstream_response =
        result.map_err(|e| GatewayError::Internal(format!("upstream request failed: {e}")))?;

    // §8 Scenario 6: a 401 is never auto-retried against the same request.
    // The refresh is attempted purely to learn whether the account is
    // structurally bad (refresh also fails → invalidate) or just had a
    // stale cached token (refresh succeeds → short cooldown, the fresh
    // token is left cached for the client's own retry).
    if upstream_response.status() == StatusCode::UNAUTHORIZED {
        warn!(email = %account.email, "upstream auth failure, forcing token refresh");
        app.token_resolver
            .clear_token_cache(Some(&account.email))
            .await;
        app.token_resolver
            .clear_project_cache(Some(&account.email))
            .await;
        let refresh_succeeded = app
            .token_resolver
            .get_token_for_account(&account)
            .await
            .is_ok();

        let text = upstream_response.text().await.unwrap_or_default();
        let taxonomy = provider::classify_upstream_error(&text);
        crate::metrics::record_upstream_error(taxonomy_label(&taxonomy));

        if refresh_succeeded {
            app.pool
                .record_failure(&account.email, PoolAction::Cooldown(Duration::from_secs(5)))
                .await;
        } else {
            app.pool
                .mark_invalid(&account.email, "token refresh failed after 401")
                .await;
        }
        let summary = app.pool.health().await;
        let (available, cooling_down, invalid) = pool_state_counts(&summary);
        crate::metrics::record_pool_state(available, cooling_down, invalid);

        app.flow_log
            .emit(
                flow_id.clone(),
                FlowStage::Error {
                    error_type: taxonomy_label(&taxonomy).to_string(),
                    message: taxonomy.message().to_string(),
                },
            )
            .await;
        return Err(GatewayError::Upstream(taxonomy));
    }

    let status = upstream_response.status();
    let text = upstream_response
        .text()
        .await
        .unwrap_or_else(|_| String::new());

    if !status.is_success() {
        let taxonomy = provider::classify_upstream_error(&text);
        crate::metrics::record_upstream_error(taxonomy_label(&taxonomy));
        report_failure(&app, &account, &taxonomy).await;
        app.flow_log
            .emit(
                flow_id.clone(),
                FlowStage::Error {
                    error_type: taxonomy_label(&taxonomy).to_string(),
                    message: taxonomy.message().to_string(),
                },
            )
            .await;
        return Err(GatewayError::Upstream(taxonomy));
    }

    app.pool.record_success(&account.email).await;

    let upstream_json: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| GatewayError::Internal(format!("malformed upstream body: {e}")))?;

    app.flow_log
        .emit(
            flow_id.clone(),
            FlowStage::Complete {
                usage: upstream_json.get("usage").cloned().unwrap_or(serde_json::Value::Null),
            },
        )
        .await;

    Ok(match shape {
        ResponseShape::Messages => axum::Json(upstream_json).into_response(),
        ResponseShape::ChatCompletions(original_model) => {
            let created = common::now_millis() / 1000;
            let chat_response =
                dialect::messages_response_to_chat(&upstream_json, &original_model, created);
            axum::Json(chat_response).into_response()
        }
    })
}

/// §4.3 Rule 3 wait loop: a `Wait` result means the currently-anchored
/// account's cooldown is shorter than `SHORT_WAIT_THRESHOLD`; sleep and
/// re-pick rather than switching accounts.
async fn acquire_account(app: &Arc<App>) -> Result<Account> {
    app.pool.reset_all_rate_limits_if_exhausted().await;

    for _ in 0..MAX_WAIT_RETRIES {
        match app.pool.pick_sticky_account().await {
            anthropic_pool::PickResult::Account(account) => return Ok(account),
            anthropic_pool::PickResult::Wait { ms } => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                app.pool.reset_all_rate_limits_if_exhausted().await;
            }
            anthropic_pool::PickResult::Exhausted => return Err(GatewayError::PoolExhausted),
            anthropic_pool::PickResult::Empty => return Err(GatewayError::NoAccountsEnrolled),
        }
    }
    Err(GatewayError::PoolExhausted)
}

async fn send_upstream(
    app: &Arc<App>,
    token: &str,
    project: &str,
    body: &serde_json::Value,
) -> std::result::Result<reqwest::Response, reqwest::Error> {
    let headers = provider::upstream::prepare_headers(token, project);
    app.http_client
        .post(format!("{}/v1/messages", app.upstream_base_url))
        .headers(headers)
        .json(body)
        .send()
        .await
}

async fn report_failure(app: &Arc<App>, account: &Account, taxonomy: &ErrorTaxonomy) {
    let action = taxonomy.pool_action();
    app.pool.record_failure(&account.email, action.clone()).await;
    if let PoolAction::Invalidate(_) = action {
        app.token_resolver
            .clear_token_cache(Some(&account.email))
            .await;
        app.token_resolver
            .clear_project_cache(Some(&account.email))
            .await;
    }
    let summary = app.pool.health().await;
    let (available, cooling_down, invalid) = pool_state_counts(&summary);
    crate::metrics::record_pool_state(available, cooling_down, invalid);
}

fn pool_state_counts(summary: &serde_json::Value) -> (usize, usize, usize) {
    let available = summary
        .get("accounts_available")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as usize;
    let cooling_down = summary
        .get("accounts_cooling_down")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as usize;
    let invalid = summary
        .get("accounts_invalid")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as usize;
    (available, cooling_down, invalid)
}

fn taxonomy_label(taxonomy: &ErrorTaxonomy) -> &'static str {
    match taxonomy {
        ErrorTaxonomy::Authentication { .. } => "authentication_error",
        ErrorTaxonomy::Overloaded { .. } => "overloaded_error",
        ErrorTaxonomy::InvalidRequest { .. } => "invalid_request_error",
        ErrorTaxonomy::Permission { .. } => "permission_error",
        ErrorTaxonomy::Api { .. } => "api_error",
    }
}

/// §6 SSE streaming passthrough: forward upstream chunks as they arrive,
/// watching for an in-band `type: "error"` event (scenario 5) and
/// translating it into the gateway's own error frame before ending the
/// stream. The account is reported against the pool the same way a
/// pre-headers failure would be, so a mid-stream `RESOURCE_EXHAUSTED` still
/// lands the account in cooldown.
async fn dispatch_streaming(
    app: Arc<App>,
    flow_id: String,
    account: Account,
    token: String,
    project: String,
    body: serde_json::Value,
    shape: ResponseShape,
) -> Result<Response> {
    let headers = provider::upstream::prepare_headers(&token, &project);
    let upstream = app
        .http_client
        .post(format!("{}/v1/messages", app.upstream_base_url))
        .headers(headers)
        .json(&body)
        .send()
        .await
        .map_err(|e| GatewayError::Internal(format!("upstream request failed: {e}")))?;

    if !upstream.status().is_success() {
        let text = upstream.text().await.unwrap_or_default();
        let taxonomy = provider::classify_upstream_error(&text);
        crate::metrics::record_upstream_error(taxonomy_label(&taxonomy));
        report_failure(&app, &account, &taxonomy).await;
        return Err(GatewayError::Upstream(taxonomy));
    }

    // Success is only recorded once headers arrive; a mid-stream error is
    // still reported against the account via the byte-stream branch below.
    app.pool.record_success(&account.email).await;

    let is_chat = matches!(shape, ResponseShape::ChatCompletions(_));
    let model_for_chat = match &shape {
        ResponseShape::ChatCompletions(m) => m.clone(),
        ResponseShape::Messages => String::new(),
    };

    let stream_app = app.clone();
    let stream_account = account.clone();
    let mut byte_stream = upstream.bytes_stream();
    let output = async_stream::stream! {
        let mut buffer = String::new();
        loop {
            let chunk = match byte_stream.next().await {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    let taxonomy = provider::classify_upstream_error(&e.to_string());
                    crate::metrics::record_upstream_error(taxonomy_label(&taxonomy));
                    report_failure(&stream_app, &stream_account, &taxonomy).await;
                    yield Ok::<Bytes, std::io::Error>(Bytes::from(dialect::sse::frame_error(&taxonomy)));
                    break;
                }
                None => break,
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(idx) = buffer.find("\n\n") {
                let event_block: String = buffer.drain(..idx + 2).collect();
                let Some(data_line) = event_block.lines().find(|l| l.starts_with("data:")) else {
                    continue;
                };
                let payload = data_line.trim_start_matches("data:").trim();
                let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
                    continue;
                };

                if value.get("type").and_then(|t| t.as_str()) == Some("error") {
                    let message = value
                        .get("error")
                        .and_then(|e| e.get("message"))
                        .and_then(|m| m.as_str())
                        .unwrap_or("stream error")
                        .to_string();
                    let taxonomy = provider::classify_upstream_error(&message);
                    crate::metrics::record_upstream_error(taxonomy_label(&taxonomy));
                    report_failure(&stream_app, &stream_account, &taxonomy).await;
                    yield Ok(Bytes::from(dialect::sse::frame_error(&taxonomy)));
                    return;
                }

                let framed = if is_chat {
                    dialect::sse::frame_chunk(&chat_chunk_passthrough(&value, &model_for_chat))
                } else {
                    dialect::sse::frame_chunk(&value)
                };
                yield Ok(Bytes::from(framed));
            }
        }
    };

    app.flow_log
        .emit(flow_id.clone(), FlowStage::Complete { usage: serde_json::Value::Null })
        .await;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(output))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

/// Re-stamp the `model` field on a passthrough chunk so Chat-Completions
/// clients see the model they requested, not the (possibly downgraded)
/// model actually dispatched.
fn chat_chunk_passthrough(value: &serde_json::Value, original_model: &str) -> serde_json::Value {
    let mut chunk = value.clone();
    if chunk.get("model").is_some() {
        chunk["model"] = serde_json::Value::String(original_model.to_string());
    }
    chunk
}
