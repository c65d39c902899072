//! Upstream request preparation and dispatch
//!
//! The deeper rewriting between the gateway's internal Messages shape and
//! the upstream's own wire format is out of scope (§1: "the core calls it
//! as an opaque function") — this module is that opaque boundary. What it
//! does own, because the concrete details are already part of this gateway's
//! contract with the upstream, is Bearer-token injection, anthropic-beta
//! flag merging, and the required system-prompt prefix, mirroring how the
//! original OAuth proxy prepared every outbound request.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

/// Required anthropic-beta flags, always injected and merged with any
/// caller-provided flags (deduplicated).
const REQUIRED_BETA_FLAGS: &[&str] = &[
    "oauth-2025-04-20",
    "interleaved-thinking-2025-05-14",
    "context-management-2025-06-27",
];

/// User-Agent header value matching the Claude CLI identity.
const USER_AGENT: &str = "claude-cli/2.0.76 (external, sdk-cli)";

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Required system prompt prefix for Opus/Sonnet access.
const REQUIRED_SYSTEM_PROMPT_PREFIX: &str =
    "You are Claude Code, Anthropic's official CLI for Claude.";

/// Build the headers sent with every upstream call, given a resolved
/// access token and an optional project id.
pub fn prepare_headers(access_token: &str, project_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();

    headers.insert(
        reqwest::header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {access_token}"))
            .unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    merge_beta_headers(&mut headers);
    headers.insert(
        HeaderName::from_static("anthropic-dangerous-direct-browser-access"),
        HeaderValue::from_static("true"),
    );
    headers.insert(
        reqwest::header::USER_AGENT,
        HeaderValue::from_static(USER_AGENT),
    );
    headers.insert(
        HeaderName::from_static("anthropic-version"),
        HeaderValue::from_static(ANTHROPIC_VERSION),
    );
    if let Ok(value) = HeaderValue::from_str(project_id) {
        headers.insert(HeaderName::from_static("anthropic-project-id"), value);
    }

    headers
}

/// Merge required anthropic-beta flags with any caller-provided flags
/// already on `headers`.
fn merge_beta_headers(headers: &mut HeaderMap) {
    let mut flags: Vec<String> = REQUIRED_BETA_FLAGS.iter().map(|s| s.to_string()).collect();

    if let Some(existing) = headers.get("anthropic-beta")
        && let Ok(existing_str) = existing.to_str()
    {
        for flag in existing_str.split(',') {
            let trimmed = flag.trim().to_string();
            if !trimmed.is_empty() && !flags.contains(&trimmed) {
                flags.push(trimmed);
            }
        }
    }

    let merged = flags.join(",");
    match HeaderValue::from_str(&merged) {
        Ok(v) => {
            headers.insert(HeaderName::from_static("anthropic-beta"), v);
        }
        Err(e) => warn!(error = %e, "failed to construct merged anthropic-beta header"),
    }
}

/// Inject the required system prompt prefix into `body` for non-Haiku
/// models, matching the upstream's enrollment requirement.
pub fn inject_system_prompt(body: &mut serde_json::Value) {
    let model = match body.get("model").and_then(|m| m.as_str()) {
        Some(m) => m.to_lowercase(),
        None => return,
    };

    if model.contains("haiku") {
        debug!(model = %model, "skipping system prompt injection for haiku model");
        return;
    }

    match body.get("system") {
        None => {
            body["system"] = serde_json::Value::String(REQUIRED_SYSTEM_PROMPT_PREFIX.to_string());
        }
        Some(existing) => {
            if let Some(existing_str) = existing.as_str()
                && !existing_str.starts_with(REQUIRED_SYSTEM_PROMPT_PREFIX)
            {
                body["system"] = serde_json::Value::String(format!(
                    "{REQUIRED_SYSTEM_PROMPT_PREFIX} {existing_str}"
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_headers_sets_bearer_token() {
        let headers = prepare_headers("at_123", "proj-1");
        assert_eq!(headers.get("authorization").unwrap(), "Bearer at_123");
    }

    #[test]
    fn prepare_headers_merges_required_beta_flags() {
        let headers = prepare_headers("at_123", "proj-1");
        let beta = headers.get("anthropic-beta").unwrap().to_str().unwrap();
        assert!(beta.contains("oauth-2025-04-20"));
        assert!(beta.contains("interleaved-thinking-2025-05-14"));
    }

    #[test]
    fn inject_no_system_field() {
        let mut body = serde_json::json!({"model": "claude-sonnet-4-5", "messages": []});
        inject_system_prompt(&mut body);
        assert_eq!(
            body["system"].as_str().unwrap(),
            REQUIRED_SYSTEM_PROMPT_PREFIX
        );
    }

    #[test]
    fn inject_haiku_skipped() {
        let mut body = serde_json::json!({"model": "claude-3-5-haiku-20241022", "messages": []});
        inject_system_prompt(&mut body);
        assert!(body.get("system").is_none());
    }

    #[test]
    fn inject_existing_system_without_prefix_is_prepended() {
        let mut body = serde_json::json!({
            "model": "claude-sonnet-4-5",
            "system": "You are a helpful assistant."
        });
        inject_system_prompt(&mut body);
        let system = body["system"].as_str().unwrap();
        assert!(system.starts_with(REQUIRED_SYSTEM_PROMPT_PREFIX));
        assert!(system.contains("You are a helpful assistant."));
    }

    #[test]
    fn inject_existing_system_with_prefix_is_noop() {
        let existing = format!("{REQUIRED_SYSTEM_PROMPT_PREFIX} extra");
        let mut body = serde_json::json!({"model": "claude-sonnet-4-5", "system": existing});
        inject_system_prompt(&mut body);
        assert_eq!(body["system"].as_str().unwrap(), existing);
    }
}
