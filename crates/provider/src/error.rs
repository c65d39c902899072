//! Error Classifier (§4.7) — closed upstream error taxonomy
//!
//! Upstream errors arrive as opaque strings; this module maps them to the
//! five-member taxonomy the rest of the system is built around, computes
//! `Retry-After`, and derives what the pool should do about it.

use std::time::Duration;

use serde::Serialize;

/// The closed taxonomy. Every client-visible error is one of these five.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum ErrorTaxonomy {
    #[serde(rename = "authentication_error")]
    Authentication { message: String },
    #[serde(rename = "overloaded_error")]
    Overloaded { message: String, retry_after_secs: u64 },
    #[serde(rename = "invalid_request_error")]
    InvalidRequest { message: String },
    #[serde(rename = "permission_error")]
    Permission { message: String },
    #[serde(rename = "api_error")]
    Api { message: String, status: u16 },
}

impl std::fmt::Display for ErrorTaxonomy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.tag(), self.message())
    }
}

impl std::error::Error for ErrorTaxonomy {}

impl ErrorTaxonomy {
    /// The HTTP status this taxonomy member is surfaced as.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorTaxonomy::Authentication { .. } => 401,
            ErrorTaxonomy::Overloaded { .. } => 503,
            ErrorTaxonomy::InvalidRequest { .. } => 400,
            ErrorTaxonomy::Permission { .. } => 403,
            ErrorTaxonomy::Api { status, .. } => *status,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ErrorTaxonomy::Authentication { message }
            | ErrorTaxonomy::Overloaded { message, .. }
            | ErrorTaxonomy::InvalidRequest { message }
            | ErrorTaxonomy::Permission { message }
            | ErrorTaxonomy::Api { message, .. } => message,
        }
    }

    /// The client-facing error envelope body: `{type, message}`.
    pub fn to_envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.tag(),
            "message": self.message(),
        })
    }

    fn tag(&self) -> &'static str {
        match self {
            ErrorTaxonomy::Authentication { .. } => "authentication_error",
            ErrorTaxonomy::Overloaded { .. } => "overloaded_error",
            ErrorTaxonomy::InvalidRequest { .. } => "invalid_request_error",
            ErrorTaxonomy::Permission { .. } => "permission_error",
            ErrorTaxonomy::Api { .. } => "api_error",
        }
    }
}

/// What the pool should do in response to a classified upstream error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolAction {
    /// No state change (e.g. a one-off 400 on a single request).
    None,
    /// Enter cooldown for the given duration.
    Cooldown(Duration),
    /// Mark the account invalid with the given reason.
    Invalidate(String),
}

impl ErrorTaxonomy {
    /// Derive the pool-side consequence of this error (§4.3 `recordFailure`).
    pub fn pool_action(&self) -> PoolAction {
        match self {
            ErrorTaxonomy::Authentication { message } => PoolAction::Invalidate(message.clone()),
            ErrorTaxonomy::Overloaded {
                retry_after_secs, ..
            } => PoolAction::Cooldown(Duration::from_secs(*retry_after_secs)),
            ErrorTaxonomy::InvalidRequest { .. } | ErrorTaxonomy::Permission { .. } => {
                PoolAction::None
            }
            ErrorTaxonomy::Api { .. } => PoolAction::None,
        }
    }
}

/// Fallback `Retry-After` when a cooldown message can't be parsed.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Classify an opaque upstream error message per the §4.7 table.
pub fn classify_upstream_error(message: &str) -> ErrorTaxonomy {
    if message.contains("401") || message.contains("UNAUTHENTICATED") {
        return ErrorTaxonomy::Authentication {
            message: "Your session has expired. Please re-enroll this account.".to_string(),
        };
    }

    if message.contains("429")
        || message.contains("RESOURCE_EXHAUSTED")
        || message.contains("QUOTA_EXHAUSTED")
    {
        let retry_after_secs = parse_cooldown(message).unwrap_or(DEFAULT_RETRY_AFTER_SECS);
        return ErrorTaxonomy::Overloaded {
            message: message.to_string(),
            retry_after_secs,
        };
    }

    if message.contains("invalid_request_error") || message.contains("INVALID_ARGUMENT") {
        return ErrorTaxonomy::InvalidRequest {
            message: extract_quoted_message(message).unwrap_or_else(|| message.to_string()),
        };
    }

    if message.contains("All endpoints failed") {
        return ErrorTaxonomy::Api {
            message: message.to_string(),
            status: 503,
        };
    }

    if message.contains("PERMISSION_DENIED") {
        return ErrorTaxonomy::Permission {
            message: message.to_string(),
        };
    }

    ErrorTaxonomy::Api {
        message: message.to_string(),
        status: 500,
    }
}

/// Extract a `"message":"..."` payload from an upstream error string, if present.
fn extract_quoted_message(text: &str) -> Option<String> {
    let key = "\"message\":\"";
    let start = text.find(key)? + key.len();
    let rest = &text[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

/// Parse `"...reset after HhMmSs"` or `"...Ns"` cooldown phrases into seconds.
///
/// `"quota will reset after 1h2m3s"` → 3723; `"...after 45s"` → 45;
/// unparseable → `None` (caller falls back to the 60s default).
pub fn parse_cooldown(text: &str) -> Option<u64> {
    let marker = "reset after ";
    let idx = text.find(marker)?;
    let rest = &text[idx + marker.len()..];

    let mut total = 0u64;
    let mut number = String::new();
    let mut matched_any = false;

    for c in rest.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        match c {
            'h' | 'm' | 's' if !number.is_empty() => {
                let value: u64 = number.parse().ok()?;
                number.clear();
                matched_any = true;
                total += match c {
                    'h' => value * 3600,
                    'm' => value * 60,
                    's' => value,
                    _ => unreachable!(),
                };
            }
            _ => break,
        }
    }

    matched_any.then_some(total)
}
