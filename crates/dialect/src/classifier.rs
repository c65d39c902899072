//! Request Classifier (§4.4) — background-task downgrade and model-name
//! normalization.

use crate::messages::MessagesRequest;

/// Cheaper model substituted for requests classified as background tasks.
pub const FREE_MODEL_FOR_BACKGROUND: &str = "claude-3-5-haiku-20241022";

/// Substrings that, when found in the flattened system prompt + first three
/// messages, mark a request as a background task eligible for downgrade.
const BACKGROUND_TASK_PATTERNS: &[&str] = &[
    "summarize",
    "summarise",
    "conversation title",
    "title this chat",
    "generate a title",
    "generate a short title",
    "concise summary",
    "one-line description",
];

/// Models the downgrade is permitted to replace. A request already targeting
/// one of these (or anything outside this allowlist's complement) is left
/// alone — see `supports_downgrade`.
const DOWNGRADE_ELIGIBLE_MODELS: &[&str] = &[
    "claude-opus-4-5-thinking",
    "claude-sonnet-4-5-thinking",
    "claude-sonnet-4-5",
];

/// Dated model identifiers rewritten to their canonical thinking-enabled
/// variant before selection.
const MODEL_NORMALIZATION: &[(&str, &str)] = &[
    ("claude-opus-4-5-20250514", "claude-opus-4-5-thinking"),
    ("claude-sonnet-4-5-20250514", "claude-sonnet-4-5-thinking"),
    ("claude-opus-4-5", "claude-opus-4-5-thinking"),
];

/// Rewrite a dated or bare model identifier to its canonical variant.
/// Unrecognized identifiers pass through unchanged.
pub fn normalize_model_name(model: &str) -> String {
    MODEL_NORMALIZATION
        .iter()
        .find(|(from, _)| *from == model)
        .map(|(_, to)| to.to_string())
        .unwrap_or_else(|| model.to_string())
}

fn supports_downgrade(model: &str) -> bool {
    DOWNGRADE_ELIGIBLE_MODELS.contains(&model)
}

fn matches_background_pattern(text: &str) -> bool {
    BACKGROUND_TASK_PATTERNS.iter().any(|p| text.contains(p))
}

/// §4.4: decide the effective model for dispatch. Returns the model to send
/// upstream; the caller is responsible for echoing the *original* client
/// model back in any response (the rewrite is transparent).
pub fn classify_effective_model(request: &MessagesRequest) -> String {
    let normalized = normalize_model_name(&request.model);

    if request.has_tools() || request.has_extended_thinking() {
        return normalized;
    }
    if !supports_downgrade(&normalized) {
        return normalized;
    }
    if matches_background_pattern(&request.classifier_text()) {
        return FREE_MODEL_FOR_BACKGROUND.to_string();
    }
    normalized
}
