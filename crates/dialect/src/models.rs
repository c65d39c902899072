//! `GET /v1/models` static enumeration (§6).

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: &'static str,
    pub object: &'static str,
    pub owned_by: &'static str,
}

/// Static model list, including normalized aliases. Order is stable for
/// clients that display the first entry as a default.
pub fn list_models() -> Vec<ModelInfo> {
    [
        "claude-opus-4-5-thinking",
        "claude-sonnet-4-5-thinking",
        "claude-sonnet-4-5",
        crate::classifier::FREE_MODEL_FOR_BACKGROUND,
    ]
    .into_iter()
    .map(|id| ModelInfo {
        id,
        object: "model",
        owned_by: "anthropic",
    })
    .collect()
}
