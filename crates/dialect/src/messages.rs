//! Messages dialect (§6) — the internal shape the pipeline operates on.

use serde::{Deserialize, Serialize};

use crate::content::MessageContent;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

/// `POST /v1/messages` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
}

impl MessagesRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub fn has_tools(&self) -> bool {
        self.tools.as_ref().is_some_and(|t| !t.is_empty())
    }

    pub fn has_extended_thinking(&self) -> bool {
        self.thinking.is_some()
    }

    /// §4.6 step 3: `messages` must be a non-empty ordered sequence.
    pub fn validate(&self) -> Result<(), String> {
        if self.messages.is_empty() {
            return Err("messages must be a non-empty array".to_string());
        }
        Ok(())
    }

    /// Flattened text from the system prompt plus the first three messages,
    /// lowercased, for classifier inspection (§4.4).
    pub fn classifier_text(&self) -> String {
        let mut parts = Vec::new();
        if let Some(system) = &self.system {
            if let Some(s) = system.as_str() {
                parts.push(s.to_lowercase());
            } else if let Some(arr) = system.as_array() {
                for block in arr {
                    if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                        parts.push(t.to_lowercase());
                    }
                }
            }
        }
        for message in self.messages.iter().take(3) {
            parts.push(message.content.flatten_text().to_lowercase());
        }
        parts.join(" ")
    }
}
