//! Dialect Adapters (§4.5) — Chat-Completions ↔ Messages translation.

use crate::chat::{
    ChatCompletionsRequest, ChatCompletionsResponse, ChatChoice, ChatContent, ChatContentPart,
    ChatMessage, ChatResponseMessage, ChatUsage,
};
use crate::content::{ContentPart, MessageContent};
use crate::messages::{Message, MessagesRequest};

const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Chat-Completions request → internal Messages request.
pub fn chat_to_messages(request: ChatCompletionsRequest) -> MessagesRequest {
    let messages = request
        .messages
        .into_iter()
        .map(chat_message_to_message)
        .collect();

    MessagesRequest {
        model: request.model,
        messages,
        max_tokens: Some(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        stream: request.stream,
        system: None,
        tools: request.tools,
        tool_choice: request.tool_choice,
        thinking: None,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
    }
}

fn chat_message_to_message(message: ChatMessage) -> Message {
    // A `role: "tool"` message carries its result as the whole message body
    // rather than as a typed content part; normalize it to the same shape
    // either way.
    if message.role == "tool" {
        let tool_use_id = message.tool_call_id.clone().unwrap_or_else(|| "tool".to_string());
        let content = match message.content {
            Some(ChatContent::Text(t)) => serde_json::Value::String(t),
            Some(ChatContent::Parts(parts)) => serde_json::to_value(parts).unwrap_or_default(),
            None => serde_json::Value::Null,
        };
        return Message {
            role: "user".to_string(),
            content: MessageContent::Parts(vec![ContentPart::ToolResult {
                tool_use_id,
                content,
                is_error: false,
            }]),
        };
    }

    let content = match message.content {
        None => MessageContent::Text(String::new()),
        Some(ChatContent::Text(t)) => MessageContent::Text(t),
        Some(ChatContent::Parts(parts)) => {
            MessageContent::Parts(parts.into_iter().map(chat_part_to_content_part).collect())
        }
    };

    Message {
        role: message.role,
        content,
    }
}

fn chat_part_to_content_part(part: ChatContentPart) -> ContentPart {
    match part {
        ChatContentPart::Text { text } => ContentPart::Text { text },
        ChatContentPart::ImageUrl { image_url } => ContentPart::Text {
            text: format!("[image: {}]", image_url.url),
        },
        ChatContentPart::ToolResult {
            tool_call_id,
            id,
            content,
        } => ContentPart::ToolResult {
            tool_use_id: tool_call_id.or(id).unwrap_or_else(|| "tool".to_string()),
            content,
            is_error: false,
        },
    }
}

/// Messages-dialect upstream response → Chat-Completions response envelope.
///
/// `original_client_model` is the model the *client* requested, which is
/// echoed back even if the request was transparently downgraded (§4.4).
pub fn messages_response_to_chat(
    upstream: &serde_json::Value,
    original_client_model: &str,
    created: u64,
) -> ChatCompletionsResponse {
    let content = extract_text(upstream);
    let finish_reason = upstream
        .get("stop_reason")
        .or_else(|| upstream.get("stop"))
        .and_then(|v| v.as_str())
        .unwrap_or("stop")
        .to_string();

    let usage = upstream
        .get("usage")
        .and_then(|u| {
            Some(ChatUsage {
                prompt_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                completion_tokens: u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                total_tokens: u
                    .get("input_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0)
                    + u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            })
        })
        .unwrap_or_default();

    ChatCompletionsResponse {
        id: upstream
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4())),
        object: "chat.completion",
        created,
        model: original_client_model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatResponseMessage {
                role: "assistant",
                content,
            },
            finish_reason,
        }],
        usage,
    }
}

/// Extract textual content from any of: a `content` array of blocks, a flat
/// `output` string, or a nested `choices` array.
fn extract_text(upstream: &serde_json::Value) -> String {
    if let Some(blocks) = upstream.get("content").and_then(|c| c.as_array()) {
        return blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n");
    }

    if let Some(output) = upstream.get("output").and_then(|o| o.as_str()) {
        return output.to_string();
    }

    if let Some(choices) = upstream.get("choices").and_then(|c| c.as_array())
        && let Some(first) = choices.first()
    {
        if let Some(text) = first
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
        {
            return text.to_string();
        }
        if let Some(text) = first.get("text").and_then(|t| t.as_str()) {
            return text.to_string();
        }
    }

    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatMessage;

    #[test]
    fn plain_text_request_round_trips() {
        let chat_req = ChatCompletionsRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: Some(ChatContent::Text("hello there".to_string())),
                tool_call_id: None,
                name: None,
            }],
            max_tokens: None,
            stream: None,
            temperature: None,
            top_p: None,
            tools: None,
            tool_choice: None,
        };

        let internal = chat_to_messages(chat_req);
        assert_eq!(internal.max_tokens, Some(DEFAULT_MAX_TOKENS));
        assert_eq!(internal.messages[0].content.flatten_text(), "hello there");
    }

    #[test]
    fn image_part_becomes_text_placeholder() {
        let chat_req = ChatCompletionsRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: Some(ChatContent::Parts(vec![ChatContentPart::ImageUrl {
                    image_url: crate::chat::ImageUrlRef {
                        url: "http://example.com/a.png".to_string(),
                    },
                }])),
                tool_call_id: None,
                name: None,
            }],
            max_tokens: None,
            stream: None,
            temperature: None,
            top_p: None,
            tools: None,
            tool_choice: None,
        };

        let internal = chat_to_messages(chat_req);
        assert!(internal.messages[0]
            .content
            .flatten_text()
            .contains("http://example.com/a.png"));
    }

    #[test]
    fn tool_role_message_becomes_tool_result_content_part() {
        let chat_req = ChatCompletionsRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages: vec![ChatMessage {
                role: "tool".to_string(),
                content: Some(ChatContent::Text("42".to_string())),
                tool_call_id: Some("call_99".to_string()),
                name: None,
            }],
            max_tokens: None,
            stream: None,
            temperature: None,
            top_p: None,
            tools: None,
            tool_choice: None,
        };

        let internal = chat_to_messages(chat_req);
        match &internal.messages[0].content {
            MessageContent::Parts(parts) => match &parts[0] {
                ContentPart::ToolResult { tool_use_id, .. } => {
                    assert_eq!(tool_use_id, "call_99")
                }
                other => panic!("expected ToolResult, got {other:?}"),
            },
            other => panic!("expected Parts, got {other:?}"),
        }
    }

    #[test]
    fn response_extracts_text_from_content_blocks() {
        let upstream = serde_json::json!({
            "id": "msg_123",
            "content": [{"type": "text", "text": "hi"}, {"type": "text", "text": "there"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        });
        let response = messages_response_to_chat(&upstream, "gpt-4-client-alias", 1000);
        assert_eq!(response.choices[0].message.content, "hi\nthere");
        assert_eq!(response.model, "gpt-4-client-alias");
        assert_eq!(response.choices[0].finish_reason, "end_turn");
        assert_eq!(response.usage.total_tokens, 15);
    }

    #[test]
    fn response_falls_back_to_output_string() {
        let upstream = serde_json::json!({"output": "plain text reply"});
        let response = messages_response_to_chat(&upstream, "m", 1000);
        assert_eq!(response.choices[0].message.content, "plain text reply");
        assert_eq!(response.choices[0].finish_reason, "stop");
    }

    #[test]
    fn response_falls_back_to_nested_choices() {
        let upstream = serde_json::json!({
            "choices": [{"message": {"content": "nested reply"}}]
        });
        let response = messages_response_to_chat(&upstream, "m", 1000);
        assert_eq!(response.choices[0].message.content, "nested reply");
    }
}
