//! Dialect Adapters (§4.5) — wire types and translation for the Messages
//! and Chat-Completions dialects, plus the request classifier and SSE
//! streaming relay helpers that sit next to them in the request pipeline.

pub mod adapter;
pub mod chat;
pub mod classifier;
pub mod content;
pub mod messages;
pub mod models;
pub mod sse;

pub use adapter::{chat_to_messages, messages_response_to_chat};
pub use chat::{ChatCompletionsRequest, ChatCompletionsResponse};
pub use classifier::{classify_effective_model, normalize_model_name, FREE_MODEL_FOR_BACKGROUND};
pub use content::{ContentPart, MessageContent};
pub use messages::{Message, MessagesRequest};
pub use models::{list_models, ModelInfo};
