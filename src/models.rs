//! Request/response models for the relay's HTTP surface and the upstream
//! Chat Completions API.
//!
//! `ChatTurn` is the typed, validated form of a conversation turn; the
//! inbound `HistoryEntry` keeps the role as a raw string so that an unknown
//! role reaches the assembler and is rejected there with a relay error
//! rather than a deserializer error.

use serde::{Deserialize, Serialize};

/// Conversation role of a turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One role-tagged message in the conversation sent upstream.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChatTurn {
    role: Role,
    content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

/// A prior turn as supplied by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
}

impl HistoryEntry {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Delivery-mode override; falls back to the configured default when absent.
    #[serde(default)]
    pub stream: Option<bool>,
}

/// Unary success body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatReply {
    pub message: String,
    pub status: String,
}

impl ChatReply {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: "success".to_string(),
        }
    }
}

/// Error body shared by every failure response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub status: String,
}

/// One SSE `data:` payload emitted to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamEvent {
    pub content: String,
    pub done: bool,
    #[serde(rename = "fullMessage", skip_serializing_if = "Option::is_none")]
    pub full_message: Option<String>,
}

impl StreamEvent {
    pub fn delta(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            done: false,
            full_message: None,
        }
    }

    pub fn terminal(full_message: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            done: true,
            full_message: Some(full_message.into()),
        }
    }
}

/// Minimal Chat Completions wire types, limited to the fields the relay reads or writes.
pub mod upstream {
    use super::ChatTurn;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize)]
    pub struct ChatCompletionRequest<'a> {
        pub model: &'a str,
        pub messages: &'a [ChatTurn],
        pub temperature: f32,
        pub max_tokens: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub presence_penalty: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub frequency_penalty: Option<f32>,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        pub stream: bool,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct ChatCompletionResponse {
        #[serde(default)]
        pub choices: Vec<Choice>,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct Choice {
        pub message: ResponseMessage,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct ResponseMessage {
        #[serde(default)]
        pub content: Option<String>,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct ChatCompletionChunk {
        #[serde(default)]
        pub choices: Vec<ChunkChoice>,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct ChunkChoice {
        #[serde(default)]
        pub delta: ChunkDelta,
        #[serde(default)]
        pub finish_reason: Option<String>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct ChunkDelta {
        #[serde(default)]
        pub content: Option<String>,
    }

    /// `{"error": {...}}` envelope returned on failures, either as an HTTP
    /// body or in-band inside an SSE stream.
    #[derive(Debug, Clone, Deserialize)]
    pub struct ErrorEnvelope {
        pub error: ApiError,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct ApiError {
        #[serde(default)]
        pub message: String,
        #[serde(default, rename = "type")]
        pub kind: Option<String>,
        #[serde(default)]
        pub code: Option<String>,
    }
}
