#![forbid(unsafe_code)]
#![doc = r#"
Chat Relay

Accept a user message plus prior turns, prepend a fixed persona prompt, forward the
conversation to an OpenAI-compatible Chat Completions API, and return the reply either
as one JSON body or as a Server-Sent Events stream.

Crate highlights
- `conversation::assemble`: `[persona] ++ history ++ [user message]`, rejecting unknown roles.
- `gateway::ModelGateway`: unary and streaming upstream calls behind one trait; `OpenAiGateway`
  talks HTTP, `RetryingGateway` adds a caller-level retry for unary calls.
- `stream_encoder::encode`: one SSE frame per upstream chunk, terminal frame exactly once.
- `error::classify`: closed set of user-facing error kinds with fixed messages.
- `server::config_routes`: Actix-web routes for `POST /api/chat` and `GET /status`.

Modules
- `models`: Wire types for the relay API and the upstream Chat Completions API.
- `config`: Startup configuration (clap + environment).
- `util`: Shared helpers (tracing, HTTP client, CORS, application state).
"#]

pub mod config;
pub mod conversation;
pub mod error;
pub mod gateway;
pub mod models;
pub mod server;
pub mod stream_encoder;
pub mod util;

pub use crate::config::{ConfigError, RelayConfig};
pub use crate::conversation::{assemble, PERSONA_PROMPT};
pub use crate::error::{classify, ClassifiedError, ErrorKind, GatewayError, RelayFailure};
pub use crate::gateway::{
    ChunkStream, DeliveryMode, GatewayOutput, ModelGateway, ModelInvocation, OpenAiGateway,
    RetryingGateway, SamplingParams, StreamChunk, UpstreamSettings,
};
pub use crate::models::{ChatReply, ChatRequest, ChatTurn, HistoryEntry, Role, StreamEvent};
pub use crate::stream_encoder::{encode, SseEncoder, StreamAborted};
