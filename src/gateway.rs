//! Upstream model gateway.
//!
//! [`ModelGateway`] is the seam between request orchestration and the
//! upstream Chat Completions service. A gateway makes exactly one upstream
//! attempt per call; retries live in [`RetryingGateway`], which wraps another
//! gateway and only ever retries unary calls.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};

use crate::error::{upstream_error, GatewayError};
use crate::models::upstream::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
use crate::models::ChatTurn;

/// How the reply is delivered to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DeliveryMode {
    Unary,
    Streaming,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Unary => "unary",
            DeliveryMode::Streaming => "streaming",
        }
    }
}

/// Sampling parameters forwarded to the upstream as-is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_output_tokens: 300,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        }
    }
}

/// Everything one upstream call needs. Built per request and not shared.
#[derive(Debug, Clone)]
pub struct ModelInvocation {
    pub turns: Vec<ChatTurn>,
    pub params: SamplingParams,
    pub mode: DeliveryMode,
}

/// One increment of a streamed reply.
///
/// Non-final chunks carry a delta. The final chunk has `done = true`, an
/// empty delta, and `aggregate` set to every prior delta concatenated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub delta: String,
    pub done: bool,
    pub aggregate: Option<String>,
}

impl StreamChunk {
    pub fn delta(delta: impl Into<String>) -> Self {
        Self {
            delta: delta.into(),
            done: false,
            aggregate: None,
        }
    }

    pub fn finished(aggregate: impl Into<String>) -> Self {
        Self {
            delta: String::new(),
            done: true,
            aggregate: Some(aggregate.into()),
        }
    }
}

/// Lazy, finite, single-use sequence of chunks. Dropping it releases the
/// upstream connection.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, GatewayError>> + Send>>;

/// Result of [`ModelGateway::invoke`].
pub enum GatewayOutput {
    Complete(String),
    Stream(ChunkStream),
}

impl std::fmt::Debug for GatewayOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayOutput::Complete(text) => f.debug_tuple("Complete").field(text).finish(),
            GatewayOutput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Fails with [`GatewayError::MissingCredential`] when no upstream call
    /// could succeed for lack of a credential.
    fn ensure_credential(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    /// Unary call: the complete reply text.
    async fn complete(&self, invocation: &ModelInvocation) -> Result<String, GatewayError>;

    /// Streaming call: a handle over the incremental reply.
    async fn stream(&self, invocation: &ModelInvocation) -> Result<ChunkStream, GatewayError>;

    /// Dispatch on `invocation.mode`.
    async fn invoke(&self, invocation: &ModelInvocation) -> Result<GatewayOutput, GatewayError> {
        match invocation.mode {
            DeliveryMode::Unary => self.complete(invocation).await.map(GatewayOutput::Complete),
            DeliveryMode::Streaming => self.stream(invocation).await.map(GatewayOutput::Stream),
        }
    }
}

/// Connection settings for [`OpenAiGateway`].
#[derive(Clone)]
pub struct UpstreamSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Total deadline for unary calls. Streams are not bounded by it.
    pub request_timeout: Option<Duration>,
}

impl std::fmt::Debug for UpstreamSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Gateway for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAiGateway {
    http: reqwest::Client,
    settings: UpstreamSettings,
}

impl OpenAiGateway {
    pub fn new(http: reqwest::Client, settings: UpstreamSettings) -> Self {
        Self { http, settings }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    fn api_key(&self) -> Result<&str, GatewayError> {
        self.settings
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(GatewayError::MissingCredential)
    }

    fn request_body<'a>(
        &'a self,
        invocation: &'a ModelInvocation,
        stream: bool,
    ) -> ChatCompletionRequest<'a> {
        let params = &invocation.params;
        ChatCompletionRequest {
            model: &self.settings.model,
            messages: &invocation.turns,
            temperature: params.temperature,
            max_tokens: params.max_output_tokens,
            presence_penalty: (params.presence_penalty != 0.0).then_some(params.presence_penalty),
            frequency_penalty: (params.frequency_penalty != 0.0)
                .then_some(params.frequency_penalty),
            stream,
        }
    }
}

#[async_trait]
impl ModelGateway for OpenAiGateway {
    fn ensure_credential(&self) -> Result<(), GatewayError> {
        self.api_key().map(|_| ())
    }

    async fn complete(&self, invocation: &ModelInvocation) -> Result<String, GatewayError> {
        let api_key = self.api_key()?;
        let mut rb = self
            .http
            .post(self.endpoint())
            .header(CONTENT_TYPE, "application/json")
            .bearer_auth(api_key)
            .json(&self.request_body(invocation, false));
        if let Some(timeout) = self.settings.request_timeout {
            rb = rb.timeout(timeout);
        }

        let resp = rb.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(upstream_error(Some(status.as_u16()), &text));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&text)
            .map_err(|e| GatewayError::Unavailable(format!("malformed upstream response: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                GatewayError::Unavailable("upstream response carried no message content".into())
            })
    }

    async fn stream(&self, invocation: &ModelInvocation) -> Result<ChunkStream, GatewayError> {
        let api_key = self.api_key()?;
        let resp = self
            .http
            .post(self.endpoint())
            .header(ACCEPT, "text/event-stream")
            .header(CONTENT_TYPE, "application/json")
            .bearer_auth(api_key)
            .json(&self.request_body(invocation, true))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(upstream_error(Some(status.as_u16()), &text));
        }

        Ok(Box::pin(chunks_from_sse(resp.bytes_stream())))
    }
}

/// Turn an upstream SSE byte stream into [`StreamChunk`]s.
fn chunks_from_sse<S, B, E>(bytes: S) -> impl Stream<Item = Result<StreamChunk, GatewayError>>
where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: Into<GatewayError> + Send,
{
    async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut decoder = SseDecoder::default();
        let mut aggregate = String::new();
        let mut finished = false;
        let mut ended = false;

        loop {
            while let Some(data) = decoder.next_data() {
                match interpret_data(&data) {
                    StreamData::Done => {
                        yield Ok(StreamChunk::finished(std::mem::take(&mut aggregate)));
                        return;
                    }
                    StreamData::Chunk { delta, finish } => {
                        if let Some(delta) = delta.filter(|d| !d.is_empty()) {
                            aggregate.push_str(&delta);
                            yield Ok(StreamChunk::delta(delta));
                        }
                        finished |= finish;
                    }
                    StreamData::Failed(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }

            if ended {
                // Some compatible servers stop after finish_reason without [DONE].
                if finished {
                    yield Ok(StreamChunk::finished(std::mem::take(&mut aggregate)));
                } else {
                    yield Err(GatewayError::Unavailable(
                        "upstream stream closed before completion".into(),
                    ));
                }
                return;
            }

            match bytes.next().await {
                Some(Ok(chunk)) => decoder.push(chunk.as_ref()),
                Some(Err(err)) => {
                    yield Err(err.into());
                    return;
                }
                None => {
                    decoder.finish();
                    ended = true;
                }
            }
        }
    }
}

enum StreamData {
    Done,
    Chunk { delta: Option<String>, finish: bool },
    Failed(GatewayError),
}

fn interpret_data(payload: &str) -> StreamData {
    if payload.trim() == "[DONE]" {
        return StreamData::Done;
    }
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => {
            return StreamData::Failed(GatewayError::Unavailable(format!(
                "malformed upstream chunk: {e}"
            )))
        }
    };
    if value.get("error").is_some() {
        return StreamData::Failed(upstream_error(None, payload));
    }
    match serde_json::from_value::<ChatCompletionChunk>(value) {
        Ok(chunk) => match chunk.choices.into_iter().next() {
            Some(choice) => StreamData::Chunk {
                delta: choice.delta.content,
                finish: choice.finish_reason.is_some(),
            },
            None => StreamData::Chunk {
                delta: None,
                finish: false,
            },
        },
        Err(e) => StreamData::Failed(GatewayError::Unavailable(format!(
            "malformed upstream chunk: {e}"
        ))),
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|idx| idx + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

/// Incremental SSE frame decoder: bytes in, `data:` payloads out.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) {
        self.buffer
            .extend(bytes.iter().copied().filter(|b| *b != b'\r'));
    }

    /// Terminate a trailing event that lacks its blank line.
    fn finish(&mut self) {
        if !trim_ascii(&self.buffer).is_empty() {
            self.buffer.extend_from_slice(b"\n\n");
        } else {
            self.buffer.clear();
        }
    }

    /// Next complete event's data, skipping comment-only and empty events.
    fn next_data(&mut self) -> Option<String> {
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let event: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            let data_segments: Vec<&[u8]> = event[..pos]
                .split(|&b| b == b'\n')
                .filter_map(|line| line.strip_prefix(b"data:"))
                .map(trim_ascii)
                .filter(|payload| !payload.is_empty())
                .collect();
            if data_segments.is_empty() {
                continue;
            }
            let data = data_segments.join(&b'\n');
            return Some(String::from_utf8_lossy(&data).into_owned());
        }
        None
    }
}

const RETRY_DELAYS_MS: [u64; 3] = [100, 200, 400];

/// Caller-level retry policy around another gateway.
///
/// Only unary calls failing with a transient error are retried. Streams are
/// passed through untouched: a client may already hold partial content.
pub struct RetryingGateway<G> {
    inner: G,
    retries: u32,
}

impl<G: ModelGateway> RetryingGateway<G> {
    pub fn new(inner: G, retries: u32) -> Self {
        Self { inner, retries }
    }
}

#[async_trait]
impl<G: ModelGateway> ModelGateway for RetryingGateway<G> {
    fn ensure_credential(&self) -> Result<(), GatewayError> {
        self.inner.ensure_credential()
    }

    async fn complete(&self, invocation: &ModelInvocation) -> Result<String, GatewayError> {
        let mut attempt: u32 = 0;
        loop {
            match self.inner.complete(invocation).await {
                Err(err) if err.is_transient() && attempt < self.retries => {
                    let idx = (attempt as usize).min(RETRY_DELAYS_MS.len() - 1);
                    let delay_ms = RETRY_DELAYS_MS[idx];
                    tracing::warn!(
                        error = %err,
                        attempt,
                        delay_ms,
                        "unary upstream call failed; retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn stream(&self, invocation: &ModelInvocation) -> Result<ChunkStream, GatewayError> {
        self.inner.stream(invocation).await
    }
}
