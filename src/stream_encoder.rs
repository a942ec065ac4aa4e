//! SSE framing of streamed replies.
//!
//! [`SseEncoder`] maps each [`StreamChunk`] to exactly one `data: <json>\n\n`
//! frame as soon as it arrives. The terminal frame is emitted exactly once.
//! When the upstream fails or ends early, the encoder first emits a terminal
//! frame carrying what was aggregated so far. It then yields an error, so the
//! transport closes the connection instead of reporting success.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use thiserror::Error;

use crate::error::{ClassifiedError, GatewayError, RelayFailure};
use crate::gateway::StreamChunk;
use crate::models::StreamEvent;

/// Out-of-band failure surfaced to the transport after the terminal frame.
#[derive(Debug, Error)]
pub enum StreamAborted {
    #[error("upstream stream failed: {0}")]
    Upstream(ClassifiedError),

    #[error("failed to encode stream event: {0}")]
    Encode(#[from] serde_json::Error),
}

enum EncoderState {
    Streaming,
    Aborting(GatewayError),
    Finished,
}

pub struct SseEncoder<S> {
    inner: S,
    aggregate: String,
    state: EncoderState,
    span: tracing::Span,
}

/// Wrap a chunk stream into an SSE byte stream.
pub fn encode<S>(chunks: S) -> SseEncoder<S>
where
    S: Stream<Item = Result<StreamChunk, GatewayError>> + Unpin,
{
    SseEncoder {
        inner: chunks,
        aggregate: String::new(),
        state: EncoderState::Streaming,
        span: tracing::Span::none(),
    }
}

impl<S> SseEncoder<S> {
    /// Log encoder events (aborts, disconnects) under `span`.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }
}

fn frame(event: &StreamEvent) -> Result<Bytes, StreamAborted> {
    let json = serde_json::to_vec(event)?;
    let mut out = Vec::with_capacity(json.len() + 8);
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(&json);
    out.extend_from_slice(b"\n\n");
    Ok(Bytes::from(out))
}

fn terminal(full_message: String) -> Poll<Option<Result<Bytes, StreamAborted>>> {
    Poll::Ready(Some(frame(&StreamEvent::terminal(full_message))))
}

impl<S> Stream for SseEncoder<S>
where
    S: Stream<Item = Result<StreamChunk, GatewayError>> + Unpin,
{
    type Item = Result<Bytes, StreamAborted>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let _entered = this.span.enter();

        match std::mem::replace(&mut this.state, EncoderState::Finished) {
            EncoderState::Finished => return Poll::Ready(None),
            EncoderState::Aborting(err) => {
                let classified = ClassifiedError::from(RelayFailure::Gateway(err));
                return Poll::Ready(Some(Err(StreamAborted::Upstream(classified))));
            }
            EncoderState::Streaming => this.state = EncoderState::Streaming,
        }

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) if chunk.done => {
                this.state = EncoderState::Finished;
                let local = std::mem::take(&mut this.aggregate);
                terminal(chunk.aggregate.unwrap_or(local))
            }
            Poll::Ready(Some(Ok(chunk))) => {
                this.aggregate.push_str(&chunk.delta);
                Poll::Ready(Some(frame(&StreamEvent::delta(chunk.delta))))
            }
            Poll::Ready(Some(Err(err))) => {
                this.state = EncoderState::Aborting(err);
                let partial = std::mem::take(&mut this.aggregate);
                terminal(partial)
            }
            Poll::Ready(None) => {
                this.state = EncoderState::Aborting(GatewayError::Unavailable(
                    "upstream stream ended without a terminal chunk".into(),
                ));
                let partial = std::mem::take(&mut this.aggregate);
                terminal(partial)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for SseEncoder<S> {
    fn drop(&mut self) {
        if matches!(self.state, EncoderState::Streaming) {
            let _entered = self.span.enter();
            tracing::debug!(
                delivered_bytes = self.aggregate.len(),
                "client disconnected mid-stream; releasing upstream stream"
            );
        }
    }
}
