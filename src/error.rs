//! Failure causes and their classification into user-facing errors.
//!
//! Everything that can go wrong during a chat request is a [`RelayFailure`].
//! [`classify`] maps each failure onto a closed set of [`ErrorKind`]s with a
//! fixed message and HTTP status. Raw upstream text stays in the log and never
//! reaches the response body.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

use crate::models::upstream::ErrorEnvelope;
use crate::models::ErrorBody;

pub const MSG_NO_MESSAGE: &str = "No message provided";
pub const MSG_INVALID_HISTORY: &str = "Invalid conversation history";
pub const MSG_INVALID_BODY: &str = "Invalid request body";
pub const MSG_CREDENTIAL_MISSING: &str =
    "OpenAI API key is not configured. Please set the OPENAI_API_KEY environment variable.";
pub const MSG_CREDENTIAL_INVALID: &str =
    "The OpenAI API key is invalid. Please check your API key at https://platform.openai.com/api-keys";
pub const MSG_QUOTA_EXCEEDED: &str = "The OpenAI API key has exceeded its quota. Please check your billing details at https://platform.openai.com/account/billing. You may need to wait a few minutes for billing changes to take effect.";
pub const MSG_UPSTREAM_UNAVAILABLE: &str =
    "The language model service is currently unavailable. Please try again later.";
pub const MSG_UNEXPECTED: &str = "An unexpected error occurred. Please try again.";

/// Failures raised by a [`crate::gateway::ModelGateway`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("upstream credential is not configured")]
    MissingCredential,

    #[error("upstream rejected the credential: {0}")]
    InvalidCredential(String),

    #[error("upstream quota exhausted: {0}")]
    QuotaExceeded(String),

    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("gateway internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Whether a caller-level policy may retry the (unary) call.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::Unavailable(format!("malformed upstream response: {err}"))
        } else if err.is_builder() {
            GatewayError::Internal(err.to_string())
        } else {
            GatewayError::Unavailable(err.to_string())
        }
    }
}

/// Every cause a chat request can fail with.
#[derive(Debug, Error)]
pub enum RelayFailure {
    #[error("message is empty or missing")]
    EmptyMessage,

    #[error("history entry {index} has unsupported role {role:?}")]
    InvalidHistory { index: usize, role: String },

    #[error("request body rejected: {0}")]
    MalformedBody(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("internal failure: {0}")]
    Internal(String),
}

/// Closed set of user-facing error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    CredentialMissing,
    CredentialInvalid,
    QuotaExceeded,
    UpstreamUnavailable,
    Unexpected,
}

/// A failure as presented to the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: &'static str,
    pub http_status: StatusCode,
}

impl ClassifiedError {
    fn new(kind: ErrorKind, message: &'static str) -> Self {
        let http_status = match kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            kind,
            message,
            http_status,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.message.to_string(),
            status: "error".to_string(),
        }
    }
}

impl ResponseError for ClassifiedError {
    fn status_code(&self) -> StatusCode {
        self.http_status
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.http_status).json(self.body())
    }
}

/// Map a failure to its user-facing classification. Total and deterministic.
pub fn classify(failure: &RelayFailure) -> ClassifiedError {
    match failure {
        RelayFailure::EmptyMessage => ClassifiedError::new(ErrorKind::Validation, MSG_NO_MESSAGE),
        RelayFailure::InvalidHistory { .. } => {
            ClassifiedError::new(ErrorKind::Validation, MSG_INVALID_HISTORY)
        }
        RelayFailure::MalformedBody(_) => {
            ClassifiedError::new(ErrorKind::Validation, MSG_INVALID_BODY)
        }
        RelayFailure::Gateway(err) => classify_gateway(err),
        RelayFailure::Internal(_) => ClassifiedError::new(ErrorKind::Unexpected, MSG_UNEXPECTED),
    }
}

fn classify_gateway(err: &GatewayError) -> ClassifiedError {
    match err {
        GatewayError::MissingCredential => {
            ClassifiedError::new(ErrorKind::CredentialMissing, MSG_CREDENTIAL_MISSING)
        }
        GatewayError::InvalidCredential(_) => {
            ClassifiedError::new(ErrorKind::CredentialInvalid, MSG_CREDENTIAL_INVALID)
        }
        GatewayError::QuotaExceeded(_) => {
            ClassifiedError::new(ErrorKind::QuotaExceeded, MSG_QUOTA_EXCEEDED)
        }
        GatewayError::Unavailable(_) => {
            ClassifiedError::new(ErrorKind::UpstreamUnavailable, MSG_UPSTREAM_UNAVAILABLE)
        }
        GatewayError::Internal(_) => ClassifiedError::new(ErrorKind::Unexpected, MSG_UNEXPECTED),
    }
}

impl From<RelayFailure> for ClassifiedError {
    fn from(failure: RelayFailure) -> Self {
        let classified = classify(&failure);
        match classified.kind {
            ErrorKind::Validation => tracing::debug!(error = %failure, "request rejected"),
            ErrorKind::Unexpected => tracing::error!(error = %failure, "unexpected relay failure"),
            _ => tracing::warn!(error = %failure, kind = ?classified.kind, "upstream call failed"),
        }
        classified
    }
}

/// Interpret an upstream error payload (HTTP error body or in-band SSE error
/// object) into a [`GatewayError`].
pub fn upstream_error(status: Option<u16>, body: &str) -> GatewayError {
    let api_error = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|env| env.error)
        .unwrap_or_default();
    let code = api_error.code.as_deref().unwrap_or("");
    let kind = api_error.kind.as_deref().unwrap_or("");
    let detail = if api_error.message.is_empty() {
        body.trim().to_string()
    } else {
        api_error.message.clone()
    };
    let lowered = detail.to_ascii_lowercase();

    if code == "insufficient_quota"
        || kind == "insufficient_quota"
        || lowered.contains("exceeded your current quota")
    {
        return GatewayError::QuotaExceeded(detail);
    }
    if status == Some(401) || code == "invalid_api_key" || lowered.contains("invalid api key") {
        return GatewayError::InvalidCredential(detail);
    }
    match status {
        Some(s) => GatewayError::Unavailable(format!("upstream returned {s}: {detail}")),
        None => GatewayError::Unavailable(format!("upstream stream error: {detail}")),
    }
}
