//! Process configuration, parsed once at startup from flags and environment.

use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::gateway::{DeliveryMode, SamplingParams, UpstreamSettings};

/// Model used when `OPENAI_MODEL` is not set.
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("temperature must be within 0.0..=2.0, got {0}")]
    Temperature(f32),

    #[error("max output tokens must be greater than zero")]
    MaxOutputTokens,

    #[error("{name} must be within -2.0..=2.0, got {value}")]
    Penalty { name: &'static str, value: f32 },

    #[error("upstream base URL must start with http:// or https://, got {0:?}")]
    BaseUrl(String),

    #[error("{0} must be greater than zero")]
    Timeout(&'static str),
}

/// Relay configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "chat-relay", version, about = "Persona chat relay for OpenAI-compatible APIs")]
pub struct RelayConfig {
    /// Upstream API key. Requests fail with a configuration error when absent.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Upstream base URL; requests go to `{base}/chat/completions`.
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub base_url: String,

    #[arg(long, env = "OPENAI_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    #[arg(long, env = "RELAY_TEMPERATURE", default_value_t = 0.7)]
    pub temperature: f32,

    #[arg(long, env = "RELAY_MAX_OUTPUT_TOKENS", default_value_t = 300)]
    pub max_output_tokens: u32,

    #[arg(
        long,
        env = "RELAY_PRESENCE_PENALTY",
        default_value_t = 0.0,
        allow_negative_numbers = true
    )]
    pub presence_penalty: f32,

    #[arg(
        long,
        env = "RELAY_FREQUENCY_PENALTY",
        default_value_t = 0.0,
        allow_negative_numbers = true
    )]
    pub frequency_penalty: f32,

    /// Delivery mode for requests that do not set `stream`.
    #[arg(long, env = "RELAY_DELIVERY_MODE", value_enum, default_value_t = DeliveryMode::Unary)]
    pub delivery_mode: DeliveryMode,

    /// Retries for unary calls that fail with a transient upstream error.
    #[arg(long, env = "RELAY_UNARY_RETRIES", default_value_t = 0)]
    pub unary_retries: u32,

    /// Total deadline in seconds for unary upstream calls.
    #[arg(long, env = "RELAY_HTTP_TIMEOUT_SECONDS", default_value_t = 600)]
    pub http_timeout_seconds: u64,

    /// Longest silence in seconds tolerated on an upstream connection, for
    /// both unary and streaming calls.
    #[arg(long, env = "RELAY_READ_TIMEOUT_SECONDS", default_value_t = 120)]
    pub read_timeout_seconds: u64,

    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:5000")]
    pub bind_addr: String,
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Temperature(self.temperature));
        }
        if self.max_output_tokens == 0 {
            return Err(ConfigError::MaxOutputTokens);
        }
        for (name, value) in [
            ("presence penalty", self.presence_penalty),
            ("frequency penalty", self.frequency_penalty),
        ] {
            if !(-2.0..=2.0).contains(&value) {
                return Err(ConfigError::Penalty { name, value });
            }
        }
        let base = self.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ConfigError::BaseUrl(self.base_url.clone()));
        }
        if self.http_timeout_seconds == 0 {
            return Err(ConfigError::Timeout("http timeout"));
        }
        if self.read_timeout_seconds == 0 {
            return Err(ConfigError::Timeout("read timeout"));
        }
        Ok(())
    }

    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
            presence_penalty: self.presence_penalty,
            frequency_penalty: self.frequency_penalty,
        }
    }

    pub fn upstream(&self) -> UpstreamSettings {
        UpstreamSettings {
            base_url: self.base_url.trim().to_string(),
            api_key: self
                .api_key
                .as_deref()
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string),
            model: self.model.clone(),
            request_timeout: Some(Duration::from_secs(self.http_timeout_seconds)),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds)
    }

    /// Masked form of the API key for startup logs.
    pub fn api_key_hint(&self) -> Option<String> {
        let key = self.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty())?;
        let chars: Vec<char> = key.chars().collect();
        if chars.len() <= 8 {
            return Some("****".to_string());
        }
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        Some(format!("{head}...{tail}"))
    }
}
