//! Model interaction: the [`ExtractionModel`] seam and its edgequake-llm
//! implementation.
//!
//! The pipeline speaks a function-call protocol: each request names exactly
//! one function and its JSON-Schema parameters, and each reply is expected to
//! carry `{name, arguments}`. [`LlmExtractionModel`] maps that protocol onto
//! a plain chat completion: the function is described in the system prompt
//! and the reply content is searched for the call object. Replies in the
//! OpenAI `function_call` / `tool_calls` shapes are recognised as well, so
//! providers that echo their native format still parse.
//!
//! Retry, timeout and parsing policy live in [`crate::pipeline::extract`];
//! this module only performs one call.

use crate::config::ExtractionConfig;
use crate::error::PipelineError;
use crate::prompts::{function_call_instruction, SchemaKind, IMAGE_TRANSCRIPTION_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// One structured-extraction request.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub schema: SchemaKind,
    pub system_prompt: String,
    pub prompt_text: String,
}

impl ExtractionRequest {
    pub fn schema_name(&self) -> &'static str {
        self.schema.function_name()
    }

    /// JSON Schema of the function arguments.
    pub fn schema_arguments(&self) -> Value {
        self.schema.parameters()
    }
}

/// A function call found in a model reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Arguments as a JSON document.
    pub arguments_json: String,
}

/// What a model call returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelResponse {
    /// `None` when the reply carried no recognisable call.
    pub function_call: Option<FunctionCall>,
    pub raw_content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// A failed model call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    /// Authentication/authorisation rejected; retrying will not help.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Any other API or transport failure.
    #[error("{0}")]
    Api(String),
}

impl ModelError {
    /// Classify a provider error message.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("401")
            || lower.contains("403")
            || lower.contains("unauthorized")
            || lower.contains("invalid api key")
            || lower.contains("invalid_api_key")
        {
            ModelError::Auth(message)
        } else {
            ModelError::Api(message)
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, ModelError::Auth(_))
    }
}

/// Performs one extraction call.
///
/// Implementations must be `Send + Sync`: chunk calls of one document run
/// concurrently against the same model.
#[async_trait]
pub trait ExtractionModel: Send + Sync {
    async fn call(&self, request: &ExtractionRequest) -> Result<ModelResponse, ModelError>;
}

/// [`ExtractionModel`] backed by an edgequake-llm chat provider.
pub struct LlmExtractionModel {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
}

impl LlmExtractionModel {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &ExtractionConfig) -> Self {
        Self {
            provider,
            options: build_options(config),
        }
    }

    /// Resolve the provider from `config` and wrap it.
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, PipelineError> {
        Ok(Self::new(resolve_provider(config)?, config))
    }
}

#[async_trait]
impl ExtractionModel for LlmExtractionModel {
    async fn call(&self, request: &ExtractionRequest) -> Result<ModelResponse, ModelError> {
        let system = format!(
            "{}\n\n{}",
            request.system_prompt,
            function_call_instruction(request.schema)
        );
        let messages = vec![
            ChatMessage::system(system),
            ChatMessage::user(request.prompt_text.clone()),
        ];

        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| ModelError::from_message(e.to_string()))?;

        debug!(
            "{}: {} prompt tokens, {} completion tokens",
            request.schema_name(),
            response.prompt_tokens,
            response.completion_tokens
        );

        Ok(ModelResponse {
            function_call: parse_function_call(&response.content),
            raw_content: response.content,
            prompt_tokens: response.prompt_tokens as u64,
            completion_tokens: response.completion_tokens as u64,
        })
    }
}

/// Build `CompletionOptions` from the extraction config.
fn build_options(config: &ExtractionConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

/// Longest sleep between two model calls.
pub const MAX_RETRY_BACKOFF_MS: u64 = 60_000;

/// Sleep before retry number `retry` (1-based): `base · 2^(retry−1)`,
/// saturating and capped at [`MAX_RETRY_BACKOFF_MS`].
pub fn retry_backoff(base_ms: u64, retry: u32) -> Duration {
    let exp = retry.saturating_sub(1).min(32);
    let ms = base_ms.saturating_mul(1u64 << exp);
    Duration::from_millis(ms.min(MAX_RETRY_BACKOFF_MS))
}

// ── Reply parsing ────────────────────────────────────────────────────────

static RE_JSON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*\n?(.*?)\n?```").unwrap());

/// Find the function call in a reply.
///
/// Accepts, in order: a fenced JSON block, or the outermost `{…}` of the
/// content. Within the JSON, recognises `{"name", "arguments"}`,
/// `{"function_call": {…}}`, `{"tool_calls": [{"function": {…}}]}` and
/// `{"function": "...", "arguments"}`. `arguments` may be an object or a
/// JSON-encoded string.
pub fn parse_function_call(content: &str) -> Option<FunctionCall> {
    let candidate = match RE_JSON_FENCE.captures(content) {
        Some(caps) => caps[1].trim().to_string(),
        None => {
            let start = content.find('{')?;
            let end = content.rfind('}')?;
            if end <= start {
                return None;
            }
            content[start..=end].to_string()
        }
    };
    let value: Value = serde_json::from_str(&candidate).ok()?;
    function_call_from_value(&value)
}

fn function_call_from_value(value: &Value) -> Option<FunctionCall> {
    let obj = value.as_object()?;

    if let Some(inner) = obj.get("function_call") {
        return function_call_from_value(inner);
    }
    if let Some(first) = obj.get("tool_calls").and_then(|t| t.as_array()).and_then(|a| a.first()) {
        return first
            .get("function")
            .and_then(function_call_from_value)
            .or_else(|| function_call_from_value(first));
    }

    let name = ["name", "functionName", "function_name", "function"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(|v| v.as_str()))?
        .trim()
        .to_string();
    if name.is_empty() {
        return None;
    }

    let arguments_json = match obj.get("arguments").or_else(|| obj.get("parameters")) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => return None,
    };

    Some(FunctionCall {
        name,
        arguments_json,
    })
}

// ── Provider resolution ──────────────────────────────────────────────────

/// Instantiate a named provider with the given model.
fn create_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PipelineError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider + model** (`config.provider_name`), usually from the
///    merchant's AI settings.
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 4. **OpenAI** when `OPENAI_API_KEY` is set.
/// 5. **Full auto-detection** (`ProviderFactory::from_env`).
pub fn resolve_provider(config: &ExtractionConfig) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or("gpt-4.1-mini");
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or("gpt-4.1-mini");
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| PipelineError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

// ── Image transcription ──────────────────────────────────────────────────

/// Transcribe an uploaded image to plain text with the vision model.
///
/// Retries transient failures with the same backoff as extraction calls.
pub async fn transcribe_image(
    provider: &Arc<dyn LLMProvider>,
    image: ImageData,
    config: &ExtractionConfig,
) -> Result<String, PipelineError> {
    let messages = vec![
        ChatMessage::system(IMAGE_TRANSCRIPTION_PROMPT),
        ChatMessage::user_with_images("", vec![image]),
    ];
    let options = build_options(config);
    let call_timeout = Duration::from_secs(config.api_timeout_secs);
    let mut last_err = String::from("Unknown error");

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let backoff = retry_backoff(config.retry_backoff_ms, attempt);
            warn!(
                "Image transcription: retry {}/{} after {:?}",
                attempt, config.max_retries, backoff
            );
            sleep(backoff).await;
        }

        match timeout(call_timeout, provider.chat(&messages, Some(&options))).await {
            Ok(Ok(response)) => return Ok(response.content),
            Ok(Err(e)) => {
                let err = ModelError::from_message(e.to_string());
                warn!("Image transcription: attempt {} failed: {}", attempt + 1, err);
                last_err = err.to_string();
                if err.is_permanent() {
                    break;
                }
            }
            Err(_) => {
                warn!(
                    "Image transcription: attempt {} timed out after {}s",
                    attempt + 1,
                    config.api_timeout_secs
                );
                last_err = format!("timed out after {}s", config.api_timeout_secs);
            }
        }
    }

    Err(PipelineError::ExtractionUnavailable {
        total: 1,
        first_error: last_err,
    })
}
