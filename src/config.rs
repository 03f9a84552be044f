//! Configuration types for purchase-order extraction.
//!
//! All pipeline behaviour is controlled through [`ExtractionConfig`], built
//! via its [`ExtractionConfigBuilder`]. Per-merchant [`AiSettings`] loaded by
//! the workflow are overlaid with [`ExtractionConfig::with_settings`], so one
//! process-wide base config serves every merchant.

use crate::error::PipelineError;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Configuration for one document parse.
///
/// # Example
/// ```rust
/// use po_extract::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .max_chunk_chars(8_000)
///     .overlap_chars(300)
///     .concurrency(4)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// assert_eq!(config.chunking.max_chunk_chars, 8_000);
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Chunk planning parameters.
    pub chunking: ChunkConfig,

    /// Text preprocessing switches.
    pub preprocess: PreprocessOptions,

    /// Number of concurrent extraction calls within one document. Default: 3.
    ///
    /// Chunks of one document are independent, so they fan out; keep this low
    /// enough that several documents processed by one worker do not trip the
    /// provider's rate limit together.
    pub concurrency: usize,

    /// LLM model identifier, e.g. "gpt-4.1-mini". If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the model may generate per call. Default: 4096.
    ///
    /// A chunk with 80 line items serialises to roughly 3 000 tokens of JSON;
    /// lower values truncate the arguments payload and the call degrades to
    /// a malformed, zero-confidence result.
    pub max_tokens: usize,

    /// Retries on a failed model call. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-call timeout in seconds. Default: 90.
    pub api_timeout_secs: u64,

    /// Budget for one whole `parse_document` call in seconds. Default: 600.
    pub parse_timeout_secs: u64,

    /// Download timeout for document fetches in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Results below this overall confidence are flagged `needs_review`.
    /// Default: 0.7.
    pub review_threshold: f64,

    /// Custom system prompt. If None, uses the built-in prompt.
    pub system_prompt: Option<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkConfig::default(),
            preprocess: PreprocessOptions::default(),
            concurrency: 3,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 4096,
            max_retries: 3,
            retry_backoff_ms: 500,
            api_timeout_secs: 90,
            parse_timeout_secs: 600,
            download_timeout_secs: 120,
            review_threshold: 0.7,
            system_prompt: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("chunking", &self.chunking)
            .field("preprocess", &self.preprocess)
            .field("concurrency", &self.concurrency)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("parse_timeout_secs", &self.parse_timeout_secs)
            .field("review_threshold", &self.review_threshold)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Overlay per-merchant settings onto this base configuration.
    ///
    /// Only fields the merchant actually set are applied. A chunk-size
    /// override is raised to `min_chunk_chars` if it would otherwise make the
    /// chunk window invalid.
    pub fn with_settings(&self, settings: &AiSettings) -> ExtractionConfig {
        let mut config = self.clone();
        if let Some(ref provider) = settings.provider {
            // A named provider replaces any pre-built one.
            config.provider = None;
            config.provider_name = Some(provider.clone());
        }
        if let Some(ref model) = settings.model {
            config.model = Some(model.clone());
        }
        if let Some(threshold) = settings.confidence_threshold {
            config.review_threshold = threshold.clamp(0.0, 1.0);
        }
        if let Some(enabled) = settings.enable_anchor_extraction {
            config.preprocess.anchor_extraction = enabled;
        }
        if let Some(max) = settings.max_chunk_chars {
            config.chunking.max_chunk_chars = max.max(config.chunking.min_chunk_chars);
        }
        if let Some(ref prompt) = settings.system_prompt {
            config.system_prompt = Some(prompt.clone());
        }
        config
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn chunking(mut self, chunking: ChunkConfig) -> Self {
        self.config.chunking = chunking;
        self
    }

    pub fn max_chunk_chars(mut self, n: usize) -> Self {
        self.config.chunking.max_chunk_chars = n;
        self
    }

    pub fn min_chunk_chars(mut self, n: usize) -> Self {
        self.config.chunking.min_chunk_chars = n;
        self
    }

    pub fn overlap_chars(mut self, n: usize) -> Self {
        self.config.chunking.overlap_chars = n;
        self
    }

    pub fn max_chunks(mut self, n: usize) -> Self {
        self.config.chunking.max_chunks = n;
        self
    }

    pub fn preprocess(mut self, options: PreprocessOptions) -> Self {
        self.config.preprocess = options;
        self
    }

    pub fn anchor_extraction(mut self, enabled: bool) -> Self {
        self.config.preprocess.anchor_extraction = enabled;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn parse_timeout_secs(mut self, secs: u64) -> Self {
        self.config.parse_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn review_threshold(mut self, threshold: f64) -> Self {
        self.config.review_threshold = threshold;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, PipelineError> {
        let c = &self.config;
        c.chunking.validate()?;
        if c.concurrency == 0 {
            return Err(PipelineError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&c.review_threshold) {
            return Err(PipelineError::InvalidConfig(format!(
                "Review threshold must be 0.0–1.0, got {}",
                c.review_threshold
            )));
        }
        if c.api_timeout_secs == 0 || c.parse_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "Timeouts must be ≥ 1 second".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Chunking ─────────────────────────────────────────────────────────────

/// Parameters for [`crate::pipeline::chunk::plan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Upper bound on a chunk's length (overlap included), in characters.
    /// Texts at or under this length are sent in a single call. Default: 12 000.
    pub max_chunk_chars: usize,

    /// Preferred lower bound on a chunk's length. The planner will not cut
    /// a chunk shorter than this to reach a paragraph break. Default: 2 000.
    pub min_chunk_chars: usize,

    /// Trailing context from the previous chunk prepended to each later
    /// chunk so line items straddling a boundary are seen whole. Default: 400.
    pub overlap_chars: usize,

    /// Hard cap on the number of chunks. Exceeding it grows the chunk size
    /// rather than dropping text. Default: 12.
    pub max_chunks: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 12_000,
            min_chunk_chars: 2_000,
            overlap_chars: 400,
            max_chunks: 12,
        }
    }
}

impl ChunkConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_chunks == 0 {
            return Err(PipelineError::InvalidConfig("max_chunks must be ≥ 1".into()));
        }
        if self.min_chunk_chars > self.max_chunk_chars {
            return Err(PipelineError::InvalidConfig(format!(
                "min_chunk_chars ({}) must not exceed max_chunk_chars ({})",
                self.min_chunk_chars, self.max_chunk_chars
            )));
        }
        if self.overlap_chars >= self.max_chunk_chars / 2 {
            return Err(PipelineError::InvalidConfig(format!(
                "overlap_chars ({}) must be less than half of max_chunk_chars ({})",
                self.overlap_chars, self.max_chunk_chars
            )));
        }
        Ok(())
    }
}

// ── Preprocessing ────────────────────────────────────────────────────────

/// Switches for [`crate::pipeline::preprocess::preprocess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreprocessOptions {
    /// Remove "Page N of M" style lines. Default: true.
    pub strip_page_artifacts: bool,

    /// Remove running headers/footers (short digit-free lines repeated on
    /// many pages). Default: true.
    pub strip_repeated_lines: bool,

    /// How often a line must repeat to count as a running header. Default: 3.
    pub repeated_line_threshold: usize,

    /// Shorten long documents to the lines around high-signal tokens.
    /// Default: false.
    pub anchor_extraction: bool,

    /// Anchor extraction only applies to texts at least this long. Default: 20 000.
    pub anchor_min_chars: usize,

    /// Lines kept on each side of an anchor line. Default: 2.
    pub anchor_context_lines: usize,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            strip_page_artifacts: true,
            strip_repeated_lines: true,
            repeated_line_threshold: 3,
            anchor_extraction: false,
            anchor_min_chars: 20_000,
            anchor_context_lines: 2,
        }
    }
}

// ── Per-merchant settings ────────────────────────────────────────────────

/// AI settings stored per merchant and looked up by the workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiSettings {
    pub merchant_id: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub confidence_threshold: Option<f64>,
    #[serde(default)]
    pub enable_anchor_extraction: Option<bool>,
    #[serde(default)]
    pub max_chunk_chars: Option<usize>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds() {
        let config = ExtractionConfig::builder().build().unwrap();
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.chunking, ChunkConfig::default());
    }

    #[test]
    fn overlap_must_be_small_relative_to_chunk() {
        let err = ExtractionConfig::builder()
            .max_chunk_chars(1_000)
            .min_chunk_chars(100)
            .overlap_chars(600)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("overlap_chars"));
    }

    #[test]
    fn min_above_max_is_rejected() {
        let err = ExtractionConfig::builder()
            .max_chunk_chars(1_000)
            .min_chunk_chars(2_000)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("min_chunk_chars"));
    }

    #[test]
    fn review_threshold_out_of_range_is_rejected() {
        assert!(ExtractionConfig::builder()
            .review_threshold(1.5)
            .build()
            .is_err());
    }

    #[test]
    fn settings_overlay_only_touches_set_fields() {
        let base = ExtractionConfig::builder().model("gpt-4.1-nano").build().unwrap();
        let settings = AiSettings {
            merchant_id: "m-1".into(),
            confidence_threshold: Some(0.85),
            enable_anchor_extraction: Some(true),
            max_chunk_chars: Some(10),
            ..Default::default()
        };
        let merged = base.with_settings(&settings);
        assert_eq!(merged.model.as_deref(), Some("gpt-4.1-nano"));
        assert_eq!(merged.review_threshold, 0.85);
        assert!(merged.preprocess.anchor_extraction);
        // Raised to the minimum so the chunk window stays valid.
        assert_eq!(merged.chunking.max_chunk_chars, merged.chunking.min_chunk_chars);
    }

    #[test]
    fn settings_deserialize_from_camel_case() {
        let s: AiSettings = serde_json::from_str(
            r#"{"merchantId":"m-9","model":"gpt-4.1","confidenceThreshold":0.6}"#,
        )
        .unwrap();
        assert_eq!(s.merchant_id, "m-9");
        assert_eq!(s.model.as_deref(), Some("gpt-4.1"));
        assert_eq!(s.confidence_threshold, Some(0.6));
        assert!(s.provider.is_none());
    }
}
