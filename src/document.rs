//! One-shot extraction entry points.
//!
//! These wire the pipeline stages together for a single document without
//! the workflow machinery: no state store, no queue, no stage records. Use
//! [`crate::workflow::WorkflowOrchestrator`] for durable processing of
//! uploads.

use crate::config::ExtractionConfig;
use crate::error::PipelineError;
use crate::output::AggregatedResult;
use crate::parse::parse_document;
use crate::pipeline::decode::{DocumentDecoder, StandardDecoder};
use crate::pipeline::input::{self, RawDocument};
use crate::pipeline::llm::{resolve_provider, LlmExtractionModel};
use crate::progress::{NoopProgressSink, ProgressSink};
use std::sync::Arc;
use tracing::info;

/// Extract purchase-order data from a local file or HTTP(S) URL.
///
/// Text, PDF and image documents are accepted; images are transcribed with
/// the configured provider before parsing.
///
/// # Errors
/// Returns `Err(PipelineError)` only for fatal errors:
/// - file not found or download failed
/// - unsupported or unreadable document
/// - every extraction call failed at the transport level
///
/// Individual failed chunks do not fail the call; they show up as issues
/// and a lower confidence on the result.
pub async fn extract(
    input_str: impl AsRef<str>,
    config: &ExtractionConfig,
) -> Result<AggregatedResult, PipelineError> {
    extract_with_progress(input_str, config, Arc::new(NoopProgressSink)).await
}

/// [`extract`] with progress events delivered to `sink`.
pub async fn extract_with_progress(
    input_str: impl AsRef<str>,
    config: &ExtractionConfig,
    sink: Arc<dyn ProgressSink>,
) -> Result<AggregatedResult, PipelineError> {
    let input_str = input_str.as_ref();
    info!("Starting extraction: {}", input_str);
    let document = input::resolve_input(input_str, config.download_timeout_secs).await?;
    extract_document(document, config, sink).await
}

/// Extract from bytes already in memory.
///
/// `mime_type` may be empty, in which case it is sniffed from `file_name`
/// and the leading bytes.
pub async fn extract_bytes(
    file_name: &str,
    mime_type: &str,
    bytes: Vec<u8>,
    config: &ExtractionConfig,
) -> Result<AggregatedResult, PipelineError> {
    let document = RawDocument::new(file_name, mime_type, bytes);
    extract_document(document, config, Arc::new(NoopProgressSink)).await
}

/// Blocking wrapper around [`extract`].
///
/// Creates a new tokio runtime; do not call from inside one.
pub fn extract_sync(
    input_str: impl AsRef<str>,
    config: &ExtractionConfig,
) -> Result<AggregatedResult, PipelineError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| PipelineError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract(input_str, config))
}

async fn extract_document(
    document: RawDocument,
    config: &ExtractionConfig,
    sink: Arc<dyn ProgressSink>,
) -> Result<AggregatedResult, PipelineError> {
    let provider = resolve_provider(config)?;
    let decoder = StandardDecoder::new().with_vision(Arc::clone(&provider), config.clone());
    let text = decoder.decode(&document).await?;
    info!(
        "Decoded '{}' ({}): {} chars",
        document.file_name,
        document.mime_type,
        text.chars().count()
    );

    let model = Arc::new(LlmExtractionModel::new(provider, config));
    parse_document(&text, config, model, sink, None).await
}
