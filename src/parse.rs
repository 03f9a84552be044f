//! Document parse: text in, [`AggregatedResult`] out.
//!
//! This is the hard middle of the system and it owns no I/O of its own:
//! the model and the progress sink are passed in. The steps are
//!
//! ```text
//! text ──▶ preprocess ──▶ plan ──▶ extract (bounded fan-out) ──▶ aggregate
//!          (fail-soft)              chunk 0: purchase order
//!                                   chunk ≥1: line items only
//! ```
//!
//! Preprocessing failures fall back to the raw text and are recorded, never
//! raised. Individual call failures become zero-confidence results. The one
//! fatal outcome is every call failing at the transport level, which returns
//! [`PipelineError::ExtractionUnavailable`] so the queue can retry instead
//! of persisting an empty "success".

use crate::config::ExtractionConfig;
use crate::error::PipelineError;
use crate::output::{
    AggregatedResult, ChunkingMeta, ExtractionResult, ParseMetadata, PreprocessingMeta, TokenUsage,
    PREPROCESSING_FAILED_ISSUE,
};
use crate::pipeline::aggregate::aggregate;
use crate::pipeline::chunk::{self, ChunkPlan};
use crate::pipeline::extract::ExtractionClient;
use crate::pipeline::llm::ExtractionModel;
use crate::pipeline::preprocess::preprocess;
use crate::progress::{ProgressReporter, ProgressSink, ProgressStage};
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Parse one document's text.
///
/// # Arguments
/// * `text`: decoded document text
/// * `config`: extraction configuration (already overlaid with any
///   per-merchant settings)
/// * `model`: the extraction model
/// * `sink`: receives this call's progress events
/// * `workflow_id`: copied into every progress event
///
/// # Errors
/// Only [`PipelineError::ExtractionUnavailable`], when every extraction call
/// failed at the transport level.
pub async fn parse_document(
    text: &str,
    config: &ExtractionConfig,
    model: Arc<dyn ExtractionModel>,
    sink: Arc<dyn ProgressSink>,
    workflow_id: Option<&str>,
) -> Result<AggregatedResult, PipelineError> {
    let started = Instant::now();
    let reporter = Arc::new(ProgressReporter::new(sink, workflow_id.map(str::to_string)));
    let call_id = reporter.call_id();
    debug!("Parse {} started: {} chars", call_id, text.chars().count());

    reporter.publish_sub_stage_progress(
        ProgressStage::Start,
        0,
        0,
        json!({ "chars": text.chars().count() }),
    );

    // ── Preprocess (fail-soft) ───────────────────────────────────────────
    let (working_text, preprocessing) = match preprocess(text, &config.preprocess) {
        Ok(pre) => {
            let meta = PreprocessingMeta {
                failed: false,
                error: None,
                original_length: pre.original_length,
                optimized_length: pre.optimized_length,
                reduction_percent: pre.reduction_percent,
                anchor_extraction: pre.anchor_extraction.clone(),
            };
            (pre.text, meta)
        }
        Err(e) => {
            warn!("Preprocessing failed, using raw text: {}", e);
            let len = text.chars().count();
            let meta = PreprocessingMeta {
                failed: true,
                error: Some(e.to_string()),
                original_length: len,
                optimized_length: len,
                reduction_percent: 0.0,
                anchor_extraction: None,
            };
            (text.to_string(), meta)
        }
    };
    reporter.publish_sub_stage_progress(
        ProgressStage::Preprocess,
        0,
        0,
        json!({
            "failed": preprocessing.failed,
            "originalLength": preprocessing.original_length,
            "optimizedLength": preprocessing.optimized_length,
        }),
    );

    // ── Plan ─────────────────────────────────────────────────────────────
    let plan = chunk::plan(&working_text, &config.chunking);
    let total = plan.len();
    if plan.grown {
        info!(
            "Chunk size grown to {} chars to stay within {} chunks",
            plan.effective_max_chunk_chars, config.chunking.max_chunks
        );
    }
    reporter.publish_sub_stage_progress(
        ProgressStage::Plan,
        0,
        total,
        json!({
            "chunks": total,
            "effectiveMaxChunkChars": plan.effective_max_chunk_chars,
            "grown": plan.grown,
        }),
    );

    // ── Extract ──────────────────────────────────────────────────────────
    let client = ExtractionClient::new(model, config);
    let results = extract_all(&client, &plan, config.concurrency, &reporter).await;

    let failed_calls = results.iter().filter(|r| r.failed).count();
    if results
        .iter()
        .all(|r| r.error.as_ref().is_some_and(|e| e.is_transport()))
    {
        let first_error = results
            .iter()
            .find_map(|r| r.error.as_ref())
            .map(|e| e.to_string())
            .unwrap_or_else(|| "Unknown error".to_string());
        reporter.finish().await;
        return Err(PipelineError::ExtractionUnavailable {
            total: results.len(),
            first_error,
        });
    }

    // ── Aggregate ────────────────────────────────────────────────────────
    let mut usage = TokenUsage::default();
    for r in &results {
        usage.add(&r.usage);
    }

    let mut aggregated = aggregate(&results);
    if preprocessing.failed {
        aggregated.issues.insert(0, PREPROCESSING_FAILED_ISSUE.to_string());
    }
    aggregated.flag_for_review(config.review_threshold);
    aggregated.metadata = ParseMetadata {
        call_id: Some(call_id),
        preprocessing,
        chunking: ChunkingMeta {
            chunk_count: total,
            effective_max_chunk_chars: plan.effective_max_chunk_chars,
            grown: plan.grown,
            estimated_tokens: plan.total_estimated_tokens(),
        },
        usage,
        failed_calls,
        duration_ms: 0,
    };

    reporter.publish_sub_stage_progress(
        ProgressStage::Finalize,
        total,
        total,
        json!({
            "lineItems": aggregated.extracted_data.line_items.len(),
            "failedCalls": failed_calls,
        }),
    );

    aggregated.metadata.duration_ms = started.elapsed().as_millis() as u64;
    info!(
        "Parse {} complete: {} chunks, {} line items, confidence {:.2}{}",
        call_id,
        total,
        aggregated.extracted_data.line_items.len(),
        aggregated.confidence,
        if aggregated.needs_review { " (needs review)" } else { "" }
    );

    reporter.publish_sub_stage_progress(
        ProgressStage::Complete,
        total,
        total,
        json!({
            "confidence": aggregated.confidence,
            "needsReview": aggregated.needs_review,
        }),
    );
    reporter.finish().await;

    Ok(aggregated)
}

/// Run every chunk through the client, at most `concurrency` at a time.
///
/// Results come back ordered by chunk index. Secondary chunks emit
/// `chunk_start`/`chunk_done`; the primary chunk is covered by the
/// lifecycle events around it. Each chunk future owns its inputs so a
/// parse can run inside a spawned task.
async fn extract_all(
    client: &ExtractionClient,
    plan: &ChunkPlan,
    concurrency: usize,
    reporter: &Arc<ProgressReporter>,
) -> Vec<ExtractionResult> {
    if plan.is_single() {
        return vec![client.extract_document(&plan.chunks[0].text).await];
    }

    let total = plan.len();
    let mut results: Vec<ExtractionResult> = stream::iter(plan.chunks.iter().map(|chunk| {
        let client = client.clone();
        let reporter = Arc::clone(reporter);
        let index = chunk.index;
        let text = chunk.text.clone();
        let start_meta = json!({
            "chars": chunk.length,
            "estimatedTokens": chunk.estimated_tokens,
        });
        async move {
            if index > 0 {
                reporter.publish_sub_stage_progress(
                    ProgressStage::ChunkStart,
                    index,
                    total,
                    start_meta,
                );
            }
            let result = client.extract_chunk(&text, index, total).await;
            if index > 0 {
                reporter.publish_sub_stage_progress(
                    ProgressStage::ChunkDone,
                    index,
                    total,
                    json!({
                        "confidence": result.confidence,
                        "lineItems": result.extracted_data.line_items.len(),
                        "failed": result.failed,
                    }),
                );
            }
            result
        }
    }).collect::<Vec<_>>())
    .buffer_unordered(concurrency.max(1))
    .collect()
    .await;

    results.sort_by_key(|r| r.chunk_index);
    results
}
