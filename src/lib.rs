//! # po-extract
//!
//! Extract structured purchase-order data (supplier, dates, totals, line
//! items) from uploaded documents using LLM function calling.
//!
//! ## Pipeline Overview
//!
//! ```text
//! document (text / PDF / image)
//!  │
//!  ├─ 1. Decode      text layer via pdfium, or vision transcription for images
//!  ├─ 2. Preprocess  whitespace + OCR cleanup, optional anchor extraction
//!  ├─ 3. Chunk       split long documents on line-item boundaries
//!  ├─ 4. Extract     concurrent structured calls, retry with backoff
//!  ├─ 5. Aggregate   vote on header fields, de-duplicate line items
//!  └─ 6. Output      AggregatedResult + confidence + review flag
//! ```
//!
//! Every step reports through a [`ProgressSink`], and the [`workflow`]
//! module wraps the whole thing in a durable, retryable per-upload workflow.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use po_extract::{extract, ExtractionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = ExtractionConfig::default();
//!     let result = extract("purchase-order.pdf", &config).await?;
//!     println!("PO {} with {} line items (confidence {:.2})",
//!         result.extracted_data.po_number,
//!         result.extracted_data.line_items.len(),
//!         result.confidence);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `poextract` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! po-extract = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod document;
pub mod error;
pub mod output;
pub mod parse;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod workflow;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    AiSettings, ChunkConfig, ExtractionConfig, ExtractionConfigBuilder, PreprocessOptions,
};
pub use document::{extract, extract_bytes, extract_sync, extract_with_progress};
pub use error::{ChunkError, ErrorClass, PipelineError, PreprocessError, StoreError};
pub use output::{
    AggregatedResult, DocumentType, ExtractedData, ExtractionResult, LineItem, ParseMetadata,
    QualityIndicators, Supplier, TokenUsage,
};
pub use parse::parse_document;
pub use pipeline::llm::{
    ExtractionModel, ExtractionRequest, FunctionCall, LlmExtractionModel, ModelError, ModelResponse,
};
pub use progress::{
    ChannelProgressSink, NoopProgressSink, ProgressEvent, ProgressReporter, ProgressSink,
    ProgressStage,
};
