//! Output types: per-call extraction results and the aggregated document.
//!
//! Every field the model may omit has a defined value here. Classification
//! fields fall back to [`UNKNOWN`] / [`DocumentType::Unknown`], optional
//! numbers to `None`, lists to empty. Downstream code (the aggregator, the
//! workflow store, UI readers) can therefore match on values without first
//! checking whether the model bothered to send them.

use crate::error::ChunkError;
use crate::pipeline::preprocess::AnchorExtraction;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Sentinel for classification fields the model did not supply.
pub const UNKNOWN: &str = "unknown";

/// Issue recorded when preprocessing failed and the raw text was used.
pub const PREPROCESSING_FAILED_ISSUE: &str =
    "Text preprocessing failed; extraction used the raw document text";

/// True when `value` is empty or the [`UNKNOWN`] sentinel.
pub fn is_unknown(value: &str) -> bool {
    let v = value.trim();
    v.is_empty() || v.eq_ignore_ascii_case(UNKNOWN)
}

fn unknown() -> String {
    UNKNOWN.to_string()
}

/// What kind of document the model believes it is reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    PurchaseOrder,
    Invoice,
    Quote,
    PackingSlip,
    #[default]
    #[serde(other)]
    Unknown,
}

impl DocumentType {
    pub fn is_unknown(&self) -> bool {
        matches!(self, DocumentType::Unknown)
    }
}

/// Supplier block of a purchase order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Supplier {
    /// Supplier name, or [`UNKNOWN`].
    #[serde(default = "unknown")]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

impl Default for Supplier {
    fn default() -> Self {
        Self {
            name: unknown(),
            email: None,
            phone: None,
            address: None,
        }
    }
}

/// Document dates as printed (ISO-8601 when the model can normalise them).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dates {
    #[serde(default)]
    pub order_date: Option<String>,
    #[serde(default)]
    pub expected_delivery: Option<String>,
}

impl Dates {
    pub fn is_empty(&self) -> bool {
        self.order_date.is_none() && self.expected_delivery.is_none()
    }
}

/// Monetary totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    #[serde(default)]
    pub subtotal: Option<f64>,
    #[serde(default)]
    pub tax: Option<f64>,
    #[serde(default)]
    pub shipping: Option<f64>,
    #[serde(default)]
    pub total: Option<f64>,
    /// ISO 4217 code, or [`UNKNOWN`].
    #[serde(default = "unknown")]
    pub currency: String,
}

impl Default for Totals {
    fn default() -> Self {
        Self {
            subtotal: None,
            tax: None,
            shipping: None,
            total: None,
            currency: unknown(),
        }
    }
}

impl Totals {
    pub fn is_empty(&self) -> bool {
        self.subtotal.is_none()
            && self.tax.is_none()
            && self.shipping.is_none()
            && self.total.is_none()
            && is_unknown(&self.currency)
    }
}

/// One ordered line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit_price: Option<f64>,
    #[serde(default)]
    pub total: Option<f64>,
    /// Confidence of this line; inherits the call confidence when the model
    /// does not report one per item.
    #[serde(default)]
    pub confidence: f64,
    /// Chunk the line was read from.
    #[serde(default)]
    pub chunk_index: usize,
}

/// Structured payload of a purchase order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedData {
    #[serde(default)]
    pub document_type: DocumentType,
    /// PO number, or [`UNKNOWN`].
    #[serde(default = "unknown")]
    pub po_number: String,
    #[serde(default)]
    pub supplier: Supplier,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub dates: Dates,
    #[serde(default)]
    pub totals: Totals,
}

impl Default for ExtractedData {
    fn default() -> Self {
        Self {
            document_type: DocumentType::Unknown,
            po_number: unknown(),
            supplier: Supplier::default(),
            line_items: Vec::new(),
            dates: Dates::default(),
            totals: Totals::default(),
        }
    }
}

/// Cheap structural checks computed from [`ExtractedData`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityIndicators {
    pub has_po_number: bool,
    pub has_supplier: bool,
    pub line_item_count: usize,
    /// Whether line totals sum to the subtotal (or total) within 1%.
    /// `None` when there is nothing to compare.
    pub totals_consistent: Option<bool>,
    pub missing_fields: Vec<String>,
}

impl QualityIndicators {
    pub fn evaluate(data: &ExtractedData) -> Self {
        let has_po_number = !is_unknown(&data.po_number);
        let has_supplier = !is_unknown(&data.supplier.name);

        let mut missing_fields = Vec::new();
        if !has_po_number {
            missing_fields.push("po_number".to_string());
        }
        if !has_supplier {
            missing_fields.push("supplier".to_string());
        }
        if data.line_items.is_empty() {
            missing_fields.push("line_items".to_string());
        }
        if data.totals.total.is_none() {
            missing_fields.push("totals.total".to_string());
        }
        if data.dates.order_date.is_none() {
            missing_fields.push("dates.order_date".to_string());
        }

        let line_sum: Option<f64> = if data.line_items.is_empty() {
            None
        } else {
            data.line_items.iter().map(|li| li.total).sum()
        };
        let reference = data.totals.subtotal.or(data.totals.total);
        let totals_consistent = match (line_sum, reference) {
            (Some(sum), Some(expected)) if expected.abs() > f64::EPSILON => {
                Some(((sum - expected) / expected).abs() <= 0.01)
            }
            (Some(sum), Some(_)) => Some(sum.abs() <= f64::EPSILON),
            _ => None,
        };

        Self {
            has_po_number,
            has_supplier,
            line_item_count: data.line_items.len(),
            totals_consistent,
            missing_fields,
        }
    }
}

/// Token accounting for one or more model calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub calls: u32,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.calls += other.calls;
    }
}

/// Result of one extraction call (whole document or one chunk).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub chunk_index: usize,
    /// 0.0–1.0.
    pub confidence: f64,
    pub extracted_data: ExtractedData,
    #[serde(default)]
    pub field_confidences: BTreeMap<String, f64>,
    #[serde(default)]
    pub quality_indicators: QualityIndicators,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    /// Heuristic token count of the input text; used as aggregation weight.
    #[serde(default)]
    pub estimated_tokens: usize,
    #[serde(default)]
    pub usage: TokenUsage,
    /// Set when the call produced nothing usable.
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub error: Option<ChunkError>,
}

impl ExtractionResult {
    /// A zero-confidence result carrying `error` as its only issue.
    pub fn failed(
        chunk_index: usize,
        estimated_tokens: usize,
        error: ChunkError,
        usage: TokenUsage,
    ) -> Self {
        let extracted_data = ExtractedData::default();
        Self {
            chunk_index,
            confidence: 0.0,
            quality_indicators: QualityIndicators::evaluate(&extracted_data),
            extracted_data,
            field_confidences: BTreeMap::new(),
            issues: vec![error.to_string()],
            suggestions: Vec::new(),
            estimated_tokens,
            usage,
            failed: true,
            error: Some(error),
        }
    }
}

/// What preprocessing did (or why it did not).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingMeta {
    pub failed: bool,
    pub error: Option<String>,
    pub original_length: usize,
    pub optimized_length: usize,
    pub reduction_percent: f64,
    pub anchor_extraction: Option<AnchorExtraction>,
}

/// How the text was split.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkingMeta {
    pub chunk_count: usize,
    pub effective_max_chunk_chars: usize,
    /// True when the chunk size was grown to respect `max_chunks`.
    pub grown: bool,
    pub estimated_tokens: usize,
}

/// Per-parse bookkeeping attached to the aggregated result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseMetadata {
    pub call_id: Option<Uuid>,
    pub preprocessing: PreprocessingMeta,
    pub chunking: ChunkingMeta,
    pub usage: TokenUsage,
    pub failed_calls: usize,
    pub duration_ms: u64,
}

/// The document-level union of all extraction results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    /// Token-weighted mean of the contributing results' confidence.
    pub confidence: f64,
    pub extracted_data: ExtractedData,
    pub field_confidences: BTreeMap<String, f64>,
    pub quality_indicators: QualityIndicators,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    /// Chunk indices that contributed after duplicate results were collapsed.
    pub chunk_indices: Vec<usize>,
    /// Set when `confidence` is below the review threshold.
    pub needs_review: bool,
    pub metadata: ParseMetadata,
}

impl AggregatedResult {
    /// Flag the result for human review when confidence is under `threshold`.
    pub fn flag_for_review(&mut self, threshold: f64) {
        self.needs_review = self.confidence < threshold;
        if self.needs_review {
            let note = format!(
                "Overall confidence {:.2} is below the review threshold {:.2}",
                self.confidence, threshold
            );
            if !self.issues.contains(&note) {
                self.issues.push(note);
            }
        }
    }
}
