//! Extraction client: one structured-extraction call per document or chunk.
//!
//! [`ExtractionClient`] never returns an error. Transport failures are
//! retried with exponential backoff and, once exhausted, become a failed
//! zero-confidence [`ExtractionResult`]; replies that carry no usable
//! function call become the same thing with an explanatory issue. The parse
//! stage decides whether the document as a whole is still worth keeping.
//!
//! Model replies are read through lenient `Raw*` shapes: amounts may arrive
//! as numbers or as strings such as `"$1,234.50"`, confidences as fractions
//! or percentages, and the supplier as a bare name or a full object. Every
//! field the model leaves out takes its sentinel value from
//! [`crate::output`].

use crate::config::ExtractionConfig;
use crate::error::ChunkError;
use crate::output::{
    is_unknown, DocumentType, ExtractedData, ExtractionResult, LineItem, QualityIndicators,
    Supplier, TokenUsage, UNKNOWN,
};
use crate::pipeline::chunk::estimate_tokens;
use crate::pipeline::llm::{
    retry_backoff, ExtractionModel, ExtractionRequest, FunctionCall, ModelResponse,
};
use crate::prompts::{extraction_prompt, SchemaKind, DEFAULT_SYSTEM_PROMPT};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// Free-text notes (issues, suggestions) as the model sends them.
type Notes = Vec<String>;

/// Issues extraction calls against an [`ExtractionModel`].
#[derive(Clone)]
pub struct ExtractionClient {
    model: Arc<dyn ExtractionModel>,
    system_prompt: String,
    max_retries: u32,
    retry_backoff_ms: u64,
    api_timeout_secs: u64,
}

impl ExtractionClient {
    pub fn new(model: Arc<dyn ExtractionModel>, config: &ExtractionConfig) -> Self {
        Self {
            model,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            api_timeout_secs: config.api_timeout_secs,
        }
    }

    /// Extract a whole document in one call (chunk index 0).
    pub async fn extract_document(&self, text: &str) -> ExtractionResult {
        self.run(SchemaKind::PurchaseOrder, text, 0, 1).await
    }

    /// Extract one chunk of a multi-chunk document.
    ///
    /// The first chunk asks for header fields and line items; later chunks
    /// ask for line items only.
    pub async fn extract_chunk(
        &self,
        text: &str,
        chunk_index: usize,
        total_chunks: usize,
    ) -> ExtractionResult {
        let kind = if chunk_index == 0 {
            SchemaKind::PurchaseOrder
        } else {
            SchemaKind::LineItems
        };
        self.run(kind, text, chunk_index, total_chunks.max(1)).await
    }

    async fn run(
        &self,
        kind: SchemaKind,
        text: &str,
        chunk_index: usize,
        total_chunks: usize,
    ) -> ExtractionResult {
        let estimated_tokens = estimate_tokens(text);
        let request = ExtractionRequest {
            schema: kind,
            system_prompt: self.system_prompt.clone(),
            prompt_text: extraction_prompt(kind, text, chunk_index, total_chunks),
        };

        let (response, usage) = match self.call_with_retry(&request, chunk_index).await {
            Ok(ok) => ok,
            Err((error, usage)) => {
                return ExtractionResult::failed(chunk_index, estimated_tokens, error, usage);
            }
        };

        match parse_extraction(kind, chunk_index, response.function_call.as_ref()) {
            Ok(mut result) => {
                result.estimated_tokens = estimated_tokens;
                result.usage = usage;
                debug!(
                    "Chunk {}: {} line items, confidence {:.2}",
                    chunk_index,
                    result.extracted_data.line_items.len(),
                    result.confidence
                );
                result
            }
            Err(error) => {
                warn!("{}", error);
                ExtractionResult::failed(chunk_index, estimated_tokens, error, usage)
            }
        }
    }

    /// Call the model with retry and per-call timeout.
    ///
    /// Token usage is accumulated across attempts, failed ones included.
    async fn call_with_retry(
        &self,
        request: &ExtractionRequest,
        chunk_index: usize,
    ) -> Result<(ModelResponse, TokenUsage), (ChunkError, TokenUsage)> {
        let call_timeout = Duration::from_secs(self.api_timeout_secs);
        let mut usage = TokenUsage::default();
        let mut last_error = String::from("Unknown error");
        let mut timed_out = false;
        let mut attempts = 0u32;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = retry_backoff(self.retry_backoff_ms, attempt);
                warn!(
                    "Chunk {}: retry {}/{} after {:?}",
                    chunk_index, attempt, self.max_retries, backoff
                );
                sleep(backoff).await;
            }
            attempts = attempt;
            usage.calls += 1;

            match timeout(call_timeout, self.model.call(request)).await {
                Ok(Ok(response)) => {
                    usage.prompt_tokens += response.prompt_tokens;
                    usage.completion_tokens += response.completion_tokens;
                    return Ok((response, usage));
                }
                Ok(Err(e)) => {
                    warn!("Chunk {}: attempt {} failed: {}", chunk_index, attempt + 1, e);
                    last_error = e.to_string();
                    timed_out = false;
                    if e.is_permanent() {
                        break;
                    }
                }
                Err(_) => {
                    warn!(
                        "Chunk {}: attempt {} timed out after {}s",
                        chunk_index,
                        attempt + 1,
                        self.api_timeout_secs
                    );
                    timed_out = true;
                }
            }
        }

        let error = if timed_out {
            ChunkError::Timeout {
                chunk: chunk_index,
                secs: self.api_timeout_secs,
            }
        } else {
            ChunkError::LlmFailed {
                chunk: chunk_index,
                retries: attempts,
                detail: last_error,
            }
        };
        Err((error, usage))
    }
}

// ── Reply validation ─────────────────────────────────────────────────────

/// Turn a function call into an [`ExtractionResult`].
///
/// Fails when the call is missing, names a different function, or its
/// arguments do not have the requested shape. Usage and token estimate are
/// filled in by the caller.
pub fn parse_extraction(
    kind: SchemaKind,
    chunk_index: usize,
    call: Option<&FunctionCall>,
) -> Result<ExtractionResult, ChunkError> {
    let expected = kind.function_name();
    let call = call.ok_or_else(|| ChunkError::MissingFunctionCall {
        chunk: chunk_index,
        expected: expected.to_string(),
    })?;
    if call.name != expected {
        return Err(ChunkError::UnexpectedFunction {
            chunk: chunk_index,
            expected: expected.to_string(),
            actual: call.name.clone(),
        });
    }

    let malformed = |detail: String| ChunkError::MalformedArguments {
        chunk: chunk_index,
        detail,
    };

    let (reported, data, field_confidences, mut issues, suggestions) = match kind {
        SchemaKind::PurchaseOrder => {
            let raw: RawPurchaseOrder =
                serde_json::from_str(&call.arguments_json).map_err(|e| malformed(e.to_string()))?;
            let raw_data = raw
                .extracted_data
                .ok_or_else(|| malformed("missing field `extractedData`".to_string()))?;
            let mut issues = raw.issues;
            let data = raw_data.into_data(chunk_index, &mut issues);
            let field_confidences = raw
                .field_confidences
                .iter()
                .filter_map(|(k, v)| confidence_value(v).map(|c| (k.clone(), c)))
                .collect::<BTreeMap<_, _>>();
            (
                raw.confidence.as_ref().and_then(confidence_value),
                data,
                field_confidences,
                issues,
                raw.suggestions,
            )
        }
        SchemaKind::LineItems => {
            let raw: RawLineItemsCall =
                serde_json::from_str(&call.arguments_json).map_err(|e| malformed(e.to_string()))?;
            let raw_items = raw
                .line_items
                .ok_or_else(|| malformed("missing field `lineItems`".to_string()))?;
            let mut issues = raw.issues;
            let data = ExtractedData {
                line_items: convert_items(raw_items, chunk_index, &mut issues),
                ..ExtractedData::default()
            };
            (
                raw.confidence.as_ref().and_then(confidence_value),
                data,
                BTreeMap::new(),
                issues,
                Notes::new(),
            )
        }
    };

    let confidence = reported.unwrap_or_else(|| match kind {
        SchemaKind::PurchaseOrder => document_completeness(&data),
        SchemaKind::LineItems => line_item_completeness(&data.line_items),
    });

    let mut data = data;
    for item in &mut data.line_items {
        if item.confidence.is_nan() || item.confidence < 0.0 {
            item.confidence = confidence;
        }
    }
    issues.retain(|i| !i.trim().is_empty());

    Ok(ExtractionResult {
        chunk_index,
        confidence,
        quality_indicators: QualityIndicators::evaluate(&data),
        extracted_data: data,
        field_confidences,
        issues,
        suggestions,
        estimated_tokens: 0,
        usage: TokenUsage::default(),
        failed: false,
        error: None,
    })
}

// ── Confidence heuristics ────────────────────────────────────────────────

/// Completeness of a whole-document extraction, in [0, 1].
///
/// PO number 0.25, supplier 0.20, at least one line item 0.30, a parseable
/// total 0.15, an order date 0.10.
pub fn document_completeness(data: &ExtractedData) -> f64 {
    let mut score = 0.0;
    if !is_unknown(&data.po_number) {
        score += 0.25;
    }
    if !is_unknown(&data.supplier.name) {
        score += 0.20;
    }
    if !data.line_items.is_empty() {
        score += 0.30;
    }
    if data.totals.total.is_some() {
        score += 0.15;
    }
    if data.dates.order_date.is_some() {
        score += 0.10;
    }
    round2(score)
}

/// Share of line items carrying a description, a quantity and a price.
pub fn line_item_completeness(items: &[LineItem]) -> f64 {
    if items.is_empty() {
        return 0.0;
    }
    let complete = items
        .iter()
        .filter(|i| {
            !i.description.trim().is_empty()
                && i.quantity.is_some()
                && (i.unit_price.is_some() || i.total.is_some())
        })
        .count();
    round2(complete as f64 / items.len() as f64)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ── Lenient value readers ────────────────────────────────────────────────

/// A confidence as a fraction, percentage or string such as `"85%"`.
fn confidence_value(value: &Value) -> Option<f64> {
    let raw = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !raw.is_finite() {
        return None;
    }
    let scaled = if raw > 1.0 && raw <= 100.0 { raw / 100.0 } else { raw };
    Some(scaled.clamp(0.0, 1.0))
}

/// A monetary amount or quantity from a number or a formatted string.
///
/// `"$1,234.50"`, `"1 234.50 EUR"` and `"(12.00)"` are accepted; the last
/// reads as negative.
fn amount_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => {
            let s = s.trim();
            let negative = (s.starts_with('(') && s.ends_with(')')) || s.starts_with('-');
            let digits: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            if digits.is_empty() {
                return None;
            }
            let v = digits.parse::<f64>().ok()?;
            Some(if negative { -v } else { v })
        }
        _ => None,
    }
}

/// A non-empty trimmed string; numbers are rendered as written.
fn text_value(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if s.is_empty() || s.eq_ignore_ascii_case("null") || s.eq_ignore_ascii_case("n/a") {
        None
    } else {
        Some(s)
    }
}

fn opt_text(value: &Option<Value>) -> Option<String> {
    value.as_ref().and_then(text_value)
}

fn opt_amount(value: &Option<Value>) -> Option<f64> {
    value.as_ref().and_then(amount_value)
}

fn document_type(value: &Option<Value>) -> DocumentType {
    let Some(raw) = opt_text(value) else {
        return DocumentType::Unknown;
    };
    let normalized = raw.trim().to_lowercase().replace([' ', '-'], "_");
    match normalized.as_str() {
        "po" | "purchaseorder" => DocumentType::PurchaseOrder,
        other => serde_json::from_value(Value::String(other.to_string())).unwrap_or_default(),
    }
}

fn currency(value: &Option<Value>) -> String {
    let Some(raw) = opt_text(value) else {
        return UNKNOWN.to_string();
    };
    match raw.as_str() {
        "$" => "USD".to_string(),
        "€" => "EUR".to_string(),
        "£" => "GBP".to_string(),
        code if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) => {
            code.to_ascii_uppercase()
        }
        _ => UNKNOWN.to_string(),
    }
}

// ── Raw reply shapes ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPurchaseOrder {
    #[serde(default)]
    confidence: Option<Value>,
    #[serde(default, alias = "extracted_data")]
    extracted_data: Option<RawExtractedData>,
    #[serde(default, alias = "field_confidences")]
    field_confidences: BTreeMap<String, Value>,
    #[serde(default)]
    issues: Notes,
    #[serde(default)]
    suggestions: Notes,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLineItemsCall {
    #[serde(default)]
    confidence: Option<Value>,
    #[serde(default, alias = "line_items")]
    line_items: Option<Vec<RawLineItem>>,
    #[serde(default)]
    issues: Notes,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawExtractedData {
    #[serde(default, alias = "document_type")]
    document_type: Option<Value>,
    #[serde(default, alias = "po_number")]
    po_number: Option<Value>,
    #[serde(default)]
    supplier: Option<Value>,
    #[serde(default, alias = "line_items")]
    line_items: Vec<RawLineItem>,
    #[serde(default)]
    dates: Option<RawDates>,
    #[serde(default)]
    totals: Option<RawTotals>,
}

impl RawExtractedData {
    fn into_data(self, chunk_index: usize, issues: &mut Notes) -> ExtractedData {
        let dates = self.dates.unwrap_or_default();
        let totals = self.totals.unwrap_or_default();
        let mut data = ExtractedData {
            document_type: document_type(&self.document_type),
            po_number: opt_text(&self.po_number).unwrap_or_else(|| UNKNOWN.to_string()),
            supplier: supplier(self.supplier.as_ref()),
            line_items: convert_items(self.line_items, chunk_index, issues),
            ..ExtractedData::default()
        };
        data.dates.order_date = opt_text(&dates.order_date);
        data.dates.expected_delivery = opt_text(&dates.expected_delivery);
        data.totals.subtotal = opt_amount(&totals.subtotal);
        data.totals.tax = opt_amount(&totals.tax);
        data.totals.shipping = opt_amount(&totals.shipping);
        data.totals.total = opt_amount(&totals.total);
        data.totals.currency = currency(&totals.currency);
        data
    }
}

fn supplier(value: Option<&Value>) -> Supplier {
    match value {
        Some(Value::String(name)) if !name.trim().is_empty() => Supplier {
            name: name.trim().to_string(),
            ..Supplier::default()
        },
        Some(Value::Object(obj)) => {
            let field = |k: &str| obj.get(k).and_then(text_value);
            Supplier {
                name: field("name").unwrap_or_else(|| UNKNOWN.to_string()),
                email: field("email"),
                phone: field("phone"),
                address: field("address"),
            }
        }
        _ => Supplier::default(),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDates {
    #[serde(default, alias = "order_date")]
    order_date: Option<Value>,
    #[serde(default, alias = "expected_delivery", alias = "deliveryDate")]
    expected_delivery: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTotals {
    #[serde(default)]
    subtotal: Option<Value>,
    #[serde(default)]
    tax: Option<Value>,
    #[serde(default)]
    shipping: Option<Value>,
    #[serde(default)]
    total: Option<Value>,
    #[serde(default)]
    currency: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLineItem {
    #[serde(default, alias = "SKU", alias = "itemCode", alias = "productCode")]
    sku: Option<Value>,
    #[serde(default)]
    description: Option<Value>,
    #[serde(default, alias = "qty")]
    quantity: Option<Value>,
    #[serde(default, alias = "unit_price", alias = "price")]
    unit_price: Option<Value>,
    #[serde(default, alias = "lineTotal", alias = "amount")]
    total: Option<Value>,
    #[serde(default)]
    confidence: Option<Value>,
}

/// Convert raw items, dropping rows with neither SKU nor description.
///
/// Item confidence is left at `-1.0` when unreported; [`parse_extraction`]
/// replaces it with the call confidence.
fn convert_items(raw: Vec<RawLineItem>, chunk_index: usize, issues: &mut Notes) -> Vec<LineItem> {
    let mut dropped = 0usize;
    let items: Vec<LineItem> = raw
        .into_iter()
        .filter_map(|r| {
            let sku = opt_text(&r.sku);
            let description = opt_text(&r.description);
            if sku.is_none() && description.is_none() {
                dropped += 1;
                return None;
            }
            Some(LineItem {
                sku,
                description: description.unwrap_or_default(),
                quantity: opt_amount(&r.quantity),
                unit_price: opt_amount(&r.unit_price),
                total: opt_amount(&r.total),
                confidence: r.confidence.as_ref().and_then(confidence_value).unwrap_or(-1.0),
                chunk_index,
            })
        })
        .collect();
    if dropped > 0 {
        issues.push(format!(
            "Chunk {chunk_index}: ignored {dropped} line item(s) with neither SKU nor description"
        ));
    }
    items
}
