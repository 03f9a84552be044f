//! Shared fixtures for the integration tests: a scripted extraction model
//! and in-memory collaborators.

#![allow(dead_code)]

use async_trait::async_trait;
use once_cell::sync::Lazy;
use po_extract::config::ExtractionConfig;
use po_extract::error::PipelineError;
use po_extract::pipeline::input::FileStore;
use po_extract::pipeline::llm::{
    parse_function_call, ExtractionModel, ExtractionRequest, ModelError, ModelResponse,
};
use po_extract::prompts::SchemaKind;
use po_extract::workflow::ModelFactory;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

static PO_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"PURCHASE ORDER (\S+)").unwrap());

static LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(SKU-\d{5}) (.+?), qty (\d+) @ (\d+\.\d{2}) = (\d+\.\d{2})$").unwrap()
});

/// `count` complete order lines, one SKU each.
pub fn po_text(po_number: &str, count: usize) -> String {
    let mut s = format!("PURCHASE ORDER {po_number}\nSupplier: Acme Supply Co\nOrder date: 2024-03-01\n\n");
    for i in 0..count {
        s.push_str(&format!("SKU-{i:05} Widget assembly kit, qty 2 @ 12.50 = 25.00\n"));
    }
    s.push_str("\nTotal: 99.00 USD\n");
    s
}

/// How the scripted model answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Reads complete `SKU-…` rows back out of the prompt.
    Echo,
    /// Replies in prose with no function call.
    NoFunctionCall,
    /// Every call fails at the transport level.
    Down,
    /// Every call hangs far past any parse budget.
    Stall,
}

/// An [`ExtractionModel`] that answers from the prompt text alone. The PO
/// number is read from a `PURCHASE ORDER …` heading when the prompt has one.
pub struct ScriptedModel {
    script: Script,
    po_number: String,
    pub calls: AtomicU32,
}

impl ScriptedModel {
    pub fn new(script: Script) -> Self {
        Self::with_po(script, "PO-7781")
    }

    pub fn with_po(script: Script, po_number: &str) -> Self {
        Self {
            script,
            po_number: po_number.to_string(),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn line_items(prompt: &str) -> Vec<Value> {
        prompt
            .lines()
            .filter_map(|line| LINE_RE.captures(line.trim()))
            .map(|c| {
                json!({
                    "sku": &c[1],
                    "description": &c[2],
                    "quantity": c[3].parse::<f64>().unwrap_or_default(),
                    "unitPrice": &c[4],
                    "total": &c[5],
                })
            })
            .collect()
    }

    fn reply(&self, request: &ExtractionRequest) -> String {
        let items = Self::line_items(&request.prompt_text);
        let po_number = PO_RE
            .captures(&request.prompt_text)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| self.po_number.clone());
        let call = match request.schema {
            SchemaKind::PurchaseOrder => json!({
                "name": request.schema_name(),
                "arguments": {
                    "confidence": 0.9,
                    "extractedData": {
                        "documentType": "purchase_order",
                        "poNumber": po_number,
                        "supplier": { "name": "Acme Supply Co" },
                        "dates": { "orderDate": "2024-03-01" },
                        "totals": { "total": "99.00", "currency": "USD" },
                        "lineItems": items,
                    },
                    "fieldConfidences": { "poNumber": 0.95 },
                }
            }),
            SchemaKind::LineItems => json!({
                "name": request.schema_name(),
                "arguments": { "confidence": 0.8, "lineItems": items }
            }),
        };
        call.to_string()
    }
}

#[async_trait]
impl ExtractionModel for ScriptedModel {
    async fn call(&self, request: &ExtractionRequest) -> Result<ModelResponse, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Down => Err(ModelError::Api("HTTP 503 Service Unavailable".into())),
            Script::Stall => {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                Err(ModelError::Api("stalled call returned".into()))
            }
            Script::NoFunctionCall => Ok(ModelResponse {
                function_call: None,
                raw_content: "I am not able to read this document.".into(),
                prompt_tokens: 50,
                completion_tokens: 10,
            }),
            Script::Echo => {
                let raw = self.reply(request);
                Ok(ModelResponse {
                    function_call: parse_function_call(&raw),
                    raw_content: raw,
                    prompt_tokens: (request.prompt_text.len() / 4) as u64,
                    completion_tokens: 40,
                })
            }
        }
    }
}

/// [`ModelFactory`] handing out one shared scripted model.
pub struct ScriptedFactory {
    pub model: Arc<ScriptedModel>,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> Self {
        Self {
            model: Arc::new(ScriptedModel::new(script)),
        }
    }
}

impl ModelFactory for ScriptedFactory {
    fn model(&self, _config: &ExtractionConfig) -> Result<Arc<dyn ExtractionModel>, PipelineError> {
        Ok(self.model.clone())
    }
}

/// [`FileStore`] serving bytes from a map; unknown URLs fail like a 404.
#[derive(Default)]
pub struct MemoryFileStore {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryFileStore {
    pub fn with(mut self, url: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.files.insert(url.to_string(), bytes.into());
        self
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn download(&self, url: &str) -> Result<Vec<u8>, PipelineError> {
        self.files
            .get(url)
            .cloned()
            .ok_or_else(|| PipelineError::DownloadFailed {
                url: url.to_string(),
                reason: "HTTP 404 Not Found".into(),
            })
    }
}

/// Small chunks so modest documents span several.
pub fn small_chunk_config() -> ExtractionConfig {
    ExtractionConfig::builder()
        .max_chunk_chars(1_000)
        .min_chunk_chars(200)
        .overlap_chars(100)
        .max_chunks(20)
        .concurrency(3)
        .max_retries(0)
        .retry_backoff_ms(1)
        .build()
        .unwrap()
}
