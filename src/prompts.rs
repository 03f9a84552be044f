//! Prompt text and function schemas for extraction calls.
//!
//! Two functions exist. `extract_purchase_order` sees the whole document (or
//! its first chunk) and returns header fields plus line items.
//! `extract_po_line_items` sees a later chunk and returns line items only:
//! asking every chunk for a PO number invites the model to invent one from
//! a stray reference number in the middle of the document.

use serde_json::{json, Value};

pub const PURCHASE_ORDER_FUNCTION: &str = "extract_purchase_order";
pub const LINE_ITEMS_FUNCTION: &str = "extract_po_line_items";

/// Which function an extraction call asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    /// Header fields and line items.
    PurchaseOrder,
    /// Line items only.
    LineItems,
}

impl SchemaKind {
    pub fn function_name(&self) -> &'static str {
        match self {
            SchemaKind::PurchaseOrder => PURCHASE_ORDER_FUNCTION,
            SchemaKind::LineItems => LINE_ITEMS_FUNCTION,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SchemaKind::PurchaseOrder => {
                "Extract the header fields and every line item of a purchase order."
            }
            SchemaKind::LineItems => {
                "Extract only the line items present in this excerpt of a purchase order."
            }
        }
    }

    /// JSON Schema for the function arguments.
    pub fn parameters(&self) -> Value {
        match self {
            SchemaKind::PurchaseOrder => json!({
                "type": "object",
                "properties": {
                    "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
                    "extractedData": {
                        "type": "object",
                        "properties": {
                            "documentType": {
                                "type": "string",
                                "enum": ["purchase_order", "invoice", "quote", "packing_slip", "unknown"]
                            },
                            "poNumber": { "type": "string" },
                            "supplier": {
                                "type": "object",
                                "properties": {
                                    "name": { "type": "string" },
                                    "email": { "type": "string" },
                                    "phone": { "type": "string" },
                                    "address": { "type": "string" }
                                }
                            },
                            "lineItems": line_items_schema(),
                            "dates": {
                                "type": "object",
                                "properties": {
                                    "orderDate": { "type": "string" },
                                    "expectedDelivery": { "type": "string" }
                                }
                            },
                            "totals": {
                                "type": "object",
                                "properties": {
                                    "subtotal": { "type": "number" },
                                    "tax": { "type": "number" },
                                    "shipping": { "type": "number" },
                                    "total": { "type": "number" },
                                    "currency": { "type": "string" }
                                }
                            }
                        },
                        "required": ["poNumber", "lineItems"]
                    },
                    "fieldConfidences": {
                        "type": "object",
                        "additionalProperties": { "type": "number" }
                    },
                    "issues": { "type": "array", "items": { "type": "string" } },
                    "suggestions": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["extractedData"]
            }),
            SchemaKind::LineItems => json!({
                "type": "object",
                "properties": {
                    "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
                    "lineItems": line_items_schema(),
                    "issues": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["lineItems"]
            }),
        }
    }
}

fn line_items_schema() -> Value {
    json!({
        "type": "array",
        "items": {
            "type": "object",
            "properties": {
                "sku": { "type": "string" },
                "description": { "type": "string" },
                "quantity": { "type": "number" },
                "unitPrice": { "type": "number" },
                "total": { "type": "number" },
                "confidence": { "type": "number", "minimum": 0, "maximum": 1 }
            },
            "required": ["description"]
        }
    })
}

/// Default system prompt for extraction calls.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You read purchase-order documents and return structured data.

Rules:
1. Copy values exactly as printed. Do not guess values that are not in the text.
2. Leave a field out when the document does not contain it.
3. Amounts are plain numbers without currency symbols or thousands separators.
4. Every row of the item table is one line item, including rows whose text
   continues on the next line.
5. Report "confidence" between 0 and 1 for the extraction as a whole and for
   each line item.
6. Use "issues" for anything unreadable, ambiguous or contradictory."#;

/// Instruction appended to the system prompt describing the single function
/// the model must call and the reply format.
pub fn function_call_instruction(kind: SchemaKind) -> String {
    format!(
        "You must call exactly one function.\n\
         Function name: {name}\n\
         Description: {description}\n\
         Parameters (JSON Schema):\n{schema}\n\n\
         Reply with a single JSON object and nothing else:\n\
         {{\"name\": \"{name}\", \"arguments\": {{ ... }}}}",
        name = kind.function_name(),
        description = kind.description(),
        schema = kind.parameters(),
    )
}

/// User-turn text for one extraction call.
pub fn extraction_prompt(
    kind: SchemaKind,
    text: &str,
    chunk_index: usize,
    total_chunks: usize,
) -> String {
    match kind {
        SchemaKind::PurchaseOrder if total_chunks <= 1 => {
            format!("Purchase order document:\n\n{text}")
        }
        SchemaKind::PurchaseOrder => format!(
            "Purchase order document, part 1 of {total_chunks}. Later parts are \
             processed separately; extract what this part contains.\n\n{text}"
        ),
        SchemaKind::LineItems => format!(
            "Purchase order document, part {} of {total_chunks}. The first lines may \
             repeat the end of the previous part; include an item only if its row \
             is complete here.\n\n{text}",
            chunk_index + 1
        ),
    }
}

/// Prompt for transcribing an uploaded image of a purchase order.
pub const IMAGE_TRANSCRIPTION_PROMPT: &str = "Transcribe all text in this purchase-order image \
exactly as printed, top to bottom. Keep each table row on its own line with columns separated \
by two spaces. Output plain text only.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_names_match_schema_kind() {
        assert_eq!(SchemaKind::PurchaseOrder.function_name(), "extract_purchase_order");
        assert_eq!(SchemaKind::LineItems.function_name(), "extract_po_line_items");
    }

    #[test]
    fn line_item_schema_has_no_header_fields() {
        let schema = SchemaKind::LineItems.parameters();
        let props = schema["properties"].as_object().unwrap();
        assert!(props.contains_key("lineItems"));
        assert!(!props.contains_key("extractedData"));
    }

    #[test]
    fn instruction_names_the_function() {
        let s = function_call_instruction(SchemaKind::LineItems);
        assert!(s.contains("\"name\": \"extract_po_line_items\""));
        assert!(s.contains("lineItems"));
    }

    #[test]
    fn chunk_prompt_is_one_based() {
        let p = extraction_prompt(SchemaKind::LineItems, "rows", 2, 4);
        assert!(p.contains("part 3 of 4"));
        assert!(p.ends_with("rows"));
    }
}
