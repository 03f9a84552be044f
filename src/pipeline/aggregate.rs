//! Merge per-chunk extraction results into one document.
//!
//! [`aggregate`] is pure: same input, same output, no I/O. The rules, in the
//! order they are applied:
//!
//! 1. Results are ordered by chunk index.
//! 2. Whole-result duplicates (same normalised content, ignoring confidence
//!    and notes) collapse to the higher-confidence copy; on a tie the earlier
//!    chunk wins. Failed results and results that extracted nothing never
//!    collapse, so each keeps its weight in the confidence.
//! 3. Line items dedupe on normalised SKU, else normalised description. The
//!    higher-confidence copy wins; on a tie the earlier chunk.
//! 4. Header fields are elected: most votes among known values, then the
//!    value backed by the highest-confidence result, then the lowest chunk
//!    index. Supplier, dates and totals come whole from the result that won
//!    their key field (name, order date, total).
//! 5. Confidence is the mean weighted by estimated tokens.

use crate::output::{
    is_unknown, AggregatedResult, DocumentType, ExtractedData, ExtractionResult, LineItem,
    QualityIndicators,
};
use std::collections::{BTreeMap, HashMap};

/// Merge `results` into one [`AggregatedResult`].
///
/// `needs_review` and `metadata` are left at their defaults; the parse stage
/// fills them in.
pub fn aggregate(results: &[ExtractionResult]) -> AggregatedResult {
    let kept = collapse_duplicates(results);
    if kept.is_empty() {
        return AggregatedResult::default();
    }

    let extracted_data = merge_data(&kept);
    AggregatedResult {
        confidence: weighted_confidence(&kept),
        quality_indicators: QualityIndicators::evaluate(&extracted_data),
        extracted_data,
        field_confidences: max_field_confidences(&kept),
        issues: union(kept.iter().flat_map(|r| r.issues.iter())),
        suggestions: union(kept.iter().flat_map(|r| r.suggestions.iter())),
        chunk_indices: kept.iter().map(|r| r.chunk_index).collect(),
        needs_review: false,
        metadata: Default::default(),
    }
}

/// Case-fold, trim and collapse internal whitespace.
pub fn normalize_key(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Dedup key of a line item: SKU when present, else description.
fn item_key(item: &LineItem) -> String {
    match item.sku.as_deref().map(normalize_key) {
        Some(sku) if !sku.is_empty() => format!("sku:{sku}"),
        _ => format!("desc:{}", normalize_key(&item.description)),
    }
}

// ── Whole-result duplicates ──────────────────────────────────────────────

fn fingerprint(r: &ExtractionResult) -> String {
    let d = &r.extracted_data;
    let items: Vec<_> = d
        .line_items
        .iter()
        .map(|i| (item_key(i), i.quantity, i.unit_price, i.total))
        .collect();
    format!(
        "{:?}|{}|{}|{:?}|{:?}|{:?}|{:?}|{}|{:?}",
        d.document_type,
        normalize_key(&d.po_number),
        normalize_key(&d.supplier.name),
        d.dates.order_date,
        d.totals.subtotal,
        d.totals.total,
        d.totals.tax,
        normalize_key(&d.totals.currency),
        items
    )
}

/// Whether `r` carries anything worth deduplicating: a line item or a known
/// header value.
fn has_content(r: &ExtractionResult) -> bool {
    let d = &r.extracted_data;
    !d.line_items.is_empty()
        || !is_unknown(&d.po_number)
        || !is_unknown(&d.supplier.name)
        || !d.dates.is_empty()
        || !d.totals.is_empty()
}

fn collapse_duplicates(results: &[ExtractionResult]) -> Vec<&ExtractionResult> {
    let mut ordered: Vec<&ExtractionResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.chunk_index);

    let mut kept: Vec<&ExtractionResult> = Vec::with_capacity(ordered.len());
    let mut seen: HashMap<String, usize> = HashMap::new();
    for r in ordered {
        if r.failed || !has_content(r) {
            kept.push(r);
            continue;
        }
        let fp = fingerprint(r);
        match seen.get(&fp) {
            Some(&pos) => {
                if r.confidence > kept[pos].confidence {
                    kept[pos] = r;
                }
            }
            None => {
                seen.insert(fp, kept.len());
                kept.push(r);
            }
        }
    }
    kept.sort_by_key(|r| r.chunk_index);
    kept
}

// ── Field merge ──────────────────────────────────────────────────────────

fn merge_data(kept: &[&ExtractionResult]) -> ExtractedData {
    let live: Vec<&ExtractionResult> = kept.iter().copied().filter(|r| !r.failed).collect();
    let mut data = ExtractedData::default();

    if let Some(w) = elect(&live, |r| {
        let t = r.extracted_data.document_type;
        (t != DocumentType::Unknown).then(|| format!("{t:?}"))
    }) {
        data.document_type = w.extracted_data.document_type;
    }
    if let Some(w) = elect(&live, |r| known(&r.extracted_data.po_number)) {
        data.po_number = w.extracted_data.po_number.trim().to_string();
    }
    if let Some(w) = elect(&live, |r| known(&r.extracted_data.supplier.name)) {
        data.supplier = w.extracted_data.supplier.clone();
    }
    if let Some(w) = elect(&live, |r| r.extracted_data.dates.order_date.as_deref().and_then(known))
        .or_else(|| best(&live, |r| !r.extracted_data.dates.is_empty()))
    {
        data.dates = w.extracted_data.dates.clone();
    }
    if let Some(w) = elect(&live, |r| r.extracted_data.totals.total.map(|t| format!("{t:.2}")))
        .or_else(|| best(&live, |r| !r.extracted_data.totals.is_empty()))
    {
        data.totals = w.extracted_data.totals.clone();
    }

    data.line_items = merge_line_items(&live);
    data
}

fn known(value: &str) -> Option<String> {
    (!is_unknown(value)).then(|| normalize_key(value))
}

/// Pick the result whose key value wins the vote.
///
/// Votes are counted per distinct key. Ties go to the key backed by the
/// highest single confidence, then to the key first seen at the lowest
/// chunk index. The returned result is that key's highest-confidence
/// backer (earliest on a tie).
fn elect<'a, F>(results: &[&'a ExtractionResult], key: F) -> Option<&'a ExtractionResult>
where
    F: Fn(&ExtractionResult) -> Option<String>,
{
    struct Tally<'a> {
        votes: usize,
        backer: &'a ExtractionResult,
        first_chunk: usize,
    }

    let mut tallies: Vec<(String, Tally<'a>)> = Vec::new();
    for &r in results {
        let Some(k) = key(r) else { continue };
        match tallies.iter_mut().find(|(existing, _)| *existing == k) {
            Some((_, t)) => {
                t.votes += 1;
                if r.confidence > t.backer.confidence {
                    t.backer = r;
                }
                t.first_chunk = t.first_chunk.min(r.chunk_index);
            }
            None => tallies.push((
                k,
                Tally {
                    votes: 1,
                    backer: r,
                    first_chunk: r.chunk_index,
                },
            )),
        }
    }

    tallies
        .into_iter()
        .map(|(_, t)| t)
        .reduce(|a, b| {
            let b_wins = b.votes > a.votes
                || (b.votes == a.votes && b.backer.confidence > a.backer.confidence)
                || (b.votes == a.votes
                    && b.backer.confidence == a.backer.confidence
                    && b.first_chunk < a.first_chunk);
            if b_wins {
                b
            } else {
                a
            }
        })
        .map(|t| t.backer)
}

/// Highest-confidence result satisfying `pred`, earliest on a tie.
fn best<'a, F>(results: &[&'a ExtractionResult], pred: F) -> Option<&'a ExtractionResult>
where
    F: Fn(&ExtractionResult) -> bool,
{
    results
        .iter()
        .copied()
        .filter(|r| pred(r))
        .reduce(|a, b| if b.confidence > a.confidence { b } else { a })
}

fn merge_line_items(results: &[&ExtractionResult]) -> Vec<LineItem> {
    let mut items: Vec<LineItem> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for r in results {
        for item in &r.extracted_data.line_items {
            let key = item_key(item);
            match index.get(&key) {
                Some(&pos) => {
                    if item.confidence > items[pos].confidence {
                        items[pos] = item.clone();
                    }
                }
                None => {
                    index.insert(key, items.len());
                    items.push(item.clone());
                }
            }
        }
    }
    items
}

// ── Scores and notes ─────────────────────────────────────────────────────

fn weighted_confidence(results: &[&ExtractionResult]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    let total_weight: usize = results.iter().map(|r| r.estimated_tokens).sum();
    let mean = if total_weight == 0 {
        results.iter().map(|r| r.confidence).sum::<f64>() / results.len() as f64
    } else {
        results
            .iter()
            .map(|r| r.confidence * r.estimated_tokens as f64)
            .sum::<f64>()
            / total_weight as f64
    };
    mean.clamp(0.0, 1.0)
}

fn max_field_confidences(results: &[&ExtractionResult]) -> BTreeMap<String, f64> {
    let mut out: BTreeMap<String, f64> = BTreeMap::new();
    for r in results {
        for (field, &c) in &r.field_confidences {
            out.entry(field.clone())
                .and_modify(|existing| *existing = existing.max(c))
                .or_insert(c);
        }
    }
    out
}

fn union<'a>(notes: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for n in notes {
        if !out.contains(n) {
            out.push(n.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChunkError;
    use crate::output::{Supplier, TokenUsage, UNKNOWN};

    fn item(sku: Option<&str>, desc: &str, conf: f64, chunk: usize) -> LineItem {
        LineItem {
            sku: sku.map(String::from),
            description: desc.to_string(),
            quantity: Some(1.0),
            unit_price: Some(5.0),
            total: Some(5.0),
            confidence: conf,
            chunk_index: chunk,
        }
    }

    fn result(
        chunk: usize,
        conf: f64,
        tokens: usize,
        po: &str,
        items: Vec<LineItem>,
    ) -> ExtractionResult {
        let mut data = ExtractedData::default();
        data.po_number = po.to_string();
        data.line_items = items;
        ExtractionResult {
            chunk_index: chunk,
            confidence: conf,
            quality_indicators: QualityIndicators::evaluate(&data),
            extracted_data: data,
            field_confidences: BTreeMap::new(),
            issues: Vec::new(),
            suggestions: Vec::new(),
            estimated_tokens: tokens,
            usage: TokenUsage::default(),
            failed: false,
            error: None,
        }
    }

    #[test]
    fn empty_input_gives_default() {
        let agg = aggregate(&[]);
        assert_eq!(agg.confidence, 0.0);
        assert_eq!(agg.extracted_data.po_number, UNKNOWN);
        assert!(agg.chunk_indices.is_empty());
    }

    #[test]
    fn same_sku_keeps_higher_confidence_item() {
        let a = result(0, 0.9, 100, "PO-1", vec![item(Some("A1"), "Widget", 0.9, 0)]);
        let b = result(1, 0.6, 100, UNKNOWN, vec![item(Some("A1"), "widget ", 0.6, 1)]);
        let agg = aggregate(&[a, b]);
        assert_eq!(agg.extracted_data.line_items.len(), 1);
        let li = &agg.extracted_data.line_items[0];
        assert_eq!(li.description, "Widget");
        assert_eq!(li.confidence, 0.9);
        assert_eq!(li.chunk_index, 0);
    }

    #[test]
    fn description_key_when_sku_missing() {
        let a = result(0, 0.7, 10, "PO-1", vec![item(None, "Hex  Bolt", 0.5, 0)]);
        let b = result(1, 0.7, 10, UNKNOWN, vec![item(None, "hex bolt", 0.8, 1)]);
        let agg = aggregate(&[a, b]);
        assert_eq!(agg.extracted_data.line_items.len(), 1);
        assert_eq!(agg.extracted_data.line_items[0].chunk_index, 1);
    }

    #[test]
    fn item_tie_goes_to_earlier_chunk() {
        let a = result(0, 0.7, 10, "PO-1", vec![item(Some("Z9"), "First", 0.7, 0)]);
        let b = result(1, 0.7, 10, UNKNOWN, vec![item(Some("z9"), "Second", 0.7, 1)]);
        let agg = aggregate(&[b, a]);
        assert_eq!(agg.extracted_data.line_items[0].description, "First");
    }

    #[test]
    fn lower_confidence_duplicate_is_absorbed() {
        let a = result(0, 0.9, 200, "PO-9", vec![item(Some("A1"), "Widget", 0.9, 0)]);
        let mut dup = result(1, 0.5, 50, "po-9", vec![item(Some("a1"), "widget", 0.5, 1)]);
        dup.issues.push("blurry scan".into());
        assert_eq!(aggregate(&[a.clone(), dup]), aggregate(&[a]));
    }

    #[test]
    fn empty_results_are_not_collapsed() {
        let a = result(0, 0.9, 1000, "PO-1", vec![item(Some("A1"), "Widget", 0.9, 0)]);
        let terms = result(1, 0.0, 1000, UNKNOWN, Vec::new());
        let signature = result(2, 0.0, 1000, UNKNOWN, Vec::new());
        let agg = aggregate(&[a, terms, signature]);
        assert_eq!(agg.chunk_indices, vec![0, 1, 2]);
        assert!((agg.confidence - 0.3).abs() < 1e-9);
        assert_eq!(agg.extracted_data.line_items.len(), 1);
    }

    #[test]
    fn header_vote_then_confidence_then_chunk_index() {
        let r0 = result(0, 0.6, 10, "PO-100", vec![]);
        let r1 = result(1, 0.9, 10, "PO-200", vec![item(Some("X"), "x", 0.9, 1)]);
        let r2 = result(2, 0.5, 10, "PO-100", vec![item(Some("Y"), "y", 0.5, 2)]);
        // Two votes beat one higher-confidence vote.
        assert_eq!(aggregate(&[r0.clone(), r1.clone(), r2]).extracted_data.po_number, "PO-100");
        // One vote each: highest backing confidence wins.
        assert_eq!(aggregate(&[r0.clone(), r1]).extracted_data.po_number, "PO-200");
        // Full tie: lowest chunk index.
        let r3 = result(3, 0.6, 10, "PO-300", vec![item(Some("Q"), "q", 0.6, 3)]);
        assert_eq!(aggregate(&[r3, r0]).extracted_data.po_number, "PO-100");
    }

    #[test]
    fn unknown_values_do_not_vote() {
        let r0 = result(0, 0.2, 10, "PO-5", vec![]);
        let r1 = result(1, 0.9, 10, UNKNOWN, vec![item(Some("X"), "x", 0.9, 1)]);
        let r2 = result(2, 0.9, 10, UNKNOWN, vec![item(Some("Y"), "y", 0.9, 2)]);
        assert_eq!(aggregate(&[r0, r1, r2]).extracted_data.po_number, "PO-5");
    }

    #[test]
    fn supplier_comes_whole_from_the_winner() {
        let mut r0 = result(0, 0.9, 10, "PO-1", vec![]);
        r0.extracted_data.supplier = Supplier {
            name: "Acme".into(),
            email: Some("a@acme.test".into()),
            phone: None,
            address: None,
        };
        let mut r1 = result(1, 0.4, 10, UNKNOWN, vec![item(Some("X"), "x", 0.4, 1)]);
        r1.extracted_data.supplier = Supplier {
            name: "ACME Ltd".into(),
            email: None,
            phone: Some("555".into()),
            address: None,
        };
        let agg = aggregate(&[r0, r1]);
        assert_eq!(agg.extracted_data.supplier.name, "Acme");
        assert_eq!(agg.extracted_data.supplier.phone, None);
    }

    #[test]
    fn confidence_is_token_weighted() {
        let a = result(0, 1.0, 300, "PO-1", vec![item(Some("A"), "a", 1.0, 0)]);
        let b = result(1, 0.0, 100, UNKNOWN, vec![item(Some("B"), "b", 0.0, 1)]);
        let agg = aggregate(&[a, b]);
        assert!((agg.confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn zero_weights_fall_back_to_plain_mean() {
        let a = result(0, 0.8, 0, "PO-1", vec![item(Some("A"), "a", 0.8, 0)]);
        let b = result(1, 0.4, 0, UNKNOWN, vec![item(Some("B"), "b", 0.4, 1)]);
        assert!((aggregate(&[a, b]).confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn failed_results_count_against_confidence_but_not_data() {
        let good = result(0, 0.8, 100, "PO-1", vec![item(Some("A"), "a", 0.8, 0)]);
        let bad = ExtractionResult::failed(
            1,
            100,
            ChunkError::MissingFunctionCall {
                chunk: 1,
                expected: "extract_po_line_items".into(),
            },
            TokenUsage::default(),
        );
        let agg = aggregate(&[good, bad]);
        assert!((agg.confidence - 0.4).abs() < 1e-9);
        assert_eq!(agg.extracted_data.po_number, "PO-1");
        assert_eq!(agg.chunk_indices, vec![0, 1]);
        assert_eq!(agg.issues.len(), 1);
    }

    #[test]
    fn notes_union_preserves_order_and_field_confidence_takes_max() {
        let mut a = result(0, 0.8, 10, "PO-1", vec![]);
        a.issues = vec!["one".into(), "two".into()];
        a.field_confidences.insert("poNumber".into(), 0.7);
        let mut b = result(1, 0.8, 10, UNKNOWN, vec![item(Some("A"), "a", 0.8, 1)]);
        b.issues = vec!["two".into(), "three".into()];
        b.field_confidences.insert("poNumber".into(), 0.9);
        let agg = aggregate(&[a, b]);
        assert_eq!(agg.issues, vec!["one", "two", "three"]);
        assert_eq!(agg.field_confidences["poNumber"], 0.9);
    }

    #[test]
    fn aggregation_is_deterministic() {
        let rs = vec![
            result(1, 0.5, 10, "PO-2", vec![item(Some("A"), "a", 0.5, 1)]),
            result(0, 0.5, 10, "PO-1", vec![item(Some("B"), "b", 0.5, 0)]),
        ];
        assert_eq!(aggregate(&rs), aggregate(&rs));
        assert_eq!(aggregate(&rs).chunk_indices, vec![0, 1]);
    }
}
