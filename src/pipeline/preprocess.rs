//! Text preprocessing: normalise extracted document text before prompting.
//!
//! Text pulled from a PDF text layer or a vision transcription is noisy:
//! every page repeats the letterhead and a "Page 3 of 7" footer, table
//! columns are padded with runs of spaces, and invisible Unicode leaks in
//! from the producer. None of it helps the model and all of it costs tokens
//! and chunk budget.
//!
//! ## Rule Order
//!
//! Binary detection runs first so garbage never reaches the regexes; line
//! endings are normalised before any line-based rule; page artifacts are
//! removed before whitespace collapsing so the blank lines they leave behind
//! are folded too. Anchor extraction runs last, on clean text.
//!
//! The module is fail-soft from the caller's point of view: [`preprocess`]
//! returns a `Result`, and [`crate::parse`] falls back to the raw text when
//! it is `Err`.

use crate::config::PreprocessOptions;
use crate::error::PreprocessError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Marker line inserted where anchor extraction dropped text.
pub const ELISION_MARKER: &str = "[...]";

/// Output of [`preprocess`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessedText {
    pub text: String,
    /// Length of the raw input, in chars.
    pub original_length: usize,
    /// Length of `text`, in chars.
    pub optimized_length: usize,
    /// `100 * (1 - optimized / original)`, 0 for empty input.
    pub reduction_percent: f64,
    /// Present when anchor extraction was enabled and eligible.
    pub anchor_extraction: Option<AnchorExtraction>,
}

/// Report of an anchor-extraction pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnchorExtraction {
    /// Whether the anchored text replaced the normalised text.
    pub applied: bool,
    /// Number of lines that matched a high-signal pattern.
    pub anchor_count: usize,
    /// Number of contiguous snippets kept.
    pub snippet_count: usize,
    /// Distinct labels that matched, in first-seen order.
    pub labels: Vec<String>,
    /// Length of the anchored text in chars (whether applied or not).
    pub anchored_length: usize,
}

/// Normalise `raw` according to `options`.
///
/// # Errors
/// [`PreprocessError::BinaryContent`] for input that is mostly control
/// characters, [`PreprocessError::EmptyOutput`] when the rules remove every
/// character of a non-blank input.
pub fn preprocess(
    raw: &str,
    options: &PreprocessOptions,
) -> Result<PreprocessedText, PreprocessError> {
    let original_length = raw.chars().count();
    reject_binary(raw, original_length)?;

    let s = normalise_line_endings(raw);
    let s = remove_invisible_chars(&s);
    let s = if options.strip_page_artifacts {
        strip_page_artifacts(&s)
    } else {
        s
    };
    let s = if options.strip_repeated_lines {
        strip_repeated_lines(&s, options.repeated_line_threshold.max(2))
    } else {
        s
    };
    let mut text = collapse_whitespace(&s);

    if text.is_empty() && !raw.trim().is_empty() {
        return Err(PreprocessError::EmptyOutput { original_length });
    }

    let mut anchor_extraction = None;
    if options.anchor_extraction && text.chars().count() >= options.anchor_min_chars {
        let (anchored, mut report) = extract_anchors(&text, options.anchor_context_lines);
        if report.anchor_count > 0 && report.anchored_length < text.chars().count() {
            report.applied = true;
            text = anchored;
        }
        anchor_extraction = Some(report);
    }

    let optimized_length = text.chars().count();
    let reduction_percent = if original_length == 0 {
        0.0
    } else {
        let ratio = 1.0 - optimized_length as f64 / original_length as f64;
        (ratio * 1000.0).round() / 10.0
    };

    Ok(PreprocessedText {
        text,
        original_length,
        optimized_length,
        reduction_percent,
        anchor_extraction,
    })
}

// ── Binary detection ─────────────────────────────────────────────────────

fn reject_binary(raw: &str, total_chars: usize) -> Result<(), PreprocessError> {
    if total_chars == 0 {
        return Ok(());
    }
    let control_chars = raw
        .chars()
        .filter(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t' | '\u{000C}'))
        .count();
    if control_chars * 10 > total_chars {
        return Err(PreprocessError::BinaryContent {
            control_chars,
            total_chars,
        });
    }
    Ok(())
}

// ── Line endings and invisible characters ────────────────────────────────

/// CRLF/CR become LF; form feeds (page breaks from the PDF decoder) become
/// a blank line so page artifacts sit on their own lines.
fn normalise_line_endings(input: &str) -> String {
    input
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\u{000C}', "\n\n")
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Page artifacts ───────────────────────────────────────────────────────

static RE_PAGE_ARTIFACT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?:page\s+\d+(?:\s*(?:of|/)\s*\d+)?|\d+\s*/\s*\d+|-\s*\d+\s*-|\[\s*page\s+\d+\s*\])\s*$",
    )
    .unwrap()
});

fn strip_page_artifacts(input: &str) -> String {
    input
        .lines()
        .filter(|line| !RE_PAGE_ARTIFACT.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Drop running headers/footers: short, digit-free lines that appear at
/// least `threshold` times. The first occurrence is kept so the letterhead
/// (often the supplier name) is still visible to the model.
fn strip_repeated_lines(input: &str, threshold: usize) -> String {
    let candidate = |line: &str| {
        let t = line.trim();
        !t.is_empty() && t.chars().count() <= 80 && !t.chars().any(|c| c.is_ascii_digit())
    };

    let mut counts: HashMap<String, usize> = HashMap::new();
    for line in input.lines().filter(|l| candidate(l)) {
        *counts.entry(fold_line(line)).or_insert(0) += 1;
    }

    let mut seen: HashMap<String, bool> = HashMap::new();
    input
        .lines()
        .filter(|line| {
            if !candidate(line) {
                return true;
            }
            let key = fold_line(line);
            if counts.get(&key).copied().unwrap_or(0) < threshold {
                return true;
            }
            // Keep only the first occurrence.
            seen.insert(key, true).is_none()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn fold_line(line: &str) -> String {
    line.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// ── Whitespace ───────────────────────────────────────────────────────────

static RE_INLINE_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\u{00A0}]+").unwrap());
static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_whitespace(input: &str) -> String {
    let lines: Vec<String> = input
        .lines()
        .map(|line| RE_INLINE_SPACE.replace_all(line, " ").trim().to_string())
        .collect();
    let joined = lines.join("\n");
    RE_BLANK_LINES
        .replace_all(&joined, "\n\n")
        .trim()
        .to_string()
}

// ── Anchor extraction ────────────────────────────────────────────────────

/// High-signal patterns with the label reported for each.
static ANCHOR_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "po_number",
            Regex::new(r"(?i)\b(?:p\.?\s?o\.?\s*(?:#|no\.?|number)?|purchase\s+order)\b").unwrap(),
        ),
        (
            "supplier",
            Regex::new(r"(?i)\b(?:supplier|vendor|sold\s+by|remit\s+to)\b").unwrap(),
        ),
        (
            "address",
            Regex::new(r"(?i)\b(?:bill\s+to|ship\s+to|deliver\s+to)\b").unwrap(),
        ),
        (
            "date",
            Regex::new(r"(?i)\b(?:order\s+date|date|delivery|due|ship\s+by)\b").unwrap(),
        ),
        (
            "totals",
            Regex::new(r"(?i)\b(?:sub\s?total|total|tax|vat|shipping|freight|amount\s+due)\b")
                .unwrap(),
        ),
        (
            "amount",
            Regex::new(r"(?:[$€£]\s?\d[\d,]*(?:\.\d{1,2})?|\b\d[\d,]*\.\d{2}\b)").unwrap(),
        ),
    ]
});

/// Keep every line within `context` lines of an anchor line and replace each
/// gap with a single [`ELISION_MARKER`] line.
fn extract_anchors(text: &str, context: usize) -> (String, AnchorExtraction) {
    let lines: Vec<&str> = text.lines().collect();
    let mut keep = vec![false; lines.len()];
    let mut labels: Vec<String> = Vec::new();
    let mut anchor_count = 0;

    for (i, line) in lines.iter().enumerate() {
        let mut is_anchor = false;
        for (label, re) in ANCHOR_PATTERNS.iter() {
            if re.is_match(line) {
                is_anchor = true;
                if !labels.iter().any(|l| l == label) {
                    labels.push(label.to_string());
                }
            }
        }
        if is_anchor {
            anchor_count += 1;
            let lo = i.saturating_sub(context);
            let hi = (i + context).min(lines.len().saturating_sub(1));
            for k in keep.iter_mut().take(hi + 1).skip(lo) {
                *k = true;
            }
        }
    }

    let mut out: Vec<&str> = Vec::new();
    let mut snippet_count = 0;
    let mut in_gap = false;
    for (line, kept) in lines.iter().zip(keep.iter()) {
        if *kept {
            if out.is_empty() || in_gap {
                snippet_count += 1;
            }
            out.push(line);
            in_gap = false;
        } else if !in_gap {
            if !out.is_empty() {
                out.push(ELISION_MARKER);
            }
            in_gap = true;
        }
    }
    // A trailing marker carries no information.
    if out.last() == Some(&ELISION_MARKER) {
        out.pop();
    }

    let anchored = out.join("\n");
    let report = AnchorExtraction {
        applied: false,
        anchor_count,
        snippet_count,
        labels,
        anchored_length: anchored.chars().count(),
    };
    (anchored, report)
}
