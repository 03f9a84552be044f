//! Chunk planning: split normalised text into model-sized, overlapping slices.
//!
//! The plan is a pure function of the text and [`ChunkConfig`]. Each chunk
//! owns a *body* (a slice of the text that no other chunk's body covers) and,
//! for every chunk after the first, an *overlap*: the characters immediately
//! preceding its body. Bodies partition the text, so concatenating them
//! reproduces it exactly; overlaps only exist so that a line item cut in
//! half by a boundary is seen whole by at least one call.
//!
//! All lengths are counted in Unicode scalar values (`char`s), never bytes,
//! so a document full of accented supplier names is planned the same way as
//! an ASCII one.

use crate::config::ChunkConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Separators tried (in order) when choosing where a body ends.
const BREAKS: [&str; 4] = ["\n\n", "\n", ". ", " "];

/// One slice of the document submitted as one extraction call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    /// Overlap followed by body.
    pub text: String,
    /// `text` length in chars (overlap included).
    pub length: usize,
    /// Number of leading chars of `text` repeated from the previous chunk.
    pub overlap: usize,
    pub estimated_tokens: usize,
    /// Char offset of the body start in the source text.
    pub start: usize,
    /// Char offset one past the body end.
    pub end: usize,
}

impl Chunk {
    /// The part of `text` not shared with the previous chunk.
    pub fn body(&self) -> &str {
        match self.text.char_indices().nth(self.overlap) {
            Some((byte, _)) => &self.text[byte..],
            None => "",
        }
    }
}

/// Ordered chunks for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub chunks: Vec<Chunk>,
    /// The chunk size actually used; larger than the configured one when the
    /// plan had to be grown to respect `max_chunks`.
    pub effective_max_chunk_chars: usize,
    pub grown: bool,
}

impl ChunkPlan {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// True when the whole document fits in one call.
    pub fn is_single(&self) -> bool {
        self.chunks.len() == 1
    }

    pub fn total_estimated_tokens(&self) -> usize {
        self.chunks.iter().map(|c| c.estimated_tokens).sum()
    }

    /// Concatenate chunk bodies; equals the planned text.
    pub fn reconstruct(&self) -> String {
        self.chunks.iter().map(|c| c.body()).collect()
    }
}

/// Fast token estimate: one token per four characters, rounded up.
///
/// Used only to weight chunk confidences; providers enforce their own limits.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Plan the chunks for `text`.
///
/// Texts of at most `max_chunk_chars` characters yield a single chunk with no
/// overlap. Longer texts are cut at the last paragraph break, line break,
/// sentence end or space inside the allowed window, falling back to a hard
/// cut. When the result would exceed `max_chunks`, the chunk size grows until
/// it fits.
pub fn plan(text: &str, config: &ChunkConfig) -> ChunkPlan {
    let offsets = char_offsets(text);
    let total = offsets.len() - 1;
    let configured = config.max_chunk_chars.max(1);

    if total <= configured {
        return ChunkPlan {
            chunks: vec![make_chunk(text, &offsets, 0, 0, total, 0)],
            effective_max_chunk_chars: configured,
            grown: false,
        };
    }

    let max_chunks = config.max_chunks.max(1);
    let floor = total.div_ceil(max_chunks) + config.overlap_chars;
    let mut effective = configured;

    let spans = loop {
        let spans = split(text, &offsets, effective, config.min_chunk_chars, config.overlap_chars);
        if spans.len() <= max_chunks || effective >= total {
            break spans;
        }
        let next = (effective + effective / 4).max(floor).max(effective + 1);
        debug!(
            "Chunk plan has {} chunks (cap {}), growing chunk size {} → {}",
            spans.len(),
            max_chunks,
            effective,
            next
        );
        effective = next;
    };

    let chunks = spans
        .iter()
        .enumerate()
        .map(|(i, &(start, end, overlap))| make_chunk(text, &offsets, i, start, end, overlap))
        .collect();

    ChunkPlan {
        chunks,
        effective_max_chunk_chars: effective,
        grown: effective != configured,
    }
}

/// Byte offset of every char plus a trailing `text.len()`.
fn char_offsets(text: &str) -> Vec<usize> {
    text.char_indices()
        .map(|(b, _)| b)
        .chain(std::iter::once(text.len()))
        .collect()
}

fn make_chunk(
    text: &str,
    offsets: &[usize],
    index: usize,
    start: usize,
    end: usize,
    overlap: usize,
) -> Chunk {
    let slice = &text[offsets[start - overlap]..offsets[end]];
    Chunk {
        index,
        text: slice.to_string(),
        length: end - start + overlap,
        overlap,
        estimated_tokens: estimate_tokens(slice),
        start,
        end,
    }
}

/// Compute `(body_start, body_end, overlap)` spans for a given chunk size.
fn split(
    text: &str,
    offsets: &[usize],
    max_chars: usize,
    min_chars: usize,
    overlap_chars: usize,
) -> Vec<(usize, usize, usize)> {
    let total = offsets.len() - 1;
    // The body must always have room to advance.
    let overlap_chars = overlap_chars.min(max_chars.saturating_sub(1) / 2);
    let tail_floor = min_chars.saturating_sub(overlap_chars);

    let mut spans = Vec::new();
    let mut start = 0;
    while start < total {
        let overlap = if start == 0 { 0 } else { overlap_chars.min(start) };
        let max_body = max_chars - overlap;
        if total - start <= max_body {
            spans.push((start, total, overlap));
            break;
        }
        let min_body = min_chars.saturating_sub(overlap).clamp(1, max_body);
        let hard = start + max_body;
        let mut hi = hard;
        if total - hard < tail_floor {
            // Pull the cut back so the last chunk reaches `min_chars`; when
            // the rest cannot hold two such chunks, split it evenly.
            hi = total
                .saturating_sub(tail_floor)
                .max(start + (total - start) / 2)
                .min(hard);
        }
        let lo = (start + min_body).min(hi);
        let cut = find_break(text, offsets, lo, hi).unwrap_or(hi);
        spans.push((start, cut, overlap));
        start = cut;
    }
    spans
}

/// Char index just past the preferred separator within `[lo, hi]`.
fn find_break(text: &str, offsets: &[usize], lo: usize, hi: usize) -> Option<usize> {
    if lo >= hi {
        return None;
    }
    let window = &text[offsets[lo]..offsets[hi]];
    BREAKS.iter().find_map(|sep| {
        window.rfind(sep).map(|pos| {
            let byte = offsets[lo] + pos + sep.len();
            // Separators are ASCII, so `byte` is always a char boundary.
            match offsets.binary_search(&byte) {
                Ok(idx) => idx,
                Err(idx) => idx,
            }
        })
    })
}
