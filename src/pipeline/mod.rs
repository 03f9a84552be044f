//! Pipeline stages for purchase-order extraction.
//!
//! Each submodule implements one step, so each can be tested on its own and
//! swapped (a different decoder, a mock model) without touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ decode ──▶ preprocess ──▶ chunk ──▶ extract ──▶ aggregate
//! (path/URL) (pdf/image) (normalise)  (split)   (LLM × N)   (merge)
//! ```
//!
//! 1. [`input`]      resolve a path or URL to bytes plus a MIME type
//! 2. [`decode`]     bytes to text; [`pdf`] reads the text layer in
//!    `spawn_blocking`, images go through [`encode`] and a vision model
//! 3. [`preprocess`] whitespace and OCR-noise cleanup, optional anchors
//! 4. [`chunk`]      split on line-item boundaries with overlap
//! 5. [`extract`]    one structured call per chunk with retry/backoff; the
//!    only stage with network I/O besides decoding, via [`llm`]
//! 6. [`aggregate`]  merge per-chunk results into one document
//!
//! The orchestration of these steps lives in [`crate::parse`].

pub mod aggregate;
pub mod chunk;
pub mod decode;
pub mod encode;
pub mod extract;
pub mod input;
pub mod llm;
pub mod pdf;
pub mod preprocess;
