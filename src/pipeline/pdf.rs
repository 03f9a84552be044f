//! PDF text-layer extraction via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and does CPU-bound work. Every call runs on the blocking pool so a
//! large PDF never stalls the workers driving other documents.
//!
//! ## Why form feeds between pages?
//!
//! Pages are joined with `\f`. The preprocessor turns form feeds into page
//! breaks and strips the per-page headers, footers and page numbers that
//! surround them, so a purchase order that spills over several pages reads
//! as one continuous item table.
//!
//! ## Binding
//!
//! The pdfium library is loaded at runtime: `PDFIUM_LIB_PATH` when set, else
//! the working directory, else the system library search path.

use crate::error::PipelineError;
use pdfium_render::prelude::*;
use tracing::{debug, info};

/// Page separator in extracted text.
pub const PAGE_BREAK: char = '\u{000C}';

/// Bind the pdfium shared library.
fn bind_pdfium() -> Result<Pdfium, PdfiumError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(path) if !path.is_empty() => Pdfium::bind_to_library(path)?,
        _ => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library())?,
    };
    Ok(Pdfium::new(bindings))
}

/// Extract the text layer of every page, joined with [`PAGE_BREAK`].
///
/// # Errors
/// [`PipelineError::DocumentDecodeFailed`] when pdfium is unavailable, the
/// file cannot be opened, or no page carries any text (a scanned PDF).
pub async fn extract_text(bytes: Vec<u8>, file_name: &str) -> Result<String, PipelineError> {
    let name = file_name.to_string();
    tokio::task::spawn_blocking(move || extract_text_blocking(&bytes, &name))
        .await
        .map_err(|e| PipelineError::Internal(format!("PDF text task panicked: {}", e)))?
}

fn extract_text_blocking(bytes: &[u8], file_name: &str) -> Result<String, PipelineError> {
    let failed = |detail: String| PipelineError::DocumentDecodeFailed {
        file_name: file_name.to_string(),
        detail,
    };

    let pdfium = bind_pdfium().map_err(|e| failed(format!("pdfium library unavailable: {:?}", e)))?;
    let document = pdfium.load_pdf_from_byte_slice(bytes, None).map_err(|e| {
        let err_str = format!("{:?}", e);
        if err_str.contains("Password") || err_str.contains("password") {
            failed("PDF is password-protected".to_string())
        } else {
            failed(err_str)
        }
    })?;

    let pages = document.pages();
    info!("PDF loaded: {} pages", pages.len());

    let mut texts = Vec::with_capacity(pages.len() as usize);
    for (idx, page) in pages.iter().enumerate() {
        let text = page
            .text()
            .map_err(|e| failed(format!("page {}: {:?}", idx + 1, e)))?
            .all();
        debug!("Page {}: {} chars of text", idx + 1, text.chars().count());
        texts.push(text);
    }

    join_pages(&texts).ok_or_else(|| failed("PDF has no text layer".to_string()))
}

/// Join page texts with form feeds; `None` when every page is blank.
fn join_pages(pages: &[String]) -> Option<String> {
    if pages.iter().all(|p| p.trim().is_empty()) {
        return None;
    }
    let separator = PAGE_BREAK.to_string();
    Some(
        pages
            .iter()
            .map(|p| p.trim_end())
            .collect::<Vec<_>>()
            .join(&separator),
    )
}
