//! Document decoding: raw bytes → plain text for the parse.
//!
//! | MIME type | Decoder |
//! |-----------|---------|
//! | `text/*`, `application/json`, `application/csv` | UTF-8 (lossy) |
//! | `application/pdf` | pdfium text layer, pages joined with form feeds |
//! | `image/*` | vision-model transcription |
//!
//! Anything else is [`PipelineError::UnsupportedDocument`].

use crate::config::ExtractionConfig;
use crate::error::PipelineError;
use crate::pipeline::input::RawDocument;
use crate::pipeline::{encode, llm, pdf};
use async_trait::async_trait;
use edgequake_llm::LLMProvider;
use std::sync::Arc;
use tracing::{debug, info};

/// What a MIME type decodes as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Text,
    Pdf,
    Image,
    Unsupported,
}

impl DocumentKind {
    pub fn of(mime_type: &str) -> Self {
        let mime = mime_type.trim().to_ascii_lowercase();
        match mime.as_str() {
            "application/pdf" => DocumentKind::Pdf,
            "application/json" | "application/csv" => DocumentKind::Text,
            m if m.starts_with("text/") => DocumentKind::Text,
            m if m.starts_with("image/") => DocumentKind::Image,
            _ => DocumentKind::Unsupported,
        }
    }
}

/// Turns a [`RawDocument`] into text.
#[async_trait]
pub trait DocumentDecoder: Send + Sync {
    async fn decode(&self, document: &RawDocument) -> Result<String, PipelineError>;
}

/// Text, PDF and (with a vision provider) image decoding.
#[derive(Default)]
pub struct StandardDecoder {
    vision: Option<(Arc<dyn LLMProvider>, ExtractionConfig)>,
}

impl StandardDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable image transcription through `provider`.
    pub fn with_vision(mut self, provider: Arc<dyn LLMProvider>, config: ExtractionConfig) -> Self {
        self.vision = Some((provider, config));
        self
    }
}

#[async_trait]
impl DocumentDecoder for StandardDecoder {
    async fn decode(&self, document: &RawDocument) -> Result<String, PipelineError> {
        let kind = DocumentKind::of(&document.mime_type);
        debug!(
            "Decoding '{}' ({}, {} bytes) as {:?}",
            document.file_name,
            document.mime_type,
            document.bytes.len(),
            kind
        );

        let text = match kind {
            DocumentKind::Text => String::from_utf8_lossy(&document.bytes).into_owned(),
            DocumentKind::Pdf => {
                pdf::extract_text(document.bytes.clone(), &document.file_name).await?
            }
            DocumentKind::Image => {
                let (provider, config) =
                    self.vision
                        .as_ref()
                        .ok_or_else(|| PipelineError::DocumentDecodeFailed {
                            file_name: document.file_name.clone(),
                            detail: "no vision model configured for image uploads".to_string(),
                        })?;
                let image = encode::encode_image(&document.bytes).map_err(|e| {
                    PipelineError::DocumentDecodeFailed {
                        file_name: document.file_name.clone(),
                        detail: format!("image decoding failed: {}", e),
                    }
                })?;
                llm::transcribe_image(provider, image, config).await?
            }
            DocumentKind::Unsupported => {
                return Err(PipelineError::UnsupportedDocument {
                    file_name: document.file_name.clone(),
                    mime_type: document.mime_type.clone(),
                })
            }
        };

        info!(
            "Decoded '{}': {} chars of text",
            document.file_name,
            text.chars().count()
        );
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_by_mime_type() {
        assert_eq!(DocumentKind::of("text/plain"), DocumentKind::Text);
        assert_eq!(DocumentKind::of("text/csv"), DocumentKind::Text);
        assert_eq!(DocumentKind::of("application/json"), DocumentKind::Text);
        assert_eq!(DocumentKind::of("Application/PDF"), DocumentKind::Pdf);
        assert_eq!(DocumentKind::of("image/jpeg"), DocumentKind::Image);
        assert_eq!(DocumentKind::of("application/zip"), DocumentKind::Unsupported);
    }

    #[tokio::test]
    async fn text_is_decoded_lossily() {
        let doc = RawDocument::new("po.txt", "text/plain", b"PO-1\xFF".to_vec());
        let text = StandardDecoder::new().decode(&doc).await.unwrap();
        assert!(text.starts_with("PO-1"));
    }

    #[tokio::test]
    async fn unsupported_type_is_rejected() {
        let doc = RawDocument::new("po.zip", "application/zip", vec![0x50, 0x4B]);
        let err = StandardDecoder::new().decode(&doc).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedDocument { .. }));
    }

    #[tokio::test]
    async fn images_need_a_vision_model() {
        let doc = RawDocument::new("po.png", "image/png", vec![0x89, b'P', b'N', b'G']);
        let err = StandardDecoder::new().decode(&doc).await.unwrap_err();
        assert!(matches!(err, PipelineError::DocumentDecodeFailed { .. }));
    }
}
