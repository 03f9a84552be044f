//! Input resolution: fetch raw document bytes and work out what they are.
//!
//! Two ways in:
//!
//! * the workflow reads an upload's `file_url` through a [`FileStore`]
//!   (normally [`HttpFileStore`]);
//! * the CLI and [`crate::extract`] take a local path or an HTTP(S) URL via
//!   [`resolve_input`].
//!
//! Either way the result is a [`RawDocument`]: bytes plus the file name and
//! MIME type the decoder dispatches on. A missing or generic MIME type
//! (`application/octet-stream`) is replaced by one sniffed from magic bytes
//! or the file extension.

use crate::error::PipelineError;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Document bytes with enough context to decode them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDocument {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl RawDocument {
    /// Build a document, sniffing the MIME type when `mime_type` is empty or
    /// generic.
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        let file_name = file_name.into();
        let mime_type = mime_type.into();
        let mime_type = if is_generic_mime(&mime_type) {
            sniff_mime_type(&file_name, &bytes).to_string()
        } else {
            mime_type.trim().to_ascii_lowercase()
        };
        Self {
            file_name,
            mime_type,
            bytes,
        }
    }
}

fn is_generic_mime(mime: &str) -> bool {
    let m = mime.trim();
    m.is_empty() || m.eq_ignore_ascii_case("application/octet-stream")
}

/// Guess a MIME type from magic bytes, then from the file extension.
pub fn sniff_mime_type(file_name: &str, bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"%PDF") {
        return "application/pdf";
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        return "image/png";
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return "image/jpeg";
    }
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "txt" | "text" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Where the workflow downloads upload bytes from.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn download(&self, url: &str) -> Result<Vec<u8>, PipelineError>;
}

/// [`FileStore`] over plain HTTP(S) GET.
#[derive(Debug, Clone)]
pub struct HttpFileStore {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl HttpFileStore {
    pub fn new(timeout_secs: u64) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| PipelineError::Internal(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            timeout_secs,
        })
    }
}

#[async_trait]
impl FileStore for HttpFileStore {
    async fn download(&self, url: &str) -> Result<Vec<u8>, PipelineError> {
        info!("Downloading document from: {}", url);

        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                PipelineError::DownloadTimeout {
                    url: url.to_string(),
                    secs: self.timeout_secs,
                }
            } else {
                PipelineError::DownloadFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        };

        let response = self.client.get(url).send().await.map_err(map_err)?;
        if !response.status().is_success() {
            return Err(PipelineError::DownloadFailed {
                url: url.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let bytes = response.bytes().await.map_err(map_err)?;
        debug!("Downloaded {} bytes", bytes.len());
        Ok(bytes.to_vec())
    }
}

/// Resolve a local path or HTTP(S) URL to a [`RawDocument`].
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<RawDocument, PipelineError> {
    if is_url(input) {
        let bytes = HttpFileStore::new(timeout_secs)?.download(input).await?;
        Ok(RawDocument::new(file_name_from_url(input), "", bytes))
    } else {
        let path = Path::new(input);
        let bytes = tokio::fs::read(path).await.map_err(|e| PipelineError::DocumentDecodeFailed {
            file_name: input.to_string(),
            detail: e.to_string(),
        })?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(input)
            .to_string();
        debug!("Read local document: {} ({} bytes)", path.display(), bytes.len());
        Ok(RawDocument::new(file_name, "", bytes))
    }
}

/// Last path segment of a URL, or `"download"`.
pub fn file_name_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() {
                    return last.to_string();
                }
            }
        }
    }
    "download".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/po.pdf"));
        assert!(is_url("http://example.com/po.pdf"));
        assert!(!is_url("/tmp/po.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn magic_bytes_beat_extension() {
        assert_eq!(sniff_mime_type("scan.txt", b"%PDF-1.7"), "application/pdf");
        assert_eq!(sniff_mime_type("po", &[0xFF, 0xD8, 0xFF, 0xE0]), "image/jpeg");
        assert_eq!(sniff_mime_type("po.CSV", b"sku,qty"), "text/csv");
        assert_eq!(sniff_mime_type("po.bin", b"\x00\x01"), "application/octet-stream");
    }

    #[test]
    fn generic_mime_is_replaced() {
        let doc = RawDocument::new("po.pdf", "application/octet-stream", b"%PDF".to_vec());
        assert_eq!(doc.mime_type, "application/pdf");
        let doc = RawDocument::new("po.txt", "Text/Plain", b"PO".to_vec());
        assert_eq!(doc.mime_type, "text/plain");
    }

    #[test]
    fn file_name_from_url_path() {
        assert_eq!(file_name_from_url("https://files.example/u/42/po-7.pdf?sig=x"), "po-7.pdf");
        assert_eq!(file_name_from_url("https://files.example/"), "download");
    }

    #[tokio::test]
    async fn missing_local_file_is_an_error() {
        let err = resolve_input("/definitely/not/here.pdf", 5).await.unwrap_err();
        assert!(matches!(err, PipelineError::DocumentDecodeFailed { .. }));
    }
}
