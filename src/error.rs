//! Error types for the po-extract library.
//!
//! Three distinct error types reflect three distinct failure modes:
//!
//! * [`PipelineError`]: **Fatal for the attempt**: the document cannot be
//!   processed right now (configuration missing, download failed, every
//!   extraction call failed). Returned as `Err(PipelineError)` from
//!   [`crate::parse::parse_document`] and the workflow orchestrator, which
//!   marks the workflow failed and lets the queue decide about retries.
//!
//! * [`ChunkError`]: **Non-fatal**: one extraction call failed or returned
//!   something unusable. Stored inside [`crate::output::ExtractionResult`]
//!   as a zero-confidence result plus an issue string.
//!
//! * [`PreprocessError`]: **Non-fatal**: normalisation could not be applied;
//!   the pipeline falls back to the raw text.

use thiserror::Error;

/// Coarse classification used by the retry policy and by callers that only
/// need to know whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Download, network, model API or store I/O. Retryable by the queue.
    TransientIo,
    /// The model returned unparsable or schema-mismatched output.
    MalformedExtraction,
    /// No AI settings for the merchant. Needs operator intervention.
    ConfigurationMissing,
    /// Text normalisation failed; raw text was used instead.
    PreprocessingFailure,
    /// The parse exceeded its time budget.
    Timeout,
    /// The input itself cannot be processed (unsupported or undecodable).
    InvalidInput,
    /// Bug or broken invariant.
    Internal,
}

/// All fatal errors returned by the po-extract library.
///
/// Chunk-level failures use [`ChunkError`] and are stored in
/// [`crate::output::ExtractionResult`] rather than propagated here.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Records / configuration ───────────────────────────────────────────
    /// The upload referenced by a job does not exist.
    #[error("Upload '{upload_id}' not found")]
    UploadNotFound { upload_id: String },

    /// No AI settings are stored for the merchant.
    #[error("No AI settings configured for merchant '{merchant_id}'")]
    ConfigurationMissing { merchant_id: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Input ─────────────────────────────────────────────────────────────
    /// Download failed (connection error, non-2xx status).
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// The document type has no decoder.
    #[error("Unsupported document type '{mime_type}' for '{file_name}'")]
    UnsupportedDocument { file_name: String, mime_type: String },

    /// The document was recognised but no text could be obtained from it.
    #[error("Could not read text from '{file_name}': {detail}")]
    DocumentDecodeFailed { file_name: String, detail: String },

    // ── Extraction ────────────────────────────────────────────────────────
    /// Every extraction call failed at the transport level.
    #[error("All {total} extraction calls failed.\nFirst error: {first_error}")]
    ExtractionUnavailable { total: usize, first_error: String },

    /// The whole parse exceeded `parse_timeout_secs`.
    #[error("Document parse timed out after {secs}s")]
    ParseTimeout { secs: u64 },

    // ── Workflow state ────────────────────────────────────────────────────
    /// The state store rejected a read or write.
    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    /// A stage transition would violate stage ordering.
    #[error("Workflow '{workflow_id}': cannot move from '{from}' to '{to}'")]
    InvalidStageTransition {
        workflow_id: String,
        from: String,
        to: String,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Map this error to its [`ErrorClass`].
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::DownloadFailed { .. }
            | PipelineError::DownloadTimeout { .. }
            | PipelineError::ExtractionUnavailable { .. }
            | PipelineError::Store(_) => ErrorClass::TransientIo,
            PipelineError::ConfigurationMissing { .. }
            | PipelineError::ProviderNotConfigured { .. }
            | PipelineError::InvalidConfig(_) => ErrorClass::ConfigurationMissing,
            PipelineError::ParseTimeout { .. } => ErrorClass::Timeout,
            PipelineError::UploadNotFound { .. }
            | PipelineError::UnsupportedDocument { .. }
            | PipelineError::DocumentDecodeFailed { .. } => ErrorClass::InvalidInput,
            PipelineError::InvalidStageTransition { .. } | PipelineError::Internal(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// Whether another attempt (scheduled by the queue transport) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::TransientIo | ErrorClass::Timeout)
    }
}

/// A non-fatal error for a single extraction call.
///
/// Stored alongside [`crate::output::ExtractionResult`] when a call fails.
/// The parse continues unless every call failed at the transport level.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum ChunkError {
    /// The reply carried no recognisable function-call payload.
    #[error("Chunk {chunk}: response has no '{expected}' function call")]
    MissingFunctionCall { chunk: usize, expected: String },

    /// The reply called a different function than the one requested.
    #[error("Chunk {chunk}: expected function '{expected}', got '{actual}'")]
    UnexpectedFunction {
        chunk: usize,
        expected: String,
        actual: String,
    },

    /// The arguments did not deserialize to the expected shape.
    #[error("Chunk {chunk}: malformed function arguments: {detail}")]
    MalformedArguments { chunk: usize, detail: String },

    /// LLM call failed after retries.
    #[error("Chunk {chunk}: LLM call failed after {retries} retries: {detail}")]
    LlmFailed {
        chunk: usize,
        retries: u32,
        detail: String,
    },

    /// LLM call timed out.
    #[error("Chunk {chunk}: LLM call timed out after {secs}s")]
    Timeout { chunk: usize, secs: u64 },
}

impl ChunkError {
    /// True for call failures (network, API, timeout); false for replies
    /// that arrived but could not be used.
    pub fn is_transport(&self) -> bool {
        matches!(self, ChunkError::LlmFailed { .. } | ChunkError::Timeout { .. })
    }

    pub fn class(&self) -> ErrorClass {
        if self.is_transport() {
            ErrorClass::TransientIo
        } else {
            ErrorClass::MalformedExtraction
        }
    }
}

/// Text normalisation could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreprocessError {
    /// The input looks like binary data rather than text.
    #[error("input looks binary: {control_chars} of {total_chars} chars are control characters")]
    BinaryContent {
        control_chars: usize,
        total_chars: usize,
    },

    /// Normalisation removed every character of a non-empty input.
    #[error("normalisation produced empty text from {original_length} input chars")]
    EmptyOutput { original_length: usize },
}

/// Errors raised by a [`crate::workflow::store::StateStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("record '{key}' could not be decoded: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("record '{key}' could not be encoded: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("patch for '{key}' must be a JSON object")]
    InvalidPatch { key: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_missing_is_not_retryable() {
        let e = PipelineError::ConfigurationMissing {
            merchant_id: "m-1".into(),
        };
        assert_eq!(e.class(), ErrorClass::ConfigurationMissing);
        assert!(!e.is_retryable());
        assert!(e.to_string().contains("m-1"));
    }

    #[test]
    fn transient_errors_are_retryable() {
        let e = PipelineError::DownloadTimeout {
            url: "https://files.example/po.pdf".into(),
            secs: 30,
        };
        assert!(e.is_retryable());
        assert!(e.to_string().contains("30s"));

        let e = PipelineError::ExtractionUnavailable {
            total: 3,
            first_error: "HTTP 503".into(),
        };
        assert_eq!(e.class(), ErrorClass::TransientIo);
    }

    #[test]
    fn timeout_is_retryable_but_classified_apart() {
        let e = PipelineError::ParseTimeout { secs: 300 };
        assert_eq!(e.class(), ErrorClass::Timeout);
        assert!(e.is_retryable());
    }

    #[test]
    fn chunk_error_transport_split() {
        let missing = ChunkError::MissingFunctionCall {
            chunk: 2,
            expected: "extract_po_line_items".into(),
        };
        assert!(!missing.is_transport());
        assert_eq!(missing.class(), ErrorClass::MalformedExtraction);
        assert!(missing.to_string().contains("Chunk 2"));

        let timeout = ChunkError::Timeout { chunk: 0, secs: 60 };
        assert!(timeout.is_transport());
    }

    #[test]
    fn store_error_converts() {
        let e: PipelineError = StoreError::Unavailable("redis down".into()).into();
        assert!(e.is_retryable());
        assert!(e.to_string().contains("redis down"));
    }
}
