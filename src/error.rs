//! Error types for the expense-bundle library.
//!
//! Two channels reflect two distinct failure modes:
//!
//! * [`PipelineError`]: **Fatal**: the request cannot proceed at all
//!   (malformed input shape, template missing, final write failed). Rendered
//!   into the response's `error` field as an [`ErrorPayload`] and halts the
//!   remaining work for that request only.
//!
//! * [`Warning`]: **Non-fatal**: one item failed (download glitch, corrupt
//!   image) or a best-effort side step failed, but every other item is fine.
//!   Warnings accumulate across the whole request; [`crate::aggregate`]
//!   decides afterwards whether any of them counts as a hard failure.
//!
//! Collaborator traits return [`CollaboratorError`]; the extraction backend
//! returns [`BackendError`], whose text drives retry classification.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

// ── Wire codes ───────────────────────────────────────────────────────────

/// Code carried by a non-fatal [`Warning`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningCode {
    /// A source item could not be downloaded; its index is dropped.
    DownloadFailed,
    /// An inline file's base64 payload did not decode.
    DecodeFailed,
    /// Decoding/transcoding/uploading an item failed.
    NormalizationFailed,
    /// Extension or mime type the pipeline does not handle.
    UnsupportedFileType,
    /// `pdfMode=rasterize` was requested; the PDF was kept as-is.
    PdfRasterizeNotImplemented,
    OriginalUploadFailed,
    ManifestWriteFailed,
    /// One finalize item could not be fetched or merged.
    PdfMergeFailed,
    SignedUrlFailed,
}

impl WarningCode {
    /// `true` when the code means an item ended with no usable output.
    pub fn is_hard_failure(self) -> bool {
        matches!(
            self,
            WarningCode::DownloadFailed
                | WarningCode::DecodeFailed
                | WarningCode::NormalizationFailed
        )
    }
}

/// Code carried by a fatal [`ErrorPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    DriveApiDisabled,
    DriveAccessDenied,
    NormalizationFailed,
    PartialFailure,
    ProcessStatementFailed,
    ProcessReceiptsFailed,
    PdfMergeFailed,
    XlsmWriteFailed,
    OutputWriteFailed,
}

impl ErrorCode {
    /// Status a transport layer should answer with.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::InvalidArgument => 400,
            _ => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| format!("{self:?}"));
        f.write_str(&s)
    }
}

// ── Envelope payloads ────────────────────────────────────────────────────

/// A non-fatal, item-scoped problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub code: WarningCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl Warning {
    pub fn new(code: WarningCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
        }
    }
}

/// A fatal, request-scoped error as it appears in a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
        }
    }
}

// ── Fatal errors ─────────────────────────────────────────────────────────

/// All fatal errors raised by the pipeline entry points.
///
/// Item-level failures are [`Warning`]s and never reach this type.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Validation ────────────────────────────────────────────────────────
    /// The request shape is malformed or a required co-field is missing.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String, details: Value },

    /// A drive input/output was requested but the drive service is disabled.
    #[error("Drive API is disabled; enable REN_DRIVE_ENABLED and configure a drive root.")]
    DriveDisabled,

    /// Listing a drive folder failed.
    #[error("Cannot list drive folder '{folder}': {source}")]
    DriveAccessDenied {
        folder: String,
        #[source]
        source: CollaboratorError,
    },

    // ── Stage failures ────────────────────────────────────────────────────
    /// Unexpected failure while preparing normalization inputs.
    #[error("Failed while preparing inputs: {detail}")]
    PrepareInputs { detail: String },

    /// The statement could not be extracted.
    #[error("{0}")]
    StatementFailed(String),

    /// At least one receipt could not be fetched or extracted.
    #[error("{0}")]
    ReceiptsFailed(String),

    /// The merged PDF could not be built.
    #[error("PDF merge failed: {detail}")]
    PdfMerge { detail: String },

    /// The spreadsheet template could not be loaded, patched or saved.
    #[error("XLSM write failed: {detail}")]
    XlsmWrite { detail: String },

    /// Final artifacts could not be delivered to their destination.
    #[error("Output write failed: {source}")]
    OutputWrite {
        #[source]
        source: CollaboratorError,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PipelineError {
    pub fn invalid_argument(message: impl Into<String>, details: Value) -> Self {
        PipelineError::InvalidArgument {
            message: message.into(),
            details,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::InvalidArgument { .. } | PipelineError::InvalidConfig(_) => {
                ErrorCode::InvalidArgument
            }
            PipelineError::DriveDisabled => ErrorCode::DriveApiDisabled,
            PipelineError::DriveAccessDenied { .. } => ErrorCode::DriveAccessDenied,
            PipelineError::PrepareInputs { .. } => ErrorCode::NormalizationFailed,
            PipelineError::StatementFailed(_) => ErrorCode::ProcessStatementFailed,
            PipelineError::ReceiptsFailed(_) => ErrorCode::ProcessReceiptsFailed,
            PipelineError::PdfMerge { .. } => ErrorCode::PdfMergeFailed,
            PipelineError::XlsmWrite { .. } => ErrorCode::XlsmWriteFailed,
            PipelineError::OutputWrite { .. } => ErrorCode::OutputWriteFailed,
        }
    }

    /// Render as the `error` field of a response envelope.
    pub fn to_payload(&self) -> ErrorPayload {
        let details = match self {
            PipelineError::InvalidArgument { details, .. } => details.clone(),
            PipelineError::DriveAccessDenied { folder, source } => serde_json::json!({
                "driveFolderId": folder,
                "error": source.to_string(),
            }),
            PipelineError::PrepareInputs { detail } => serde_json::json!({
                "stage": "prepare_inputs",
                "error": detail,
            }),
            _ => serde_json::json!({}),
        };
        ErrorPayload::new(self.code(), self.to_string(), details)
    }
}

// ── Collaborator errors ──────────────────────────────────────────────────

/// Failure reported by an external collaborator (storage, drive, HTTP,
/// rasterizer, profile catalog).
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("Invalid object URI: {0}")]
    InvalidUri(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("HTTP request to '{url}' failed: {reason}")]
    Http { url: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Failure reported by the extraction backend.
///
/// `status` is filled when the backend surfaces a structured HTTP status;
/// otherwise classification falls back to `message`.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    pub status: Option<u16>,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_failure_codes() {
        assert!(WarningCode::DownloadFailed.is_hard_failure());
        assert!(WarningCode::NormalizationFailed.is_hard_failure());
        assert!(WarningCode::DecodeFailed.is_hard_failure());
        assert!(!WarningCode::UnsupportedFileType.is_hard_failure());
        assert!(!WarningCode::SignedUrlFailed.is_hard_failure());
        assert!(!WarningCode::PdfRasterizeNotImplemented.is_hard_failure());
    }

    #[test]
    fn codes_serialize_screaming_snake() {
        let w = serde_json::to_value(WarningCode::UnsupportedFileType).unwrap();
        assert_eq!(w, "UNSUPPORTED_FILE_TYPE");
        assert_eq!(ErrorCode::PartialFailure.to_string(), "PARTIAL_FAILURE");
    }

    #[test]
    fn invalid_argument_maps_to_400() {
        let e = PipelineError::invalid_argument("bad zip", serde_json::json!({"len": 3}));
        let payload = e.to_payload();
        assert_eq!(payload.code, ErrorCode::InvalidArgument);
        assert_eq!(payload.code.http_status(), 400);
        assert_eq!(payload.details["len"], 3);
        assert_eq!(ErrorCode::XlsmWriteFailed.http_status(), 500);
    }

    #[test]
    fn prepare_inputs_payload_names_stage() {
        let e = PipelineError::PrepareInputs {
            detail: "boom".into(),
        };
        let payload = e.to_payload();
        assert_eq!(payload.code, ErrorCode::NormalizationFailed);
        assert_eq!(payload.details["stage"], "prepare_inputs");
    }

    #[test]
    fn backend_error_display_is_message() {
        let e = BackendError::new("429 Too Many Requests").with_status(429);
        assert_eq!(e.to_string(), "429 Too Many Requests");
        assert_eq!(e.status, Some(429));
    }
}
