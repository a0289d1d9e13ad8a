//! Result aggregation: decide what accumulated warnings mean for a request.
//!
//! Warnings are collected throughout a request. Afterwards, the ones whose
//! code is a hard failure (`DOWNLOAD_FAILED`, `DECODE_FAILED`,
//! `NORMALIZATION_FAILED`) turn the response into `ok = false` with a
//! `PARTIAL_FAILURE` error, while every successful item is still returned.
//! Everything else stays informational.

use crate::error::{ErrorCode, ErrorPayload, Warning, WarningCode};
use serde_json::{json, Value};
use std::fmt::Display;
use std::future::Future;
use tracing::warn;

/// Warnings that mean an item produced no usable output.
pub fn hard_failures(warnings: &[Warning]) -> Vec<&Warning> {
    warnings.iter().filter(|w| w.code.is_hard_failure()).collect()
}

/// `PARTIAL_FAILURE` payload when any hard failure exists, else `None`.
pub fn partial_failure(
    warnings: &[Warning],
    attempted: usize,
    successful: usize,
    stage: &str,
) -> Option<ErrorPayload> {
    let failed = hard_failures(warnings);
    if failed.is_empty() {
        return None;
    }
    Some(ErrorPayload::new(
        ErrorCode::PartialFailure,
        format!("{} item(s) failed during {stage}", failed.len()),
        json!({
            "failedWarnings": failed,
            "failedCount": failed.len(),
            "totalWarnings": warnings.len(),
            "attemptedItems": attempted,
            "successfulItems": successful,
        }),
    ))
}

/// Run a best-effort side action. On failure, record a warning and carry on.
pub async fn best_effort<T, E, Fut>(
    warnings: &mut Vec<Warning>,
    code: WarningCode,
    message: impl Into<String>,
    details: Value,
    action: Fut,
) -> Option<T>
where
    E: Display,
    Fut: Future<Output = Result<T, E>>,
{
    match action.await {
        Ok(v) => Some(v),
        Err(e) => {
            let message = message.into();
            warn!("{}: {}", message, e);
            let mut details = details;
            match details.as_object_mut() {
                Some(map) => {
                    map.insert("error".into(), json!(e.to_string()));
                }
                None => details = json!({ "error": e.to_string() }),
            }
            warnings.push(Warning::new(code, message, details));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(code: WarningCode) -> Warning {
        Warning::new(code, "x", Value::Null)
    }

    #[test]
    fn informational_warnings_keep_ok() {
        let ws = vec![w(WarningCode::UnsupportedFileType), w(WarningCode::ManifestWriteFailed)];
        assert!(partial_failure(&ws, 3, 2, "normalization").is_none());
    }

    #[test]
    fn hard_failure_yields_partial_failure_details() {
        let ws = vec![
            w(WarningCode::UnsupportedFileType),
            w(WarningCode::NormalizationFailed),
        ];
        let err = partial_failure(&ws, 5, 3, "normalization").unwrap();
        assert_eq!(err.code, ErrorCode::PartialFailure);
        assert_eq!(err.message, "1 item(s) failed during normalization");
        assert_eq!(err.details["failedCount"], 1);
        assert_eq!(err.details["totalWarnings"], 2);
        assert_eq!(err.details["attemptedItems"], 5);
        assert_eq!(err.details["successfulItems"], 3);
        assert_eq!(err.details["failedWarnings"][0]["code"], "NORMALIZATION_FAILED");
    }

    #[tokio::test]
    async fn best_effort_captures_failure_as_warning() {
        let mut warnings = Vec::new();
        let ok: Option<u8> = best_effort(
            &mut warnings,
            WarningCode::SignedUrlFailed,
            "sign",
            Value::Null,
            async { Ok::<_, String>(7) },
        )
        .await;
        assert_eq!(ok, Some(7));
        assert!(warnings.is_empty());

        let failed: Option<u8> = best_effort(
            &mut warnings,
            WarningCode::ManifestWriteFailed,
            "Failed to write manifest",
            json!({ "targetPath": "gs://b/m.json" }),
            async { Err::<u8, _>("disk full") },
        )
        .await;
        assert!(failed.is_none());
        assert_eq!(warnings[0].code, WarningCode::ManifestWriteFailed);
        assert_eq!(warnings[0].details["error"], "disk full");
        assert_eq!(warnings[0].details["targetPath"], "gs://b/m.json");
    }
}
