//! Response envelopes and the artifacts they carry.
//!
//! Every response has the same outer shape:
//! `{ ok, caseId, <payload…>, warnings?, error }`. `warnings` is omitted when
//! empty; `error` is `null` unless the request failed fatally or ended with
//! hard-failure warnings (`PARTIAL_FAILURE`).

use crate::error::{ErrorPayload, PipelineError, Warning};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a normalized item came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drive_file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
}

/// A durably stored canonical artifact (JPEG image or PDF).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedArtifact {
    pub gcs_uri: String,
    pub mime: String,
    /// SHA-256 of the stored bytes, lowercase hex.
    pub sha256: String,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_gcs_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_mime: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizeItem {
    pub source: SourceInfo,
    pub normalized: NormalizedArtifact,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizeResponse {
    pub ok: bool,
    pub case_id: String,
    pub items: Vec<NormalizeItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_gcs_uri: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
    pub error: Option<ErrorPayload>,
}

impl NormalizeResponse {
    pub fn failure(case_id: &str, err: &PipelineError, warnings: Vec<Warning>) -> Self {
        Self {
            ok: false,
            case_id: case_id.to_string(),
            items: Vec::new(),
            manifest_gcs_uri: None,
            warnings,
            error: Some(err.to_payload()),
        }
    }
}

/// Structured output of one extraction, keyed back to its document by
/// position in the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub data: Value,
    #[serde(default)]
    pub meta: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatementResponse {
    pub ok: bool,
    pub case_id: String,
    pub data: Option<Value>,
    pub meta: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
    pub error: Option<ErrorPayload>,
}

impl ProcessStatementResponse {
    pub fn failure(case_id: &str, err: &PipelineError, warnings: Vec<Warning>) -> Self {
        Self {
            ok: false,
            case_id: case_id.to_string(),
            data: None,
            meta: None,
            warnings,
            error: Some(err.to_payload()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessReceiptsBatchResponse {
    pub ok: bool,
    pub case_id: String,
    pub rows: Option<Vec<ExtractionResult>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
    pub error: Option<ErrorPayload>,
}

impl ProcessReceiptsBatchResponse {
    pub fn failure(case_id: &str, err: &PipelineError, warnings: Vec<Warning>) -> Self {
        Self {
            ok: false,
            case_id: case_id.to_string(),
            rows: None,
            warnings,
            error: Some(err.to_payload()),
        }
    }
}

/// Where one finalized output ended up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeArtifact {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drive_file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gcs_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub ok: bool,
    pub case_id: String,
    pub pdf: FinalizeArtifact,
    pub xlsm: FinalizeArtifact,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
    pub error: Option<ErrorPayload>,
}

impl FinalizeResponse {
    pub fn failure(case_id: &str, err: &PipelineError, warnings: Vec<Warning>) -> Self {
        Self {
            ok: false,
            case_id: case_id.to_string(),
            pdf: FinalizeArtifact::default(),
            xlsm: FinalizeArtifact::default(),
            warnings,
            error: Some(err.to_payload()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WarningCode;

    #[test]
    fn empty_warnings_are_omitted() {
        let resp = ProcessReceiptsBatchResponse {
            ok: true,
            case_id: "r1".into(),
            rows: Some(vec![]),
            warnings: vec![],
            error: None,
        };
        let v = serde_json::to_value(&resp).unwrap();
        assert!(v.get("warnings").is_none());
        assert_eq!(v["caseId"], "r1");
        assert!(v["error"].is_null());
    }

    #[test]
    fn failure_envelope_carries_payload_and_warnings() {
        let err = PipelineError::XlsmWrite {
            detail: "sheet 'X' not found".into(),
        };
        let w = Warning::new(WarningCode::PdfMergeFailed, "item 2", Value::Null);
        let resp = FinalizeResponse::failure("r9", &err, vec![w]);
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["code"], "XLSM_WRITE_FAILED");
        assert_eq!(v["warnings"][0]["code"], "PDF_MERGE_FAILED");
        assert_eq!(v["pdf"], serde_json::json!({}));
    }
}
