//! Request shapes for the four pipeline entry points.
//!
//! Every "exactly one of N optional fields" shape on the wire is modelled as
//! an enum with one variant per field. Deserialization goes through a private
//! `Raw*` struct and a `TryFrom` impl, so the one-of rule is checked exactly
//! once at the boundary and the rest of the crate never sees an ambiguous
//! request.

use crate::config::PdfMode;
use crate::error::PipelineError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parse a JSON request body, mapping any shape violation to
/// `INVALID_ARGUMENT`.
pub fn parse_request<T: DeserializeOwned>(body: &str) -> Result<T, PipelineError> {
    serde_json::from_str(body).map_err(|e| {
        PipelineError::invalid_argument(
            format!("Malformed request: {e}"),
            serde_json::json!({ "line": e.line(), "column": e.column() }),
        )
    })
}

fn count_present(flags: &[bool]) -> usize {
    flags.iter().filter(|&&p| p).count()
}

fn non_empty(s: &Option<String>) -> bool {
    s.as_deref().is_some_and(|v| !v.is_empty())
}

// ── Normalize ────────────────────────────────────────────────────────────

/// A file shipped inline in the request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineFile {
    pub filename: String,
    pub content_base64: String,
}

/// The single input shape of a normalize request.
#[derive(Debug, Clone)]
pub enum NormalizeInput {
    /// Every file in a drive folder, sorted by name.
    DriveFolder(String),
    /// An inline base64 zip archive, entries sorted by name.
    ZipBase64 {
        data: String,
        filename: Option<String>,
    },
    /// A zip archive in object storage, entries sorted by name.
    ZipObject(String),
    /// Explicit drive file ids, in caller order.
    DriveFileIds(Vec<String>),
    /// Inline files, in caller order.
    Files(Vec<InlineFile>),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNormalizeInput {
    drive_folder_id: Option<String>,
    zip_base64: Option<String>,
    zip_filename: Option<String>,
    zip_gcs_uri: Option<String>,
    drive_file_ids: Option<Vec<String>>,
    files: Option<Vec<InlineFile>>,
}

impl TryFrom<RawNormalizeInput> for NormalizeInput {
    type Error = String;

    fn try_from(raw: RawNormalizeInput) -> Result<Self, Self::Error> {
        let provided = count_present(&[
            non_empty(&raw.drive_folder_id),
            non_empty(&raw.zip_base64),
            non_empty(&raw.zip_gcs_uri),
            raw.drive_file_ids.as_ref().is_some_and(|v| !v.is_empty()),
            raw.files.as_ref().is_some_and(|v| !v.is_empty()),
        ]);
        if provided != 1 {
            return Err("Exactly one of driveFolderId, zipBase64, zipGcsUri, driveFileIds, or files must be provided".into());
        }
        Ok(match raw {
            RawNormalizeInput {
                drive_folder_id: Some(id),
                ..
            } if !id.is_empty() => NormalizeInput::DriveFolder(id),
            RawNormalizeInput {
                zip_base64: Some(data),
                zip_filename,
                ..
            } if !data.is_empty() => NormalizeInput::ZipBase64 {
                data,
                filename: zip_filename,
            },
            RawNormalizeInput {
                zip_gcs_uri: Some(uri),
                ..
            } if !uri.is_empty() => NormalizeInput::ZipObject(uri),
            RawNormalizeInput {
                drive_file_ids: Some(ids),
                ..
            } if !ids.is_empty() => NormalizeInput::DriveFileIds(ids),
            RawNormalizeInput {
                files: Some(files), ..
            } => NormalizeInput::Files(files),
            _ => return Err("no input shape provided".into()),
        })
    }
}

impl<'de> Deserialize<'de> for NormalizeInput {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = RawNormalizeInput::deserialize(d)?;
        NormalizeInput::try_from(raw).map_err(serde::de::Error::custom)
    }
}

impl NormalizeInput {
    /// Tag recorded as provenance on every item this input produces.
    pub fn provenance(&self) -> Provenance {
        match self {
            NormalizeInput::DriveFolder(_) => Provenance::DriveFolder,
            NormalizeInput::ZipBase64 { .. } => Provenance::InlineArchive,
            NormalizeInput::ZipObject(_) => Provenance::ObjectArchive,
            NormalizeInput::DriveFileIds(_) => Provenance::DriveFileList,
            NormalizeInput::Files(_) => Provenance::InlineFiles,
        }
    }
}

/// Which input variant produced a source item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    DriveFolder,
    InlineArchive,
    ObjectArchive,
    DriveFileList,
    InlineFiles,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizeOutput {
    /// `gs://bucket/path/prefix/`; a trailing slash is added when missing.
    pub gcs_prefix: String,
}

/// Per-request overrides; absent fields fall back to [`crate::PipelineConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizeOptions {
    pub jpg_quality: Option<u8>,
    pub max_side_px: Option<u32>,
    pub pdf_mode: Option<PdfMode>,
    #[serde(default)]
    pub upload_originals: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizeRequest {
    #[serde(alias = "rendicionId")]
    pub case_id: String,
    pub input: NormalizeInput,
    pub output: NormalizeOutput,
    #[serde(default)]
    pub options: Option<NormalizeOptions>,
}

impl NormalizeRequest {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if let Some(opts) = &self.options {
            if let Some(q) = opts.jpg_quality {
                if !(1..=100).contains(&q) {
                    return Err(PipelineError::invalid_argument(
                        "jpgQuality must be between 1 and 100",
                        serde_json::json!({ "jpgQuality": q }),
                    ));
                }
            }
            if opts.max_side_px == Some(0) {
                return Err(PipelineError::invalid_argument(
                    "maxSidePx must be at least 1",
                    serde_json::json!({ "maxSidePx": 0 }),
                ));
            }
        }
        if self.output.gcs_prefix.is_empty() {
            return Err(PipelineError::invalid_argument(
                "output.gcsPrefix is required",
                Value::Null,
            ));
        }
        Ok(())
    }
}

// ── Document references ──────────────────────────────────────────────────

/// Where a single document lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentLocation {
    Object(String),
    SignedUrl(String),
    Drive(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLocation {
    gcs_uri: Option<String>,
    signed_url: Option<String>,
    drive_file_id: Option<String>,
    mime: Option<String>,
}

impl RawLocation {
    fn into_location(self, what: &str) -> Result<(DocumentLocation, Option<String>), String> {
        let provided = count_present(&[
            non_empty(&self.gcs_uri),
            non_empty(&self.signed_url),
            non_empty(&self.drive_file_id),
        ]);
        if provided != 1 {
            return Err(format!(
                "Exactly one of {what}gcsUri, {what}signedUrl, or {what}driveFileId is required"
            ));
        }
        let location = match (self.gcs_uri, self.signed_url, self.drive_file_id) {
            (Some(u), _, _) if !u.is_empty() => DocumentLocation::Object(u),
            (_, Some(u), _) if !u.is_empty() => DocumentLocation::SignedUrl(u),
            (_, _, Some(id)) => DocumentLocation::Drive(id),
            _ => return Err(format!("no {what}location provided")),
        };
        Ok((location, self.mime))
    }
}

/// A reference to one document plus an optional mime hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    pub location: DocumentLocation,
    pub mime: Option<String>,
}

impl DocumentRef {
    pub fn object(uri: impl Into<String>) -> Self {
        Self {
            location: DocumentLocation::Object(uri.into()),
            mime: None,
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }
}

impl<'de> Deserialize<'de> for DocumentRef {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = RawLocation::deserialize(d)?;
        let (location, mime) = raw.into_location("").map_err(serde::de::Error::custom)?;
        Ok(DocumentRef { location, mime })
    }
}

// ── Stage 2: extraction ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOptions {
    pub profile: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatementRequest {
    #[serde(alias = "rendicionId")]
    pub case_id: String,
    pub statement: DocumentRef,
    #[serde(default)]
    pub options: Option<ProcessOptions>,
}

/// How receipts in a batch are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptMode {
    /// Cash expenses: receipts stand alone.
    #[serde(rename = "efectivo")]
    Cash,
    /// Card expenses: each line item is cross-referenced with the statement.
    #[serde(rename = "tarjeta")]
    Card,
}

impl ReceiptMode {
    pub fn requires_statement(self) -> bool {
        matches!(self, ReceiptMode::Card)
    }
}

/// The parsed card statement woven into receipt extraction.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatementContext {
    #[serde(default)]
    pub parsed: Option<Value>,
}

impl StatementContext {
    /// The parsed statement, when it carries any content.
    pub fn parsed(&self) -> Option<&Value> {
        self.parsed.as_ref().filter(|v| match v {
            Value::Null => false,
            Value::Object(m) => !m.is_empty(),
            _ => true,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessReceiptsBatchRequest {
    #[serde(alias = "rendicionId")]
    pub case_id: String,
    pub mode: ReceiptMode,
    pub receipts: Vec<DocumentRef>,
    #[serde(default)]
    pub statement: Option<StatementContext>,
    #[serde(default)]
    pub options: Option<ProcessOptions>,
}

impl ProcessReceiptsBatchRequest {
    /// The statement context, validated against the mode.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let has_statement = self
            .statement
            .as_ref()
            .and_then(StatementContext::parsed)
            .is_some();
        if self.mode.requires_statement() && !has_statement {
            return Err(PipelineError::invalid_argument(
                "statement.parsed is required when mode=tarjeta",
                serde_json::json!({ "mode": "tarjeta" }),
            ));
        }
        Ok(())
    }
}

// ── Finalize ─────────────────────────────────────────────────────────────

/// Where the cover page comes from.
pub type CoverRef = DocumentLocation;

#[derive(Debug, Clone)]
pub struct CoverField(pub CoverRef);

impl<'de> Deserialize<'de> for CoverField {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = RawLocation::deserialize(d)?;
        let (location, _) = raw
            .into_location("cover.")
            .map_err(serde::de::Error::custom)?;
        Ok(CoverField(location))
    }
}

/// A caller-supplied spreadsheet template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateRef {
    Object(String),
    Drive(String),
}

impl<'de> Deserialize<'de> for TemplateRef {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Raw {
            gcs_uri: Option<String>,
            drive_file_id: Option<String>,
        }
        let raw = Raw::deserialize(d)?;
        match (raw.gcs_uri, raw.drive_file_id) {
            (Some(u), None) if !u.is_empty() => Ok(TemplateRef::Object(u)),
            (None, Some(id)) if !id.is_empty() => Ok(TemplateRef::Drive(id)),
            _ => Err(serde::de::Error::custom(
                "Exactly one of xlsmTemplate.gcsUri or xlsmTemplate.driveFileId is required",
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeItem {
    pub gcs_uri: String,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub original_name: Option<String>,
}

/// One sparse cell write. `row` and `col` are 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellWrite {
    pub sheet: String,
    pub row: u32,
    pub col: u32,
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeInputs {
    pub normalized_items: Vec<FinalizeItem>,
    pub cover: CoverField,
    #[serde(default)]
    pub xlsm_template: Option<TemplateRef>,
    #[serde(default)]
    pub xlsm_values: Vec<CellWrite>,
}

/// Exactly one destination for finalized artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Drive(String),
    Object(String),
}

impl<'de> Deserialize<'de> for Destination {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Raw {
            drive_folder_id: Option<String>,
            gcs_prefix: Option<String>,
        }
        let raw = Raw::deserialize(d)?;
        match (raw.drive_folder_id, raw.gcs_prefix) {
            (Some(f), None) if !f.is_empty() => Ok(Destination::Drive(f)),
            (None, Some(p)) if !p.is_empty() => Ok(Destination::Object(p)),
            _ => Err(serde::de::Error::custom(
                "Exactly one of driveFolderId or gcsPrefix is required",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOrder {
    #[default]
    CoverFirst,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeOptions {
    #[serde(default = "default_pdf_name")]
    pub pdf_name: String,
    #[serde(default = "default_xlsm_name")]
    pub xlsm_name: String,
    #[serde(default)]
    pub merge_order: MergeOrder,
    /// `0` disables signing; otherwise at least 60 seconds.
    #[serde(default)]
    pub signed_url_ttl_seconds: Option<u64>,
}

impl Default for FinalizeOptions {
    fn default() -> Self {
        Self {
            pdf_name: default_pdf_name(),
            xlsm_name: default_xlsm_name(),
            merge_order: MergeOrder::CoverFirst,
            signed_url_ttl_seconds: None,
        }
    }
}

fn default_pdf_name() -> String {
    "rendicion.pdf".to_string()
}

fn default_xlsm_name() -> String {
    "rendicion.xlsm".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    #[serde(alias = "rendicionId")]
    pub case_id: String,
    pub inputs: FinalizeInputs,
    pub output: Destination,
    #[serde(default)]
    pub options: Option<FinalizeOptions>,
}

impl FinalizeRequest {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if let Some(ttl) = self.options.as_ref().and_then(|o| o.signed_url_ttl_seconds) {
            if ttl != 0 && ttl < 60 {
                return Err(PipelineError::invalid_argument(
                    "signedUrlTtlSeconds must be 0 or at least 60",
                    serde_json::json!({ "signedUrlTtlSeconds": ttl }),
                ));
            }
        }
        for write in &self.inputs.xlsm_values {
            if write.row == 0 || write.col == 0 {
                return Err(PipelineError::invalid_argument(
                    "xlsmValues rows and columns are 1-based",
                    serde_json::to_value(write).unwrap_or(Value::Null),
                ));
            }
        }
        Ok(())
    }
}
