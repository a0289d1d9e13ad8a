//! Request entry points.
//!
//! [`Pipeline`] owns the configuration and the external collaborators and
//! exposes one async method per operation. Every method returns its response
//! envelope, never a `Result`: fatal errors become `ok = false` with an
//! `error` payload, and warnings gathered before the failure are kept.
//!
//! ```text
//! normalize               validate → resolve inputs → fan out normalize → manifest → aggregate
//! process_statement       profile → fetch → rasterize → extract (retry)
//! process_receipts_batch  validate mode → profile (+ statement) → chunked extraction
//! finalize                cover → items → merge PDF → overlay XLSM → deliver (+ signed URLs)
//! ```

use crate::aggregate::{best_effort, partial_failure};
use crate::backend::{ExtractOptions, ExtractionBackend};
use crate::config::PipelineConfig;
use crate::drive::DriveService;
use crate::error::{CollaboratorError, PipelineError, Warning, WarningCode};
use crate::fetch::{DocumentFetcher, FetchedDocument};
use crate::output::{
    FinalizeArtifact, FinalizeResponse, NormalizeItem, NormalizeResponse,
    ProcessReceiptsBatchResponse, ProcessStatementResponse,
};
use crate::pipeline::encode::{extension, looks_like_pdf, mime_for_extension, MIME_PDF};
use crate::pipeline::executor::fan_out;
use crate::pipeline::extract::ExtractionOrchestrator;
use crate::pipeline::input::InputResolver;
use crate::pipeline::merge::PdfBundle;
use crate::pipeline::normalize::{NormalizeSettings, Normalizer};
use crate::pipeline::render::{PageRasterizer, PdfiumRasterizer};
use crate::pipeline::xlsm;
use crate::profile::{DirProfileCatalog, Profile, ProfileCatalog};
use crate::request::{
    Destination, FinalizeItem, FinalizeRequest, NormalizeRequest, ProcessOptions,
    ProcessReceiptsBatchRequest, ProcessStatementRequest, TemplateRef,
};
use crate::storage::{normalize_prefix, ObjectStore};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Content type of macro-enabled workbooks.
pub const MIME_XLSM: &str = "application/vnd.ms-excel.sheet.macroEnabled.12";

/// The four pipeline operations over one set of collaborators.
#[derive(Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn ObjectStore>,
    drive: Option<Arc<dyn DriveService>>,
    backend: Arc<dyn ExtractionBackend>,
    rasterizer: Arc<dyn PageRasterizer>,
    profiles: Arc<dyn ProfileCatalog>,
}

impl Pipeline {
    /// A pipeline with pdfium rasterization and the config's profile directory.
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn ObjectStore>,
        backend: Arc<dyn ExtractionBackend>,
    ) -> Self {
        let profiles = Arc::new(DirProfileCatalog::new(config.profile_dir.clone()));
        Self {
            config,
            store,
            drive: None,
            backend,
            rasterizer: Arc::new(PdfiumRasterizer::new()),
            profiles,
        }
    }

    /// Attach a drive service. Ignored unless `drive_enabled` is set.
    pub fn with_drive(mut self, drive: Arc<dyn DriveService>) -> Self {
        self.drive = Some(drive);
        self
    }

    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn PageRasterizer>) -> Self {
        self.rasterizer = rasterizer;
        self
    }

    pub fn with_profiles(mut self, profiles: Arc<dyn ProfileCatalog>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn drive(&self) -> Option<Arc<dyn DriveService>> {
        if self.config.drive_enabled {
            self.drive.clone()
        } else {
            None
        }
    }

    fn fetcher(&self) -> DocumentFetcher {
        DocumentFetcher::new(self.store.clone(), self.drive(), self.config.download_timeout())
    }

    fn orchestrator(&self) -> ExtractionOrchestrator {
        ExtractionOrchestrator::new(
            self.backend.clone(),
            self.rasterizer.clone(),
            self.fetcher(),
            self.config.retry.clone(),
        )
        .workers(self.config.extraction_workers)
        .batch_size(self.config.extraction_batch_size)
        .max_side_px(self.config.default_max_side_px)
    }

    // ── Normalize ────────────────────────────────────────────────────────

    /// Resolve, normalize and store every input item.
    pub async fn normalize(&self, req: NormalizeRequest) -> NormalizeResponse {
        let start = Instant::now();
        info!("Normalize {}: {:?} input", req.case_id, req.input.provenance());
        let mut warnings = Vec::new();
        match self.normalize_inner(&req, &mut warnings).await {
            Ok(resp) => {
                info!(
                    "Normalize {} done: {} item(s), {} warning(s) in {}ms",
                    req.case_id,
                    resp.items.len(),
                    resp.warnings.len(),
                    start.elapsed().as_millis()
                );
                resp
            }
            Err(e) => {
                warn!("Normalize {} failed: {}", req.case_id, e);
                NormalizeResponse::failure(&req.case_id, &e, warnings)
            }
        }
    }

    async fn normalize_inner(
        &self,
        req: &NormalizeRequest,
        warnings: &mut Vec<Warning>,
    ) -> Result<NormalizeResponse, PipelineError> {
        req.validate()?;
        let opts = req.options.clone().unwrap_or_default();
        let settings = NormalizeSettings {
            jpg_quality: opts.jpg_quality.unwrap_or(self.config.default_jpg_quality),
            max_side_px: opts.max_side_px.unwrap_or(self.config.default_max_side_px),
            pdf_mode: opts.pdf_mode.unwrap_or(self.config.default_pdf_mode),
            upload_originals: opts.upload_originals,
            prefix: normalize_prefix(&req.output.gcs_prefix),
        };

        // ── Step 1: Resolve inputs ───────────────────────────────────────
        let resolver = InputResolver::new(self.store.clone(), self.drive(), self.config.normalize_workers);
        let resolved = resolver.resolve(&req.input).await?;
        warnings.extend(resolved.warnings);
        info!(
            "Resolved {} of {} item(s)",
            resolved.items.len(),
            resolved.attempted
        );

        // ── Step 2: Normalize concurrently ───────────────────────────────
        let normalizer = Normalizer::new(self.store.clone(), settings.clone());
        let outcomes = fan_out(resolved.items, self.config.normalize_workers, |_, item| {
            normalizer.normalize(item)
        })
        .await;
        let mut items = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            warnings.extend(outcome.warnings);
            items.extend(outcome.item);
        }

        // ── Step 3: Manifest ─────────────────────────────────────────────
        let manifest_path = format!("{}manifests/normalize_manifest.json", settings.prefix);
        let manifest = Manifest {
            case_id: &req.case_id,
            generated_at: chrono::Utc::now().to_rfc3339(),
            items: &items,
        };
        let manifest_gcs_uri = best_effort(
            warnings,
            WarningCode::ManifestWriteFailed,
            "Failed to write normalize manifest",
            json!({ "targetPath": manifest_path }),
            async {
                let body = serde_json::to_vec_pretty(&manifest)
                    .map_err(|e| CollaboratorError::Other(e.to_string()))?;
                self.store.put(body, &manifest_path, Some("application/json")).await
            },
        )
        .await;

        // ── Step 4: Aggregate ────────────────────────────────────────────
        let error = partial_failure(warnings, resolved.attempted, items.len(), "normalization");
        Ok(NormalizeResponse {
            ok: error.is_none(),
            case_id: req.case_id.clone(),
            items,
            manifest_gcs_uri,
            warnings: std::mem::take(warnings),
            error,
        })
    }

    // ── Extraction ───────────────────────────────────────────────────────

    /// Extract the card statement with the statement profile.
    pub async fn process_statement(&self, req: ProcessStatementRequest) -> ProcessStatementResponse {
        let start = Instant::now();
        info!("Process statement {}", req.case_id);
        let options = req.options.clone().unwrap_or_default();

        let outcome = async {
            let profile = self
                .load_profile(&options, &self.config.statement_profile)
                .await
                .map_err(|e| PipelineError::StatementFailed(e.to_string()))?;
            self.orchestrator()
                .run_one(0, &req.statement, &profile, &extract_options(&options))
                .await
                .map_err(|e| PipelineError::StatementFailed(e.to_string()))
        }
        .await;

        match outcome {
            Ok(result) => {
                info!(
                    "Process statement {} done in {}ms",
                    req.case_id,
                    start.elapsed().as_millis()
                );
                ProcessStatementResponse {
                    ok: true,
                    case_id: req.case_id,
                    data: Some(result.data),
                    meta: Some(result.meta),
                    warnings: Vec::new(),
                    error: None,
                }
            }
            Err(e) => {
                warn!("Process statement {} failed: {}", req.case_id, e);
                ProcessStatementResponse::failure(&req.case_id, &e, Vec::new())
            }
        }
    }

    /// Extract one row per receipt, in input order.
    pub async fn process_receipts_batch(
        &self,
        req: ProcessReceiptsBatchRequest,
    ) -> ProcessReceiptsBatchResponse {
        let start = Instant::now();
        info!(
            "Process receipts {}: {} receipt(s), mode {:?}",
            req.case_id,
            req.receipts.len(),
            req.mode
        );
        let options = req.options.clone().unwrap_or_default();

        let outcome = async {
            req.validate()?;
            let base = self
                .load_profile(&options, &self.config.receipts_profile)
                .await
                .map_err(|e| PipelineError::ReceiptsFailed(e.to_string()))?;
            let profile = match req.statement.as_ref().and_then(|s| s.parsed()) {
                Some(parsed) => base.with_statement(parsed),
                None => base,
            };
            self.orchestrator()
                .run_batch(&req.receipts, &profile, &extract_options(&options))
                .await
                .map_err(|e| PipelineError::ReceiptsFailed(e.to_string()))
        }
        .await;

        match outcome {
            Ok(rows) => {
                info!(
                    "Process receipts {} done: {} row(s) in {}ms",
                    req.case_id,
                    rows.len(),
                    start.elapsed().as_millis()
                );
                ProcessReceiptsBatchResponse {
                    ok: true,
                    case_id: req.case_id,
                    rows: Some(rows),
                    warnings: Vec::new(),
                    error: None,
                }
            }
            Err(e) => {
                warn!("Process receipts {} failed: {}", req.case_id, e);
                ProcessReceiptsBatchResponse::failure(&req.case_id, &e, Vec::new())
            }
        }
    }

    async fn load_profile(
        &self,
        options: &ProcessOptions,
        default: &str,
    ) -> Result<Profile, CollaboratorError> {
        let name = options.profile.as_deref().unwrap_or(default);
        self.profiles.load(name).await
    }

    // ── Finalize ─────────────────────────────────────────────────────────

    /// Merge the cover and normalized items into one PDF, fill the workbook
    /// template and deliver both.
    pub async fn finalize(&self, req: FinalizeRequest) -> FinalizeResponse {
        let start = Instant::now();
        info!(
            "Finalize {}: {} item(s), {} cell write(s)",
            req.case_id,
            req.inputs.normalized_items.len(),
            req.inputs.xlsm_values.len()
        );
        let mut warnings = Vec::new();
        match self.finalize_inner(&req, &mut warnings).await {
            Ok((pdf, xlsm)) => {
                info!(
                    "Finalize {} done in {}ms ({} warning(s))",
                    req.case_id,
                    start.elapsed().as_millis(),
                    warnings.len()
                );
                FinalizeResponse {
                    ok: true,
                    case_id: req.case_id,
                    pdf,
                    xlsm,
                    warnings,
                    error: None,
                }
            }
            Err(e) => {
                warn!("Finalize {} failed: {}", req.case_id, e);
                FinalizeResponse::failure(&req.case_id, &e, warnings)
            }
        }
    }

    async fn finalize_inner(
        &self,
        req: &FinalizeRequest,
        warnings: &mut Vec<Warning>,
    ) -> Result<(FinalizeArtifact, FinalizeArtifact), PipelineError> {
        req.validate()?;
        let options = req.options.clone().unwrap_or_default();
        if matches!(req.output, Destination::Drive(_)) && self.drive().is_none() {
            return Err(PipelineError::DriveDisabled);
        }

        // ── Step 1: Cover ────────────────────────────────────────────────
        let cover = self.fetcher().fetch(&req.inputs.cover.0).await.map_err(|e| {
            PipelineError::invalid_argument(
                format!("Failed to fetch cover: {e}"),
                json!({ "error": e.to_string() }),
            )
        })?;

        // ── Step 2: Collect items ────────────────────────────────────────
        let mut parts = Vec::with_capacity(req.inputs.normalized_items.len());
        for item in &req.inputs.normalized_items {
            let (kind, mime) = merge_kind(item);
            if kind == MergeKind::Unsupported {
                warnings.push(Warning::new(
                    WarningCode::UnsupportedFileType,
                    format!("Skipping unsupported mime for merge: {mime}"),
                    json!({ "gcsUri": item.gcs_uri, "mime": mime }),
                ));
                continue;
            }
            match self.store.get(&item.gcs_uri).await {
                Ok(bytes) => parts.push(MergePart {
                    uri: item.gcs_uri.clone(),
                    kind,
                    bytes,
                }),
                Err(e) => {
                    warn!("Cannot fetch {} for merge: {}", item.gcs_uri, e);
                    warnings.push(merge_warning(&item.gcs_uri, &e));
                }
            }
        }

        // ── Step 3: Merge PDF ────────────────────────────────────────────
        let (pdf_bytes, merge_warnings) = tokio::task::spawn_blocking(move || merge_bundle(cover, parts))
            .await
            .map_err(|e| PipelineError::PdfMerge { detail: e.to_string() })??;
        warnings.extend(merge_warnings);

        // ── Step 4: Overlay XLSM ─────────────────────────────────────────
        let template = self.load_template(req.inputs.xlsm_template.as_ref()).await?;
        let writes = req.inputs.xlsm_values.clone();
        let xlsm_bytes = tokio::task::spawn_blocking(move || xlsm::overlay(&template, &writes))
            .await
            .map_err(|e| PipelineError::XlsmWrite { detail: e.to_string() })?
            .map_err(|e| PipelineError::XlsmWrite { detail: e.to_string() })?;

        // ── Step 5: Deliver ──────────────────────────────────────────────
        let ttl = options
            .signed_url_ttl_seconds
            .unwrap_or(self.config.default_signed_url_ttl_secs);
        let pdf = self
            .deliver(&req.output, &options.pdf_name, pdf_bytes, MIME_PDF, ttl, warnings)
            .await?;
        let xlsm = self
            .deliver(&req.output, &options.xlsm_name, xlsm_bytes, MIME_XLSM, ttl, warnings)
            .await?;
        Ok((pdf, xlsm))
    }

    async fn load_template(&self, template: Option<&TemplateRef>) -> Result<Vec<u8>, PipelineError> {
        let loaded = match template {
            None => {
                let path = &self.config.xlsm_template_path;
                debug!("Using built-in template {}", path.display());
                tokio::fs::read(path).await.map_err(CollaboratorError::from)
            }
            Some(TemplateRef::Object(uri)) => self.store.get(uri).await,
            Some(TemplateRef::Drive(id)) => match self.drive() {
                Some(drive) => drive.get(id).await,
                None => return Err(PipelineError::DriveDisabled),
            },
        };
        loaded.map_err(|e| PipelineError::XlsmWrite {
            detail: format!("cannot load template: {e}"),
        })
    }

    async fn deliver(
        &self,
        destination: &Destination,
        name: &str,
        bytes: Vec<u8>,
        mime: &str,
        ttl_secs: u64,
        warnings: &mut Vec<Warning>,
    ) -> Result<FinalizeArtifact, PipelineError> {
        match destination {
            Destination::Drive(folder) => {
                let drive = self.drive().ok_or(PipelineError::DriveDisabled)?;
                let id = drive
                    .create(name, folder, bytes, mime)
                    .await
                    .map_err(|source| PipelineError::OutputWrite { source })?;
                debug!("Delivered {} to drive folder {} as {}", name, folder, id);
                Ok(FinalizeArtifact {
                    drive_file_id: Some(id),
                    ..Default::default()
                })
            }
            Destination::Object(prefix) => {
                let target = format!("{}outputs/{name}", normalize_prefix(prefix));
                let uri = self
                    .store
                    .put(bytes, &target, Some(mime))
                    .await
                    .map_err(|source| PipelineError::OutputWrite { source })?;
                let signed_url = if ttl_secs == 0 {
                    None
                } else {
                    best_effort(
                        warnings,
                        WarningCode::SignedUrlFailed,
                        format!("Failed to sign URL for {name}"),
                        json!({ "gcsUri": uri }),
                        self.store.signed_url(&uri, Duration::from_secs(ttl_secs)),
                    )
                    .await
                    .flatten()
                };
                debug!("Delivered {} to {}", name, uri);
                Ok(FinalizeArtifact {
                    gcs_uri: Some(uri),
                    signed_url,
                    ..Default::default()
                })
            }
        }
    }
}

// ── Internal helpers ─────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Manifest<'a> {
    case_id: &'a str,
    generated_at: String,
    items: &'a [NormalizeItem],
}

fn extract_options(options: &ProcessOptions) -> ExtractOptions {
    ExtractOptions {
        model: options.model.clone(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeKind {
    Pdf,
    Image,
    Unsupported,
}

struct MergePart {
    uri: String,
    kind: MergeKind,
    bytes: Vec<u8>,
}

/// Decide how an item joins the bundle: declared mime first, then the
/// object name's extension.
fn merge_kind(item: &FinalizeItem) -> (MergeKind, String) {
    let mime = item
        .mime
        .clone()
        .filter(|m| !m.is_empty())
        .or_else(|| mime_for_extension(&extension(&item.gcs_uri)).map(str::to_owned))
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let kind = if mime.eq_ignore_ascii_case(MIME_PDF) {
        MergeKind::Pdf
    } else if mime.to_ascii_lowercase().starts_with("image/") {
        MergeKind::Image
    } else {
        MergeKind::Unsupported
    };
    (kind, mime)
}

fn merge_warning(uri: &str, err: &dyn std::fmt::Display) -> Warning {
    Warning::new(
        WarningCode::PdfMergeFailed,
        format!("Failed to merge item {uri}"),
        json!({ "gcsUri": uri, "error": err.to_string() }),
    )
}

fn merge_bundle(
    cover: FetchedDocument,
    parts: Vec<MergePart>,
) -> Result<(Vec<u8>, Vec<Warning>), PipelineError> {
    let mut bundle = PdfBundle::new();
    let pushed = if looks_like_pdf(&cover.name, None, &cover.bytes) {
        bundle.push_pdf(&cover.bytes)
    } else {
        bundle.push_image(&cover.bytes)
    };
    pushed.map_err(|e| PipelineError::PdfMerge {
        detail: format!("cover merge failed: {e}"),
    })?;

    let mut warnings = Vec::new();
    for part in parts {
        let pushed = match part.kind {
            MergeKind::Pdf => bundle.push_pdf(&part.bytes),
            _ => bundle.push_image(&part.bytes),
        };
        if let Err(e) = pushed {
            warn!("Cannot merge {}: {}", part.uri, e);
            warnings.push(merge_warning(&part.uri, &e));
        }
    }
    debug!("Merged bundle: {} page(s)", bundle.page_count());

    let bytes = bundle.finish().map_err(|e| PipelineError::PdfMerge { detail: e.to_string() })?;
    Ok((bytes, warnings))
}
