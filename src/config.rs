//! Configuration for the expense-bundle pipeline.
//!
//! Every knob lives in one immutable [`PipelineConfig`], built once (via
//! [`PipelineConfigBuilder`] or the CLI's env-backed flags) and handed to
//! [`crate::Pipeline`] at construction. Components read it; nothing reads the
//! process environment after start-up.

use crate::error::PipelineError;
use crate::pipeline::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for all pipeline entry points.
///
/// # Example
/// ```rust
/// use expense_bundle::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .default_max_side_px(1600)
///     .normalize_workers(4)
///     .drive_enabled(true)
///     .build()
///     .unwrap();
/// assert_eq!(config.default_max_side_px, 1600);
/// ```
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// JPEG quality when a request has no options. Range 1–100. Default: 90.
    pub default_jpg_quality: u8,

    /// Longest image side after normalization when a request has no options.
    /// Also caps rasterized statement/receipt pages. Default: 2000.
    pub default_max_side_px: u32,

    /// PDF handling when a request has no options. Default: [`PdfMode::Keep`].
    pub default_pdf_mode: PdfMode,

    /// TTL for signed URLs on finalized outputs when a request has no
    /// options. `0` disables signing. Default: 3600.
    pub default_signed_url_ttl_secs: u64,

    /// Built-in macro-enabled workbook used when a finalize request names no
    /// template.
    pub xlsm_template_path: PathBuf,

    /// Whether drive inputs/outputs are allowed. Default: false.
    pub drive_enabled: bool,

    /// Worker cap for downloads and per-item normalization. Default: 8.
    pub normalize_workers: usize,

    /// Worker cap for per-document extraction inside one batch. Default: 4.
    pub extraction_workers: usize,

    /// Receipts per extraction batch. Default: 6.
    pub extraction_batch_size: usize,

    /// Retry/backoff policy around the extraction backend.
    pub retry: RetryPolicy,

    /// Root of the extraction profile catalog. Default: `profiles`.
    pub profile_dir: PathBuf,

    /// Profile used by `process_statement` when the request names none.
    pub statement_profile: String,

    /// Profile used by `process_receipts_batch` when the request names none.
    pub receipts_profile: String,

    /// Timeout for signed-URL downloads, in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// LLM provider name (e.g. "openai", "gemini"). `None` auto-detects.
    pub provider_name: Option<String>,

    /// LLM model identifier. `None` uses the provider default.
    pub model: Option<String>,

    /// Sampling temperature for extraction calls. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens the model may generate per call. Default: 4096.
    pub max_tokens: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_jpg_quality: 90,
            default_max_side_px: 2000,
            default_pdf_mode: PdfMode::Keep,
            default_signed_url_ttl_secs: 3600,
            xlsm_template_path: PathBuf::from("templates/rendiciones_macro_template.xlsm"),
            drive_enabled: false,
            normalize_workers: 8,
            extraction_workers: 4,
            extraction_batch_size: 6,
            retry: RetryPolicy::default(),
            profile_dir: PathBuf::from("profiles"),
            statement_profile: "estado/v0".to_string(),
            receipts_profile: "lineas_gastos/v0".to_string(),
            download_timeout_secs: 120,
            provider_name: None,
            model: None,
            temperature: 0.0,
            max_tokens: 4096,
        }
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn default_jpg_quality(mut self, q: u8) -> Self {
        self.config.default_jpg_quality = q.clamp(1, 100);
        self
    }

    pub fn default_max_side_px(mut self, px: u32) -> Self {
        self.config.default_max_side_px = px.max(1);
        self
    }

    pub fn default_pdf_mode(mut self, mode: PdfMode) -> Self {
        self.config.default_pdf_mode = mode;
        self
    }

    pub fn default_signed_url_ttl_secs(mut self, secs: u64) -> Self {
        self.config.default_signed_url_ttl_secs = secs;
        self
    }

    pub fn xlsm_template_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.xlsm_template_path = path.into();
        self
    }

    pub fn drive_enabled(mut self, v: bool) -> Self {
        self.config.drive_enabled = v;
        self
    }

    pub fn normalize_workers(mut self, n: usize) -> Self {
        self.config.normalize_workers = n.max(1);
        self
    }

    pub fn extraction_workers(mut self, n: usize) -> Self {
        self.config.extraction_workers = n.max(1);
        self
    }

    pub fn extraction_batch_size(mut self, n: usize) -> Self {
        self.config.extraction_batch_size = n.max(1);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn profile_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.profile_dir = dir.into();
        self
    }

    pub fn statement_profile(mut self, name: impl Into<String>) -> Self {
        self.config.statement_profile = name.into();
        self
    }

    pub fn receipts_profile(mut self, name: impl Into<String>) -> Self {
        self.config.receipts_profile = name.into();
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.default_jpg_quality == 0 || c.default_jpg_quality > 100 {
            return Err(PipelineError::InvalidConfig(format!(
                "JPEG quality must be 1–100, got {}",
                c.default_jpg_quality
            )));
        }
        if c.normalize_workers == 0 || c.extraction_workers == 0 {
            return Err(PipelineError::InvalidConfig("Worker caps must be ≥ 1".into()));
        }
        if c.extraction_batch_size == 0 {
            return Err(PipelineError::InvalidConfig("Batch size must be ≥ 1".into()));
        }
        c.retry.validate()?;
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// How PDFs are handled during normalization.
///
/// `Rasterize` is accepted for compatibility but currently behaves like
/// `Keep` and emits a `PDF_RASTERIZE_NOT_IMPLEMENTED` warning per PDF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PdfMode {
    /// Store the PDF bytes unchanged (default).
    #[default]
    Keep,
    /// Requested page rasterization; degrades to `Keep` plus a warning.
    Rasterize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_settings() {
        let c = PipelineConfig::default();
        assert_eq!(c.default_jpg_quality, 90);
        assert_eq!(c.default_max_side_px, 2000);
        assert_eq!(c.default_pdf_mode, PdfMode::Keep);
        assert_eq!(c.default_signed_url_ttl_secs, 3600);
        assert_eq!(c.extraction_batch_size, 6);
        assert!(!c.drive_enabled);
    }

    #[test]
    fn builder_clamps_inputs() {
        let c = PipelineConfig::builder()
            .default_jpg_quality(0)
            .normalize_workers(0)
            .extraction_batch_size(0)
            .temperature(9.0)
            .build()
            .unwrap();
        assert_eq!(c.default_jpg_quality, 1);
        assert_eq!(c.normalize_workers, 1);
        assert_eq!(c.extraction_batch_size, 1);
        assert_eq!(c.temperature, 2.0);
    }

    #[test]
    fn builder_rejects_invalid_retry_policy() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        let err = PipelineConfig::builder().retry(policy).build().unwrap_err();
        assert!(err.to_string().contains("attempt"), "got: {err}");
    }

    #[test]
    fn pdf_mode_wire_names() {
        let m: PdfMode = serde_json::from_str("\"rasterize\"").unwrap();
        assert_eq!(m, PdfMode::Rasterize);
        assert_eq!(serde_json::to_string(&PdfMode::Keep).unwrap(), "\"keep\"");
    }
}
