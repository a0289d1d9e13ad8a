//! CLI binary for expense-bundle.
//!
//! A thin shim over the library crate: maps flags and `REN_*` environment
//! variables to `PipelineConfig`, reads one JSON request (file or stdin),
//! runs the matching operation and prints the JSON response on stdout.
//! Logs go to stderr.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use expense_bundle::backend::ExtractOptions;
use expense_bundle::profile::Profile;
use expense_bundle::{
    parse_request, BackendError, ErrorCode, ErrorPayload, ExtractionBackend, ExtractionResult,
    ExtractionUnit, FinalizeRequest, LocalDrive, LocalObjectStore, MultiMode, NormalizeRequest,
    PdfMode, PdfiumRasterizer, Pipeline, PipelineConfig, ProcessReceiptsBatchRequest,
    ProcessStatementRequest, RetryPolicy, VisionBackend,
};
use serde::Serialize;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"EXAMPLES:
  # Normalize a zipped batch into local storage
  expense-bundle --storage-root ./storage normalize request.json

  # Extract a card statement (request on stdin)
  cat statement.json | expense-bundle process-statement

  # Receipts in card mode, smaller batches
  expense-bundle --batch-size 4 process-receipts receipts.json

  # Finalize to a drive folder
  expense-bundle --drive-enabled --drive-root ./drive finalize finalize.json

EXIT CODES:
  0  ok = true
  1  fatal error (error.code is a stage code) or unreadable request
  2  partial failure (error.code = PARTIAL_FAILURE; successful items returned)

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_PROVIDER      Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  REN_*                   Every flag below has a REN_ equivalent (see --help)
"#;

/// Normalize, extract and bundle expense-report documents.
#[derive(Parser, Debug)]
#[command(
    name = "expense-bundle",
    version,
    about = "Normalize, extract and bundle expense-report documents",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    settings: Settings,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "REN_VERBOSE")]
    verbose: bool,

    /// Suppress all logs except errors.
    #[arg(short, long, global = true, env = "REN_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve inputs and store normalized artifacts.
    Normalize(RequestArg),
    /// Extract the card statement.
    ProcessStatement(RequestArg),
    /// Extract one row per receipt.
    ProcessReceipts(RequestArg),
    /// Build the merged PDF and the filled workbook.
    Finalize(RequestArg),
}

#[derive(Args, Debug)]
struct RequestArg {
    /// JSON request file; `-` or absent reads stdin.
    request: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct Settings {
    /// Directory backing `gs://bucket/path` object URIs.
    #[arg(long, global = true, env = "REN_STORAGE_ROOT", default_value = "storage")]
    storage_root: PathBuf,

    /// Directory backing drive folders and file ids.
    #[arg(long, global = true, env = "REN_DRIVE_ROOT")]
    drive_root: Option<PathBuf>,

    /// Allow drive inputs and outputs.
    #[arg(long, global = true, env = "REN_DRIVE_ENABLED")]
    drive_enabled: bool,

    /// Extraction profile catalog.
    #[arg(long, global = true, env = "REN_PROFILE_DIR", default_value = "profiles")]
    profile_dir: PathBuf,

    /// Built-in macro-enabled workbook template.
    #[arg(
        long,
        global = true,
        env = "REN_XLSM_TEMPLATE",
        default_value = "templates/rendiciones_macro_template.xlsm"
    )]
    xlsm_template: PathBuf,

    /// Directory holding the pdfium shared library (system library if unset).
    #[arg(long, global = true, env = "REN_PDFIUM_DIR")]
    pdfium_dir: Option<PathBuf>,

    /// Default JPEG quality (1–100).
    #[arg(long, global = true, env = "REN_JPG_QUALITY", default_value_t = 90,
          value_parser = clap::value_parser!(u8).range(1..=100))]
    jpg_quality: u8,

    /// Default longest image side in pixels.
    #[arg(long, global = true, env = "REN_MAX_SIDE_PX", default_value_t = 2000)]
    max_side_px: u32,

    /// Default PDF handling during normalization.
    #[arg(long, global = true, env = "REN_PDF_MODE", value_enum, default_value = "keep")]
    pdf_mode: PdfModeArg,

    /// Default signed-URL TTL in seconds (0 disables signing).
    #[arg(long, global = true, env = "REN_SIGNED_URL_TTL", default_value_t = 3600)]
    signed_url_ttl: u64,

    /// Worker cap for downloads and normalization.
    #[arg(long, global = true, env = "REN_NORMALIZE_WORKERS", default_value_t = 8)]
    normalize_workers: usize,

    /// Worker cap for extraction inside one batch.
    #[arg(long, global = true, env = "REN_EXTRACTION_WORKERS", default_value_t = 4)]
    extraction_workers: usize,

    /// Receipts per extraction batch.
    #[arg(long, global = true, env = "REN_BATCH_SIZE", default_value_t = 6)]
    batch_size: usize,

    /// Extraction attempts per document, including the first.
    #[arg(long, global = true, env = "REN_MAX_ATTEMPTS", default_value_t = 4)]
    max_attempts: u32,

    /// First retry delay in milliseconds.
    #[arg(long, global = true, env = "REN_BASE_DELAY_MS", default_value_t = 1000)]
    base_delay_ms: u64,

    /// Cap on any retry delay in milliseconds.
    #[arg(long, global = true, env = "REN_MAX_DELAY_MS", default_value_t = 30_000)]
    max_delay_ms: u64,

    /// Signed-URL download timeout in seconds.
    #[arg(long, global = true, env = "REN_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, global = true, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// LLM model ID.
    #[arg(long, global = true, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM temperature.
    #[arg(long, global = true, env = "REN_TEMPERATURE", default_value_t = 0.0)]
    temperature: f32,

    /// Max LLM output tokens per call.
    #[arg(long, global = true, env = "REN_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum PdfModeArg {
    Keep,
    Rasterize,
}

impl From<PdfModeArg> for PdfMode {
    fn from(v: PdfModeArg) -> Self {
        match v {
            PdfModeArg::Keep => PdfMode::Keep,
            PdfModeArg::Rasterize => PdfMode::Rasterize,
        }
    }
}

/// Stand-in backend for operations that never extract.
struct NoBackend;

#[async_trait]
impl ExtractionBackend for NoBackend {
    async fn extract(
        &self,
        _units: &[ExtractionUnit],
        _profile: &Profile,
        _options: &ExtractOptions,
        _mode: MultiMode,
    ) -> Result<Vec<ExtractionResult>, BackendError> {
        Err(BackendError::new("extraction backend not configured"))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = build_config(&cli.settings)?;
    let extracts = matches!(
        cli.command,
        Command::ProcessStatement(_) | Command::ProcessReceipts(_)
    );
    let pipeline = build_pipeline(&cli.settings, config, extracts)?;

    match &cli.command {
        Command::Normalize(arg) => {
            let Some(req) = read_request::<NormalizeRequest>(arg)? else {
                return Ok(ExitCode::FAILURE);
            };
            let resp = pipeline.normalize(req).await;
            emit(&resp, resp.error.as_ref())
        }
        Command::ProcessStatement(arg) => {
            let Some(req) = read_request::<ProcessStatementRequest>(arg)? else {
                return Ok(ExitCode::FAILURE);
            };
            let resp = pipeline.process_statement(req).await;
            emit(&resp, resp.error.as_ref())
        }
        Command::ProcessReceipts(arg) => {
            let Some(req) = read_request::<ProcessReceiptsBatchRequest>(arg)? else {
                return Ok(ExitCode::FAILURE);
            };
            let resp = pipeline.process_receipts_batch(req).await;
            emit(&resp, resp.error.as_ref())
        }
        Command::Finalize(arg) => {
            let Some(req) = read_request::<FinalizeRequest>(arg)? else {
                return Ok(ExitCode::FAILURE);
            };
            let resp = pipeline.finalize(req).await;
            emit(&resp, resp.error.as_ref())
        }
    }
}

/// Map CLI settings to `PipelineConfig`.
fn build_config(s: &Settings) -> Result<PipelineConfig> {
    let retry = RetryPolicy {
        max_attempts: s.max_attempts,
        base_delay_ms: s.base_delay_ms,
        max_delay_ms: s.max_delay_ms,
        ..RetryPolicy::default()
    };
    let mut builder = PipelineConfig::builder()
        .default_jpg_quality(s.jpg_quality)
        .default_max_side_px(s.max_side_px)
        .default_pdf_mode(s.pdf_mode.clone().into())
        .default_signed_url_ttl_secs(s.signed_url_ttl)
        .xlsm_template_path(&s.xlsm_template)
        .drive_enabled(s.drive_enabled)
        .normalize_workers(s.normalize_workers)
        .extraction_workers(s.extraction_workers)
        .extraction_batch_size(s.batch_size)
        .retry(retry)
        .profile_dir(&s.profile_dir)
        .download_timeout_secs(s.download_timeout)
        .temperature(s.temperature)
        .max_tokens(s.max_tokens);
    if let Some(ref p) = s.provider {
        builder = builder.provider_name(p);
    }
    if let Some(ref m) = s.model {
        builder = builder.model(m);
    }
    builder.build().context("Invalid configuration")
}

fn build_pipeline(s: &Settings, config: PipelineConfig, extracts: bool) -> Result<Pipeline> {
    let backend: Arc<dyn ExtractionBackend> = if extracts {
        Arc::new(VisionBackend::from_config(&config).context("Failed to set up the vision backend")?)
    } else {
        Arc::new(NoBackend)
    };
    let store = Arc::new(LocalObjectStore::new(&s.storage_root));
    let rasterizer = match s.pdfium_dir {
        Some(ref dir) => PdfiumRasterizer::with_library_dir(dir),
        None => PdfiumRasterizer::new(),
    };

    let mut pipeline = Pipeline::new(config, store, backend).with_rasterizer(Arc::new(rasterizer));
    match (&s.drive_root, s.drive_enabled) {
        (Some(root), _) => pipeline = pipeline.with_drive(Arc::new(LocalDrive::new(root))),
        (None, true) => warn!("Drive enabled but no --drive-root given; drive requests will fail"),
        (None, false) => {}
    }
    Ok(pipeline)
}

/// Read and parse the request. An invalid body prints a failure envelope
/// and yields `None`.
fn read_request<T: serde::de::DeserializeOwned>(arg: &RequestArg) -> Result<Option<T>> {
    let body = match arg.request.as_deref() {
        Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request from {}", path.display()))?,
        _ => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read request from stdin")?;
            buf
        }
    };
    match parse_request::<T>(&body) {
        Ok(req) => Ok(Some(req)),
        Err(e) => {
            let envelope = serde_json::json!({
                "ok": false,
                "caseId": null,
                "error": e.to_payload(),
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&envelope).context("Failed to serialise error")?
            );
            Ok(None)
        }
    }
}

fn emit<T: Serialize>(response: &T, error: Option<&ErrorPayload>) -> Result<ExitCode> {
    let json = serde_json::to_string_pretty(response).context("Failed to serialise response")?;
    println!("{json}");
    Ok(match error {
        None => ExitCode::SUCCESS,
        Some(e) if e.code == ErrorCode::PartialFailure => ExitCode::from(2),
        Some(_) => ExitCode::FAILURE,
    })
}
