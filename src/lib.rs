//! # expense-bundle
//!
//! Turn a pile of expense-report source documents into a clean, ordered,
//! extracted and bundled case file.
//!
//! ## Why this crate?
//!
//! Expense cases arrive as loose phone photos, scanned PDFs, zipped batches
//! and shared-drive folders. Downstream extraction and bundling only work on
//! canonical inputs in a stable order, and every external service involved
//! (object storage, drive, the vision model) fails now and then. This crate
//! is the orchestration core that stays correct under those failures: a
//! request either succeeds, succeeds partially with itemised warnings, or
//! fails with one stage-identifying error.
//!
//! ## Pipeline Overview
//!
//! ```text
//! case
//!  │
//!  ├─ 1. Normalize  resolve inputs → orient/resize/JPEG → content-addressed store
//!  ├─ 2. Statement  fetch → rasterize → vision LLM (retry/backoff)
//!  ├─ 3. Receipts   chunks of 6 → bounded fan-out → one row per receipt
//!  └─ 4. Finalize   cover + items → merged PDF, template + values → XLSM
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use expense_bundle::{parse_request, LocalObjectStore, Pipeline, PipelineConfig, VisionBackend};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = PipelineConfig::default();
//!     let backend = Arc::new(VisionBackend::from_config(&config)?);
//!     let store = Arc::new(LocalObjectStore::new("./storage"));
//!     let pipeline = Pipeline::new(config, store, backend);
//!
//!     let request = parse_request(&std::fs::read_to_string("normalize.json")?)?;
//!     let response = pipeline.normalize(request).await;
//!     println!("{}", serde_json::to_string_pretty(&response)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `expense-bundle` binary (clap + anyhow + tracing-subscriber) |
//!
//! ## Failure model
//!
//! | Channel | Scope | Effect |
//! |---------|-------|--------|
//! | [`Warning`] | one item | accumulates; hard-failure codes make `ok = false` with `PARTIAL_FAILURE` |
//! | [`PipelineError`] | whole request | `ok = false`, `error` carries the stage code |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod aggregate;
pub mod backend;
pub mod config;
pub mod drive;
pub mod error;
pub mod fetch;
pub mod output;
pub mod pipeline;
pub mod profile;
pub mod request;
pub mod service;
pub mod storage;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::{ExtractionBackend, ExtractionUnit, MultiMode, VisionBackend};
pub use config::{PdfMode, PipelineConfig, PipelineConfigBuilder};
pub use drive::{DriveService, LocalDrive};
pub use error::{
    BackendError, CollaboratorError, ErrorCode, ErrorPayload, PipelineError, Warning, WarningCode,
};
pub use output::{
    ExtractionResult, FinalizeResponse, NormalizeResponse, ProcessReceiptsBatchResponse,
    ProcessStatementResponse,
};
pub use pipeline::render::{PageRasterizer, PdfiumRasterizer};
pub use pipeline::retry::RetryPolicy;
pub use profile::{DirProfileCatalog, Profile, ProfileCatalog, StaticProfileCatalog};
pub use request::{
    parse_request, FinalizeRequest, NormalizeRequest, ProcessReceiptsBatchRequest,
    ProcessStatementRequest,
};
pub use service::Pipeline;
pub use storage::{LocalObjectStore, MemoryObjectStore, ObjectStore};
