//! Extraction orchestration: fetch, rasterize, chunk, fan out, retry.
//!
//! ## Flow per request
//!
//! ```text
//! [DocumentRef] ──chunk(batch_size)──▶ chunk 1 ──fan_out(workers)──▶ doc → units → backend (retry)
//!                                      chunk 2 ──fan_out(workers)──▶ …
//!                                      …
//! results = chunk 1 ++ chunk 2 ++ …   (global input order)
//! ```
//!
//! Chunks run one after another; documents inside a chunk run concurrently.
//! A PDF rasterizes to one unit per page and is extracted in `aggregate`
//! mode; anything else is a single unit in `per_file` mode. Either way a
//! document yields exactly one result.
//!
//! Any failure fails the whole request: a batch with a missing row is worse
//! than no batch, since rows are matched to receipts by position.

use crate::backend::{ExtractOptions, ExtractionBackend, ExtractionUnit, MultiMode};
use crate::error::{BackendError, CollaboratorError};
use crate::fetch::DocumentFetcher;
use crate::output::ExtractionResult;
use crate::pipeline::encode::{extension, looks_like_pdf, mime_for_extension, MIME_PNG};
use crate::pipeline::executor::fan_out;
use crate::pipeline::render::PageRasterizer;
use crate::pipeline::retry::{run_with_retry, RetryPolicy};
use crate::profile::Profile;
use crate::request::DocumentRef;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// One logical document (receipt or statement) ready for the backend.
#[derive(Debug, Clone)]
pub struct ExtractionDocument {
    pub index: usize,
    pub name: String,
    pub units: Vec<ExtractionUnit>,
}

impl ExtractionDocument {
    pub fn mode(&self) -> MultiMode {
        MultiMode::for_unit_count(self.units.len())
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Failed to fetch document {index}: {source}")]
    Fetch {
        index: usize,
        #[source]
        source: CollaboratorError,
    },

    #[error("Failed to rasterize document {index} ({name}): {source}")]
    Rasterize {
        index: usize,
        name: String,
        #[source]
        source: CollaboratorError,
    },

    #[error("Extraction failed for document {index} after {attempts} attempt(s): {source}")]
    Backend {
        index: usize,
        attempts: u32,
        #[source]
        source: BackendError,
    },

    #[error("No extraction results returned for document {index}")]
    Empty { index: usize },
}

/// Split `items` into consecutive groups of at most `size`.
pub fn chunk<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut out = Vec::with_capacity(items.len().div_ceil(size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        out.push(iter.by_ref().take(size).collect());
    }
    out
}

/// Drives documents through the backend with chunking and retries.
#[derive(Clone)]
pub struct ExtractionOrchestrator {
    backend: Arc<dyn ExtractionBackend>,
    rasterizer: Arc<dyn PageRasterizer>,
    fetcher: DocumentFetcher,
    retry: RetryPolicy,
    workers: usize,
    batch_size: usize,
    max_side_px: u32,
}

impl ExtractionOrchestrator {
    pub fn new(
        backend: Arc<dyn ExtractionBackend>,
        rasterizer: Arc<dyn PageRasterizer>,
        fetcher: DocumentFetcher,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            rasterizer,
            fetcher,
            retry,
            workers: 4,
            batch_size: 6,
            max_side_px: 2000,
        }
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n.max(1);
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    pub fn max_side_px(mut self, px: u32) -> Self {
        self.max_side_px = px.max(1);
        self
    }

    /// Fetch one document and split it into backend units.
    pub async fn prepare(&self, index: usize, doc: &DocumentRef) -> Result<ExtractionDocument, ExtractError> {
        let fetched = self
            .fetcher
            .fetch(&doc.location)
            .await
            .map_err(|source| ExtractError::Fetch { index, source })?;

        let units = if looks_like_pdf(&fetched.name, doc.mime.as_deref(), &fetched.bytes) {
            let stem = match fetched.name.rsplit_once('.') {
                Some((stem, _)) if !stem.is_empty() => stem.to_string(),
                _ => "document".to_string(),
            };
            let pages = self
                .rasterizer
                .rasterize(fetched.bytes, self.max_side_px)
                .await
                .map_err(|source| ExtractError::Rasterize {
                    index,
                    name: fetched.name.clone(),
                    source,
                })?;
            if pages.is_empty() {
                return Err(ExtractError::Rasterize {
                    index,
                    name: fetched.name.clone(),
                    source: CollaboratorError::Other("PDF has no pages".into()),
                });
            }
            pages
                .into_iter()
                .enumerate()
                .map(|(i, bytes)| ExtractionUnit {
                    name: format!("{stem}_page_{}.png", i + 1),
                    mime: MIME_PNG.to_string(),
                    bytes,
                })
                .collect()
        } else {
            let mime = sniff_mime(&fetched.name, doc.mime.as_deref(), &fetched.bytes);
            vec![ExtractionUnit {
                name: fetched.name.clone(),
                mime,
                bytes: fetched.bytes,
            }]
        };

        debug!("Document {} ({}): {} unit(s)", index, fetched.name, units.len());
        Ok(ExtractionDocument {
            index,
            name: fetched.name,
            units,
        })
    }

    /// Extract one prepared document through the retry state machine.
    pub async fn extract_document(
        &self,
        doc: &ExtractionDocument,
        profile: &Profile,
        options: &ExtractOptions,
    ) -> Result<ExtractionResult, ExtractError> {
        let mode = doc.mode();
        let label = format!("document {} ({})", doc.index, doc.name);
        let outcome = run_with_retry(&self.retry, &label, |_attempt| {
            self.backend.extract(&doc.units, profile, options, mode)
        })
        .await;

        let results = outcome.result.map_err(|source| ExtractError::Backend {
            index: doc.index,
            attempts: outcome.attempts,
            source,
        })?;
        results
            .into_iter()
            .next()
            .ok_or(ExtractError::Empty { index: doc.index })
    }

    /// Fetch + extract one referenced document.
    pub async fn run_one(
        &self,
        index: usize,
        doc: &DocumentRef,
        profile: &Profile,
        options: &ExtractOptions,
    ) -> Result<ExtractionResult, ExtractError> {
        let prepared = self.prepare(index, doc).await?;
        self.extract_document(&prepared, profile, options).await
    }

    /// Extract every document, chunked by batch size, preserving order.
    pub async fn run_batch(
        &self,
        docs: &[DocumentRef],
        profile: &Profile,
        options: &ExtractOptions,
    ) -> Result<Vec<ExtractionResult>, ExtractError> {
        let indexed: Vec<(usize, &DocumentRef)> = docs.iter().enumerate().collect();
        let chunks = chunk(indexed, self.batch_size);
        let total_chunks = chunks.len();
        let mut results = Vec::with_capacity(docs.len());

        for (n, group) in chunks.into_iter().enumerate() {
            info!(
                "Extraction chunk {}/{}: {} document(s)",
                n + 1,
                total_chunks,
                group.len()
            );
            let outcomes = fan_out(group, self.workers, |_, (index, doc)| {
                self.run_one(index, doc, profile, options)
            })
            .await;
            for outcome in outcomes {
                results.push(outcome?);
            }
        }
        Ok(results)
    }
}

/// Mime for a non-PDF document: caller hint, then extension, then content.
fn sniff_mime(name: &str, hint: Option<&str>, bytes: &[u8]) -> String {
    if let Some(m) = hint.filter(|m| !m.is_empty()) {
        return m.to_string();
    }
    if let Some(m) = mime_for_extension(&extension(name)) {
        return m.to_string();
    }
    image::guess_format(bytes)
        .map(|f| f.to_mime_type().to_string())
        .unwrap_or_else(|_| "application/octet-stream".to_string())
}
