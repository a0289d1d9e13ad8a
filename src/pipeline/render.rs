//! PDF rasterisation for the extraction backend.
//!
//! Statements and PDF receipts are rendered to PNG pages before they reach
//! the vision model. Rendering goes through pdfium behind the
//! [`PageRasterizer`] trait so tests can substitute a fake.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and is CPU-bound. `tokio::task::spawn_blocking` moves each render
//! onto the blocking pool so Tokio worker threads stay free.
//!
//! ## Why cap pixels, not DPI?
//!
//! Statement page sizes vary (letter, legal, long-form bank exports). Capping
//! the longest edge keeps memory bounded regardless of physical size and
//! matches what the normalizer does for photos.

use crate::error::CollaboratorError;
use crate::pipeline::encode::encode_png;
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::path::PathBuf;
use tracing::{debug, info};

/// Turns a PDF into one PNG per page.
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    /// Render every page with its longest edge at most `max_side` pixels.
    async fn rasterize(&self, pdf: Vec<u8>, max_side: u32) -> Result<Vec<Vec<u8>>, CollaboratorError>;
}

/// [`PageRasterizer`] backed by a pdfium shared library.
#[derive(Debug, Clone, Default)]
pub struct PdfiumRasterizer {
    /// Directory holding the pdfium library. `None` uses the system library.
    library_dir: Option<PathBuf>,
}

impl PdfiumRasterizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_library_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            library_dir: Some(dir.into()),
        }
    }
}

#[async_trait]
impl PageRasterizer for PdfiumRasterizer {
    async fn rasterize(&self, pdf: Vec<u8>, max_side: u32) -> Result<Vec<Vec<u8>>, CollaboratorError> {
        let dir = self.library_dir.clone();
        tokio::task::spawn_blocking(move || render_pages_blocking(dir, &pdf, max_side))
            .await
            .map_err(|e| CollaboratorError::Other(format!("Render task panicked: {e}")))?
    }
}

fn bind(dir: Option<PathBuf>) -> Result<Pdfium, CollaboratorError> {
    let bindings = match dir {
        Some(dir) => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(&dir)),
        None => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| CollaboratorError::Other(format!("pdfium library not available: {e:?}")))?;
    Ok(Pdfium::new(bindings))
}

/// Blocking implementation of page rendering.
fn render_pages_blocking(
    dir: Option<PathBuf>,
    pdf: &[u8],
    max_side: u32,
) -> Result<Vec<Vec<u8>>, CollaboratorError> {
    let pdfium = bind(dir)?;
    let document = pdfium
        .load_pdf_from_byte_slice(pdf, None)
        .map_err(|e| CollaboratorError::Other(format!("Unreadable PDF: {e:?}")))?;

    let pages = document.pages();
    info!("PDF loaded: {} pages", pages.len());

    let side = max_side.min(i32::MAX as u32) as i32;
    let render_config = PdfRenderConfig::new()
        .set_target_width(side)
        .set_maximum_height(side);

    let mut out = Vec::with_capacity(pages.len() as usize);
    for (idx, page) in pages.iter().enumerate() {
        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            CollaboratorError::Other(format!("Rasterisation failed on page {}: {e:?}", idx + 1))
        })?;
        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );
        let png = encode_png(&image)
            .map_err(|e| CollaboratorError::Other(format!("PNG encode failed: {e}")))?;
        out.push(png);
    }
    Ok(out)
}
