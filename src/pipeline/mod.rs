//! Pipeline stages for expense-report bundling.
//!
//! Each submodule implements one transformation step or one piece of
//! execution machinery. Stages are independent of the request envelopes in
//! [`crate::service`], so each one can be tested with in-memory
//! collaborators.
//!
//! ## Data Flow
//!
//! ```text
//! normalize:  input ──▶ normalize ──▶ object store (+ manifest)
//!             (drive/zip/files)  (orient, resize, JPEG, sha256)
//!
//! extract:    fetch ──▶ render ──▶ extract ──▶ backend (retry)
//!             (uri)    (pdfium)   (chunk + fan out)
//!
//! finalize:   cover + items ──▶ merge ──▶ PDF
//!             template + values ──▶ xlsm ──▶ XLSM
//! ```
//!
//! 1. [`input`]: resolve a request's input variant into ordered items
//! 2. [`normalize`]: per-item image/PDF normalization and storage
//! 3. [`encode`]: classification, image re-encoding and hashing helpers
//! 4. [`render`]: rasterise PDF pages; runs in `spawn_blocking` because
//!    pdfium is not async-safe
//! 5. [`extract`]: chunked, concurrent extraction with per-document retry
//! 6. [`merge`]: ordered PDF assembly
//! 7. [`xlsm`]: cell overlay that preserves workbook macros
//!
//! [`executor`] and [`retry`] are shared by stages 1, 2 and 5.

pub mod encode;
pub mod executor;
pub mod extract;
pub mod input;
pub mod merge;
pub mod normalize;
pub mod render;
pub mod retry;
pub mod xlsm;
