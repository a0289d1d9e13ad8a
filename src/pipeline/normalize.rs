//! Per-item normalization: classify, reshape, re-encode, hash and store.
//!
//! ```text
//! SourceItem ──▶ classify ──▶ image: orient → downscale → RGB8 → JPEG
//!                         ├─▶ pdf:   keep bytes, count pages
//!                         └─▶ other: UNSUPPORTED_FILE_TYPE, dropped
//!            ──▶ sha256 ──▶ {prefix}normalized/{index:04}_{sha}.{ext}
//! ```
//!
//! The storage path is a pure function of index and content hash, so
//! normalizing identical bytes twice writes the same object.

use crate::config::PdfMode;
use crate::error::{CollaboratorError, Warning, WarningCode};
use crate::output::{NormalizeItem, NormalizedArtifact};
use crate::pipeline::encode::{
    classify, extension, mime_for_extension, normalize_image, pdf_page_count, sha256_hex,
    FileKind, MIME_JPEG, MIME_PDF,
};
use crate::pipeline::input::SourceItem;
use crate::storage::ObjectStore;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Effective per-request normalization settings.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizeSettings {
    pub jpg_quality: u8,
    pub max_side_px: u32,
    pub pdf_mode: PdfMode,
    pub upload_originals: bool,
    /// Output prefix, always ending in `/`.
    pub prefix: String,
}

/// What normalizing one item produced.
#[derive(Debug)]
pub struct ItemOutcome {
    pub index: usize,
    pub item: Option<NormalizeItem>,
    pub warnings: Vec<Warning>,
}

pub fn normalized_path(prefix: &str, index: usize, sha: &str, ext: &str) -> String {
    format!("{prefix}normalized/{index:04}_{sha}.{ext}")
}

pub fn original_path(prefix: &str, index: usize, name: &str) -> String {
    format!("{prefix}originals/{index:04}_{name}")
}

/// Normalizes items and writes them to object storage.
#[derive(Clone)]
pub struct Normalizer {
    store: Arc<dyn ObjectStore>,
    settings: NormalizeSettings,
}

impl Normalizer {
    pub fn new(store: Arc<dyn ObjectStore>, settings: NormalizeSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &NormalizeSettings {
        &self.settings
    }

    /// Normalize one item. Never fails: problems become warnings scoped to
    /// the item's index.
    pub async fn normalize(&self, item: SourceItem) -> ItemOutcome {
        let index = item.index;
        let ext = extension(&item.name);
        let mut warnings = Vec::new();

        match self.normalize_inner(&item, &ext, &mut warnings).await {
            Ok(normalized) => ItemOutcome {
                index,
                item: normalized,
                warnings,
            },
            Err(e) => {
                warn!("Item {} ({}) failed: {}", index, item.name, e);
                warnings.push(Warning::new(
                    WarningCode::NormalizationFailed,
                    format!("Failed to process {}", item.name),
                    json!({
                        "index": index,
                        "filename": item.name,
                        "source": item.source,
                        "extension": ext,
                        "error": e.to_string(),
                    }),
                ));
                ItemOutcome {
                    index,
                    item: None,
                    warnings,
                }
            }
        }
    }

    async fn normalize_inner(
        &self,
        item: &SourceItem,
        ext: &str,
        warnings: &mut Vec<Warning>,
    ) -> Result<Option<NormalizeItem>, NormalizeError> {
        let s = &self.settings;

        let (bytes, mime, target_ext, page_count) = match classify(&item.name) {
            FileKind::Image => {
                let data = item.bytes.clone();
                let (max_side, quality) = (s.max_side_px, s.jpg_quality);
                let encoded = tokio::task::spawn_blocking(move || normalize_image(&data, max_side, quality))
                    .await
                    .map_err(|e| NormalizeError::Task(e.to_string()))??;
                debug!(
                    "Item {}: {} → {}x{} JPEG ({} bytes)",
                    item.index,
                    item.name,
                    encoded.width,
                    encoded.height,
                    encoded.bytes.len()
                );
                (encoded.bytes, MIME_JPEG, "jpg", None)
            }
            FileKind::Pdf => {
                if s.pdf_mode == PdfMode::Rasterize {
                    warnings.push(Warning::new(
                        WarningCode::PdfRasterizeNotImplemented,
                        "pdfMode=rasterize not implemented; keeping PDF as-is.",
                        json!({ "file": item.name }),
                    ));
                }
                let data = item.bytes.clone();
                let pages = tokio::task::spawn_blocking(move || pdf_page_count(&data))
                    .await
                    .unwrap_or(None);
                (item.bytes.clone(), MIME_PDF, "pdf", pages)
            }
            FileKind::Unsupported => {
                debug!("Item {}: skipping unsupported {}", item.index, item.name);
                warnings.push(Warning::new(
                    WarningCode::UnsupportedFileType,
                    format!("Skipping unsupported file: {}", item.name),
                    json!({ "extension": ext, "filename": item.name }),
                ));
                return Ok(None);
            }
        };

        let sha = sha256_hex(&bytes);
        let size = bytes.len() as u64;
        let path = normalized_path(&s.prefix, item.index, &sha, target_ext);
        let gcs_uri = self.store.put(bytes, &path, Some(mime)).await?;

        let mut original_gcs_uri = None;
        if s.upload_originals {
            let target = original_path(&s.prefix, item.index, &item.name);
            let content_type = mime_for_extension(ext);
            match self.store.put(item.bytes.clone(), &target, content_type).await {
                Ok(uri) => original_gcs_uri = Some(uri),
                Err(e) => {
                    warn!("Original upload for {} failed: {}", item.name, e);
                    warnings.push(Warning::new(
                        WarningCode::OriginalUploadFailed,
                        format!("Failed to upload original for {}", item.name),
                        json!({ "filename": item.name, "targetPath": target, "error": e.to_string() }),
                    ));
                }
            }
        }

        Ok(Some(NormalizeItem {
            source: item.source.clone(),
            normalized: NormalizedArtifact {
                gcs_uri,
                mime: mime.to_string(),
                sha256: sha,
                bytes: size,
                page_count,
                original_gcs_uri,
                original_mime: mime_for_extension(ext).map(str::to_owned),
            },
        }))
    }
}

/// Failure that turns into a `NORMALIZATION_FAILED` warning.
#[derive(Debug, thiserror::Error)]
enum NormalizeError {
    #[error("image transform failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("storage write failed: {0}")]
    Store(#[from] CollaboratorError),
    #[error("transform task panicked: {0}")]
    Task(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::SourceInfo;
    use crate::request::Provenance;
    use crate::storage::MemoryObjectStore;
    use image::{DynamicImage, Rgb, RgbImage};

    fn settings() -> NormalizeSettings {
        NormalizeSettings {
            jpg_quality: 90,
            max_side_px: 64,
            pdf_mode: PdfMode::Keep,
            upload_originals: false,
            prefix: "gs://b/case/".into(),
        }
    }

    fn item(index: usize, name: &str, bytes: Vec<u8>) -> SourceItem {
        SourceItem {
            index,
            name: name.into(),
            bytes,
            provenance: Provenance::InlineFiles,
            source: SourceInfo {
                drive_file_id: None,
                original_name: Some(name.into()),
            },
        }
    }

    fn png(w: u32, h: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([200, 10, 10])));
        crate::pipeline::encode::encode_png(&img).unwrap()
    }

    #[test]
    fn paths_are_pure_functions_of_index_and_hash() {
        assert_eq!(
            normalized_path("gs://b/p/", 7, "abc", "jpg"),
            "gs://b/p/normalized/0007_abc.jpg"
        );
        assert_eq!(original_path("gs://b/p/", 12, "x.png"), "gs://b/p/originals/0012_x.png");
    }

    #[tokio::test]
    async fn image_is_reencoded_and_stored_at_hash_path() {
        let store = Arc::new(MemoryObjectStore::new());
        let n = Normalizer::new(store.clone(), settings());
        let out = n.normalize(item(3, "photo.PNG", png(128, 32))).await;
        let it = out.item.unwrap();
        assert!(out.warnings.is_empty());
        assert_eq!(it.normalized.mime, "image/jpeg");
        assert_eq!(it.normalized.original_mime.as_deref(), Some("image/png"));
        assert_eq!(
            it.normalized.gcs_uri,
            normalized_path("gs://b/case/", 3, &it.normalized.sha256, "jpg")
        );
        let stored = store.get(&it.normalized.gcs_uri).await.unwrap();
        assert_eq!(stored.len() as u64, it.normalized.bytes);
        let img = image::load_from_memory(&stored).unwrap();
        assert_eq!((img.width(), img.height()), (64, 16));
    }

    #[tokio::test]
    async fn same_bytes_same_path() {
        let store = Arc::new(MemoryObjectStore::new());
        let n = Normalizer::new(store, settings());
        let a = n.normalize(item(0, "a.png", png(10, 10))).await.item.unwrap();
        let b = n.normalize(item(0, "a.png", png(10, 10))).await.item.unwrap();
        assert_eq!(a.normalized.gcs_uri, b.normalized.gcs_uri);
    }

    #[tokio::test]
    async fn pdf_kept_with_rasterize_warning() {
        let store = Arc::new(MemoryObjectStore::new());
        let mut s = settings();
        s.pdf_mode = PdfMode::Rasterize;
        let n = Normalizer::new(store, s);
        let out = n.normalize(item(1, "doc.pdf", b"%PDF-1.4 broken".to_vec())).await;
        let it = out.item.unwrap();
        assert_eq!(it.normalized.mime, "application/pdf");
        assert_eq!(it.normalized.page_count, None);
        assert_eq!(it.normalized.bytes, 15);
        assert_eq!(out.warnings[0].code, WarningCode::PdfRasterizeNotImplemented);
    }

    #[tokio::test]
    async fn unsupported_and_corrupt_items_become_warnings() {
        let store = Arc::new(MemoryObjectStore::new());
        let n = Normalizer::new(store, settings());

        let docx = n.normalize(item(0, "notes.docx", b"PK".to_vec())).await;
        assert!(docx.item.is_none());
        assert_eq!(docx.warnings[0].code, WarningCode::UnsupportedFileType);

        let broken = n.normalize(item(4, "broken.jpg", b"not really".to_vec())).await;
        assert!(broken.item.is_none());
        assert_eq!(broken.index, 4);
        assert_eq!(broken.warnings[0].code, WarningCode::NormalizationFailed);
        assert_eq!(broken.warnings[0].details["index"], 4);
    }

    #[tokio::test]
    async fn originals_uploaded_on_request() {
        let store = Arc::new(MemoryObjectStore::new());
        let mut s = settings();
        s.upload_originals = true;
        let n = Normalizer::new(store.clone(), s);
        let it = n.normalize(item(2, "r.png", png(8, 8))).await.item.unwrap();
        assert_eq!(
            it.normalized.original_gcs_uri.as_deref(),
            Some("gs://b/case/originals/0002_r.png")
        );
        assert_eq!(store.content_type("gs://b/case/originals/0002_r.png").as_deref(), Some("image/png"));
    }
}
