//! Input resolution: turn one normalize input shape into an ordered list of
//! raw byte sources.
//!
//! ## Ordering
//!
//! Folder listings and archive entries are sorted case-insensitively by name;
//! explicit id lists and inline file lists keep the caller's order. The
//! position in that canonical order becomes the item's index, which is
//! threaded through every later stage and into the storage path.
//!
//! ## Failure model
//!
//! * A malformed archive fails the request with `INVALID_ARGUMENT` before
//!   any download is scheduled.
//! * A per-item download failure is a `DOWNLOAD_FAILED` warning; the index is
//!   dropped, not retried.
//! * An inline file whose base64 does not decode is a `DECODE_FAILED`
//!   warning.

use crate::drive::{DriveEntry, DriveService};
use crate::error::{PipelineError, Warning, WarningCode};
use crate::output::SourceInfo;
use crate::pipeline::executor::fan_out;
use crate::request::{InlineFile, NormalizeInput, Provenance};
use crate::storage::ObjectStore;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::json;
use std::io::{Cursor, Read};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound on the buffer pre-allocated from an archive entry's declared size.
const ZIP_ENTRY_HINT: u64 = 1 << 20;

/// One raw source document with its stable index.
#[derive(Debug, Clone)]
pub struct SourceItem {
    pub index: usize,
    pub name: String,
    pub bytes: Vec<u8>,
    pub provenance: Provenance,
    pub source: SourceInfo,
}

/// Everything input resolution produced.
#[derive(Debug, Default)]
pub struct ResolvedInputs {
    /// Successfully resolved items, in canonical order.
    pub items: Vec<SourceItem>,
    pub warnings: Vec<Warning>,
    /// Items the input named, including ones that failed to resolve.
    pub attempted: usize,
}

/// Resolves a [`NormalizeInput`] against the storage and drive collaborators.
pub struct InputResolver {
    store: Arc<dyn ObjectStore>,
    drive: Option<Arc<dyn DriveService>>,
    workers: usize,
}

impl InputResolver {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        drive: Option<Arc<dyn DriveService>>,
        workers: usize,
    ) -> Self {
        Self {
            store,
            drive,
            workers: workers.max(1),
        }
    }

    pub async fn resolve(&self, input: &NormalizeInput) -> Result<ResolvedInputs, PipelineError> {
        let provenance = input.provenance();
        let resolved = match input {
            NormalizeInput::DriveFolder(folder) => self.resolve_drive_folder(folder).await?,
            NormalizeInput::DriveFileIds(ids) => self.resolve_drive_ids(ids).await?,
            NormalizeInput::Files(files) => resolve_inline_files(files),
            NormalizeInput::ZipBase64 { data, .. } => {
                let bytes = STANDARD.decode(data.trim()).map_err(|e| {
                    PipelineError::invalid_argument(
                        "Invalid zipBase64 input",
                        json!({ "zipBase64Length": data.len(), "error": e.to_string() }),
                    )
                })?;
                resolve_archive(bytes, provenance, json!({ "zipBase64Length": data.len() }), "zipBase64")
                    .await?
            }
            NormalizeInput::ZipObject(uri) => {
                let bytes = self.store.get(uri).await.map_err(|e| {
                    PipelineError::invalid_argument(
                        "Invalid zipGcsUri input",
                        json!({ "zipGcsUri": uri, "error": e.to_string() }),
                    )
                })?;
                resolve_archive(bytes, provenance, json!({ "zipGcsUri": uri }), "zipGcsUri").await?
            }
        };
        info!(
            "Resolved {}/{} input items ({:?})",
            resolved.items.len(),
            resolved.attempted,
            provenance
        );
        Ok(resolved)
    }

    fn drive(&self) -> Result<&Arc<dyn DriveService>, PipelineError> {
        self.drive.as_ref().ok_or(PipelineError::DriveDisabled)
    }

    async fn resolve_drive_folder(&self, folder: &str) -> Result<ResolvedInputs, PipelineError> {
        let drive = self.drive()?;
        let mut entries = drive
            .list(folder)
            .await
            .map_err(|source| PipelineError::DriveAccessDenied {
                folder: folder.to_string(),
                source,
            })?;
        sort_by_name(&mut entries, |e| &e.name);

        let listed: Vec<(DriveEntry, Option<String>)> =
            entries.into_iter().map(|e| (e, None)).collect();
        Ok(self.download_drive(listed, Provenance::DriveFolder).await)
    }

    async fn resolve_drive_ids(&self, ids: &[String]) -> Result<ResolvedInputs, PipelineError> {
        self.drive()?;
        let listed = ids
            .iter()
            .map(|id| {
                (
                    DriveEntry {
                        name: String::new(),
                        id: id.clone(),
                    },
                    Some(id.clone()),
                )
            })
            .collect();
        Ok(self.download_drive(listed, Provenance::DriveFileList).await)
    }

    /// Download drive entries concurrently. Entries paired with `Some(id)`
    /// still need their display name looked up.
    async fn download_drive(
        &self,
        listed: Vec<(DriveEntry, Option<String>)>,
        provenance: Provenance,
    ) -> ResolvedInputs {
        let attempted = listed.len();
        let Some(drive) = self.drive.clone() else {
            return ResolvedInputs {
                attempted,
                ..Default::default()
            };
        };

        let results = fan_out(listed, self.workers, |index, (entry, lookup)| {
            let drive = Arc::clone(&drive);
            async move {
                let name = match lookup {
                    Some(id) => match drive.name(&id).await {
                        Ok(name) => name,
                        Err(e) => {
                            warn!("Name lookup of {} failed: {}", id, e);
                            return Err(Warning::new(
                                WarningCode::DownloadFailed,
                                format!("Failed to download {id}"),
                                json!({ "fileId": id, "error": e.to_string() }),
                            ));
                        }
                    },
                    None => entry.name.clone(),
                };
                match drive.get(&entry.id).await {
                    Ok(bytes) => {
                        debug!("Downloaded drive file {} ({} bytes)", entry.id, bytes.len());
                        Ok(SourceItem {
                            index,
                            source: SourceInfo {
                                drive_file_id: Some(entry.id.clone()),
                                original_name: Some(name.clone()),
                            },
                            name,
                            bytes,
                            provenance,
                        })
                    }
                    Err(e) => {
                        warn!("Download of {} failed: {}", entry.id, e);
                        Err(Warning::new(
                            WarningCode::DownloadFailed,
                            format!("Failed to download {}", if name.is_empty() { &entry.id } else { &name }),
                            json!({ "fileId": entry.id, "fileName": name, "error": e.to_string() }),
                        ))
                    }
                }
            }
        })
        .await;

        let mut out = ResolvedInputs {
            attempted,
            ..Default::default()
        };
        for r in results {
            match r {
                Ok(item) => out.items.push(item),
                Err(w) => out.warnings.push(w),
            }
        }
        out
    }
}

fn resolve_inline_files(files: &[InlineFile]) -> ResolvedInputs {
    let mut out = ResolvedInputs {
        attempted: files.len(),
        ..Default::default()
    };
    for (index, file) in files.iter().enumerate() {
        match STANDARD.decode(file.content_base64.trim()) {
            Ok(bytes) => out.items.push(SourceItem {
                index,
                name: file.filename.clone(),
                bytes,
                provenance: Provenance::InlineFiles,
                source: SourceInfo {
                    drive_file_id: None,
                    original_name: Some(file.filename.clone()),
                },
            }),
            Err(e) => {
                warn!("Inline file {} is not valid base64: {}", file.filename, e);
                out.warnings.push(Warning::new(
                    WarningCode::DecodeFailed,
                    format!("Failed to decode file {}", file.filename),
                    json!({ "filename": file.filename, "error": e.to_string() }),
                ));
            }
        }
    }
    out
}

/// Unpack every file entry of a zip archive, sorted by name.
async fn resolve_archive(
    bytes: Vec<u8>,
    provenance: Provenance,
    details: serde_json::Value,
    field: &'static str,
) -> Result<ResolvedInputs, PipelineError> {
    let mut entries = tokio::task::spawn_blocking(move || read_zip_entries(bytes))
        .await
        .map_err(|e| PipelineError::PrepareInputs {
            detail: format!("archive task panicked: {e}"),
        })?
        .map_err(|e| {
            let mut details = details;
            if let Some(map) = details.as_object_mut() {
                map.insert("error".into(), json!(e.to_string()));
            }
            PipelineError::invalid_argument(format!("Invalid {field} input"), details)
        })?;

    sort_by_name(&mut entries, |(name, _)| name);
    let attempted = entries.len();
    let items = entries
        .into_iter()
        .enumerate()
        .map(|(index, (name, bytes))| SourceItem {
            index,
            source: SourceInfo {
                drive_file_id: None,
                original_name: Some(name.clone()),
            },
            name,
            bytes,
            provenance,
        })
        .collect();
    Ok(ResolvedInputs {
        items,
        warnings: Vec::new(),
        attempted,
    })
}

fn read_zip_entries(bytes: Vec<u8>) -> Result<Vec<(String, Vec<u8>)>, zip::result::ZipError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut out = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() || file.name().ends_with('/') {
            continue;
        }
        let name = file.name().to_string();
        let mut buf = Vec::with_capacity(file.size().min(ZIP_ENTRY_HINT) as usize);
        file.read_to_end(&mut buf)?;
        out.push((name, buf));
    }
    Ok(out)
}

/// Stable, case-insensitive sort by name.
fn sort_by_name<T>(items: &mut [T], name: impl Fn(&T) -> &String) {
    items.sort_by_cached_key(|item| name(item).to_lowercase());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::LocalDrive;
    use crate::storage::MemoryObjectStore;
    use std::io::Write;

    fn zip_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut w = zip::ZipWriter::new(&mut buf);
            let opts = zip::write::SimpleFileOptions::default();
            for (name, data) in entries {
                if name.ends_with('/') {
                    w.add_directory(name.trim_end_matches('/'), opts).unwrap();
                } else {
                    w.start_file(*name, opts).unwrap();
                    w.write_all(data).unwrap();
                }
            }
            w.finish().unwrap();
        }
        buf.into_inner()
    }

    fn resolver(drive: Option<Arc<dyn DriveService>>) -> InputResolver {
        InputResolver::new(Arc::new(MemoryObjectStore::new()), drive, 4)
    }

    #[tokio::test]
    async fn archive_entries_sorted_case_insensitively_without_dirs() {
        let zip = zip_of(&[("b.jpg", b"b"), ("dir/", b""), ("A.pdf", b"a"), ("c.png", b"c")]);
        let input = NormalizeInput::ZipBase64 {
            data: STANDARD.encode(zip),
            filename: None,
        };
        let out = resolver(None).resolve(&input).await.unwrap();
        let names: Vec<_> = out.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["A.pdf", "b.jpg", "c.png"]);
        assert_eq!(out.items[2].index, 2);
        assert_eq!(out.attempted, 3);
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn archive_entries_larger_than_the_hint_read_fully() {
        let big = vec![7u8; (ZIP_ENTRY_HINT as usize) * 2 + 3];
        let entries = read_zip_entries(zip_of(&[("big.bin", &big)])).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.len(), big.len());
    }

    #[tokio::test]
    async fn malformed_archive_is_invalid_argument() {
        let input = NormalizeInput::ZipBase64 {
            data: STANDARD.encode(b"not a zip"),
            filename: None,
        };
        let err = resolver(None).resolve(&input).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidArgument { .. }));

        let bad_b64 = NormalizeInput::ZipBase64 {
            data: "%%%".into(),
            filename: None,
        };
        assert!(resolver(None).resolve(&bad_b64).await.is_err());
    }

    #[tokio::test]
    async fn inline_files_keep_order_and_flag_bad_base64() {
        let files = vec![
            InlineFile { filename: "z.jpg".into(), content_base64: STANDARD.encode(b"z") },
            InlineFile { filename: "bad.png".into(), content_base64: "***".into() },
            InlineFile { filename: "a.pdf".into(), content_base64: STANDARD.encode(b"a") },
        ];
        let out = resolver(None).resolve(&NormalizeInput::Files(files)).await.unwrap();
        let got: Vec<_> = out.items.iter().map(|i| (i.index, i.name.as_str())).collect();
        assert_eq!(got, vec![(0, "z.jpg"), (2, "a.pdf")]);
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.warnings[0].code, WarningCode::DecodeFailed);
    }

    #[tokio::test]
    async fn drive_inputs_require_drive() {
        let err = resolver(None)
            .resolve(&NormalizeInput::DriveFolder("f".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::DriveDisabled));
    }

    #[tokio::test]
    async fn drive_ids_keep_caller_order_and_drop_failures() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.jpg"), b"b").unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"a").unwrap();
        let drive: Arc<dyn DriveService> = Arc::new(LocalDrive::new(dir.path()));

        let ids = vec!["b.jpg".to_string(), "missing.jpg".to_string(), "a.jpg".to_string()];
        let out = resolver(Some(drive))
            .resolve(&NormalizeInput::DriveFileIds(ids))
            .await
            .unwrap();
        let got: Vec<_> = out.items.iter().map(|i| (i.index, i.name.as_str())).collect();
        assert_eq!(got, vec![(0, "b.jpg"), (2, "a.jpg")]);
        assert_eq!(out.warnings[0].code, WarningCode::DownloadFailed);
        assert_eq!(out.attempted, 3);
        assert_eq!(out.items[0].source.drive_file_id.as_deref(), Some("b.jpg"));
    }

    #[tokio::test]
    async fn drive_folder_listing_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let drive: Arc<dyn DriveService> = Arc::new(LocalDrive::new(dir.path()));
        let err = resolver(Some(drive))
            .resolve(&NormalizeInput::DriveFolder("nope".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::DriveAccessDenied { .. }));
    }
}
