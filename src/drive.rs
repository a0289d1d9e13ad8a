//! Shared-drive collaborator.
//!
//! [`LocalDrive`] backs the trait with a directory tree: a folder id is a
//! directory path relative to the drive root (`""` is the root itself) and a
//! file id is a file path relative to the root. That keeps ids opaque to the
//! pipeline while letting tests and the CLI run without a remote service.

use crate::error::CollaboratorError;
use async_trait::async_trait;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// One entry of a folder listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveEntry {
    pub name: String,
    pub id: String,
}

/// A shared-drive file service.
#[async_trait]
pub trait DriveService: Send + Sync {
    /// Files directly inside `folder_id`, in whatever order the service
    /// returns them.
    async fn list(&self, folder_id: &str) -> Result<Vec<DriveEntry>, CollaboratorError>;

    async fn get(&self, file_id: &str) -> Result<Vec<u8>, CollaboratorError>;

    /// Display name of `file_id`.
    async fn name(&self, file_id: &str) -> Result<String, CollaboratorError>;

    /// Create `name` under `parent_id`, returning the new file id.
    async fn create(
        &self,
        name: &str,
        parent_id: &str,
        bytes: Vec<u8>,
        mime: &str,
    ) -> Result<String, CollaboratorError>;
}

/// Directory-backed drive.
#[derive(Debug, Clone)]
pub struct LocalDrive {
    root: PathBuf,
}

impl LocalDrive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, id: &str) -> Result<PathBuf, CollaboratorError> {
        let rel = Path::new(id);
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(CollaboratorError::InvalidUri(id.to_string()));
        }
        Ok(self.root.join(rel))
    }

    fn id_for(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

#[async_trait]
impl DriveService for LocalDrive {
    async fn list(&self, folder_id: &str) -> Result<Vec<DriveEntry>, CollaboratorError> {
        let dir = self.resolve(folder_id)?;
        let mut reader = tokio::fs::read_dir(&dir).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CollaboratorError::NotFound(folder_id.to_string()),
            _ => CollaboratorError::Io(e),
        })?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            entries.push(DriveEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                id: self.id_for(&path),
            });
        }
        debug!("Drive folder '{}': {} files", folder_id, entries.len());
        Ok(entries)
    }

    async fn get(&self, file_id: &str) -> Result<Vec<u8>, CollaboratorError> {
        let path = self.resolve(file_id)?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CollaboratorError::NotFound(file_id.to_string()),
            _ => CollaboratorError::Io(e),
        })
    }

    async fn name(&self, file_id: &str) -> Result<String, CollaboratorError> {
        let path = self.resolve(file_id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(CollaboratorError::NotFound(file_id.to_string()));
        }
        Ok(path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_id.to_string()))
    }

    async fn create(
        &self,
        name: &str,
        parent_id: &str,
        bytes: Vec<u8>,
        _mime: &str,
    ) -> Result<String, CollaboratorError> {
        let dir = self.resolve(parent_id)?;
        let rel = format!("{}/{}", parent_id.trim_end_matches('/'), name);
        let target = self.resolve(rel.trim_start_matches('/'))?;
        let id = self.id_for(&target);
        tokio::task::spawn_blocking(move || -> Result<(), CollaboratorError> {
            std::fs::create_dir_all(&dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.persist(&target).map_err(|e| CollaboratorError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| CollaboratorError::Other(format!("drive write task panicked: {e}")))??;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("folder/sub")).unwrap();
        std::fs::write(dir.path().join("folder/b.jpg"), b"b").unwrap();
        std::fs::write(dir.path().join("folder/A.pdf"), b"a").unwrap();

        let drive = LocalDrive::new(dir.path());
        let mut entries = drive.list("folder").await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(
            entries,
            vec![
                DriveEntry { name: "A.pdf".into(), id: "folder/A.pdf".into() },
                DriveEntry { name: "b.jpg".into(), id: "folder/b.jpg".into() },
            ]
        );
        assert_eq!(drive.get("folder/b.jpg").await.unwrap(), b"b");
        assert_eq!(drive.name("folder/A.pdf").await.unwrap(), "A.pdf");
    }

    #[tokio::test]
    async fn create_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let drive = LocalDrive::new(dir.path());
        let id = drive
            .create("out.pdf", "results", b"%PDF".to_vec(), "application/pdf")
            .await
            .unwrap();
        assert_eq!(id, "results/out.pdf");
        assert_eq!(drive.get(&id).await.unwrap(), b"%PDF");
    }

    #[tokio::test]
    async fn missing_folder_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let drive = LocalDrive::new(dir.path());
        let err = drive.list("nope").await.unwrap_err();
        assert!(matches!(err, CollaboratorError::NotFound(_)));
        assert!(drive.list("../etc").await.is_err());
    }
}
