//! Object storage collaborator.
//!
//! The pipeline addresses objects as `gs://bucket/path` URIs and only needs
//! three operations: put, get and (best-effort) signed URLs. Two
//! implementations ship with the crate:
//!
//! * [`LocalObjectStore`] maps `gs://bucket/path` to `<root>/bucket/path` on
//!   disk, with atomic writes. The CLI uses it.
//! * [`MemoryObjectStore`] keeps objects in a map; handy for tests and
//!   dry runs.

use crate::error::CollaboratorError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

static RE_OBJECT_URI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^gs://(?P<bucket>[^/]+)/(?P<path>.+)$").expect("static regex"));

/// A parsed `gs://bucket/path` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUri {
    pub bucket: String,
    pub path: String,
}

impl ObjectUri {
    pub fn parse(uri: &str) -> Result<Self, CollaboratorError> {
        let caps = RE_OBJECT_URI
            .captures(uri)
            .ok_or_else(|| CollaboratorError::InvalidUri(uri.to_string()))?;
        Ok(Self {
            bucket: caps["bucket"].to_string(),
            path: caps["path"].to_string(),
        })
    }

    /// Last path segment, used as a display name.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

impl std::fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gs://{}/{}", self.bucket, self.path)
    }
}

/// Ensure a storage prefix ends with `/`.
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}

/// Durable object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` at `uri`, returning the canonical URI written.
    async fn put(
        &self,
        bytes: Vec<u8>,
        uri: &str,
        content_type: Option<&str>,
    ) -> Result<String, CollaboratorError>;

    async fn get(&self, uri: &str) -> Result<Vec<u8>, CollaboratorError>;

    /// A time-limited URL for `uri`; `None` when `ttl` is zero.
    async fn signed_url(&self, uri: &str, ttl: Duration)
        -> Result<Option<String>, CollaboratorError>;
}

// ── Filesystem-backed store ──────────────────────────────────────────────

/// Object store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, uri: &str) -> Result<PathBuf, CollaboratorError> {
        let parsed = ObjectUri::parse(uri)?;
        let rel = Path::new(&parsed.bucket).join(&parsed.path);
        // Object paths must stay inside the root.
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(CollaboratorError::InvalidUri(uri.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(
        &self,
        bytes: Vec<u8>,
        uri: &str,
        _content_type: Option<&str>,
    ) -> Result<String, CollaboratorError> {
        let path = self.path_for(uri)?;
        let target = path.clone();
        // Atomic write: temp file in the target directory, then rename.
        tokio::task::spawn_blocking(move || -> Result<(), CollaboratorError> {
            let parent = target
                .parent()
                .ok_or_else(|| CollaboratorError::Other(format!("no parent for {}", target.display())))?;
            std::fs::create_dir_all(parent)?;
            let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
            tmp.write_all(&bytes)?;
            tmp.persist(&target).map_err(|e| CollaboratorError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| CollaboratorError::Other(format!("write task panicked: {e}")))??;
        debug!("Stored {} → {}", uri, path.display());
        Ok(uri.to_string())
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>, CollaboratorError> {
        let path = self.path_for(uri)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CollaboratorError::NotFound(uri.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn signed_url(
        &self,
        uri: &str,
        ttl: Duration,
    ) -> Result<Option<String>, CollaboratorError> {
        if ttl.is_zero() {
            return Ok(None);
        }
        let path = self.path_for(uri)?;
        if !path.exists() {
            return Err(CollaboratorError::NotFound(uri.to_string()));
        }
        Ok(Some(format!(
            "file://{}?expires_in={}",
            path.display(),
            ttl.as_secs()
        )))
    }
}

// ── In-memory store ──────────────────────────────────────────────────────

/// Object store that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, (Vec<u8>, Option<String>)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object directly (test fixtures).
    pub fn insert(&self, uri: impl Into<String>, bytes: Vec<u8>) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(uri.into(), (bytes, None));
        }
    }

    /// All stored URIs, sorted.
    pub fn uris(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn content_type(&self, uri: &str) -> Option<String> {
        self.objects
            .lock()
            .ok()
            .and_then(|o| o.get(uri).and_then(|(_, ct)| ct.clone()))
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        bytes: Vec<u8>,
        uri: &str,
        content_type: Option<&str>,
    ) -> Result<String, CollaboratorError> {
        ObjectUri::parse(uri)?;
        let mut objects = self
            .objects
            .lock()
            .map_err(|e| CollaboratorError::Other(format!("lock poisoned: {e}")))?;
        objects.insert(uri.to_string(), (bytes, content_type.map(str::to_owned)));
        Ok(uri.to_string())
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>, CollaboratorError> {
        let objects = self
            .objects
            .lock()
            .map_err(|e| CollaboratorError::Other(format!("lock poisoned: {e}")))?;
        objects
            .get(uri)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| CollaboratorError::NotFound(uri.to_string()))
    }

    async fn signed_url(
        &self,
        uri: &str,
        ttl: Duration,
    ) -> Result<Option<String>, CollaboratorError> {
        if ttl.is_zero() {
            return Ok(None);
        }
        let parsed = ObjectUri::parse(uri)?;
        Ok(Some(format!(
            "memory://{}/{}?expires_in={}",
            parsed.bucket,
            parsed.path,
            ttl.as_secs()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_object_uri() {
        let u = ObjectUri::parse("gs://bucket/a/b/c.pdf").unwrap();
        assert_eq!(u.bucket, "bucket");
        assert_eq!(u.path, "a/b/c.pdf");
        assert_eq!(u.file_name(), "c.pdf");
        assert_eq!(u.to_string(), "gs://bucket/a/b/c.pdf");
        assert!(ObjectUri::parse("s3://bucket/x").is_err());
        assert!(ObjectUri::parse("gs://bucket/").is_err());
    }

    #[test]
    fn prefix_gets_trailing_slash() {
        assert_eq!(normalize_prefix("gs://b/p"), "gs://b/p/");
        assert_eq!(normalize_prefix("gs://b/p/"), "gs://b/p/");
    }

    #[tokio::test]
    async fn local_store_round_trip_and_signing() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let uri = store
            .put(b"hello".to_vec(), "gs://bkt/x/y.txt", Some("text/plain"))
            .await
            .unwrap();
        assert_eq!(uri, "gs://bkt/x/y.txt");
        assert!(dir.path().join("bkt/x/y.txt").exists());
        assert_eq!(store.get(&uri).await.unwrap(), b"hello");

        let none = store.signed_url(&uri, Duration::ZERO).await.unwrap();
        assert!(none.is_none());
        let url = store
            .signed_url(&uri, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert!(url.starts_with("file://"));
    }

    #[tokio::test]
    async fn local_store_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let err = store
            .put(b"x".to_vec(), "gs://bkt/../../etc/passwd", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::InvalidUri(_)));
    }

    #[tokio::test]
    async fn memory_store_missing_object() {
        let store = MemoryObjectStore::new();
        let err = store.get("gs://b/missing").await.unwrap_err();
        assert!(matches!(err, CollaboratorError::NotFound(_)));
    }
}
