//! Fetch a single document from wherever a [`DocumentLocation`] points.
//!
//! Object URIs go to the [`ObjectStore`], drive ids to the [`DriveService`]
//! (when one is configured) and signed URLs are downloaded over HTTPS with
//! `reqwest`. Each fetch also yields a display name, which later stages use
//! for type sniffing and warning details.

use crate::drive::DriveService;
use crate::error::CollaboratorError;
use crate::request::DocumentLocation;
use crate::storage::{ObjectStore, ObjectUri};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Bytes of one fetched document plus the name it is known by.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Resolves [`DocumentLocation`]s against the configured collaborators.
#[derive(Clone)]
pub struct DocumentFetcher {
    store: Arc<dyn ObjectStore>,
    drive: Option<Arc<dyn DriveService>>,
    http: reqwest::Client,
    timeout: Duration,
}

impl DocumentFetcher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        drive: Option<Arc<dyn DriveService>>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            drive,
            http: reqwest::Client::new(),
            timeout,
        }
    }

    pub async fn fetch(&self, location: &DocumentLocation) -> Result<FetchedDocument, CollaboratorError> {
        match location {
            DocumentLocation::Object(uri) => {
                let name = ObjectUri::parse(uri)?.file_name().to_string();
                let bytes = self.store.get(uri).await?;
                debug!("Fetched {} ({} bytes)", uri, bytes.len());
                Ok(FetchedDocument { name, bytes })
            }
            DocumentLocation::SignedUrl(url) => self.download(url).await,
            DocumentLocation::Drive(id) => {
                let drive = self
                    .drive
                    .as_ref()
                    .ok_or_else(|| CollaboratorError::Other("Drive API disabled".into()))?;
                let bytes = drive.get(id).await?;
                let name = drive.name(id).await.unwrap_or_else(|_| id.clone());
                Ok(FetchedDocument { name, bytes })
            }
        }
    }

    async fn download(&self, url: &str) -> Result<FetchedDocument, CollaboratorError> {
        info!("Downloading {}", redact(url));
        let http_err = |reason: String| CollaboratorError::Http {
            url: redact(url),
            reason,
        };

        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    http_err(format!("timed out after {}s", self.timeout.as_secs()))
                } else {
                    http_err(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(http_err(format!("HTTP {}", response.status())));
        }

        let bytes = response.bytes().await.map_err(|e| http_err(e.to_string()))?;
        Ok(FetchedDocument {
            name: filename_from_url(url),
            bytes: bytes.to_vec(),
        })
    }
}

/// Last path segment of a URL, or `download` when it has none.
pub fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_owned))
        })
        .filter(|last| !last.is_empty())
        .unwrap_or_else(|| "download".to_string())
}

/// Strip the query string; signed URLs carry credentials there.
fn redact(url: &str) -> String {
    url.split('?').next().unwrap_or(url).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;

    #[test]
    fn names_from_urls() {
        assert_eq!(
            filename_from_url("https://host/bucket/statement.pdf?X-Goog-Signature=abc"),
            "statement.pdf"
        );
        assert_eq!(filename_from_url("https://host/"), "download");
        assert_eq!(filename_from_url("not a url"), "download");
    }

    #[test]
    fn query_is_redacted() {
        assert_eq!(redact("https://h/a.pdf?sig=secret"), "https://h/a.pdf");
    }

    #[tokio::test]
    async fn fetches_objects_and_rejects_drive_when_disabled() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("gs://b/in/receipt.jpg", vec![1, 2, 3]);
        let fetcher = DocumentFetcher::new(store, None, Duration::from_secs(5));

        let doc = fetcher
            .fetch(&DocumentLocation::Object("gs://b/in/receipt.jpg".into()))
            .await
            .unwrap();
        assert_eq!(doc.name, "receipt.jpg");
        assert_eq!(doc.bytes, vec![1, 2, 3]);

        let err = fetcher
            .fetch(&DocumentLocation::Drive("abc".into()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Drive API disabled"));
    }
}
