//! Attachment blob persistence.
//!
//! Path-prefixed by `YYYY/MM/DD/` and suffixed by event id. The
//! underlying store is swappable, so this is a thin trait plus a
//! filesystem-rooted implementation suitable for local
//! development and integration tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl crate::retry::Retriable for BlobError {
    fn is_retriable(&self) -> bool {
        true
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        received_at: DateTime<Utc>,
        event_id: &str,
        bytes: &[u8],
    ) -> Result<String, BlobError>;

    async fn get(&self, blob_url: &str) -> Result<Vec<u8>, BlobError>;
}

/// Builds the canonical `YYYY/MM/DD/{event_id}.pdf` path.
pub fn blob_path(received_at: DateTime<Utc>, event_id: &str) -> String {
    format!(
        "{:04}/{:02}/{:02}/{}.pdf",
        received_at.format("%Y"),
        received_at.format("%m"),
        received_at.format("%d"),
        event_id
    )
}

pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put(
        &self,
        received_at: DateTime<Utc>,
        event_id: &str,
        bytes: &[u8],
    ) -> Result<String, BlobError> {
        let relative = blob_path(received_at, event_id);
        let full_path = self.root.join(&relative);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(&full_path).await?;
        file.write_all(bytes).await?;
        Ok(relative)
    }

    async fn get(&self, blob_url: &str) -> Result<Vec<u8>, BlobError> {
        let full_path = self.root.join(blob_url);
        let mut file = tokio::fs::File::open(&full_path).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_is_prefixed_by_date_and_suffixed_by_event_id() {
        let received_at = DateTime::parse_from_rfc3339("2024-03-07T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            blob_path(received_at, "01HPQW8Z"),
            "2024/03/07/01HPQW8Z.pdf"
        );
    }

    #[tokio::test]
    async fn round_trips_through_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path());
        let received_at = Utc::now();

        let url = store.put(received_at, "evt-1", b"%PDF-1.4 test").await.unwrap();
        let read_back = store.get(&url).await.unwrap();
        assert_eq!(read_back, b"%PDF-1.4 test");
    }
}
