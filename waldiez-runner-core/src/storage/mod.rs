//! File storage capability.
//!
//! Backends are polymorphic; the orchestration core only talks to the
//! [`Storage`] trait. Paths handed to the trait are relative to the backend
//! root unless absolute, in which case they address the local filesystem
//! directly (the runner copies payloads into scratch directories this way).

mod local;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::io::AsyncRead;

use crate::error::Result;

pub use local::LocalStorage;

/// Upload extensions accepted for workflow payloads.
pub const ALLOWED_EXTENSIONS: [&str; 3] = [".waldiez", ".json", ".py"];

pub fn has_allowed_extension(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    ALLOWED_EXTENSIONS
        .iter()
        .any(|ext| lowered.ends_with(ext))
}

/// Result of staging a payload: content digest (md5 hex, dedup only) and the
/// backend-relative path it was saved under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedUpload {
    pub digest: String,
    pub path: String,
}

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Stream an upload to a unique path under `<client_id>/_tmp/`,
    /// computing the content digest while writing. Fails for extensions
    /// outside [`ALLOWED_EXTENSIONS`].
    async fn save_upload(
        &self,
        client_id: &str,
        original_name: &str,
        reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<SavedUpload>;

    /// Fetch a remote payload into `<client_id>/_tmp/`. Supported schemes:
    /// https, ftps, sftp, s3.
    async fn fetch_url(
        &self,
        client_id: &str,
        url: &str,
        filename: &str,
    ) -> Result<SavedUpload>;

    /// Rename within the backend. Creates parent directories, never
    /// overwrites: the destination is claimed exclusively (hard-link +
    /// unlink, rename fallback).
    async fn move_file(&self, src: &str, dst: &str) -> Result<()>;

    /// Move `src` aside to a randomized sibling name, claiming it
    /// exclusively. Returns the new backend-relative path.
    async fn move_to_random_name(&self, src: &str) -> Result<String>;

    async fn copy_file(&self, src: &str, dst: &str) -> Result<()>;

    async fn copy_folder(&self, src: &str, dst: &str) -> Result<()>;

    /// Idempotent: missing files are not an error.
    async fn delete_file(&self, path: &str) -> Result<()>;

    /// Idempotent: missing folders are not an error.
    async fn delete_folder(&self, path: &str) -> Result<()>;

    /// Shallow listing of regular files; empty if the path is absent.
    async fn list_files(&self, path: &str) -> Result<Vec<String>>;

    /// Content md5 as lowercase hex. Deduplication fingerprint, not a
    /// security digest.
    async fn hash(&self, path: &str) -> Result<String>;

    /// Produce a zip of `<client_id>/<task_id>/` as a named temporary file
    /// the caller streams and then drops.
    async fn download_archive(
        &self,
        client_id: &str,
        task_id: &str,
    ) -> Result<NamedTempFile>;

    /// Traversal-safe join against the backend root. `None` when the path
    /// escapes the root.
    fn resolve(&self, relative: &str) -> Option<String>;

    async fn is_file(&self, path: &str) -> bool;

    async fn is_dir(&self, path: &str) -> bool;
}
