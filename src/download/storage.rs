use async_trait::async_trait;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("cloud storage request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("cloud storage returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("local file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected cloud storage response: {0}")]
    Protocol(String),
}

/// A file as stored remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: Option<String>,
    /// Shareable download link.
    pub link: Option<String>,
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileList {
    pub files: Vec<StoredFile>,
    pub next_page_token: Option<String>,
}

/// State reported after each uploaded chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStep {
    Progress { uploaded: u64, total: u64 },
    Done(StoredFile),
}

/// An upload in progress; each call pushes the next chunk.
#[async_trait]
pub trait ResumableUpload: Send {
    async fn next_chunk(&mut self) -> Result<UploadStep, StorageError>;
}

/// Remote storage the orchestrator uploads finished downloads into.
///
/// `parent: None` means the configured default folder.
#[async_trait]
pub trait CloudStorage: Send + Sync {
    /// Create a folder and return its id.
    async fn create_folder(&self, name: &str, parent: Option<&str>) -> Result<String, StorageError>;

    /// Start a resumable upload of the local file at `path`.
    async fn create_file(
        &self,
        path: &Path,
        name: &str,
        parent: Option<&str>,
    ) -> Result<Box<dyn ResumableUpload>, StorageError>;

    async fn copy_file(&self, file_id: &str, parent: Option<&str>) -> Result<StoredFile, StorageError>;

    async fn list(
        &self,
        query: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<FileList, StorageError>;

    async fn get_metadata(&self, file_id: &str) -> Result<StoredFile, StorageError>;

    async fn delete(&self, file_id: &str) -> Result<(), StorageError>;

    /// Browser link to a folder.
    fn folder_link(&self, folder_id: &str) -> String;
}

/// Join an index base URL with a URL-encoded entry name. Folders get a
/// trailing slash.
pub fn index_link(base: &str, name: &str, is_dir: bool) -> String {
    format!(
        "{}/{}{}",
        base.trim_end_matches('/'),
        urlencoding::encode(name),
        if is_dir { "/" } else { "" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_link_encodes_name() {
        assert_eq!(
            index_link("https://index.example/0:/", "My File (1).iso", false),
            "https://index.example/0:/My%20File%20%281%29.iso"
        );
        assert_eq!(
            index_link("https://index.example", "a/b", true),
            "https://index.example/a%2Fb/"
        );
    }
}
