use async_trait::async_trait;
use reqwest::header::{CONTENT_RANGE, LOCATION, RANGE};
use serde_json::Value;
use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::storage::{CloudStorage, FileList, ResumableUpload, StorageError, StoredFile, UploadStep};
use crate::config::DriveConfig;

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id, name, size, mimeType, webContentLink";

/// Google Drive v3 REST client.
pub struct GoogleDrive {
    access_token: String,
    api_base: String,
    upload_base: String,
    parent_folder_id: Option<String>,
    chunk_size: u64,
    client: reqwest::Client,
}

impl GoogleDrive {
    pub fn new(config: &DriveConfig) -> Self {
        let client = reqwest::Client::builder()
            // Resumable sessions answer 308 without a Location header.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            access_token: config.access_token.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            upload_base: config.upload_base.trim_end_matches('/').to_string(),
            parent_folder_id: config.parent_folder_id.clone(),
            chunk_size: config.chunk_size(),
            client,
        }
    }

    /// Override the upload chunk size in bytes.
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn parents(&self, parent: Option<&str>) -> Vec<String> {
        parent
            .map(str::to_string)
            .or_else(|| self.parent_folder_id.clone())
            .into_iter()
            .collect()
    }

    async fn json_or_error(resp: reqwest::Response) -> Result<Value, StorageError> {
        if resp.status().is_success() {
            return Ok(resp.json().await?);
        }
        Err(api_error(resp).await)
    }
}

async fn api_error(resp: reqwest::Response) -> StorageError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or(body);
    StorageError::Api { status, message }
}

fn parse_file(data: &Value) -> Result<StoredFile, StorageError> {
    let id = data
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| StorageError::Protocol("file resource without id".into()))?;
    let size = match data.get("size") {
        Some(Value::String(s)) => s.parse().unwrap_or_default(),
        Some(Value::Number(n)) => n.as_u64().unwrap_or_default(),
        _ => 0,
    };
    Ok(StoredFile {
        id: id.to_string(),
        name: data
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        size,
        mime_type: data.get("mimeType").and_then(Value::as_str).map(str::to_string),
        link: data
            .get("webContentLink")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Parse the `Range: bytes=0-N` header of a 308 answer into bytes received.
fn received_bytes(range: Option<&str>) -> Option<u64> {
    let end = range?.strip_prefix("bytes=")?.split('-').nth(1)?;
    end.trim().parse::<u64>().ok().map(|last| last + 1)
}

#[async_trait]
impl CloudStorage for GoogleDrive {
    async fn create_folder(&self, name: &str, parent: Option<&str>) -> Result<String, StorageError> {
        let body = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME,
            "parents": self.parents(parent),
        });
        let resp = self
            .client
            .post(format!("{}/files", self.api_base))
            .bearer_auth(&self.access_token)
            .query(&[("supportsAllDrives", "true"), ("fields", "id")])
            .json(&body)
            .send()
            .await?;
        let data = Self::json_or_error(resp).await?;
        let id = parse_file(&data)?.id;
        tracing::debug!(folder = name, id = %id, "Created Drive folder");
        Ok(id)
    }

    async fn create_file(
        &self,
        path: &Path,
        name: &str,
        parent: Option<&str>,
    ) -> Result<Box<dyn ResumableUpload>, StorageError> {
        let file = tokio::fs::File::open(path).await?;
        let total = file.metadata().await?.len();

        let body = serde_json::json!({
            "name": name,
            "parents": self.parents(parent),
        });
        let resp = self
            .client
            .post(format!("{}/files", self.upload_base))
            .bearer_auth(&self.access_token)
            .query(&[
                ("uploadType", "resumable"),
                ("supportsAllDrives", "true"),
                ("fields", FILE_FIELDS),
            ])
            .header("X-Upload-Content-Length", total.to_string())
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        let session = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| StorageError::Protocol("resumable session without Location".into()))?
            .to_string();

        Ok(Box::new(DriveUpload {
            client: self.client.clone(),
            access_token: self.access_token.clone(),
            session,
            file,
            total,
            offset: 0,
            chunk_size: self.chunk_size,
        }))
    }

    async fn copy_file(&self, file_id: &str, parent: Option<&str>) -> Result<StoredFile, StorageError> {
        let body = serde_json::json!({ "parents": self.parents(parent) });
        let resp = self
            .client
            .post(format!("{}/files/{file_id}/copy", self.api_base))
            .bearer_auth(&self.access_token)
            .query(&[("supportsAllDrives", "true"), ("fields", FILE_FIELDS)])
            .json(&body)
            .send()
            .await?;
        parse_file(&Self::json_or_error(resp).await?)
    }

    async fn list(
        &self,
        query: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<FileList, StorageError> {
        let fields = format!("nextPageToken, files({FILE_FIELDS})");
        let page_size = page_size.to_string();
        let mut params = vec![
            ("q", query),
            ("pageSize", page_size.as_str()),
            ("fields", fields.as_str()),
            ("supportsAllDrives", "true"),
            ("includeItemsFromAllDrives", "true"),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }

        let resp = self
            .client
            .get(format!("{}/files", self.api_base))
            .bearer_auth(&self.access_token)
            .query(&params)
            .send()
            .await?;
        let data = Self::json_or_error(resp).await?;

        let files = data
            .get("files")
            .and_then(Value::as_array)
            .map(|files| files.iter().map(parse_file).collect::<Result<Vec<_>, _>>())
            .transpose()?
            .unwrap_or_default();
        Ok(FileList {
            files,
            next_page_token: data
                .get("nextPageToken")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    async fn get_metadata(&self, file_id: &str) -> Result<StoredFile, StorageError> {
        let resp = self
            .client
            .get(format!("{}/files/{file_id}", self.api_base))
            .bearer_auth(&self.access_token)
            .query(&[("supportsAllDrives", "true"), ("fields", FILE_FIELDS)])
            .send()
            .await?;
        parse_file(&Self::json_or_error(resp).await?)
    }

    async fn delete(&self, file_id: &str) -> Result<(), StorageError> {
        let resp = self
            .client
            .delete(format!("{}/files/{file_id}", self.api_base))
            .bearer_auth(&self.access_token)
            .query(&[("supportsAllDrives", "true")])
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(api_error(resp).await)
        }
    }

    fn folder_link(&self, folder_id: &str) -> String {
        format!("https://drive.google.com/drive/folders/{folder_id}")
    }
}

/// Chunked upload against a Drive resumable session.
struct DriveUpload {
    client: reqwest::Client,
    access_token: String,
    session: String,
    file: tokio::fs::File,
    total: u64,
    offset: u64,
    chunk_size: u64,
}

#[async_trait]
impl ResumableUpload for DriveUpload {
    async fn next_chunk(&mut self) -> Result<UploadStep, StorageError> {
        let end = self.offset.saturating_add(self.chunk_size).min(self.total);
        let len = end - self.offset;

        let mut chunk = Vec::with_capacity(usize::try_from(len).unwrap_or_default());
        self.file.seek(SeekFrom::Start(self.offset)).await?;
        (&mut self.file).take(len).read_to_end(&mut chunk).await?;
        if chunk.len() as u64 != len {
            return Err(StorageError::Protocol(format!(
                "local file shrank during upload ({} of {len} bytes read)",
                chunk.len()
            )));
        }

        let range = if self.total == 0 {
            "bytes */0".to_string()
        } else {
            format!("bytes {}-{}/{}", self.offset, end - 1, self.total)
        };

        let resp = self
            .client
            .put(&self.session)
            .bearer_auth(&self.access_token)
            .header(CONTENT_RANGE, range)
            .body(chunk)
            .send()
            .await?;

        match resp.status().as_u16() {
            200 | 201 => {
                let data: Value = resp.json().await?;
                Ok(UploadStep::Done(parse_file(&data)?))
            }
            308 => {
                let range = resp.headers().get(RANGE).and_then(|v| v.to_str().ok());
                self.offset = received_bytes(range).unwrap_or(end).min(self.total);
                Ok(UploadStep::Progress {
                    uploaded: self.offset,
                    total: self.total,
                })
            }
            _ => Err(api_error(resp).await),
        }
    }
}
