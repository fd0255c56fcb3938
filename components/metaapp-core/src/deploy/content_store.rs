use std::fs::File;
use std::io::Write;
use std::path::Path;

use futures_util::StreamExt;
use reqwest::Client as HttpClient;

use crate::config::Config;
use crate::node::build_http_client;

/// Stateless client for the content-addressed file store. No retries here;
/// the deploy worker owns the retry budget.
pub struct ContentStoreClient {
    base_url: String,
    http_client: HttpClient,
}

#[derive(Deserialize, Debug)]
pub struct ContentStoreResponse {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    pub data: Option<FileMetadata>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct FileMetadata {
    pub pin_id: String,
    pub content_type: String,
    pub file_extension: String,
    pub file_name: String,
    pub file_size: i64,
}

impl ContentStoreClient {
    pub fn new(config: &Config) -> ContentStoreClient {
        ContentStoreClient {
            base_url: config
                .content_store
                .base_url
                .trim_end_matches('/')
                .to_string(),
            http_client: build_http_client(config.content_store.timeout_secs),
        }
    }

    pub async fn file_metadata(&self, pin_id: &str) -> Result<FileMetadata, String> {
        let url = format!("{}/api/v1/files/{}", self.base_url, pin_id);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("unable to query content store ({})", e))?
            .json::<ContentStoreResponse>()
            .await
            .map_err(|e| format!("unable to parse content store response ({})", e))?;
        unwrap_metadata(response, pin_id)
    }

    /// Streams the raw bytes for a pin to `destination`.
    pub async fn download_content(&self, pin_id: &str, destination: &Path) -> Result<u64, String> {
        let url = format!("{}/api/v1/files/accelerate/content/{}", self.base_url, pin_id);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("unable to download content ({})", e))?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(format!(
                "content store returned status {} for {}",
                response.status().as_u16(),
                pin_id
            ));
        }

        let mut file = File::create(destination)
            .map_err(|e| format!("unable to create {}: {}", destination.display(), e))?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| format!("error while downloading content ({})", e))?;
            file.write_all(&chunk)
                .map_err(|e| format!("unable to write {}: {}", destination.display(), e))?;
            written += chunk.len() as u64;
        }
        let _ = file.flush();
        Ok(written)
    }
}

fn unwrap_metadata(response: ContentStoreResponse, pin_id: &str) -> Result<FileMetadata, String> {
    if response.code != 0 || response.data.is_none() {
        return Err(format!(
            "file not found in content store: {} (code: {}, message: {})",
            pin_id, response.code, response.message
        ));
    }
    Ok(response.data.unwrap())
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::{unwrap_metadata, ContentStoreResponse};

    fn envelope(raw: serde_json::Value) -> ContentStoreResponse {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn found_file_yields_metadata() {
        let response = envelope(json!({
            "code": 0,
            "message": "success",
            "processingTime": 3,
            "data": {
                "pin_id": "abci0",
                "content_type": "application/zip",
                "file_extension": ".zip",
                "file_name": "bundle.zip",
                "file_size": 1024
            }
        }));
        let metadata = unwrap_metadata(response, "abci0").unwrap();
        assert_eq!(metadata.file_name, "bundle.zip");
        assert_eq!(metadata.file_size, 1024);
    }

    #[test]
    fn nonzero_code_carries_the_server_message() {
        let response = envelope(json!({
            "code": 1,
            "message": "pin not indexed",
            "data": null
        }));
        let err = unwrap_metadata(response, "abci0").unwrap_err();
        assert!(err.contains("code: 1"));
        assert!(err.contains("pin not indexed"));
    }

    #[test]
    fn missing_data_is_not_found() {
        let response = envelope(json!({ "code": 0, "message": "", "data": null }));
        assert!(unwrap_metadata(response, "abci0").is_err());
    }
}
