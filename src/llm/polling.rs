use reqwest::Client;
use tokio::time::{sleep, Duration, Instant};
use tracing::{info, warn};

use crate::error::AppError;
use crate::llm::{FileState, UploadedFile};

/// Poll a freshly uploaded file until the vendor reports it ACTIVE.
/// Bounded by wall-clock duration rather than a fixed attempt count, since
/// the vendor's processing time scales with file size.
pub async fn wait_until_active(
    client: &Client,
    api_key: &str,
    base_url: &str,
    mut file: UploadedFile,
) -> Result<UploadedFile, AppError> {
    let start = Instant::now();
    let max_duration = Duration::from_secs(300);
    let mut attempt: u32 = 0;

    while file.state == FileState::Processing {
        if start.elapsed() > max_duration {
            return Err(AppError::FileUploadFailed(format!(
                "file {} still processing after {}s",
                file.name,
                max_duration.as_secs()
            )));
        }

        sleep(Duration::from_secs(2)).await;
        attempt += 1;

        let url = format!("{}/{}?key={}", base_url, file.name, api_key);
        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::FileUploadFailed(format!("failed to poll file status: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::FileUploadFailed(format!(
                "polling file {} failed with status {}: {}",
                file.name, status, body
            )));
        }

        let polled: RawFile = response
            .json()
            .await
            .map_err(|e| AppError::FileUploadFailed(format!("malformed file status response: {}", e)))?;
        file = polled.into_uploaded_file()?;

        if attempt % 10 == 0 {
            info!(file = %file.name, elapsed_secs = start.elapsed().as_secs(), "still waiting for file to become active");
        }
    }

    if file.state == FileState::Failed {
        warn!(file = %file.name, "vendor reported file processing failure");
        return Err(AppError::FileUploadFailed(format!("file {} failed processing", file.name)));
    }

    Ok(file)
}

#[derive(serde::Deserialize)]
pub struct RawFile {
    pub name: String,
    pub uri: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub state: String,
}

impl RawFile {
    pub fn into_uploaded_file(self) -> Result<UploadedFile, AppError> {
        let state = match self.state.as_str() {
            "PROCESSING" => FileState::Processing,
            "ACTIVE" => FileState::Active,
            "FAILED" => FileState::Failed,
            other => {
                return Err(AppError::FileUploadFailed(format!(
                    "unrecognized file state: {}",
                    other
                )))
            }
        };
        Ok(UploadedFile {
            name: self.name,
            uri: self.uri,
            mime_type: self.mime_type,
            state,
        })
    }
}
