use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use tracing::{debug, info, instrument, warn};

use crate::error::AppError;
use crate::llm::polling::{wait_until_active, RawFile};
use crate::llm::{GenerationRequest, GenerationResponse, LlmClient, UploadedFile};

const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const GOOGLE_UPLOAD_URL: &str = "https://generativelanguage.googleapis.com/upload/v1beta/files";
const GOOGLE_FILES_URL: &str = "https://generativelanguage.googleapis.com/v1beta/files";

/// A single credential's binding to the vendor API. The Credential Pool
/// owns one of these per key; this struct itself carries no cooldown or
/// failure-tracking state, just the HTTP plumbing.
pub struct GoogleLlmClient {
    client: Client,
    api_key: String,
    model: String,
}

impl GoogleLlmClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self { client: Client::new(), api_key, model }
    }

    fn redacted_key(&self) -> String {
        let tail = if self.api_key.len() > 4 { &self.api_key[self.api_key.len() - 4..] } else { "****" };
        format!("...{}", tail)
    }
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct GoogleChatRequest {
    contents: Vec<GoogleContent>,
    system_instruction: Option<GoogleSystemInstruction>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct GoogleSystemInstruction {
    parts: Vec<GooglePart>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct GoogleContent {
    role: String,
    parts: Vec<GooglePart>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
enum GooglePart {
    Text { text: String },
    FileData { file_data: GoogleFileData },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct GoogleFileData {
    mime_type: String,
    file_uri: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleChatResponse {
    candidates: Vec<GoogleCandidate>,
    usage_metadata: Option<GoogleUsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleCandidate {
    content: Option<GoogleResponseContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleResponseContent {
    parts: Vec<GoogleResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GoogleResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleUsageMetadata {
    prompt_token_count: i32,
    candidates_token_count: i32,
}

#[async_trait]
impl LlmClient for GoogleLlmClient {
    #[instrument(skip(self, bytes), fields(key = %self.redacted_key()))]
    async fn upload_file(&self, bytes: &[u8], display_name: &str, mime_type: &str) -> Result<UploadedFile, AppError> {
        let metadata = serde_json::json!({ "file": { "displayName": display_name } });
        let form = reqwest::multipart::Form::new()
            .text("metadata", metadata.to_string())
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes.to_vec())
                    .mime_str(mime_type)
                    .map_err(|e| AppError::FileUploadFailed(format!("invalid mime type {}: {}", mime_type, e)))?,
            );

        info!(display_name, size = bytes.len(), "uploading file to vendor");
        let url = format!("{}?key={}", GOOGLE_UPLOAD_URL, self.api_key);
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| AppError::FileUploadFailed(format!("upload request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::FileUploadFailed(format!(
                "upload of {} failed with status {}: {}",
                display_name, status, body
            )));
        }

        #[derive(Deserialize)]
        struct UploadEnvelope {
            file: RawFile,
        }
        let envelope: UploadEnvelope = response
            .json()
            .await
            .map_err(|e| AppError::FileUploadFailed(format!("malformed upload response: {}", e)))?;
        let file = envelope.file.into_uploaded_file()?;

        let active = wait_until_active(&self.client, &self.api_key, GOOGLE_FILES_URL, file).await?;
        info!(display_name, name = %active.name, "file is active");
        Ok(active)
    }

    #[instrument(skip(self), fields(key = %self.redacted_key()))]
    async fn delete_file(&self, name: &str) -> Result<(), AppError> {
        let url = format!("{}/{}?key={}", GOOGLE_FILES_URL, name, self.api_key);
        for attempt in 0..3u32 {
            let result = self.client.delete(&url).send().await;
            match result {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    warn!(name, attempt, status = %response.status(), "delete_file failed");
                }
                Err(e) => {
                    warn!(name, attempt, error = %e, "delete_file request error");
                }
            }
            if attempt < 2 {
                tokio::time::sleep(std::time::Duration::from_secs(2u64.pow(attempt))).await;
            }
        }
        Err(AppError::Internal(format!("failed to delete file {} after retries", name)))
    }

    #[instrument(skip(self), fields(key = %self.redacted_key()))]
    async fn list_files(&self) -> Result<Vec<UploadedFile>, AppError> {
        let url = format!("{}?key={}", GOOGLE_FILES_URL, self.api_key);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::Internal(format!("list_files request failed: {}", e)))?;
        if !response.status().is_success() {
            return Ok(Vec::new());
        }
        #[derive(Deserialize)]
        struct ListEnvelope {
            #[serde(default)]
            files: Vec<RawFile>,
        }
        let envelope: ListEnvelope = response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("malformed list_files response: {}", e)))?;
        Ok(envelope
            .files
            .into_iter()
            .filter_map(|f| f.into_uploaded_file().ok())
            .collect())
    }

    #[instrument(skip(self, request), fields(key = %self.redacted_key(), model = %self.model))]
    async fn generate_content(&self, request: &GenerationRequest) -> Result<GenerationResponse, AppError> {
        let mut parts = Vec::new();
        for (mime_type, uri) in &request.file_uris {
            parts.push(GooglePart::FileData {
                file_data: GoogleFileData { mime_type: mime_type.clone(), file_uri: uri.clone() },
            });
        }
        parts.push(GooglePart::Text { text: request.prompt.clone() });

        let body = GoogleChatRequest {
            contents: vec![GoogleContent { role: "user".to_string(), parts }],
            system_instruction: request
                .system_prompt
                .as_ref()
                .map(|p| GoogleSystemInstruction { parts: vec![GooglePart::Text { text: p.clone() }] }),
        };

        let url = format!("{}/models/{}:generateContent?key={}", GOOGLE_BASE_URL, self.model, self.api_key);
        debug!(url = %url.replace(&self.api_key, "[REDACTED]"), "sending generateContent request");

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Internal(format!("generateContent request failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(AppError::QuotaExceeded(format!("vendor rate limit: {}", status)));
        }
        if status.as_u16() == 403 {
            return Err(AppError::PermissionDenied(format!("vendor permission denied: {}", status)));
        }
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(AppError::Internal(format!(
                "generateContent failed with status {}: {}",
                status, body_text
            )));
        }

        let parsed: GoogleChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::ParseError(format!("malformed generateContent response: {}", e)))?;

        let candidate = parsed.candidates.into_iter().next();
        let finish_reason = candidate.as_ref().and_then(|c| c.finish_reason.clone());

        if let Some(reason) = &finish_reason {
            if reason == "SAFETY" || reason == "PROHIBITED_CONTENT" {
                return Err(AppError::PromptBlocked(format!("response blocked: {}", reason)));
            }
        }

        let text = candidate
            .and_then(|c| c.content)
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let (prompt_tokens, output_tokens) = parsed
            .usage_metadata
            .map(|u| (u.prompt_token_count, u.candidates_token_count))
            .unwrap_or((0, 0));

        Ok(GenerationResponse { text, finish_reason, prompt_tokens, output_tokens })
    }
}
