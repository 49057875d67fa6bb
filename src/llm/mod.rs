//! LLM Client Adapter (§4.2): the boundary between this crate and the
//! vendor's generative API. One [`LlmClient`] instance is bound to exactly
//! one credential; the Credential Pool is what juggles several of them.

pub mod google_client;
pub mod polling;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

/// A file handle returned by the vendor after upload, before or after it has
/// finished processing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadedFile {
    pub name: String,
    pub uri: String,
    pub mime_type: String,
    pub state: FileState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileState {
    Processing,
    Active,
    Failed,
}

/// One content generation call: a system prompt, the uploaded file(s) to
/// ground it on, and the user-facing instruction text.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub system_prompt: Option<String>,
    pub file_uris: Vec<(String, String)>, // (mime_type, uri)
    pub prompt: String,
}

#[derive(Clone, Debug)]
pub struct GenerationResponse {
    pub text: String,
    pub finish_reason: Option<String>,
    pub prompt_tokens: i32,
    pub output_tokens: i32,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Uploads `bytes` and blocks until the vendor reports the file ACTIVE
    /// (or returns an error once it reports FAILED or polling times out).
    async fn upload_file(&self, bytes: &[u8], display_name: &str, mime_type: &str) -> AppResult<UploadedFile>;

    async fn delete_file(&self, name: &str) -> AppResult<()>;

    async fn list_files(&self) -> AppResult<Vec<UploadedFile>>;

    async fn generate_content(&self, request: &GenerationRequest) -> AppResult<GenerationResponse>;
}
