use std::error::Error as StdError;
use std::fmt;

/// Crate-wide error taxonomy. One variant per row of the error handling
/// design: quota/rate-limit, permission, prompt-blocked, upload failure,
/// parse failure, PDF failure, storage failure, cancellation, and token
/// exhaustion, plus the component-level plumbing errors every layer needs.
#[derive(Debug, Clone)]
pub enum AppError {
    /// LLM RPC returned 429 / "quota" / "rate limit".
    QuotaExceeded(String),
    /// LLM RPC returned 403.
    PermissionDenied(String),
    /// LLM vendor safety filter blocked the prompt. Never retried, never split.
    PromptBlocked(String),
    /// File upload to the LLM vendor failed after retries.
    FileUploadFailed(String),
    /// Response Parser could not recover a usable JSON object.
    ParseError(String),
    /// Response Parser recovered JSON but it failed validation heuristics.
    Suspicious(String),
    /// PDF Operations failed to read or slice a PDF.
    PdfInvalid(String),
    /// KV/Blob store adapter is unreachable and no local-disk fallback exists.
    StorageUnavailable(String),
    /// Cooperative cancellation flag observed, or token exhaustion mid-job.
    Cancelled(String),
    /// Token ledger has insufficient balance for the requested deduction.
    InsufficientTokens(String),
    /// No credential is configured, or all credentials are exhausted.
    NoCredentialsAvailable(String),
    Configuration(String),
    NotFound(String),
    Validation(String),
    Internal(String),
    Serialization(String),
    LockPoisoned(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::QuotaExceeded(e) => write!(f, "Quota or rate limit exceeded: {}", e),
            AppError::PermissionDenied(e) => write!(f, "Permission denied: {}", e),
            AppError::PromptBlocked(e) => write!(f, "Prompt blocked: {}", e),
            AppError::FileUploadFailed(e) => write!(f, "File upload failed: {}", e),
            AppError::ParseError(e) => write!(f, "Parse error: {}", e),
            AppError::Suspicious(e) => write!(f, "Suspicious response: {}", e),
            AppError::PdfInvalid(e) => write!(f, "Invalid PDF: {}", e),
            AppError::StorageUnavailable(e) => write!(f, "Storage unavailable: {}", e),
            AppError::Cancelled(e) => write!(f, "Cancelled: {}", e),
            AppError::InsufficientTokens(e) => write!(f, "Insufficient tokens: {}", e),
            AppError::NoCredentialsAvailable(e) => write!(f, "No credentials available: {}", e),
            AppError::Configuration(e) => write!(f, "Configuration error: {}", e),
            AppError::NotFound(e) => write!(f, "Not found: {}", e),
            AppError::Validation(e) => write!(f, "Validation error: {}", e),
            AppError::Internal(e) => write!(f, "Internal error: {}", e),
            AppError::Serialization(e) => write!(f, "Serialization error: {}", e),
            AppError::LockPoisoned(e) => write!(f, "Lock poisoned: {}", e),
        }
    }
}

impl StdError for AppError {}

impl AppError {
    /// True when the failure kind should never be retried locally and should
    /// never trigger an adaptive split (the PromptBlocked row of the error
    /// taxonomy; P7).
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            AppError::PromptBlocked(_)
                | AppError::Validation(_)
                | AppError::NotFound(_)
                | AppError::Configuration(_)
                | AppError::PdfInvalid(_)
                | AppError::Cancelled(_)
                | AppError::InsufficientTokens(_)
        )
    }

    /// True when the failure should advance the credential's failure counter
    /// (quota/permission/generic RPC failures), as opposed to local/plumbing
    /// errors that say nothing about the credential's health.
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            AppError::QuotaExceeded(_)
                | AppError::PermissionDenied(_)
                | AppError::PromptBlocked(_)
                | AppError::FileUploadFailed(_)
        )
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::Serialization(format!("JSON error: {}", error))
    }
}

impl From<std::io::Error> for AppError {
    fn from(error: std::io::Error) -> Self {
        AppError::Internal(format!("I/O error: {}", error))
    }
}

impl From<redis::RedisError> for AppError {
    fn from(error: redis::RedisError) -> Self {
        AppError::StorageUnavailable(format!("Redis error: {}", error))
    }
}

pub type AppResult<T> = Result<T, AppError>;
