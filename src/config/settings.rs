use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppSettings {
    pub storage: StorageConfig,
    pub redis: RedisConfig,
    pub orchestrator: OrchestratorConfig,
    pub retry: RetryConfig,
    pub credentials: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    pub storage_root: String,
    pub file_ttl_seconds: u64,
    pub job_metadata_ttl_seconds: u64,
    pub result_ttl_seconds: u64,
    pub progress_ttl_seconds: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub max_pages_per_chunk: u32,
    pub per_key_concurrency_limit: usize,
    pub flash_tokens_per_chunk: i64,
    pub pro_tokens_per_chunk: i64,
    pub min_relevance_default: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    pub fn for_llm_generation() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            backoff_multiplier: 2.0,
        }
    }

    pub fn for_file_upload_poll() -> Self {
        Self {
            max_attempts: 60,
            base_delay_ms: 1_000,
            max_delay_ms: 1_000,
            backoff_multiplier: 1.0,
        }
    }

    pub fn for_credential_pool_wait() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 30_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 1.0,
        }
    }
}

impl AppSettings {
    pub fn from_env() -> Result<Self, AppError> {
        let storage_root =
            env::var("STORAGE_ROOT").unwrap_or_else(|_| "./storage".to_string());
        let file_ttl_seconds = env::var("FILE_TTL_SECONDS")
            .unwrap_or_else(|_| "86400".to_string())
            .parse::<u64>()
            .map_err(|_| AppError::Configuration("FILE_TTL_SECONDS must be a valid number".to_string()))?;
        let job_metadata_ttl_seconds = env::var("JOB_METADATA_TTL_SECONDS")
            .unwrap_or_else(|_| "172800".to_string())
            .parse::<u64>()
            .map_err(|_| AppError::Configuration("JOB_METADATA_TTL_SECONDS must be a valid number".to_string()))?;
        let result_ttl_seconds = env::var("RESULT_TTL_SECONDS")
            .unwrap_or_else(|_| "172800".to_string())
            .parse::<u64>()
            .map_err(|_| AppError::Configuration("RESULT_TTL_SECONDS must be a valid number".to_string()))?;
        let progress_ttl_seconds = env::var("PROGRESS_TTL_SECONDS")
            .unwrap_or_else(|_| "172800".to_string())
            .parse::<u64>()
            .map_err(|_| AppError::Configuration("PROGRESS_TTL_SECONDS must be a valid number".to_string()))?;

        let redis_url = env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://localhost:6379/0".to_string());
        let connect_timeout_ms = env::var("REDIS_CONNECT_TIMEOUT_MS")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u64>()
            .map_err(|_| AppError::Configuration("REDIS_CONNECT_TIMEOUT_MS must be a valid number".to_string()))?;
        let response_timeout_ms = env::var("REDIS_RESPONSE_TIMEOUT_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse::<u64>()
            .map_err(|_| AppError::Configuration("REDIS_RESPONSE_TIMEOUT_MS must be a valid number".to_string()))?;

        let max_pages_per_chunk = env::var("MAX_PAGES_PER_CHUNK")
            .unwrap_or_else(|_| "40".to_string())
            .parse::<u32>()
            .map_err(|_| AppError::Configuration("MAX_PAGES_PER_CHUNK must be a valid number".to_string()))?;
        let per_key_concurrency_limit = env::var("PER_KEY_CONCURRENCY_LIMIT")
            .unwrap_or_else(|_| "1".to_string())
            .parse::<usize>()
            .map_err(|_| AppError::Configuration("PER_KEY_CONCURRENCY_LIMIT must be a valid number".to_string()))?;
        let flash_tokens_per_chunk = env::var("FLASH_TOKENS_PER_CHUNK")
            .unwrap_or_else(|_| "1".to_string())
            .parse::<i64>()
            .map_err(|_| AppError::Configuration("FLASH_TOKENS_PER_CHUNK must be a valid number".to_string()))?;
        let pro_tokens_per_chunk = env::var("PRO_TOKENS_PER_CHUNK")
            .unwrap_or_else(|_| "4".to_string())
            .parse::<i64>()
            .map_err(|_| AppError::Configuration("PRO_TOKENS_PER_CHUNK must be a valid number".to_string()))?;
        let min_relevance_default = env::var("MIN_RELEVANCE_DEFAULT")
            .unwrap_or_else(|_| "80".to_string())
            .parse::<i32>()
            .map_err(|_| AppError::Configuration("MIN_RELEVANCE_DEFAULT must be a valid number".to_string()))?;

        let credentials = env::var("LLM_API_KEYS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|v: &Vec<String>| !v.is_empty())
            .or_else(|| env::var("LLM_API_KEY").ok().map(|k| vec![k]))
            .ok_or_else(|| {
                AppError::Configuration(
                    "either LLM_API_KEYS (comma-separated) or LLM_API_KEY must be set".to_string(),
                )
            })?;

        Ok(Self {
            storage: StorageConfig {
                storage_root,
                file_ttl_seconds,
                job_metadata_ttl_seconds,
                result_ttl_seconds,
                progress_ttl_seconds,
            },
            redis: RedisConfig {
                url: redis_url,
                connect_timeout_ms,
                response_timeout_ms,
            },
            orchestrator: OrchestratorConfig {
                max_pages_per_chunk,
                per_key_concurrency_limit,
                flash_tokens_per_chunk,
                pro_tokens_per_chunk,
                min_relevance_default,
            },
            retry: RetryConfig::for_llm_generation(),
            credentials,
        })
    }
}
