pub mod cancellation;
pub mod files;
pub mod jobs;
pub mod progress;
pub mod results;
pub mod tokens;

use std::sync::Arc;

use crate::config::settings::StorageConfig;
use crate::kv::KvStore;

pub use cancellation::CancellationStore;
pub use files::FileStore;
pub use jobs::{JobMetadata, JobMode, JobStore, ModelTier};
pub use progress::{ProgressRecord, ProgressStore};
pub use results::ResultStore;
pub use tokens::TokenAccountant;

/// Storage Service (§4.1): the single facade every other component talks to
/// for durable state. Each sub-store owns its own key namespace; none of
/// them reach into another's keys directly.
pub struct StorageService {
    pub files: FileStore,
    pub jobs: JobStore,
    pub progress: Arc<ProgressStore>,
    pub results: ResultStore,
    pub cancellation: Arc<CancellationStore>,
    pub tokens: Arc<TokenAccountant>,
}

impl StorageService {
    pub fn new(kv: Arc<dyn KvStore>, config: StorageConfig) -> Self {
        let progress = Arc::new(ProgressStore::new(kv.clone(), config.clone()));
        let cancellation = Arc::new(CancellationStore::new(kv.clone()));
        let tokens = Arc::new(TokenAccountant::new(kv.clone(), progress.clone(), cancellation.clone()));
        Self {
            files: FileStore::new(kv.clone(), config.clone()),
            jobs: JobStore::new(kv.clone(), config.clone()),
            progress,
            results: ResultStore::new(kv.clone(), config.clone()),
            cancellation,
            tokens,
        }
    }
}
