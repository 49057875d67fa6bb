use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::config::settings::StorageConfig;
use crate::error::{AppError, AppResult};
use crate::kv::KvStore;

/// Results sub-responsibility of the Storage Service: one KV entry per result
/// file, mirrored to disk under `results/<job>/<filename>` so downloads can
/// be served without round-tripping through Redis.
pub struct ResultStore {
    kv: Arc<dyn KvStore>,
    config: StorageConfig,
}

impl ResultStore {
    pub fn new(kv: Arc<dyn KvStore>, config: StorageConfig) -> Self {
        Self { kv, config }
    }

    fn key(job_id: &str, filename: &str) -> String {
        format!("result:{}:{}", job_id, filename)
    }

    fn scan_pattern(job_id: &str) -> String {
        format!("result:{}:*", job_id)
    }

    fn local_dir(&self, job_id: &str) -> PathBuf {
        Path::new(&self.config.storage_root).join("results").join(job_id)
    }

    #[instrument(skip(self, content))]
    pub async fn store(&self, job_id: &str, filename: &str, content: &[u8]) -> AppResult<String> {
        let key = Self::key(job_id, filename);
        self.kv.setex(&key, self.config.result_ttl_seconds, content).await?;

        let path = self.local_dir(job_id).join(filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        info!(key = %key, path = %path.display(), "stored result file");
        Ok(key)
    }

    pub async fn get(&self, job_id: &str, filename: &str) -> AppResult<Option<Vec<u8>>> {
        self.kv.get(&Self::key(job_id, filename)).await
    }

    pub async fn get_path(&self, job_id: &str, filename: &str) -> AppResult<PathBuf> {
        let path = self.local_dir(job_id).join(filename);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(AppError::NotFound(format!(
                "result file not found on disk: {}",
                path.display()
            )));
        }
        Ok(path)
    }

    pub async fn read_file(&self, job_id: &str, filename: &str) -> AppResult<Vec<u8>> {
        let path = self.get_path(job_id, filename).await?;
        Ok(tokio::fs::read(&path).await?)
    }

    pub async fn list(&self, job_id: &str) -> AppResult<Vec<String>> {
        let prefix = format!("result:{}:", job_id);
        let keys = self.kv.scan(&Self::scan_pattern(job_id)).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(|s| s.to_string()))
            .collect())
    }

    pub async fn delete(&self, job_id: &str, filename: &str) -> AppResult<()> {
        self.kv.del(&Self::key(job_id, filename)).await?;
        let path = self.local_dir(job_id).join(filename);
        let _ = tokio::fs::remove_file(&path).await;
        Ok(())
    }

    pub async fn delete_all(&self, job_id: &str) -> AppResult<()> {
        for filename in self.list(job_id).await? {
            self.delete(job_id, &filename).await?;
        }
        let dir = self.local_dir(job_id);
        let _ = tokio::fs::remove_dir_all(&dir).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory_store::MemoryKv;

    fn config(root: &str) -> StorageConfig {
        StorageConfig {
            storage_root: root.to_string(),
            file_ttl_seconds: 86400,
            job_metadata_ttl_seconds: 172800,
            result_ttl_seconds: 172800,
            progress_ttl_seconds: 172800,
        }
    }

    #[tokio::test]
    async fn store_list_and_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(Arc::new(MemoryKv::new()), config(dir.path().to_str().unwrap()));
        store.store("job1", "report.json", b"{}").await.unwrap();
        store.store("job1", "summary.txt", b"done").await.unwrap();

        let mut names = store.list("job1").await.unwrap();
        names.sort();
        assert_eq!(names, vec!["report.json", "summary.txt"]);

        let content = store.read_file("job1", "report.json").await.unwrap();
        assert_eq!(content, b"{}");

        store.delete("job1", "report.json").await.unwrap();
        let names = store.list("job1").await.unwrap();
        assert_eq!(names, vec!["summary.txt"]);
    }

    #[tokio::test]
    async fn delete_all_clears_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(Arc::new(MemoryKv::new()), config(dir.path().to_str().unwrap()));
        store.store("job1", "a.json", b"1").await.unwrap();
        store.store("job1", "b.json", b"2").await.unwrap();
        store.delete_all("job1").await.unwrap();
        assert!(store.list("job1").await.unwrap().is_empty());
    }
}
