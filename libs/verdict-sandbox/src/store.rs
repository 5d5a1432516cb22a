//! Persistence boundary for submission records.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use verdict_common::types::Submission;

/// Where submission records are read once and written at checkpoints
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn load(&self, id: u64) -> Result<Option<Submission>>;
    async fn save(&self, submission: &Submission) -> Result<()>;
}

/// Records stored as JSON in Redis
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl SubmissionStore for RedisStore {
    async fn load(&self, id: u64) -> Result<Option<Submission>> {
        let mut conn = self.conn.clone();
        verdict_common::redis::load_submission(&mut conn, id)
            .await
            .with_context(|| format!("Failed to load submission {}", id))
    }

    async fn save(&self, submission: &Submission) -> Result<()> {
        let mut conn = self.conn.clone();
        verdict_common::redis::store_submission(&mut conn, submission)
            .await
            .with_context(|| format!("Failed to store submission {}", submission.id))
    }
}

/// Process-local store; keeps every saved snapshot in order
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<u64, Submission>>,
    history: Mutex<Vec<Submission>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, submission: Submission) {
        if let Ok(mut records) = self.records.lock() {
            records.insert(submission.id, submission);
        }
    }

    /// Every snapshot passed to `save`, oldest first
    pub fn history(&self) -> Vec<Submission> {
        self.history
            .lock()
            .map(|history| history.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn load(&self, id: u64) -> Result<Option<Submission>> {
        let records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?;
        Ok(records.get(&id).cloned())
    }

    async fn save(&self, submission: &Submission) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?
            .insert(submission.id, submission.clone());
        self.history
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?
            .push(submission.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verdict_common::types::{LanguageSpec, SubmissionState};

    fn submission(id: u64) -> Submission {
        Submission::new(
            id,
            LanguageSpec {
                name: "python".to_string(),
                source_file: "script.py".to_string(),
                compile_cmd: None,
                run_cmd: "python3 script.py".to_string(),
            },
            "print(1)",
        )
    }

    #[tokio::test]
    async fn test_memory_store_round_trip_and_history() {
        let store = MemoryStore::new();
        assert!(store.load(1).await.unwrap().is_none());

        store.insert(submission(1));
        let mut record = store.load(1).await.unwrap().unwrap();
        assert!(store.history().is_empty());

        record.state = SubmissionState::Running;
        store.save(&record).await.unwrap();
        record.state = SubmissionState::Completed;
        store.save(&record).await.unwrap();

        let states: Vec<_> = store.history().iter().map(|s| s.state).collect();
        assert_eq!(states, vec![SubmissionState::Running, SubmissionState::Completed]);
        assert_eq!(
            store.load(1).await.unwrap().unwrap().state,
            SubmissionState::Completed
        );
    }
}
