//! Persistence of session records.
//!
//! The manager upserts a [`SessionRecord`] on every status change and every
//! cost or token update. Failures are logged by the caller and never fail a
//! control call.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use mission_protocol::SessionId;
use mission_protocol::SessionRecord;
use tokio::sync::Mutex;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn upsert(&self, record: &SessionRecord) -> anyhow::Result<()>;

    async fn load(&self, id: &SessionId) -> anyhow::Result<Option<SessionRecord>>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    records: Mutex<HashMap<SessionId, SessionRecord>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<SessionRecord> {
        let records = self.records.lock().await;
        let mut out: Vec<SessionRecord> = records.values().cloned().collect();
        out.sort_by_key(|record| record.created_at);
        out
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn upsert(&self, record: &SessionRecord) -> anyhow::Result<()> {
        self.records
            .lock()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, id: &SessionId) -> anyhow::Result<Option<SessionRecord>> {
        Ok(self.records.lock().await.get(id).cloned())
    }
}

/// One `<id>.json` file per session, replaced atomically on every upsert.
pub struct JsonFileSessionStore {
    dir: PathBuf,
}

impl JsonFileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &SessionId) -> PathBuf {
        let file_name: String = id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{file_name}.json"))
    }
}

#[async_trait]
impl SessionStore for JsonFileSessionStore {
    async fn upsert(&self, record: &SessionRecord) -> anyhow::Result<()> {
        let dir = self.dir.clone();
        let path = self.path_for(&record.id);
        let bytes = serde_json::to_vec_pretty(record)?;
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.flush()?;
            tmp.persist(&path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            Ok(())
        })
        .await?
    }

    async fn load(&self, id: &SessionId) -> anyhow::Result<Option<SessionRecord>> {
        let path = self.path_for(id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).with_context(|| {
                format!("failed to parse {}", path.display())
            })?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mission_protocol::ApprovalMode;
    use mission_protocol::ExecutionMode;
    use mission_protocol::SessionStatus;
    use pretty_assertions::assert_eq;

    fn record(id: &str, status: SessionStatus) -> SessionRecord {
        SessionRecord {
            id: SessionId::from(id),
            machine_id: None,
            mode: ExecutionMode::Streaming,
            approval_mode: ApprovalMode::Manual,
            status,
            task: "task".to_string(),
            cost: 0.25,
            tokens_in: 10,
            tokens_out: 5,
            tool_calls: 1,
            restart_count: 0,
            error_message: None,
            conversation_id: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn json_store_replaces_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSessionStore::new(dir.path().join("sessions"));

        store.upsert(&record("a/b", SessionStatus::Working)).await.unwrap();
        let mut done = record("a/b", SessionStatus::Done);
        done.error_message = Some("Killed by user".to_string());
        store.upsert(&done).await.unwrap();

        let loaded = store.load(&SessionId::from("a/b")).await.unwrap();
        assert_eq!(loaded, Some(done));
        assert!(dir.path().join("sessions").join("a_b.json").exists());
        assert_eq!(store.load(&SessionId::from("missing")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = InMemorySessionStore::new();
        store.upsert(&record("a", SessionStatus::Idle)).await.unwrap();
        assert_eq!(store.records().await.len(), 1);
        assert!(store.load(&SessionId::from("a")).await.unwrap().is_some());
    }
}
