use std::collections::{HashMap, HashSet};

use tokio::sync::Mutex;

use super::{IncidentStore, StoreError, WindowQuery, MAX_SUBSCRIBERS};
use crate::models::{IncidentRecord, UpsertOutcome};

/// In-process store used by tests. Mirrors the Postgres adapter's semantics.
#[derive(Default)]
pub struct MemoryStore {
    pub incidents: Mutex<Vec<IncidentRecord>>,
    pub config: Mutex<HashMap<String, String>>,
    pub mail_list: Mutex<Vec<(String, Vec<String>)>>,
    /// Upstream ids whose writes fail, to exercise partial batches.
    pub reject_ids: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub async fn with_cursor(value: &str) -> Self {
        let store = Self::default();
        store
            .config
            .lock()
            .await
            .insert(super::SYNC_CURSOR.to_string(), value.to_string());
        store
    }

    pub async fn subscribe(&self, email: &str, topics: &[&str]) {
        self.mail_list.lock().await.push((
            email.to_string(),
            topics.iter().map(|topic| topic.to_string()).collect(),
        ));
    }

    pub async fn insert_raw(&self, record: IncidentRecord) {
        self.incidents.lock().await.push(record);
    }

    pub async fn snapshot(&self) -> Vec<IncidentRecord> {
        self.incidents.lock().await.clone()
    }

    pub async fn cursor(&self) -> Option<String> {
        self.config.lock().await.get(super::SYNC_CURSOR).cloned()
    }
}

impl IncidentStore for MemoryStore {
    async fn find_cursor<'s>(&'s self, name: &'s str) -> Result<String, StoreError> {
        self.config
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("config value '{name}'")))
    }

    async fn save_cursor<'s>(&'s self, name: &'s str, value: &'s str) -> Result<(), StoreError> {
        self.config
            .lock()
            .await
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn upsert<'s>(&'s self, record: &'s IncidentRecord) -> Result<UpsertOutcome, StoreError> {
        if self.reject_ids.lock().await.contains(&record.external_id) {
            return Err(StoreError::Database(sqlx::Error::Protocol(format!(
                "note {} is configured to fail",
                record.external_id
            ))));
        }

        let mut incidents = self.incidents.lock().await;
        let Some(key) = record.lookup_key() else {
            incidents.push(record.clone());
            return Ok(UpsertOutcome::InsertedUnkeyed);
        };

        match incidents
            .iter_mut()
            .find(|stored| stored.lookup_key() == Some(key))
        {
            Some(stored) => {
                stored.updated_at = record.updated_at.clone();
                Ok(UpsertOutcome::Updated)
            }
            None => {
                incidents.push(record.clone());
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn query_window<'s>(
        &'s self,
        query: &'s WindowQuery,
    ) -> Result<Vec<IncidentRecord>, StoreError> {
        let mut matched: Vec<IncidentRecord> = self
            .incidents
            .lock()
            .await
            .iter()
            .filter(|record| query.matches(record))
            .cloned()
            .collect();

        matched.sort_by(|a, b| b.created_ts().cmp(&a.created_ts()));
        matched.truncate(query.limit);
        Ok(matched)
    }

    async fn subscribers<'s>(&'s self, topic: &'s str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .mail_list
            .lock()
            .await
            .iter()
            .filter(|(_, topics)| topics.iter().any(|t| t == topic))
            .map(|(email, _)| email.clone())
            .take(MAX_SUBSCRIBERS)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(id: &str, updated_at: &str) -> IncidentRecord {
        IncidentRecord {
            external_id: id.to_string(),
            student_id: "S100".to_string(),
            first_name: "Avery".to_string(),
            notes: "Disrupted class".to_string(),
            next_step: "Detention".to_string(),
            created_at: "2025-01-01T09:00:00Z".to_string(),
            updated_at: updated_at.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn repeated_upsert_only_touches_updated_at() {
        let store = MemoryStore::default();
        let first = note("1", "2025-01-01T09:00:00Z");
        assert_eq!(store.upsert(&first).await.unwrap(), UpsertOutcome::Inserted);

        let mut again = note("1", "2025-01-02T09:00:00Z");
        again.notes = "Edited upstream".to_string();
        assert_eq!(store.upsert(&again).await.unwrap(), UpsertOutcome::Updated);
        assert_eq!(store.upsert(&again).await.unwrap(), UpsertOutcome::Updated);

        let stored = store.snapshot().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].updated_at, "2025-01-02T09:00:00Z");
        assert_eq!(stored[0].notes, "Disrupted class");
        assert_eq!(
            IncidentRecord {
                updated_at: first.updated_at.clone(),
                ..stored[0].clone()
            },
            first
        );
    }

    #[tokio::test]
    async fn unkeyed_notes_are_always_inserted() {
        let store = MemoryStore::default();
        let unkeyed = note("0", "2025-01-01T09:00:00Z");
        assert_eq!(
            store.upsert(&unkeyed).await.unwrap(),
            UpsertOutcome::InsertedUnkeyed
        );
        assert_eq!(
            store.upsert(&unkeyed).await.unwrap(),
            UpsertOutcome::InsertedUnkeyed
        );
        assert_eq!(store.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn missing_cursor_is_not_found() {
        let store = MemoryStore::default();
        let err = store.find_cursor(super::super::SYNC_CURSOR).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
