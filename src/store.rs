use std::future::Future;

use chrono::{DateTime, Utc};

use crate::models::{IncidentRecord, StepCategory, UpsertOutcome};

#[cfg(test)]
pub mod memory;

/// Config row holding the timestamp of the last completed sync.
pub const SYNC_CURSOR: &str = "last_behavior_sync_datetime";

/// Subscription topic for the detention report.
pub const BEHAVIOUR_TOPIC: &str = "behavior";

pub const MAX_SUBSCRIBERS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Filtered read over stored incidents: newest first by `created_at`.
#[derive(Debug, Clone)]
pub struct WindowQuery {
    pub categories: Vec<StepCategory>,
    pub outstanding_only: bool,
    /// Inclusive lower bound on `created_at`.
    pub since: DateTime<Utc>,
    pub limit: usize,
}

impl WindowQuery {
    /// Predicate applied by stores that filter in process.
    pub fn matches(&self, record: &IncidentRecord) -> bool {
        if self.outstanding_only && record.action_complete {
            return false;
        }
        if !self.categories.contains(&record.step_category()) {
            return false;
        }
        record
            .created_ts()
            .map(|created| created >= self.since)
            .unwrap_or(false)
    }
}

pub trait IncidentStore: Send + Sync + 'static {
    fn find_cursor<'s>(
        &'s self,
        name: &'s str,
    ) -> impl Future<Output = Result<String, StoreError>> + Send + 's;

    fn save_cursor<'s>(
        &'s self,
        name: &'s str,
        value: &'s str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 's;

    /// Inserts the note, or touches `updated_at` on the stored note with the same upstream id.
    fn upsert<'s>(
        &'s self,
        record: &'s IncidentRecord,
    ) -> impl Future<Output = Result<UpsertOutcome, StoreError>> + Send + 's;

    fn query_window<'s>(
        &'s self,
        query: &'s WindowQuery,
    ) -> impl Future<Output = Result<Vec<IncidentRecord>, StoreError>> + Send + 's;

    fn subscribers<'s>(
        &'s self,
        topic: &'s str,
    ) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send + 's;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(step: &str, created_at: DateTime<Utc>, complete: bool) -> IncidentRecord {
        IncidentRecord {
            next_step: step.to_string(),
            created_at: created_at.to_rfc3339(),
            action_complete: complete,
            ..Default::default()
        }
    }

    #[test]
    fn window_query_filters_category_completion_and_bound() {
        let now = Utc::now();
        let query = WindowQuery {
            categories: StepCategory::DETENTIONS.to_vec(),
            outstanding_only: true,
            since: now - Duration::days(7),
            limit: 10,
        };

        assert!(query.matches(&record("Detention", now, false)));
        assert!(!query.matches(&record("Detention", now, true)));
        assert!(!query.matches(&record("Parent call", now, false)));
        assert!(!query.matches(&record("Detention", now - Duration::days(8), false)));

        let mut unparseable = record("Detention", now, false);
        unparseable.created_at = "yesterday".to_string();
        assert!(!query.matches(&unparseable));
    }
}
