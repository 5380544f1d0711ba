use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::models::{parse_timestamp, UpsertOutcome};
use crate::source::{IncidentSource, SourceError, PER_PAGE};
use crate::store::{IncidentStore, StoreError, SYNC_CURSOR};

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("no sync cursor configured")]
    NoCursorConfigured,

    #[error("reading sync cursor: {0}")]
    CursorRead(#[source] StoreError),

    #[error("fetching behaviour notes: {0}")]
    Source(#[from] SourceError),

    #[error("saving sync cursor: {0}")]
    CursorWrite(#[source] StoreError),
}

/// Outcome of one fetch-then-persist pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub started_at: DateTime<Utc>,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Inserted notes that carried no upstream id.
    pub unkeyed: usize,
    pub failed: usize,
    pub cursor: String,
}

pub struct Reconciler<Src, St> {
    source: Src,
    store: St,
}

impl<Src: IncidentSource, St: IncidentStore> Reconciler<Src, St> {
    pub fn new(source: Src, store: St) -> Self {
        Self { source, store }
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    /// Runs one cycle. The cursor only moves once every fetched note has been offered to the store.
    #[tracing::instrument(skip_all, fields(%started_at))]
    pub async fn run_cycle(&self, started_at: DateTime<Utc>) -> Result<CycleSummary, CycleError> {
        let cursor = match self.store.find_cursor(SYNC_CURSOR).await {
            Ok(cursor) => cursor,
            Err(StoreError::NotFound(_)) => return Err(CycleError::NoCursorConfigured),
            Err(err) => return Err(CycleError::CursorRead(err)),
        };
        tracing::info!(%cursor, "syncing behaviour notes modified since cursor");

        let since = Some(cursor.as_str()).filter(|since| !since.trim().is_empty());
        let page = self.source.fetch(since, PER_PAGE).await?;

        let mut summary = CycleSummary {
            started_at,
            fetched: page.behavior_notes.len(),
            ..Default::default()
        };

        for note in &page.behavior_notes {
            match self.store.upsert(note).await {
                Ok(UpsertOutcome::Inserted) => summary.inserted += 1,
                Ok(UpsertOutcome::Updated) => summary.updated += 1,
                Ok(UpsertOutcome::InsertedUnkeyed) => {
                    tracing::warn!(
                        student_id = %note.student_id,
                        "behaviour note has no upstream id; stored as a new record"
                    );
                    summary.unkeyed += 1;
                }
                Err(err) => {
                    tracing::error!(
                        external_id = %note.external_id,
                        error = %err,
                        "failed to save behaviour note; skipping"
                    );
                    summary.failed += 1;
                }
            }
        }

        summary.cursor = next_cursor(&cursor, started_at);
        self.store
            .save_cursor(SYNC_CURSOR, &summary.cursor)
            .await
            .map_err(CycleError::CursorWrite)?;

        tracing::info!(
            fetched = summary.fetched,
            inserted = summary.inserted,
            updated = summary.updated,
            unkeyed = summary.unkeyed,
            failed = summary.failed,
            cursor = %summary.cursor,
            "behaviour note sync complete"
        );
        Ok(summary)
    }
}

/// The cycle start time, never earlier than the previous cursor.
pub fn next_cursor(previous: &str, started_at: DateTime<Utc>) -> String {
    let next = match parse_timestamp(previous) {
        Some(previous) if previous > started_at => previous,
        _ => started_at,
    };
    next.to_rfc3339_opts(SecondsFormat::Secs, true)
}
