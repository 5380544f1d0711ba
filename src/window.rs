use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::models::{IncidentRecord, StepCategory, StudentRepeatSummary};
use crate::store::{IncidentStore, StoreError, WindowQuery};

pub const DEFAULT_WINDOW_DAYS: i64 = 7;

/// Longest window the aggregator will look back over.
pub const MAX_WINDOW_DAYS: i64 = 3650;

/// Minimum notes in the window before a student is reported as a repeat offender.
pub const REPEAT_THRESHOLD: usize = 2;

const OUTSTANDING_LIMIT: usize = 200;
const REPEAT_SCAN_LIMIT: usize = 500;

pub fn window_start(now: DateTime<Utc>, window_days: i64) -> DateTime<Utc> {
    now - Duration::days(window_days.clamp(1, MAX_WINDOW_DAYS))
}

/// Outstanding detentions created within the window, newest first.
pub async fn collect_window_candidates<S: IncidentStore>(
    store: &S,
    window_days: i64,
    now: DateTime<Utc>,
) -> Result<Vec<IncidentRecord>, StoreError> {
    let query = WindowQuery {
        categories: StepCategory::DETENTIONS.to_vec(),
        outstanding_only: true,
        since: window_start(now, window_days),
        limit: OUTSTANDING_LIMIT,
    };
    let notes = store.query_window(&query).await?;
    tracing::debug!(count = notes.len(), window_days, "collected outstanding detentions");
    Ok(notes)
}

/// Students with at least [`REPEAT_THRESHOLD`] detentions in the window, complete or not.
pub async fn group_repeat_offenders<S: IncidentStore>(
    store: &S,
    window_days: i64,
    now: DateTime<Utc>,
) -> Result<Vec<StudentRepeatSummary>, StoreError> {
    let query = WindowQuery {
        categories: StepCategory::REPEATABLE.to_vec(),
        outstanding_only: false,
        since: window_start(now, window_days),
        limit: REPEAT_SCAN_LIMIT,
    };
    let notes = store.query_window(&query).await?;
    let offenders = group_by_student(notes);

    for student in &offenders {
        tracing::info!(
            student_id = %student.student_id,
            name = %student.student_name(),
            grade = %student.grade,
            email = %student.email,
            detentions = student.detention_count,
            "student has multiple detentions in window"
        );
    }
    Ok(offenders)
}

/// Logs the current pending and repeat-offender counts. Failures are logged, not returned.
pub async fn log_window_summary<S: IncidentStore>(store: &S, window_days: i64, now: DateTime<Utc>) {
    match collect_window_candidates(store, window_days, now).await {
        Ok(pending) => tracing::info!(pending = pending.len(), "pending detentions in window"),
        Err(err) => tracing::error!(error = %err, "failed to count pending detentions"),
    }
    match group_repeat_offenders(store, window_days, now).await {
        Ok(offenders) => tracing::info!(
            students = offenders.len(),
            "students with multiple detentions in window"
        ),
        Err(err) => tracing::error!(error = %err, "failed to group repeat offenders"),
    }
}

/// Groups notes by student in first-seen order. Name and grade come from each group's first note.
pub fn group_by_student(notes: Vec<IncidentRecord>) -> Vec<StudentRepeatSummary> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<IncidentRecord>> = Vec::new();

    for note in notes {
        match index.get(&note.student_id) {
            Some(&slot) => groups[slot].push(note),
            None => {
                index.insert(note.student_id.clone(), groups.len());
                groups.push(vec![note]);
            }
        }
    }

    groups
        .into_iter()
        .filter(|notes| notes.len() >= REPEAT_THRESHOLD)
        .map(|notes| {
            let first = &notes[0];
            StudentRepeatSummary {
                student_id: first.student_id.clone(),
                first_name: first.first_name.clone(),
                last_name: first.last_name.clone(),
                email: first.email.clone(),
                grade: first.grade.clone(),
                detention_count: notes.len(),
                detention_notes: notes,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use chrono::{SecondsFormat, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
    }

    fn note(id: &str, student: &str, step: &str, created: DateTime<Utc>) -> IncidentRecord {
        IncidentRecord {
            external_id: id.to_string(),
            student_id: student.to_string(),
            first_name: format!("First{student}"),
            last_name: "Student".to_string(),
            grade: "9".to_string(),
            next_step: step.to_string(),
            created_at: created.to_rfc3339_opts(SecondsFormat::Secs, true),
            ..Default::default()
        }
    }

    #[test]
    fn window_start_counts_back_whole_days() {
        assert_eq!(
            window_start(now(), 7),
            Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap()
        );
        assert_eq!(window_start(now(), 0), window_start(now(), 1));
        assert_eq!(
            window_start(now(), 200_000_000),
            now() - Duration::days(MAX_WINDOW_DAYS)
        );
    }

    #[tokio::test]
    async fn window_lower_bound_is_inclusive() {
        let boundary = now() - Duration::days(7);
        let store = MemoryStore::default();
        store.insert_raw(note("1", "S1", "Detention", boundary)).await;
        store
            .insert_raw(note("2", "S2", "Detention", boundary - Duration::seconds(1)))
            .await;

        let candidates = collect_window_candidates(&store, 7, now()).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].external_id, "1");
    }

    #[tokio::test]
    async fn candidates_skip_completed_and_other_steps() {
        let store = MemoryStore::default();
        let mut done = note("1", "S1", "Detention", now() - Duration::days(1));
        done.action_complete = true;
        store.insert_raw(done).await;
        store
            .insert_raw(note("2", "S1", "Parent call", now() - Duration::days(1)))
            .await;
        store
            .insert_raw(note("3", "S1", "Lunchtime reflection", now() - Duration::days(1)))
            .await;
        store
            .insert_raw(note("4", "S2", "Lunchtime Detention", now() - Duration::days(2)))
            .await;
        store
            .insert_raw(note("5", "S3", "After-school Detention", now() - Duration::hours(1)))
            .await;

        let candidates = collect_window_candidates(&store, 7, now()).await.unwrap();
        let ids: Vec<&str> = candidates.iter().map(|n| n.external_id.as_str()).collect();
        assert_eq!(ids, vec!["5", "4"]);
    }

    #[tokio::test]
    async fn detention_steps_match_regardless_of_case() {
        let store = MemoryStore::default();
        store
            .insert_raw(note("1", "S100", "After-school detention", now() - Duration::days(1)))
            .await;
        store
            .insert_raw(note("2", "S100", "DETENTION", now() - Duration::days(1)))
            .await;

        let candidates = collect_window_candidates(&store, 7, now()).await.unwrap();
        assert_eq!(candidates.len(), 2);

        let offenders = group_repeat_offenders(&store, 7, now()).await.unwrap();
        assert_eq!(offenders.len(), 1);
        assert_eq!(offenders[0].student_id, "S100");
        assert_eq!(offenders[0].detention_count, 2);
    }

    #[tokio::test]
    async fn single_detention_is_not_a_repeat() {
        let store = MemoryStore::default();
        store
            .insert_raw(note("1", "S1", "Detention", now() - Duration::days(1)))
            .await;
        store
            .insert_raw(note("2", "S2", "Detention", now() - Duration::days(1)))
            .await;
        store
            .insert_raw(note("3", "S2", "Detention", now() - Duration::days(8)))
            .await;

        let offenders = group_repeat_offenders(&store, 7, now()).await.unwrap();
        assert!(offenders.is_empty());
    }

    #[tokio::test]
    async fn two_detentions_for_one_student_raise_an_alert() {
        let store = MemoryStore::default();
        store
            .insert_raw(note("1", "S100", "Detention", now() - Duration::days(3)))
            .await;
        store
            .insert_raw(note("2", "S100", "Lunchtime Detention", now() - Duration::days(1)))
            .await;
        store
            .insert_raw(note("3", "S200", "Detention", now() - Duration::days(2)))
            .await;

        let offenders = group_repeat_offenders(&store, 7, now()).await.unwrap();
        assert_eq!(offenders.len(), 1);
        let student = &offenders[0];
        assert_eq!(student.student_id, "S100");
        assert_eq!(student.detention_count, 2);

        let mut breakdown = student.next_step_breakdown();
        breakdown.sort();
        assert_eq!(
            breakdown,
            vec![
                ("Detention".to_string(), 1),
                ("Lunchtime Detention".to_string(), 1)
            ]
        );
    }

    #[tokio::test]
    async fn completed_detentions_still_count_towards_repeats() {
        let store = MemoryStore::default();
        let mut done = note("1", "S100", "Detention", now() - Duration::days(2));
        done.action_complete = true;
        store.insert_raw(done).await;
        store
            .insert_raw(note("2", "S100", "Lunchtime reflection", now() - Duration::days(1)))
            .await;

        let offenders = group_repeat_offenders(&store, 7, now()).await.unwrap();
        assert_eq!(offenders.len(), 1);
        assert_eq!(offenders[0].detention_count, 2);
    }

    #[test]
    fn grouping_preserves_first_seen_order_and_representative() {
        let t = now();
        let mut newest = note("1", "S2", "Detention", t);
        newest.grade = "10".to_string();
        let notes = vec![
            newest,
            note("2", "S1", "Detention", t - Duration::hours(1)),
            note("3", "S2", "Detention", t - Duration::hours(2)),
            note("4", "S1", "Detention", t - Duration::hours(3)),
            note("5", "S3", "Detention", t - Duration::hours(4)),
        ];

        let groups = group_by_student(notes);
        let students: Vec<&str> = groups.iter().map(|g| g.student_id.as_str()).collect();
        assert_eq!(students, vec!["S2", "S1"]);
        assert_eq!(groups[0].grade, "10");
        assert_eq!(groups[0].detention_notes[1].external_id, "3");
    }
}
