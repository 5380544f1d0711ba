use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{IncidentRecord, UpsertOutcome};
use crate::store::{IncidentStore, StoreError, WindowQuery, MAX_SUBSCRIBERS};

const INCIDENT_COLUMNS: &str = "external_id, student_id, first_name, last_name, email, grade, \
     incident_time, behavior_type, notes, next_step, next_step_date, author_id, reported_by, \
     homeroom_advisor, visible_to_parents, visible_to_students, created_at, updated_at, \
     action_complete";

const INSERT_INCIDENT: &str = r#"
    INSERT INTO behaviour_alerts.incidents
    (id, external_id, student_id, first_name, last_name, email, grade, incident_time,
     behavior_type, notes, next_step, step_category, next_step_date, author_id, reported_by,
     homeroom_advisor, visible_to_parents, visible_to_students, created_at, created_ts,
     updated_at, action_complete)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
            $19, $20, $21, $22)
"#;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Adds `topic` to the subscriber's topics, creating the mail-list entry if needed.
pub async fn subscribe(pool: &PgPool, email: &str, topic: &str) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO behaviour_alerts.mail_list AS m (email, subs)
        VALUES ($1, ARRAY[$2])
        ON CONFLICT (email) DO UPDATE
        SET subs = CASE
            WHEN $2 = ANY(m.subs) THEN m.subs
            ELSE array_append(m.subs, $2)
        END
        "#,
    )
    .bind(email)
    .bind(topic)
    .execute(pool)
    .await
    .with_context(|| format!("subscribing {email} to {topic}"))?;
    Ok(())
}

fn incident_from_row(row: &PgRow) -> IncidentRecord {
    IncidentRecord {
        external_id: row
            .get::<Option<String>, _>("external_id")
            .unwrap_or_default(),
        student_id: row.get("student_id"),
        first_name: row.get("first_name"),
        last_name: row.get("last_name"),
        email: row.get("email"),
        grade: row.get("grade"),
        incident_time: row.get("incident_time"),
        behavior_type: row.get("behavior_type"),
        notes: row.get("notes"),
        next_step: row.get("next_step"),
        next_step_date: row.get("next_step_date"),
        author_id: row.get("author_id"),
        reported_by: row.get("reported_by"),
        homeroom_advisor: row.get("homeroom_advisor"),
        visible_to_parents: row.get("visible_to_parents"),
        visible_to_students: row.get("visible_to_students"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        action_complete: row.get("action_complete"),
    }
}

impl IncidentStore for PgStore {
    async fn find_cursor<'s>(&'s self, name: &'s str) -> Result<String, StoreError> {
        let row = sqlx::query("SELECT value FROM behaviour_alerts.sync_config WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(row.get("value")),
            None => Err(StoreError::NotFound(format!("config value '{name}'"))),
        }
    }

    async fn save_cursor<'s>(&'s self, name: &'s str, value: &'s str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO behaviour_alerts.sync_config (name, value)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert<'s>(&'s self, record: &'s IncidentRecord) -> Result<UpsertOutcome, StoreError> {
        let key = record.lookup_key();
        let statement = match key {
            // Only the sync timestamp follows upstream; every other column keeps its first value.
            Some(_) => format!(
                "{INSERT_INCIDENT} ON CONFLICT (external_id) WHERE external_id IS NOT NULL \
                 DO UPDATE SET updated_at = EXCLUDED.updated_at \
                 RETURNING (xmax = 0) AS inserted"
            ),
            None => format!("{INSERT_INCIDENT} RETURNING TRUE AS inserted"),
        };

        let created_ts: Option<DateTime<Utc>> = record.created_ts();
        let row = sqlx::query(&statement)
            .bind(Uuid::new_v4())
            .bind(key)
            .bind(&record.student_id)
            .bind(&record.first_name)
            .bind(&record.last_name)
            .bind(&record.email)
            .bind(&record.grade)
            .bind(&record.incident_time)
            .bind(&record.behavior_type)
            .bind(&record.notes)
            .bind(&record.next_step)
            .bind(record.step_category().as_str())
            .bind(&record.next_step_date)
            .bind(record.author_id)
            .bind(&record.reported_by)
            .bind(&record.homeroom_advisor)
            .bind(record.visible_to_parents)
            .bind(record.visible_to_students)
            .bind(&record.created_at)
            .bind(created_ts)
            .bind(&record.updated_at)
            .bind(record.action_complete)
            .fetch_one(&self.pool)
            .await?;

        let inserted: bool = row.get("inserted");
        Ok(match (key, inserted) {
            (None, _) => UpsertOutcome::InsertedUnkeyed,
            (Some(_), true) => UpsertOutcome::Inserted,
            (Some(_), false) => UpsertOutcome::Updated,
        })
    }

    async fn query_window<'s>(
        &'s self,
        query: &'s WindowQuery,
    ) -> Result<Vec<IncidentRecord>, StoreError> {
        let categories: Vec<String> = query
            .categories
            .iter()
            .map(|category| category.as_str().to_string())
            .collect();

        let statement = format!(
            "SELECT {INCIDENT_COLUMNS} \
             FROM behaviour_alerts.incidents \
             WHERE step_category = ANY($1) \
             AND created_ts >= $2 \
             AND (NOT $3 OR action_complete = FALSE) \
             ORDER BY created_ts DESC \
             LIMIT $4"
        );

        let rows = sqlx::query(&statement)
            .bind(categories)
            .bind(query.since)
            .bind(query.outstanding_only)
            .bind(query.limit as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(incident_from_row).collect())
    }

    async fn subscribers<'s>(&'s self, topic: &'s str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT email FROM behaviour_alerts.mail_list
            WHERE $1 = ANY(subs)
            ORDER BY email
            LIMIT $2
            "#,
        )
        .bind(topic)
        .bind(MAX_SUBSCRIBERS as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("email")).collect())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub inserted: usize,
    pub updated: usize,
}

/// Backfills notes from a CSV export through the same upsert path the sync uses.
pub async fn import_csv<S, R>(store: &S, input: R) -> anyhow::Result<ImportSummary>
where
    S: IncidentStore,
    R: std::io::Read,
{
    #[derive(serde::Deserialize)]
    struct CsvRow {
        id: Option<String>,
        student_id: String,
        first_name: String,
        last_name: String,
        #[serde(default)]
        email: String,
        grade: String,
        incident_time: String,
        #[serde(default)]
        behavior_type: String,
        #[serde(default)]
        notes: String,
        next_step: String,
        #[serde(default)]
        next_step_date: String,
        author_id: Option<i64>,
        #[serde(default)]
        reported_by: String,
        #[serde(default)]
        homeroom_advisor: String,
        created_at: String,
        #[serde(default)]
        updated_at: String,
        #[serde(default)]
        action_complete: bool,
    }

    let mut reader = csv::Reader::from_reader(input);
    let mut summary = ImportSummary::default();

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("reading CSV row {}", line + 1))?;
        let updated_at = if row.updated_at.is_empty() {
            row.created_at.clone()
        } else {
            row.updated_at
        };
        let record = IncidentRecord {
            external_id: row.id.unwrap_or_default(),
            student_id: row.student_id,
            first_name: row.first_name,
            last_name: row.last_name,
            email: row.email,
            grade: row.grade,
            incident_time: row.incident_time,
            behavior_type: row.behavior_type,
            notes: row.notes,
            next_step: row.next_step,
            next_step_date: row.next_step_date,
            author_id: row.author_id,
            reported_by: row.reported_by,
            homeroom_advisor: row.homeroom_advisor,
            visible_to_parents: false,
            visible_to_students: false,
            created_at: row.created_at,
            updated_at,
            action_complete: row.action_complete,
        };

        match store
            .upsert(&record)
            .await
            .with_context(|| format!("saving CSV row {}", line + 1))?
        {
            UpsertOutcome::Updated => summary.updated += 1,
            UpsertOutcome::Inserted | UpsertOutcome::InsertedUnkeyed => summary.inserted += 1,
        }
    }

    Ok(summary)
}
