use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// One behaviour note as the upstream API reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentRecord {
    #[serde(rename = "id", default, deserialize_with = "external_id")]
    pub external_id: String,
    #[serde(default, deserialize_with = "or_default")]
    pub student_id: String,
    #[serde(default, deserialize_with = "or_default")]
    pub first_name: String,
    #[serde(default, deserialize_with = "or_default")]
    pub last_name: String,
    #[serde(default, deserialize_with = "or_default")]
    pub email: String,
    #[serde(default, deserialize_with = "or_default")]
    pub grade: String,
    #[serde(default, deserialize_with = "or_default")]
    pub incident_time: String,
    #[serde(default, deserialize_with = "or_default")]
    pub behavior_type: String,
    #[serde(default, deserialize_with = "or_default")]
    pub notes: String,
    #[serde(default, deserialize_with = "or_default")]
    pub next_step: String,
    #[serde(default, deserialize_with = "or_default")]
    pub next_step_date: String,
    #[serde(default)]
    pub author_id: Option<i64>,
    #[serde(default, deserialize_with = "or_default")]
    pub reported_by: String,
    #[serde(default, deserialize_with = "or_default")]
    pub homeroom_advisor: String,
    #[serde(default, deserialize_with = "or_default")]
    pub visible_to_parents: bool,
    #[serde(default, deserialize_with = "or_default")]
    pub visible_to_students: bool,
    #[serde(default, deserialize_with = "or_default")]
    pub created_at: String,
    #[serde(default, deserialize_with = "or_default")]
    pub updated_at: String,
    #[serde(default, deserialize_with = "or_default")]
    pub action_complete: bool,
}

impl IncidentRecord {
    /// Key used to match a stored record. Notes without an upstream id never match.
    pub fn lookup_key(&self) -> Option<&str> {
        let id = self.external_id.trim();
        if id.is_empty() || id == "0" {
            None
        } else {
            Some(id)
        }
    }

    pub fn step_category(&self) -> StepCategory {
        StepCategory::classify(&self.next_step)
    }

    pub fn created_ts(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.created_at)
    }

    pub fn student_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// Closed vocabulary for the free-text next step, fixed when a note is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepCategory {
    Detention,
    LunchtimeDetention,
    Lunchtime,
    Other,
}

impl StepCategory {
    /// Categories that count as an outstanding detention.
    pub const DETENTIONS: [StepCategory; 2] =
        [StepCategory::Detention, StepCategory::LunchtimeDetention];

    /// Categories that count towards a repeat-offender alert.
    pub const REPEATABLE: [StepCategory; 3] = [
        StepCategory::Detention,
        StepCategory::LunchtimeDetention,
        StepCategory::Lunchtime,
    ];

    /// Case-insensitive substring match on `detention` and `lunchtime`.
    pub fn classify(next_step: &str) -> Self {
        let step = next_step.to_lowercase();
        let detention = step.contains("detention");
        let lunchtime = step.contains("lunchtime");
        match (detention, lunchtime) {
            (true, true) => StepCategory::LunchtimeDetention,
            (true, false) => StepCategory::Detention,
            (false, true) => StepCategory::Lunchtime,
            (false, false) => StepCategory::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepCategory::Detention => "detention",
            StepCategory::LunchtimeDetention => "lunchtime_detention",
            StepCategory::Lunchtime => "lunchtime",
            StepCategory::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Inserted without an upstream id; a later sync of the same note inserts again.
    InsertedUnkeyed,
    Updated,
}

#[derive(Debug, Clone)]
pub struct StudentRepeatSummary {
    pub student_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub grade: String,
    pub detention_count: usize,
    pub detention_notes: Vec<IncidentRecord>,
}

impl StudentRepeatSummary {
    pub fn student_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// Count of contributing notes per next-step text, in first-seen order.
    pub fn next_step_breakdown(&self) -> Vec<(String, usize)> {
        let mut breakdown: Vec<(String, usize)> = Vec::new();
        for note in &self.detention_notes {
            match breakdown.iter_mut().find(|(step, _)| *step == note.next_step) {
                Some(entry) => entry.1 += 1,
                None => breakdown.push((note.next_step.clone(), 1)),
            }
        }
        breakdown
    }
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn external_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(i64),
        Text(String),
    }

    Ok(match Option::<RawId>::deserialize(deserializer)? {
        Some(RawId::Number(id)) => id.to_string(),
        Some(RawId::Text(id)) => id,
        None => String::new(),
    })
}
