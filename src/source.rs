use std::future::Future;
use std::time::Duration;

use serde::Deserialize;

use crate::models::IncidentRecord;

pub const NOTES_RESOURCE: &str = "/v2/behavior/notes";

/// Upper bound on notes requested per cycle; only the first page is read.
pub const PER_PAGE: u32 = 150;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("upstream returned status {0}")]
    BadStatus(u16),

    #[error("could not decode upstream payload: {0}")]
    BadPayload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageMeta {
    #[serde(default)]
    pub current_page: u32,
    #[serde(default)]
    pub total_pages: u32,
    #[serde(default)]
    pub total_count: u32,
    #[serde(default)]
    pub per_page: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotesPage {
    pub behavior_notes: Vec<IncidentRecord>,
    #[serde(default)]
    pub meta: PageMeta,
}

pub trait IncidentSource: Send + Sync + 'static {
    /// Fetches one page of notes modified at or after `modified_since`, or all notes without it.
    fn fetch<'s>(
        &'s self,
        modified_since: Option<&'s str>,
        per_page: u32,
    ) -> impl Future<Output = Result<NotesPage, SourceError>> + Send + 's;
}

pub fn decode_page(body: &[u8]) -> Result<NotesPage, SourceError> {
    Ok(serde_json::from_slice(body)?)
}

#[derive(Debug, Clone)]
pub struct HttpIncidentSource {
    base_url: String,
    auth_token: String,
    http: reqwest::Client,
}

impl HttpIncidentSource {
    pub fn new(
        base_url: impl Into<String>,
        auth_token: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into(),
            auth_token: auth_token.into(),
            http,
        })
    }

    fn request(
        &self,
        modified_since: Option<&str>,
        per_page: u32,
    ) -> Result<reqwest::Request, SourceError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|err| SourceError::Unavailable(format!("invalid base url: {err}")))?;
        url.set_path(NOTES_RESOURCE);

        {
            let mut query = url.query_pairs_mut();
            query.clear();
            if let Some(since) = modified_since.filter(|since| !since.is_empty()) {
                query.append_pair("modified_since", since);
            }
            query.append_pair("per_page", &per_page.to_string());
        }

        self.http
            .get(url)
            .header("auth-token", &self.auth_token)
            .build()
            .map_err(|err| SourceError::Unavailable(err.to_string()))
    }
}

impl IncidentSource for HttpIncidentSource {
    #[tracing::instrument(skip(self), level = "debug")]
    async fn fetch<'s>(
        &'s self,
        modified_since: Option<&'s str>,
        per_page: u32,
    ) -> Result<NotesPage, SourceError> {
        let request = self.request(modified_since, per_page)?;
        let response = self
            .http
            .execute(request)
            .await
            .map_err(|err| SourceError::Unavailable(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::BadStatus(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| SourceError::Unavailable(err.to_string()))?;
        let page = decode_page(&body)?;

        tracing::debug!(
            notes = page.behavior_notes.len(),
            current_page = page.meta.current_page,
            total_pages = page.meta.total_pages,
            total_count = page.meta.total_count,
            per_page = page.meta.per_page,
            "fetched behaviour notes page"
        );
        Ok(page)
    }
}
