use std::time::Duration;

use anyhow::Context;
use clap::Args;

use crate::mailer::{HttpMailer, Mailbox, Mailer};
use crate::report::Renderer;
use crate::source::HttpIncidentSource;
use crate::window::{DEFAULT_WINDOW_DAYS, MAX_WINDOW_DAYS};

/// Weekdays at noon.
pub const DEFAULT_DETENTION_SCHEDULE: &str = "0 12 * * 1-5";

#[derive(Debug, Clone, Args)]
pub struct UpstreamArgs {
    /// Base URL of the behaviour-note API
    #[arg(long, env = "MANAGEBAC_URL", default_value = "https://api.managebac.com")]
    pub managebac_url: String,
    /// Auth token sent in the `auth-token` header
    #[arg(long, env = "MANAGEBAC_API", hide_env_values = true)]
    pub managebac_api: Option<String>,
}

impl UpstreamArgs {
    pub fn source(&self, timeout: Duration) -> anyhow::Result<HttpIncidentSource> {
        let token = self
            .managebac_api
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .context("MANAGEBAC_API must be set to the behaviour API auth token")?;
        HttpIncidentSource::new(&self.managebac_url, token, timeout)
            .context("building behaviour API client")
    }
}

#[derive(Debug, Clone, Args)]
pub struct HttpArgs {
    /// Timeout for outbound HTTP calls, e.g. `30s` or `2m`
    #[arg(long, env = "HTTP_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
    pub http_timeout: Duration,
}

#[derive(Debug, Clone, Args)]
pub struct ReportArgs {
    /// Days of history the report looks back over
    #[arg(
        long,
        env = "DETENTION_WINDOW_DAYS",
        default_value_t = DEFAULT_WINDOW_DAYS,
        value_parser = clap::value_parser!(i64).range(1..=MAX_WINDOW_DAYS)
    )]
    pub window_days: i64,
    /// Link rendered in the report header
    #[arg(long, env = "DASHBOARD_URL")]
    pub dashboard_url: Option<String>,
}

impl ReportArgs {
    pub fn renderer(&self) -> anyhow::Result<Renderer> {
        Renderer::try_new(self.dashboard_url.clone(), self.window_days)
    }
}

#[derive(Debug, Clone, Args)]
pub struct MailArgs {
    #[arg(long, env = "MAIL_API_URL", default_value = "https://api.resend.com")]
    pub mail_api_url: String,
    /// Without a key, reports are rendered and logged but not sent
    #[arg(long, env = "MAIL_API_KEY", hide_env_values = true)]
    pub mail_api_key: Option<String>,
    #[arg(long, env = "MAIL_SENDER_ADDRESS", default_value = "noreply@localhost")]
    pub mail_sender_address: String,
    #[arg(long, env = "MAIL_SENDER_NAME")]
    pub mail_sender_name: Option<String>,
}

impl MailArgs {
    pub fn mailer(&self, timeout: Duration) -> anyhow::Result<Mailer> {
        let Some(api_key) = self
            .mail_api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
        else {
            tracing::warn!("MAIL_API_KEY is not set; detention reports will not be emailed");
            return Ok(Mailer::Disabled);
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building mail API client")?;
        let mailer = HttpMailer::new(&self.mail_api_url, api_key.to_string(), http)?;
        Ok(Mailer::Http(mailer))
    }

    pub fn sender(&self) -> Mailbox {
        Mailbox {
            address: self.mail_sender_address.clone(),
            name: self.mail_sender_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ScheduleArgs {
    /// Time between reconciliation cycles, e.g. `5m`
    #[arg(long, env = "RECONCILE_INTERVAL", default_value = "5m", value_parser = humantime::parse_duration)]
    pub reconcile_interval: Duration,
    /// Cron expression for the detention report, in local time
    #[arg(long, env = "DETENTION_EMAIL_SCHEDULE", default_value = DEFAULT_DETENTION_SCHEDULE)]
    pub detention_email_schedule: String,
}
