use std::future::Future;

use anyhow::Context;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub address: String,
    pub name: Option<String>,
}

impl Mailbox {
    /// `Name <address>` when a display name is set, otherwise the bare address.
    pub fn formatted(&self) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => format!("{name} <{}>", self.address),
            _ => self.address.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub from: Mailbox,
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
}

pub trait EmailSender: std::fmt::Debug + Send + Sync + 'static {
    fn send<'s>(
        &'s self,
        message: MailMessage,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 's;
}

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    from: String,
    to: &'a [String],
    subject: &'a str,
    html: &'a str,
}

#[derive(Debug, Default, serde::Deserialize)]
struct SendEmailResponse {
    #[serde(default)]
    id: String,
}

/// Sends mail through an HTTP API that accepts `{from, to, subject, html}` at `/emails`.
#[derive(Debug)]
pub struct HttpMailer {
    endpoint: reqwest::Url,
    api_key: String,
    http: reqwest::Client,
}

impl HttpMailer {
    pub fn new(api_url: &str, api_key: String, http: reqwest::Client) -> anyhow::Result<Self> {
        let mut endpoint =
            reqwest::Url::parse(api_url).with_context(|| format!("invalid mail API url {api_url}"))?;
        let path = format!("{}/emails", endpoint.path().trim_end_matches('/'));
        endpoint.set_path(&path);
        Ok(Self {
            endpoint,
            api_key,
            http,
        })
    }

    async fn send(&self, message: MailMessage) -> anyhow::Result<()> {
        let body = SendEmailRequest {
            from: message.from.formatted(),
            to: &message.to,
            subject: &message.subject,
            html: &message.html,
        };

        let response = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("calling mail API")?
            .error_for_status()
            .context("mail API rejected message")?;

        let sent: SendEmailResponse = response.json().await.unwrap_or_default();
        tracing::debug!(
            recipients = message.to.len(),
            subject = %message.subject,
            email_id = %sent.id,
            "successfully sent email"
        );
        Ok(())
    }
}

#[derive(Debug)]
pub enum Mailer {
    Disabled,
    Http(HttpMailer),
}

impl EmailSender for Mailer {
    async fn send<'s>(&'s self, message: MailMessage) -> anyhow::Result<()> {
        match self {
            Mailer::Disabled => {
                tracing::warn!(
                    recipients = message.to.len(),
                    subject = %message.subject,
                    "skipping sending email (disabled)"
                );
                Ok(())
            }
            Mailer::Http(http) => http.send(message).await,
        }
    }
}
