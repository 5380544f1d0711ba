use anyhow::Context;
use chrono::{DateTime, Utc};

use crate::mailer::{EmailSender, MailMessage, Mailbox};
use crate::report::Renderer;
use crate::store::{IncidentStore, BEHAVIOUR_TOPIC};
use crate::window::{collect_window_candidates, group_repeat_offenders};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    NothingToReport,
    NoSubscribers { outstanding: usize, alerts: usize },
    Sent {
        recipients: usize,
        outstanding: usize,
        alerts: usize,
    },
}

pub struct Dispatcher<S, M> {
    store: S,
    mailer: M,
    renderer: Renderer,
    window_days: i64,
    from: Mailbox,
}

impl<S: IncidentStore, M: EmailSender> Dispatcher<S, M> {
    pub fn new(store: S, mailer: M, renderer: Renderer, window_days: i64, from: Mailbox) -> Self {
        Self {
            store,
            mailer,
            renderer,
            window_days,
            from,
        }
    }

    /// Builds the detention report for the window ending at `now` and mails it to every subscriber.
    #[tracing::instrument(skip_all, fields(%now))]
    pub async fn dispatch(&self, now: DateTime<Utc>) -> anyhow::Result<DispatchOutcome> {
        let recipients = self
            .store
            .subscribers(BEHAVIOUR_TOPIC)
            .await
            .context("resolving report subscribers")?;
        let outstanding = collect_window_candidates(&self.store, self.window_days, now)
            .await
            .context("collecting outstanding detentions")?;
        let offenders = group_repeat_offenders(&self.store, self.window_days, now)
            .await
            .context("grouping repeat offenders")?;

        if outstanding.is_empty() && offenders.is_empty() {
            tracing::info!("no outstanding detentions or repeat offenders; nothing to report");
            return Ok(DispatchOutcome::NothingToReport);
        }

        if recipients.is_empty() {
            tracing::warn!(
                topic = BEHAVIOUR_TOPIC,
                outstanding = outstanding.len(),
                alerts = offenders.len(),
                "no subscribers for detention report"
            );
            return Ok(DispatchOutcome::NoSubscribers {
                outstanding: outstanding.len(),
                alerts: offenders.len(),
            });
        }

        let report = self.renderer.compose(&outstanding, &offenders, now)?;
        let message = MailMessage {
            from: self.from.clone(),
            to: recipients,
            subject: report.subject,
            html: report.html,
        };
        let recipient_count = message.to.len();

        self.mailer
            .send(message)
            .await
            .context("sending detention report")?;

        tracing::info!(
            recipients = recipient_count,
            outstanding = outstanding.len(),
            alerts = offenders.len(),
            "detention report sent"
        );
        Ok(DispatchOutcome::Sent {
            recipients: recipient_count,
            outstanding: outstanding.len(),
            alerts: offenders.len(),
        })
    }
}
