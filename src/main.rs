use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::{filter::LevelFilter, EnvFilter, FmtSubscriber};

mod config;
mod db;
mod dispatch;
mod mailer;
mod models;
mod reconcile;
mod report;
mod scheduler;
mod source;
mod store;
mod window;

use config::{HttpArgs, MailArgs, ReportArgs, ScheduleArgs, UpstreamArgs};
use db::PgStore;
use dispatch::{DispatchOutcome, Dispatcher};
use reconcile::Reconciler;
use store::{IncidentStore, BEHAVIOUR_TOPIC, SYNC_CURSOR};

const RECONCILE_TASK: &str = "reconcile-behaviour-notes";
const REPORT_TASK: &str = "send-detention-report";

#[derive(Parser)]
#[command(name = "behaviour-detention-alerts")]
#[command(about = "Mirrors behaviour notes and emails detention reports", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Set the timestamp the next sync fetches from (empty fetches everything)
    SeedCursor {
        #[arg(long, default_value = "")]
        value: String,
    },
    /// Subscribe an address to a mail topic
    Subscribe {
        #[arg(long)]
        email: String,
        #[arg(long, default_value = BEHAVIOUR_TOPIC)]
        topic: String,
    },
    /// Backfill behaviour notes from a CSV export
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Run one reconciliation cycle
    Sync {
        #[command(flatten)]
        upstream: UpstreamArgs,
        #[command(flatten)]
        http: HttpArgs,
    },
    /// Render the detention report to a file without sending it
    Report {
        #[command(flatten)]
        report: ReportArgs,
        #[arg(long, default_value = "detention-report.html")]
        out: PathBuf,
    },
    /// Send the detention report now
    Dispatch {
        #[command(flatten)]
        report: ReportArgs,
        #[command(flatten)]
        mail: MailArgs,
        #[command(flatten)]
        http: HttpArgs,
    },
    /// Run the sync loop and the report schedule until interrupted
    Serve {
        #[command(flatten)]
        upstream: UpstreamArgs,
        #[command(flatten)]
        report: ReportArgs,
        #[command(flatten)]
        mail: MailArgs,
        #[command(flatten)]
        schedule: ScheduleArgs,
        #[command(flatten)]
        http: HttpArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting tracing default")?;

    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;
    let store = PgStore::connect(&database_url).await?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(store.pool()).await?;
            println!("Schema ready.");
        }
        Commands::SeedCursor { value } => {
            store.save_cursor(SYNC_CURSOR, &value).await?;
            println!("Sync cursor set to '{value}'.");
        }
        Commands::Subscribe { email, topic } => {
            db::subscribe(store.pool(), &email, &topic).await?;
            println!("Subscribed {email} to {topic}.");
        }
        Commands::Import { csv } => {
            let file = std::fs::File::open(&csv)
                .with_context(|| format!("failed to open {}", csv.display()))?;
            let summary = db::import_csv(&store, file).await?;
            println!(
                "Imported {} new and {} existing notes from {}.",
                summary.inserted,
                summary.updated,
                csv.display()
            );
        }
        Commands::Sync { upstream, http } => {
            let reconciler = Reconciler::new(upstream.source(http.http_timeout)?, store);
            let summary = reconciler.run_cycle(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Report { report, out } => {
            let now = Utc::now();
            let outstanding = window::collect_window_candidates(&store, report.window_days, now).await?;
            let offenders = window::group_repeat_offenders(&store, report.window_days, now).await?;
            let rendered = report.renderer()?.compose(&outstanding, &offenders, now)?;
            std::fs::write(&out, rendered.html)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("{}", rendered.subject);
            println!("Report written to {}.", out.display());
        }
        Commands::Dispatch { report, mail, http } => {
            let dispatcher = Dispatcher::new(
                store,
                mail.mailer(http.http_timeout)?,
                report.renderer()?,
                report.window_days,
                mail.sender(),
            );
            match dispatcher.dispatch(Utc::now()).await? {
                DispatchOutcome::NothingToReport => println!("Nothing to report."),
                DispatchOutcome::NoSubscribers { outstanding, alerts } => println!(
                    "No subscribers for '{BEHAVIOUR_TOPIC}'; {outstanding} pending detentions and {alerts} alerts not sent."
                ),
                DispatchOutcome::Sent {
                    recipients,
                    outstanding,
                    alerts,
                } => println!(
                    "Sent report with {outstanding} pending detentions and {alerts} alerts to {recipients} recipients."
                ),
            }
        }
        Commands::Serve {
            upstream,
            report,
            mail,
            schedule,
            http,
        } => {
            let window_days = report.window_days;
            let reconciler = Arc::new(Reconciler::new(
                upstream.source(http.http_timeout)?,
                store.clone(),
            ));
            let dispatcher = Arc::new(Dispatcher::new(
                store,
                mail.mailer(http.http_timeout)?,
                report.renderer()?,
                window_days,
                mail.sender(),
            ));
            serve(reconciler, dispatcher, schedule, window_days).await?;
        }
    }

    Ok(())
}

async fn serve(
    reconciler: Arc<Reconciler<source::HttpIncidentSource, PgStore>>,
    dispatcher: Arc<Dispatcher<PgStore, mailer::Mailer>>,
    schedule: ScheduleArgs,
    window_days: i64,
) -> anyhow::Result<()> {
    let reconcile = scheduler::task(move || {
        let reconciler = reconciler.clone();
        async move {
            let now = Utc::now();
            match reconciler.run_cycle(now).await {
                Ok(_) => window::log_window_summary(reconciler.store(), window_days, now).await,
                Err(err) => tracing::error!(error = %err, "behaviour note sync failed"),
            }
        }
    });
    let send_report = scheduler::task(move || {
        let dispatcher = dispatcher.clone();
        async move {
            if let Err(err) = dispatcher.dispatch(Utc::now()).await {
                tracing::error!(error = ?err, "detention report dispatch failed");
            }
        }
    });

    let scheduler = scheduler::Scheduler::new().await?;
    scheduler
        .add_interval(RECONCILE_TASK, schedule.reconcile_interval, reconcile.clone())
        .await?;
    scheduler
        .add_cron(
            REPORT_TASK,
            &schedule.detention_email_schedule,
            config::DEFAULT_DETENTION_SCHEDULE,
            send_report,
        )
        .await?;

    // First sync runs immediately; the interval job takes over from here.
    reconcile().await;

    scheduler.start().await?;
    tracing::info!("scheduler running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutting down");
    scheduler.shutdown().await
}
