use anyhow::Context;
use chrono::{DateTime, Datelike, Local, Utc};
use handlebars::Handlebars;
use serde::Serialize;

use crate::models::{IncidentRecord, StudentRepeatSummary};

pub const INVALID_DATE: &str = "Invalid date";

const REPORT_TEMPLATE: &str = "detention-report";

const REPORT_BODY: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Detention Report</title>
</head>
<body style="font-family: Arial, sans-serif; line-height: 1.6; max-width: 1000px; margin: 0 auto; background-color: #f9f9f9; color: #333; padding: 20px;">
    <div class="header" style="background-color: #232363; color: white; padding: 20px; text-align: center; border-radius: 8px;">
        <h1>Outstanding Detentions Report</h1>
        <p>Generated on: {{generated_on}}</p>
{{#if dashboard_url}}
        <a style="color: white; font-weight: bold; font-size: 1em;" href="{{dashboard_url}}">Open detentions dashboard</a>
{{/if}}
    </div>
{{#if has_alerts}}
    <div class="alert-section" style="background-color: #ffebee; border: 2px solid #f44336; border-radius: 8px; padding: 20px; margin: 20px 0;">
        <h2 style="color: #d32f2f; margin-top: 0;">🚨 DOUBLE DETENTION ALERTS</h2>
        <p style="color: #d32f2f; font-weight: bold;">The following students have received multiple detentions within the last {{window_days}} days:</p>
        <table style="width: 100%; border-collapse: collapse; margin-top: 10px;">
            <thead>
                <tr>
                    <th style="border: 1px solid #f44336; padding: 8px; text-align: left; background-color: #f44336; color: white;">Student</th>
                    <th style="border: 1px solid #f44336; padding: 8px; text-align: left; background-color: #f44336; color: white;">Grade</th>
                    <th style="border: 1px solid #f44336; padding: 8px; text-align: left; background-color: #f44336; color: white;">Total Detentions</th>
                    <th style="border: 1px solid #f44336; padding: 8px; text-align: left; background-color: #f44336; color: white;">Detention Types</th>
                </tr>
            </thead>
            <tbody>
{{#each alerts}}
                <tr style="background-color: #ffcdd2;">
                    <td style="border: 1px solid #f44336; padding: 8px;">{{student}}</td>
                    <td style="border: 1px solid #f44336; padding: 8px;">{{grade}}</td>
                    <td style="border: 1px solid #f44336; padding: 8px; font-weight: bold;">{{total}}</td>
                    <td style="border: 1px solid #f44336; padding: 8px;">{{steps}}</td>
                </tr>
{{/each}}
            </tbody>
        </table>
    </div>
{{/if}}
{{#if has_outstanding}}
    <h2 style="margin-top: 30px;">Outstanding Detentions</h2>
    <table style="width: 100%; border-collapse: collapse; margin-top: 20px; border-radius: 8px; overflow: hidden;">
        <thead>
            <tr>
                <th style="border: 1px solid #ddd; padding: 12px; text-align: left; background-color: #232363; color: white; text-transform: uppercase; font-weight: bold;">Student</th>
                <th style="border: 1px solid #ddd; padding: 12px; text-align: left; background-color: #232363; color: white; text-transform: uppercase; font-weight: bold;">Grade</th>
                <th style="border: 1px solid #ddd; padding: 12px; text-align: left; background-color: #232363; color: white; text-transform: uppercase; font-weight: bold;">Incident Date</th>
                <th style="border: 1px solid #ddd; padding: 12px; text-align: left; background-color: #232363; color: white; text-transform: uppercase; font-weight: bold;">Reported By</th>
                <th style="border: 1px solid #ddd; padding: 12px; text-align: left; background-color: #232363; color: white; text-transform: uppercase; font-weight: bold;">Notes</th>
                <th style="border: 1px solid #ddd; padding: 12px; text-align: left; background-color: #232363; color: white; text-transform: uppercase; font-weight: bold;">Next Step</th>
            </tr>
        </thead>
        <tbody>
{{#each outstanding}}
            <tr style="background-color: {{background}};">
                <td style="border: 1px solid #ddd; padding: 12px; text-align: left;">{{student}}</td>
                <td style="border: 1px solid #ddd; padding: 12px; text-align: left;">{{grade}}</td>
                <td style="border: 1px solid #ddd; padding: 12px; text-align: left;">{{incident_date}}</td>
                <td style="border: 1px solid #ddd; padding: 12px; text-align: left;">{{reported_by}}</td>
                <td style="border: 1px solid #ddd; padding: 12px; text-align: left;">{{notes}}</td>
                <td style="border: 1px solid #ddd; padding: 12px; text-align: left;">{{next_step}}</td>
            </tr>
{{/each}}
        </tbody>
    </table>
{{/if}}
    <div class="summary" style="margin-top: 30px; padding: 15px; background-color: #e3f2fd; border-radius: 8px;">
        <h3 style="margin-top: 0;">Summary</h3>
        <p><strong>Total Pending Detentions:</strong> {{outstanding_count}}</p>
        <p><strong>Students with Multiple Detentions:</strong> {{alert_count}}</p>
    </div>
</body>
</html>
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub subject: String,
    pub html: String,
}

#[derive(Serialize)]
struct ReportContext {
    generated_on: String,
    dashboard_url: Option<String>,
    window_days: i64,
    has_alerts: bool,
    alerts: Vec<AlertRow>,
    has_outstanding: bool,
    outstanding: Vec<OutstandingRow>,
    outstanding_count: usize,
    alert_count: usize,
}

#[derive(Serialize)]
struct AlertRow {
    student: String,
    grade: String,
    total: usize,
    steps: String,
}

#[derive(Serialize)]
struct OutstandingRow {
    background: &'static str,
    student: String,
    grade: String,
    incident_date: String,
    reported_by: String,
    notes: String,
    next_step: String,
}

/// Renders the detention report email. Values are HTML-escaped by the template engine.
pub struct Renderer {
    registry: Handlebars<'static>,
    dashboard_url: Option<String>,
    window_days: i64,
}

impl Renderer {
    pub fn try_new(dashboard_url: Option<String>, window_days: i64) -> anyhow::Result<Self> {
        let mut registry = Handlebars::new();
        registry
            .register_template_string(REPORT_TEMPLATE, REPORT_BODY)
            .context("registering detention report template")?;
        Ok(Self {
            registry,
            dashboard_url,
            window_days,
        })
    }

    pub fn compose(
        &self,
        outstanding: &[IncidentRecord],
        offenders: &[StudentRepeatSummary],
        now: DateTime<Utc>,
    ) -> anyhow::Result<Report> {
        let local = now.with_timezone(&Local);

        let alerts: Vec<AlertRow> = offenders
            .iter()
            .map(|student| AlertRow {
                student: student.student_name(),
                grade: student.grade.clone(),
                total: student.detention_count,
                steps: student
                    .next_step_breakdown()
                    .iter()
                    .map(|(step, count)| format!("{step} ({count})"))
                    .collect::<Vec<_>>()
                    .join(", "),
            })
            .collect();

        let rows: Vec<OutstandingRow> = outstanding
            .iter()
            .enumerate()
            .map(|(i, note)| OutstandingRow {
                background: if i % 2 == 0 { "#f2f8fc" } else { "#ffffff" },
                student: note.student_name(),
                grade: note.grade.clone(),
                incident_date: pretty_format_date(&note.incident_time, now),
                reported_by: note.reported_by.clone(),
                notes: note.notes.clone(),
                next_step: note.next_step.clone(),
            })
            .collect();

        let context = ReportContext {
            generated_on: local.format("%Y-%m-%d %H:%M:%S").to_string(),
            dashboard_url: self.dashboard_url.clone(),
            window_days: self.window_days,
            has_alerts: !alerts.is_empty(),
            alerts,
            has_outstanding: !rows.is_empty(),
            outstanding: rows,
            outstanding_count: outstanding.len(),
            alert_count: offenders.len(),
        };

        let html = self
            .registry
            .render(REPORT_TEMPLATE, &context)
            .context("rendering detention report")?;

        Ok(Report {
            subject: subject_line(offenders.len(), local),
            html,
        })
    }
}

fn subject_line(alert_count: usize, date: DateTime<Local>) -> String {
    let date = date.format("%Y-%m-%d");
    if alert_count > 0 {
        format!(
            "🚨 DETENTIONS: Detention Report with {alert_count} Double Detention Alerts - {date}"
        )
    } else {
        format!("Detention Report - {date}")
    }
}

/// Renders a timestamp like "March 3rd (2 days ago)".
pub fn pretty_format_date(value: &str, now: DateTime<Utc>) -> String {
    let Ok(parsed) = DateTime::parse_from_rfc3339(value.trim()) else {
        return INVALID_DATE.to_string();
    };

    let days_ago = (now - parsed.with_timezone(&Utc)).num_hours() / 24;
    let day = parsed.day();
    let mut rendered = format!("{} {}{}", parsed.format("%B"), day, ordinal_suffix(day));

    if days_ago > 0 {
        let plural = if days_ago == 1 { "" } else { "s" };
        rendered.push_str(&format!(" ({days_ago} day{plural} ago)"));
    }
    rendered
}

fn ordinal_suffix(day: u32) -> &'static str {
    match (day % 10, day % 100) {
        (1, n) if n != 11 => "st",
        (2, n) if n != 12 => "nd",
        (3, n) if n != 13 => "rd",
        _ => "th",
    }
}
