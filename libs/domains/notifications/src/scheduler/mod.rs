//! Daily report scheduling, delivery and escalation.
//!
//! [`ReportScheduler`] keeps one cron registration per report slot, persists
//! its settings and runs [`DailyReportJob`] when the slot fires. A run fetches
//! the previous business day's rows, renders attachments, mails every
//! recipient in turn and escalates to operations if anything goes wrong.

pub mod slots;
pub mod store;

pub use slots::{CronTaskSlots, DailyTime, SlotTask, TaskSlots};
pub use store::{InMemorySettingsStore, JsonFileSettingsStore, SettingsStore};

use crate::config::SchedulerConfig;
use crate::error::{DeliveryError, DeliveryResult};
use crate::models::{
    business_offset, Attachment, DeliveryAttempt, DeliveryStats, OutgoingEmail, ReportFormat,
    ReportWindow, ScheduleSettings,
};
use crate::service::ReportMailer;
use crate::templates::{EscalationData, TemplateEngine};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use strum::Display;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

/// Slot name of the daily report registration.
pub const DAILY_REPORT_SLOT: &str = "daily-report";

/// Source of report rows for a window.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReportDataSource: Send + Sync {
    async fn fetch_rows(&self, window: &ReportWindow) -> DeliveryResult<Vec<Value>>;
}

/// Turns report rows into attachments.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReportRenderer: Send + Sync {
    async fn render(
        &self,
        rows: &[Value],
        window: &ReportWindow,
        format: ReportFormat,
        include_photos: bool,
    ) -> DeliveryResult<Vec<Attachment>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    /// No recipients configured.
    Skipped,
    /// The window had no rows.
    NoData,
    Delivered,
    PartiallyDelivered,
    Failed,
}

/// What one report run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRunSummary {
    pub date: NaiveDate,
    pub status: RunStatus,
    pub delivered: usize,
    pub failed: usize,
    pub escalated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SchedulerState {
    Unscheduled,
    Scheduled,
    Running,
}

/// The work behind one scheduled report run.
pub struct DailyReportJob {
    mailer: Arc<dyn ReportMailer>,
    data: Arc<dyn ReportDataSource>,
    renderer: Arc<dyn ReportRenderer>,
    templates: TemplateEngine,
    config: SchedulerConfig,
    settings: RwLock<ScheduleSettings>,
    log: Mutex<Vec<DeliveryAttempt>>,
    /// Runs in flight; a manual run may overlap a cron firing.
    running: AtomicUsize,
}

impl DailyReportJob {
    pub fn new(
        mailer: Arc<dyn ReportMailer>,
        data: Arc<dyn ReportDataSource>,
        renderer: Arc<dyn ReportRenderer>,
        config: SchedulerConfig,
    ) -> DeliveryResult<Self> {
        Ok(Self {
            mailer,
            data,
            renderer,
            templates: TemplateEngine::new()?,
            config,
            settings: RwLock::new(ScheduleSettings::default()),
            log: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
        })
    }

    pub async fn execute(&self) -> ReportRunSummary {
        self.execute_at(Utc::now()).await
    }

    /// Run the report for the business day before `now`. Never fails; problems
    /// are logged and escalated.
    pub async fn execute_at(&self, now: DateTime<Utc>) -> ReportRunSummary {
        self.running.fetch_add(1, Ordering::SeqCst);
        let settings = self.settings.read().await.clone();
        let window = ReportWindow::preceding_day(now);

        info!(
            date = %window.date,
            recipients = settings.recipients.len(),
            format = %settings.report_format,
            "Starting daily report run"
        );

        let summary = self.run(&settings, &window, now).await;

        self.running.fetch_sub(1, Ordering::SeqCst);
        metrics::counter!("report_runs_total", "status" => summary.status.to_string()).increment(1);
        info!(
            date = %summary.date,
            status = %summary.status,
            delivered = summary.delivered,
            failed = summary.failed,
            escalated = summary.escalated,
            "Daily report run finished"
        );
        summary
    }

    async fn run(
        &self,
        settings: &ScheduleSettings,
        window: &ReportWindow,
        now: DateTime<Utc>,
    ) -> ReportRunSummary {
        let mut summary = ReportRunSummary {
            date: window.date,
            status: RunStatus::Skipped,
            delivered: 0,
            failed: 0,
            escalated: false,
        };

        if settings.recipients.is_empty() {
            warn!(date = %window.date, "No report recipients configured, skipping run");
            return summary;
        }

        let attachments = match self.prepare(settings, window).await {
            Ok(Some(attachments)) => attachments,
            Ok(None) => {
                info!(date = %window.date, "No check-in records for the window, nothing to send");
                summary.status = RunStatus::NoData;
                return summary;
            }
            Err(err) => {
                error!(date = %window.date, error = %err, "Report preparation failed");
                summary.status = RunStatus::Failed;
                summary.escalated = self.escalate(settings, now, &err, Vec::new()).await;
                return summary;
            }
        };

        let subject = TemplateEngine::report_subject(&window.date.format("%Y-%m-%d").to_string());
        let mut failures: Vec<(String, DeliveryError)> = Vec::new();

        for (idx, recipient) in settings.recipients.iter().enumerate() {
            if idx > 0 && !self.config.inter_send_delay.is_zero() {
                tokio::time::sleep(self.config.inter_send_delay).await;
            }

            let result = self
                .mailer
                .send_report(recipient, *window, attachments.clone(), settings.report_format)
                .await;

            let attempt = DeliveryAttempt {
                timestamp: Utc::now(),
                provider: result.as_ref().ok().map(|o| o.provider.clone()),
                recipient: recipient.clone(),
                subject: subject.clone(),
                success: result.is_ok(),
                error_summary: result.as_ref().err().map(|e| e.to_string()),
            };
            self.log.lock().await.push(attempt);

            match result {
                Ok(outcome) => {
                    summary.delivered += 1;
                    info!(to = %recipient, provider = %outcome.provider, "Report delivered");
                }
                Err(err) => {
                    error!(to = %recipient, error = %err, "Report delivery failed");
                    failures.push((recipient.clone(), err));
                }
            }
        }

        summary.failed = failures.len();
        if failures.is_empty() {
            summary.status = RunStatus::Delivered;
            return summary;
        }

        let details: Vec<String> = failures
            .iter()
            .map(|(recipient, err)| format!("{}: {}", recipient, err))
            .collect();

        let err = if summary.delivered == 0 {
            summary.status = RunStatus::Failed;
            // Every recipient failed; the last error describes the run best.
            failures
                .pop()
                .map(|(_, err)| err)
                .unwrap_or_else(|| DeliveryError::Initialization("no delivery attempted".to_string()))
        } else {
            summary.status = RunStatus::PartiallyDelivered;
            DeliveryError::PartialDelivery {
                delivered: summary.delivered,
                total: settings.recipients.len(),
                failed: failures.into_iter().map(|(recipient, _)| recipient).collect(),
            }
        };

        summary.escalated = self.escalate(settings, now, &err, details).await;
        summary
    }

    /// Fetch rows and render attachments; `None` when there is nothing to report.
    async fn prepare(
        &self,
        settings: &ScheduleSettings,
        window: &ReportWindow,
    ) -> DeliveryResult<Option<Vec<Attachment>>> {
        let rows = self.data.fetch_rows(window).await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let attachments = self
            .renderer
            .render(&rows, window, settings.report_format, settings.include_photos)
            .await?;
        Ok(Some(attachments))
    }

    /// Best-effort notice to the operations mailbox. Returns whether it was sent.
    async fn escalate(
        &self,
        settings: &ScheduleSettings,
        now: DateTime<Utc>,
        err: &DeliveryError,
        details: Vec<String>,
    ) -> bool {
        let local = now.with_timezone(&business_offset());
        let data = EscalationData {
            scheduled_time: settings.time_of_day.clone(),
            run_date: local.format("%Y-%m-%d").to_string(),
            error_code: err.code().to_string(),
            error_message: err.to_string(),
            details,
            occurred_at: local.format("%Y-%m-%d %H:%M:%S (UTC+8)").to_string(),
        };

        let rendered = match self.templates.render_escalation(&data) {
            Ok(rendered) => rendered,
            Err(render_err) => {
                error!(error = %render_err, "Could not render escalation email");
                return false;
            }
        };

        let email = OutgoingEmail::new(
            self.config.escalation_address.as_str(),
            rendered.subject,
            rendered.html,
        )
        .with_text(rendered.text);

        let mailer = Arc::clone(&self.mailer);
        let sent = self
            .config
            .escalation_retry
            .run(
                |_| {
                    let mailer = Arc::clone(&mailer);
                    let email = email.clone();
                    async move { mailer.send_email(email).await }
                },
                |attempt, send_err| {
                    warn!(attempt, error = %send_err, "Escalation email attempt failed");
                },
            )
            .await;

        match sent {
            Ok(outcome) => {
                info!(
                    to = %self.config.escalation_address,
                    code = err.code(),
                    provider = %outcome.provider,
                    "Escalation email sent"
                );
                true
            }
            Err(send_err) => {
                error!(
                    to = %self.config.escalation_address,
                    code = err.code(),
                    error = %send_err,
                    "Escalation email could not be sent"
                );
                false
            }
        }
    }

    pub async fn delivery_stats(&self) -> DeliveryStats {
        DeliveryStats::from_attempts(&self.log.lock().await)
    }

    pub async fn delivery_log(&self) -> Vec<DeliveryAttempt> {
        self.log.lock().await.clone()
    }

    pub async fn settings(&self) -> ScheduleSettings {
        self.settings.read().await.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) > 0
    }
}

/// Keeps the daily report registered according to persisted settings.
pub struct ReportScheduler {
    job: Arc<DailyReportJob>,
    slots: Arc<dyn TaskSlots>,
    store: Arc<dyn SettingsStore>,
}

impl ReportScheduler {
    pub fn new(job: DailyReportJob, slots: Arc<dyn TaskSlots>, store: Arc<dyn SettingsStore>) -> Self {
        Self {
            job: Arc::new(job),
            slots,
            store,
        }
    }

    /// Re-apply saved settings after a restart.
    pub async fn restore(&self) -> DeliveryResult<ScheduleSettings> {
        match self.store.load().await? {
            Some(settings) => {
                info!(
                    enabled = settings.enabled,
                    time = %settings.time_of_day,
                    "Restoring saved report schedule"
                );
                self.apply(&settings).await?;
                Ok(settings)
            }
            None => Ok(self.job.settings().await),
        }
    }

    /// Validate, register (or stop) and persist `settings`.
    pub async fn set_schedule(&self, settings: ScheduleSettings) -> DeliveryResult<()> {
        self.apply(&settings).await?;
        self.store.save(&settings).await
    }

    /// Stop the daily report and persist it as disabled.
    pub async fn clear_schedule(&self) -> DeliveryResult<()> {
        let mut settings = self.job.settings().await;
        settings.enabled = false;

        self.slots.stop(DAILY_REPORT_SLOT).await?;
        *self.job.settings.write().await = settings.clone();
        self.store.save(&settings).await?;

        info!("Daily report schedule cleared");
        Ok(())
    }

    /// Run the report now, outside the schedule.
    pub async fn execute_daily_report(&self) -> ReportRunSummary {
        self.job.execute().await
    }

    pub async fn get_settings(&self) -> ScheduleSettings {
        self.job.settings().await
    }

    pub async fn get_delivery_stats(&self) -> DeliveryStats {
        self.job.delivery_stats().await
    }

    pub async fn delivery_log(&self) -> Vec<DeliveryAttempt> {
        self.job.delivery_log().await
    }

    pub async fn active_schedule(&self) -> Option<DailyTime> {
        self.slots.active(DAILY_REPORT_SLOT).await
    }

    pub async fn state(&self) -> SchedulerState {
        if self.job.is_running() {
            SchedulerState::Running
        } else if self.active_schedule().await.is_some() {
            SchedulerState::Scheduled
        } else {
            SchedulerState::Unscheduled
        }
    }

    async fn apply(&self, settings: &ScheduleSettings) -> DeliveryResult<()> {
        let at = validate(settings)?;

        if settings.enabled {
            let job = Arc::clone(&self.job);
            let task: SlotTask = Arc::new(move || {
                let job = Arc::clone(&job);
                async move {
                    job.execute().await;
                }
                .boxed()
            });
            self.slots.replace(DAILY_REPORT_SLOT, at, task).await?;
        } else if self.slots.stop(DAILY_REPORT_SLOT).await? {
            info!("Daily report disabled");
        }

        *self.job.settings.write().await = settings.clone();
        Ok(())
    }
}

/// Check time of day and recipient addresses.
pub fn validate(settings: &ScheduleSettings) -> DeliveryResult<DailyTime> {
    let at: DailyTime = settings.time_of_day.parse()?;
    for recipient in &settings.recipients {
        recipient
            .parse::<lettre::Address>()
            .map_err(|_| DeliveryError::InvalidAddress(recipient.clone()))?;
    }
    Ok(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SendOutcome;
    use crate::retry::RetryPolicy;
    use crate::service::MockReportMailer;
    use chrono::TimeZone;
    use std::time::Duration;

    fn outcome() -> SendOutcome {
        SendOutcome {
            success: true,
            message_id: "id-1".to_string(),
            provider: "brevo".to_string(),
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            escalation_address: "ops@example.com".to_string(),
            inter_send_delay: Duration::ZERO,
            escalation_retry: RetryPolicy::immediate(2),
        }
    }

    fn rows(n: usize) -> MockReportDataSource {
        let mut data = MockReportDataSource::new();
        data.expect_fetch_rows()
            .returning(move |_| Ok(vec![serde_json::json!({"employee": "A"}); n]));
        data
    }

    fn renderer() -> MockReportRenderer {
        let mut renderer = MockReportRenderer::new();
        renderer
            .expect_render()
            .returning(|_, window, _, _| {
                Ok(vec![Attachment::new(
                    format!("checkin-{}.csv", window.date),
                    "text/csv",
                    b"a".to_vec(),
                )])
            });
        renderer
    }

    fn job(
        mailer: MockReportMailer,
        data: MockReportDataSource,
        renderer: MockReportRenderer,
        recipients: &[&str],
    ) -> DailyReportJob {
        let job = DailyReportJob::new(Arc::new(mailer), Arc::new(data), Arc::new(renderer), config())
            .unwrap();
        *job.settings.try_write().unwrap() = ScheduleSettings {
            enabled: true,
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            time_of_day: "08:30".to_string(),
            ..Default::default()
        };
        job
    }

    fn now() -> DateTime<Utc> {
        // 2024-03-11 08:30 in UTC+8
        Utc.with_ymd_and_hms(2024, 3, 11, 0, 30, 0).unwrap()
    }

    #[tokio::test]
    async fn test_empty_window_sends_nothing() {
        let mut mailer = MockReportMailer::new();
        mailer.expect_send_report().never();
        mailer.expect_send_email().never();
        let mut renderer = MockReportRenderer::new();
        renderer.expect_render().never();

        let summary = job(mailer, rows(0), renderer, &["boss@example.com"])
            .execute_at(now())
            .await;
        assert_eq!(summary.status, RunStatus::NoData);
        assert_eq!(summary.date, NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
    }

    #[tokio::test]
    async fn test_no_recipients_skips_run() {
        let mut data = MockReportDataSource::new();
        data.expect_fetch_rows().never();

        let summary = job(MockReportMailer::new(), data, MockReportRenderer::new(), &[])
            .execute_at(now())
            .await;
        assert_eq!(summary.status, RunStatus::Skipped);
    }

    #[tokio::test]
    async fn test_each_recipient_gets_a_copy() {
        let mut mailer = MockReportMailer::new();
        mailer
            .expect_send_report()
            .withf(|to, _, attachments, format| {
                to == "boss@example.com" && attachments.len() == 1 && *format == ReportFormat::Csv
            })
            .times(2)
            .returning(|_, _, _, _| Ok(outcome()));
        mailer.expect_send_email().never();

        let job = job(mailer, rows(3), renderer(), &["boss@example.com", "boss@example.com"]);
        let summary = job.execute_at(now()).await;

        assert_eq!(summary.status, RunStatus::Delivered);
        assert_eq!(summary.delivered, 2);
        assert!(!summary.escalated);

        let stats = job.delivery_stats().await;
        assert_eq!(stats.total_attempts, 2);
        assert_eq!(stats.success_rate, 100.0);
    }

    #[tokio::test]
    async fn test_failed_send_escalates_once() {
        let mut mailer = MockReportMailer::new();
        mailer
            .expect_send_report()
            .times(1)
            .returning(|_, _, _, _| Err(DeliveryError::Initialization("SMTP 連接失敗".to_string())));
        mailer
            .expect_send_email()
            .withf(|email| {
                email.to == "ops@example.com"
                    && email.subject == "[打卡系統] 每日報表寄送失敗 - 08:30 2024-03-11"
                    && email.html.contains("SMTP 連接失敗")
                    && email.html.contains("2024-03-11 08:30:00 (UTC+8)")
            })
            .times(1)
            .returning(|_| Ok(outcome()));

        let job = job(mailer, rows(1), renderer(), &["boss@example.com"]);
        let summary = job.execute_at(now()).await;

        assert_eq!(summary.status, RunStatus::Failed);
        assert!(summary.escalated);
        assert_eq!(job.delivery_stats().await.failure_count, 1);
    }

    #[tokio::test]
    async fn test_partial_delivery_escalates_with_failed_recipients() {
        let mut mailer = MockReportMailer::new();
        mailer
            .expect_send_report()
            .withf(|to, _, _, _| to == "a@example.com")
            .returning(|_, _, _, _| Ok(outcome()));
        mailer
            .expect_send_report()
            .withf(|to, _, _, _| to == "b@example.com")
            .returning(|_, _, _, _| Err(DeliveryError::MessageBuild("mailbox full".to_string())));
        mailer
            .expect_send_email()
            .withf(|email| email.html.contains("PARTIAL_DELIVERY") && email.html.contains("b@example.com"))
            .times(1)
            .returning(|_| Ok(outcome()));

        let summary = job(mailer, rows(1), renderer(), &["a@example.com", "b@example.com"])
            .execute_at(now())
            .await;

        assert_eq!(summary.status, RunStatus::PartiallyDelivered);
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn test_data_source_failure_escalates() {
        let mut data = MockReportDataSource::new();
        data.expect_fetch_rows()
            .returning(|_| Err(DeliveryError::DataSource("database offline".to_string())));
        let mut mailer = MockReportMailer::new();
        mailer.expect_send_report().never();
        mailer
            .expect_send_email()
            .withf(|email| email.html.contains("DATA_SOURCE"))
            .times(1)
            .returning(|_| Ok(outcome()));

        let summary = job(mailer, data, MockReportRenderer::new(), &["boss@example.com"])
            .execute_at(now())
            .await;
        assert_eq!(summary.status, RunStatus::Failed);
        assert!(summary.escalated);
    }

    #[tokio::test]
    async fn test_escalation_failure_is_swallowed() {
        let mut mailer = MockReportMailer::new();
        mailer
            .expect_send_report()
            .returning(|_, _, _, _| Err(DeliveryError::MessageBuild("rejected".to_string())));
        mailer
            .expect_send_email()
            .times(2)
            .returning(|_| Err(DeliveryError::Initialization("no provider".to_string())));

        let summary = job(mailer, rows(1), renderer(), &["boss@example.com"])
            .execute_at(now())
            .await;
        assert_eq!(summary.status, RunStatus::Failed);
        assert!(!summary.escalated);
    }

    #[test]
    fn test_validate_rejects_bad_recipient() {
        let settings = ScheduleSettings {
            recipients: vec!["not-an-address".to_string()],
            ..Default::default()
        };
        assert!(matches!(validate(&settings), Err(DeliveryError::InvalidAddress(_))));

        let settings = ScheduleSettings {
            time_of_day: "25:00".to_string(),
            ..Default::default()
        };
        assert!(matches!(validate(&settings), Err(DeliveryError::InvalidSettings(_))));
    }
}
