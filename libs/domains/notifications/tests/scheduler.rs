//! `ReportScheduler` driven through hand-written collaborators.

use async_trait::async_trait;
use domain_notifications::scheduler::SlotTask;
use domain_notifications::{
    Attachment, DailyReportJob, DailyTime, DeliveryError, DeliveryResult, InMemorySettingsStore,
    OutgoingEmail, ReportDataSource, ReportFormat, ReportMailer, ReportRenderer, ReportScheduler,
    ReportWindow, RetryPolicy, RunStatus, ScheduleSettings, SchedulerConfig, SchedulerState,
    SendOutcome, SettingsStore, TaskSlots,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Slots kept in a map so tests can fire them by hand. While `broken` is set
/// every change is refused, as a stalled cron scheduler would.
#[derive(Default)]
struct ManualSlots {
    slots: Mutex<HashMap<String, (DailyTime, SlotTask)>>,
    replacements: Mutex<u32>,
    broken: AtomicBool,
}

impl ManualSlots {
    fn check(&self) -> DeliveryResult<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(DeliveryError::Scheduler("job scheduler is not running".to_string()));
        }
        Ok(())
    }
}

impl ManualSlots {
    async fn fire(&self, slot: &str) {
        let task = self.slots.lock().unwrap().get(slot).map(|(_, task)| Arc::clone(task));
        if let Some(task) = task {
            task().await;
        }
    }
}

#[async_trait]
impl TaskSlots for ManualSlots {
    async fn replace(&self, slot: &str, at: DailyTime, task: SlotTask) -> DeliveryResult<()> {
        self.check()?;
        *self.replacements.lock().unwrap() += 1;
        self.slots.lock().unwrap().insert(slot.to_string(), (at, task));
        Ok(())
    }

    async fn stop(&self, slot: &str) -> DeliveryResult<bool> {
        self.check()?;
        Ok(self.slots.lock().unwrap().remove(slot).is_some())
    }

    async fn active(&self, slot: &str) -> Option<DailyTime> {
        self.slots.lock().unwrap().get(slot).map(|(at, _)| *at)
    }

    async fn active_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

/// Records every message; recipients listed in `reject` fail, as does every
/// report send whose 1-based call number is in `fail_calls`.
#[derive(Default)]
struct RecordingMailer {
    reject: Vec<String>,
    fail_calls: Vec<usize>,
    reports: Mutex<Vec<String>>,
    emails: Mutex<Vec<OutgoingEmail>>,
}

#[async_trait]
impl ReportMailer for RecordingMailer {
    async fn send_email(&self, email: OutgoingEmail) -> DeliveryResult<SendOutcome> {
        self.emails.lock().unwrap().push(email);
        Ok(SendOutcome {
            success: true,
            message_id: "ops-1".to_string(),
            provider: "brevo".to_string(),
        })
    }

    async fn send_report(
        &self,
        to: &str,
        _window: ReportWindow,
        _attachments: Vec<Attachment>,
        _format: ReportFormat,
    ) -> DeliveryResult<SendOutcome> {
        let call = {
            let mut reports = self.reports.lock().unwrap();
            reports.push(to.to_string());
            reports.len()
        };
        if self.reject.iter().any(|r| r == to) || self.fail_calls.contains(&call) {
            return Err(DeliveryError::Initialization("SMTP 連接失敗".to_string()));
        }
        Ok(SendOutcome {
            success: true,
            message_id: format!("id-{to}"),
            provider: "brevo".to_string(),
        })
    }
}

struct OneRow;

#[async_trait]
impl ReportDataSource for OneRow {
    async fn fetch_rows(&self, _window: &ReportWindow) -> DeliveryResult<Vec<Value>> {
        Ok(vec![json!({"employee": "王小明", "checkIn": "08:57"})])
    }
}

struct CsvRenderer;

#[async_trait]
impl ReportRenderer for CsvRenderer {
    async fn render(
        &self,
        rows: &[Value],
        window: &ReportWindow,
        _format: ReportFormat,
        _include_photos: bool,
    ) -> DeliveryResult<Vec<Attachment>> {
        Ok(vec![Attachment::new(
            format!("checkin-{}.csv", window.date),
            "text/csv",
            format!("rows,{}", rows.len()).into_bytes(),
        )])
    }
}

struct Harness {
    scheduler: ReportScheduler,
    slots: Arc<ManualSlots>,
    store: Arc<InMemorySettingsStore>,
    mailer: Arc<RecordingMailer>,
}

fn harness(mailer: RecordingMailer, store: InMemorySettingsStore) -> Harness {
    harness_with(mailer, store, Arc::new(OneRow))
}

fn harness_with(
    mailer: RecordingMailer,
    store: InMemorySettingsStore,
    data: Arc<dyn ReportDataSource>,
) -> Harness {
    let mailer = Arc::new(mailer);
    let config = SchedulerConfig {
        escalation_address: "ops@example.com".to_string(),
        inter_send_delay: Duration::ZERO,
        escalation_retry: RetryPolicy::immediate(1),
    };
    let job = DailyReportJob::new(
        Arc::clone(&mailer) as Arc<dyn ReportMailer>,
        data,
        Arc::new(CsvRenderer),
        config,
    )
    .unwrap();

    let slots = Arc::new(ManualSlots::default());
    let store = Arc::new(store);
    let scheduler = ReportScheduler::new(
        job,
        Arc::clone(&slots) as Arc<dyn TaskSlots>,
        Arc::clone(&store) as Arc<dyn SettingsStore>,
    );

    Harness {
        scheduler,
        slots,
        store,
        mailer,
    }
}

fn settings(time: &str, recipients: &[&str]) -> ScheduleSettings {
    ScheduleSettings {
        enabled: true,
        recipients: recipients.iter().map(|r| r.to_string()).collect(),
        time_of_day: time.to_string(),
        report_format: ReportFormat::Csv,
        include_photos: false,
    }
}

#[tokio::test]
async fn rescheduling_keeps_a_single_registration() {
    let h = harness(RecordingMailer::default(), InMemorySettingsStore::new());
    assert_eq!(h.scheduler.state().await, SchedulerState::Unscheduled);

    h.scheduler
        .set_schedule(settings("08:30", &["boss@example.com"]))
        .await
        .unwrap();
    h.scheduler
        .set_schedule(settings("17:45", &["boss@example.com"]))
        .await
        .unwrap();

    assert_eq!(h.slots.active_count().await, 1);
    assert_eq!(h.scheduler.active_schedule().await, Some(DailyTime { hour: 17, minute: 45 }));
    assert_eq!(h.scheduler.state().await, SchedulerState::Scheduled);
    assert_eq!(h.store.load().await.unwrap().unwrap().time_of_day, "17:45");
}

#[tokio::test]
async fn invalid_settings_change_nothing() {
    let h = harness(RecordingMailer::default(), InMemorySettingsStore::new());
    h.scheduler
        .set_schedule(settings("08:30", &["boss@example.com"]))
        .await
        .unwrap();

    let err = h
        .scheduler
        .set_schedule(settings("8:30pm", &["boss@example.com"]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_SETTINGS");

    let err = h
        .scheduler
        .set_schedule(settings("09:00", &["boss@example.com", "not an address"]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_ADDRESS");

    assert_eq!(h.scheduler.get_settings().await.time_of_day, "08:30");
    assert_eq!(h.scheduler.active_schedule().await, Some(DailyTime { hour: 8, minute: 30 }));
    assert_eq!(h.store.load().await.unwrap().unwrap().time_of_day, "08:30");
}

#[tokio::test]
async fn disabling_stops_the_slot_and_persists() {
    let h = harness(RecordingMailer::default(), InMemorySettingsStore::new());
    h.scheduler
        .set_schedule(settings("08:30", &["boss@example.com"]))
        .await
        .unwrap();

    h.scheduler.clear_schedule().await.unwrap();

    assert_eq!(h.slots.active_count().await, 0);
    assert_eq!(h.scheduler.state().await, SchedulerState::Unscheduled);
    let saved = h.store.load().await.unwrap().unwrap();
    assert!(!saved.enabled);
    assert_eq!(saved.recipients, vec!["boss@example.com".to_string()]);
}

#[tokio::test]
async fn restore_reregisters_saved_schedule() {
    let store = InMemorySettingsStore::new();
    store
        .save(&settings("07:15", &["boss@example.com"]))
        .await
        .unwrap();

    let h = harness(RecordingMailer::default(), store);
    let restored = h.scheduler.restore().await.unwrap();

    assert_eq!(restored.time_of_day, "07:15");
    assert_eq!(h.scheduler.active_schedule().await, Some(DailyTime { hour: 7, minute: 15 }));
    assert_eq!(*h.slots.replacements.lock().unwrap(), 1);
}

#[tokio::test]
async fn restore_without_saved_settings_stays_unscheduled() {
    let h = harness(RecordingMailer::default(), InMemorySettingsStore::new());
    let restored = h.scheduler.restore().await.unwrap();

    assert!(!restored.enabled);
    assert_eq!(h.scheduler.state().await, SchedulerState::Unscheduled);
    assert!(h.store.load().await.unwrap().is_none());
}

#[tokio::test]
async fn fired_slot_mails_every_recipient_and_escalates_failures() {
    let mailer = RecordingMailer {
        reject: vec!["cfo@example.com".to_string()],
        ..Default::default()
    };
    let h = harness(mailer, InMemorySettingsStore::new());
    h.scheduler
        .set_schedule(settings(
            "08:30",
            &["boss@example.com", "cfo@example.com", "hr@example.com"],
        ))
        .await
        .unwrap();

    h.slots.fire(domain_notifications::scheduler::DAILY_REPORT_SLOT).await;

    assert_eq!(
        *h.mailer.reports.lock().unwrap(),
        ["boss@example.com", "cfo@example.com", "hr@example.com"]
    );

    let emails = h.mailer.emails.lock().unwrap().clone();
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0].to, "ops@example.com");
    assert!(emails[0].subject.starts_with("[打卡系統] 每日報表寄送失敗 - 08:30"));
    assert!(emails[0].html.contains("PARTIAL_DELIVERY"));
    assert!(emails[0].html.contains("cfo@example.com"));

    let stats = h.scheduler.get_delivery_stats().await;
    assert_eq!(stats.total_attempts, 3);
    assert_eq!(stats.failure_count, 1);
    assert_eq!(h.scheduler.delivery_log().await.len(), 3);
}

#[tokio::test]
async fn manual_run_reports_outcome() {
    let h = harness(RecordingMailer::default(), InMemorySettingsStore::new());
    h.scheduler
        .set_schedule(settings("08:30", &["boss@example.com"]))
        .await
        .unwrap();

    let summary = h.scheduler.execute_daily_report().await;
    assert_eq!(summary.status, RunStatus::Delivered);
    assert_eq!(summary.delivered, 1);
    assert!(!summary.escalated);
    assert!(h.mailer.emails.lock().unwrap().is_empty());
    assert_eq!(h.scheduler.get_delivery_stats().await.success_rate, 100.0);
}

#[tokio::test]
async fn scheduler_failure_leaves_previous_schedule_in_place() {
    let h = harness(RecordingMailer::default(), InMemorySettingsStore::new());
    h.scheduler
        .set_schedule(settings("08:30", &["boss@example.com"]))
        .await
        .unwrap();

    h.slots.broken.store(true, Ordering::SeqCst);
    let err = h
        .scheduler
        .set_schedule(settings("17:45", &["cfo@example.com"]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SCHEDULER");

    let err = h.scheduler.clear_schedule().await.unwrap_err();
    assert_eq!(err.code(), "SCHEDULER");

    let current = h.scheduler.get_settings().await;
    assert!(current.enabled);
    assert_eq!(current.time_of_day, "08:30");
    assert_eq!(current.recipients, vec!["boss@example.com".to_string()]);
    assert_eq!(h.scheduler.active_schedule().await, Some(DailyTime { hour: 8, minute: 30 }));
    assert_eq!(h.store.load().await.unwrap().unwrap().time_of_day, "08:30");
}

#[tokio::test]
async fn stats_accumulate_across_runs() {
    let mailer = RecordingMailer {
        fail_calls: vec![2],
        ..Default::default()
    };
    let h = harness(mailer, InMemorySettingsStore::new());
    h.scheduler
        .set_schedule(settings("08:30", &["boss@example.com"]))
        .await
        .unwrap();

    let statuses: Vec<RunStatus> = [
        h.scheduler.execute_daily_report().await,
        h.scheduler.execute_daily_report().await,
        h.scheduler.execute_daily_report().await,
    ]
    .iter()
    .map(|summary| summary.status)
    .collect();
    assert_eq!(
        statuses,
        [RunStatus::Delivered, RunStatus::Failed, RunStatus::Delivered]
    );

    let stats = h.scheduler.get_delivery_stats().await;
    assert_eq!(stats.total_attempts, 3);
    assert_eq!(stats.success_count, 2);
    assert_eq!(stats.failure_count, 1);
    assert!((stats.success_rate - 200.0 / 3.0).abs() < 0.01);

    // only the failed run escalated
    assert_eq!(h.mailer.emails.lock().unwrap().len(), 1);
}

/// Blocks its first fetch until released; later fetches return no rows.
#[derive(Default)]
struct GatedSource {
    calls: AtomicUsize,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl ReportDataSource for GatedSource {
    async fn fetch_rows(&self, _window: &ReportWindow) -> DeliveryResult<Vec<Value>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn overlapping_runs_keep_running_state_until_both_finish() {
    let source = Arc::new(GatedSource::default());
    let h = harness_with(
        RecordingMailer::default(),
        InMemorySettingsStore::new(),
        Arc::clone(&source) as Arc<dyn ReportDataSource>,
    );
    h.scheduler
        .set_schedule(settings("08:30", &["boss@example.com"]))
        .await
        .unwrap();
    let scheduler = Arc::new(h.scheduler);

    let slow = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        async move { scheduler.execute_daily_report().await }
    });
    source.entered.notified().await;

    let quick = scheduler.execute_daily_report().await;
    assert_eq!(quick.status, RunStatus::NoData);
    assert_eq!(scheduler.state().await, SchedulerState::Running);

    source.release.notify_one();
    assert_eq!(slow.await.unwrap().status, RunStatus::NoData);
    assert_eq!(scheduler.state().await, SchedulerState::Scheduled);
}
