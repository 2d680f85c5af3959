//! Named daily task slots backed by tokio-cron-scheduler.
//!
//! A slot holds at most one registration. Replacing a slot removes the old
//! cron job before adding the new one, so a reschedule never leaves two jobs
//! firing for the same report.

use crate::error::{DeliveryError, DeliveryResult};
use async_trait::async_trait;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};
use uuid::Uuid;

static TIME_OF_DAY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([01]\d|2[0-3]):([0-5]\d)$").expect("valid time-of-day regex"));

/// Offset of the business time zone from UTC, in minutes.
const BUSINESS_UTC_OFFSET_MINUTES: i32 = 8 * 60;
const MINUTES_PER_DAY: i32 = 24 * 60;

/// Wall-clock `HH:mm` in the business time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DailyTime {
    pub hour: u8,
    pub minute: u8,
}

impl DailyTime {
    /// Six-field cron expression (seconds first) firing daily at this local
    /// time, expressed in UTC.
    pub fn cron_expression(&self) -> String {
        let local = i32::from(self.hour) * 60 + i32::from(self.minute);
        let utc = (local - BUSINESS_UTC_OFFSET_MINUTES).rem_euclid(MINUTES_PER_DAY);
        format!("0 {} {} * * *", utc % 60, utc / 60)
    }
}

impl FromStr for DailyTime {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = TIME_OF_DAY.captures(s.trim()).ok_or_else(|| {
            DeliveryError::InvalidSettings(format!("time of day '{}' is not HH:mm", s))
        })?;

        let field = |idx: usize| -> Result<u8, DeliveryError> {
            captures[idx]
                .parse()
                .map_err(|_| DeliveryError::InvalidSettings(format!("time of day '{}' is not HH:mm", s)))
        };

        Ok(Self {
            hour: field(1)?,
            minute: field(2)?,
        })
    }
}

impl fmt::Display for DailyTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Work a slot runs when it fires.
pub type SlotTask = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Named daily slots; each slot holds at most one registration.
#[async_trait]
pub trait TaskSlots: Send + Sync {
    /// Register `task` at `at`, stopping whatever the slot held before.
    async fn replace(&self, slot: &str, at: DailyTime, task: SlotTask) -> DeliveryResult<()>;

    /// Stop the slot; returns whether anything was registered.
    async fn stop(&self, slot: &str) -> DeliveryResult<bool>;

    async fn active(&self, slot: &str) -> Option<DailyTime>;

    async fn active_count(&self) -> usize;
}

#[derive(Clone, Copy)]
struct Registration {
    job_id: Uuid,
    at: DailyTime,
}

/// [`TaskSlots`] on top of a running [`JobScheduler`].
pub struct CronTaskSlots {
    scheduler: JobScheduler,
    registrations: Mutex<HashMap<String, Registration>>,
}

impl CronTaskSlots {
    /// Create and start the underlying scheduler.
    pub async fn start() -> DeliveryResult<Self> {
        let scheduler = JobScheduler::new().await?;
        scheduler.start().await?;
        info!("Cron scheduler started");

        Ok(Self {
            scheduler,
            registrations: Mutex::new(HashMap::new()),
        })
    }

    /// Stop every slot and the scheduler itself.
    pub async fn shutdown(&self) -> DeliveryResult<()> {
        let mut registrations = self.registrations.lock().await;
        let slots: Vec<String> = registrations.keys().cloned().collect();
        for slot in slots {
            if let Some(registration) = registrations.get(&slot).copied() {
                self.scheduler.remove(&registration.job_id).await?;
                registrations.remove(&slot);
                debug!(slot = %slot, "Removed cron job");
            }
        }
        let mut scheduler = self.scheduler.clone();
        scheduler.shutdown().await?;
        info!("Cron scheduler stopped");
        Ok(())
    }
}

#[async_trait]
impl TaskSlots for CronTaskSlots {
    async fn replace(&self, slot: &str, at: DailyTime, task: SlotTask) -> DeliveryResult<()> {
        let mut registrations = self.registrations.lock().await;

        // The entry goes only once the scheduler has dropped the job, so a
        // live job is never missing from the map.
        if let Some(previous) = registrations.get(slot).copied() {
            self.scheduler.remove(&previous.job_id).await?;
            registrations.remove(slot);
            debug!(slot, previous = %previous.at, "Replaced existing cron job");
        }

        let cron = at.cron_expression();
        let slot_name = slot.to_string();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let task = Arc::clone(&task);
            let slot_name = slot_name.clone();
            Box::pin(async move {
                debug!(slot = %slot_name, "Cron slot fired");
                task().await;
            })
        })?;

        let job_id = self.scheduler.add(job).await?;
        registrations.insert(slot.to_string(), Registration { job_id, at });

        info!(slot, time = %at, cron = %cron, "Scheduled daily task (UTC+8)");
        Ok(())
    }

    async fn stop(&self, slot: &str) -> DeliveryResult<bool> {
        let mut registrations = self.registrations.lock().await;
        match registrations.get(slot).copied() {
            Some(registration) => {
                self.scheduler.remove(&registration.job_id).await?;
                registrations.remove(slot);
                info!(slot, time = %registration.at, "Stopped daily task");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn active(&self, slot: &str) -> Option<DailyTime> {
        self.registrations.lock().await.get(slot).map(|r| r.at)
    }

    async fn active_count(&self) -> usize {
        self.registrations.lock().await.len()
    }
}
