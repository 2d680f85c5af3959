//! Data models for the mail delivery domain.

use chrono::{DateTime, Days, FixedOffset, NaiveDate, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Business time zone: reports, schedules and escalation timestamps are UTC+8.
pub fn business_offset() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).expect("UTC+8 is a valid offset")
}

// ============================================================================
// Outgoing mail
// ============================================================================

/// A file attached to an outgoing email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

impl Attachment {
    pub fn new(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            content: content.into(),
        }
    }
}

/// Email content ready for sending through any provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingEmail {
    /// Recipient email address.
    pub to: String,
    /// Email subject.
    pub subject: String,
    /// HTML body content.
    pub html: String,
    /// Optional plain text alternative.
    pub text: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl OutgoingEmail {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            html: html.into(),
            text: None,
            attachments: Vec::new(),
        }
    }

    /// Set plain text alternative
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Set attachments
    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Successful hand-off to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendOutcome {
    pub success: bool,
    /// Provider-specific message ID for tracking.
    pub message_id: String,
    /// Name of the provider that accepted the message.
    pub provider: String,
}

// ============================================================================
// Delivery statistics
// ============================================================================

/// One report send to one recipient.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryAttempt {
    pub timestamp: DateTime<Utc>,
    pub provider: Option<String>,
    pub recipient: String,
    pub subject: String,
    pub success: bool,
    pub error_summary: Option<String>,
}

/// Cumulative statistics derived from the delivery log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DeliveryStats {
    pub total_attempts: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Percentage in `[0, 100]`; `0` when nothing has been attempted.
    pub success_rate: f64,
}

impl DeliveryStats {
    pub fn from_attempts(attempts: &[DeliveryAttempt]) -> Self {
        let total_attempts = attempts.len() as u64;
        let success_count = attempts.iter().filter(|a| a.success).count() as u64;
        let success_rate = if total_attempts == 0 {
            0.0
        } else {
            success_count as f64 / total_attempts as f64 * 100.0
        };

        Self {
            total_attempts,
            success_count,
            failure_count: total_attempts - success_count,
            success_rate,
        }
    }
}

// ============================================================================
// Report scheduling
// ============================================================================

/// Attachment format requested from the rendering collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Csv,
    Excel,
    Zip,
    Html,
}

/// Persisted daily report schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSettings {
    pub enabled: bool,
    /// Each entry receives its own copy, duplicates included.
    #[serde(default)]
    pub recipients: Vec<String>,
    /// Wall-clock `HH:mm` in the business time zone.
    pub time_of_day: String,
    #[serde(default)]
    pub report_format: ReportFormat,
    #[serde(default)]
    pub include_photos: bool,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            recipients: Vec::new(),
            time_of_day: "08:00".to_string(),
            report_format: ReportFormat::Csv,
            include_photos: false,
        }
    }
}

/// The calendar day a report run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReportWindow {
    pub date: NaiveDate,
    /// First instant of the day, inclusive.
    pub start: DateTime<FixedOffset>,
    /// Last instant of the day, inclusive.
    pub end: DateTime<FixedOffset>,
}

impl ReportWindow {
    /// Window covering `date` in the business time zone.
    pub fn for_date(date: NaiveDate) -> Self {
        let offset = business_offset();
        let local_midnight = date.and_time(NaiveTime::MIN);
        let utc_midnight = local_midnight - TimeDelta::seconds(offset.local_minus_utc() as i64);
        let start = DateTime::<FixedOffset>::from_naive_utc_and_offset(utc_midnight, offset);
        let end = start + TimeDelta::days(1) - TimeDelta::milliseconds(1);

        Self { date, start, end }
    }

    /// The business day immediately preceding `now`.
    pub fn preceding_day(now: DateTime<Utc>) -> Self {
        let today = now.with_timezone(&business_offset()).date_naive();
        let yesterday = today
            .checked_sub_days(Days::new(1))
            .unwrap_or(NaiveDate::MIN);
        Self::for_date(yesterday)
    }
}
