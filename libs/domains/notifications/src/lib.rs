//! Notifications Domain
//!
//! Outbound email delivery for the check-in system: provider discovery,
//! connection verification with diagnostics, automatic failover between
//! providers and the scheduled daily report with escalation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ ReportScheduler  │  ← Cron slot, settings store, escalation
//! └────────┬─────────┘
//!          │
//! ┌────────▼─────────┐
//! │  EmailService    │  ← Active provider, failed set, failover
//! └────────┬─────────┘
//!          │
//! ┌────────▼─────────┐     ┌───────────────────┐
//! │ConnectionManager │ ──► │ DiagnosticsEngine │  ← Classify, remediate, score
//! └────────┬─────────┘     └───────────────────┘
//!          │
//! ┌────────▼─────────┐
//! │  MailTransport   │  ← lettre SMTP, Resend / Postmark / Brevo HTTP APIs
//! └──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use core_config::{FromEnv, Platform};
//! use domain_notifications::{EmailService, MailConfig, OutgoingEmail};
//!
//! let service = EmailService::from_config(MailConfig::from_env()?, Platform::from_env())?;
//! service.initialize().await?;
//!
//! let outcome = service
//!     .send_email(OutgoingEmail::new("boss@example.com", "Subject", "<p>Body</p>"))
//!     .await?;
//! ```

pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod error;
pub mod models;
pub mod providers;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod templates;

pub use config::{MailConfig, SchedulerConfig, Secret};
pub use connection::ConnectionManager;
pub use diagnostics::{Diagnosis, DiagnosticsEngine, ErrorCategory, HealthSnapshot};
pub use error::{DeliveryError, DeliveryResult};
pub use models::{
    Attachment, DeliveryAttempt, DeliveryStats, OutgoingEmail, ReportFormat, ReportWindow,
    ScheduleSettings, SendOutcome,
};
pub use providers::{
    DefaultTransportFactory, MailTransport, TransportConfig, TransportFactory, TransportFailure,
};
pub use registry::{ProviderDescriptor, ProviderKind, ProviderRegistry, ProviderSummary};
pub use retry::RetryPolicy;
pub use scheduler::{
    CronTaskSlots, DailyReportJob, DailyTime, InMemorySettingsStore, JsonFileSettingsStore,
    ReportDataSource, ReportRenderer, ReportRunSummary, ReportScheduler, RunStatus,
    SchedulerState, SettingsStore, TaskSlots,
};
pub use service::{EmailService, ReportMailer, ServiceHealth, MAX_SEND_ATTEMPTS};
pub use templates::{RenderedEmail, TemplateEngine, TestEmailData};
