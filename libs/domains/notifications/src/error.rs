//! Error types for the mail delivery domain.

use crate::diagnostics::Diagnosis;
use thiserror::Error;

/// Result type for delivery operations.
pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Errors that can occur while selecting providers, sending mail or running reports.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// No provider could be reached during initialization.
    #[error("No email provider is available: {0}")]
    Initialization(String),

    /// A provider rejected the configured credentials.
    #[error("Authentication rejected by {provider}: {message} ({})", .diagnosis.remediation)]
    Auth {
        provider: String,
        message: String,
        diagnosis: Diagnosis,
    },

    /// Timeout, refused connection or name resolution failure.
    #[error("Cannot reach {provider}: {message} ({})", .diagnosis.remediation)]
    Connectivity {
        provider: String,
        message: String,
        diagnosis: Diagnosis,
    },

    /// TLS or handshake mismatch.
    #[error("Protocol failure talking to {provider}: {message} ({})", .diagnosis.remediation)]
    Protocol {
        provider: String,
        message: String,
        diagnosis: Diagnosis,
    },

    /// The provider answered but refused the message for a reason we cannot classify.
    #[error("{provider} rejected the message: {message}")]
    Transport {
        provider: String,
        message: String,
        diagnosis: Diagnosis,
    },

    /// The provider refused this message; other messages may still go through.
    #[error("{provider} refused the message: {message}")]
    MessageRejected { provider: String, message: String },

    /// Every candidate failed within a single send.
    #[error("All email providers failed after {attempts} attempt(s): {last}")]
    ProviderExhausted {
        attempts: u32,
        last: Box<DeliveryError>,
    },

    /// Some recipients of a batch did not receive the message.
    #[error("Delivered to {delivered} of {total} recipient(s); failed: {}", .failed.join(", "))]
    PartialDelivery {
        delivered: usize,
        total: usize,
        failed: Vec<String>,
    },

    /// Schedule settings failed validation.
    #[error("Invalid schedule settings: {0}")]
    InvalidSettings(String),

    /// A mailbox could not be parsed.
    #[error("Invalid email address '{0}'")]
    InvalidAddress(String),

    /// The message could not be composed.
    #[error("Failed to build message: {0}")]
    MessageBuild(String),

    /// Report rows could not be fetched.
    #[error("Failed to fetch report data: {0}")]
    DataSource(String),

    /// Report attachment could not be rendered.
    #[error("Failed to render report: {0}")]
    Render(String),

    /// Schedule settings could not be loaded or saved.
    #[error("Settings store error: {0}")]
    SettingsStore(String),

    /// The cron scheduler refused a registration.
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl DeliveryError {
    /// Stable machine-readable code, used in escalation mail and logs.
    pub fn code(&self) -> &'static str {
        match self {
            DeliveryError::Initialization(_) => "INITIALIZATION_FAILED",
            DeliveryError::Auth { .. } => "AUTH_REJECTED",
            DeliveryError::Connectivity { .. } => "CONNECTIVITY",
            DeliveryError::Protocol { .. } => "PROTOCOL",
            DeliveryError::Transport { .. } => "TRANSPORT_REJECTED",
            DeliveryError::MessageRejected { .. } => "MESSAGE_REJECTED",
            DeliveryError::ProviderExhausted { .. } => "PROVIDER_EXHAUSTED",
            DeliveryError::PartialDelivery { .. } => "PARTIAL_DELIVERY",
            DeliveryError::InvalidSettings(_) => "INVALID_SETTINGS",
            DeliveryError::InvalidAddress(_) => "INVALID_ADDRESS",
            DeliveryError::MessageBuild(_) => "MESSAGE_BUILD",
            DeliveryError::DataSource(_) => "DATA_SOURCE",
            DeliveryError::Render(_) => "RENDER",
            DeliveryError::SettingsStore(_) => "SETTINGS_STORE",
            DeliveryError::Scheduler(_) => "SCHEDULER",
        }
    }

    /// Classification attached to this error, looking through exhaustion wrappers.
    pub fn diagnosis(&self) -> Option<&Diagnosis> {
        match self {
            DeliveryError::Auth { diagnosis, .. }
            | DeliveryError::Connectivity { diagnosis, .. }
            | DeliveryError::Protocol { diagnosis, .. }
            | DeliveryError::Transport { diagnosis, .. } => Some(diagnosis),
            DeliveryError::ProviderExhausted { last, .. } => last.diagnosis(),
            _ => None,
        }
    }
}

impl From<tokio_cron_scheduler::JobSchedulerError> for DeliveryError {
    fn from(err: tokio_cron_scheduler::JobSchedulerError) -> Self {
        DeliveryError::Scheduler(err.to_string())
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        DeliveryError::SettingsStore(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for DeliveryError {
    fn from(err: std::io::Error) -> Self {
        DeliveryError::SettingsStore(format!("IO error: {}", err))
    }
}

impl From<handlebars::RenderError> for DeliveryError {
    fn from(err: handlebars::RenderError) -> Self {
        DeliveryError::MessageBuild(err.to_string())
    }
}
