//! Failure classification and provider health scoring.
//!
//! Every connection or send failure passes through [`DiagnosticsEngine`], which
//! turns the raw transport signal into an [`ErrorCategory`] plus a remediation
//! hint tailored to the provider kind and the hosting platform.

use crate::error::DeliveryError;
use crate::providers::TransportFailure;
use crate::registry::{ProviderDescriptor, ProviderKind};
use core_config::Platform;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use strum::Display;
use tracing::{debug, warn};

/// Points added to a health score per successful operation.
pub const SUCCESS_INCREMENT: u8 = 5;
/// Points removed from a health score per failed operation.
pub const FAILURE_DECREMENT: u8 = 20;

/// Actionable failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorCategory {
    Auth,
    ConnectionRefused,
    Timeout,
    Dns,
    Tls,
    Unknown,
}

/// Classification result handed back to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnosis {
    pub category: ErrorCategory,
    pub remediation: String,
}

/// Outcome fed into the health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    Success,
    Failure,
}

/// Bounded `[0, 100]` reliability estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthScore(u8);

impl HealthScore {
    pub const MAX: u8 = 100;

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn apply(&mut self, event: HealthEvent) {
        self.0 = match event {
            HealthEvent::Success => self.0.saturating_add(SUCCESS_INCREMENT).min(Self::MAX),
            HealthEvent::Failure => self.0.saturating_sub(FAILURE_DECREMENT),
        };
    }
}

impl Default for HealthScore {
    fn default() -> Self {
        Self(Self::MAX)
    }
}

/// Snapshot of the scores for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub overall: u8,
    pub providers: HashMap<String, u8>,
}

#[derive(Default)]
struct HealthBook {
    overall: HealthScore,
    providers: HashMap<String, HealthScore>,
}

/// Classifies failures and keeps health scores.
pub struct DiagnosticsEngine {
    platform: Platform,
    health: Mutex<HealthBook>,
}

impl DiagnosticsEngine {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            health: Mutex::new(HealthBook::default()),
        }
    }

    /// Classify a failure against the provider that produced it.
    pub fn classify(&self, failure: &TransportFailure, provider: &ProviderDescriptor) -> Diagnosis {
        let category = failure
            .signal
            .filter(|c| *c != ErrorCategory::Unknown)
            .unwrap_or_else(|| category_from_message(&failure.message));

        Diagnosis {
            category,
            remediation: self.remediation(category, provider, failure),
        }
    }

    /// Update the overall score and the provider's own score.
    pub fn score(&self, provider: &str, event: HealthEvent) -> u8 {
        let mut book = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        book.providers.entry(provider.to_string()).or_default().apply(event);
        book.overall.apply(event);
        book.overall.value()
    }

    /// Record a successful operation against `provider`.
    pub fn record_success(&self, provider: &ProviderDescriptor) {
        let overall = self.score(&provider.name, HealthEvent::Success);
        debug!(provider = %provider.name, health = overall, "Provider operation succeeded");
    }

    /// Classify, log and score a failure; returns the caller-facing error.
    pub fn record_failure(
        &self,
        provider: &ProviderDescriptor,
        failure: &TransportFailure,
    ) -> DeliveryError {
        let diagnosis = self.classify(failure, provider);
        let overall = self.score(&provider.name, HealthEvent::Failure);

        warn!(
            provider = %provider.name,
            kind = %provider.kind,
            category = %diagnosis.category,
            status = ?failure.status,
            error = %failure.message,
            remediation = %diagnosis.remediation,
            health = overall,
            "Email provider operation failed"
        );

        Self::to_error(provider, failure, diagnosis)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let book = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        HealthSnapshot {
            overall: book.overall.value(),
            providers: book
                .providers
                .iter()
                .map(|(name, score)| (name.clone(), score.value()))
                .collect(),
        }
    }

    /// Map a classified failure into the delivery error taxonomy.
    pub fn to_error(
        provider: &ProviderDescriptor,
        failure: &TransportFailure,
        diagnosis: Diagnosis,
    ) -> DeliveryError {
        let provider = provider.name.clone();
        let message = failure.message.clone();
        match diagnosis.category {
            ErrorCategory::Auth => DeliveryError::Auth {
                provider,
                message,
                diagnosis,
            },
            ErrorCategory::ConnectionRefused | ErrorCategory::Timeout | ErrorCategory::Dns => {
                DeliveryError::Connectivity {
                    provider,
                    message,
                    diagnosis,
                }
            }
            ErrorCategory::Tls => DeliveryError::Protocol {
                provider,
                message,
                diagnosis,
            },
            ErrorCategory::Unknown => DeliveryError::Transport {
                provider,
                message,
                diagnosis,
            },
        }
    }

    fn remediation(
        &self,
        category: ErrorCategory,
        provider: &ProviderDescriptor,
        failure: &TransportFailure,
    ) -> String {
        let smtp_on_cloud = self.platform.is_cloud() && !provider.is_http_api();
        let endpoint = provider.endpoint();

        match (category, provider.kind) {
            (ErrorCategory::Auth, ProviderKind::SmtpGmail) => {
                "Gmail requires an app-specific password (Google Account > Security > App passwords) \
                 with 2-Step Verification enabled, not the account password"
                    .to_string()
            }
            (ErrorCategory::Auth, ProviderKind::SmtpMailgun) => {
                "use the SMTP login and password from the Mailgun domain settings, not the API key"
                    .to_string()
            }
            (ErrorCategory::Auth, ProviderKind::SmtpInternal) => {
                "the company relay should accept unauthenticated mail from this host; ask IT to allow relaying"
                    .to_string()
            }
            (ErrorCategory::Auth, kind) if kind.is_http_api() => format!(
                "check that {} holds a valid, active API key with sending permission",
                kind.credential_env().unwrap_or("the API key")
            ),
            (ErrorCategory::Auth, _) => {
                "verify SMTP_USER and SMTP_PASS against the mail server account".to_string()
            }
            (ErrorCategory::ConnectionRefused | ErrorCategory::Timeout, _) if smtp_on_cloud => {
                "cloud platforms commonly block outbound SMTP ports; configure an HTTP API provider \
                 (BREVO_API_KEY, RESEND_API_KEY or POSTMARK_SERVER_TOKEN)"
                    .to_string()
            }
            (ErrorCategory::ConnectionRefused, _) => format!(
                "nothing accepted the connection at {endpoint}; check host, port and firewall rules"
            ),
            (ErrorCategory::Timeout, _) => format!(
                "{endpoint} did not answer in time; check network reachability or provider status"
            ),
            (ErrorCategory::Dns, ProviderKind::SmtpInternal) => {
                "internal hostnames only resolve inside the company network or VPN".to_string()
            }
            (ErrorCategory::Dns, _) => {
                format!("cannot resolve {endpoint}; check the hostname spelling and DNS settings")
            }
            (ErrorCategory::Tls, ProviderKind::SmtpGmail) => {
                "Gmail needs TLS 1.2+: use port 587 with STARTTLS or 465 with implicit TLS".to_string()
            }
            (ErrorCategory::Tls, ProviderKind::SmtpInternal) => {
                "the relay's certificate or TLS setup was rejected; confirm the port speaks plain SMTP or STARTTLS"
                    .to_string()
            }
            (ErrorCategory::Tls, _) => {
                "TLS negotiation failed; SMTP_SECURE must match the port (465 implicit TLS, 587 STARTTLS)"
                    .to_string()
            }
            (ErrorCategory::Unknown, _) => match failure.status {
                Some(429) => format!("{} is rate limiting; retry later", provider.name),
                Some(status) => format!(
                    "{} answered HTTP {status}; check the provider dashboard for details",
                    provider.name
                ),
                None => format!(
                    "unexpected failure from {}; check the provider status page",
                    provider.name
                ),
            },
        }
    }
}

/// Fallback classification on message text when the transport gave no signal.
fn category_from_message(message: &str) -> ErrorCategory {
    let msg = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

    if has(&[
        "535",
        "534",
        "eauth",
        "authentication",
        "invalid login",
        "username and password not accepted",
        "unauthorized",
        "invalid api key",
    ]) {
        ErrorCategory::Auth
    } else if has(&["connection refused", "econnrefused"]) {
        ErrorCategory::ConnectionRefused
    } else if has(&[
        "failed to lookup address",
        "name or service not known",
        "no such host",
        "enotfound",
        "nodename nor servname",
        "dns error",
    ]) {
        ErrorCategory::Dns
    } else if has(&["timed out", "timeout", "etimedout", "deadline has elapsed"]) {
        ErrorCategory::Timeout
    } else if has(&["tls", "ssl", "handshake", "certificate", "wrong version number"]) {
        ErrorCategory::Tls
    } else {
        ErrorCategory::Unknown
    }
}
