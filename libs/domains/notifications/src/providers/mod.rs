//! Transport implementations.
//!
//! A [`MailTransport`] is a live handle to one provider: an SMTP session pool
//! built with lettre, or an HTTP API client built on reqwest. Transports are
//! produced by a [`TransportFactory`] from a [`TransportConfig`], which keeps
//! the connection manager testable without a network.

pub mod http_api;
mod smtp;

pub use http_api::{HttpApi, HttpApiTransport};
pub use smtp::SmtpMailTransport;

use crate::diagnostics::ErrorCategory;
use crate::models::OutgoingEmail;
use crate::registry::{ProviderDescriptor, SmtpCredentials};
use crate::config::Secret;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Raw failure reported by a transport, before classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportFailure {
    /// Category the transport could determine on its own, if any.
    pub signal: Option<ErrorCategory>,
    /// HTTP status for API providers.
    pub status: Option<u16>,
    pub message: String,
    /// The provider is healthy but this particular message cannot be sent
    /// (bad recipient, bad attachment, validation reply).
    pub message_rejected: bool,
}

impl TransportFailure {
    pub fn new(signal: Option<ErrorCategory>, message: impl Into<String>) -> Self {
        Self {
            signal,
            status: None,
            message: message.into(),
            message_rejected: false,
        }
    }

    /// Failure caused by the message itself rather than the provider.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            message_rejected: true,
            ..Self::new(None, message)
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            Some(ErrorCategory::Timeout),
            format!("operation timed out after {}ms", after.as_millis()),
        )
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// Live connection to a provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Check that the provider accepts our connection and credentials.
    async fn verify(&self) -> Result<(), TransportFailure>;

    /// Hand the message to the provider and return its message id.
    async fn send(&self, email: &OutgoingEmail) -> Result<String, TransportFailure>;
}

/// How an SMTP session is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpSecurity {
    /// TLS from the first byte (port 465).
    Implicit,
    /// Plain connect, mandatory STARTTLS upgrade.
    StartTls,
    /// STARTTLS when offered, plain otherwise.
    Opportunistic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinTlsVersion {
    Tls12,
    LibraryDefault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsPolicy {
    pub min_version: MinTlsVersion,
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpTransportConfig {
    pub host: String,
    pub port: u16,
    pub security: SmtpSecurity,
    pub tls: TlsPolicy,
    pub credentials: Option<SmtpCredentials>,
    /// Socket-level timeout for every SMTP command.
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpApiConfig {
    pub api: HttpApi,
    pub base_url: String,
    pub api_key: Secret,
    pub timeout: Duration,
}

/// Provider-specific transport settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    Smtp(SmtpTransportConfig),
    HttpApi(HttpApiConfig),
}

/// Builds transports from configuration.
pub trait TransportFactory: Send + Sync {
    fn build(
        &self,
        provider: &ProviderDescriptor,
        config: &TransportConfig,
    ) -> Result<Arc<dyn MailTransport>, TransportFailure>;
}

/// lettre for SMTP, reqwest for HTTP APIs.
#[derive(Debug, Clone, Default)]
pub struct DefaultTransportFactory {
    http: reqwest::Client,
}

impl DefaultTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn build(
        &self,
        provider: &ProviderDescriptor,
        config: &TransportConfig,
    ) -> Result<Arc<dyn MailTransport>, TransportFailure> {
        match config {
            TransportConfig::Smtp(smtp) => Ok(Arc::new(SmtpMailTransport::new(provider, smtp)?)),
            TransportConfig::HttpApi(api) => Ok(Arc::new(HttpApiTransport::new(
                self.http.clone(),
                provider,
                api.clone(),
            ))),
        }
    }
}

/// Flatten an error and its sources into one line; reqwest and lettre keep
/// the useful part (refused, DNS) in the source chain.
pub(crate) fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}
