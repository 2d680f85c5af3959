//! Provider failover and the public send API.
//!
//! [`EmailService`] owns the active provider. A send that fails on the active
//! provider marks it failed for the rest of the process lifetime (until
//! [`EmailService::initialize`] or [`EmailService::reset`]) and moves on to the
//! next candidate, up to [`MAX_SEND_ATTEMPTS`] transmissions per call.

use crate::connection::ConnectionManager;
use crate::diagnostics::{DiagnosticsEngine, HealthSnapshot};
use crate::error::{DeliveryError, DeliveryResult};
use crate::models::{Attachment, OutgoingEmail, ReportFormat, ReportWindow, SendOutcome};
use crate::providers::{DefaultTransportFactory, MailTransport, TransportFactory};
use crate::registry::{ProviderDescriptor, ProviderRegistry, ProviderSummary};
use crate::templates::{ReportEmailData, TemplateEngine};
use crate::config::MailConfig;
use async_trait::async_trait;
use core_config::Platform;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Transmissions allowed per send before giving up.
pub const MAX_SEND_ATTEMPTS: u32 = 3;
const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(5);

/// Sending interface used by the report scheduler.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReportMailer: Send + Sync {
    async fn send_email(&self, email: OutgoingEmail) -> DeliveryResult<SendOutcome>;

    async fn send_report(
        &self,
        to: &str,
        window: ReportWindow,
        attachments: Vec<Attachment>,
        format: ReportFormat,
    ) -> DeliveryResult<SendOutcome>;
}

#[derive(Clone)]
struct ActiveProvider {
    descriptor: ProviderDescriptor,
    transport: Arc<dyn MailTransport>,
}

#[derive(Default)]
struct FailoverState {
    candidates: Vec<ProviderDescriptor>,
    current: Option<ActiveProvider>,
    /// Names of providers that failed; never retried until re-initialization.
    failed: HashSet<String>,
}

/// Status view for operators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub ready: bool,
    pub current_provider: Option<String>,
    pub candidates: Vec<ProviderSummary>,
    pub failed_providers: Vec<String>,
    pub health: HealthSnapshot,
}

/// Sends mail through the best available provider with automatic failover.
pub struct EmailService {
    registry: ProviderRegistry,
    connections: ConnectionManager,
    diagnostics: Arc<DiagnosticsEngine>,
    templates: TemplateEngine,
    state: Mutex<FailoverState>,
    preflight_timeout: Duration,
}

impl EmailService {
    pub fn new(
        registry: ProviderRegistry,
        connections: ConnectionManager,
        diagnostics: Arc<DiagnosticsEngine>,
    ) -> DeliveryResult<Self> {
        Ok(Self {
            registry,
            connections,
            diagnostics,
            templates: TemplateEngine::new()?,
            state: Mutex::new(FailoverState::default()),
            preflight_timeout: PREFLIGHT_TIMEOUT,
        })
    }

    /// Wire the production transports for `config`.
    pub fn from_config(config: MailConfig, platform: Platform) -> DeliveryResult<Self> {
        Self::with_factory(config, platform, Arc::new(DefaultTransportFactory::new()))
    }

    pub fn with_factory(
        config: MailConfig,
        platform: Platform,
        factory: Arc<dyn TransportFactory>,
    ) -> DeliveryResult<Self> {
        let diagnostics = Arc::new(DiagnosticsEngine::new(platform));
        let connections = ConnectionManager::new(factory, Arc::clone(&diagnostics));
        Self::new(ProviderRegistry::new(config, platform), connections, diagnostics)
    }

    /// Replace the connection manager, e.g. to shorten retry delays.
    pub fn with_connections(mut self, connections: ConnectionManager) -> Self {
        self.connections = connections;
        self
    }

    pub fn with_preflight_timeout(mut self, timeout: Duration) -> Self {
        self.preflight_timeout = timeout;
        self
    }

    /// Detect providers afresh and connect to the first one that works.
    ///
    /// Clears the failed set, so previously failed providers get another chance.
    pub async fn initialize(&self) -> DeliveryResult<ProviderDescriptor> {
        let mut state = self.state.lock().await;
        state.failed.clear();
        state.current = None;
        state.candidates = self.registry.detect();

        match self.select_next(&mut state).await {
            Some(active) => Ok(active.descriptor),
            None => Err(Self::no_provider(&state)),
        }
    }

    /// Forget the active provider, candidates and failures.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        *state = FailoverState::default();
        info!("Email service reset");
    }

    pub async fn is_ready(&self) -> bool {
        self.state.lock().await.current.is_some()
    }

    pub async fn current_provider(&self) -> Option<String> {
        let state = self.state.lock().await;
        state.current.as_ref().map(|a| a.descriptor.name.clone())
    }

    pub async fn health(&self) -> ServiceHealth {
        let state = self.state.lock().await;
        let mut failed_providers: Vec<String> = state.failed.iter().cloned().collect();
        failed_providers.sort();

        ServiceHealth {
            ready: state.current.is_some(),
            current_provider: state.current.as_ref().map(|a| a.descriptor.name.clone()),
            candidates: state.candidates.iter().map(|c| c.summary()).collect(),
            failed_providers,
            health: self.diagnostics.snapshot(),
        }
    }

    /// Abandon the current provider and connect to the next untried one.
    pub async fn switch_to_next_provider(&self) -> DeliveryResult<ProviderDescriptor> {
        let mut state = self.state.lock().await;
        if let Some(current) = state.current.take() {
            state.failed.insert(current.descriptor.name);
        }
        match self.select_next(&mut state).await {
            Some(active) => Ok(active.descriptor),
            None => Err(Self::no_provider(&state)),
        }
    }

    /// Send one message, failing over between providers as needed.
    ///
    /// A failure caused by the message itself (bad recipient, refused
    /// content) is returned as is and leaves the provider in service.
    pub async fn send_email(&self, email: OutgoingEmail) -> DeliveryResult<SendOutcome> {
        if email.to.parse::<lettre::Address>().is_err() {
            return Err(DeliveryError::InvalidAddress(email.to));
        }

        let active = self.ensure_ready().await?;
        let mut active = self.preflight(active).await?;

        let mut attempts = 0;
        let mut last_error = None;

        while attempts < MAX_SEND_ATTEMPTS {
            attempts += 1;
            let provider = active.descriptor.name.clone();

            match active.transport.send(&email).await {
                Ok(message_id) => {
                    self.diagnostics.record_success(&active.descriptor);
                    metrics::counter!("email_send_total", "provider" => provider.clone(), "status" => "success")
                        .increment(1);
                    info!(
                        to = %email.to,
                        provider = %provider,
                        message_id = %message_id,
                        attempts,
                        "Email delivered to provider"
                    );
                    return Ok(SendOutcome {
                        success: true,
                        message_id,
                        provider,
                    });
                }
                Err(failure) if failure.message_rejected => {
                    metrics::counter!("email_send_total", "provider" => provider.clone(), "status" => "rejected")
                        .increment(1);
                    warn!(
                        to = %email.to,
                        provider = %provider,
                        error = %failure,
                        "Provider refused the message"
                    );
                    return Err(DeliveryError::MessageRejected {
                        provider,
                        message: failure.message,
                    });
                }
                Err(failure) => {
                    let err = self.diagnostics.record_failure(&active.descriptor, &failure);
                    metrics::counter!("email_send_total", "provider" => provider.clone(), "status" => "failure")
                        .increment(1);
                    warn!(
                        to = %email.to,
                        provider = %provider,
                        attempt = attempts,
                        error = %err,
                        "Send failed, failing over"
                    );
                    last_error = Some(err);

                    if attempts >= MAX_SEND_ATTEMPTS {
                        break;
                    }
                    match self.fail_over(&provider).await {
                        Some(next) => active = next,
                        None => break,
                    }
                }
            }
        }

        let last = last_error
            .unwrap_or_else(|| DeliveryError::Initialization("no provider attempted".to_string()));
        error!(to = %email.to, attempts, error = %last, "All email providers failed");
        Err(DeliveryError::ProviderExhausted {
            attempts,
            last: Box::new(last),
        })
    }

    /// Render the daily report mail and send it to `to`.
    pub async fn send_report(
        &self,
        to: &str,
        window: ReportWindow,
        attachments: Vec<Attachment>,
        format: ReportFormat,
    ) -> DeliveryResult<SendOutcome> {
        let data = ReportEmailData {
            date: window.date.format("%Y-%m-%d").to_string(),
            period_start: window.start.format("%Y-%m-%d %H:%M").to_string(),
            period_end: window.end.format("%Y-%m-%d %H:%M").to_string(),
            format: format.to_string().to_uppercase(),
            attachment_names: attachments.iter().map(|a| a.filename.clone()).collect(),
        };
        let rendered = self.templates.render_report(&data)?;

        let email = OutgoingEmail::new(to, rendered.subject, rendered.html)
            .with_text(rendered.text)
            .with_attachments(attachments);
        self.send_email(email).await
    }

    /// Active provider, connecting lazily and skipping known failures.
    async fn ensure_ready(&self) -> DeliveryResult<ActiveProvider> {
        let mut state = self.state.lock().await;
        if let Some(active) = &state.current {
            return Ok(active.clone());
        }

        if state.candidates.is_empty() {
            state.candidates = self.registry.detect();
        }

        match self.select_next(&mut state).await {
            Some(active) => Ok(active),
            None => Err(Self::no_provider(&state)),
        }
    }

    /// Re-verify providers that drop idle sessions before sending.
    async fn preflight(&self, active: ActiveProvider) -> DeliveryResult<ActiveProvider> {
        if !active.descriptor.kind.needs_preflight() {
            return Ok(active);
        }

        let verified =
            ConnectionManager::verify_within(active.transport.as_ref(), self.preflight_timeout).await;
        let failure = match verified {
            Ok(()) => return Ok(active),
            Err(failure) => failure,
        };

        warn!(
            provider = %active.descriptor.name,
            error = %failure,
            "Pre-flight verification failed, reconnecting"
        );

        match self.connections.try_connect(&active.descriptor).await {
            Ok(transport) => {
                let refreshed = ActiveProvider {
                    descriptor: active.descriptor.clone(),
                    transport,
                };
                let mut state = self.state.lock().await;
                if state
                    .current
                    .as_ref()
                    .is_some_and(|c| c.descriptor.name == refreshed.descriptor.name)
                {
                    state.current = Some(refreshed.clone());
                }
                Ok(refreshed)
            }
            Err(err) => match self.fail_over(&active.descriptor.name).await {
                Some(next) => Ok(next),
                None => Err(DeliveryError::ProviderExhausted {
                    attempts: 0,
                    last: Box::new(err),
                }),
            },
        }
    }

    /// Mark `failed` and return whichever provider should be used next.
    ///
    /// When another caller already switched away from `failed`, its choice is
    /// reused rather than switching a second time.
    async fn fail_over(&self, failed: &str) -> Option<ActiveProvider> {
        let mut state = self.state.lock().await;
        state.failed.insert(failed.to_string());

        match &state.current {
            Some(current) if current.descriptor.name != failed => {
                debug!(failed, current = %current.descriptor.name, "Provider already switched");
                Some(current.clone())
            }
            _ => {
                state.current = None;
                metrics::counter!("email_failover_total").increment(1);
                self.select_next(&mut state).await
            }
        }
    }

    /// Connect to the first candidate that is neither failed nor current.
    async fn select_next(&self, state: &mut FailoverState) -> Option<ActiveProvider> {
        let pending: Vec<ProviderDescriptor> = state
            .candidates
            .iter()
            .filter(|c| !state.failed.contains(&c.name))
            .cloned()
            .collect();

        for descriptor in pending {
            match self.connections.try_connect(&descriptor).await {
                Ok(transport) => {
                    info!(
                        provider = %descriptor.name,
                        priority = descriptor.priority,
                        "Using email provider"
                    );
                    let active = ActiveProvider {
                        descriptor,
                        transport,
                    };
                    state.current = Some(active.clone());
                    return Some(active);
                }
                Err(err) => {
                    warn!(provider = %descriptor.name, error = %err, "Provider unavailable");
                    state.failed.insert(descriptor.name);
                }
            }
        }

        None
    }

    fn no_provider(state: &FailoverState) -> DeliveryError {
        if state.candidates.is_empty() {
            DeliveryError::Initialization(
                "no email provider is configured; set GMAIL_USER/GMAIL_APP_PASSWORD, SMTP_HOST \
                 or an HTTP API key (BREVO_API_KEY, RESEND_API_KEY, POSTMARK_SERVER_TOKEN)"
                    .to_string(),
            )
        } else {
            DeliveryError::Initialization(format!(
                "all {} configured provider(s) failed",
                state.candidates.len()
            ))
        }
    }
}

#[async_trait]
impl ReportMailer for EmailService {
    async fn send_email(&self, email: OutgoingEmail) -> DeliveryResult<SendOutcome> {
        EmailService::send_email(self, email).await
    }

    async fn send_report(
        &self,
        to: &str,
        window: ReportWindow,
        attachments: Vec<Attachment>,
        format: ReportFormat,
    ) -> DeliveryResult<SendOutcome> {
        EmailService::send_report(self, to, window, attachments, format).await
    }
}
