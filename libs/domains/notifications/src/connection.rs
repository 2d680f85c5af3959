//! Per-provider transport construction and verification.

use crate::diagnostics::DiagnosticsEngine;
use crate::error::DeliveryResult;
use crate::providers::{
    HttpApi, HttpApiConfig, MailTransport, MinTlsVersion, SmtpSecurity, SmtpTransportConfig,
    TlsPolicy, TransportConfig, TransportFactory, TransportFailure,
};
use crate::registry::{ProviderDescriptor, ProviderKind, ProviderSettings};
use crate::retry::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SMTP_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds and verifies transports for provider descriptors.
pub struct ConnectionManager {
    factory: Arc<dyn TransportFactory>,
    diagnostics: Arc<DiagnosticsEngine>,
    retry: RetryPolicy,
    verify_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn TransportFactory>, diagnostics: Arc<DiagnosticsEngine>) -> Self {
        Self {
            factory,
            diagnostics,
            retry: RetryPolicy::connection(),
            verify_timeout: VERIFY_TIMEOUT,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    /// Transport settings for `provider`, including its TLS policy.
    pub fn create_transport_config(&self, provider: &ProviderDescriptor) -> TransportConfig {
        match &provider.settings {
            ProviderSettings::HttpApi { api_key } => {
                let api = HttpApi::for_kind(provider.kind).unwrap_or(HttpApi::Resend);
                TransportConfig::HttpApi(HttpApiConfig {
                    api,
                    base_url: api.base_url().to_string(),
                    api_key: api_key.clone(),
                    timeout: HTTP_REQUEST_TIMEOUT,
                })
            }
            ProviderSettings::Smtp {
                host,
                port,
                implicit_tls,
                credentials,
            } => {
                let security = match (provider.kind, *implicit_tls) {
                    (_, true) => SmtpSecurity::Implicit,
                    (ProviderKind::SmtpInternal, false) => SmtpSecurity::Opportunistic,
                    (ProviderKind::SmtpCustom, false) => SmtpSecurity::Opportunistic,
                    _ => SmtpSecurity::StartTls,
                };

                let tls = match provider.kind {
                    // Only the version floor is set; the native-tls backend
                    // offers no way to restrict the cipher list.
                    ProviderKind::SmtpGmail => TlsPolicy {
                        min_version: MinTlsVersion::Tls12,
                        accept_invalid_certs: false,
                    },
                    // Company relays commonly present self-signed certificates.
                    ProviderKind::SmtpInternal => TlsPolicy {
                        min_version: MinTlsVersion::LibraryDefault,
                        accept_invalid_certs: true,
                    },
                    _ => TlsPolicy {
                        min_version: MinTlsVersion::LibraryDefault,
                        accept_invalid_certs: false,
                    },
                };

                TransportConfig::Smtp(SmtpTransportConfig {
                    host: host.clone(),
                    port: *port,
                    security,
                    tls,
                    credentials: credentials.clone(),
                    timeout: SMTP_COMMAND_TIMEOUT,
                })
            }
        }
    }

    /// Build a transport for `provider` and make sure it works.
    ///
    /// HTTP providers are ready as soon as they are built; SMTP providers are
    /// verified with bounded retries. Every failure goes through diagnostics.
    pub async fn try_connect(
        &self,
        provider: &ProviderDescriptor,
    ) -> DeliveryResult<Arc<dyn MailTransport>> {
        let config = self.create_transport_config(provider);
        let transport = self
            .factory
            .build(provider, &config)
            .map_err(|failure| self.diagnostics.record_failure(provider, &failure))?;

        if provider.is_http_api() {
            info!(provider = %provider.name, "HTTP API provider ready");
            return Ok(transport);
        }

        let mut last_error = None;
        let verified = self
            .retry
            .run(
                |attempt| {
                    let transport = Arc::clone(&transport);
                    async move {
                        debug!(provider = %provider.name, attempt, "Verifying SMTP connection");
                        self.verify(transport.as_ref()).await
                    }
                },
                |attempt, failure| {
                    warn!(
                        provider = %provider.name,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        error = %failure,
                        "SMTP verification attempt failed"
                    );
                    last_error = Some(self.diagnostics.record_failure(provider, failure));
                },
            )
            .await;

        match verified {
            Ok(()) => {
                self.diagnostics.record_success(provider);
                info!(provider = %provider.name, endpoint = %provider.endpoint(), "SMTP provider verified");
                Ok(transport)
            }
            Err(failure) => Err(last_error.unwrap_or_else(|| {
                DiagnosticsEngine::to_error(
                    provider,
                    &failure,
                    self.diagnostics.classify(&failure, provider),
                )
            })),
        }
    }

    /// One verification bounded by `timeout`.
    pub async fn verify_within(
        transport: &dyn MailTransport,
        timeout: Duration,
    ) -> Result<(), TransportFailure> {
        match tokio::time::timeout(timeout, transport.verify()).await {
            Ok(result) => result,
            Err(_) => Err(TransportFailure::timeout(timeout)),
        }
    }

    async fn verify(&self, transport: &dyn MailTransport) -> Result<(), TransportFailure> {
        Self::verify_within(transport, self.verify_timeout).await
    }
}
