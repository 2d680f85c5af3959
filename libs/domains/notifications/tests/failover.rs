//! End-to-end failover through `EmailService` with scripted transports.

use async_trait::async_trait;
use core_config::{CloudHost, Platform};
use domain_notifications::config::{GmailConfig, InternalRelayConfig};
use domain_notifications::{
    ConnectionManager, DeliveryError, DiagnosticsEngine, EmailService, ErrorCategory, MailConfig,
    MailTransport, OutgoingEmail, ProviderDescriptor, ProviderRegistry, RetryPolicy, Secret,
    TransportConfig, TransportFactory, TransportFailure,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Transport that plays back queued results; an empty queue means success.
#[derive(Default)]
struct ScriptedTransport {
    verify_results: Mutex<VecDeque<Result<(), TransportFailure>>>,
    send_results: Mutex<VecDeque<Result<String, TransportFailure>>>,
    verify_calls: AtomicU32,
    sent_to: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    fn verifying(self, results: Vec<Result<(), TransportFailure>>) -> Self {
        *self.verify_results.lock().unwrap() = results.into();
        self
    }

    fn sending(self, results: Vec<Result<String, TransportFailure>>) -> Self {
        *self.send_results.lock().unwrap() = results.into();
        self
    }
}

#[async_trait]
impl MailTransport for ScriptedTransport {
    async fn verify(&self) -> Result<(), TransportFailure> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        self.verify_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<String, TransportFailure> {
        self.sent_to.lock().unwrap().push(email.to.clone());
        self.send_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("msg-{}", email.to)))
    }
}

/// Hands out the transport registered for each provider name; unknown
/// providers refuse the connection.
#[derive(Default)]
struct ScriptedFactory {
    transports: HashMap<String, Arc<ScriptedTransport>>,
    builds: Mutex<Vec<String>>,
}

impl ScriptedFactory {
    fn with(mut self, name: &str, transport: ScriptedTransport) -> Self {
        self.transports.insert(name.to_string(), Arc::new(transport));
        self
    }

    fn transport(&self, name: &str) -> Arc<ScriptedTransport> {
        Arc::clone(&self.transports[name])
    }

    fn builds(&self) -> Vec<String> {
        self.builds.lock().unwrap().clone()
    }
}

impl TransportFactory for ScriptedFactory {
    fn build(
        &self,
        provider: &ProviderDescriptor,
        _config: &TransportConfig,
    ) -> Result<Arc<dyn MailTransport>, TransportFailure> {
        self.builds.lock().unwrap().push(provider.name.clone());
        match self.transports.get(&provider.name) {
            Some(transport) => Ok(Arc::clone(transport) as Arc<dyn MailTransport>),
            None => Err(TransportFailure::new(
                Some(ErrorCategory::ConnectionRefused),
                "connect ECONNREFUSED",
            )),
        }
    }
}

fn service(config: MailConfig, platform: Platform, factory: Arc<ScriptedFactory>) -> EmailService {
    let diagnostics = Arc::new(DiagnosticsEngine::new(platform));
    let connections = ConnectionManager::new(factory, Arc::clone(&diagnostics))
        .with_retry_policy(RetryPolicy::immediate(2));
    EmailService::new(ProviderRegistry::new(config, platform), connections, diagnostics).unwrap()
}

fn gmail() -> GmailConfig {
    GmailConfig {
        user: "reports@gmail.com".to_string(),
        app_password: Secret::new("abcd efgh ijkl mnop"),
    }
}

fn email(to: &str) -> OutgoingEmail {
    OutgoingEmail::new(to, "員工打卡日報表 - 2024-03-10", "<p>附件</p>")
}

#[tokio::test]
async fn cloud_platform_prefers_http_api_and_fails_over_on_auth_rejection() {
    let config = MailConfig {
        from_address: Some("reports@example.com".to_string()),
        gmail: Some(gmail()),
        brevo_api_key: Some(Secret::new("bad-key")),
        resend_api_key: Some(Secret::new("re_live")),
        ..Default::default()
    };
    let factory = Arc::new(
        ScriptedFactory::default()
            .with(
                "brevo",
                ScriptedTransport::default().sending(vec![Err(TransportFailure::new(
                    Some(ErrorCategory::Auth),
                    "Key not found",
                )
                .with_status(401))]),
            )
            .with("resend", ScriptedTransport::default())
            .with("gmail", ScriptedTransport::default()),
    );
    let svc = service(
        config,
        Platform::Cloud(CloudHost::Render),
        Arc::clone(&factory),
    );

    let outcome = svc.send_email(email("boss@example.com")).await.unwrap();
    assert_eq!(outcome.provider, "resend");
    assert_eq!(outcome.message_id, "msg-boss@example.com");

    let health = svc.health().await;
    assert_eq!(health.failed_providers, vec!["brevo".to_string()]);
    let names: Vec<_> = health.candidates.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["brevo", "resend", "gmail"]);
    assert!(health.health.providers["brevo"] < 100);

    // gmail is never contacted while an HTTP provider works
    assert!(!factory.builds().contains(&"gmail".to_string()));
}

#[tokio::test]
async fn local_platform_skips_unreachable_relay_and_uses_gmail() {
    let config = MailConfig {
        internal_relay: Some(InternalRelayConfig {
            host: "mail.corp.internal".to_string(),
            port: 25,
        }),
        from_address: Some("reports@corp.internal".to_string()),
        gmail: Some(gmail()),
        ..Default::default()
    };
    let factory = Arc::new(ScriptedFactory::default().with("gmail", ScriptedTransport::default()));
    let svc = service(config, Platform::Local, Arc::clone(&factory));

    let chosen = svc.initialize().await.unwrap();
    assert_eq!(chosen.name, "gmail");
    assert_eq!(factory.builds(), ["company-smtp", "gmail"]);

    let outcome = svc.send_email(email("boss@example.com")).await.unwrap();
    assert_eq!(outcome.provider, "gmail");

    // connect verification plus the pre-flight check before sending
    assert_eq!(factory.transport("gmail").verify_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn stale_gmail_session_is_reconnected_before_sending() {
    let config = MailConfig {
        gmail: Some(gmail()),
        ..Default::default()
    };
    let factory = Arc::new(ScriptedFactory::default().with(
        "gmail",
        ScriptedTransport::default().verifying(vec![
            Ok(()),
            Err(TransportFailure::new(None, "421 connection closed by peer")),
            Ok(()),
        ]),
    ));
    let svc = service(config, Platform::Local, Arc::clone(&factory));
    svc.initialize().await.unwrap();

    let outcome = svc.send_email(email("boss@example.com")).await.unwrap();
    assert_eq!(outcome.provider, "gmail");

    let gmail = factory.transport("gmail");
    assert_eq!(gmail.verify_calls.load(Ordering::SeqCst), 3);
    assert_eq!(*gmail.sent_to.lock().unwrap(), ["boss@example.com"]);
    assert!(svc.health().await.failed_providers.is_empty());
}

#[tokio::test]
async fn exhausting_every_provider_keeps_last_diagnosis() {
    let config = MailConfig {
        from_address: Some("reports@example.com".to_string()),
        brevo_api_key: Some(Secret::new("bv")),
        postmark_server_token: Some(Secret::new("pm")),
        ..Default::default()
    };
    let rejecting = || {
        ScriptedTransport::default().sending(vec![Err(TransportFailure::new(
            Some(ErrorCategory::Timeout),
            "request timed out",
        ))])
    };
    let factory = Arc::new(
        ScriptedFactory::default()
            .with("brevo", rejecting())
            .with("postmark", rejecting()),
    );
    let svc = service(config, Platform::Cloud(CloudHost::Fly), factory);

    let err = svc.send_email(email("boss@example.com")).await.unwrap_err();
    assert_eq!(err.code(), "PROVIDER_EXHAUSTED");
    match &err {
        DeliveryError::ProviderExhausted { attempts, .. } => assert_eq!(*attempts, 2),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.diagnosis().map(|d| d.category), Some(ErrorCategory::Timeout));

    let health = svc.health().await;
    assert!(!health.ready);
    assert_eq!(health.failed_providers, vec!["brevo".to_string(), "postmark".to_string()]);

    // a fresh initialization gives both providers another chance
    assert_eq!(svc.initialize().await.unwrap().name, "brevo");
}

#[tokio::test]
async fn concurrent_sends_share_one_failover() {
    let config = MailConfig {
        from_address: Some("reports@example.com".to_string()),
        brevo_api_key: Some(Secret::new("bv")),
        resend_api_key: Some(Secret::new("re")),
        postmark_server_token: Some(Secret::new("pm")),
        ..Default::default()
    };
    let factory = Arc::new(
        ScriptedFactory::default()
            .with(
                "brevo",
                ScriptedTransport::default().sending(vec![
                    Err(TransportFailure::new(None, "503 unavailable").with_status(503)),
                    Err(TransportFailure::new(None, "503 unavailable").with_status(503)),
                ]),
            )
            .with("resend", ScriptedTransport::default())
            .with("postmark", ScriptedTransport::default()),
    );
    let svc = Arc::new(service(
        config,
        Platform::Cloud(CloudHost::Railway),
        Arc::clone(&factory),
    ));
    svc.initialize().await.unwrap();

    let sends = ["a@example.com", "b@example.com"].map(|to| {
        let svc = Arc::clone(&svc);
        tokio::spawn(async move { svc.send_email(email(to)).await })
    });
    for send in sends {
        assert_eq!(send.await.unwrap().unwrap().provider, "resend");
    }

    // brevo is marked failed once; neither send skips past resend
    assert_eq!(svc.health().await.failed_providers, vec!["brevo".to_string()]);
    assert_eq!(svc.current_provider().await.as_deref(), Some("resend"));
}

#[tokio::test]
async fn bad_messages_do_not_take_providers_out_of_service() {
    let config = MailConfig {
        from_address: Some("reports@example.com".to_string()),
        brevo_api_key: Some(Secret::new("bv")),
        resend_api_key: Some(Secret::new("re")),
        ..Default::default()
    };
    let factory = Arc::new(
        ScriptedFactory::default()
            .with(
                "brevo",
                ScriptedTransport::default().sending(vec![Err(TransportFailure::rejected(
                    "Brevo API error (400 Bad Request): attachment extension not allowed",
                )
                .with_status(400))]),
            )
            .with("resend", ScriptedTransport::default()),
    );
    let svc = service(
        config,
        Platform::Cloud(CloudHost::Render),
        Arc::clone(&factory),
    );

    // a malformed recipient is refused before any provider is contacted
    let err = svc.send_email(email("not an address")).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_ADDRESS");
    assert!(factory.builds().is_empty());

    // the provider refuses one message but stays in service
    let err = svc.send_email(email("boss@example.com")).await.unwrap_err();
    assert_eq!(err.code(), "MESSAGE_REJECTED");
    assert!(svc.health().await.failed_providers.is_empty());

    let outcome = svc.send_email(email("boss@example.com")).await.unwrap();
    assert_eq!(outcome.provider, "brevo");
    assert_eq!(factory.builds(), ["brevo"]);
    assert!(factory.transport("resend").sent_to.lock().unwrap().is_empty());
}
