//! SMTP transport using lettre.

use super::{
    error_chain, MailTransport, MinTlsVersion, SmtpSecurity, SmtpTransportConfig, TransportFailure,
};
use crate::diagnostics::ErrorCategory;
use crate::models::OutgoingEmail;
use crate::registry::ProviderDescriptor;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart},
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters, TlsVersion},
        Error as SmtpError,
    },
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::{debug, info};

/// Reply codes that mean the server refused our credentials.
const AUTH_REPLY_CODES: &[&str] = &["530", "534", "535"];

/// SMTP transport for one provider.
pub struct SmtpMailTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    host: String,
    port: u16,
}

impl SmtpMailTransport {
    pub fn new(
        provider: &ProviderDescriptor,
        config: &SmtpTransportConfig,
    ) -> Result<Self, TransportFailure> {
        let from = sender_mailbox(provider)?;
        let transport = Self::build_transport(config)?;

        Ok(Self {
            transport,
            from,
            host: config.host.clone(),
            port: config.port,
        })
    }

    fn build_transport(
        config: &SmtpTransportConfig,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, TransportFailure> {
        let mut tls_builder = TlsParameters::builder(config.host.clone())
            .dangerous_accept_invalid_certs(config.tls.accept_invalid_certs);
        if config.tls.min_version == MinTlsVersion::Tls12 {
            tls_builder = tls_builder.set_min_tls_version(TlsVersion::Tlsv12);
        }
        let tls_parameters = tls_builder.build().map_err(|e| {
            TransportFailure::new(
                Some(ErrorCategory::Tls),
                format!("TLS configuration error: {}", e),
            )
        })?;

        let tls = match config.security {
            SmtpSecurity::Implicit => Tls::Wrapper(tls_parameters),
            SmtpSecurity::StartTls => Tls::Required(tls_parameters),
            SmtpSecurity::Opportunistic => Tls::Opportunistic(tls_parameters),
        };

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            .port(config.port)
            .tls(tls)
            .timeout(Some(config.timeout));

        if let Some(credentials) = &config.credentials {
            builder = builder.credentials(Credentials::new(
                credentials.user.clone(),
                credentials.password.expose().to_string(),
            ));
        }

        Ok(builder.build())
    }

    /// Build a lettre Message from an OutgoingEmail.
    fn build_message(&self, email: &OutgoingEmail) -> Result<Message, TransportFailure> {
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|e| TransportFailure::rejected(format!("Invalid to address '{}': {}", email.to, e)))?;

        let mut parts = match &email.text {
            Some(text) => MultiPart::mixed().multipart(MultiPart::alternative_plain_html(
                text.clone(),
                email.html.clone(),
            )),
            None => MultiPart::mixed().singlepart(SinglePart::html(email.html.clone())),
        };

        for attachment in &email.attachments {
            let content_type = ContentType::parse(&attachment.content_type).map_err(|e| {
                TransportFailure::rejected(format!(
                    "Invalid content type '{}': {}",
                    attachment.content_type, e
                ))
            })?;
            parts = parts.singlepart(
                Attachment::new(attachment.filename.clone())
                    .body(attachment.content.clone(), content_type),
            );
        }

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject.clone())
            .multipart(parts)
            .map_err(|e| TransportFailure::rejected(format!("Failed to build email message: {}", e)))
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn verify(&self) -> Result<(), TransportFailure> {
        debug!(host = %self.host, port = self.port, "Verifying SMTP connection");

        match self.transport.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(TransportFailure::new(
                None,
                format!("{}:{} did not accept the connection test", self.host, self.port),
            )),
            Err(e) => Err(classify_smtp_error(&e)),
        }
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<String, TransportFailure> {
        debug!(
            to = %email.to,
            subject = %email.subject,
            host = %self.host,
            port = self.port,
            attachments = email.attachments.len(),
            "Sending email via SMTP"
        );

        let message = self.build_message(email)?;
        let header_id = message
            .headers()
            .get_raw("Message-ID")
            .map(|id| id.trim_matches(|c| c == '<' || c == '>').to_string());

        let response = self
            .transport
            .send(message)
            .await
            .map_err(|e| classify_smtp_error(&e))?;

        let message_id = header_id
            .or_else(|| response.message().next().map(|s| s.to_string()))
            .unwrap_or_default();

        info!(to = %email.to, message_id = %message_id, "Email sent via SMTP");
        Ok(message_id)
    }
}

fn sender_mailbox(provider: &ProviderDescriptor) -> Result<Mailbox, TransportFailure> {
    format!("{} <{}>", provider.from_name, provider.from_address)
        .parse()
        .map_err(|e| {
            TransportFailure::new(
                None,
                format!("Invalid from address '{}': {}", provider.from_address, e),
            )
        })
}

fn classify_smtp_error(err: &SmtpError) -> TransportFailure {
    let message = error_chain(err);
    let signal = if err.is_timeout() {
        Some(ErrorCategory::Timeout)
    } else if err.is_tls() {
        Some(ErrorCategory::Tls)
    } else if err
        .status()
        .is_some_and(|code| AUTH_REPLY_CODES.contains(&code.to_string().as_str()))
    {
        Some(ErrorCategory::Auth)
    } else {
        None
    };
    TransportFailure::new(signal, message)
}
