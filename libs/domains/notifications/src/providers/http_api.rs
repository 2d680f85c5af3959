//! HTTP API transports: Resend, Postmark and Brevo.
//!
//! All three accept a JSON document over HTTPS, so they share one transport
//! and differ only in request shape, auth header and response field.

use super::{error_chain, HttpApiConfig, MailTransport, TransportFailure};
use crate::diagnostics::ErrorCategory;
use crate::models::OutgoingEmail;
use crate::registry::{ProviderDescriptor, ProviderKind};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info};

const MAX_ERROR_BODY: usize = 500;

/// Supported HTTP email APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpApi {
    Resend,
    Postmark,
    Brevo,
}

impl HttpApi {
    pub fn for_kind(kind: ProviderKind) -> Option<Self> {
        match kind {
            ProviderKind::HttpResend => Some(HttpApi::Resend),
            ProviderKind::HttpPostmark => Some(HttpApi::Postmark),
            ProviderKind::HttpBrevo => Some(HttpApi::Brevo),
            _ => None,
        }
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            HttpApi::Resend => "https://api.resend.com",
            HttpApi::Postmark => "https://api.postmarkapp.com",
            HttpApi::Brevo => "https://api.brevo.com/v3",
        }
    }

    fn send_path(&self) -> &'static str {
        match self {
            HttpApi::Resend => "/emails",
            HttpApi::Postmark => "/email",
            HttpApi::Brevo => "/smtp/email",
        }
    }

    /// Cheap authenticated read used to check the key.
    fn verify_path(&self) -> &'static str {
        match self {
            HttpApi::Resend => "/domains",
            HttpApi::Postmark => "/server",
            HttpApi::Brevo => "/account",
        }
    }

    fn message_id_field(&self) -> &'static str {
        match self {
            HttpApi::Resend => "id",
            HttpApi::Postmark => "MessageID",
            HttpApi::Brevo => "messageId",
        }
    }

    fn authorize(&self, request: RequestBuilder, api_key: &str) -> RequestBuilder {
        match self {
            HttpApi::Resend => request.bearer_auth(api_key),
            HttpApi::Postmark => request.header("X-Postmark-Server-Token", api_key),
            HttpApi::Brevo => request.header("api-key", api_key),
        }
    }
}

// Resend request structures

#[derive(Debug, Serialize)]
struct ResendRequest<'a> {
    from: String,
    to: Vec<&'a str>,
    subject: &'a str,
    html: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<ResendAttachment<'a>>,
}

#[derive(Debug, Serialize)]
struct ResendAttachment<'a> {
    filename: &'a str,
    content: String,
}

// Postmark request structures

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct PostmarkRequest<'a> {
    from: String,
    to: &'a str,
    subject: &'a str,
    html_body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text_body: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<PostmarkAttachment<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct PostmarkAttachment<'a> {
    name: &'a str,
    content: String,
    content_type: &'a str,
}

// Brevo request structures

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BrevoRequest<'a> {
    sender: BrevoContact<'a>,
    to: Vec<BrevoContact<'a>>,
    subject: &'a str,
    html_content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text_content: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachment: Vec<BrevoAttachment<'a>>,
}

#[derive(Debug, Serialize)]
struct BrevoContact<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct BrevoAttachment<'a> {
    name: &'a str,
    content: String,
}

/// Transport for one HTTP API provider.
pub struct HttpApiTransport {
    client: Client,
    config: HttpApiConfig,
    from_address: String,
    from_name: String,
}

impl HttpApiTransport {
    pub fn new(client: Client, provider: &ProviderDescriptor, config: HttpApiConfig) -> Self {
        Self {
            client,
            config,
            from_address: provider.from_address.clone(),
            from_name: provider.from_name.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn from_header(&self) -> String {
        format!("{} <{}>", self.from_name, self.from_address)
    }

    /// JSON body for the configured API.
    fn request_body(&self, email: &OutgoingEmail) -> Result<Value, TransportFailure> {
        let text = email.text.as_deref();
        let body = match self.config.api {
            HttpApi::Resend => serde_json::to_value(ResendRequest {
                from: self.from_header(),
                to: vec![email.to.as_str()],
                subject: &email.subject,
                html: &email.html,
                text,
                attachments: email
                    .attachments
                    .iter()
                    .map(|a| ResendAttachment {
                        filename: &a.filename,
                        content: STANDARD.encode(&a.content),
                    })
                    .collect(),
            }),
            HttpApi::Postmark => serde_json::to_value(PostmarkRequest {
                from: self.from_header(),
                to: &email.to,
                subject: &email.subject,
                html_body: &email.html,
                text_body: text,
                attachments: email
                    .attachments
                    .iter()
                    .map(|a| PostmarkAttachment {
                        name: &a.filename,
                        content: STANDARD.encode(&a.content),
                        content_type: &a.content_type,
                    })
                    .collect(),
            }),
            HttpApi::Brevo => serde_json::to_value(BrevoRequest {
                sender: BrevoContact {
                    email: &self.from_address,
                    name: Some(&self.from_name),
                },
                to: vec![BrevoContact {
                    email: &email.to,
                    name: None,
                }],
                subject: &email.subject,
                html_content: &email.html,
                text_content: text,
                attachment: email
                    .attachments
                    .iter()
                    .map(|a| BrevoAttachment {
                        name: &a.filename,
                        content: STANDARD.encode(&a.content),
                    })
                    .collect(),
            }),
        };

        body.map_err(|e| TransportFailure::new(None, format!("Failed to encode request: {}", e)))
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Value, TransportFailure> {
        let request = self
            .config
            .api
            .authorize(request, self.config.api_key.expose())
            .header("Accept", "application/json")
            .timeout(self.config.timeout);

        let response = request.send().await.map_err(|e| classify_reqwest_error(&e))?;
        let status = response.status();

        if status.is_success() {
            return Ok(response.json::<Value>().await.unwrap_or(Value::Null));
        }

        let body = response.text().await.unwrap_or_default();
        error!(
            api = ?self.config.api,
            status = %status,
            error = %truncate(&body),
            "Email API request failed"
        );
        Err(classify_status(self.config.api, status, &body))
    }
}

#[async_trait]
impl MailTransport for HttpApiTransport {
    async fn verify(&self) -> Result<(), TransportFailure> {
        debug!(api = ?self.config.api, "Verifying API key");
        let request = self.client.get(self.url(self.config.api.verify_path()));
        self.execute(request).await.map(|_| ())
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<String, TransportFailure> {
        debug!(
            api = ?self.config.api,
            to = %email.to,
            subject = %email.subject,
            attachments = email.attachments.len(),
            "Sending email via HTTP API"
        );

        let body = self.request_body(email)?;
        let request = self
            .client
            .post(self.url(self.config.api.send_path()))
            .json(&body);
        let response = self.execute(request).await?;

        let message_id = match response.get(self.config.api.message_id_field()) {
            Some(Value::String(id)) => id.clone(),
            Some(other) if !other.is_null() => other.to_string(),
            _ => String::new(),
        };

        info!(api = ?self.config.api, to = %email.to, message_id = %message_id, "Email sent via HTTP API");
        Ok(message_id)
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> TransportFailure {
    let signal = if err.is_timeout() {
        Some(ErrorCategory::Timeout)
    } else {
        None
    };
    TransportFailure::new(signal, error_chain(err))
}

fn classify_status(api: HttpApi, status: StatusCode, body: &str) -> TransportFailure {
    // Postmark reports a bad server token as 422 with ErrorCode 10.
    let postmark_auth = api == HttpApi::Postmark
        && serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v.get("ErrorCode").and_then(Value::as_u64))
            == Some(10);

    let signal = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Some(ErrorCategory::Auth),
        _ if postmark_auth => Some(ErrorCategory::Auth),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Some(ErrorCategory::Timeout),
        _ => Some(ErrorCategory::Unknown),
    };

    let message = format!("{:?} API error ({}): {}", api, status, truncate(body));

    // Validation replies are about this message, not about the provider.
    let validation = matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY);
    let failure = if validation && signal != Some(ErrorCategory::Auth) {
        TransportFailure::rejected(message)
    } else {
        TransportFailure::new(signal, message)
    };
    failure.with_status(status.as_u16())
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
