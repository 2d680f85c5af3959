//! Environment configuration for providers and the report scheduler.

use crate::retry::RetryPolicy;
use core_config::{env_flag, env_optional, env_or_default, env_parse, ConfigError, FromEnv};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_FROM_NAME: &str = "打卡系統";
pub const DEFAULT_ESCALATION_ADDRESS: &str = "it-support@example.com";

/// Credential value that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GmailConfig {
    pub user: String,
    pub app_password: Secret,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomSmtpConfig {
    pub host: String,
    pub port: u16,
    /// Implicit TLS; defaults to `true` only for port 465.
    pub secure: bool,
    pub user: Option<String>,
    pub pass: Option<Secret>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalRelayConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailgunSmtpConfig {
    pub host: String,
    pub login: String,
    pub password: Secret,
}

/// Every provider credential the process can see. Absent sections mean the
/// provider is not configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailConfig {
    /// Sender address; SMTP providers fall back to their login.
    pub from_address: Option<String>,
    pub from_name: String,
    pub gmail: Option<GmailConfig>,
    pub custom_smtp: Option<CustomSmtpConfig>,
    pub internal_relay: Option<InternalRelayConfig>,
    pub mailgun: Option<MailgunSmtpConfig>,
    pub resend_api_key: Option<Secret>,
    pub postmark_server_token: Option<Secret>,
    pub brevo_api_key: Option<Secret>,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            from_address: None,
            from_name: DEFAULT_FROM_NAME.to_string(),
            gmail: None,
            custom_smtp: None,
            internal_relay: None,
            mailgun: None,
            resend_api_key: None,
            postmark_server_token: None,
            brevo_api_key: None,
        }
    }
}

impl FromEnv for MailConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let gmail = match (env_optional("GMAIL_USER"), env_optional("GMAIL_APP_PASSWORD")) {
            (Some(user), Some(password)) => Some(GmailConfig {
                user,
                app_password: Secret::new(password),
            }),
            _ => None,
        };

        let custom_smtp = match env_optional("SMTP_HOST") {
            Some(host) => {
                let port = env_parse("SMTP_PORT", 587u16)?;
                let secure = match env_optional("SMTP_SECURE") {
                    Some(_) => env_flag("SMTP_SECURE"),
                    None => port == 465,
                };
                Some(CustomSmtpConfig {
                    host,
                    port,
                    secure,
                    user: env_optional("SMTP_USER"),
                    pass: env_optional("SMTP_PASS").map(Secret::new),
                })
            }
            None => None,
        };

        let internal_relay = match env_optional("COMPANY_SMTP_HOST") {
            Some(host) => Some(InternalRelayConfig {
                host,
                port: env_parse("COMPANY_SMTP_PORT", 25u16)?,
            }),
            None => None,
        };

        let mailgun = match (
            env_optional("MAILGUN_SMTP_LOGIN"),
            env_optional("MAILGUN_SMTP_PASSWORD"),
        ) {
            (Some(login), Some(password)) => Some(MailgunSmtpConfig {
                host: env_or_default("MAILGUN_SMTP_HOST", "smtp.mailgun.org"),
                login,
                password: Secret::new(password),
            }),
            _ => None,
        };

        Ok(Self {
            from_address: env_optional("EMAIL_FROM_ADDRESS"),
            from_name: env_optional("EMAIL_FROM_NAME")
                .unwrap_or_else(|| DEFAULT_FROM_NAME.to_string()),
            gmail,
            custom_smtp,
            internal_relay,
            mailgun,
            resend_api_key: env_optional("RESEND_API_KEY").map(Secret::new),
            postmark_server_token: env_optional("POSTMARK_SERVER_TOKEN").map(Secret::new),
            brevo_api_key: env_optional("BREVO_API_KEY").map(Secret::new),
        })
    }
}

/// Report scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Fixed operations mailbox that receives failure notices.
    pub escalation_address: String,
    /// Pause between consecutive recipients of one report run.
    pub inter_send_delay: Duration,
    pub escalation_retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            escalation_address: DEFAULT_ESCALATION_ADDRESS.to_string(),
            inter_send_delay: Duration::from_millis(1000),
            escalation_retry: RetryPolicy::escalation(),
        }
    }
}

impl FromEnv for SchedulerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            escalation_address: env_or_default(
                "REPORT_ESCALATION_EMAIL",
                DEFAULT_ESCALATION_ADDRESS,
            ),
            inter_send_delay: Duration::from_millis(env_parse("REPORT_INTER_SEND_DELAY_MS", 1000u64)?),
            escalation_retry: RetryPolicy::escalation(),
        })
    }
}
