//! Provider discovery and prioritisation.
//!
//! [`ProviderRegistry::detect`] turns the credentials visible in [`MailConfig`]
//! into an ordered candidate list. Ordering depends on the platform: cloud
//! hosts usually block outbound SMTP, so HTTP API providers lead there, while
//! local and on-premise runs prefer the company relay and SMTP.

use crate::config::{MailConfig, Secret};
use crate::providers::http_api::HttpApi;
use core_config::Platform;
use serde::Serialize;
use std::net::Ipv4Addr;
use strum::{Display, EnumString};
use tracing::{debug, info};

const GMAIL_HOST: &str = "smtp.gmail.com";
const GMAIL_PORT: u16 = 587;
const MAILGUN_PORT: u16 = 587;

const INTERNAL_SUFFIXES: &[&str] = &[".local", ".internal", ".lan", ".corp", ".intranet"];

/// Provider family. Names double as log and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ProviderKind {
    SmtpGmail,
    SmtpCustom,
    SmtpInternal,
    SmtpMailgun,
    HttpResend,
    HttpPostmark,
    HttpBrevo,
}

impl ProviderKind {
    pub fn is_http_api(&self) -> bool {
        matches!(
            self,
            ProviderKind::HttpResend | ProviderKind::HttpPostmark | ProviderKind::HttpBrevo
        )
    }

    /// Providers known to drop idle SMTP sessions get a fresh verification
    /// right before each send.
    pub fn needs_preflight(&self) -> bool {
        matches!(self, ProviderKind::SmtpGmail)
    }

    /// Environment variable holding this provider's secret; the company
    /// relay has none.
    pub fn credential_env(&self) -> Option<&'static str> {
        match self {
            ProviderKind::SmtpGmail => Some("GMAIL_APP_PASSWORD"),
            ProviderKind::SmtpCustom => Some("SMTP_PASS"),
            ProviderKind::SmtpInternal => None,
            ProviderKind::SmtpMailgun => Some("MAILGUN_SMTP_PASSWORD"),
            ProviderKind::HttpResend => Some("RESEND_API_KEY"),
            ProviderKind::HttpPostmark => Some("POSTMARK_SERVER_TOKEN"),
            ProviderKind::HttpBrevo => Some("BREVO_API_KEY"),
        }
    }

    /// Sort weight; lower runs first. `None` excludes the kind on that platform.
    fn weight(&self, platform: &Platform) -> Option<u32> {
        if platform.is_cloud() {
            match self {
                ProviderKind::HttpBrevo => Some(10),
                ProviderKind::HttpResend => Some(20),
                ProviderKind::HttpPostmark => Some(30),
                ProviderKind::SmtpMailgun => Some(70),
                ProviderKind::SmtpCustom => Some(80),
                ProviderKind::SmtpGmail => Some(90),
                ProviderKind::SmtpInternal => None,
            }
        } else {
            Some(match self {
                ProviderKind::SmtpInternal => 10,
                ProviderKind::SmtpGmail => 20,
                ProviderKind::SmtpCustom => 30,
                ProviderKind::SmtpMailgun => 40,
                ProviderKind::HttpBrevo => 50,
                ProviderKind::HttpResend => 60,
                ProviderKind::HttpPostmark => 70,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpCredentials {
    pub user: String,
    pub password: Secret,
}

/// Connection settings, shaped by transport family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderSettings {
    Smtp {
        host: String,
        port: u16,
        /// TLS from the first byte (465) rather than STARTTLS.
        implicit_tls: bool,
        credentials: Option<SmtpCredentials>,
    },
    HttpApi {
        api_key: Secret,
    },
}

/// One configured way of sending mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderDescriptor {
    /// Unique within one detection result.
    pub name: String,
    pub kind: ProviderKind,
    /// Dense rank starting at 1; lower is tried first.
    pub priority: u32,
    pub settings: ProviderSettings,
    pub from_address: String,
    pub from_name: String,
}

impl ProviderDescriptor {
    pub fn is_http_api(&self) -> bool {
        self.kind.is_http_api()
    }

    pub fn requires_auth(&self) -> bool {
        match &self.settings {
            ProviderSettings::Smtp { credentials, .. } => credentials.is_some(),
            ProviderSettings::HttpApi { .. } => true,
        }
    }

    /// `host:port` for SMTP, API base URL for HTTP providers.
    pub fn endpoint(&self) -> String {
        match &self.settings {
            ProviderSettings::Smtp { host, port, .. } => format!("{host}:{port}"),
            ProviderSettings::HttpApi { .. } => HttpApi::for_kind(self.kind)
                .map(|api| api.base_url().to_string())
                .unwrap_or_else(|| self.kind.to_string()),
        }
    }

    /// Credential-free view for status output.
    pub fn summary(&self) -> ProviderSummary {
        ProviderSummary {
            name: self.name.clone(),
            kind: self.kind,
            priority: self.priority,
            is_http_api: self.is_http_api(),
            requires_auth: self.requires_auth(),
            endpoint: self.endpoint(),
            from_address: self.from_address.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSummary {
    pub name: String,
    pub kind: ProviderKind,
    pub priority: u32,
    pub is_http_api: bool,
    pub requires_auth: bool,
    pub endpoint: String,
    pub from_address: String,
}

/// Turns configuration into prioritised provider candidates.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    config: MailConfig,
    platform: Platform,
}

impl ProviderRegistry {
    pub fn new(config: MailConfig, platform: Platform) -> Self {
        Self { config, platform }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Every usable provider, ordered by priority.
    ///
    /// Deterministic for a given configuration and platform. Providers
    /// without a resolvable sender address are left out.
    pub fn detect(&self) -> Vec<ProviderDescriptor> {
        let config = &self.config;
        let mut found: Vec<ProviderDescriptor> = Vec::new();

        if let Some(gmail) = &config.gmail {
            found.push(self.descriptor(
                "gmail",
                ProviderKind::SmtpGmail,
                ProviderSettings::Smtp {
                    host: GMAIL_HOST.to_string(),
                    port: GMAIL_PORT,
                    implicit_tls: false,
                    credentials: Some(SmtpCredentials {
                        user: gmail.user.clone(),
                        password: gmail.app_password.clone(),
                    }),
                },
                Some(&gmail.user),
            ));
        }

        if let Some(smtp) = &config.custom_smtp {
            let credentials = match (&smtp.user, &smtp.pass) {
                (Some(user), Some(password)) => Some(SmtpCredentials {
                    user: user.clone(),
                    password: password.clone(),
                }),
                _ => None,
            };
            found.push(self.descriptor(
                "custom-smtp",
                ProviderKind::SmtpCustom,
                ProviderSettings::Smtp {
                    host: smtp.host.clone(),
                    port: smtp.port,
                    implicit_tls: smtp.secure,
                    credentials,
                },
                smtp.user.as_ref(),
            ));
        }

        if let Some(relay) = &config.internal_relay {
            if self.platform.is_cloud() {
                debug!(host = %relay.host, "Skipping company relay on cloud platform");
            } else if !is_internal_host(&relay.host) {
                debug!(host = %relay.host, "COMPANY_SMTP_HOST does not look internal, skipping");
            } else {
                found.push(self.descriptor(
                    "company-smtp",
                    ProviderKind::SmtpInternal,
                    ProviderSettings::Smtp {
                        host: relay.host.clone(),
                        port: relay.port,
                        implicit_tls: false,
                        credentials: None,
                    },
                    None,
                ));
            }
        }

        if let Some(mailgun) = &config.mailgun {
            found.push(self.descriptor(
                "mailgun",
                ProviderKind::SmtpMailgun,
                ProviderSettings::Smtp {
                    host: mailgun.host.clone(),
                    port: MAILGUN_PORT,
                    implicit_tls: false,
                    credentials: Some(SmtpCredentials {
                        user: mailgun.login.clone(),
                        password: mailgun.password.clone(),
                    }),
                },
                Some(&mailgun.login),
            ));
        }

        let apis = [
            ("resend", ProviderKind::HttpResend, &config.resend_api_key),
            ("postmark", ProviderKind::HttpPostmark, &config.postmark_server_token),
            ("brevo", ProviderKind::HttpBrevo, &config.brevo_api_key),
        ];
        for (name, kind, key) in apis {
            if let Some(api_key) = key {
                found.push(self.descriptor(
                    name,
                    kind,
                    ProviderSettings::HttpApi {
                        api_key: api_key.clone(),
                    },
                    None,
                ));
            }
        }

        let mut candidates: Vec<(u32, ProviderDescriptor)> = found
            .into_iter()
            .filter(|d| {
                if d.from_address.is_empty() {
                    debug!(provider = %d.name, "No sender address (EMAIL_FROM_ADDRESS), skipping");
                    return false;
                }
                true
            })
            .filter_map(|d| d.kind.weight(&self.platform).map(|w| (w, d)))
            .collect();

        candidates.sort_by_key(|(weight, _)| *weight);

        let providers: Vec<ProviderDescriptor> = candidates
            .into_iter()
            .enumerate()
            .map(|(idx, (_, mut d))| {
                d.priority = idx as u32 + 1;
                d
            })
            .collect();

        info!(
            platform = ?self.platform,
            count = providers.len(),
            providers = ?providers.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            "Detected email providers"
        );

        providers
    }

    fn descriptor(
        &self,
        name: &str,
        kind: ProviderKind,
        settings: ProviderSettings,
        login: Option<&String>,
    ) -> ProviderDescriptor {
        let from_address = self
            .config
            .from_address
            .clone()
            .or_else(|| login.filter(|l| l.contains('@')).cloned())
            .unwrap_or_default();

        ProviderDescriptor {
            name: name.to_string(),
            kind,
            priority: 0,
            settings,
            from_address,
            from_name: self.config.from_name.clone(),
        }
    }
}

/// Hostnames that only make sense inside a company network.
pub fn is_internal_host(host: &str) -> bool {
    let host = host.trim().to_ascii_lowercase();
    if host.is_empty() {
        return false;
    }
    if host == "localhost" {
        return true;
    }
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return ip.is_private() || ip.is_loopback() || ip.is_link_local();
    }
    !host.contains('.') || INTERNAL_SUFFIXES.iter().any(|suffix| host.ends_with(suffix))
}
