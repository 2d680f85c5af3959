pub mod tracing;

use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

/// Managed hosting platform the process was detected on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloudHost {
    /// `CLOUD_ENVIRONMENT=true` without a recognisable platform marker
    Declared,
    Render,
    CloudRun,
    Vercel,
    Railway,
    Heroku,
    Fly,
    Lambda,
}

/// Where the process runs. Cloud platforms commonly block outbound SMTP ports,
/// so anything that talks to the network beyond HTTP should consult this first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    Cloud(CloudHost),
    Local,
}

/// Marker variables set by managed platforms, checked in order.
const PLATFORM_MARKERS: &[(&str, CloudHost)] = &[
    ("RENDER", CloudHost::Render),
    ("K_SERVICE", CloudHost::CloudRun),
    ("VERCEL", CloudHost::Vercel),
    ("RAILWAY_ENVIRONMENT", CloudHost::Railway),
    ("DYNO", CloudHost::Heroku),
    ("FLY_APP_NAME", CloudHost::Fly),
    ("AWS_LAMBDA_FUNCTION_NAME", CloudHost::Lambda),
];

impl Platform {
    /// Detect the platform from the process environment.
    ///
    /// An explicit `CLOUD_ENVIRONMENT` flag always wins over platform markers.
    pub fn from_env() -> Self {
        if let Some(declared) = env_optional("CLOUD_ENVIRONMENT") {
            return if is_truthy(&declared) {
                Self::detect_host().unwrap_or(Platform::Cloud(CloudHost::Declared))
            } else {
                Platform::Local
            };
        }

        Self::detect_host().unwrap_or(Platform::Local)
    }

    fn detect_host() -> Option<Self> {
        PLATFORM_MARKERS
            .iter()
            .find(|(key, _)| env_optional(key).is_some())
            .map(|(_, host)| Platform::Cloud(*host))
    }

    pub fn is_cloud(&self) -> bool {
        matches!(self, Platform::Cloud(_))
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Platform::Local)
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Helper to load and parse environment variable with a default value
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Helper to load and parse environment variable or return error
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env_optional(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

/// Read a variable, treating unset and blank values alike.
pub fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Boolean flag: `1`, `true`, `yes` and `on` (any case) are true, everything else false.
pub fn env_flag(key: &str) -> bool {
    env_optional(key).is_some_and(|v| is_truthy(&v))
}

/// Parse a variable into `T`, falling back to `default` when unset.
pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_optional(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
