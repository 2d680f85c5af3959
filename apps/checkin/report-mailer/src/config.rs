//! Configuration for the report mailer

use core_config::{env_or_default, FromEnv, Platform};
use domain_notifications::{MailConfig, SchedulerConfig};
use eyre::Result;
use std::path::PathBuf;

const DEFAULT_SETTINGS_PATH: &str = "report-settings.json";

#[derive(Debug, Clone)]
pub struct Config {
    pub platform: Platform,
    pub mail: MailConfig,
    pub scheduler: SchedulerConfig,
    /// JSON document holding the persisted report schedule
    pub settings_path: PathBuf,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            platform: Platform::from_env(),
            mail: <MailConfig as FromEnv>::from_env()?,
            scheduler: <SchedulerConfig as FromEnv>::from_env()?,
            settings_path: PathBuf::from(env_or_default(
                "REPORT_SETTINGS_PATH",
                DEFAULT_SETTINGS_PATH,
            )),
        })
    }
}
