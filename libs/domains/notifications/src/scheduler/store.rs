//! Persistence for schedule settings.

use crate::error::DeliveryResult;
use crate::models::ScheduleSettings;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Load and save the report schedule.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// `None` when nothing has been saved yet.
    async fn load(&self) -> DeliveryResult<Option<ScheduleSettings>>;

    async fn save(&self, settings: &ScheduleSettings) -> DeliveryResult<()>;
}

/// In-memory store for tests and single-process runs.
#[derive(Clone, Default)]
pub struct InMemorySettingsStore {
    settings: Arc<RwLock<Option<ScheduleSettings>>>,
}

impl InMemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn load(&self) -> DeliveryResult<Option<ScheduleSettings>> {
        Ok(self.settings.read().await.clone())
    }

    async fn save(&self, settings: &ScheduleSettings) -> DeliveryResult<()> {
        *self.settings.write().await = Some(settings.clone());
        Ok(())
    }
}

/// JSON document on disk, written via a temporary file and rename.
#[derive(Debug, Clone)]
pub struct JsonFileSettingsStore {
    path: PathBuf,
}

impl JsonFileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SettingsStore for JsonFileSettingsStore {
    async fn load(&self) -> DeliveryResult<Option<ScheduleSettings>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No saved schedule settings");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, settings: &ScheduleSettings) -> DeliveryResult<()> {
        let json = serde_json::to_vec_pretty(settings)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), "Saved schedule settings");
        Ok(())
    }
}
