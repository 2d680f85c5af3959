//! Report collaborators for standalone runs.
//!
//! The check-in records live in the host application; on its own the mailer
//! sees an empty window, so scheduled runs log "no data" and send nothing.

use async_trait::async_trait;
use domain_notifications::{
    Attachment, DeliveryError, DeliveryResult, ReportDataSource, ReportFormat, ReportRenderer,
    ReportWindow,
};
use serde_json::Value;

/// Data source with no rows.
pub struct EmptyDataSource;

#[async_trait]
impl ReportDataSource for EmptyDataSource {
    async fn fetch_rows(&self, window: &ReportWindow) -> DeliveryResult<Vec<Value>> {
        tracing::debug!(date = %window.date, "No check-in source attached");
        Ok(Vec::new())
    }
}

/// Attaches the raw rows as a single JSON document.
pub struct JsonRowsRenderer;

#[async_trait]
impl ReportRenderer for JsonRowsRenderer {
    async fn render(
        &self,
        rows: &[Value],
        window: &ReportWindow,
        _format: ReportFormat,
        _include_photos: bool,
    ) -> DeliveryResult<Vec<Attachment>> {
        let body = serde_json::to_vec_pretty(rows)
            .map_err(|e| DeliveryError::Render(e.to_string()))?;

        Ok(vec![Attachment::new(
            format!("checkin-{}.json", window.date.format("%Y-%m-%d")),
            "application/json",
            body,
        )])
    }
}
