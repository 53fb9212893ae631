//! Best-effort telemetry sink.
//!
//! When a telemetry ingest URL is configured, every event published through
//! the broker is forwarded to it. Delivery is strictly fire-and-forget: a
//! slow or absent telemetry service must never stall the voice pipeline, so
//! failures are logged at debug level and dropped.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;

use crate::events::OrchestratorEvent;

/// HTTP client for the telemetry ingestion API.
#[derive(Clone)]
pub struct TelemetryClient {
    client: reqwest::Client,
    events_url: String,
    api_key: Option<String>,
    source: String,
}

impl TelemetryClient {
    pub fn new(base_url: &str, api_key: Option<String>, source: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("failed to build telemetry HTTP client")?;
        Ok(Self {
            client,
            events_url: format!("{}/events", base_url.trim_end_matches('/')),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            source: source.to_string(),
        })
    }

    /// Forward one event. Callers are expected to swallow the error after
    /// logging it; telemetry is never on the critical path.
    pub async fn publish_event(&self, event: &OrchestratorEvent) -> Result<()> {
        let body = json!({
            "source": self.source,
            "event": event,
        });
        let mut request = self.client.post(&self.events_url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }
        let response = request.send().await.context("telemetry request failed")?;
        response
            .error_for_status()
            .context("telemetry endpoint rejected event")?;
        Ok(())
    }
}
