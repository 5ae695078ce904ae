use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use availability_cell::TimeInterval;
use shared_config::AppConfig;
use shared_gateway::{GatewayClient, GatewayError, Method, StatusCode};

use crate::error::CapabilityError;

#[async_trait]
pub trait CalendarCapability: Send + Sync {
    /// Busy intervals overlapping `window`. Auth and quota failures surface
    /// as `Unavailable`.
    async fn list_busy_intervals(
        &self,
        calendar_id: &str,
        window: &TimeInterval,
    ) -> Result<Vec<TimeInterval>, CapabilityError>;

    /// Create an event and return its provider id. Fails with `Conflict`
    /// when the provider detects an overlap.
    async fn create_event(
        &self,
        calendar_id: &str,
        interval: &TimeInterval,
        summary: &str,
    ) -> Result<String, CapabilityError>;
}

#[derive(Debug, Deserialize)]
struct BusyResponse {
    #[serde(default)]
    busy: Vec<BusyBlock>,
}

#[derive(Debug, Deserialize)]
struct BusyBlock {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct CreatedEvent {
    id: String,
}

/// Calendar provider reached through the integration gateway.
#[derive(Clone)]
pub struct HttpCalendarClient {
    gateway: GatewayClient,
}

impl HttpCalendarClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            gateway: GatewayClient::new(config),
        }
    }

    pub fn with_gateway(gateway: GatewayClient) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl CalendarCapability for HttpCalendarClient {
    async fn list_busy_intervals(
        &self,
        calendar_id: &str,
        window: &TimeInterval,
    ) -> Result<Vec<TimeInterval>, CapabilityError> {
        let path = format!("/calendars/{}/busy", urlencoding::encode(calendar_id));
        let body = json!({
            "time_min": window.start(),
            "time_max": window.end(),
        });

        let response: BusyResponse = self
            .gateway
            .request(Method::POST, &path, Some(body))
            .await
            .map_err(map_calendar_error)?;

        let mut busy = Vec::with_capacity(response.busy.len());
        for block in response.busy {
            match TimeInterval::new(block.start, block.end) {
                Ok(interval) => busy.push(interval),
                Err(e) => warn!("Skipping malformed busy block from calendar {}: {}", calendar_id, e),
            }
        }

        debug!("Calendar {} reported {} busy interval(s)", calendar_id, busy.len());
        Ok(busy)
    }

    async fn create_event(
        &self,
        calendar_id: &str,
        interval: &TimeInterval,
        summary: &str,
    ) -> Result<String, CapabilityError> {
        let path = format!("/calendars/{}/events", urlencoding::encode(calendar_id));
        let body = json!({
            "start": interval.start(),
            "end": interval.end(),
            "summary": summary,
        });

        let created: CreatedEvent = self
            .gateway
            .request(Method::POST, &path, Some(body))
            .await
            .map_err(map_calendar_error)?;

        debug!("Calendar {} created event {}", calendar_id, created.id);
        Ok(created.id)
    }
}

fn map_calendar_error(e: GatewayError) -> CapabilityError {
    match e.status() {
        Some(StatusCode::CONFLICT) => CapabilityError::Conflict(e.to_string()),
        _ => CapabilityError::Unavailable(e.to_string()),
    }
}
