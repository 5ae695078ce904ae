use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use shared_config::AppConfig;
use shared_gateway::{GatewayClient, GatewayError, Method};

use crate::error::CapabilityError;

/// Status some providers use for "outside the customer service window".
const WINDOW_CLOSED_STATUS: u16 = 470;
const WINDOW_CLOSED_CODE: &str = "channel_window_closed";

#[async_trait]
pub trait MessagingCapability: Send + Sync {
    /// Send `text` to the normalized identity `to`, returning the provider
    /// message id.
    async fn send_message(&self, to: &str, text: &str) -> Result<String, CapabilityError>;
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

#[derive(Clone)]
pub struct HttpMessagingClient {
    gateway: GatewayClient,
}

impl HttpMessagingClient {
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
impl MessagingCapability for HttpMessagingClient {
    async fn send_message(&self, to: &str, text: &str) -> Result<String, CapabilityError> {
        let body = json!({
            "to": to,
            "text": text,
        });

        let sent: SentMessage = self
            .gateway
            .request(Method::POST, "/messages", Some(body))
            .await
            .map_err(map_messaging_error)?;

        debug!("Message {} sent to {}", sent.id, to);
        Ok(sent.id)
    }
}

fn map_messaging_error(e: GatewayError) -> CapabilityError {
    let window_closed = e.code() == Some(WINDOW_CLOSED_CODE)
        || e.status().map(|status| status.as_u16()) == Some(WINDOW_CLOSED_STATUS);

    if window_closed {
        CapabilityError::ChannelWindowClosed(e.to_string())
    } else {
        CapabilityError::Unreachable(e.to_string())
    }
}
