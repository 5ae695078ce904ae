use reqwest::{
    Client,
    header::{HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION},
    Method, StatusCode,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use shared_config::AppConfig;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Gateway returned {status}: {message}")]
    Status {
        status: StatusCode,
        code: Option<String>,
        message: String,
    },

    #[error("Gateway transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid gateway configuration: {0}")]
    Configuration(String),
}

impl GatewayError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            GatewayError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Machine-readable `code` field from the gateway's error body, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            GatewayError::Status { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// JSON client for the integration gateway fronting the calendar and
/// messaging providers.
#[derive(Clone)]
pub struct GatewayClient {
    client: Client,
    base_url: String,
    api_token: String,
}

impl GatewayClient {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_base_url(&config.integration_gateway_url, &config.integration_gateway_token)
    }

    pub fn with_base_url(base_url: &str, api_token: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
        }
    }

    fn get_headers(&self) -> Result<HeaderMap, GatewayError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if !self.api_token.is_empty() {
            let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_token))
                .map_err(|e| GatewayError::Configuration(format!("invalid API token: {}", e)))?;
            headers.insert(AUTHORIZATION, bearer);
        }

        Ok(headers)
    }

    pub async fn request<T>(&self, method: Method, path: &str, body: Option<Value>) -> Result<T, GatewayError>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making {} request to {}", method, url);

        let mut req = self.client.request(method, &url).headers(self.get_headers()?);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gateway error ({}): {}", status, error_text);

            let code = serde_json::from_str::<Value>(&error_text)
                .ok()
                .and_then(|body| body.get("code").and_then(Value::as_str).map(str::to_string));

            return Err(GatewayError::Status {
                status,
                code,
                message: error_text,
            });
        }

        let data = response.json::<T>().await?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn sends_bearer_token_and_decodes_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/echo"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "abc" })))
            .mount(&server)
            .await;

        let client = GatewayClient::with_base_url(&server.uri(), "secret");
        let body: Value = client
            .request(Method::POST, "/echo", Some(json!({ "ping": true })))
            .await
            .expect("request should succeed");

        assert_eq!(body["id"], "abc");
    }

    #[tokio::test]
    async fn surfaces_status_and_error_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(
                ResponseTemplate::new(422).set_body_json(json!({ "code": "channel_window_closed" })),
            )
            .mount(&server)
            .await;

        let client = GatewayClient::with_base_url(&server.uri(), "secret");
        let err = client
            .request::<Value>(Method::POST, "/messages", None)
            .await
            .expect_err("request should fail");

        assert_eq!(err.status(), Some(StatusCode::UNPROCESSABLE_ENTITY));
        assert_eq!(err.code(), Some("channel_window_closed"));
    }
}
