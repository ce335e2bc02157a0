//! Text delivery through an HTTP SMS API.
//!
//! Messages are POSTed as JSON `{"to": ..., "body": ...}` with a bearer
//! token. A non-2xx response is a failed delivery; there is no retry.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use super::{DeliveryError, Gateway, OutboundMessage};

/// HTTP request timeout for a single delivery.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the SMS API gateway.
#[derive(Clone)]
pub struct SmsConfig {
    pub api_url: String,
    pub api_token: Option<String>,
}

impl std::fmt::Debug for SmsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmsConfig")
            .field("api_url", &self.api_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "***"))
            .finish()
    }
}

impl SmsConfig {
    /// Load configuration from `SMS_API_URL` and `SMS_API_TOKEN`.
    ///
    /// Returns `None` if `SMS_API_URL` is not set.
    pub fn from_env() -> Option<Self> {
        Some(Self {
            api_url: std::env::var("SMS_API_URL").ok()?,
            api_token: std::env::var("SMS_API_TOKEN").ok(),
        })
    }
}

#[derive(Debug, Serialize)]
struct SmsPayload<'a> {
    to: &'a str,
    body: &'a str,
}

/// Sends text messages to an HTTP SMS provider.
pub struct SmsApiGateway {
    client: reqwest::Client,
    config: SmsConfig,
}

impl SmsApiGateway {
    pub fn new(config: SmsConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Gateway for SmsApiGateway {
    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        let payload = SmsPayload {
            to: &message.to,
            body: &message.body,
        };

        let mut request = self.client.post(&self.config.api_url).json(&payload);
        if let Some(token) = &self.config.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(DeliveryError::HttpStatus(response.status().as_u16()));
        }

        info!(contact_id = message.contact_id, "Text message sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let payload = SmsPayload {
            to: "5550100",
            body: "Freezer too warm",
        };
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            serde_json::json!({"to": "5550100", "body": "Freezer too warm"})
        );
    }

    #[test]
    fn test_debug_hides_token() {
        let config = SmsConfig {
            api_url: "https://sms.example.com/send".to_string(),
            api_token: Some("secret-token".to_string()),
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret-token"));
        assert!(SmsApiGateway::new(config).is_ok());
    }

    #[test]
    fn test_http_status_display() {
        let err = DeliveryError::HttpStatus(502);
        assert_eq!(err.to_string(), "SMS API returned HTTP 502");
    }
}
