use std::time::Duration;

use tracing::{debug, info};

use execflow_core::config::AppConfig;
use execflow_core::error::{CryptoError, TransportError};
use execflow_crypto::{decrypt_to_string, Envelope, SharedKey, WireEnvelope};

/// One envelope out, one response back. Holds no state between calls.
#[derive(Debug, Clone)]
pub struct SingleShotClient {
    http: reqwest::Client,
    endpoint: String,
}

/// A successful (2xx) agent response whose body parsed as JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl AgentResponse {
    /// The body as a wire envelope, if it has that shape.
    pub fn envelope(&self) -> Option<WireEnvelope> {
        serde_json::from_value(self.body.clone()).ok()
    }

    /// Decrypt an envelope body. Fails with `MalformedEnvelope` if the body
    /// is not one.
    pub fn decrypt(&self, key: &SharedKey) -> Result<String, CryptoError> {
        let wire = self.envelope().ok_or_else(|| {
            CryptoError::MalformedEnvelope("response body is not an envelope".to_string())
        })?;
        decrypt_to_string(&Envelope::from_wire(&wire)?, key)
    }
}

impl SingleShotClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let endpoint = endpoint.into();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("execflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::ConnectFailed {
                endpoint: endpoint.clone(),
                message: e.to_string(),
            })?;
        Ok(Self { http, endpoint })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, TransportError> {
        Self::new(
            config.agent.exec_url.clone(),
            Duration::from_secs(config.agent.request_timeout_secs),
        )
    }

    /// Same client, different endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn dispatch(&self, envelope: &Envelope) -> Result<AgentResponse, TransportError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .body(envelope.to_json())
            .send()
            .await
            .map_err(|e| TransportError::ConnectFailed {
                endpoint: self.endpoint.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(TransportError::NonSuccessStatus {
                status: status.as_u16(),
                body,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| TransportError::MalformedResponse(e.to_string()))?;
        let body: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            debug!(len = text.len(), "Agent response is not JSON");
            TransportError::MalformedResponse(e.to_string())
        })?;

        info!(endpoint = %self.endpoint, status = status.as_u16(), "Agent responded");
        Ok(AgentResponse {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use execflow_crypto::encrypt;
    use serde_json::json;

    #[test]
    fn test_response_decrypts_envelope_body() {
        let key = SharedKey::from_bytes(&[3u8; 32]).unwrap();
        let env = encrypt(&key, b"done", b"").unwrap();
        let response = AgentResponse {
            status: 200,
            body: serde_json::from_str(&env.to_json()).unwrap(),
        };
        assert!(response.envelope().is_some());
        assert_eq!(response.decrypt(&key).unwrap(), "done");
    }

    #[test]
    fn test_plain_body_is_not_an_envelope() {
        let key = SharedKey::from_bytes(&[3u8; 32]).unwrap();
        let response = AgentResponse {
            status: 200,
            body: json!({"status": "accepted"}),
        };
        assert!(response.envelope().is_none());
        assert!(matches!(
            response.decrypt(&key),
            Err(CryptoError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_from_config_uses_exec_url() {
        let config = AppConfig::default();
        let client = SingleShotClient::from_config(&config).unwrap();
        assert_eq!(client.endpoint(), "http://127.0.0.1:9191/exec_command");
        let client = client.with_endpoint("http://agent:1/x");
        assert_eq!(client.endpoint(), "http://agent:1/x");
    }
}
