//! Broker backed by a remote gateway service over HTTP.
//!
//! `POST <base>/sessions` opens a session and answers `{"token", "url"}`;
//! `DELETE <base>/sessions/<token>` closes it.

use super::{RemoteBroker, RemoteSessionHandle, SessionRequest, SessionToken};
use crate::error::BrokerError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    token: String,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpGatewayBroker {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpGatewayBroker {
    pub fn new(base_url: Url, request_timeout: Duration) -> Result<Self, BrokerError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| BrokerError::Unavailable(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { base_url, client })
    }

    fn endpoint(&self, path: &str) -> Result<Url, BrokerError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{}/{}", base, path))
            .map_err(|e| BrokerError::Rejected(format!("invalid gateway endpoint '{}': {}", path, e)))
    }
}

/// Classify a non-success gateway status.
fn status_error(status: StatusCode, action: &str) -> BrokerError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        BrokerError::Unavailable(format!("gateway returned {} on {}", status, action))
    } else {
        BrokerError::Rejected(format!("gateway returned {} on {}", status, action))
    }
}

/// Transport failures never carry the request body, so credentials stay out.
fn transport_error(e: reqwest::Error, action: &str) -> BrokerError {
    BrokerError::Unavailable(format!("{} failed: {}", action, e.without_url()))
}

#[async_trait]
impl RemoteBroker for HttpGatewayBroker {
    async fn create_session(
        &self,
        request: &SessionRequest,
    ) -> Result<RemoteSessionHandle, BrokerError> {
        let endpoint = self.endpoint("sessions")?;
        debug!("Requesting {} session for '{}'", request.protocol, request.name);

        let body = json!({
            "name": request.name,
            "protocol": request.protocol.as_str(),
            "hostname": request.host,
            "port": request.port,
            "username": request.credentials.username,
            "password": request.credentials.password.expose(),
        });

        let response = self
            .client
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, "session creation"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, "session creation"));
        }

        let created: CreateSessionResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::Rejected(format!("malformed gateway response: {}", e.without_url())))?;

        if created.token.trim().is_empty() {
            return Err(BrokerError::Rejected("gateway returned an empty token".to_string()));
        }

        info!("Gateway opened {} session '{}'", request.protocol, request.name);

        Ok(RemoteSessionHandle {
            token: SessionToken::new(created.token),
            url: created.url,
            protocol: request.protocol,
            provider: request.provider.clone(),
        })
    }

    async fn close_session(&self, token: &SessionToken) -> Result<(), BrokerError> {
        let endpoint = self.endpoint(&format!("sessions/{}", token))?;

        let response = self
            .client
            .delete(endpoint)
            .send()
            .await
            .map_err(|e| transport_error(e, "session close"))?;

        match response.status() {
            status if status.is_success() => {
                info!("Gateway closed session {}", token);
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                debug!("Gateway session {} already gone", token);
                Ok(())
            }
            status => {
                warn!("Gateway refused to close session {}: {}", token, status);
                Err(status_error(status, "session close"))
            }
        }
    }

    fn broker_type(&self) -> &'static str {
        "http-gateway"
    }
}
