//! In-process broker for a Guacamole-style gateway.
//!
//! Sessions live in a registry keyed by token. The gateway resolves a token
//! into a connection descriptor through [`GuacamoleBroker::connection_info`],
//! which is the only place the password leaves the process.

use super::{RemoteBroker, RemoteSessionHandle, SessionRequest, SessionToken};
use crate::error::BrokerError;
use crate::template::model::{RemoteProtocol, Secret};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

/// Connection descriptor the gateway needs to open the session.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub name: String,
    pub displayname: String,
    pub hostname: String,
    pub port: u16,
    pub protocol: RemoteProtocol,
    pub username: String,
    pub password: Secret,
}

impl ConnectionInfo {
    /// Gateway-facing JSON, credentials included.
    pub fn to_gateway_json(&self) -> serde_json::Value {
        json!({
            "name": self.name,
            "displayname": self.displayname,
            "hostname": self.hostname,
            "port": self.port,
            "protocol": self.protocol.as_str(),
            "username": self.username,
            "password": self.password.expose(),
        })
    }
}

#[derive(Debug)]
pub struct GuacamoleBroker {
    gateway_url: Url,
    sessions: DashMap<SessionToken, ConnectionInfo>,
}

impl GuacamoleBroker {
    pub fn new(gateway_url: Url) -> Self {
        Self {
            gateway_url,
            sessions: DashMap::new(),
        }
    }

    /// Descriptor for `token` as served to the gateway.
    pub fn connection_info(&self, token: &SessionToken) -> Option<serde_json::Value> {
        self.sessions.get(token).map(|info| info.to_gateway_json())
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn client_url(&self, token: &SessionToken) -> String {
        format!(
            "{}/#/client/{}",
            self.gateway_url.as_str().trim_end_matches('/'),
            token
        )
    }
}

#[async_trait]
impl RemoteBroker for GuacamoleBroker {
    async fn create_session(
        &self,
        request: &SessionRequest,
    ) -> Result<RemoteSessionHandle, BrokerError> {
        let token = SessionToken::new(Uuid::new_v4().simple().to_string());

        let info = ConnectionInfo {
            name: request.name.clone(),
            displayname: request.name.clone(),
            hostname: request.host.clone(),
            port: request.port,
            protocol: request.protocol,
            username: request.credentials.username.clone(),
            password: request.credentials.password.clone(),
        };
        self.sessions.insert(token.clone(), info);

        info!(
            "Opened {} session '{}' to {}:{}",
            request.protocol, request.name, request.host, request.port
        );

        Ok(RemoteSessionHandle {
            url: Some(self.client_url(&token)),
            token,
            protocol: request.protocol,
            provider: request.provider.clone(),
        })
    }

    async fn close_session(&self, token: &SessionToken) -> Result<(), BrokerError> {
        if self.sessions.remove(token).is_some() {
            info!("Closed remote session {}", token);
        } else {
            debug!("Remote session {} already closed", token);
        }
        Ok(())
    }

    fn broker_type(&self) -> &'static str {
        "guacamole"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::model::Credentials;

    fn request() -> SessionRequest {
        SessionRequest {
            name: "sample-template-for-docker/web".to_string(),
            provider: "guacamole".to_string(),
            protocol: RemoteProtocol::Ssh,
            host: "127.0.0.1".to_string(),
            port: 10022,
            credentials: Credentials {
                username: "root".to_string(),
                password: Secret::new("acowoman"),
            },
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let broker = GuacamoleBroker::new(Url::parse("http://gateway.local/guacamole/").unwrap());

        let handle = broker.create_session(&request()).await.unwrap();
        assert!(!handle.token.as_str().is_empty());
        assert_eq!(
            handle.url.as_deref(),
            Some(format!("http://gateway.local/guacamole/#/client/{}", handle.token).as_str())
        );

        let info = broker.connection_info(&handle.token).unwrap();
        assert_eq!(info["hostname"], "127.0.0.1");
        assert_eq!(info["port"], 10022);
        assert_eq!(info["protocol"], "ssh");
        assert_eq!(info["password"], "acowoman");

        broker.close_session(&handle.token).await.unwrap();
        broker.close_session(&handle.token).await.unwrap();
        assert!(broker.connection_info(&handle.token).is_none());
        assert_eq!(broker.active_sessions(), 0);
    }

    #[test]
    fn test_connection_info_debug_hides_password() {
        let info = ConnectionInfo {
            name: "web".to_string(),
            displayname: "web".to_string(),
            hostname: "127.0.0.1".to_string(),
            port: 22,
            protocol: RemoteProtocol::Ssh,
            username: "root".to_string(),
            password: Secret::new("acowoman"),
        };
        assert!(!format!("{:?}", info).contains("acowoman"));
    }
}
