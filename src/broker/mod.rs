//! Remote-access broker collaborators.
//!
//! A broker mediates protocol sessions (SSH, RDP, VNC) to an instance so the
//! caller never reaches the instance network directly. The mapper hands it
//! the internal host and port plus the template credentials and gets an
//! opaque token back.
//!
//! - [`GuacamoleBroker`]: in-process session registry for an Apache Guacamole
//!   style gateway that pulls connection descriptors by token
//! - [`HttpGatewayBroker`]: the same contract against a remote gateway over HTTP

mod gateway;
mod guacamole;

pub use gateway::HttpGatewayBroker;
pub use guacamole::{ConnectionInfo, GuacamoleBroker};

use crate::error::BrokerError;
use crate::template::model::{Credentials, RemoteProtocol};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque broker session token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a caller receives to open the remote session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSessionHandle {
    pub token: SessionToken,
    /// Client URL on the gateway, when the broker produces one
    pub url: Option<String>,
    pub protocol: RemoteProtocol,
    /// Gateway provider named by the template, e.g. `guacamole`
    pub provider: String,
}

/// Parameters of a session request.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Connection name shown by the gateway
    pub name: String,
    pub provider: String,
    pub protocol: RemoteProtocol,
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
}

/// Remote-access broker contract.
#[async_trait]
pub trait RemoteBroker: Send + Sync {
    /// Open a session to `host:port`. Credentials are only forwarded to the
    /// gateway.
    async fn create_session(
        &self,
        request: &SessionRequest,
    ) -> Result<RemoteSessionHandle, BrokerError>;

    /// Close a session. Closing an unknown token is not an error.
    async fn close_session(&self, token: &SessionToken) -> Result<(), BrokerError>;

    fn broker_type(&self) -> &'static str;
}
