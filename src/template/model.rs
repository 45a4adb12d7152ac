//! Validated, strongly-typed view of a template.
//!
//! Produced only by the validator. Placeholder values from the document
//! (empty strings, zeros, `[""]`) are normalized to `None`/empty, meaning
//! "let the runtime collaborator apply its default".

use crate::template::document::TemplateDocument;
use crate::template::url::UrlTemplate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Environment provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Provider {
    Docker,
    Other(String),
}

impl Provider {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "docker" => Provider::Docker,
            _ => Provider::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Provider::Docker => "docker",
            Provider::Other(name) => name,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport protocol of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol spoken over a brokered remote session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteProtocol {
    Ssh,
    Rdp,
    Vnc,
}

impl RemoteProtocol {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ssh" => Some(RemoteProtocol::Ssh),
            "rdp" => Some(RemoteProtocol::Rdp),
            "vnc" => Some(RemoteProtocol::Vnc),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteProtocol::Ssh => "ssh",
            RemoteProtocol::Rdp => "rdp",
            RemoteProtocol::Vnc => "vnc",
        }
    }
}

impl fmt::Display for RemoteProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque secret value. Formatting never reveals the content.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the secret. Only collaborators that need the value call this.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Credentials baked into the image for the remote session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Secret,
}

/// Validated port declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub name: String,
    pub port: u16,
    pub public: bool,
    pub protocol: Protocol,
    pub url: Option<UrlTemplate>,
    /// Fixed host port requested through `HostConfig.PortBindings`
    pub preferred_host_port: Option<u16>,
}

impl PortSpec {
    /// Docker-style key, e.g. `80/tcp`.
    pub fn container_key(&self) -> String {
        format!("{}/{}", self.port, self.protocol)
    }
}

/// Validated remote-access descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSpec {
    pub provider: String,
    pub protocol: RemoteProtocol,
    pub credentials: Credentials,
    pub port: u16,
    /// Name of the sibling `PortSpec` the remote session connects to
    pub port_name: String,
}

/// Process launch parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub working_dir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub user: Option<String>,
    pub hostname: Option<String>,
    pub domainname: Option<String>,
    pub tty: bool,
    pub open_stdin: bool,
}

impl LaunchSpec {
    /// Environment in `KEY=VALUE` form.
    pub fn env_pairs(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }
}

/// Resource limits; `None` means unbounded / runtime default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: Option<i64>,
    pub memory_swap_bytes: Option<i64>,
    pub cpu_shares: Option<i64>,
    pub cpuset_cpus: Option<String>,
}

/// Security-relevant container flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityProfile {
    pub privileged: bool,
    pub readonly_rootfs: bool,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub security_opts: Vec<String>,
    pub binds: Vec<String>,
    pub devices: Vec<serde_json::Value>,
}

/// Container network mode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NetworkMode {
    /// Runtime default (usually bridge)
    #[default]
    Default,
    Bridge,
    Host,
    None,
    /// `container:<id>` or a user-defined network name
    Named(String),
}

impl NetworkMode {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "" | "default" => NetworkMode::Default,
            "bridge" => NetworkMode::Bridge,
            "host" => NetworkMode::Host,
            "none" => NetworkMode::None,
            other => NetworkMode::Named(other.to_string()),
        }
    }

    /// Value for the runtime, `None` for the default.
    pub fn as_runtime_value(&self) -> Option<String> {
        match self {
            NetworkMode::Default => None,
            NetworkMode::Bridge => Some("bridge".to_string()),
            NetworkMode::Host => Some("host".to_string()),
            NetworkMode::None => Some("none".to_string()),
            NetworkMode::Named(name) => Some(name.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSettings {
    pub mode: NetworkMode,
    pub disabled: bool,
    pub dns: Vec<String>,
    pub dns_search: Vec<String>,
    pub extra_hosts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub name: String,
    pub maximum_retry_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub driver: String,
    pub options: BTreeMap<String, String>,
}

/// One validated virtual environment definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSpec {
    pub name: String,
    pub provider: Provider,
    pub kind: String,
    pub description: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub launch: LaunchSpec,
    pub resources: ResourceLimits,
    pub security: SecurityProfile,
    pub network: NetworkSettings,
    pub restart_policy: Option<RestartPolicy>,
    pub log_config: Option<LogConfig>,
    pub ports: Vec<PortSpec>,
    pub remote: Option<RemoteSpec>,
}

impl EnvironmentSpec {
    pub fn port(&self, name: &str) -> Option<&PortSpec> {
        self.ports.iter().find(|p| p.name == name)
    }

    /// Whether any declared port can be checked with a TCP connect.
    pub fn has_tcp_ports(&self) -> bool {
        self.ports.iter().any(|p| p.protocol == Protocol::Tcp)
    }
}

/// A template that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidTemplate {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) environments: Vec<EnvironmentSpec>,
    pub(crate) document: TemplateDocument,
}

impl ValidTemplate {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn environments(&self) -> &[EnvironmentSpec] {
        &self.environments
    }

    pub fn environment(&self, name: &str) -> Option<&EnvironmentSpec> {
        self.environments.iter().find(|e| e.name == name)
    }

    /// The document this template was validated from, unchanged.
    pub fn document(&self) -> &TemplateDocument {
        &self.document
    }
}
