//! Container configuration builder.
//!
//! Maps a [`ResolvedSpec`] onto the Docker create request one field at a
//! time. Fields the spec leaves at "runtime default" are left unset so the
//! daemon applies its own defaults.

use super::ResolvedSpec;
use crate::error::RuntimeError;
use bollard::service::{
    DeviceMapping, HostConfig, HostConfigLogConfig, PortBinding, RestartPolicy,
    RestartPolicyNameEnum,
};
use std::collections::HashMap;

/// Container configuration builder.
#[derive(Debug, Default)]
pub struct ContainerConfigBuilder {
    image: Option<String>,
    cmd: Option<Vec<String>>,
    entrypoint: Option<Vec<String>>,
    working_dir: Option<String>,
    env: Vec<String>,
    labels: HashMap<String, String>,
    user: Option<String>,
    hostname: Option<String>,
    domainname: Option<String>,
    tty: bool,
    open_stdin: bool,
    network_disabled: bool,
    exposed_ports: HashMap<String, HashMap<(), ()>>,
    port_bindings: HashMap<String, Option<Vec<PortBinding>>>,
    memory_limit: Option<i64>,
    memory_swap: Option<i64>,
    cpu_shares: Option<i64>,
    cpuset_cpus: Option<String>,
    binds: Vec<String>,
    devices: Vec<DeviceMapping>,
    network_mode: Option<String>,
    privileged: bool,
    readonly_rootfs: bool,
    cap_add: Vec<String>,
    cap_drop: Vec<String>,
    security_opts: Vec<String>,
    dns: Vec<String>,
    dns_search: Vec<String>,
    extra_hosts: Vec<String>,
    restart_policy: Option<RestartPolicy>,
    log_config: Option<HostConfigLogConfig>,
}

fn non_empty<T>(values: Vec<T>) -> Option<Vec<T>> {
    if values.is_empty() { None } else { Some(values) }
}

fn restart_policy_name(name: &str) -> Option<RestartPolicyNameEnum> {
    match name {
        "no" => Some(RestartPolicyNameEnum::NO),
        "always" => Some(RestartPolicyNameEnum::ALWAYS),
        "unless-stopped" => Some(RestartPolicyNameEnum::UNLESS_STOPPED),
        "on-failure" => Some(RestartPolicyNameEnum::ON_FAILURE),
        _ => None,
    }
}

impl ContainerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image<S: Into<String>>(mut self, image: S) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = Some(cmd.into_iter().map(|s| s.into()).collect());
        self
    }

    pub fn entrypoint<I, S>(mut self, entrypoint: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint = Some(entrypoint.into_iter().map(|s| s.into()).collect());
        self
    }

    pub fn working_dir<S: Into<String>>(mut self, dir: S) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.push(format!("{}={}", key.into(), value.into()));
        self
    }

    pub fn label<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn user<S: Into<String>>(mut self, user: S) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn hostname<S: Into<String>>(mut self, hostname: S) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn domainname<S: Into<String>>(mut self, domainname: S) -> Self {
        self.domainname = Some(domainname.into());
        self
    }

    pub fn tty(mut self, enable: bool) -> Self {
        self.tty = enable;
        self
    }

    pub fn open_stdin(mut self, enable: bool) -> Self {
        self.open_stdin = enable;
        self
    }

    pub fn network_disabled(mut self, disabled: bool) -> Self {
        self.network_disabled = disabled;
        self
    }

    /// Expose `container_key` (e.g. `22/tcp`) and bind it to `host_ip:host_port`.
    pub fn port_binding<K, I>(mut self, container_key: K, host_ip: I, host_port: u16) -> Self
    where
        K: Into<String>,
        I: Into<String>,
    {
        let key = container_key.into();
        self.exposed_ports.insert(key.clone(), HashMap::new());
        self.port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: Some(host_ip.into()),
                host_port: Some(host_port.to_string()),
            }]),
        );
        self
    }

    /// Set memory limit in bytes.
    pub fn memory_limit(mut self, bytes: i64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Set memory + swap limit in bytes; `-1` means unlimited swap.
    pub fn memory_swap(mut self, bytes: i64) -> Self {
        self.memory_swap = Some(bytes);
        self
    }

    pub fn cpu_shares(mut self, shares: i64) -> Self {
        self.cpu_shares = Some(shares);
        self
    }

    pub fn cpuset_cpus<S: Into<String>>(mut self, cpus: S) -> Self {
        self.cpuset_cpus = Some(cpus.into());
        self
    }

    /// Add a volume bind mount (host_path:container_path[:mode]).
    pub fn bind<S: Into<String>>(mut self, bind: S) -> Self {
        self.binds.push(bind.into());
        self
    }

    pub fn device(mut self, device: DeviceMapping) -> Self {
        self.devices.push(device);
        self
    }

    /// Set network mode (e.g., "bridge", "host", "none").
    pub fn network_mode<S: Into<String>>(mut self, mode: S) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    pub fn privileged(mut self, enable: bool) -> Self {
        self.privileged = enable;
        self
    }

    pub fn readonly_rootfs(mut self, enable: bool) -> Self {
        self.readonly_rootfs = enable;
        self
    }

    pub fn cap_add<S: Into<String>>(mut self, capability: S) -> Self {
        self.cap_add.push(capability.into());
        self
    }

    pub fn cap_drop<S: Into<String>>(mut self, capability: S) -> Self {
        self.cap_drop.push(capability.into());
        self
    }

    pub fn security_opt<S: Into<String>>(mut self, option: S) -> Self {
        self.security_opts.push(option.into());
        self
    }

    pub fn dns<S: Into<String>>(mut self, server: S) -> Self {
        self.dns.push(server.into());
        self
    }

    pub fn dns_search<S: Into<String>>(mut self, domain: S) -> Self {
        self.dns_search.push(domain.into());
        self
    }

    pub fn extra_host<S: Into<String>>(mut self, entry: S) -> Self {
        self.extra_hosts.push(entry.into());
        self
    }

    /// Set the restart policy. Unknown names are rejected at build time.
    pub fn restart_policy(mut self, name: &str, maximum_retry_count: i64) -> Self {
        self.restart_policy = Some(RestartPolicy {
            name: restart_policy_name(name),
            maximum_retry_count: Some(maximum_retry_count),
        });
        self
    }

    pub fn log_config<S: Into<String>>(mut self, driver: S, options: HashMap<String, String>) -> Self {
        self.log_config = Some(HostConfigLogConfig {
            typ: Some(driver.into()),
            config: if options.is_empty() { None } else { Some(options) },
        });
        self
    }

    /// Build the container configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the image is missing.
    pub fn build(self) -> Result<ContainerConfig, RuntimeError> {
        let image = self
            .image
            .ok_or_else(|| RuntimeError::Rejected("Image is required".to_string()))?;

        let host_config = HostConfig {
            binds: non_empty(self.binds),
            devices: non_empty(self.devices),
            memory: self.memory_limit,
            memory_swap: self.memory_swap,
            cpu_shares: self.cpu_shares,
            cpuset_cpus: self.cpuset_cpus,
            network_mode: self.network_mode,
            port_bindings: if self.port_bindings.is_empty() {
                None
            } else {
                Some(self.port_bindings)
            },
            privileged: Some(self.privileged),
            readonly_rootfs: Some(self.readonly_rootfs),
            cap_add: non_empty(self.cap_add),
            cap_drop: non_empty(self.cap_drop),
            security_opt: non_empty(self.security_opts),
            dns: non_empty(self.dns),
            dns_search: non_empty(self.dns_search),
            extra_hosts: non_empty(self.extra_hosts),
            restart_policy: self.restart_policy,
            log_config: self.log_config,
            ..Default::default()
        };

        Ok(ContainerConfig {
            image,
            cmd: self.cmd,
            entrypoint: self.entrypoint,
            working_dir: self.working_dir,
            env: non_empty(self.env),
            labels: if self.labels.is_empty() {
                None
            } else {
                Some(self.labels)
            },
            user: self.user,
            hostname: self.hostname,
            domainname: self.domainname,
            tty: self.tty,
            open_stdin: self.open_stdin,
            network_disabled: self.network_disabled,
            exposed_ports: if self.exposed_ports.is_empty() {
                None
            } else {
                Some(self.exposed_ports)
            },
            host_config,
        })
    }
}

/// Container configuration ready for the Docker API.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub image: String,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub env: Option<Vec<String>>,
    pub labels: Option<HashMap<String, String>>,
    pub user: Option<String>,
    pub hostname: Option<String>,
    pub domainname: Option<String>,
    pub tty: bool,
    pub open_stdin: bool,
    pub network_disabled: bool,
    pub exposed_ports: Option<HashMap<String, HashMap<(), ()>>>,
    pub host_config: HostConfig,
}

impl ContainerConfig {
    pub fn builder() -> ContainerConfigBuilder {
        ContainerConfigBuilder::new()
    }

    /// Translate a resolved spec, field by field.
    pub fn from_resolved(resolved: &ResolvedSpec) -> Result<Self, RuntimeError> {
        let spec = &resolved.spec;
        let launch = &spec.launch;
        let mut builder = Self::builder()
            .image(spec.image.as_str())
            .tty(launch.tty)
            .open_stdin(launch.open_stdin)
            .network_disabled(spec.network.disabled)
            .privileged(spec.security.privileged)
            .readonly_rootfs(spec.security.readonly_rootfs);

        if !launch.cmd.is_empty() {
            builder = builder.cmd(launch.cmd.iter().cloned());
        }
        if !launch.entrypoint.is_empty() {
            builder = builder.entrypoint(launch.entrypoint.iter().cloned());
        }
        if let Some(dir) = &launch.working_dir {
            builder = builder.working_dir(dir.as_str());
        }
        if let Some(user) = &launch.user {
            builder = builder.user(user.as_str());
        }
        if let Some(hostname) = &launch.hostname {
            builder = builder.hostname(hostname.as_str());
        }
        if let Some(domainname) = &launch.domainname {
            builder = builder.domainname(domainname.as_str());
        }
        for (key, value) in &launch.env {
            builder = builder.env(key.as_str(), value.as_str());
        }
        for (key, value) in &resolved.labels {
            builder = builder.label(key.as_str(), value.as_str());
        }

        for port in &resolved.ports {
            builder = builder.port_binding(port.container_key(), port.bind_ip.as_str(), port.host_port);
        }

        let resources = &spec.resources;
        if let Some(memory) = resources.memory_bytes {
            builder = builder.memory_limit(memory);
        }
        if let Some(swap) = resources.memory_swap_bytes {
            builder = builder.memory_swap(swap);
        }
        if let Some(shares) = resources.cpu_shares {
            builder = builder.cpu_shares(shares);
        }
        if let Some(cpus) = &resources.cpuset_cpus {
            builder = builder.cpuset_cpus(cpus.as_str());
        }

        let security = &spec.security;
        for cap in &security.cap_add {
            builder = builder.cap_add(cap.as_str());
        }
        for cap in &security.cap_drop {
            builder = builder.cap_drop(cap.as_str());
        }
        for opt in &security.security_opts {
            builder = builder.security_opt(opt.as_str());
        }
        for bind in &security.binds {
            builder = builder.bind(bind.as_str());
        }
        for device in &security.devices {
            let mapping: DeviceMapping = serde_json::from_value(device.clone())
                .map_err(|e| RuntimeError::Rejected(format!("invalid device mapping: {}", e)))?;
            builder = builder.device(mapping);
        }

        if let Some(mode) = spec.network.mode.as_runtime_value() {
            builder = builder.network_mode(mode);
        }
        for server in &spec.network.dns {
            builder = builder.dns(server.as_str());
        }
        for domain in &spec.network.dns_search {
            builder = builder.dns_search(domain.as_str());
        }
        for entry in &spec.network.extra_hosts {
            builder = builder.extra_host(entry.as_str());
        }

        if let Some(policy) = &spec.restart_policy {
            if restart_policy_name(&policy.name).is_none() {
                return Err(RuntimeError::Rejected(format!(
                    "unknown restart policy '{}'",
                    policy.name
                )));
            }
            builder = builder.restart_policy(&policy.name, policy.maximum_retry_count);
        }
        if let Some(log) = &spec.log_config {
            let options = log
                .options
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            builder = builder.log_config(log.driver.as_str(), options);
        }

        builder.build()
    }

    /// Request body for `create_container`.
    pub fn to_create_body(&self) -> bollard::container::Config<String> {
        bollard::container::Config {
            image: Some(self.image.clone()),
            cmd: self.cmd.clone(),
            entrypoint: self.entrypoint.clone(),
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
            labels: self.labels.clone(),
            user: self.user.clone(),
            hostname: self.hostname.clone(),
            domainname: self.domainname.clone(),
            tty: Some(self.tty),
            open_stdin: Some(self.open_stdin),
            network_disabled: Some(self.network_disabled),
            exposed_ports: self.exposed_ports.clone(),
            host_config: Some(self.host_config.clone()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::ResolvedPort;
    use crate::template::model::Protocol;
    use crate::template::{SAMPLE_TEMPLATE, TemplateValidator};
    use std::sync::Arc;
    use uuid::Uuid;

    fn resolved_sample() -> ResolvedSpec {
        let template = TemplateValidator::default()
            .validate_json(SAMPLE_TEMPLATE)
            .unwrap();
        let spec = template.environment("web").unwrap().clone();
        let ports = vec![
            ResolvedPort {
                name: "website".to_string(),
                host: "hack.example.org".to_string(),
                host_port: 10080,
                container_port: 80,
                protocol: Protocol::Tcp,
                public: true,
                bind_ip: "0.0.0.0".to_string(),
                url: Some("http://hack.example.org:10080".to_string()),
            },
            ResolvedPort {
                name: "ssh".to_string(),
                host: "hack.example.org".to_string(),
                host_port: 10022,
                container_port: 22,
                protocol: Protocol::Tcp,
                public: true,
                bind_ip: "0.0.0.0".to_string(),
                url: None,
            },
        ];
        ResolvedSpec::new(Uuid::new_v4(), template.name(), Arc::new(spec), ports, "hackenv")
    }

    #[test]
    fn test_sample_maps_onto_create_request() {
        let config = ContainerConfig::from_resolved(&resolved_sample()).unwrap();

        assert_eq!(config.image, "rastasheep/ubuntu-sshd");
        assert_eq!(
            config.cmd,
            Some(vec!["/usr/sbin/sshd".to_string(), "-D".to_string()])
        );
        assert_eq!(config.entrypoint, None);
        assert_eq!(config.working_dir, None);
        assert!(config.tty);
        assert!(config.open_stdin);

        let bindings = config.host_config.port_bindings.as_ref().unwrap();
        let ssh = bindings["22/tcp"].as_ref().unwrap();
        assert_eq!(ssh[0].host_port.as_deref(), Some("10022"));
        assert_eq!(ssh[0].host_ip.as_deref(), Some("0.0.0.0"));
        assert!(config.exposed_ports.as_ref().unwrap().contains_key("80/tcp"));

        // Placeholders stay at daemon defaults
        assert_eq!(config.host_config.memory, None);
        assert_eq!(config.host_config.cpu_shares, None);
        assert_eq!(config.host_config.security_opt, None);
        assert_eq!(config.host_config.network_mode, None);
        assert_eq!(config.host_config.privileged, Some(false));

        let log = config.host_config.log_config.as_ref().unwrap();
        assert_eq!(log.typ.as_deref(), Some("json-file"));
    }

    #[test]
    fn test_resource_limits() {
        let mut resolved = resolved_sample();
        let spec = Arc::make_mut(&mut resolved.spec);
        spec.resources.memory_bytes = Some(2_147_483_648);
        spec.resources.cpu_shares = Some(512);

        let config = ContainerConfig::from_resolved(&resolved).unwrap();
        assert_eq!(config.host_config.memory, Some(2_147_483_648));
        assert_eq!(config.host_config.cpu_shares, Some(512));
    }

    #[test]
    fn test_labels_reach_create_body() {
        let resolved = resolved_sample();
        let body = ContainerConfig::from_resolved(&resolved)
            .unwrap()
            .to_create_body();

        let labels = body.labels.unwrap();
        assert_eq!(labels["hackenv.managed"], "true");
        assert_eq!(labels["hackenv.spec"], "web");
    }

    #[test]
    fn test_unknown_restart_policy_is_rejected() {
        let mut resolved = resolved_sample();
        Arc::make_mut(&mut resolved.spec).restart_policy =
            Some(crate::template::model::RestartPolicy {
                name: "sometimes".to_string(),
                maximum_retry_count: 0,
            });

        let err = ContainerConfig::from_resolved(&resolved).unwrap_err();
        assert!(matches!(err, RuntimeError::Rejected(msg) if msg.contains("sometimes")));
    }

    #[test]
    fn test_missing_image_error() {
        let result = ContainerConfig::builder().cmd(vec!["echo"]).build();
        assert!(matches!(result, Err(RuntimeError::Rejected(_))));
    }
}
