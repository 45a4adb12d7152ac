//! Template validation.
//!
//! A pure function of the document and the caller's trust level. Every check
//! runs on every element so the caller receives the complete diagnostic set
//! in one pass.

use crate::error::{Diagnostic, ValidationErrors};
use crate::template::document::{
    HostConfigDocument, PortBindingDocument, PortDocument, RemoteDocument, TemplateDocument,
    VirtualEnvironmentDocument,
};
use crate::template::model::{
    Credentials, EnvironmentSpec, LaunchSpec, LogConfig, NetworkMode, NetworkSettings, PortSpec,
    Protocol, Provider, RemoteProtocol, RemoteSpec, ResourceLimits, RestartPolicy, Secret,
    SecurityProfile, ValidTemplate,
};
use crate::template::url::UrlTemplate;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Capabilities that hand the container host-level control.
const ELEVATED_CAPABILITIES: &[&str] = &[
    "ALL",
    "SYS_ADMIN",
    "SYS_MODULE",
    "SYS_RAWIO",
    "SYS_PTRACE",
    "SYS_BOOT",
    "SYS_TIME",
    "DAC_READ_SEARCH",
    "NET_ADMIN",
    "MAC_ADMIN",
    "MAC_OVERRIDE",
    "BPF",
    "PERFMON",
];

/// Security options that switch off a confinement layer, as `(key, value)`.
const UNCONFINED_SECURITY_OPTS: &[(&str, &str)] = &[
    ("seccomp", "unconfined"),
    ("apparmor", "unconfined"),
    ("systempaths", "unconfined"),
    ("label", "disable"),
];

fn is_elevated_capability(cap: &str) -> bool {
    let cap = cap.trim().to_ascii_uppercase();
    let cap = cap.strip_prefix("CAP_").unwrap_or(&cap);
    ELEVATED_CAPABILITIES.contains(&cap)
}

/// Docker accepts both `key=value` and the older `key:value` form.
fn is_unconfined_security_opt(opt: &str) -> bool {
    let Some((key, value)) = opt.split_once(['=', ':']) else {
        return false;
    };
    let key = key.trim().to_ascii_lowercase();
    let value = value.trim().to_ascii_lowercase();
    UNCONFINED_SECURITY_OPTS
        .iter()
        .any(|(k, v)| *k == key && *v == value)
}

/// Caller-supplied validation options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationOptions {
    /// Allow privileged containers, host or shared networking, host mounts,
    /// devices, escape-prone capabilities and unconfined security options
    pub elevated_trust: bool,
}

impl ValidationOptions {
    pub fn elevated() -> Self {
        Self {
            elevated_trust: true,
        }
    }
}

/// Validate a parsed template document.
pub fn validate(
    document: &TemplateDocument,
    options: &ValidationOptions,
) -> Result<ValidTemplate, ValidationErrors> {
    TemplateValidator::new(*options).validate(document)
}

/// Validator with fixed options.
#[derive(Debug, Clone, Default)]
pub struct TemplateValidator {
    options: ValidationOptions,
}

impl TemplateValidator {
    pub fn new(options: ValidationOptions) -> Self {
        Self { options }
    }

    /// Parse and validate JSON text. Syntax and type errors become a single
    /// structural diagnostic.
    pub fn validate_json(&self, text: &str) -> Result<ValidTemplate, ValidationErrors> {
        match TemplateDocument::from_json(text) {
            Ok(document) => self.validate(&document),
            Err(e) => Err(ValidationErrors::single(Diagnostic::structural(
                format!("line {} column {}", e.line(), e.column()),
                format!("template is not a valid document: {}", e),
            ))),
        }
    }

    /// Validate a template document.
    pub fn validate(&self, document: &TemplateDocument) -> Result<ValidTemplate, ValidationErrors> {
        let mut diags = Vec::new();

        let name = required_text(document.name.as_deref(), "name", "template name", &mut diags);

        let docs = document.virtual_environments.as_deref().unwrap_or_default();
        if docs.is_empty() {
            diags.push(Diagnostic::structural(
                "virtual_environments",
                "template must declare at least one virtual environment",
            ));
        }

        let mut seen_specs: HashSet<&str> = HashSet::new();
        let mut environments = Vec::with_capacity(docs.len());
        for (index, ve) in docs.iter().enumerate() {
            let path = format!("virtual_environments[{}]", index);
            if let Some(spec_name) = ve.name.as_deref().filter(|n| !n.trim().is_empty())
                && !seen_specs.insert(spec_name)
            {
                diags.push(Diagnostic::referential(
                    format!("{}.name", path),
                    format!("duplicate spec name '{}'", spec_name),
                ));
            }
            if let Some(env) = self.check_environment(ve, &path, &mut diags) {
                environments.push(env);
            }
        }

        if let Some(errors) = ValidationErrors::from_diagnostics(diags) {
            debug!(
                "Template {:?} rejected with {} diagnostic(s)",
                document.name,
                errors.len()
            );
            return Err(errors);
        }

        Ok(ValidTemplate {
            name: name.unwrap_or_default(),
            description: document.description.clone().unwrap_or_default(),
            environments,
            document: document.clone(),
        })
    }

    fn check_environment(
        &self,
        ve: &VirtualEnvironmentDocument,
        path: &str,
        diags: &mut Vec<Diagnostic>,
    ) -> Option<EnvironmentSpec> {
        let start = diags.len();

        let name = required_text(ve.name.as_deref(), &format!("{}.name", path), "spec name", diags);
        let spec_label = name.clone().unwrap_or_else(|| path.to_string());
        let provider = required_text(
            ve.provider.as_deref(),
            &format!("{}.provider", path),
            "provider",
            diags,
        )
        .map(|p| Provider::parse(&p));
        let image = required_text(ve.image.as_deref(), &format!("{}.Image", path), "image", diags);

        let launch = check_launch(ve, path, diags);
        let empty_host = HostConfigDocument::default();
        let host = ve.host_config.as_ref().unwrap_or(&empty_host);
        let resources = check_resources(host, path, diags);
        let security = check_security(ve, host);
        let network = NetworkSettings {
            mode: NetworkMode::parse(host.network_mode.as_deref().unwrap_or_default()),
            disabled: ve.network_disabled.unwrap_or(false),
            dns: non_empty(host.dns.as_deref()),
            dns_search: non_empty(host.dns_search.as_deref()),
            extra_hosts: non_empty(host.extra_hosts.as_deref()),
        };
        self.check_policy(&spec_label, &security, &network, path, diags);

        let mut ports = check_ports(ve.ports.as_deref().unwrap_or_default(), path, diags);
        apply_port_bindings(host, &mut ports, path, diags);

        let remote = ve
            .remote
            .as_ref()
            .and_then(|remote| check_remote(remote, &ports, path, diags));

        if diags.len() > start {
            return None;
        }

        Some(EnvironmentSpec {
            name: name?,
            provider: provider?,
            kind: ve.kind.clone().unwrap_or_default(),
            description: ve.description.clone().unwrap_or_default(),
            image: image?,
            labels: ve.labels.clone().unwrap_or_default(),
            launch,
            resources,
            security,
            network,
            restart_policy: host
                .restart_policy
                .as_ref()
                .and_then(|r| r.name.as_deref().filter(|n| !n.is_empty()).map(|n| (n, r)))
                .map(|(n, r)| RestartPolicy {
                    name: n.to_string(),
                    maximum_retry_count: r.maximum_retry_count.unwrap_or(0),
                }),
            log_config: host.log_config.as_ref().and_then(|l| {
                l.kind.as_deref().filter(|k| !k.is_empty()).map(|k| LogConfig {
                    driver: k.to_string(),
                    options: l.config.clone().unwrap_or_default(),
                })
            }),
            ports,
            remote,
        })
    }

    fn check_policy(
        &self,
        spec: &str,
        security: &SecurityProfile,
        network: &NetworkSettings,
        path: &str,
        diags: &mut Vec<Diagnostic>,
    ) {
        if self.options.elevated_trust {
            return;
        }

        if security.privileged {
            diags.push(Diagnostic::policy(
                format!("{}.HostConfig.Privileged", path),
                format!("spec '{}' requests a privileged container", spec),
            ));
        }
        if network.mode == NetworkMode::Host {
            diags.push(Diagnostic::policy(
                format!("{}.HostConfig.NetworkMode", path),
                format!("spec '{}' requests host network mode", spec),
            ));
        }
        if !security.binds.is_empty() {
            diags.push(Diagnostic::policy(
                format!("{}.HostConfig.Binds", path),
                format!("spec '{}' requests host filesystem binds", spec),
            ));
        }
        if !security.devices.is_empty() {
            diags.push(Diagnostic::policy(
                format!("{}.HostConfig.Devices", path),
                format!("spec '{}' requests host devices", spec),
            ));
        }
        if let NetworkMode::Named(name) = &network.mode {
            if name.starts_with("container:") {
                diags.push(Diagnostic::policy(
                    format!("{}.HostConfig.NetworkMode", path),
                    format!("spec '{}' joins the network namespace of {}", spec, name),
                ));
            }
        }
        for opt in &security.security_opts {
            if is_unconfined_security_opt(opt) {
                diags.push(Diagnostic::policy(
                    format!("{}.SecurityOpts", path),
                    format!("spec '{}' disables confinement with '{}'", spec, opt),
                ));
            }
        }
        for cap in &security.cap_add {
            if is_elevated_capability(cap) {
                diags.push(Diagnostic::policy(
                    format!("{}.HostConfig.CapAdd", path),
                    format!("spec '{}' requests capability {}", spec, cap),
                ));
            }
        }
    }
}

fn required_text(
    value: Option<&str>,
    path: &str,
    what: &str,
    diags: &mut Vec<Diagnostic>,
) -> Option<String> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Some(v.to_string()),
        _ => {
            diags.push(Diagnostic::structural(path, format!("{} is required", what)));
            None
        }
    }
}

/// Drop placeholder entries such as `[""]`.
fn non_empty(values: Option<&[String]>) -> Vec<String> {
    values
        .unwrap_or_default()
        .iter()
        .filter(|v| !v.trim().is_empty())
        .cloned()
        .collect()
}

fn optional_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn check_launch(ve: &VirtualEnvironmentDocument, path: &str, diags: &mut Vec<Diagnostic>) -> LaunchSpec {
    let mut env = BTreeMap::new();
    for (i, entry) in ve.env.as_deref().unwrap_or_default().iter().enumerate() {
        if entry.trim().is_empty() {
            continue;
        }
        let entry_path = format!("{}.Env[{}]", path, i);
        match entry.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                if env.insert(key.to_string(), value.to_string()).is_some() {
                    diags.push(Diagnostic::referential(
                        entry_path,
                        format!("duplicate environment variable '{}'", key),
                    ));
                }
            }
            _ => diags.push(Diagnostic::structural(
                entry_path,
                "environment entries must have the form KEY=VALUE",
            )),
        }
    }

    LaunchSpec {
        cmd: ve.cmd.as_ref().map(|c| c.to_argv()).unwrap_or_default(),
        entrypoint: ve.entrypoint.as_ref().map(|c| c.to_argv()).unwrap_or_default(),
        working_dir: optional_text(ve.working_dir.as_deref()),
        env,
        user: optional_text(ve.user.as_deref()),
        hostname: optional_text(ve.hostname.as_deref()),
        domainname: optional_text(ve.domainname.as_deref()),
        tty: ve.tty.unwrap_or(false),
        open_stdin: ve.open_stdin.unwrap_or(false),
    }
}

fn check_resources(host: &HostConfigDocument, path: &str, diags: &mut Vec<Diagnostic>) -> ResourceLimits {
    let mut limit = |value: Option<i64>, field: &str, allow_unlimited: bool| -> Option<i64> {
        match value {
            None | Some(0) => None,
            Some(-1) if allow_unlimited => Some(-1),
            Some(v) if v < 0 => {
                diags.push(Diagnostic::structural(
                    format!("{}.HostConfig.{}", path, field),
                    format!("{} must not be negative (got {})", field, v),
                ));
                None
            }
            Some(v) => Some(v),
        }
    };

    ResourceLimits {
        memory_bytes: limit(host.memory, "Memory", false),
        memory_swap_bytes: limit(host.memory_swap, "MemorySwap", true),
        cpu_shares: limit(host.cpu_shares, "CpuShares", false),
        cpuset_cpus: optional_text(host.cpuset_cpus.as_deref()),
    }
}

fn check_security(ve: &VirtualEnvironmentDocument, host: &HostConfigDocument) -> SecurityProfile {
    SecurityProfile {
        privileged: host.privileged.unwrap_or(false),
        readonly_rootfs: host.readonly_rootfs.unwrap_or(false),
        cap_add: non_empty(host.cap_add.as_deref()),
        cap_drop: non_empty(host.cap_drop.as_deref()),
        security_opts: non_empty(ve.security_opts.as_deref()),
        binds: non_empty(host.binds.as_deref()),
        devices: host
            .devices
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|d| !d.is_null() && d.as_str() != Some(""))
            .collect(),
    }
}

fn port_number(value: Option<i64>, path: &str, what: &str, diags: &mut Vec<Diagnostic>) -> Option<u16> {
    match value {
        None => {
            diags.push(Diagnostic::structural(path, format!("{} is required", what)));
            None
        }
        Some(v) if (1..=65535).contains(&v) => Some(v as u16),
        Some(v) => {
            diags.push(Diagnostic::structural(
                path,
                format!("{} {} is out of range 1-65535", what, v),
            ));
            None
        }
    }
}

fn check_ports(docs: &[PortDocument], path: &str, diags: &mut Vec<Diagnostic>) -> Vec<PortSpec> {
    let mut names: HashSet<&str> = HashSet::new();
    let mut bindings: HashSet<(u16, Protocol)> = HashSet::new();
    let mut ports = Vec::with_capacity(docs.len());

    for (i, doc) in docs.iter().enumerate() {
        let port_path = format!("{}.ports[{}]", path, i);
        let name = required_text(doc.name.as_deref(), &format!("{}.name", port_path), "port name", diags);
        if let Some(n) = doc.name.as_deref().filter(|n| !n.trim().is_empty())
            && !names.insert(n)
        {
            diags.push(Diagnostic::referential(
                format!("{}.name", port_path),
                format!("duplicate port name '{}'", n),
            ));
        }

        let number = port_number(doc.port, &format!("{}.port", port_path), "port", diags);

        let protocol = match doc.protocol.as_deref() {
            None => {
                diags.push(Diagnostic::structural(
                    format!("{}.protocol", port_path),
                    "protocol is required",
                ));
                None
            }
            Some(raw) => {
                let parsed = Protocol::parse(raw);
                if parsed.is_none() {
                    diags.push(Diagnostic::structural(
                        format!("{}.protocol", port_path),
                        format!("protocol '{}' must be tcp or udp", raw),
                    ));
                }
                parsed
            }
        };

        if let (Some(number), Some(protocol)) = (number, protocol)
            && !bindings.insert((number, protocol))
        {
            diags.push(Diagnostic::referential(
                format!("{}.port", port_path),
                format!("container port {}/{} declared twice", number, protocol),
            ));
        }

        let url = match doc.url.as_deref().filter(|u| !u.trim().is_empty()) {
            None => None,
            Some(raw) => match UrlTemplate::parse(raw) {
                Ok(t) => Some(t),
                Err(message) => {
                    diags.push(Diagnostic::structural(format!("{}.url", port_path), message));
                    None
                }
            },
        };

        if let (Some(name), Some(port), Some(protocol)) = (name, number, protocol) {
            ports.push(PortSpec {
                name,
                port,
                public: doc.public.unwrap_or(false),
                protocol,
                url,
                preferred_host_port: None,
            });
        }
    }

    ports
}

/// Map `HostConfig.PortBindings` onto the declared ports as fixed host ports.
fn apply_port_bindings(
    host: &HostConfigDocument,
    ports: &mut [PortSpec],
    path: &str,
    diags: &mut Vec<Diagnostic>,
) {
    let Some(bindings) = host.port_bindings.as_ref() else {
        return;
    };

    for (key, entries) in bindings {
        let binding_path = format!("{}.HostConfig.PortBindings[\"{}\"]", path, key);
        let (number, protocol) = match key.split_once('/') {
            Some((n, p)) => (n, Protocol::parse(p)),
            None => (key.as_str(), Some(Protocol::Tcp)),
        };
        let (Ok(number), Some(protocol)) = (number.parse::<u16>(), protocol) else {
            diags.push(Diagnostic::structural(
                binding_path,
                format!("port binding key '{}' must look like <port>/<tcp|udp>", key),
            ));
            continue;
        };

        let host_port = entries
            .as_deref()
            .and_then(|e| e.first())
            .and_then(|b: &PortBindingDocument| optional_text(b.host_port.as_deref()));
        let Some(host_port) = host_port else {
            continue;
        };

        let host_port = match host_port.parse::<u16>() {
            Ok(p) if p != 0 => p,
            _ => {
                diags.push(Diagnostic::structural(
                    binding_path,
                    format!("host port '{}' is not a valid port number", host_port),
                ));
                continue;
            }
        };

        match ports
            .iter_mut()
            .find(|p| p.port == number && p.protocol == protocol)
        {
            Some(port) => port.preferred_host_port = Some(host_port),
            None => diags.push(Diagnostic::referential(
                binding_path,
                format!("port binding {} does not match a declared port", key),
            )),
        }
    }
}

fn check_remote(
    remote: &RemoteDocument,
    ports: &[PortSpec],
    path: &str,
    diags: &mut Vec<Diagnostic>,
) -> Option<RemoteSpec> {
    let remote_path = format!("{}.remote", path);
    let provider = required_text(
        remote.provider.as_deref(),
        &format!("{}.provider", remote_path),
        "remote provider",
        diags,
    );

    let protocol = match remote.protocol.as_deref() {
        None => {
            diags.push(Diagnostic::structural(
                format!("{}.protocol", remote_path),
                "remote protocol is required",
            ));
            None
        }
        Some(raw) => {
            let parsed = RemoteProtocol::parse(raw);
            if parsed.is_none() {
                diags.push(Diagnostic::structural(
                    format!("{}.protocol", remote_path),
                    format!("remote protocol '{}' must be one of ssh, rdp, vnc", raw),
                ));
            }
            parsed
        }
    };

    let username = required_text(
        remote.username.as_deref(),
        &format!("{}.username", remote_path),
        "remote username",
        diags,
    );
    // The password may legitimately be empty, but it must be present.
    let password = match remote.password.as_deref() {
        Some(p) => Some(Secret::new(p)),
        None => {
            diags.push(Diagnostic::structural(
                format!("{}.password", remote_path),
                "remote password is required",
            ));
            None
        }
    };

    let port = port_number(remote.port, &format!("{}.port", remote_path), "remote port", diags)?;

    let declared: HashMap<u16, Vec<&PortSpec>> = ports.iter().fold(HashMap::new(), |mut acc, p| {
        acc.entry(p.port).or_default().push(p);
        acc
    });
    let port_name = match declared.get(&port) {
        None => {
            diags.push(Diagnostic::referential(
                format!("{}.port", remote_path),
                format!("RemoteSpec port {} not declared", port),
            ));
            None
        }
        Some(candidates) => match candidates.iter().find(|p| p.protocol == Protocol::Tcp) {
            Some(p) => Some(p.name.clone()),
            None => {
                diags.push(Diagnostic::referential(
                    format!("{}.port", remote_path),
                    format!("RemoteSpec port {} is not declared as tcp", port),
                ));
                None
            }
        },
    };

    Some(RemoteSpec {
        provider: provider?,
        protocol: protocol?,
        credentials: Credentials {
            username: username?,
            password: password?,
        },
        port,
        port_name: port_name?,
    })
}
