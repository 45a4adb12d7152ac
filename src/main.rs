use anyhow::{Context, Result};
use hackenv::broker::{GuacamoleBroker, HttpGatewayBroker, RemoteBroker};
use hackenv::cli::{
    Args, BrokerMode, ConfigDiscovery, ExecutionMode, ProvisionConfig, ProvisioningConfig,
    ValidateConfig,
};
use hackenv::mapper::PortMapper;
use hackenv::runtime::{DockerRuntime, TcpProbe};
use hackenv::{CallerContext, Orchestrator, TemplateDocument, TemplateValidator, ValidationOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hackenv=info")),
        )
        .init();

    let args = Args::parse();
    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    match mode {
        ExecutionMode::Validate(config) => run_validate(config),
        ExecutionMode::Provision(config) => run_provision(config).await,
        ExecutionMode::ShowConfig { config_override } => {
            ConfigDiscovery::show_discovery_info();
            let config = load_config(config_override.as_deref())?;
            println!();
            println!("Effective configuration:");
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        ExecutionMode::InitConfig => {
            let path = ConfigDiscovery::create_default_user_config()?;
            println!("Configuration file: {:?}", path);
            Ok(())
        }
    }
}

fn load_config(config_override: Option<&std::path::Path>) -> Result<ProvisioningConfig> {
    let config = match config_override {
        Some(path) => {
            info!("Loading configuration override from: {:?}", path);
            ProvisioningConfig::from_toml_file(path)?
        }
        None => ConfigDiscovery::discover_config()?,
    };
    Ok(config)
}

fn read_template(path: &std::path::Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read template {:?}", path))
}

fn run_validate(config: ValidateConfig) -> Result<()> {
    let text = read_template(&config.template)?;
    let options = if config.elevated {
        ValidationOptions::elevated()
    } else {
        ValidationOptions::default()
    };

    match TemplateValidator::new(options).validate_json(&text) {
        Ok(template) => {
            println!("✓ Template '{}' is valid", template.name());
            for spec in template.environments() {
                println!("  - {} ({}, image {})", spec.name, spec.provider, spec.image);
                for port in &spec.ports {
                    println!(
                        "      port {} {}/{}{}",
                        port.name,
                        port.port,
                        port.protocol,
                        if port.public { " public" } else { "" }
                    );
                }
                if let Some(remote) = &spec.remote {
                    println!("      remote {} via {} on {}", remote.protocol, remote.provider, remote.port);
                }
            }
            Ok(())
        }
        Err(errors) => {
            eprintln!("✗ {}", errors);
            std::process::exit(1);
        }
    }
}

async fn run_provision(args: ProvisionConfig) -> Result<()> {
    let config = load_config(args.config_override.as_deref())?;
    let document = TemplateDocument::from_json(&read_template(&args.template)?)
        .with_context(|| format!("Template {:?} is not valid JSON", args.template))?;

    let runtime = Arc::new(DockerRuntime::connect(config.docker_runtime_config()).await?);
    let broker: Arc<dyn RemoteBroker> = match config.broker.mode {
        BrokerMode::Embedded => Arc::new(GuacamoleBroker::new(config.gateway_url()?)),
        BrokerMode::Http => Arc::new(HttpGatewayBroker::new(
            config.gateway_url()?,
            Duration::from_secs(config.broker.session_timeout_secs),
        )?),
    };
    let mapper = Arc::new(PortMapper::new(
        Arc::new(config.port_pool()),
        broker,
        config.mapper_config(),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        runtime,
        Arc::new(TcpProbe::default()),
        mapper,
        config.lifecycle_config(),
        config.orchestrator_config(),
    ));

    let shutdown = CancellationToken::new();
    let reclaimer = config.reclamation.enabled.then(|| {
        orchestrator
            .clone()
            .spawn_reclaimer(config.sweep_interval(), shutdown.clone())
    });

    let cancel = CancellationToken::new();
    let mut context = CallerContext::new(&args.caller).with_cancellation(cancel.clone());
    if let Some(minutes) = args.ttl_minutes {
        let ttl = chrono::Duration::try_minutes(minutes)
            .ok_or_else(|| anyhow::anyhow!("--ttl-minutes {} is out of range", minutes))?;
        context = context.with_ttl(ttl);
    }

    let provisioning = orchestrator.provision(&document, &args.spec, context);
    tokio::pin!(provisioning);
    let result = tokio::select! {
        result = &mut provisioning => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling provisioning");
            cancel.cancel();
            provisioning.await
        }
    };

    let handle = match result {
        Ok(handle) => handle,
        Err(e) => {
            error!("Provisioning failed: {}", e);
            shutdown.cancel();
            return Err(e.into());
        }
    };

    println!("{}", serde_json::to_string_pretty(&handle)?);
    if args.verbose {
        for port in handle.ports.values() {
            if let Some(url) = &port.url {
                println!("{}: {}", port.name, url);
            }
        }
        if let Some(url) = handle.remote.as_ref().and_then(|r| r.url.as_ref()) {
            println!("remote session: {}", url);
        }
    }

    info!("Instance {} running, press Ctrl-C to terminate", handle.instance_id);
    tokio::signal::ctrl_c().await?;

    let termination = orchestrator.terminate(handle.instance_id).await?;
    info!("Instance {} terminated: {:?}", handle.instance_id, termination);

    shutdown.cancel();
    if let Some(reclaimer) = reclaimer {
        reclaimer.await?;
    }
    Ok(())
}
