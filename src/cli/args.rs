//! Command line argument parsing
//!
//! Subcommands:
//! - `validate`: Check a template document and print its diagnostics
//! - `provision`: Provision one spec of a template against the local runtime
//! - `show-config`: Show configuration discovery information and the effective config
//! - `init-config`: Write a default user configuration file

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum ExecutionMode {
    Validate(ValidateConfig),
    Provision(ProvisionConfig),
    ShowConfig { config_override: Option<PathBuf> },
    InitConfig,
}

#[derive(Debug)]
pub struct ValidateConfig {
    pub template: PathBuf,
    pub elevated: bool,
}

#[derive(Debug)]
pub struct ProvisionConfig {
    pub template: PathBuf,
    pub spec: String,
    pub caller: String,
    pub ttl_minutes: Option<i64>,
    pub config_override: Option<PathBuf>,
    pub verbose: bool,
}

#[derive(Debug, Parser)]
#[command(name = "hackenv")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Template-driven provisioning of hackathon environments")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Validate a template document
    Validate {
        /// Path to the template (JSON)
        template: PathBuf,
        /// Allow privileged containers, host networking, mounts and devices
        #[arg(long = "elevated")]
        elevated: bool,
    },
    /// Provision one spec of a template and keep it until Ctrl-C
    Provision {
        /// Path to the template (JSON)
        template: PathBuf,
        /// Name of the virtual environment to provision
        #[arg(short = 's', long = "spec")]
        spec: String,
        /// Identity of the requesting participant
        #[arg(long = "caller")]
        caller: String,
        /// Instance lifetime in minutes, overriding the configured default
        #[arg(long = "ttl-minutes", value_name = "MINUTES")]
        ttl_minutes: Option<i64>,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Enable verbose output
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },
    /// Show configuration discovery information
    ShowConfig {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
    /// Create a default configuration file in the user's home directory
    InitConfig,
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Validate { template, elevated }) => {
                Self::check_template_path(template)?;
                Ok(ExecutionMode::Validate(ValidateConfig {
                    template: template.clone(),
                    elevated: *elevated,
                }))
            }
            Some(Commands::Provision {
                template,
                spec,
                caller,
                ttl_minutes,
                config,
                verbose,
            }) => {
                Self::check_template_path(template)?;
                if caller.trim().is_empty() {
                    return Err("--caller must not be empty".to_string());
                }
                if ttl_minutes.is_some_and(|m| m <= 0) {
                    return Err("--ttl-minutes must be positive".to_string());
                }
                if ttl_minutes.is_some_and(|m| chrono::Duration::try_minutes(m).is_none()) {
                    return Err("--ttl-minutes is out of range".to_string());
                }
                Ok(ExecutionMode::Provision(ProvisionConfig {
                    template: template.clone(),
                    spec: spec.clone(),
                    caller: caller.clone(),
                    ttl_minutes: *ttl_minutes,
                    config_override: config.clone(),
                    verbose: *verbose,
                }))
            }
            Some(Commands::ShowConfig { config }) => Ok(ExecutionMode::ShowConfig {
                config_override: config.clone(),
            }),
            Some(Commands::InitConfig) => Ok(ExecutionMode::InitConfig),
            None => Err(
                "No command specified. Use 'hackenv --help' to see available commands."
                    .to_string(),
            ),
        }
    }

    /// Templates are JSON documents; extension matching is case-insensitive.
    fn check_template_path(path: &Path) -> Result<(), String> {
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "json" => Ok(()),
            _ => Err(format!("Template {:?} is not a .json file", path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provision_command() {
        let args = Args {
            command: Some(Commands::Provision {
                template: PathBuf::from("templates/sample-template-for-docker.json"),
                spec: "web".to_string(),
                caller: "alice".to_string(),
                ttl_minutes: Some(90),
                config: None,
                verbose: true,
            }),
        };

        if let ExecutionMode::Provision(config) = args.mode().unwrap() {
            assert_eq!(config.spec, "web");
            assert_eq!(config.caller, "alice");
            assert_eq!(config.ttl_minutes, Some(90));
            assert!(config.verbose);
        } else {
            panic!("Expected Provision mode");
        }
    }

    #[test]
    fn test_provision_rejects_bad_arguments() {
        let mut args = Args {
            command: Some(Commands::Provision {
                template: PathBuf::from("template.json"),
                spec: "web".to_string(),
                caller: " ".to_string(),
                ttl_minutes: None,
                config: None,
                verbose: false,
            }),
        };
        assert!(args.mode().unwrap_err().contains("--caller"));

        args.command = Some(Commands::Provision {
            template: PathBuf::from("template.json"),
            spec: "web".to_string(),
            caller: "alice".to_string(),
            ttl_minutes: Some(0),
            config: None,
            verbose: false,
        });
        assert!(args.mode().unwrap_err().contains("--ttl-minutes"));

        args.command = Some(Commands::Provision {
            template: PathBuf::from("template.json"),
            spec: "web".to_string(),
            caller: "alice".to_string(),
            ttl_minutes: Some(i64::MAX),
            config: None,
            verbose: false,
        });
        assert!(args.mode().unwrap_err().contains("out of range"));
    }

    #[test]
    fn test_template_extension_check() {
        assert!(Args::check_template_path(Path::new("template.json")).is_ok());
        assert!(Args::check_template_path(Path::new("/path/to/TEMPLATE.JSON")).is_ok());
        assert!(Args::check_template_path(Path::new("template.toml")).is_err());
        assert!(Args::check_template_path(Path::new("template")).is_err());
    }

    #[test]
    fn test_validate_command() {
        let args = Args {
            command: Some(Commands::Validate {
                template: PathBuf::from("template.json"),
                elevated: true,
            }),
        };
        assert!(matches!(
            args.mode().unwrap(),
            ExecutionMode::Validate(ValidateConfig { elevated: true, .. })
        ));
    }

    #[test]
    fn test_no_command_error() {
        let args = Args { command: None };
        assert!(args.mode().is_err());
    }
}
