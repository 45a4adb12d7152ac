//! Docker/Podman runtime via the bollard API.
//!
//! Connects to the local Docker daemon, falling back to Podman's
//! Docker-compatible sockets, and drives the create / start / stop / inspect
//! cycle for provisioned instances.

use super::config::ContainerConfig;
use super::{ContainerRuntime, ResolvedSpec, RuntimeHandle, RuntimeStatus};
use crate::error::RuntimeError;
use crate::template::model::Provider;
use async_trait::async_trait;
use bollard::Docker;
use futures::stream::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DockerRuntimeConfig {
    /// Pull images that are not present locally
    pub auto_pull: bool,
    /// Grace period handed to `docker stop`, in seconds
    pub stop_timeout: i64,
}

impl Default for DockerRuntimeConfig {
    fn default() -> Self {
        Self {
            auto_pull: true,
            stop_timeout: 10,
        }
    }
}

/// Map a bollard error onto the runtime taxonomy.
fn classify(error: bollard::errors::Error, target: &str) -> RuntimeError {
    match error {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(format!("{}: {}", target, message)),
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } if status_code >= 500 => {
            RuntimeError::Transient(format!("{} ({}): {}", target, status_code, message))
        }
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Rejected(format!("{} ({}): {}", target, status_code, message)),
        other => RuntimeError::Transient(format!("{}: {}", target, other)),
    }
}

fn is_status(error: &bollard::errors::Error, codes: &[u16]) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if codes.contains(status_code)
    )
}

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Arc<Docker>,
    config: DockerRuntimeConfig,
}

impl DockerRuntime {
    /// Connect to Docker or Podman and verify the daemon answers.
    ///
    /// # Errors
    ///
    /// Returns a transient error if no runtime can be reached.
    pub async fn connect(config: DockerRuntimeConfig) -> Result<Self, RuntimeError> {
        let docker = Self::connect_docker()?;
        let runtime = Self {
            docker: Arc::new(docker),
            config,
        };
        runtime.ping().await?;
        Ok(runtime)
    }

    pub fn with_client(docker: Docker, config: DockerRuntimeConfig) -> Self {
        Self {
            docker: Arc::new(docker),
            config,
        }
    }

    /// Tries local defaults first, then the rootless and system Podman sockets.
    fn connect_docker() -> Result<Docker, RuntimeError> {
        debug!("Attempting to connect to container runtime...");

        match Docker::connect_with_local_defaults() {
            Ok(docker) => {
                info!("Connected to container runtime via local defaults");
                return Ok(docker);
            }
            Err(e) => {
                debug!("Local defaults failed: {}", e);
            }
        }

        #[cfg(unix)]
        {
            let mut sockets = Vec::new();
            if let Ok(home) = std::env::var("HOME") {
                sockets.push(format!("unix://{}/run/podman/podman.sock", home));
            }
            sockets.push("unix:///run/podman/podman.sock".to_string());

            for socket in sockets {
                debug!("Trying Podman socket: {}", socket);
                match Docker::connect_with_socket(&socket, 120, bollard::API_DEFAULT_VERSION) {
                    Ok(docker) => {
                        info!("Connected to Podman via {}", socket);
                        return Ok(docker);
                    }
                    Err(e) => {
                        debug!("Podman socket {} failed: {}", socket, e);
                    }
                }
            }
        }

        Err(RuntimeError::Transient(
            "Failed to connect to Docker or Podman. Please ensure Docker or Podman is installed and running.".to_string(),
        ))
    }

    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map_err(|e| classify(e, "ping"))?;
        debug!("Container runtime ping successful");
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(classify(e, image)),
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.image_exists(image).await? {
            debug!("Image {} already exists locally", image);
            return Ok(());
        }

        info!("Pulling image: {}", image);
        let mut stream = self.docker.create_image(
            Some(bollard::image::CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => return Err(classify(e, image)),
            }
        }

        info!("Successfully pulled image: {}", image);
        Ok(())
    }

    async fn remove_container(&self, name_or_id: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .remove_container(
                name_or_id,
                Some(bollard::container::RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                info!("Removed container: {}", name_or_id);
                Ok(())
            }
            Err(e) if is_status(&e, &[404]) => {
                debug!("Container {} already removed", name_or_id);
                Ok(())
            }
            Err(e) => Err(classify(e, name_or_id)),
        }
    }

    /// A container left behind by an earlier run of the same instance name.
    async fn remove_stale(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .inspect_container(name, None::<bollard::query_parameters::InspectContainerOptions>)
            .await
        {
            Ok(_) => {
                warn!("Removing stale container {}", name);
                self.remove_container(name).await
            }
            Err(e) if is_status(&e, &[404]) => Ok(()),
            Err(e) => Err(classify(e, name)),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_and_start(&self, spec: &ResolvedSpec) -> Result<RuntimeHandle, RuntimeError> {
        let config = ContainerConfig::from_resolved(spec)?;
        let name = spec.container_name.as_str();

        if self.config.auto_pull {
            self.ensure_image(&config.image).await?;
        }
        self.remove_stale(name).await?;

        debug!("Creating container: {}", name);
        let response = self
            .docker
            .create_container(
                Some(bollard::container::CreateContainerOptions {
                    name,
                    ..Default::default()
                }),
                config.to_create_body(),
            )
            .await
            .map_err(|e| classify(e, name))?;
        info!("Created container: {} ({})", name, response.id);

        if let Err(e) = self
            .docker
            .start_container(
                &response.id,
                None::<bollard::container::StartContainerOptions<String>>,
            )
            .await
        {
            warn!("Failed to start container {}: {}", name, e);
            if let Err(cleanup) = self.remove_container(&response.id).await {
                warn!("Failed to remove unstarted container {}: {}", name, cleanup);
            }
            return Err(classify(e, name));
        }

        info!("Started container: {}", name);
        Ok(RuntimeHandle {
            id: response.id,
            name: name.to_string(),
        })
    }

    async fn stop(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError> {
        debug!("Stopping container: {}", handle.name);

        match self
            .docker
            .stop_container(
                &handle.id,
                Some(bollard::container::StopContainerOptions {
                    t: self.config.stop_timeout,
                }),
            )
            .await
        {
            Ok(()) => info!("Stopped container: {}", handle.name),
            // 304: already stopped, 404: already gone
            Err(e) if is_status(&e, &[304, 404]) => {
                debug!("Container {} was not running", handle.name)
            }
            Err(e) => return Err(classify(e, &handle.name)),
        }

        self.remove_container(&handle.id).await
    }

    async fn inspect(&self, handle: &RuntimeHandle) -> Result<RuntimeStatus, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(
                &handle.id,
                None::<bollard::query_parameters::InspectContainerOptions>,
            )
            .await
            .map_err(|e| classify(e, &handle.name))?;

        let state = inspect.state.unwrap_or_default();
        let running = state.running.unwrap_or(false);

        Ok(RuntimeStatus {
            running,
            exit_code: if running { None } else { state.exit_code },
            restart_count: inspect.restart_count.unwrap_or(0),
        })
    }

    fn supports(&self, provider: &Provider) -> bool {
        matches!(provider, Provider::Docker)
    }

    fn runtime_type(&self) -> &'static str {
        "docker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(status_code: u16) -> bollard::errors::Error {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            classify(server_error(404), "web"),
            RuntimeError::NotFound(_)
        ));
        assert!(classify(server_error(500), "web").is_transient());
        assert!(classify(server_error(503), "web").is_transient());
        assert!(matches!(
            classify(server_error(409), "web"),
            RuntimeError::Rejected(msg) if msg.contains("409")
        ));
        assert!(is_status(&server_error(304), &[304, 404]));
    }

    #[tokio::test]
    #[ignore] // Requires Docker/Podman to be running
    async fn test_runtime_connection() {
        let runtime = DockerRuntime::connect(DockerRuntimeConfig::default())
            .await
            .unwrap();
        runtime.ping().await.unwrap();
        assert!(runtime.supports(&Provider::Docker));
        assert!(!runtime.supports(&Provider::Other("azure".to_string())));
    }
}
