//! Docker backend: one fresh container per test instance.
//!
//! The container publishes the application's management port on an
//! ephemeral loopback port, so any number of instances can run side by side.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding, PortMap};
use futures::StreamExt;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{BackendKind, InfraError, InfraResult, InstanceBackend, InstanceSpec};
use crate::config::DockerBackendConfig;

/// Creates and removes application containers.
pub struct DockerBackend {
    docker: Docker,
    config: DockerBackendConfig,
    pulled: OnceCell<()>,
}

impl DockerBackend {
    /// Connects to the configured Docker daemon, or the local one.
    pub fn new(config: DockerBackendConfig) -> InfraResult<Self> {
        let docker = if let Some(host) = &config.docker_host {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| InfraError::Connection(e.to_string()))?
        } else {
            Docker::connect_with_local_defaults()
                .map_err(|e| InfraError::Connection(e.to_string()))?
        };

        Ok(Self {
            docker,
            config,
            pulled: OnceCell::new(),
        })
    }

    fn port_key(&self) -> String {
        port_key(&self.config)
    }

    /// Pulls the image once per run when `pull` is enabled.
    async fn ensure_image(&self) -> InfraResult<()> {
        if !self.config.pull {
            return Ok(());
        }
        self.pulled
            .get_or_try_init(|| async {
                info!("Pulling image {}", self.config.image);
                let options = CreateImageOptions {
                    from_image: self.config.image.as_str(),
                    ..Default::default()
                };
                let mut progress = self.docker.create_image(Some(options), None, None);
                while let Some(step) = progress.next().await {
                    step.map_err(|e| {
                        InfraError::ProvisionFailed(format!(
                            "pull of {} failed: {e}",
                            self.config.image
                        ))
                    })?;
                }
                Ok::<(), InfraError>(())
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl InstanceBackend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn create(&self, spec: &InstanceSpec) -> InfraResult<String> {
        self.ensure_image().await?;

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), container_config(&self.config, spec))
            .await
            .map_err(|e| InfraError::ProvisionFailed(e.to_string()))?;
        let container_id = response.id;

        if let Err(e) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(cleanup) = self.destroy(&container_id).await {
                warn!(
                    "Failed to remove container {} after start error: {}",
                    container_id, cleanup
                );
            }
            return Err(InfraError::ProvisionFailed(e.to_string()));
        }

        debug!("Started container {} for {}", container_id, spec.name);
        Ok(container_id)
    }

    async fn address(&self, handle: &str) -> InfraResult<String> {
        let inspect = self
            .docker
            .inspect_container(handle, None::<InspectContainerOptions>)
            .await
            .map_err(|e| InfraError::Connection(e.to_string()))?;

        let ports = inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .unwrap_or_default();

        published_address(&ports, &self.port_key()).ok_or_else(|| {
            InfraError::Connection(format!(
                "container {handle} does not publish {}",
                self.port_key()
            ))
        })
    }

    async fn destroy(&self, handle: &str) -> InfraResult<()> {
        let result = self
            .docker
            .remove_container(
                handle,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Container {} already removed", handle);
                Ok(())
            }
            Err(e) => Err(InfraError::TeardownFailed(e.to_string())),
        }
    }
}

fn port_key(config: &DockerBackendConfig) -> String {
    format!("{}/tcp", config.api_port)
}

fn container_config(config: &DockerBackendConfig, spec: &InstanceSpec) -> ContainerConfig<String> {
    let mut env = vec![
        "SPLUNK_START_ARGS=--accept-license".to_string(),
        format!("SPLUNK_PASSWORD={}", spec.password),
    ];
    env.extend(config.env.iter().map(|(k, v)| format!("{k}={v}")));

    let port_key = port_key(config);
    let port_bindings: PortMap = HashMap::from([(
        port_key.clone(),
        Some(vec![PortBinding {
            host_ip: Some("127.0.0.1".to_string()),
            host_port: Some(String::new()),
        }]),
    )]);

    ContainerConfig {
        image: Some(config.image.clone()),
        env: Some(env),
        exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
        host_config: Some(HostConfig {
            port_bindings: Some(port_bindings),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `host:port` a container publishes for `port_key`.
fn published_address(ports: &PortMap, port_key: &str) -> Option<String> {
    ports
        .get(port_key)?
        .as_ref()?
        .iter()
        .find_map(|binding| {
            let port = binding.host_port.as_deref().filter(|p| !p.is_empty())?;
            let host = match binding.host_ip.as_deref() {
                None | Some("") | Some("0.0.0.0") => "127.0.0.1",
                Some(ip) => ip,
            };
            Some(format!("{host}:{port}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(ip: &str, port: &str) -> PortBinding {
        PortBinding {
            host_ip: Some(ip.to_string()),
            host_port: Some(port.to_string()),
        }
    }

    #[test]
    fn test_published_address() {
        let ports: PortMap = HashMap::from([
            ("8089/tcp".to_string(), Some(vec![binding("127.0.0.1", "49153")])),
            ("8000/tcp".to_string(), None),
        ]);
        assert_eq!(
            published_address(&ports, "8089/tcp").as_deref(),
            Some("127.0.0.1:49153")
        );
        assert_eq!(published_address(&ports, "8000/tcp"), None);
        assert_eq!(published_address(&ports, "9999/tcp"), None);
    }

    #[test]
    fn test_published_address_wildcard_host() {
        let ports: PortMap = HashMap::from([(
            "8089/tcp".to_string(),
            Some(vec![binding("0.0.0.0", ""), binding("0.0.0.0", "32768")]),
        )]);
        assert_eq!(
            published_address(&ports, "8089/tcp").as_deref(),
            Some("127.0.0.1:32768")
        );
    }

    #[test]
    fn test_container_config() {
        let mut config = DockerBackendConfig::default();
        config.env.insert("SPLUNK_APPS_URL".into(), "https://apps/a.tgz".into());
        let spec = InstanceSpec {
            name: "retest-1".into(),
            password: "s3cret!".into(),
        };
        let container = container_config(&config, &spec);

        let env = container.env.unwrap();
        assert!(env.contains(&"SPLUNK_PASSWORD=s3cret!".to_string()));
        assert!(env.contains(&"SPLUNK_START_ARGS=--accept-license".to_string()));
        assert!(env.contains(&"SPLUNK_APPS_URL=https://apps/a.tgz".to_string()));
        assert!(container.exposed_ports.unwrap().contains_key("8089/tcp"));

        let bindings = container.host_config.unwrap().port_bindings.unwrap();
        let published = bindings["8089/tcp"].as_ref().unwrap();
        assert_eq!(published[0].host_ip.as_deref(), Some("127.0.0.1"));
    }
}
