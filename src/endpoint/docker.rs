//! Docker container backend.
//!
//! Provisions endpoints as containers from platform images that carry a
//! selenium server plus the agent. Containers are addressed by their
//! network IP, so no host-port publishing is needed.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;

use super::{Backend, BackendResult, EndpointAddr, EndpointError};
use crate::config::DockerProviderConfig;
use crate::platform::{BackendKind, Capacity, Platform, PlatformSource};

/// Platform discovery for the docker backend: the configured image list is
/// the catalog.
pub struct DockerSource {
    config: DockerProviderConfig,
}

impl DockerSource {
    pub fn new(config: DockerProviderConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PlatformSource for DockerSource {
    async fn discover(&self) -> anyhow::Result<Vec<Platform>> {
        // Fail discovery early when the daemon is unreachable so this
        // backend contributes zero platforms instead of unprovisionable
        // ones.
        let docker = connect(&self.config)?;
        docker.ping().await?;

        Ok(self
            .config
            .images
            .iter()
            .map(|image| Platform {
                name: image.name.clone(),
                kind: BackendKind::Docker,
                flavor: None,
                browsers: image.browsers.clone(),
            })
            .collect())
    }

    fn limit(&self) -> Capacity {
        Capacity::from(self.config.max_count)
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }
}

fn connect(config: &DockerProviderConfig) -> BackendResult<Docker> {
    let docker = if let Some(host) = &config.docker_host {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| EndpointError::ProvisionFailed(e.to_string()))?
    } else {
        Docker::connect_with_local_defaults()
            .map_err(|e| EndpointError::ProvisionFailed(e.to_string()))?
    };
    Ok(docker)
}

/// Backend for a single container-backed endpoint.
pub struct DockerBackend {
    docker: Docker,
    container_name: String,
    image: String,
    network_mode: String,
    env: Vec<String>,
    selenium_port: u16,
    agent_port: u16,
    container_id: Mutex<Option<String>>,
}

impl DockerBackend {
    pub fn new(
        config: &DockerProviderConfig,
        container_name: impl Into<String>,
        image: impl Into<String>,
        selenium_port: u16,
        agent_port: u16,
    ) -> BackendResult<Self> {
        let docker = connect(config)?;
        let env = config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        Ok(Self {
            docker,
            container_name: container_name.into(),
            image: image.into(),
            network_mode: config.network_mode.clone(),
            env,
            selenium_port,
            agent_port,
            container_id: Mutex::new(None),
        })
    }

    async fn container_ip(&self, container_id: &str) -> BackendResult<String> {
        let info = self
            .docker
            .inspect_container(container_id, None)
            .await
            .map_err(|e| EndpointError::ProvisionFailed(e.to_string()))?;

        info.network_settings
            .and_then(|settings| settings.networks)
            .and_then(|networks| {
                networks
                    .get(&self.network_mode)
                    .or_else(|| networks.values().next())
                    .cloned()
            })
            .and_then(|network| network.ip_address)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                EndpointError::ProvisionFailed(format!(
                    "container {} has no IP on network {}",
                    container_id, self.network_mode
                ))
            })
    }
}

#[async_trait]
impl Backend for DockerBackend {
    async fn provision(&self) -> BackendResult<EndpointAddr> {
        let host_config = bollard::models::HostConfig {
            network_mode: Some(self.network_mode.clone()),
            ..Default::default()
        };

        let container_config = ContainerConfig {
            image: Some(self.image.clone()),
            env: Some(self.env.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: &self.container_name,
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| EndpointError::ProvisionFailed(e.to_string()))?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| EndpointError::ProvisionFailed(e.to_string()))?;

        let ip = self.container_ip(&response.id).await?;
        *self.container_id.lock().unwrap() = Some(response.id);

        Ok(EndpointAddr {
            ip,
            selenium_port: self.selenium_port,
            agent_port: self.agent_port,
            vnc_port: None,
        })
    }

    async fn destroy(&self) -> BackendResult<()> {
        let container_id = self.container_id.lock().unwrap().take();
        let Some(container_id) = container_id else {
            return Ok(());
        };

        self.docker
            .remove_container(
                &container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| EndpointError::DestroyFailed(e.to_string()))?;

        Ok(())
    }

    async fn recreate(&self) -> BackendResult<EndpointAddr> {
        self.destroy()
            .await
            .map_err(|e| EndpointError::RebuildFailed(e.to_string()))?;
        self.provision()
            .await
            .map_err(|e| EndpointError::RebuildFailed(e.to_string()))
    }

    async fn download_file(&self, remote: &str, local: &std::path::Path) -> BackendResult<()> {
        let container_id = self
            .container_id
            .lock()
            .unwrap()
            .clone()
            .ok_or(EndpointError::NotProvisioned)?;

        let mut stream = self.docker.download_from_container(
            &container_id,
            Some(bollard::container::DownloadFromContainerOptions {
                path: remote.to_string(),
            }),
        );

        let mut tar_data = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| EndpointError::DownloadFailed(e.to_string()))?;
            tar_data.extend_from_slice(&chunk);
        }

        extract_single_file(&tar_data, local)
            .map_err(|e| EndpointError::DownloadFailed(e.to_string()))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }
}

/// Unpack the first regular file of a tar archive to `dest`.
fn extract_single_file(data: &[u8], dest: &std::path::Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut archive = tar::Archive::new(data);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut out = std::fs::File::create(dest)?;
            std::io::copy(&mut entry, &mut out)?;
            return Ok(());
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "archive contained no regular file",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_file_from_archive() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("selenium.log");
        std::fs::write(&source, b"log line\n").unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        builder
            .append_file("selenium.log", &mut std::fs::File::open(&source).unwrap())
            .unwrap();
        let data = builder.into_inner().unwrap();

        let dest = dir.path().join("out/selenium.log");
        extract_single_file(&data, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"log line\n");
    }

    #[test]
    fn empty_archive_is_an_error() {
        let builder = tar::Builder::new(Vec::new());
        let data = builder.into_inner().unwrap();
        let dir = tempfile::tempdir().unwrap();
        assert!(extract_single_file(&data, &dir.path().join("x")).is_err());
    }
}
