//! Openstack instance backend.
//!
//! Drives the `openstack` CLI with `-f json` output instead of binding a
//! cloud SDK; credentials come from the usual OS_* environment. Instance
//! creation is asynchronous on the cloud side, so provisioning polls the
//! server status until ACTIVE within a bounded attempt budget.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::{Backend, BackendResult, EndpointAddr, EndpointError};
use crate::config::OpenstackProviderConfig;
use crate::platform::{BackendKind, Capacity, Platform, PlatformSource};

/// Platform discovery for Openstack: the image catalog, filtered by the
/// configured name prefix.
pub struct OpenstackSource {
    config: OpenstackProviderConfig,
}

impl OpenstackSource {
    pub fn new(config: OpenstackProviderConfig) -> Self {
        Self { config }
    }
}

#[derive(Debug, Deserialize)]
struct ImageRow {
    #[serde(rename = "Name")]
    name: String,
}

#[async_trait]
impl PlatformSource for OpenstackSource {
    async fn discover(&self) -> anyhow::Result<Vec<Platform>> {
        let output = run_openstack(&["image", "list", "-f", "json"]).await?;
        let images: Vec<ImageRow> = serde_json::from_str(&output)?;

        Ok(images
            .into_iter()
            .filter(|image| match &self.config.image_prefix {
                Some(prefix) => image.name.starts_with(prefix),
                None => true,
            })
            .map(|image| Platform {
                name: image.name,
                kind: BackendKind::Openstack,
                flavor: Some(self.config.flavor.clone()),
                browsers: HashMap::new(),
            })
            .collect())
    }

    fn limit(&self) -> Capacity {
        Capacity::from(self.config.max_count)
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Openstack
    }
}

#[derive(Debug, Deserialize)]
struct ServerShow {
    id: String,
    status: String,
    #[serde(default)]
    addresses: HashMap<String, Vec<String>>,
}

/// Backend for a single Openstack instance.
pub struct OpenstackBackend {
    image: String,
    flavor: String,
    network: Option<String>,
    server_name: String,
    check_pause: Duration,
    check_attempts: u32,
    selenium_port: u16,
    agent_port: u16,
    server_id: std::sync::Mutex<Option<String>>,
}

impl OpenstackBackend {
    pub fn new(
        config: &OpenstackProviderConfig,
        image: impl Into<String>,
        server_name: impl Into<String>,
        check_pause: Duration,
        check_attempts: u32,
        selenium_port: u16,
        agent_port: u16,
    ) -> Self {
        Self {
            image: image.into(),
            flavor: config.flavor.clone(),
            network: config.network.clone(),
            server_name: server_name.into(),
            check_pause,
            check_attempts,
            selenium_port,
            agent_port,
            server_id: std::sync::Mutex::new(None),
        }
    }

    async fn wait_for_active(&self, server_id: &str) -> BackendResult<ServerShow> {
        for attempt in 0..self.check_attempts {
            let output = run_openstack(&["server", "show", server_id, "-f", "json"])
                .await
                .map_err(|e| EndpointError::ProvisionFailed(e.to_string()))?;
            let server: ServerShow = serde_json::from_str(&output)
                .map_err(|e| EndpointError::ProvisionFailed(e.to_string()))?;

            match server.status.as_str() {
                "ACTIVE" => return Ok(server),
                "ERROR" => {
                    return Err(EndpointError::ProvisionFailed(format!(
                        "server {} entered ERROR state",
                        server_id
                    )))
                }
                status => debug!(
                    "server {} is {} (attempt {}/{})",
                    server_id,
                    status,
                    attempt + 1,
                    self.check_attempts
                ),
            }
            tokio::time::sleep(self.check_pause).await;
        }

        Err(EndpointError::ProvisionFailed(format!(
            "server {} not ACTIVE after {} attempts",
            server_id, self.check_attempts
        )))
    }
}

#[async_trait]
impl Backend for OpenstackBackend {
    async fn provision(&self) -> BackendResult<EndpointAddr> {
        let mut args: Vec<String> = vec![
            "server".into(),
            "create".into(),
            "--image".into(),
            self.image.clone(),
            "--flavor".into(),
            self.flavor.clone(),
        ];
        if let Some(network) = &self.network {
            args.push("--network".into());
            args.push(network.clone());
        }
        args.push("-f".into());
        args.push("json".into());
        args.push(self.server_name.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = run_openstack(&arg_refs)
            .await
            .map_err(|e| EndpointError::ProvisionFailed(e.to_string()))?;
        let created: ServerShow = serde_json::from_str(&output)
            .map_err(|e| EndpointError::ProvisionFailed(e.to_string()))?;

        *self.server_id.lock().unwrap() = Some(created.id.clone());

        let active = self.wait_for_active(&created.id).await?;
        let ip = active
            .addresses
            .values()
            .flatten()
            .next()
            .cloned()
            .ok_or_else(|| {
                EndpointError::ProvisionFailed(format!(
                    "server {} has no addresses",
                    created.id
                ))
            })?;

        Ok(EndpointAddr {
            ip,
            selenium_port: self.selenium_port,
            agent_port: self.agent_port,
            vnc_port: None,
        })
    }

    async fn destroy(&self) -> BackendResult<()> {
        let server_id = self.server_id.lock().unwrap().take();
        let Some(server_id) = server_id else {
            return Ok(());
        };

        run_openstack(&["server", "delete", "--wait", &server_id])
            .await
            .map(|_| ())
            .map_err(|e| EndpointError::DestroyFailed(e.to_string()))
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
        let server_id = self
            .server_id
            .lock()
            .unwrap()
            .clone()
            .ok_or(EndpointError::NotProvisioned)?;
        let server = self.wait_for_active(&server_id).await?;
        let ip = server
            .addresses
            .values()
            .flatten()
            .next()
            .cloned()
            .ok_or(EndpointError::NotProvisioned)?;

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let source = format!("root@{}:{}", ip, shell_words::quote(remote));
        let output = Command::new("scp")
            .args([
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                &source,
                &local.to_string_lossy(),
            ])
            .output()
            .await
            .map_err(|e| EndpointError::DownloadFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(EndpointError::DownloadFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Openstack
    }
}

async fn run_openstack(args: &[&str]) -> anyhow::Result<String> {
    let output = Command::new("openstack").args(args).output().await?;

    if !output.status.success() {
        anyhow::bail!(
            "openstack {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_show() {
        let json = r#"{
            "id": "b8f5cd5a",
            "status": "ACTIVE",
            "addresses": {"private": ["10.0.0.12"]}
        }"#;
        let server: ServerShow = serde_json::from_str(json).unwrap();
        assert_eq!(server.status, "ACTIVE");
        assert_eq!(server.addresses["private"][0], "10.0.0.12");
    }

    #[test]
    fn parses_image_list() {
        let json = r#"[{"Name": "selenium-ubuntu-16.04"}, {"Name": "plain-centos"}]"#;
        let images: Vec<ImageRow> = serde_json::from_str(json).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].name, "selenium-ubuntu-16.04");
    }
}
