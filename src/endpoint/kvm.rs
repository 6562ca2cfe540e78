//! KVM clone backend.
//!
//! Clones endpoints from origin domains with the libvirt CLI tooling
//! (`virt-clone` / `virsh`) instead of linking against libvirt. Command
//! output parsing keeps the backend dependency-free and matches how the
//! operators drive these hosts by hand.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{Backend, BackendResult, EndpointAddr, EndpointError};
use crate::config::KvmProviderConfig;
use crate::platform::{BackendKind, Capacity, Platform, PlatformSource};

/// Platform discovery for KVM: every subdirectory of the origins dir is an
/// origin domain definition.
pub struct KvmSource {
    config: KvmProviderConfig,
}

impl KvmSource {
    pub fn new(config: KvmProviderConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PlatformSource for KvmSource {
    async fn discover(&self) -> anyhow::Result<Vec<Platform>> {
        let mut platforms = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.config.origins_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                let name = entry.file_name().to_string_lossy().to_string();
                let browsers = self
                    .config
                    .platforms
                    .get(&name)
                    .cloned()
                    .unwrap_or_default();
                platforms.push(Platform {
                    name,
                    kind: BackendKind::Kvm,
                    flavor: None,
                    browsers,
                });
            }
        }

        Ok(platforms)
    }

    fn limit(&self) -> Capacity {
        Capacity::from(self.config.max_count)
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Kvm
    }
}

/// Backend for a single KVM clone.
pub struct KvmBackend {
    uri: String,
    origin: String,
    domain: String,
    ssh_user: String,
    check_pause: Duration,
    check_attempts: u32,
    selenium_port: u16,
    agent_port: u16,
}

impl KvmBackend {
    pub fn new(
        config: &KvmProviderConfig,
        origin: impl Into<String>,
        domain: impl Into<String>,
        check_pause: Duration,
        check_attempts: u32,
        selenium_port: u16,
        agent_port: u16,
    ) -> Self {
        Self {
            uri: config.connection_uri.clone(),
            origin: origin.into(),
            domain: domain.into(),
            ssh_user: config.ssh_user.clone(),
            check_pause,
            check_attempts,
            selenium_port,
            agent_port,
        }
    }

    async fn virsh(&self, args: &[&str]) -> BackendResult<String> {
        run_command("virsh", &[&["--connect", self.uri.as_str()], args].concat()).await
    }

    /// The clone's DHCP lease shows up some time after boot; poll for it.
    async fn wait_for_ip(&self) -> BackendResult<String> {
        for attempt in 0..self.check_attempts {
            let output = self
                .virsh(&["domifaddr", &self.domain, "--source", "lease"])
                .await?;
            if let Some(ip) = parse_domifaddr(&output) {
                return Ok(ip);
            }
            debug!(
                "no lease for {} yet (attempt {}/{})",
                self.domain,
                attempt + 1,
                self.check_attempts
            );
            tokio::time::sleep(self.check_pause).await;
        }

        Err(EndpointError::ProvisionFailed(format!(
            "domain {} never received a DHCP lease",
            self.domain
        )))
    }
}

#[async_trait]
impl Backend for KvmBackend {
    async fn provision(&self) -> BackendResult<EndpointAddr> {
        run_command(
            "virt-clone",
            &[
                "--connect",
                &self.uri,
                "--original",
                &self.origin,
                "--name",
                &self.domain,
                "--auto-clone",
            ],
        )
        .await?;

        self.virsh(&["start", &self.domain]).await?;
        let ip = self.wait_for_ip().await?;

        Ok(EndpointAddr {
            ip,
            selenium_port: self.selenium_port,
            agent_port: self.agent_port,
            vnc_port: None,
        })
    }

    async fn destroy(&self) -> BackendResult<()> {
        // A clone that never started still has to be undefined.
        if let Err(e) = self.virsh(&["destroy", &self.domain]).await {
            debug!("virsh destroy {}: {}", self.domain, e);
        }
        self.virsh(&["undefine", &self.domain, "--remove-all-storage"])
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
        // Clones run sshd; scp is the least surprising way off the box.
        let ip = self.wait_for_ip().await?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // The remote path crosses the remote shell, so quote it.
        let source = format!("{}@{}:{}", self.ssh_user, ip, shell_words::quote(remote));
        run_command(
            "scp",
            &[
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                &source,
                &local.to_string_lossy(),
            ],
        )
        .await
        .map(|_| ())
        .map_err(|e| EndpointError::DownloadFailed(e.to_string()))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Kvm
    }
}

async fn run_command(program: &str, args: &[&str]) -> BackendResult<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| EndpointError::ProvisionFailed(format!("{}: {}", program, e)))?;

    if !output.status.success() {
        return Err(EndpointError::ProvisionFailed(format!(
            "{} {}: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Pull the first IPv4 address out of `virsh domifaddr` output:
///
/// ```text
///  Name       MAC address          Protocol     Address
/// -------------------------------------------------------------
///  vnet0      52:54:00:aa:bb:cc    ipv4         192.168.122.45/24
/// ```
fn parse_domifaddr(output: &str) -> Option<String> {
    for line in output.lines().skip(2) {
        let mut fields = line.split_whitespace();
        let (_name, _mac, protocol, address) =
            (fields.next()?, fields.next()?, fields.next()?, fields.next()?);
        if protocol == "ipv4" {
            return Some(address.split('/').next().unwrap_or(address).to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_domifaddr_output() {
        let output = "\
 Name       MAC address          Protocol     Address
-------------------------------------------------------------
 vnet0      52:54:00:aa:bb:cc    ipv4         192.168.122.45/24
";
        assert_eq!(
            parse_domifaddr(output).as_deref(),
            Some("192.168.122.45")
        );
    }

    #[test]
    fn no_lease_yields_none() {
        let output = "\
 Name       MAC address          Protocol     Address
-------------------------------------------------------------
";
        assert_eq!(parse_domifaddr(output), None);
    }

    #[tokio::test]
    async fn discovery_lists_origin_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("ubuntu-14.04-x64")).unwrap();
        std::fs::create_dir(dir.path().join("centos-7")).unwrap();
        std::fs::write(dir.path().join("not-an-origin.txt"), b"").unwrap();

        let source = KvmSource::new(KvmProviderConfig {
            origins_dir: dir.path().to_path_buf(),
            ..Default::default()
        });

        let mut names: Vec<_> = source
            .discover()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["centos-7", "ubuntu-14.04-x64"]);
    }
}
