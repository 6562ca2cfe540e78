//! Configuration schema definitions for gridpool.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. The schema uses serde for serialization and a
//! tagged enum for backend type selection.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── PoolConfig            - Ports, timeouts, retry budgets
//! ├── Vec<ProviderConfig>   - Tagged enum selecting backend type
//! │   ├── Docker            - Container-backed endpoints
//! │   ├── Kvm               - libvirt clone-backed endpoints
//! │   └── Openstack         - Cloud instance-backed endpoints
//! └── ArtifactsConfig       - Artifact collector settings
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::artifacts::ArtifactSettings;
use crate::matcher::PlatformMatrix;
use crate::pool::PoolSettings;
use crate::proxy::ProxySettings;

/// Root configuration structure for gridpool.
///
/// # TOML Structure
///
/// ```toml
/// [pool]
/// selenium_port = 4455
/// agent_port = 9000
/// get_vm_timeout_secs = 180
///
/// [[provider]]
/// type = "docker"
/// max_count = 10
///
/// [[provider.images]]
/// name = "ubuntu-14.04-x64"
/// image = "selenium/standalone-chrome:3.14"
/// browsers = { chrome = "58.333" }
///
/// [artifacts]
/// dir = "artifacts"
/// workers = 4
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Pool-wide settings (ports, timeouts, retry budgets).
    #[serde(default)]
    pub pool: PoolConfig,

    /// One entry per backend the catalog should discover platforms from.
    #[serde(default)]
    pub provider: Vec<ProviderConfig>,

    /// Static capability matrix (platform type → platform → browsers).
    /// Built from the discovered catalog when left empty.
    #[serde(default)]
    pub platforms: PlatformMatrix,

    /// How this daemon registers itself in the repository.
    #[serde(default)]
    pub provider_meta: ProviderMetaConfig,

    /// Artifact collector settings (optional, has defaults).
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
}

/// Registration identity of this daemon.
///
/// `max_limit` is the active-session cap other components may use for load
/// balancing; 0 derives it from the providers' `max_count` sum.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderMetaConfig {
    #[serde(default = "default_provider_name")]
    pub name: String,

    #[serde(default)]
    pub max_limit: u32,
}

impl Default for ProviderMetaConfig {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            max_limit: 0,
        }
    }
}

fn default_provider_name() -> String {
    "gridpool".to_string()
}

/// Ports, timeouts, and retry budgets shared across the pool, proxy, and
/// endpoint lifecycle.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `selenium_port` | 4455 |
/// | `agent_port` | 9000 |
/// | `ping_timeout_secs` | 180 |
/// | `session_timeout_secs` | 360 |
/// | `get_vm_timeout_secs` | 180 |
/// | `make_request_attempts` | 3 |
/// | `vm_create_check_pause_secs` | 5 |
/// | `vm_create_check_attempts` | 1000 |
/// | `preloader_frequency_secs` | 3 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Port the selenium server listens on inside every endpoint.
    #[serde(default = "default_selenium_port")]
    pub selenium_port: u16,

    /// Port the in-endpoint agent listens on.
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,

    /// How long a freshly provisioned endpoint may take to answer on all
    /// required ports before creation is abandoned.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,

    /// Inactivity budget after which a session is timed out and closed.
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Upper bound on waiting for pool capacity when every slot is taken.
    #[serde(default = "default_get_vm_timeout")]
    pub get_vm_timeout_secs: u64,

    /// Attempt budget for one forwarded request or readiness check.
    #[serde(default = "default_make_request_attempts")]
    pub make_request_attempts: u32,

    /// Pause between backend resource state polls (KVM lease lookups,
    /// Openstack server status).
    #[serde(default = "default_vm_create_check_pause")]
    pub vm_create_check_pause_secs: u64,

    /// How many state polls before giving up on a provisioning resource.
    #[serde(default = "default_vm_create_check_attempts")]
    pub vm_create_check_attempts: u32,

    /// How often the preloader tops warm spares up to their targets.
    #[serde(default = "default_preloader_frequency")]
    pub preloader_frequency_secs: u64,

    /// Script run inside every endpoint (through the agent) between the
    /// status check and the selenium session start.
    pub startup_script: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        // serde's field defaults are authoritative; this mirrors them.
        toml::from_str("").expect("empty PoolConfig must deserialize")
    }
}

impl PoolConfig {
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            get_vm_timeout: Duration::from_secs(self.get_vm_timeout_secs),
            preloader_frequency: Duration::from_secs(self.preloader_frequency_secs),
        }
    }

    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            ping_timeout: Duration::from_secs(self.ping_timeout_secs),
            make_request_attempts: self.make_request_attempts,
        }
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn vm_create_check_pause(&self) -> Duration {
        Duration::from_secs(self.vm_create_check_pause_secs)
    }
}

fn default_selenium_port() -> u16 {
    4455
}

fn default_agent_port() -> u16 {
    9000
}

fn default_ping_timeout() -> u64 {
    180
}

fn default_session_timeout() -> u64 {
    360
}

fn default_get_vm_timeout() -> u64 {
    180
}

fn default_make_request_attempts() -> u32 {
    3
}

fn default_vm_create_check_pause() -> u64 {
    5
}

fn default_vm_create_check_attempts() -> u32 {
    1000
}

fn default_preloader_frequency() -> u64 {
    3
}

/// Backend configuration specifying where endpoints are provisioned.
///
/// This is a tagged enum that selects the backend based on the `type`
/// field in TOML. A config may carry several entries; the catalog merges
/// their discovered platforms.
///
/// # Example
///
/// ```toml
/// [[provider]]
/// type = "docker"
/// max_count = 10
///
/// [[provider]]
/// type = "kvm"
/// origins_dir = "/var/lib/libvirt/origins"
/// max_count = 4
///
/// [[provider]]
/// type = "openstack"
/// flavor = "m1.medium"
/// image_prefix = "selenium-"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// Endpoints as Docker containers.
    Docker(DockerProviderConfig),

    /// Endpoints as KVM clones of origin domains, via libvirt.
    Kvm(KvmProviderConfig),

    /// Endpoints as Openstack instances.
    Openstack(OpenstackProviderConfig),
}

impl ProviderConfig {
    /// Warm-spare targets for this backend's platforms.
    pub fn preloaded(&self) -> &HashMap<String, u32> {
        match self {
            ProviderConfig::Docker(c) => &c.preloaded,
            ProviderConfig::Kvm(c) => &c.preloaded,
            ProviderConfig::Openstack(c) => &c.preloaded,
        }
    }
}

/// Configuration for the Docker backend.
///
/// Each configured image is one platform; containers are addressed by
/// their network IP, so no host-port publishing happens.
///
/// # Example
///
/// ```toml
/// [[provider]]
/// type = "docker"
/// network_mode = "bridge"
/// max_count = 10
/// preloaded = { "ubuntu-14.04-x64" = 2 }
///
/// [[provider.images]]
/// name = "ubuntu-14.04-x64"
/// image = "selenium/standalone-chrome:3.14"
/// browsers = { chrome = "58.333" }
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DockerProviderConfig {
    /// Docker daemon address. Local socket when unset.
    pub docker_host: Option<String>,

    /// Platform catalog for this backend.
    #[serde(default)]
    pub images: Vec<DockerImage>,

    /// Network the containers join.
    #[serde(default = "default_network_mode")]
    pub network_mode: String,

    /// Environment variables set in every container.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Capacity limit across all platforms of this backend. 0 = unbounded.
    #[serde(default)]
    pub max_count: u32,

    /// platform name -> warm-spare target.
    #[serde(default)]
    pub preloaded: HashMap<String, u32>,
}

fn default_network_mode() -> String {
    "bridge".to_string()
}

/// One platform image for the Docker backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DockerImage {
    /// Platform name as requested in desired capabilities.
    pub name: String,

    /// Image reference to create containers from.
    pub image: String,

    /// browser name -> version, for capability matching.
    #[serde(default)]
    pub browsers: HashMap<String, String>,
}

/// Configuration for the KVM backend.
///
/// Origin domains live under `origins_dir`, one subdirectory per
/// platform; clones are made with `virt-clone` and addressed through
/// their DHCP lease.
///
/// # Example
///
/// ```toml
/// [[provider]]
/// type = "kvm"
/// origins_dir = "/var/lib/libvirt/origins"
/// connection_uri = "qemu:///system"
/// ssh_user = "root"
/// max_count = 4
///
/// [provider.platforms.ubuntu-1404-x64]
/// chrome = "58.333"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KvmProviderConfig {
    /// Directory of origin domain definitions; each subdirectory is a
    /// platform.
    pub origins_dir: PathBuf,

    /// libvirt connection URI.
    #[serde(default = "default_connection_uri")]
    pub connection_uri: String,

    /// User for scp-based artifact downloads off the clones.
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,

    /// Capacity limit across all platforms of this backend. 0 = unbounded.
    #[serde(default)]
    pub max_count: u32,

    /// platform name -> {browser name -> version}, since origin domains
    /// carry no browser metadata of their own.
    #[serde(default)]
    pub platforms: HashMap<String, HashMap<String, String>>,

    /// platform name -> warm-spare target.
    #[serde(default)]
    pub preloaded: HashMap<String, u32>,
}

impl Default for KvmProviderConfig {
    fn default() -> Self {
        Self {
            origins_dir: PathBuf::new(),
            connection_uri: default_connection_uri(),
            ssh_user: default_ssh_user(),
            max_count: 0,
            platforms: HashMap::new(),
            preloaded: HashMap::new(),
        }
    }
}

fn default_connection_uri() -> String {
    "qemu:///system".to_string()
}

fn default_ssh_user() -> String {
    "root".to_string()
}

/// Configuration for the Openstack backend.
///
/// Credentials come from the usual `OS_*` environment; instances are
/// created from images whose names carry `image_prefix`.
///
/// # Example
///
/// ```toml
/// [[provider]]
/// type = "openstack"
/// flavor = "m1.medium"
/// network = "selenium-net"
/// image_prefix = "selenium-"
/// max_count = 8
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OpenstackProviderConfig {
    /// Flavor every instance is created with.
    #[serde(default)]
    pub flavor: String,

    /// Network to attach instances to. Provider default when unset.
    pub network: Option<String>,

    /// Only images whose name starts with this become platforms.
    pub image_prefix: Option<String>,

    /// Capacity limit across all platforms of this backend. 0 = unbounded.
    #[serde(default)]
    pub max_count: u32,

    /// platform name -> warm-spare target.
    #[serde(default)]
    pub preloaded: HashMap<String, u32>,
}

/// Artifact collector settings.
///
/// # Example
///
/// ```toml
/// [artifacts]
/// dir = "artifacts"
/// workers = 4
/// wait_timeout_secs = 120
/// screencast_interval_secs = 1
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArtifactsConfig {
    /// Local directory artifacts are written under, one subdir per session.
    #[serde(default = "default_artifacts_dir")]
    pub dir: PathBuf,

    /// Worker pool size.
    #[serde(default = "default_artifact_workers")]
    pub workers: usize,

    /// Upper bound on waiting for a session's artifact tasks before
    /// endpoint reclamation proceeds anyway.
    #[serde(default = "default_artifact_wait_timeout")]
    pub wait_timeout_secs: u64,

    /// Poll interval of the screencast recording loop.
    #[serde(default = "default_screencast_interval")]
    pub screencast_interval_secs: u64,

    /// External capture command started for sessions that ask for a
    /// screencast. `{host}`, `{port}` and `{output}` are substituted.
    /// Screencasts are skipped entirely when unset.
    pub screencast_command: Option<String>,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty ArtifactsConfig must deserialize")
    }
}

impl ArtifactsConfig {
    pub fn settings(&self) -> ArtifactSettings {
        ArtifactSettings {
            dir: self.dir.clone(),
            workers: self.workers,
            wait_timeout: Duration::from_secs(self.wait_timeout_secs),
            screencast_interval: Duration::from_secs(self.screencast_interval_secs),
        }
    }
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_artifact_workers() -> usize {
    4
}

fn default_artifact_wait_timeout() -> u64 {
    120
}

fn default_screencast_interval() -> u64 {
    1
}
