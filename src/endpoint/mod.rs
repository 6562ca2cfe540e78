//! Endpoints and the backend capability trait they are provisioned through.
//!
//! An [`Endpoint`] is one allocated compute resource (container, KVM clone
//! or cloud instance) backing one session at a time. The backend-specific
//! cloning mechanics live behind the [`Backend`] trait; the lifecycle
//! state machine (provisioning → ready → {in_use ⇄ pool} → on_service →
//! deleted) lives here and is driven only by the pool and by the
//! endpoint's own create/delete/rebuild.

pub mod docker;
pub mod kvm;
pub mod openstack;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{
    Config, DockerProviderConfig, KvmProviderConfig, OpenstackProviderConfig, PoolConfig,
    ProviderConfig,
};
use crate::platform::BackendKind;

/// Prefix for endpoints allocated directly for a session.
pub const ONDEMAND_PREFIX: &str = "ondemand";
/// Prefix for warm spares created ahead of demand. Preloaded endpoints are
/// rebuilt in place on release instead of destroyed.
pub const PRELOADED_PREFIX: &str = "preloaded";

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, EndpointError>;

/// Errors crossing the endpoint/backend boundary.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("failed to provision endpoint: {0}")]
    ProvisionFailed(String),

    #[error("failed to destroy endpoint: {0}")]
    DestroyFailed(String),

    #[error("failed to rebuild endpoint: {0}")]
    RebuildFailed(String),

    #[error("endpoint {name} not ready within {timeout_secs}s")]
    ReadyTimeout { name: String, timeout_secs: u64 },

    #[error("failed to execute in endpoint: {0}")]
    ExecFailed(String),

    #[error("failed to download from endpoint: {0}")]
    DownloadFailed(String),

    #[error("endpoint has no address yet")]
    NotProvisioned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Network address of a provisioned endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddr {
    pub ip: String,
    pub selenium_port: u16,
    pub agent_port: u16,
    pub vnc_port: Option<u16>,
}

/// Backend capability interface: the `make_clone` boundary.
///
/// One implementation per backend kind; selected by the factory keyed on
/// the platform's backend. Hypervisor/cloud mechanics stay behind this
/// trait.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Provision the underlying resource and return its address.
    async fn provision(&self) -> BackendResult<EndpointAddr>;

    /// Free the underlying resource.
    async fn destroy(&self) -> BackendResult<()>;

    /// Destroy and recreate the resource in place, retaining the slot.
    async fn recreate(&self) -> BackendResult<EndpointAddr>;

    /// Fetch a file from inside the endpoint into a local path.
    async fn download_file(&self, remote: &str, local: &std::path::Path) -> BackendResult<()>;

    fn kind(&self) -> BackendKind;
}

/// Endpoint mode. `WaitForService` means soft-removed from the active
/// pool and queued for reclamation; `Service` means the remover picked it
/// up and is draining its artifacts before freeing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointMode {
    Default,
    WaitForService,
    Service,
}

#[derive(Debug)]
struct EndpointFlags {
    ready: bool,
    in_use: bool,
    deleted: bool,
    mode: EndpointMode,
    addr: Option<EndpointAddr>,
    used: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
    store_id: Option<i64>,
}

/// One allocated compute resource.
pub struct Endpoint {
    pub uuid: Uuid,
    pub name: String,
    pub platform: String,
    pub prefix: String,
    pub created: DateTime<Utc>,
    ping_timeout: Duration,
    flags: Mutex<EndpointFlags>,
    backend: Box<dyn Backend>,
    /// Typed removal notifications back to the pool; replaces any global
    /// dispatcher.
    removed_tx: mpsc::UnboundedSender<Uuid>,
}

impl Endpoint {
    pub fn new(
        platform: impl Into<String>,
        prefix: impl Into<String>,
        backend: Box<dyn Backend>,
        ping_timeout: Duration,
        removed_tx: mpsc::UnboundedSender<Uuid>,
    ) -> Self {
        Self::with_uuid(Uuid::new_v4(), platform, prefix, backend, ping_timeout, removed_tx)
    }

    /// Constructor with a caller-chosen uuid, for factories that need the
    /// endpoint name (which embeds the uuid) before building the backend.
    pub fn with_uuid(
        uuid: Uuid,
        platform: impl Into<String>,
        prefix: impl Into<String>,
        backend: Box<dyn Backend>,
        ping_timeout: Duration,
        removed_tx: mpsc::UnboundedSender<Uuid>,
    ) -> Self {
        let platform = platform.into();
        let prefix = prefix.into();
        Self {
            name: format!("{}-{}-{}", platform, prefix, uuid),
            uuid,
            platform,
            prefix,
            created: Utc::now(),
            ping_timeout,
            flags: Mutex::new(EndpointFlags {
                ready: false,
                in_use: false,
                deleted: false,
                mode: EndpointMode::Default,
                addr: None,
                used: None,
                deleted_at: None,
                store_id: None,
            }),
            backend,
            removed_tx,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.flags.lock().unwrap().ready
    }

    pub fn is_in_use(&self) -> bool {
        self.flags.lock().unwrap().in_use
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.lock().unwrap().deleted
    }

    pub fn mode(&self) -> EndpointMode {
        self.flags.lock().unwrap().mode
    }

    pub fn is_preloaded(&self) -> bool {
        self.prefix == PRELOADED_PREFIX
    }

    pub fn addr(&self) -> Option<EndpointAddr> {
        self.flags.lock().unwrap().addr.clone()
    }

    pub fn store_id(&self) -> Option<i64> {
        self.flags.lock().unwrap().store_id
    }

    pub fn set_store_id(&self, id: i64) {
        self.flags.lock().unwrap().store_id = Some(id);
    }

    pub(crate) fn set_in_use(&self, in_use: bool) {
        let mut flags = self.flags.lock().unwrap();
        flags.in_use = in_use;
        if in_use {
            flags.used = Some(Utc::now());
        }
    }

    pub(crate) fn set_mode(&self, mode: EndpointMode) {
        self.flags.lock().unwrap().mode = mode;
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Provision the resource and wait until it answers on all required
    /// ports. `ready` is set only after that. On any failure the endpoint
    /// deletes itself and the error propagates to the caller.
    pub async fn create(&self) -> Result<(), EndpointError> {
        info!("creating endpoint {}", self.name);

        let addr = match self.backend.provision().await {
            Ok(addr) => addr,
            Err(e) => {
                warn!("provisioning {} failed: {}", self.name, e);
                let _ = self.destroy_and_notify().await;
                return Err(e);
            }
        };
        self.flags.lock().unwrap().addr = Some(addr);

        if !self.ping().await {
            let _ = self.destroy_and_notify().await;
            return Err(EndpointError::ReadyTimeout {
                name: self.name.clone(),
                timeout_secs: self.ping_timeout.as_secs(),
            });
        }

        self.flags.lock().unwrap().ready = true;
        info!("endpoint {} is ready", self.name);
        Ok(())
    }

    /// Reclaim the endpoint.
    ///
    /// Preloaded endpoints with `try_to_rebuild` are rebuilt in place so
    /// the warm-pool inventory keeps its size. Everything else frees the
    /// resource; bookkeeping removal is notified to the pool even when the
    /// underlying free call fails.
    pub async fn delete(&self, try_to_rebuild: bool) -> Result<(), EndpointError> {
        if self.is_deleted() {
            return Ok(());
        }
        if try_to_rebuild && self.is_preloaded() {
            return self.rebuild().await;
        }
        self.destroy_and_notify().await
    }

    /// Destroy and recreate the resource in place, retaining platform,
    /// name and slot. On failure the endpoint falls back to a plain
    /// delete.
    pub async fn rebuild(&self) -> Result<(), EndpointError> {
        info!("rebuilding endpoint {}", self.name);
        {
            let mut flags = self.flags.lock().unwrap();
            flags.ready = false;
            flags.in_use = false;
            flags.mode = EndpointMode::Default;
        }

        let addr = match self.backend.recreate().await {
            Ok(addr) => addr,
            Err(e) => {
                warn!("rebuild of {} failed ({}), deleting instead", self.name, e);
                let _ = self.destroy_and_notify().await;
                return Err(e);
            }
        };
        self.flags.lock().unwrap().addr = Some(addr);

        if !self.ping().await {
            warn!("rebuilt endpoint {} never became reachable, deleting", self.name);
            let _ = self.destroy_and_notify().await;
            return Err(EndpointError::ReadyTimeout {
                name: self.name.clone(),
                timeout_secs: self.ping_timeout.as_secs(),
            });
        }

        self.flags.lock().unwrap().ready = true;
        info!("endpoint {} rebuilt", self.name);
        Ok(())
    }

    /// Poll the selenium and agent ports until both answer or the ping
    /// timeout elapses. Returns the conjunction of per-port reachability.
    pub async fn ping(&self) -> bool {
        let deadline = Instant::now() + self.ping_timeout;

        loop {
            if self.ping_once().await {
                return true;
            }
            if Instant::now() >= deadline {
                debug!("ping of {} timed out", self.name);
                return false;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Single reachability probe: all required ports must answer.
    pub async fn ping_once(&self) -> bool {
        let Some(addr) = self.addr() else {
            return false;
        };
        for port in [addr.selenium_port, addr.agent_port] {
            if !port_is_open(&addr.ip, port).await {
                return false;
            }
        }
        true
    }

    /// Free the resource and always push the removal notification,
    /// regardless of whether the free call succeeded.
    ///
    /// The `deleted` flag is latched before the backend call, so two
    /// concurrent deleters destroy the resource exactly once.
    async fn destroy_and_notify(&self) -> Result<(), EndpointError> {
        {
            let mut flags = self.flags.lock().unwrap();
            if flags.deleted {
                return Ok(());
            }
            flags.ready = false;
            flags.in_use = false;
            flags.deleted = true;
            flags.deleted_at = Some(Utc::now());
        }

        let result = self.backend.destroy().await;
        if let Err(ref e) = result {
            warn!("destroying {} failed: {}", self.name, e);
        }

        let _ = self.removed_tx.send(self.uuid);
        info!("endpoint {} deleted", self.name);
        result
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("platform", &self.platform)
            .field("ready", &self.is_ready())
            .field("in_use", &self.is_in_use())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

async fn port_is_open(ip: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            Duration::from_secs(2),
            TcpStream::connect((ip, port)),
        )
        .await,
        Ok(Ok(_))
    )
}

/// Builds endpoints for a platform; the concrete backend is selected by
/// the platform's backend kind.
pub trait EndpointFactory: Send + Sync {
    fn make(
        &self,
        platform: &crate::platform::Platform,
        prefix: &str,
        removed_tx: mpsc::UnboundedSender<Uuid>,
    ) -> anyhow::Result<Endpoint>;
}

/// Production factory: picks the backend implementation by the platform's
/// backend kind, wired from the loaded config.
pub struct ConfiguredEndpointFactory {
    pool: PoolConfig,
    docker: Option<DockerProviderConfig>,
    kvm: Option<KvmProviderConfig>,
    openstack: Option<OpenstackProviderConfig>,
}

impl ConfiguredEndpointFactory {
    pub fn from_config(config: &Config) -> Self {
        let mut docker = None;
        let mut kvm = None;
        let mut openstack = None;
        for provider in &config.provider {
            match provider {
                ProviderConfig::Docker(c) => docker = Some(c.clone()),
                ProviderConfig::Kvm(c) => kvm = Some(c.clone()),
                ProviderConfig::Openstack(c) => openstack = Some(c.clone()),
            }
        }
        Self {
            pool: config.pool.clone(),
            docker,
            kvm,
            openstack,
        }
    }
}

impl EndpointFactory for ConfiguredEndpointFactory {
    fn make(
        &self,
        platform: &crate::platform::Platform,
        prefix: &str,
        removed_tx: mpsc::UnboundedSender<Uuid>,
    ) -> anyhow::Result<Endpoint> {
        use anyhow::Context;

        let uuid = Uuid::new_v4();
        let name = format!("{}-{}-{}", platform.name, prefix, uuid);
        let selenium_port = self.pool.selenium_port;
        let agent_port = self.pool.agent_port;

        let backend: Box<dyn Backend> = match platform.kind {
            BackendKind::Docker => {
                let config = self
                    .docker
                    .as_ref()
                    .context("no docker backend configured")?;
                let image = config
                    .images
                    .iter()
                    .find(|image| image.name == platform.name)
                    .with_context(|| format!("no docker image for platform {}", platform.name))?;
                Box::new(docker::DockerBackend::new(
                    config,
                    &name,
                    &image.image,
                    selenium_port,
                    agent_port,
                )?)
            }
            BackendKind::Kvm => {
                let config = self.kvm.as_ref().context("no kvm backend configured")?;
                Box::new(kvm::KvmBackend::new(
                    config,
                    &platform.name,
                    &name,
                    self.pool.vm_create_check_pause(),
                    self.pool.vm_create_check_attempts,
                    selenium_port,
                    agent_port,
                ))
            }
            BackendKind::Openstack => {
                let config = self
                    .openstack
                    .as_ref()
                    .context("no openstack backend configured")?;
                Box::new(openstack::OpenstackBackend::new(
                    config,
                    &platform.name,
                    &name,
                    self.pool.vm_create_check_pause(),
                    self.pool.vm_create_check_attempts,
                    selenium_port,
                    agent_port,
                ))
            }
        };

        Ok(Endpoint::with_uuid(
            uuid,
            &platform.name,
            prefix,
            backend,
            self.pool.ping_timeout(),
            removed_tx,
        ))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fakes for pool/proxy tests.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    /// A backend that never touches real infrastructure.
    pub struct FakeBackend {
        pub provisioned: AtomicU32,
        pub destroyed: AtomicU32,
        pub recreated: AtomicU32,
        pub fail_provision: AtomicBool,
        pub fail_recreate: AtomicBool,
        pub addr: EndpointAddr,
    }

    impl Default for FakeBackend {
        fn default() -> Self {
            Self::with_addr(fake_addr())
        }
    }

    impl FakeBackend {
        pub fn with_addr(addr: EndpointAddr) -> Self {
            Self {
                provisioned: AtomicU32::new(0),
                destroyed: AtomicU32::new(0),
                recreated: AtomicU32::new(0),
                fail_provision: AtomicBool::new(false),
                fail_recreate: AtomicBool::new(false),
                addr,
            }
        }

        pub fn failing_provision() -> Self {
            let backend = Self::default();
            backend.fail_provision.store(true, Ordering::SeqCst);
            backend
        }
    }

    #[async_trait]
    impl Backend for Arc<FakeBackend> {
        async fn provision(&self) -> BackendResult<EndpointAddr> {
            if self.fail_provision.load(Ordering::SeqCst) {
                return Err(EndpointError::ProvisionFailed("fake failure".to_string()));
            }
            self.provisioned.fetch_add(1, Ordering::SeqCst);
            Ok(self.addr.clone())
        }

        async fn destroy(&self) -> BackendResult<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn recreate(&self) -> BackendResult<EndpointAddr> {
            if self.fail_recreate.load(Ordering::SeqCst) {
                return Err(EndpointError::RebuildFailed("fake failure".to_string()));
            }
            self.recreated.fetch_add(1, Ordering::SeqCst);
            Ok(self.addr.clone())
        }

        async fn download_file(&self, _remote: &str, _local: &std::path::Path) -> BackendResult<()> {
            Ok(())
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Docker
        }
    }

    pub fn fake_addr() -> EndpointAddr {
        EndpointAddr {
            ip: "127.0.0.1".to_string(),
            selenium_port: 4455,
            agent_port: 9000,
            vnc_port: None,
        }
    }
}
