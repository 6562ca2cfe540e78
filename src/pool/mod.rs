//! The capacity-bounded endpoint allocator.
//!
//! [`EndpointPool`] tracks every endpoint by state partition
//! {pool, using, on_service}, enforces per-platform capacity from the
//! catalog, and serves get-or-create requests. The partition membership
//! check-and-reserve step runs under a single pool-wide lock; the slow
//! parts (provisioning, ping loops) run outside it, so concurrent
//! allocations of different endpoints proceed in parallel but never race
//! on the capacity check.

pub mod preloader;
pub mod remover;

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::endpoint::{
    Endpoint, EndpointFactory, EndpointMode, ONDEMAND_PREFIX, PRELOADED_PREFIX,
};
use crate::error::CreationError;
use crate::platform::PlatformCatalog;

pub use remover::RemovalRequest;

/// Pool timing and port knobs.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub get_vm_timeout: Duration,
    pub preloader_frequency: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            get_vm_timeout: Duration::from_secs(180),
            preloader_frequency: Duration::from_secs(3),
        }
    }
}

#[derive(Default)]
struct PoolState {
    /// Ready spares, in creation order (newest last).
    pool: Vec<Arc<Endpoint>>,
    using: Vec<Arc<Endpoint>>,
    on_service: Vec<Arc<Endpoint>>,
}

impl PoolState {
    fn count(&self, platform: &str) -> u32 {
        self.pool
            .iter()
            .chain(self.using.iter())
            .chain(self.on_service.iter())
            .filter(|e| e.platform == platform && !e.is_deleted())
            .count() as u32
    }

    fn forget(&mut self, uuid: Uuid) {
        self.pool.retain(|e| e.uuid != uuid);
        self.using.retain(|e| e.uuid != uuid);
        self.on_service.retain(|e| e.uuid != uuid);
    }
}

/// The endpoint allocator. One instance per provider process, injected
/// into every worker and request handler.
pub struct EndpointPool {
    catalog: Arc<PlatformCatalog>,
    factory: Arc<dyn EndpointFactory>,
    settings: PoolSettings,
    state: Mutex<PoolState>,
    removed_tx: mpsc::UnboundedSender<Uuid>,
    removal_queue: mpsc::UnboundedSender<RemovalRequest>,
}

impl EndpointPool {
    /// Build the pool and start its removal-notification drain task.
    ///
    /// The returned receiver feeds the [`remover::EndpointRemover`]
    /// worker with endpoints whose sessions have ended.
    pub fn start(
        catalog: Arc<PlatformCatalog>,
        factory: Arc<dyn EndpointFactory>,
        settings: PoolSettings,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RemovalRequest>) {
        let (removed_tx, mut removed_rx) = mpsc::unbounded_channel();
        let (removal_tx, removal_rx) = mpsc::unbounded_channel();

        let pool = Arc::new(Self {
            catalog,
            factory,
            settings,
            state: Mutex::new(PoolState::default()),
            removed_tx,
            removal_queue: removal_tx,
        });

        // Drain deletion notifications from endpoints; this is the only
        // path that drops bookkeeping for deleted endpoints.
        let weak: Weak<EndpointPool> = Arc::downgrade(&pool);
        tokio::spawn(async move {
            while let Some(uuid) = removed_rx.recv().await {
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                pool.forget(uuid);
            }
        });

        (pool, removal_rx)
    }

    pub fn catalog(&self) -> &PlatformCatalog {
        &self.catalog
    }

    /// Whether another endpoint of the platform fits under the capacity
    /// limit.
    pub fn can_produce(&self, platform: &str) -> bool {
        let count = self.state.lock().unwrap().count(platform);
        self.catalog.get_limit(platform).allows(count)
    }

    /// Total endpoints of the platform across all partitions.
    pub fn total_count(&self, platform: &str) -> u32 {
        self.state.lock().unwrap().count(platform)
    }

    /// Ready spares of the platform.
    pub fn pool_count(&self, platform: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .pool
            .iter()
            .filter(|e| e.platform == platform && !e.is_deleted())
            .count() as u32
    }

    pub fn in_use_count(&self, platform: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .using
            .iter()
            .filter(|e| e.platform == platform && !e.is_deleted())
            .count() as u32
    }

    /// Allocate a fresh endpoint for the platform.
    ///
    /// The capacity check and partition reservation happen atomically
    /// under the pool lock; provisioning happens after release so slow
    /// backends don't serialize all allocation. Returns `None` without
    /// side effects when capacity is exhausted, and `None` after cleanup
    /// when provisioning fails; never propagates backend errors.
    pub async fn add(&self, platform_name: &str, prefix: &str) -> Option<Arc<Endpoint>> {
        let Some(platform) = self.catalog.get(platform_name).cloned() else {
            warn!("add() for unknown platform {}", platform_name);
            return None;
        };

        let endpoint = {
            let mut state = self.state.lock().unwrap();
            if !self
                .catalog
                .get_limit(platform_name)
                .allows(state.count(platform_name))
            {
                debug!("capacity exhausted for {}", platform_name);
                return None;
            }

            let endpoint = match self.factory.make(&platform, prefix, self.removed_tx.clone()) {
                Ok(endpoint) => Arc::new(endpoint),
                Err(e) => {
                    warn!("no backend available for {}: {}", platform_name, e);
                    return None;
                }
            };
            if prefix == PRELOADED_PREFIX {
                state.pool.push(endpoint.clone());
            } else {
                endpoint.set_in_use(true);
                state.using.push(endpoint.clone());
            }
            endpoint
        };

        match endpoint.create().await {
            Ok(()) => Some(endpoint),
            Err(e) => {
                warn!("creation of {} failed: {}", endpoint.name, e);
                // create() already deleted the endpoint and notified the
                // drain task; drop bookkeeping promptly anyway.
                self.forget(endpoint.uuid);
                None
            }
        }
    }

    /// Keep a warm spare for the platform.
    pub async fn preload(&self, platform_name: &str) -> Option<Arc<Endpoint>> {
        self.add(platform_name, PRELOADED_PREFIX).await
    }

    /// Take a ready endpoint from the pool partition, preferring the most
    /// recently created (warm caches, fresh clone state). Reachability is
    /// re-verified outside the lock; an unreachable endpoint is deleted
    /// and `None` returned so the caller can allocate fresh.
    pub async fn get_by_platform(&self, platform_name: &str) -> Option<Arc<Endpoint>> {
        let endpoint = {
            let mut state = self.state.lock().unwrap();
            let pos = state
                .pool
                .iter()
                .rposition(|e| e.platform == platform_name && e.is_ready() && !e.is_deleted())?;
            let endpoint = state.pool.remove(pos);
            endpoint.set_in_use(true);
            state.using.push(endpoint.clone());
            endpoint
        };

        if endpoint.ping().await {
            info!("got endpoint {} from pool", endpoint.name);
            Some(endpoint)
        } else {
            warn!("pooled endpoint {} unreachable, deleting", endpoint.name);
            let _ = endpoint.delete(false).await;
            self.forget(endpoint.uuid);
            None
        }
    }

    /// One allocation attempt: pooled endpoint first, fresh one second.
    pub async fn get_vm(&self, platform_name: &str) -> Option<Arc<Endpoint>> {
        if let Some(endpoint) = self.get_by_platform(platform_name).await {
            return Some(endpoint);
        }
        self.add(platform_name, ONDEMAND_PREFIX).await
    }

    /// Poll [`get_vm`](Self::get_vm) with linearly increasing backoff
    /// until an endpoint is ready or `get_vm_timeout` elapses.
    pub async fn wait_for_vm(&self, platform_name: &str) -> Result<Arc<Endpoint>, CreationError> {
        let deadline = Instant::now() + self.settings.get_vm_timeout;
        let mut delay = Duration::from_millis(500);

        loop {
            if let Some(endpoint) = self.get_vm(platform_name).await {
                return Ok(endpoint);
            }
            if Instant::now() >= deadline {
                return Err(CreationError::GetVmTimeout {
                    platform: platform_name.to_string(),
                    timeout_secs: self.settings.get_vm_timeout.as_secs(),
                });
            }

            let jitter = rand::thread_rng().gen_range(0..100);
            tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
            delay = (delay + Duration::from_millis(500)).min(Duration::from_secs(5));
        }
    }

    /// Soft-remove an endpoint from active use: move it to the on-service
    /// partition and queue it for artifact collection + reclamation.
    pub fn stop_using(&self, endpoint_uuid: Uuid, session_id: Uuid) {
        let endpoint = {
            let mut state = self.state.lock().unwrap();
            let from_using = state
                .using
                .iter()
                .position(|e| e.uuid == endpoint_uuid)
                .map(|pos| state.using.remove(pos));
            let endpoint = from_using.or_else(|| {
                state
                    .pool
                    .iter()
                    .position(|e| e.uuid == endpoint_uuid)
                    .map(|pos| state.pool.remove(pos))
            });
            let Some(endpoint) = endpoint else {
                warn!("stop_using for unknown endpoint {}", endpoint_uuid);
                return;
            };
            endpoint.set_in_use(false);
            endpoint.set_mode(EndpointMode::WaitForService);
            state.on_service.push(endpoint.clone());
            endpoint
        };

        if self
            .removal_queue
            .send(RemovalRequest {
                endpoint,
                session_id,
            })
            .is_err()
        {
            warn!("endpoint remover is gone, {} will leak until shutdown", endpoint_uuid);
        }
    }

    /// Return a rebuilt preloaded endpoint to the warm pool.
    pub fn return_to_pool(&self, endpoint: &Arc<Endpoint>) {
        if endpoint.is_deleted() || !endpoint.is_ready() {
            return;
        }
        endpoint.set_mode(EndpointMode::Default);
        let mut state = self.state.lock().unwrap();
        state.forget(endpoint.uuid);
        state.pool.push(endpoint.clone());
    }

    /// Drop all bookkeeping for an endpoint.
    pub fn forget(&self, uuid: Uuid) {
        self.state.lock().unwrap().forget(uuid);
    }

    /// Snapshot of every live endpoint, for the status surface.
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        let state = self.state.lock().unwrap();
        state
            .pool
            .iter()
            .chain(state.using.iter())
            .chain(state.on_service.iter())
            .cloned()
            .collect()
    }

    /// Delete every endpoint. Called on shutdown.
    pub async fn free_endpoints(&self) {
        let endpoints = {
            let mut state = self.state.lock().unwrap();
            let mut all = Vec::new();
            all.append(&mut state.pool);
            all.append(&mut state.using);
            all.append(&mut state.on_service);
            all
        };

        for endpoint in endpoints {
            if let Err(e) = endpoint.delete(false).await {
                warn!("failed to delete {} during shutdown: {}", endpoint.name, e);
            }
        }
        info!("pool drained");
    }
}
