//! Background top-up of warm spares.
//!
//! Every tick the preloader compares the pool partition against the
//! configured per-platform targets and allocates the shortfall. Capacity
//! checks live in [`EndpointPool::preload`], so a platform whose limit is
//! already consumed by active sessions simply stays below target until
//! slots free up.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::EndpointPool;

pub struct Preloader {
    pool: Arc<EndpointPool>,
    /// platform name -> desired warm-spare count
    targets: HashMap<String, u32>,
}

impl Preloader {
    pub fn new(pool: Arc<EndpointPool>, targets: HashMap<String, u32>) -> Self {
        Self { pool, targets }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let frequency = self.pool.settings.preloader_frequency;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(frequency) => self.tick().await,
                }
            }
            debug!("preloader stopped");
        })
    }

    async fn tick(&self) {
        for (platform, &target) in &self.targets {
            let have = self.pool.pool_count(platform);
            for _ in have..target {
                if self.pool.preload(platform).await.is_none() {
                    // Out of capacity or allocation failed; retry next tick.
                    warn!("preload of {} fell short of target {}", platform, target);
                    break;
                }
            }
        }
    }
}
