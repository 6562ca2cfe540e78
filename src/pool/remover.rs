//! Deferred endpoint reclamation.
//!
//! Endpoints leave active use via [`EndpointPool::stop_using`], which only
//! queues a [`RemovalRequest`] here. The remover drains artifact
//! collection for the session first, then deletes the endpoint with
//! rebuild allowed, so preloaded endpoints come back as warm spares
//! instead of shrinking the pool.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifacts::ArtifactCollector;
use crate::endpoint::{Endpoint, EndpointMode};

use super::EndpointPool;

pub struct RemovalRequest {
    pub endpoint: Arc<Endpoint>,
    pub session_id: Uuid,
}

pub struct EndpointRemover {
    pool: Arc<EndpointPool>,
    collector: Arc<ArtifactCollector>,
}

impl EndpointRemover {
    pub fn new(pool: Arc<EndpointPool>, collector: Arc<ArtifactCollector>) -> Self {
        Self { pool, collector }
    }

    pub fn spawn(
        self,
        mut rx: mpsc::UnboundedReceiver<RemovalRequest>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    request = rx.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };
                self.reclaim(request).await;
            }
            // Finish whatever is already queued before stopping.
            while let Ok(request) = rx.try_recv() {
                self.reclaim(request).await;
            }
            debug!("endpoint remover stopped");
        })
    }

    /// Artifacts first, deletion second. A session's files live on the
    /// endpoint, so the order is load-bearing.
    async fn reclaim(&self, request: RemovalRequest) {
        let RemovalRequest {
            endpoint,
            session_id,
        } = request;

        endpoint.set_mode(EndpointMode::Service);
        self.collector.wait_for_complete(session_id).await;

        match endpoint.delete(true).await {
            Ok(()) => {
                if endpoint.is_deleted() {
                    info!("endpoint {} reclaimed", endpoint.name);
                } else {
                    // Preloaded endpoint was rebuilt in place.
                    self.pool.return_to_pool(&endpoint);
                    info!("endpoint {} rebuilt and returned to pool", endpoint.name);
                }
            }
            Err(e) => {
                warn!("reclaiming {} failed: {}", endpoint.name, e);
                self.pool.forget(endpoint.uuid);
            }
        }
    }
}
