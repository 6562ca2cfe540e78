//! Narrow repository interface over the persisted store.
//!
//! The relational store itself is an external collaborator; the core only
//! needs provider registration, filtered endpoint listing and
//! session-by-id lookup. The in-memory implementation backs tests and
//! single-process deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Endpoint state partition, as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStateFilter {
    All,
    Pool,
    Using,
    OnService,
    Deleted,
}

/// Persisted endpoint row.
#[derive(Debug, Clone)]
pub struct EndpointRecord {
    pub store_id: Option<i64>,
    pub uuid: Uuid,
    pub name: String,
    pub platform: String,
    pub provider_id: i64,
    pub ready: bool,
    pub in_use: bool,
    pub on_service: bool,
    pub deleted: bool,
    pub created: DateTime<Utc>,
}

impl EndpointRecord {
    fn matches(&self, filter: EndpointStateFilter) -> bool {
        match filter {
            EndpointStateFilter::All => !self.deleted,
            EndpointStateFilter::Pool => {
                self.ready && !self.in_use && !self.on_service && !self.deleted
            }
            EndpointStateFilter::Using => self.in_use && !self.deleted,
            EndpointStateFilter::OnService => self.on_service && !self.deleted,
            EndpointStateFilter::Deleted => self.deleted,
        }
    }
}

/// Persisted session row (the subset the core reads back).
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: Uuid,
    pub platform: String,
    pub status: String,
    pub endpoint: Option<Uuid>,
}

/// Registered provider row.
#[derive(Debug, Clone)]
pub struct ProviderRecord {
    pub id: i64,
    pub name: String,
    /// Active-session cap used by the matcher's load balancing; 0 means
    /// unbounded.
    pub max_limit: u32,
    pub active: bool,
}

/// The repository seam the core talks through.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn register_provider(&self, name: &str, max_limit: u32) -> anyhow::Result<i64>;

    /// Best-effort shutdown cleanup; advisory, not transactional.
    async fn unregister_provider(&self, provider_id: i64) -> anyhow::Result<()>;

    async fn providers(&self) -> anyhow::Result<Vec<ProviderRecord>>;

    async fn add_endpoint(&self, record: EndpointRecord) -> anyhow::Result<i64>;

    async fn update_endpoint(&self, record: &EndpointRecord) -> anyhow::Result<()>;

    async fn get_endpoints(
        &self,
        provider_id: i64,
        filter: EndpointStateFilter,
    ) -> anyhow::Result<Vec<EndpointRecord>>;

    async fn save_session(&self, record: SessionRecord) -> anyhow::Result<()>;

    async fn get_session(&self, id: Uuid) -> anyhow::Result<Option<SessionRecord>>;
}

/// In-memory repository.
#[derive(Default)]
pub struct InMemoryRepository {
    state: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    next_id: i64,
    providers: HashMap<i64, ProviderRecord>,
    endpoints: HashMap<i64, EndpointRecord>,
    sessions: HashMap<Uuid, SessionRecord>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn register_provider(&self, name: &str, max_limit: u32) -> anyhow::Result<i64> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.providers.insert(
            id,
            ProviderRecord {
                id,
                name: name.to_string(),
                max_limit,
                active: true,
            },
        );
        Ok(id)
    }

    async fn unregister_provider(&self, provider_id: i64) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(provider) = state.providers.get_mut(&provider_id) {
            provider.active = false;
        }
        Ok(())
    }

    async fn providers(&self) -> anyhow::Result<Vec<ProviderRecord>> {
        Ok(self.state.lock().unwrap().providers.values().cloned().collect())
    }

    async fn add_endpoint(&self, mut record: EndpointRecord) -> anyhow::Result<i64> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        record.store_id = Some(id);
        state.endpoints.insert(id, record);
        Ok(id)
    }

    async fn update_endpoint(&self, record: &EndpointRecord) -> anyhow::Result<()> {
        let Some(id) = record.store_id else {
            anyhow::bail!("endpoint {} was never persisted", record.name);
        };
        self.state.lock().unwrap().endpoints.insert(id, record.clone());
        Ok(())
    }

    async fn get_endpoints(
        &self,
        provider_id: i64,
        filter: EndpointStateFilter,
    ) -> anyhow::Result<Vec<EndpointRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .endpoints
            .values()
            .filter(|r| r.provider_id == provider_id && r.matches(filter))
            .cloned()
            .collect())
    }

    async fn save_session(&self, record: SessionRecord) -> anyhow::Result<()> {
        self.state.lock().unwrap().sessions.insert(record.id, record);
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> anyhow::Result<Option<SessionRecord>> {
        Ok(self.state.lock().unwrap().sessions.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(provider_id: i64, ready: bool, in_use: bool, on_service: bool) -> EndpointRecord {
        EndpointRecord {
            store_id: None,
            uuid: Uuid::new_v4(),
            name: "ubuntu-14.04-x64-ondemand-x".to_string(),
            platform: "ubuntu-14.04-x64".to_string(),
            provider_id,
            ready,
            in_use,
            on_service,
            deleted: false,
            created: Utc::now(),
        }
    }

    #[tokio::test]
    async fn filters_by_partition_and_provider() {
        let repo = InMemoryRepository::new();
        let provider = repo.register_provider("p1", 10).await.unwrap();
        let other = repo.register_provider("p2", 10).await.unwrap();

        repo.add_endpoint(record(provider, true, false, false)).await.unwrap();
        repo.add_endpoint(record(provider, true, true, false)).await.unwrap();
        repo.add_endpoint(record(other, true, false, false)).await.unwrap();

        let pool = repo
            .get_endpoints(provider, EndpointStateFilter::Pool)
            .await
            .unwrap();
        assert_eq!(pool.len(), 1);

        let using = repo
            .get_endpoints(provider, EndpointStateFilter::Using)
            .await
            .unwrap();
        assert_eq!(using.len(), 1);

        let all = repo
            .get_endpoints(provider, EndpointStateFilter::All)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn unregister_is_soft() {
        let repo = InMemoryRepository::new();
        let id = repo.register_provider("p1", 5).await.unwrap();
        repo.unregister_provider(id).await.unwrap();

        let providers = repo.providers().await.unwrap();
        assert_eq!(providers.len(), 1);
        assert!(!providers[0].active);
    }
}
