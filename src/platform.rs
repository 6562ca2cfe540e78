//! Platform definitions and the catalog of provisionable platforms.
//!
//! A [`Platform`] describes a named image/template a backend can clone
//! endpoints from. The [`PlatformCatalog`] merges the platform sets
//! discovered from every enabled backend and answers capacity questions
//! for the pool.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Which provisioning backend owns a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Kvm,
    Openstack,
    Docker,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Kvm => write!(f, "kvm"),
            BackendKind::Openstack => write!(f, "openstack"),
            BackendKind::Docker => write!(f, "docker"),
        }
    }
}

/// Per-platform capacity limit.
///
/// `Unlimited` is a distinguished sentinel, not a large integer: summing
/// capacities across backends yields `Unlimited` as soon as any operand
/// is `Unlimited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Limited(u32),
    Unlimited,
}

impl Capacity {
    /// Whether a platform with this limit can grow past `current` endpoints.
    pub fn allows(&self, current: u32) -> bool {
        match self {
            Capacity::Unlimited => true,
            Capacity::Limited(limit) => current < *limit,
        }
    }

    /// Aggregate two capacities; any unlimited operand wins.
    pub fn add(self, other: Capacity) -> Capacity {
        match (self, other) {
            (Capacity::Limited(a), Capacity::Limited(b)) => Capacity::Limited(a.saturating_add(b)),
            _ => Capacity::Unlimited,
        }
    }
}

/// A configured `max_count` of 0 means unbounded.
impl From<u32> for Capacity {
    fn from(limit: u32) -> Self {
        if limit == 0 {
            Capacity::Unlimited
        } else {
            Capacity::Limited(limit)
        }
    }
}

impl std::fmt::Display for Capacity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capacity::Limited(n) => write!(f, "{}", n),
            Capacity::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// A named, backend-specific image/template descriptor.
///
/// Immutable after discovery; the catalog is rebuilt at process start and
/// whenever a provider re-registers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    /// Platform name, unique across the catalog.
    pub name: String,
    /// Backend that provisions clones of this platform.
    pub kind: BackendKind,
    /// Resource sizing hint (Openstack flavor, docker resource profile).
    pub flavor: Option<String>,
    /// Browser → version matrix, when the backend publishes one.
    #[serde(default)]
    pub browsers: HashMap<String, String>,
}

/// A provisioning backend's view of its available platforms.
///
/// Implemented per backend (local disk images, cloud image catalog,
/// container image registry).
#[async_trait]
pub trait PlatformSource: Send + Sync {
    /// Enumerate the platforms this backend can provision.
    async fn discover(&self) -> anyhow::Result<Vec<Platform>>;

    /// Capacity limit this backend imposes on each of its platforms.
    fn limit(&self) -> Capacity;

    /// Backend kind, for logging.
    fn kind(&self) -> BackendKind;
}

/// Merged view of every backend's platforms plus their capacity limits.
#[derive(Debug, Default)]
pub struct PlatformCatalog {
    platforms: HashMap<String, Platform>,
    limits: HashMap<String, Capacity>,
}

impl PlatformCatalog {
    /// Discover platforms from all sources.
    ///
    /// A backend that fails discovery (auth failure, unreachable API)
    /// contributes zero platforms; the error is logged and discovery
    /// continues. Platform names colliding across backends resolve to the
    /// last-registered backend.
    pub async fn discover(sources: &[Box<dyn PlatformSource>]) -> Self {
        let mut catalog = PlatformCatalog::default();

        for source in sources {
            let platforms = match source.discover().await {
                Ok(platforms) => platforms,
                Err(e) => {
                    warn!("platform discovery failed for {} backend: {:#}", source.kind(), e);
                    continue;
                }
            };

            info!(
                "discovered {} platform(s) from {} backend (limit: {})",
                platforms.len(),
                source.kind(),
                source.limit()
            );

            for platform in platforms {
                if let Some(previous) = catalog.platforms.get(&platform.name) {
                    warn!(
                        "platform {} registered by both {} and {}; keeping {}",
                        platform.name, previous.kind, platform.kind, platform.kind
                    );
                }
                catalog.limits.insert(platform.name.clone(), source.limit());
                catalog.platforms.insert(platform.name.clone(), platform);
            }
        }

        catalog
    }

    /// Build a catalog from an explicit platform list (tests, static config).
    pub fn from_platforms(platforms: Vec<(Platform, Capacity)>) -> Self {
        let mut catalog = PlatformCatalog::default();
        for (platform, limit) in platforms {
            catalog.limits.insert(platform.name.clone(), limit);
            catalog.platforms.insert(platform.name.clone(), platform);
        }
        catalog
    }

    /// Capacity limit for a platform. Unknown platforms have zero capacity.
    pub fn get_limit(&self, name: &str) -> Capacity {
        self.limits.get(name).copied().unwrap_or(Capacity::Limited(0))
    }

    /// Whether the catalog knows the platform.
    pub fn check(&self, name: &str) -> bool {
        self.platforms.contains_key(name)
    }

    /// Look up a platform descriptor.
    pub fn get(&self, name: &str) -> Option<&Platform> {
        self.platforms.get(name)
    }

    pub fn platforms(&self) -> impl Iterator<Item = &Platform> {
        self.platforms.values()
    }

    /// All platform names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.platforms.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.platforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform(name: &str, kind: BackendKind) -> Platform {
        Platform {
            name: name.to_string(),
            kind,
            flavor: None,
            browsers: HashMap::new(),
        }
    }

    struct StaticSource {
        platforms: Vec<Platform>,
        limit: Capacity,
        kind: BackendKind,
        fail: bool,
    }

    #[async_trait]
    impl PlatformSource for StaticSource {
        async fn discover(&self) -> anyhow::Result<Vec<Platform>> {
            if self.fail {
                anyhow::bail!("backend unreachable");
            }
            Ok(self.platforms.clone())
        }

        fn limit(&self) -> Capacity {
            self.limit
        }

        fn kind(&self) -> BackendKind {
            self.kind
        }
    }

    #[test]
    fn capacity_allows() {
        assert!(Capacity::Unlimited.allows(u32::MAX - 1));
        assert!(Capacity::Limited(2).allows(1));
        assert!(!Capacity::Limited(2).allows(2));
        assert!(!Capacity::Limited(0).allows(0));
    }

    #[test]
    fn capacity_aggregation_prefers_unlimited() {
        assert_eq!(
            Capacity::Limited(2).add(Capacity::Limited(3)),
            Capacity::Limited(5)
        );
        assert_eq!(
            Capacity::Limited(2).add(Capacity::Unlimited),
            Capacity::Unlimited
        );
        assert_eq!(
            Capacity::Unlimited.add(Capacity::Limited(7)),
            Capacity::Unlimited
        );
    }

    #[tokio::test]
    async fn failed_backend_contributes_nothing() {
        let sources: Vec<Box<dyn PlatformSource>> = vec![
            Box::new(StaticSource {
                platforms: vec![platform("ubuntu-14.04-x64", BackendKind::Kvm)],
                limit: Capacity::Limited(2),
                kind: BackendKind::Kvm,
                fail: false,
            }),
            Box::new(StaticSource {
                platforms: vec![platform("centos-7", BackendKind::Openstack)],
                limit: Capacity::Unlimited,
                kind: BackendKind::Openstack,
                fail: true,
            }),
        ];

        let catalog = PlatformCatalog::discover(&sources).await;
        assert!(catalog.check("ubuntu-14.04-x64"));
        assert!(!catalog.check("centos-7"));
        assert_eq!(catalog.get_limit("ubuntu-14.04-x64"), Capacity::Limited(2));
        assert_eq!(catalog.get_limit("centos-7"), Capacity::Limited(0));
    }

    #[tokio::test]
    async fn name_collision_last_backend_wins() {
        let sources: Vec<Box<dyn PlatformSource>> = vec![
            Box::new(StaticSource {
                platforms: vec![platform("ubuntu-16.04", BackendKind::Kvm)],
                limit: Capacity::Limited(4),
                kind: BackendKind::Kvm,
                fail: false,
            }),
            Box::new(StaticSource {
                platforms: vec![platform("ubuntu-16.04", BackendKind::Docker)],
                limit: Capacity::Unlimited,
                kind: BackendKind::Docker,
                fail: false,
            }),
        ];

        let catalog = PlatformCatalog::discover(&sources).await;
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("ubuntu-16.04").unwrap().kind, BackendKind::Docker);
        assert_eq!(catalog.get_limit("ubuntu-16.04"), Capacity::Unlimited);
    }
}
