//! Application assembly and the session lifecycle entry points.
//!
//! [`App`] owns every long-lived component (catalog, pool, collector,
//! workers) and exposes the operations a front controller calls:
//! create a session, forward a request, run a script, close a session.
//! The flow per session: match platform → allocate endpoint → start the
//! remote selenium session → proxy traffic → on close, collect artifacts
//! and queue the endpoint for reclamation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::artifacts::screencast::{CommandRecorderFactory, RecorderFactory};
use crate::artifacts::ArtifactCollector;
use crate::config::{Config, ProviderConfig};
use crate::endpoint::{ConfiguredEndpointFactory, Endpoint, EndpointFactory};
use crate::error::{CreationError, PlatformError};
use crate::matcher::{self, DesiredCapabilities, PlatformMatrix, ProviderUsage};
use crate::platform::{PlatformCatalog, PlatformSource};
use crate::pool::preloader::Preloader;
use crate::pool::remover::EndpointRemover;
use crate::pool::EndpointPool;
use crate::proxy::SessionRequestProxy;
use crate::session::{Session, SessionRegistry};
use crate::storage::{EndpointRecord, InMemoryRepository, Repository, SessionRecord};
use crate::transport::direct::DirectTransport;
use crate::transport::{Transport, WireRequest, WireResponse};

/// Root application context. One per process.
pub struct App {
    config: Config,
    catalog: Arc<PlatformCatalog>,
    matrix: PlatformMatrix,
    pool: Arc<EndpointPool>,
    sessions: SessionRegistry,
    proxy: SessionRequestProxy,
    collector: Arc<ArtifactCollector>,
    recorders: Option<Arc<dyn RecorderFactory>>,
    repository: Arc<dyn Repository>,
    provider_id: i64,
    /// session id -> endpoint serving it, for the session's lifetime.
    bindings: Mutex<HashMap<Uuid, Arc<Endpoint>>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl App {
    /// Discover platforms from every configured backend and bring the
    /// whole stack up.
    pub async fn start(config: Config) -> Result<Arc<Self>> {
        let mut sources: Vec<Box<dyn PlatformSource>> = Vec::new();
        for provider in &config.provider {
            match provider {
                ProviderConfig::Docker(c) => {
                    sources.push(Box::new(crate::endpoint::docker::DockerSource::new(
                        c.clone(),
                    )));
                }
                ProviderConfig::Kvm(c) => {
                    sources.push(Box::new(crate::endpoint::kvm::KvmSource::new(c.clone())));
                }
                ProviderConfig::Openstack(c) => {
                    sources.push(Box::new(crate::endpoint::openstack::OpenstackSource::new(
                        c.clone(),
                    )));
                }
            }
        }

        let catalog = Arc::new(PlatformCatalog::discover(&sources).await);
        if catalog.is_empty() {
            bail!("no platforms discovered from any configured backend");
        }
        info!("discovered platforms: {}", catalog.names().join(", "));

        let factory = Arc::new(ConfiguredEndpointFactory::from_config(&config));
        let transport = Arc::new(DirectTransport::default());
        let repository = Arc::new(InMemoryRepository::new());

        Self::assemble(config, catalog, factory, transport, repository, None).await
    }

    /// Wire the components together. Split from [`start`](Self::start) so
    /// tests can swap in their own catalog, factory, transport, and screen
    /// recorder. With no injected recorder factory, one is built from the
    /// configured `screencast_command` (or screencasts are skipped).
    pub(crate) async fn assemble(
        config: Config,
        catalog: Arc<PlatformCatalog>,
        factory: Arc<dyn EndpointFactory>,
        transport: Arc<dyn Transport>,
        repository: Arc<dyn Repository>,
        recorders: Option<Arc<dyn RecorderFactory>>,
    ) -> Result<Arc<Self>> {
        let max_limit = if config.provider_meta.max_limit > 0 {
            config.provider_meta.max_limit
        } else {
            config
                .provider
                .iter()
                .map(|p| match p {
                    ProviderConfig::Docker(c) => c.max_count,
                    ProviderConfig::Kvm(c) => c.max_count,
                    ProviderConfig::Openstack(c) => c.max_count,
                })
                .sum()
        };
        let provider_id = repository
            .register_provider(&config.provider_meta.name, max_limit)
            .await
            .context("provider registration failed")?;

        let (pool, removal_rx) = EndpointPool::start(
            catalog.clone(),
            factory,
            config.pool.pool_settings(),
        );
        let collector = ArtifactCollector::start(config.artifacts.settings());
        let proxy = SessionRequestProxy::new(
            transport,
            collector.clone(),
            config.pool.proxy_settings(),
        );

        let shutdown = CancellationToken::new();
        let mut workers = Vec::new();

        workers.push(
            EndpointRemover::new(pool.clone(), collector.clone())
                .spawn(removal_rx, shutdown.clone()),
        );

        let mut preload_targets: HashMap<String, u32> = HashMap::new();
        for provider in &config.provider {
            for (platform, &target) in provider.preloaded() {
                *preload_targets.entry(platform.clone()).or_default() += target;
            }
        }
        if !preload_targets.is_empty() {
            workers.push(Preloader::new(pool.clone(), preload_targets).spawn(shutdown.clone()));
        }

        // A configured matrix overrides the discovered one wholesale.
        let matrix = if config.platforms.is_empty() {
            matcher::matrix_from_catalog(&catalog)
        } else {
            config.platforms.clone()
        };
        let recorders = recorders.or_else(|| {
            config.artifacts.screencast_command.as_ref().map(|command| {
                Arc::new(CommandRecorderFactory::new(command.clone())) as Arc<dyn RecorderFactory>
            })
        });
        let app = Arc::new(Self {
            config,
            catalog,
            matrix,
            pool,
            sessions: SessionRegistry::new(),
            proxy,
            collector,
            recorders,
            repository,
            provider_id,
            bindings: Mutex::new(HashMap::new()),
            shutdown: shutdown.clone(),
            workers: Mutex::new(workers),
        });

        app.workers
            .lock()
            .unwrap()
            .push(Self::spawn_timeout_watcher(&app, shutdown));

        Ok(app)
    }

    /// Close sessions whose inactivity exceeded the configured budget.
    fn spawn_timeout_watcher(app: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let weak: Weak<App> = Arc::downgrade(app);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(10)) => {}
                }
                let Some(app) = weak.upgrade() else {
                    break;
                };
                let budget = app.config.pool.session_timeout_secs;
                for session in app.sessions.timeouted(budget) {
                    warn!("session {} timed out after {}s idle", session.id, budget);
                    app.close_session(session.id, Some("session timeout"))
                        .await;
                }
            }
        })
    }

    pub fn catalog(&self) -> &PlatformCatalog {
        &self.catalog
    }

    pub fn pool(&self) -> &Arc<EndpointPool> {
        &self.pool
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.all()
    }

    pub fn get_session(&self, id: Uuid) -> Result<Arc<Session>, crate::error::SessionError> {
        self.sessions.get(id)
    }

    /// Endpoint bound to a session, while the session lives.
    pub fn endpoint_for(&self, session_id: Uuid) -> Option<Arc<Endpoint>> {
        self.bindings.lock().unwrap().get(&session_id).cloned()
    }

    /// The whole session-creation flow: match, allocate, start.
    ///
    /// On any failure after the session exists, the session is closed as
    /// failed and the endpoint (if any) queued for reclamation.
    pub async fn create_session(
        &self,
        desired_capabilities: serde_json::Value,
    ) -> Result<(Arc<Session>, WireResponse)> {
        let caps: DesiredCapabilities = serde_json::from_value(desired_capabilities.clone())
            .context("malformed desiredCapabilities")?;

        let matched =
            matcher::get_matched_platforms_or_fallback(&caps, &self.matrix, &self.catalog);
        if matched.is_empty() {
            return Err(PlatformError::NoMatch(format!(
                "browserName={} version={} platform={}",
                caps.browser_name, caps.version, caps.platform
            ))
            .into());
        }
        self.check_provider_capacity().await?;

        // Prefer a candidate that can serve right now: a warm spare
        // first, free capacity second. Only when every match is full does
        // the request wait out the allocation timeout on the top-ranked
        // one.
        let platform = matched
            .iter()
            .find(|p| self.pool.pool_count(p) > 0)
            .or_else(|| matched.iter().find(|p| self.pool.can_produce(p)))
            .unwrap_or(&matched[0])
            .clone();

        let session = Arc::new(Session::new(&platform, desired_capabilities));
        self.sessions.insert(session.clone());
        self.persist_session(&session).await;
        info!("session {} created for platform {}", session.id, platform);

        let endpoint = match self.pool.wait_for_vm(&platform).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                session.failed(e.to_string());
                self.sessions.remove(session.id);
                self.persist_session(&session).await;
                return Err(e.into());
            }
        };
        self.bindings
            .lock()
            .unwrap()
            .insert(session.id, endpoint.clone());
        self.persist_endpoint(&endpoint).await;

        let startup_script = self.config.pool.startup_script.clone();
        match self
            .proxy
            .start_session(&session, &endpoint, startup_script.as_deref())
            .await
        {
            Ok(response) => {
                if session.take_screencast {
                    self.start_screencast(&session, &endpoint);
                }
                self.persist_session(&session).await;
                Ok((session, response))
            }
            Err(e) => {
                warn!("session {} failed to start: {}", session.id, e);
                self.teardown_session(&session, Some(&e.to_string())).await;
                Err(e.into())
            }
        }
    }

    /// Session-cap gate: a provider at its registered active-session
    /// limit refuses new sessions outright instead of queueing them
    /// against a full pool.
    async fn check_provider_capacity(&self) -> Result<(), CreationError> {
        let providers = match self.repository.providers().await {
            Ok(providers) => providers,
            Err(e) => {
                warn!("provider listing failed, skipping capacity gate: {}", e);
                return Ok(());
            }
        };

        let active = self.sessions.len() as u32;
        let usages: Vec<ProviderUsage> = providers
            .iter()
            .filter(|p| p.active && p.id == self.provider_id)
            .map(|p| ProviderUsage {
                id: p.id,
                active,
                limit: p.max_limit,
            })
            .collect();
        if matcher::get_provider_id(&usages) == Some(self.provider_id) {
            return Ok(());
        }

        Err(CreationError::ProviderSaturated {
            provider: self.config.provider_meta.name.clone(),
            limit: providers
                .iter()
                .find(|p| p.id == self.provider_id)
                .map(|p| p.max_limit)
                .unwrap_or(0),
        })
    }

    /// Hand the session's screencast to the collector, if a recorder can
    /// be built for the endpoint.
    fn start_screencast(&self, session: &Arc<Session>, endpoint: &Arc<Endpoint>) {
        let Some(factory) = self.recorders.as_ref() else {
            warn!(
                "session {} asked for a screencast but none is configured",
                session.id
            );
            return;
        };
        let output = self.collector.session_dir(session.id).join("screencast.flv");
        match factory.make(session, endpoint, output) {
            Some(recorder) => self.collector.record_screencast(session.clone(), recorder),
            None => warn!(
                "no screen recorder for endpoint {} serving session {}",
                endpoint.name, session.id
            ),
        }
    }

    /// Forward one WebDriver request for an established session.
    pub async fn forward(
        &self,
        session_id: Uuid,
        request: WireRequest,
    ) -> Result<WireResponse> {
        let session = self.sessions.get(session_id)?;
        let endpoint = self
            .endpoint_for(session_id)
            .with_context(|| format!("session {} has no endpoint", session_id))?;
        match self.proxy.proxy_request(&session, &endpoint, request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                // The proxy closes the session on a client disconnect;
                // finish the teardown instead of leaving it bound.
                if session.is_closed() {
                    self.close_session(session_id, session.reason().as_deref()).await;
                }
                Err(e.into())
            }
        }
    }

    /// Agent command: run a script inside the session's endpoint.
    pub async fn run_script(&self, session_id: Uuid, script: &str) -> Result<WireResponse> {
        let session = self.sessions.get(session_id)?;
        let endpoint = self
            .endpoint_for(session_id)
            .with_context(|| format!("session {} has no endpoint", session_id))?;
        Ok(self.proxy.run_script(&session, &endpoint, script).await?)
    }

    /// Close a session. `reason` of `None` means a clean success; any
    /// reason closes it as failed. Idempotent — a second close is a no-op.
    pub async fn close_session(&self, session_id: Uuid, reason: Option<&str>) {
        let Some(session) = self.sessions.remove(session_id) else {
            return;
        };
        self.teardown_session(&session, reason).await;
    }

    async fn teardown_session(&self, session: &Arc<Session>, reason: Option<&str>) {
        match reason {
            Some(reason) => session.failed(reason),
            None => session.succeed(),
        }
        self.sessions.remove(session.id);

        let endpoint = self.bindings.lock().unwrap().remove(&session.id);
        if let Some(endpoint) = endpoint {
            // Collection tasks must be queued before the endpoint enters
            // the removal pipeline; the remover waits on them.
            self.collector.save_selenium_log(session, endpoint.clone());
            self.pool.stop_using(endpoint.uuid, session.id);
            self.persist_endpoint(&endpoint).await;
        }
        self.persist_session(session).await;
        info!(
            "session {} closed ({})",
            session.id,
            reason.unwrap_or("succeed")
        );
    }

    /// Stop workers, close every session, and free every endpoint.
    pub async fn stop(&self) {
        info!("shutting down");
        for session in self.sessions.all() {
            self.teardown_session(&session, Some("server shutdown")).await;
        }
        self.shutdown.cancel();

        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("worker ended abnormally: {}", e);
            }
        }

        self.collector.stop().await;
        self.pool.free_endpoints().await;
        if let Err(e) = self.repository.unregister_provider(self.provider_id).await {
            warn!("provider unregistration failed: {}", e);
        }
    }

    /// Best-effort mirror into the persisted store; failures are logged,
    /// never propagated.
    async fn persist_session(&self, session: &Session) {
        let record = SessionRecord {
            id: session.id,
            platform: session.platform.clone(),
            status: session.status().to_string(),
            endpoint: self
                .bindings
                .lock()
                .unwrap()
                .get(&session.id)
                .map(|e| e.uuid),
        };
        if let Err(e) = self.repository.save_session(record).await {
            warn!("session {} not persisted: {}", session.id, e);
        }
    }

    async fn persist_endpoint(&self, endpoint: &Endpoint) {
        let record = EndpointRecord {
            store_id: endpoint.store_id(),
            uuid: endpoint.uuid,
            name: endpoint.name.clone(),
            platform: endpoint.platform.clone(),
            provider_id: self.provider_id,
            ready: endpoint.is_ready(),
            in_use: endpoint.is_in_use(),
            on_service: matches!(
                endpoint.mode(),
                crate::endpoint::EndpointMode::WaitForService
                    | crate::endpoint::EndpointMode::Service
            ),
            deleted: endpoint.is_deleted(),
            created: endpoint.created,
        };
        let result = if record.store_id.is_some() {
            self.repository.update_endpoint(&record).await
        } else {
            match self.repository.add_endpoint(record).await {
                Ok(id) => {
                    endpoint.set_store_id(id);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        if let Err(e) = result {
            warn!("endpoint {} not persisted: {}", endpoint.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;
    use crate::platform::{BackendKind, Capacity, Platform};
    use crate::pool::testing::{listening_addr, FakeFactory};
    use crate::transport::TransportResult;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;

    const PLATFORM: &str = "ubuntu-14.04-x64";

    /// Canned selenium: status check then session start, then echoes.
    struct SeleniumStub {
        responses: Mutex<VecDeque<TransportResult<WireResponse>>>,
    }

    impl SeleniumStub {
        fn for_one_session() -> Arc<Self> {
            Self::scripted(vec![
                Ok(WireResponse::ok(r#"{"status":0}"#)),
                Ok(WireResponse::ok(
                    r#"{"sessionId":"native-1","status":0,"value":{}}"#,
                )),
            ])
        }

        fn scripted(responses: Vec<TransportResult<WireResponse>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
            })
        }
    }

    #[async_trait]
    impl Transport for SeleniumStub {
        async fn send(&self, _host: &str, _request: &WireRequest) -> TransportResult<WireResponse> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(WireResponse::ok("{}")))
        }
    }

    fn catalog() -> Arc<PlatformCatalog> {
        Arc::new(PlatformCatalog::from_platforms(vec![platform(
            PLATFORM,
            Capacity::Limited(1),
        )]))
    }

    const QUICK_CONFIG: &str = r#"
        [pool]
        get_vm_timeout_secs = 1

        [artifacts]
        wait_timeout_secs = 1
    "#;

    async fn app_with(
        catalog: Arc<PlatformCatalog>,
        transport: Arc<dyn Transport>,
        config_toml: &str,
        recorders: Option<Arc<dyn RecorderFactory>>,
    ) -> Arc<App> {
        let mut config = load_config_str(config_toml).unwrap();
        config.artifacts.dir = tempfile::tempdir().unwrap().keep();

        let (addr, guards) = listening_addr().await;
        // Keep the listeners alive for the app's lifetime.
        for guard in guards {
            std::mem::forget(guard);
        }
        App::assemble(
            config,
            catalog,
            Arc::new(FakeFactory::new(addr)),
            transport,
            Arc::new(InMemoryRepository::new()),
            recorders,
        )
        .await
        .unwrap()
    }

    async fn test_app(transport: Arc<dyn Transport>) -> Arc<App> {
        app_with(catalog(), transport, QUICK_CONFIG, None).await
    }

    #[tokio::test]
    async fn session_creation_allocates_and_starts() {
        let app = test_app(SeleniumStub::for_one_session()).await;

        let (session, response) = app
            .create_session(json!({ "platform": PLATFORM, "browserName": "chrome" }))
            .await
            .unwrap();

        assert!(response.content.contains(&session.id.to_string()));
        assert_eq!(session.selenium_session().as_deref(), Some("native-1"));
        assert_eq!(app.pool().in_use_count(PLATFORM), 1);
        assert!(app.endpoint_for(session.id).is_some());

        app.stop().await;
    }

    #[tokio::test]
    async fn unmatched_capabilities_are_rejected_without_allocation() {
        let app = test_app(SeleniumStub::for_one_session()).await;

        let err = app
            .create_session(json!({ "browserName": "netscape" }))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<PlatformError>().is_some());
        assert_eq!(app.pool().total_count(PLATFORM), 0);
        assert!(app.sessions().is_empty());

        app.stop().await;
    }

    #[tokio::test]
    async fn second_session_times_out_while_capacity_is_held() {
        let app = test_app(SeleniumStub::for_one_session()).await;

        let (first, _) = app
            .create_session(json!({ "browserName": "chrome" }))
            .await
            .unwrap();

        let err = app
            .create_session(json!({ "browserName": "chrome" }))
            .await
            .unwrap_err();
        assert!(err
            .downcast_ref::<crate::error::CreationError>()
            .is_some());
        // The loser's session does not linger in the registry.
        assert_eq!(app.sessions().len(), 1);
        assert_eq!(app.sessions()[0].id, first.id);

        app.stop().await;
    }

    #[tokio::test]
    async fn close_releases_the_endpoint_slot() {
        let app = test_app(SeleniumStub::for_one_session()).await;

        let (session, _) = app
            .create_session(json!({ "browserName": "chrome" }))
            .await
            .unwrap();
        let endpoint = app.endpoint_for(session.id).unwrap();

        app.close_session(session.id, None).await;
        assert_eq!(session.status(), crate::session::SessionStatus::Succeed);
        assert!(app.endpoint_for(session.id).is_none());

        // The remover reclaims it; capacity frees up.
        tokio::time::timeout(Duration::from_secs(5), async {
            while !endpoint.is_deleted() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("endpoint never reclaimed");

        app.stop().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let app = test_app(SeleniumStub::for_one_session()).await;

        let (session, _) = app
            .create_session(json!({ "browserName": "chrome" }))
            .await
            .unwrap();

        app.close_session(session.id, Some("client disconnected")).await;
        let reason = session.reason();
        app.close_session(session.id, Some("second reason")).await;
        assert_eq!(session.reason(), reason);

        app.stop().await;
    }

    fn platform(name: &str, limit: Capacity) -> (Platform, Capacity) {
        (
            Platform {
                name: name.to_string(),
                kind: BackendKind::Docker,
                flavor: None,
                browsers: HashMap::from([("chrome".to_string(), "58.333".to_string())]),
            },
            limit,
        )
    }

    #[tokio::test]
    async fn allocation_falls_through_to_free_matched_platform() {
        // Two platforms match chrome; the rank-first one has no capacity,
        // so the request must land on the other instead of waiting out
        // the allocation timeout.
        let catalog = Arc::new(PlatformCatalog::from_platforms(vec![
            platform("a-full", Capacity::Limited(0)),
            platform("b-free", Capacity::Limited(1)),
        ]));
        let app = app_with(
            catalog,
            SeleniumStub::for_one_session(),
            QUICK_CONFIG,
            None,
        )
        .await;

        let (session, _) = app
            .create_session(json!({ "browserName": "chrome" }))
            .await
            .unwrap();
        assert_eq!(session.platform, "b-free");
        assert_eq!(app.pool().in_use_count("b-free"), 1);
        assert_eq!(app.pool().total_count("a-full"), 0);

        app.stop().await;
    }

    #[tokio::test]
    async fn saturated_provider_rejects_new_sessions_without_waiting() {
        let catalog = Arc::new(PlatformCatalog::from_platforms(vec![platform(
            PLATFORM,
            Capacity::Limited(2),
        )]));
        let app = app_with(
            catalog,
            SeleniumStub::for_one_session(),
            r#"
            [pool]
            get_vm_timeout_secs = 30

            [provider_meta]
            max_limit = 1

            [artifacts]
            wait_timeout_secs = 1
            "#,
            None,
        )
        .await;

        let (first, _) = app
            .create_session(json!({ "browserName": "chrome" }))
            .await
            .unwrap();

        // The pool still has a free slot, but the provider cap is hit.
        let err = app
            .create_session(json!({ "browserName": "chrome" }))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CreationError>(),
            Some(CreationError::ProviderSaturated { limit: 1, .. })
        ));
        assert_eq!(app.pool().total_count(PLATFORM), 1);
        assert_eq!(app.sessions().len(), 1);
        assert_eq!(app.sessions()[0].id, first.id);

        app.stop().await;
    }

    #[tokio::test]
    async fn client_disconnect_mid_session_tears_down() {
        let transport = SeleniumStub::scripted(vec![
            Ok(WireResponse::ok(r#"{"status":0}"#)),
            Ok(WireResponse::ok(
                r#"{"sessionId":"native-1","status":0,"value":{}}"#,
            )),
            Err(crate::transport::TransportError::ClientDisconnected(
                "browser gone".into(),
            )),
        ]);
        let app = test_app(transport).await;

        let (session, _) = app
            .create_session(json!({ "browserName": "chrome" }))
            .await
            .unwrap();
        let endpoint = app.endpoint_for(session.id).unwrap();

        let request = WireRequest::new(
            "GET",
            format!("/wd/hub/session/{}/url", session.id),
            4455,
        );
        app.forward(session.id, request).await.unwrap_err();

        assert!(session.is_closed());
        assert_eq!(session.status(), crate::session::SessionStatus::Failed);
        assert!(app.sessions().is_empty());
        assert!(app.endpoint_for(session.id).is_none());

        tokio::time::timeout(Duration::from_secs(5), async {
            while !endpoint.is_deleted() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("endpoint never reclaimed");

        app.stop().await;
    }

    #[tokio::test]
    async fn screencast_runs_for_requesting_session() {
        use crate::artifacts::screencast::ScreenRecorder;
        use std::path::PathBuf;
        use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

        struct StubRecorder {
            alive: AtomicBool,
            stopped: AtomicBool,
            output: PathBuf,
        }

        #[async_trait]
        impl ScreenRecorder for StubRecorder {
            async fn start(&self) -> anyhow::Result<()> {
                Ok(())
            }

            async fn stop(&self) {
                self.alive.store(false, Ordering::SeqCst);
                self.stopped.store(true, Ordering::SeqCst);
            }

            fn is_alive(&self) -> bool {
                self.alive.load(Ordering::SeqCst)
            }

            fn output_path(&self) -> PathBuf {
                self.output.clone()
            }
        }

        #[derive(Default)]
        struct StubRecorderFactory {
            made: AtomicU32,
            last: Mutex<Option<Arc<StubRecorder>>>,
        }

        impl RecorderFactory for StubRecorderFactory {
            fn make(
                &self,
                _session: &Session,
                _endpoint: &Endpoint,
                output: PathBuf,
            ) -> Option<Arc<dyn ScreenRecorder>> {
                self.made.fetch_add(1, Ordering::SeqCst);
                let recorder = Arc::new(StubRecorder {
                    alive: AtomicBool::new(true),
                    stopped: AtomicBool::new(false),
                    output,
                });
                *self.last.lock().unwrap() = Some(recorder.clone());
                Some(recorder)
            }
        }

        let factory = Arc::new(StubRecorderFactory::default());
        let app = app_with(
            catalog(),
            SeleniumStub::for_one_session(),
            QUICK_CONFIG,
            Some(factory.clone() as Arc<dyn RecorderFactory>),
        )
        .await;

        let (session, _) = app
            .create_session(json!({ "browserName": "chrome", "takeScreencast": true }))
            .await
            .unwrap();
        assert_eq!(factory.made.load(Ordering::SeqCst), 1);
        let recorder = factory.last.lock().unwrap().clone().unwrap();

        app.close_session(session.id, None).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while !recorder.stopped.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("recorder never stopped");

        app.stop().await;
    }
}
