//! Asynchronous artifact collection.
//!
//! A bounded worker pool drains per-session cleanup tasks (selenium log
//! fetch, screencast teardown, screenshots) so endpoint reclamation can
//! wait on a per-session completion barrier instead of doing remote I/O
//! inline. The barrier is bounded: a stuck fetch cannot wedge reclamation
//! forever.

pub mod screencast;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::session::Session;

/// Remote path of the selenium server log inside an endpoint.
pub const SELENIUM_LOG_PATH: &str = "/var/log/selenium_server.log";

/// Settings for the collector.
#[derive(Debug, Clone)]
pub struct ArtifactSettings {
    /// Local directory artifacts are written under, one subdir per session.
    pub dir: PathBuf,
    /// Worker pool size.
    pub workers: usize,
    /// Upper bound for [`ArtifactCollector::wait_for_complete`].
    pub wait_timeout: Duration,
    /// Poll interval of the screencast recording loop.
    pub screencast_interval: Duration,
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("artifacts"),
            workers: 4,
            wait_timeout: Duration::from_secs(60),
            screencast_interval: Duration::from_secs(1),
        }
    }
}

type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

struct ArtifactTask {
    session_id: Uuid,
    name: String,
    work: TaskFuture,
}

/// Bounded worker pool draining `(session_id, task_name)`-tagged work.
pub struct ArtifactCollector {
    settings: ArtifactSettings,
    sender: Mutex<Option<mpsc::UnboundedSender<ArtifactTask>>>,
    in_flight: Arc<Mutex<HashMap<Uuid, Vec<String>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ArtifactCollector {
    /// Start the collector with `settings.workers` workers.
    pub fn start(settings: ArtifactSettings) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<ArtifactTask>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let in_flight: Arc<Mutex<HashMap<Uuid, Vec<String>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let mut workers = Vec::with_capacity(settings.workers);
        for worker_id in 0..settings.workers.max(1) {
            let rx = rx.clone();
            let in_flight = in_flight.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let task = { rx.lock().await.recv().await };
                    let Some(task) = task else {
                        break;
                    };

                    debug!(
                        "worker {} running task {} for session {}",
                        worker_id, task.name, task.session_id
                    );
                    if let Err(e) = task.work.await {
                        warn!(
                            "artifact task {} for session {} failed: {:#}",
                            task.name, task.session_id, e
                        );
                    }
                    finish_task(&in_flight, task.session_id, &task.name);
                }
            }));
        }

        Arc::new(Self {
            settings,
            sender: Mutex::new(Some(tx)),
            in_flight,
            workers: Mutex::new(workers),
        })
    }

    pub fn settings(&self) -> &ArtifactSettings {
        &self.settings
    }

    /// Local artifact directory for a session.
    pub fn session_dir(&self, session_id: Uuid) -> PathBuf {
        self.settings.dir.join(session_id.to_string())
    }

    /// Enqueue a unit of work tagged with the session id.
    pub fn add_task<F>(&self, session_id: Uuid, name: impl Into<String>, work: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            in_flight
                .entry(session_id)
                .or_default()
                .push(name.clone());
        }

        let sender = self.sender.lock().unwrap().clone();
        let sent = sender
            .map(|tx| {
                tx.send(ArtifactTask {
                    session_id,
                    name: name.clone(),
                    work: Box::pin(work),
                })
                .is_ok()
            })
            .unwrap_or(false);

        if !sent {
            warn!("collector stopped, dropping task {} for {}", name, session_id);
            finish_task(&self.in_flight, session_id, &name);
        }
    }

    /// Session ids with outstanding tasks.
    pub fn in_flight_sessions(&self) -> Vec<Uuid> {
        self.in_flight.lock().unwrap().keys().copied().collect()
    }

    /// Outstanding task names for a session.
    pub fn tasks_for_session(&self, session_id: Uuid) -> Vec<String> {
        self.in_flight
            .lock()
            .unwrap()
            .get(&session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Block until the session has no in-flight tasks, or until the
    /// configured timeout. In the timeout case the remaining tasks are
    /// force-removed from the barrier so reclamation can proceed.
    pub async fn wait_for_complete(&self, session_id: Uuid) {
        let deadline = Instant::now() + self.settings.wait_timeout;
        loop {
            if !self.in_flight.lock().unwrap().contains_key(&session_id) {
                return;
            }
            if Instant::now() >= deadline {
                let leftover = self.del_tasks_for_session(session_id);
                warn!(
                    "artifact collection for {} timed out, dropped {} task(s)",
                    session_id, leftover
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Force-remove every in-flight task entry for a session. Returns how
    /// many entries were dropped.
    pub fn del_tasks_for_session(&self, session_id: Uuid) -> usize {
        self.in_flight
            .lock()
            .unwrap()
            .remove(&session_id)
            .map(|tasks| tasks.len())
            .unwrap_or(0)
    }

    /// Stop accepting tasks and wait for the workers to drain.
    pub async fn stop(&self) {
        self.sender.lock().unwrap().take();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("artifact worker ended abnormally: {}", e);
            }
        }
        info!("artifact collector stopped");
    }

    /// Enqueue a fetch of the endpoint's selenium log into the session's
    /// artifact directory.
    pub fn save_selenium_log(&self, session: &Session, endpoint: Arc<Endpoint>) {
        let local = self.session_dir(session.id).join("selenium_server.log");
        self.add_task(session.id, "selenium_log", async move {
            endpoint
                .backend()
                .download_file(SELENIUM_LOG_PATH, &local)
                .await?;
            Ok(())
        });
    }

    /// Enqueue a screencast recording loop for the session.
    pub fn record_screencast(
        &self,
        session: Arc<Session>,
        recorder: Arc<dyn screencast::ScreenRecorder>,
    ) {
        let interval = self.settings.screencast_interval;
        self.add_task(session.id, "screencast", async move {
            screencast::record_screencast(session, recorder, interval).await
        });
    }
}

fn finish_task(in_flight: &Mutex<HashMap<Uuid, Vec<String>>>, session_id: Uuid, name: &str) {
    let mut in_flight = in_flight.lock().unwrap();
    if let Some(tasks) = in_flight.get_mut(&session_id) {
        if let Some(pos) = tasks.iter().position(|t| t == name) {
            tasks.remove(pos);
        }
        // Emptiness of the per-session list is the completion signal.
        if tasks.is_empty() {
            in_flight.remove(&session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector(wait_timeout: Duration) -> Arc<ArtifactCollector> {
        ArtifactCollector::start(ArtifactSettings {
            dir: std::env::temp_dir().join("gridpool-artifacts-test"),
            workers: 2,
            wait_timeout,
            screencast_interval: Duration::from_millis(10),
        })
    }

    #[tokio::test]
    async fn wait_for_complete_returns_after_tasks_finish() {
        let collector = collector(Duration::from_secs(5));
        let session_id = Uuid::new_v4();

        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let task_flag = flag.clone();
        collector.add_task(session_id, "quick", async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            task_flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });

        assert!(collector.in_flight_sessions().contains(&session_id));
        collector.wait_for_complete(session_id).await;
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!collector.in_flight_sessions().contains(&session_id));
    }

    #[tokio::test]
    async fn wait_for_complete_times_out_and_force_removes() {
        let collector = collector(Duration::from_millis(100));
        let session_id = Uuid::new_v4();

        collector.add_task(session_id, "stuck", async move {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(())
        });

        let start = Instant::now();
        collector.wait_for_complete(session_id).await;
        assert!(start.elapsed() < Duration::from_secs(5));
        // Timeout path force-removed the session's entries.
        assert!(!collector.in_flight_sessions().contains(&session_id));
    }

    #[tokio::test]
    async fn failing_task_still_clears_the_barrier() {
        let collector = collector(Duration::from_secs(5));
        let session_id = Uuid::new_v4();

        collector.add_task(session_id, "broken", async move {
            anyhow::bail!("remote fetch exploded")
        });

        collector.wait_for_complete(session_id).await;
        assert!(collector.tasks_for_session(session_id).is_empty());
    }

    #[tokio::test]
    async fn tasks_after_stop_are_dropped() {
        let collector = collector(Duration::from_secs(1));
        collector.stop().await;

        let session_id = Uuid::new_v4();
        collector.add_task(session_id, "late", async move { Ok(()) });
        assert!(collector.tasks_for_session(session_id).is_empty());
    }
}
