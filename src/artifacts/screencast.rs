//! Screencast recording loop.
//!
//! The actual VNC screen-recording codec is an external collaborator
//! behind [`ScreenRecorder`]; this module owns the polling loop and the
//! storage-saving default of deleting recordings for sessions that
//! succeeded without asking for retention.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::session::{Session, SessionStatus};

/// A running screen recorder attached to one endpoint's VNC display.
#[async_trait]
pub trait ScreenRecorder: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self);

    /// Whether the recorder process is still alive.
    fn is_alive(&self) -> bool;

    /// Where the recording is written.
    fn output_path(&self) -> PathBuf;
}

/// Builds a recorder for one session's endpoint.
pub trait RecorderFactory: Send + Sync {
    /// `None` when the endpoint exposes no recordable display.
    fn make(
        &self,
        session: &Session,
        endpoint: &Endpoint,
        output: PathBuf,
    ) -> Option<Arc<dyn ScreenRecorder>>;
}

/// Recorder wrapping an external capture command (`flvrec.py` or similar)
/// pointed at the endpoint's VNC display.
pub struct CommandRecorder {
    program: String,
    args: Vec<String>,
    output: PathBuf,
    child: Mutex<Option<tokio::process::Child>>,
}

impl CommandRecorder {
    /// Render the command template, substituting `{host}`, `{port}` and
    /// `{output}`, and split it shell-style into program and arguments.
    pub fn from_template(
        template: &str,
        host: &str,
        port: u16,
        output: &Path,
    ) -> anyhow::Result<Self> {
        let rendered = template
            .replace("{host}", host)
            .replace("{port}", &port.to_string())
            .replace("{output}", &output.to_string_lossy());
        let mut parts = shell_words::split(&rendered)?;
        if parts.is_empty() {
            anyhow::bail!("empty screencast command");
        }
        let program = parts.remove(0);
        Ok(Self {
            program,
            args: parts,
            output: output.to_path_buf(),
            child: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ScreenRecorder for CommandRecorder {
    async fn start(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .spawn()?;
        *self.child.lock().unwrap() = Some(child);
        Ok(())
    }

    async fn stop(&self) {
        let child = self.child.lock().unwrap().take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                debug!("couldn't kill recorder process: {}", e);
            }
        }
    }

    fn is_alive(&self) -> bool {
        match self.child.lock().unwrap().as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn output_path(&self) -> PathBuf {
        self.output.clone()
    }
}

/// Factory spawning [`CommandRecorder`]s from a configured command
/// template.
pub struct CommandRecorderFactory {
    template: String,
}

impl CommandRecorderFactory {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl RecorderFactory for CommandRecorderFactory {
    fn make(
        &self,
        session: &Session,
        endpoint: &Endpoint,
        output: PathBuf,
    ) -> Option<Arc<dyn ScreenRecorder>> {
        let addr = endpoint.addr()?;
        let vnc_port = addr.vnc_port?;
        match CommandRecorder::from_template(&self.template, &addr.ip, vnc_port, &output) {
            Ok(recorder) => Some(Arc::new(recorder)),
            Err(e) => {
                warn!("bad screencast command for session {}: {}", session.id, e);
                None
            }
        }
    }
}

/// Record until the session closes or the recorder dies, then stop the
/// recorder and apply the retention policy.
pub async fn record_screencast(
    session: Arc<Session>,
    recorder: Arc<dyn ScreenRecorder>,
    interval: Duration,
) -> anyhow::Result<()> {
    recorder.start().await?;
    info!("screencast started for session {}", session.id);

    loop {
        tokio::time::sleep(interval).await;
        if session.is_closed() {
            debug!("session {} closed, stopping screencast", session.id);
            break;
        }
        if !recorder.is_alive() {
            debug!("recorder died for session {}", session.id);
            break;
        }
    }

    recorder.stop().await;

    // Successful runs without an explicit retention request don't keep
    // their recording.
    if session.status() == SessionStatus::Succeed && !session.take_screencast {
        let path = recorder.output_path();
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!("couldn't remove screencast {}: {}", path.display(), e);
        } else {
            info!("removed screencast for succeeded session {}", session.id);
        }
    }

    Ok(())
}
