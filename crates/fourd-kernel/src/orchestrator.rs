//! Restart orchestration.
//!
//! Sequence for one daemon: stop (failure tolerated), settle, start (failure
//! aborts), poll until the daemon answers, then reconnect each dependent
//! resource with a short pause between them. Individual reconnect failures
//! are logged and skipped.

use crate::error::{KernelError, KernelResult};
use crate::probe::{check_result, request};
use crate::restart::{
    wait_for_restart, EvidencePolicy, ProcessSnapshot, RestartWatch, SnapshotSource,
};
use async_trait::async_trait;
use chrono::Utc;
use fourd_types::config::{ControlConfig, DaemonEndpoint, RestartConfig};
use fourd_types::{CommandPath, Envelope};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Operations the orchestrator needs on a remote daemon.
#[async_trait]
pub trait DaemonControl: Send + Sync {
    async fn stop(&self, daemon: &str) -> KernelResult<()>;
    async fn start(&self, daemon: &str) -> KernelResult<()>;
    /// `Ok` as soon as the daemon answers anything.
    async fn probe(&self, daemon: &str) -> KernelResult<()>;
    /// Resources to reconnect after a restart.
    async fn dependents(&self, daemon: &str) -> KernelResult<Vec<String>>;
    async fn reconnect(&self, daemon: &str, dependent: &str) -> KernelResult<()>;
}

/// `{ok, error?}` outcome of a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartReport {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RestartReport {
    pub fn success() -> Self {
        Self { ok: true, error: None }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }

    pub fn into_result(self) -> KernelResult<()> {
        match self.error {
            Some(e) if !self.ok => Err(KernelError::RestartFailed(e)),
            _ if !self.ok => Err(KernelError::RestartFailed("unknown".into())),
            _ => Ok(()),
        }
    }
}

/// Timing of the restart sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPlan {
    pub settle: Duration,
    pub poll_attempts: u32,
    pub poll_interval: Duration,
    pub reconnect_delay: Duration,
}

impl Default for RestartPlan {
    fn default() -> Self {
        Self::from(&RestartConfig::default())
    }
}

impl From<&RestartConfig> for RestartPlan {
    fn from(config: &RestartConfig) -> Self {
        Self {
            settle: config.settle(),
            poll_attempts: config.poll_attempts,
            poll_interval: config.poll_interval(),
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

/// Restart `daemon` and reconnect its dependents.
pub async fn restart_daemon(
    control: &dyn DaemonControl,
    daemon: &str,
    plan: &RestartPlan,
) -> RestartReport {
    warn!(daemon, "Restart sequence begin");

    info!(daemon, "Sending stop");
    if let Err(e) = control.stop(daemon).await {
        error!(daemon, error = %e, "Stop failed, continuing");
    }

    tokio::time::sleep(plan.settle).await;

    info!(daemon, "Sending start");
    if let Err(e) = control.start(daemon).await {
        error!(daemon, error = %e, "Start failed");
        return RestartReport::failure(format!("start fail: {e}"));
    }

    let mut alive = false;
    for attempt in 0..plan.poll_attempts {
        match control.probe(daemon).await {
            Ok(()) => {
                info!(daemon, attempt = attempt + 1, "Alive after restart");
                alive = true;
                break;
            }
            Err(e) => debug!(daemon, attempt = attempt + 1, error = %e, "Waiting for daemon"),
        }
        tokio::time::sleep(plan.poll_interval).await;
    }
    if !alive {
        error!(daemon, attempts = plan.poll_attempts, "Restart failed, no response");
        return RestartReport::failure(format!("no {daemon} response"));
    }

    match control.dependents(daemon).await {
        Ok(dependents) => {
            for (i, dependent) in dependents.iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(plan.reconnect_delay).await;
                }
                info!(daemon, dependent = %dependent, "Reconnecting dependent");
                if let Err(e) = control.reconnect(daemon, dependent).await {
                    error!(daemon, dependent = %dependent, error = %e, "Reconnect failed");
                }
            }
        }
        Err(e) => error!(daemon, error = %e, "Could not list dependents"),
    }

    warn!(daemon, "Restart sequence end");
    RestartReport::success()
}

// ---------------------------------------------------------------------------
// Verified restart
// ---------------------------------------------------------------------------

/// [`restart_daemon`], then confirm from process metadata that a new process
/// is running.
///
/// The baseline is read before the stop, and `source` is polled every
/// `poll_interval` while the sequence runs so the down phase between stop and
/// start is seen by the watch.
pub async fn restart_and_verify(
    control: &dyn DaemonControl,
    source: &dyn SnapshotSource,
    daemon: &str,
    plan: &RestartPlan,
    policy: EvidencePolicy,
) -> RestartReport {
    let baseline = match source.snapshot(daemon).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(daemon, error = %e, "No baseline status, verifying from down/up only");
            ProcessSnapshot::default()
        }
    };
    let mut watch = RestartWatch::new(baseline, Utc::now(), policy);

    let (done_tx, mut done_rx) = oneshot::channel::<()>();
    let sequence = async move {
        let report = restart_daemon(control, daemon, plan).await;
        let _ = done_tx.send(());
        report
    };
    let observer = observe_until(source, daemon, &mut watch, plan.poll_interval, &mut done_rx);
    let (report, ()) = tokio::join!(sequence, observer);
    if !report.ok {
        return report;
    }

    let verdict = wait_for_restart(
        source,
        daemon,
        &mut watch,
        plan.poll_attempts,
        plan.poll_interval,
    )
    .await;
    if verdict.is_restarted() {
        info!(daemon, ?verdict, "Restart confirmed");
        report
    } else {
        warn!(daemon, ?verdict, saw_down = watch.saw_down(), "Restart not confirmed");
        RestartReport::failure(format!("{daemon} restart not confirmed"))
    }
}

/// Feed snapshots to `watch` until `done` fires.
async fn observe_until(
    source: &dyn SnapshotSource,
    daemon: &str,
    watch: &mut RestartWatch,
    interval: Duration,
    done: &mut oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut *done => return,
            snapshot = source.snapshot(daemon) => match snapshot {
                Ok(snapshot) => {
                    let verdict = watch.observe(&snapshot);
                    debug!(daemon, ?verdict, saw_down = watch.saw_down(), "Observed during restart");
                }
                Err(e) => debug!(daemon, error = %e, "Status unavailable during restart"),
            },
        }
        tokio::select! {
            _ = &mut *done => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Wire implementation
// ---------------------------------------------------------------------------

/// [`DaemonControl`] over one-shot control requests.
///
/// Stop and start go to the daemon's endpoint addressed to its `manager`
/// (or to the daemon itself when none is configured) as
/// `Daemon/Process/Stop|Run` with `Process: <daemon>`. Liveness is the
/// endpoint's `liveness` command (`Camera/Information/Status` unless
/// configured); dependents are reconnected with
/// `Camera/Operation/Connect` carrying `IP: <dependent>`.
#[derive(Debug, Clone)]
pub struct WireDaemonControl {
    name: String,
    daemons: BTreeMap<String, DaemonEndpoint>,
    timeout: Duration,
}

impl WireDaemonControl {
    pub fn new(config: &ControlConfig) -> Self {
        Self {
            name: config.name.clone(),
            daemons: config.daemons.clone(),
            timeout: config.restart.probe_timeout(),
        }
    }

    fn endpoint(&self, daemon: &str) -> KernelResult<&DaemonEndpoint> {
        self.daemons
            .get(daemon)
            .ok_or_else(|| KernelError::UnknownDaemon(daemon.to_string()))
    }

    async fn process_command(&self, daemon: &str, action: &str) -> KernelResult<()> {
        let endpoint = self.endpoint(daemon)?;
        let to = endpoint.manager.as_deref().unwrap_or(daemon);
        let req = Envelope::request(CommandPath::new("Daemon", "Process", action), &self.name, to)
            .with("Process", daemon);
        let reply = request(&endpoint.addr(), &req, self.timeout).await?;
        check_result(&reply)
    }
}

#[async_trait]
impl DaemonControl for WireDaemonControl {
    async fn stop(&self, daemon: &str) -> KernelResult<()> {
        self.process_command(daemon, "Stop").await
    }

    async fn start(&self, daemon: &str) -> KernelResult<()> {
        self.process_command(daemon, "Run").await
    }

    async fn probe(&self, daemon: &str) -> KernelResult<()> {
        let endpoint = self.endpoint(daemon)?;
        let req = Envelope::request(endpoint.liveness_path()?, &self.name, daemon)
            .with("Action", "get");
        request(&endpoint.addr(), &req, self.timeout).await.map(|_| ())
    }

    async fn dependents(&self, daemon: &str) -> KernelResult<Vec<String>> {
        Ok(self.endpoint(daemon)?.dependents.clone())
    }

    async fn reconnect(&self, daemon: &str, dependent: &str) -> KernelResult<()> {
        let endpoint = self.endpoint(daemon)?;
        let req = Envelope::request(
            CommandPath::new("Camera", "Operation", "Connect"),
            &self.name,
            daemon,
        )
        .with("IP", dependent);
        let reply = request(&endpoint.addr(), &req, self.timeout).await?;
        check_result(&reply)
    }
}
