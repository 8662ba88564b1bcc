//! Restart verification.
//!
//! "The daemon answered" is not proof that it restarted. A [`RestartWatch`]
//! compares process metadata taken before the restart command (the baseline)
//! with fresh snapshots and decides, rule by rule, whether the process is a
//! new one:
//!
//! 1. not running → not restarted
//! 2. PID changed → restarted
//! 3. started at or after the command (minus slack) → restarted
//! 4. uptime dropped below `ratio × baseline` *and* a down phase was seen → restarted
//! 5. no metadata on either snapshot → restarted iff a down phase was seen
//! 6. otherwise → not yet

use crate::error::KernelResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fourd_types::config::RestartConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Process metadata pulled from a status reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    /// `None` when the status could not be read at all.
    pub running: Option<bool>,
    pub pid: Option<u64>,
    /// Seconds.
    pub uptime: Option<f64>,
    /// Unix time in seconds.
    pub start_ts: Option<f64>,
}

impl ProcessSnapshot {
    pub fn is_running(&self) -> bool {
        self.running == Some(true)
    }

    /// Whether any of pid, uptime or start time is known.
    pub fn has_metadata(&self) -> bool {
        self.pid.is_some() || self.uptime.is_some() || self.start_ts.is_some()
    }

    /// Extract the entry named `process` from a status object.
    ///
    /// The process list may live under `data` (object of entries),
    /// `processes` (array) or `executables` (array). Older daemons spell the
    /// fields `process_id`, `uptime_sec` and `started_at`.
    pub fn from_status(status: &Value, process: &str) -> Option<Self> {
        let entry = process_entries(status)
            .into_iter()
            .find(|p| p.get("name").and_then(Value::as_str) == Some(process))?;

        Some(Self {
            running: Some(entry.get("running").is_some_and(truthy)),
            pid: first_present(entry, &["pid", "process_id"]).and_then(as_pid),
            uptime: first_present(entry, &["uptime", "uptime_sec"]).and_then(as_float),
            start_ts: first_present(entry, &["start_ts", "started_at"]).and_then(as_float),
        })
    }
}

fn process_entries(status: &Value) -> Vec<&Value> {
    if let Some(data) = status.get("data").and_then(Value::as_object) {
        return data.values().collect();
    }
    for key in ["processes", "executables"] {
        if let Some(list) = status.get(key).and_then(Value::as_array) {
            return list.iter().collect();
        }
    }
    Vec::new()
}

/// First of `keys` whose value is truthy (so `0`, `""` and `null` fall through).
fn first_present<'a>(entry: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().filter_map(|k| entry.get(*k)).find(|v| truthy(v))
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_float(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_pid(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

/// Thresholds for the weaker evidence rules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvidencePolicy {
    pub uptime_reset_ratio: f64,
    pub start_ts_slack: Duration,
}

impl Default for EvidencePolicy {
    fn default() -> Self {
        Self::from(&RestartConfig::default())
    }
}

impl From<&RestartConfig> for EvidencePolicy {
    fn from(config: &RestartConfig) -> Self {
        Self {
            uptime_reset_ratio: config.uptime_reset_ratio,
            start_ts_slack: config.start_ts_slack(),
        }
    }
}

/// Outcome of comparing a snapshot against the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    NotRunning,
    PidChanged,
    StartedAfterCommand,
    UptimeReset,
    /// No metadata anywhere; a down → up transition was observed.
    DownUpObserved,
    /// Running, but no evidence of a new process yet.
    Pending,
}

impl Verdict {
    pub fn is_restarted(self) -> bool {
        matches!(
            self,
            Self::PidChanged | Self::StartedAfterCommand | Self::UptimeReset | Self::DownUpObserved
        )
    }
}

/// Apply the evidence rules in order.
pub fn evaluate(
    base: &ProcessSnapshot,
    cur: &ProcessSnapshot,
    sent_at: DateTime<Utc>,
    saw_down: bool,
    policy: &EvidencePolicy,
) -> Verdict {
    if !cur.is_running() {
        return Verdict::NotRunning;
    }
    if let (Some(before), Some(now)) = (base.pid, cur.pid) {
        if before != now {
            return Verdict::PidChanged;
        }
    }
    if let Some(start_ts) = cur.start_ts {
        let threshold = epoch_secs(sent_at) - policy.start_ts_slack.as_secs_f64();
        if start_ts >= threshold {
            return Verdict::StartedAfterCommand;
        }
    }
    if let (Some(before), Some(now)) = (base.uptime, cur.uptime) {
        if now < policy.uptime_reset_ratio * before && saw_down {
            return Verdict::UptimeReset;
        }
    }
    if !base.has_metadata() && !cur.has_metadata() && saw_down {
        return Verdict::DownUpObserved;
    }
    Verdict::Pending
}

/// Shorthand for `evaluate(..).is_restarted()`.
pub fn is_restarted(
    base: &ProcessSnapshot,
    cur: &ProcessSnapshot,
    sent_at: DateTime<Utc>,
    saw_down: bool,
    policy: &EvidencePolicy,
) -> bool {
    evaluate(base, cur, sent_at, saw_down, policy).is_restarted()
}

fn epoch_secs(t: DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64 / 1000.0
}

// ---------------------------------------------------------------------------
// Watching
// ---------------------------------------------------------------------------

/// Tracks one restart from the moment the command was sent.
#[derive(Debug, Clone)]
pub struct RestartWatch {
    baseline: ProcessSnapshot,
    sent_at: DateTime<Utc>,
    saw_down: bool,
    policy: EvidencePolicy,
}

impl RestartWatch {
    pub fn new(baseline: ProcessSnapshot, sent_at: DateTime<Utc>, policy: EvidencePolicy) -> Self {
        Self {
            baseline,
            sent_at,
            saw_down: false,
            policy,
        }
    }

    pub fn saw_down(&self) -> bool {
        self.saw_down
    }

    /// Fold in a new snapshot and judge it.
    ///
    /// An explicit `running: false` marks the down phase; an unreadable
    /// status (`running: None`) does not.
    pub fn observe(&mut self, cur: &ProcessSnapshot) -> Verdict {
        if cur.running == Some(false) {
            self.saw_down = true;
        }
        evaluate(&self.baseline, cur, self.sent_at, self.saw_down, &self.policy)
    }
}

/// Where snapshots come from.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self, process: &str) -> KernelResult<ProcessSnapshot>;
}

/// Poll `source` until the watch reports a restart or `attempts` polls pass.
///
/// Failed polls count as unknown snapshots. Returns the last verdict.
pub async fn wait_for_restart(
    source: &dyn SnapshotSource,
    process: &str,
    watch: &mut RestartWatch,
    attempts: u32,
    interval: Duration,
) -> Verdict {
    let mut verdict = Verdict::Pending;
    for attempt in 0..attempts.max(1) {
        let snapshot = match source.snapshot(process).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(process, attempt = attempt + 1, error = %e, "Status poll failed");
                ProcessSnapshot::default()
            }
        };
        verdict = watch.observe(&snapshot);
        debug!(process, attempt = attempt + 1, ?verdict, saw_down = watch.saw_down(), "Restart poll");
        if verdict.is_restarted() {
            return verdict;
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelError;
    use serde_json::json;
    use std::sync::Mutex;

    fn snap(running: bool, pid: Option<u64>, uptime: Option<f64>) -> ProcessSnapshot {
        ProcessSnapshot {
            running: Some(running),
            pid,
            uptime,
            start_ts: None,
        }
    }

    fn policy() -> EvidencePolicy {
        EvidencePolicy::default()
    }

    #[test]
    fn test_pid_change_is_restart() {
        let base = snap(true, Some(1), Some(100.0));
        let cur = snap(true, Some(2), Some(5.0));
        assert_eq!(
            evaluate(&base, &cur, Utc::now(), false, &policy()),
            Verdict::PidChanged
        );
    }

    #[test]
    fn test_identical_metadata_is_not_restart() {
        let mut base = snap(true, Some(7), Some(100.0));
        base.start_ts = Some(1_000.0);
        let cur = base.clone();
        assert!(!is_restarted(&base, &cur, Utc::now(), false, &policy()));
    }

    #[test]
    fn test_no_metadata_falls_back_to_saw_down() {
        let base = ProcessSnapshot::default();
        let cur = snap(true, None, None);
        assert_eq!(
            evaluate(&base, &cur, Utc::now(), true, &policy()),
            Verdict::DownUpObserved
        );
        assert_eq!(
            evaluate(&base, &cur, Utc::now(), false, &policy()),
            Verdict::Pending
        );
    }

    #[test]
    fn test_not_running_never_restarted() {
        let base = snap(true, Some(1), None);
        let cur = snap(false, Some(2), None);
        assert_eq!(
            evaluate(&base, &cur, Utc::now(), true, &policy()),
            Verdict::NotRunning
        );
        assert_eq!(
            evaluate(&base, &ProcessSnapshot::default(), Utc::now(), true, &policy()),
            Verdict::NotRunning
        );
    }

    #[test]
    fn test_start_ts_within_slack() {
        let sent_at = Utc::now();
        let sent = epoch_secs(sent_at);
        let base = snap(true, Some(5), None);
        let mut cur = snap(true, Some(5), None);

        cur.start_ts = Some(sent - 0.1);
        assert_eq!(
            evaluate(&base, &cur, sent_at, false, &policy()),
            Verdict::StartedAfterCommand
        );

        cur.start_ts = Some(sent - 5.0);
        assert_eq!(
            evaluate(&base, &cur, sent_at, false, &policy()),
            Verdict::Pending
        );
    }

    #[test]
    fn test_uptime_reset_needs_down_phase() {
        let base = snap(true, None, Some(100.0));
        let cur = snap(true, None, Some(3.0));
        assert_eq!(
            evaluate(&base, &cur, Utc::now(), false, &policy()),
            Verdict::Pending
        );
        assert_eq!(
            evaluate(&base, &cur, Utc::now(), true, &policy()),
            Verdict::UptimeReset
        );

        let lax = EvidencePolicy {
            uptime_reset_ratio: 0.01,
            ..policy()
        };
        assert_eq!(
            evaluate(&base, &cur, Utc::now(), true, &lax),
            Verdict::Pending
        );
    }

    #[test]
    fn test_watch_remembers_down_phase() {
        let mut watch = RestartWatch::new(ProcessSnapshot::default(), Utc::now(), policy());
        assert_eq!(watch.observe(&ProcessSnapshot::default()), Verdict::NotRunning);
        assert!(!watch.saw_down());
        assert_eq!(watch.observe(&snap(false, None, None)), Verdict::NotRunning);
        assert!(watch.saw_down());
        assert_eq!(
            watch.observe(&snap(true, None, None)),
            Verdict::DownUpObserved
        );
    }

    #[test]
    fn test_from_status_variants() {
        let data = json!({
            "data": {
                "CCd": { "name": "CCd", "running": true, "pid": 4242, "uptime": "12.5", "start_ts": 1700000000.25 }
            }
        });
        let snap = ProcessSnapshot::from_status(&data, "CCd").unwrap();
        assert_eq!(snap.running, Some(true));
        assert_eq!(snap.pid, Some(4242));
        assert_eq!(snap.uptime, Some(12.5));
        assert_eq!(snap.start_ts, Some(1_700_000_000.25));

        let processes = json!({
            "processes": [
                { "name": "AId", "running": 1, "process_id": "77", "uptime_sec": 3, "started_at": "bogus" },
            ]
        });
        let snap = ProcessSnapshot::from_status(&processes, "AId").unwrap();
        assert_eq!(snap.running, Some(true));
        assert_eq!(snap.pid, Some(77));
        assert_eq!(snap.uptime, Some(3.0));
        assert_eq!(snap.start_ts, None);

        let executables = json!({
            "executables": [ { "name": "MMd", "running": false, "pid": 0 } ]
        });
        let snap = ProcessSnapshot::from_status(&executables, "MMd").unwrap();
        assert_eq!(snap.running, Some(false));
        assert_eq!(snap.pid, None);
        assert!(!snap.has_metadata());

        assert!(ProcessSnapshot::from_status(&executables, "CCd").is_none());
        assert!(ProcessSnapshot::from_status(&json!({}), "CCd").is_none());
    }

    struct Scripted {
        snapshots: Mutex<Vec<KernelResult<ProcessSnapshot>>>,
    }

    #[async_trait]
    impl SnapshotSource for Scripted {
        async fn snapshot(&self, _process: &str) -> KernelResult<ProcessSnapshot> {
            let mut list = self.snapshots.lock().unwrap();
            if list.is_empty() {
                Ok(snap(true, Some(1), None))
            } else {
                list.remove(0)
            }
        }
    }

    #[tokio::test]
    async fn test_wait_for_restart_sees_new_pid() {
        let source = Scripted {
            snapshots: Mutex::new(vec![
                Err(KernelError::RestartFailed("unreachable".into())),
                Ok(snap(false, None, None)),
                Ok(snap(true, Some(2), None)),
            ]),
        };
        let mut watch = RestartWatch::new(snap(true, Some(1), None), Utc::now(), policy());
        let verdict =
            wait_for_restart(&source, "CCd", &mut watch, 5, Duration::from_millis(1)).await;
        assert_eq!(verdict, Verdict::PidChanged);
        assert!(watch.saw_down());
    }

    #[tokio::test]
    async fn test_wait_for_restart_gives_up() {
        let source = Scripted {
            snapshots: Mutex::new(Vec::new()),
        };
        let mut watch = RestartWatch::new(snap(true, Some(1), None), Utc::now(), policy());
        let verdict =
            wait_for_restart(&source, "CCd", &mut watch, 3, Duration::from_millis(1)).await;
        assert_eq!(verdict, Verdict::Pending);
    }
}
