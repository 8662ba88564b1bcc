//! Configuration types, deserialised from `~/.fourd/config.toml`.
//!
//! Every section is optional; missing keys take the defaults below.

use crate::envelope::CommandPath;
use crate::error::EnvelopeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Liveness command used when an endpoint names none.
pub const DEFAULT_LIVENESS_PATH: &str = "Camera/Information/Status";

/// Root configuration for one daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// This daemon's logical id, written to `From` on outgoing envelopes.
    pub name: String,
    /// Substituted for a blank `From` on inbound traffic from older senders.
    pub default_sender: String,
    pub listener: ListenerConfig,
    pub connection: ConnectionConfig,
    pub retry: RetryConfig,
    pub restart: RestartConfig,
    /// Remote daemons this one can control, keyed by logical id.
    pub daemons: BTreeMap<String, DaemonEndpoint>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            name: "OMs".to_string(),
            default_sender: "4DPD".to_string(),
            listener: ListenerConfig::default(),
            connection: ConnectionConfig::default(),
            retry: RetryConfig::default(),
            restart: RestartConfig::default(),
            daemons: BTreeMap::new(),
        }
    }
}

/// Server-role settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    /// Outbound frames buffered per session before broadcast reports it full.
    pub session_queue: usize,
    pub join_timeout_ms: u64,
    pub accept_join_timeout_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 19300,
            session_queue: 256,
            join_timeout_ms: 2000,
            accept_join_timeout_ms: 3000,
        }
    }
}

impl ListenerConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn accept_join_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_join_timeout_ms)
    }
}

/// Client-role settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_timeout_ms: u64,
    pub join_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3000,
            join_timeout_ms: 2000,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// How the delay between retry attempts grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total calls, including the first.
    pub attempts: u32,
    pub delay_ms: u64,
    pub backoff: BackoffKind,
    /// Ceiling for exponential backoff.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 500,
            backoff: BackoffKind::Fixed,
            max_delay_ms: 30_000,
        }
    }
}

/// Timing and evidence thresholds for the restart sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Pause between stop and start.
    pub settle_ms: u64,
    pub poll_attempts: u32,
    pub poll_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Pause between dependent reconnects.
    pub reconnect_delay_ms: u64,
    /// Uptime below `ratio * baseline` counts as a reset.
    pub uptime_reset_ratio: f64,
    /// Tolerated clock skew when comparing `start_ts` to the command time.
    pub start_ts_slack_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            settle_ms: 1000,
            poll_attempts: 20,
            poll_interval_ms: 500,
            probe_timeout_ms: 2000,
            reconnect_delay_ms: 100,
            uptime_reset_ratio: 0.5,
            start_ts_slack_ms: 200,
        }
    }
}

impl RestartConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn start_ts_slack(&self) -> Duration {
        Duration::from_millis(self.start_ts_slack_ms)
    }
}

/// Where a remote daemon listens and what depends on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonEndpoint {
    pub host: String,
    pub port: u16,
    /// Resources to reconnect after a restart (camera IPs for `CCd`).
    #[serde(default)]
    pub dependents: Vec<String>,
    /// Logical id of the daemon that starts and stops this one.
    /// Stop/run requests go to the same endpoint, addressed to this id.
    #[serde(default)]
    pub manager: Option<String>,
    /// Command answered once the daemon is back, e.g.
    /// `"Daemon/Information/Version"`. Sent as a request with `Action: get`.
    #[serde(default)]
    pub liveness: Option<String>,
}

impl DaemonEndpoint {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Configured liveness command, or [`DEFAULT_LIVENESS_PATH`].
    pub fn liveness_path(&self) -> Result<CommandPath, EnvelopeError> {
        self.liveness
            .as_deref()
            .unwrap_or(DEFAULT_LIVENESS_PATH)
            .parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControlConfig::default();
        assert_eq!(config.listener.port, 19300);
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.restart.poll_attempts, 20);
        assert_eq!(config.restart.uptime_reset_ratio, 0.5);
        assert_eq!(config.restart.start_ts_slack(), Duration::from_millis(200));
        assert!(config.daemons.is_empty());
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let config: ControlConfig = serde_json::from_value(serde_json::json!({
            "name": "AId",
            "retry": { "attempts": 5, "backoff": "exponential" },
            "daemons": {
                "CCd": { "host": "10.0.0.5", "port": 19936, "dependents": ["10.0.0.21"] }
            }
        }))
        .unwrap();
        assert_eq!(config.name, "AId");
        assert_eq!(config.retry.attempts, 5);
        assert_eq!(config.retry.delay_ms, 500);
        assert_eq!(config.retry.backoff, BackoffKind::Exponential);
        let ccd = &config.daemons["CCd"];
        assert_eq!(ccd.addr(), "10.0.0.5:19936");
        assert_eq!(ccd.dependents, vec!["10.0.0.21"]);
        assert!(ccd.manager.is_none());
        assert_eq!(
            ccd.liveness_path().unwrap(),
            CommandPath::new("Camera", "Information", "Status")
        );
        assert_eq!(config.listener, ListenerConfig::default());
    }

    #[test]
    fn test_liveness_path_override() {
        let mut endpoint: DaemonEndpoint = serde_json::from_value(serde_json::json!({
            "host": "10.0.0.7", "port": 19300, "liveness": "Daemon/Information/Version"
        }))
        .unwrap();
        assert_eq!(
            endpoint.liveness_path().unwrap(),
            CommandPath::new("Daemon", "Information", "Version")
        );
        endpoint.liveness = Some("Daemon/Version".into());
        assert!(endpoint.liveness_path().is_err());
    }
}
