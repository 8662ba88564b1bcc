//! Command dispatch and recovery for 4D daemons.
//!
//! Sits on top of `fourd-wire`: decodes envelopes, routes them to command
//! handlers, retries outbound requests, and drives stop/start/verify
//! restarts of remote daemons.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod orchestrator;
pub mod probe;
pub mod restart;
pub mod retry;

pub use config::load_config;
pub use dispatcher::{version_handler, version_path, CommandHandler, CommandResult, Dispatcher};
pub use error::{KernelError, KernelResult};
pub use orchestrator::{
    restart_and_verify, restart_daemon, DaemonControl, RestartPlan, RestartReport,
    WireDaemonControl,
};
pub use probe::{check_result, request, StatusProbe};
pub use restart::{
    evaluate, is_restarted, wait_for_restart, EvidencePolicy, ProcessSnapshot, RestartWatch,
    SnapshotSource, Verdict,
};
pub use retry::{retry, retry_if, Backoff, RetryPolicy};
