//! `fourd restart`.

use super::{fail, runtime};
use fourd_kernel::{
    config::load_config, restart_and_verify, restart_daemon, EvidencePolicy, RestartPlan,
    RestartReport, StatusProbe, WireDaemonControl,
};
use fourd_types::ControlConfig;
use std::path::PathBuf;

pub fn cmd_restart(config: Option<PathBuf>, daemon: &str, verify: bool) {
    let cfg = load_config(config.as_deref());
    if !cfg.daemons.contains_key(daemon) {
        fail(&format!("No [daemons.{daemon}] entry in config"));
    }

    let report = runtime().block_on(run(&cfg, daemon, verify));
    match serde_json::to_string(&report) {
        Ok(text) => println!("{text}"),
        Err(e) => fail(&e.to_string()),
    }
    if !report.ok {
        std::process::exit(1);
    }
}

async fn run(cfg: &ControlConfig, daemon: &str, verify: bool) -> RestartReport {
    let control = WireDaemonControl::new(cfg);
    let plan = RestartPlan::from(&cfg.restart);
    let Some(endpoint) = cfg.daemons.get(daemon).filter(|_| verify) else {
        return restart_daemon(&control, daemon, &plan).await;
    };

    // Process status comes from the manager that starts and stops the daemon.
    let probe = StatusProbe::new(
        endpoint.addr(),
        cfg.name.clone(),
        endpoint.manager.as_deref().unwrap_or(daemon),
        cfg.restart.probe_timeout(),
    );
    restart_and_verify(
        &control,
        &probe,
        daemon,
        &plan,
        EvidencePolicy::from(&cfg.restart),
    )
    .await
}
