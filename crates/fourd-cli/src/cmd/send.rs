//! `fourd send` and `fourd probe`.

use super::{fail, runtime};
use fourd_kernel::{config::load_config, request, retry, RetryPolicy, SnapshotSource, StatusProbe};
use fourd_types::{CommandPath, Envelope, SendState};
use fourd_wire::{Connection, HandlerError, MessageContext};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Split `key=value`. The value is taken as JSON when it parses, else as a string.
pub(crate) fn parse_assignment(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn split_addr(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    Some((host, port.parse().ok()?))
}

pub fn cmd_send(
    config: Option<PathBuf>,
    addr: &str,
    path: CommandPath,
    to: &str,
    state: SendState,
    assignments: &[String],
) {
    let cfg = load_config(config.as_deref());
    let mut envelope = Envelope::new(path, cfg.name.clone(), to, state);
    for raw in assignments {
        match parse_assignment(raw) {
            Ok((key, value)) => {
                envelope.insert(key, value);
            }
            Err(e) => fail(&e),
        }
    }
    if let Err(e) = envelope.validate() {
        fail(&format!("Invalid envelope: {e}"));
    }

    let policy = RetryPolicy::from(&cfg.retry);
    let timeout = cfg.connection.connect_timeout();
    let rt = runtime();

    if state != SendState::Request {
        // No reply is expected: write the frame on a plain connection and leave.
        let Some((host, port)) = split_addr(addr) else {
            fail(&format!("Expected host:port, got '{addr}'"));
        };
        let body = match envelope.to_json() {
            Ok(body) => body,
            Err(e) => fail(&e.to_string()),
        };
        let result = rt.block_on(async {
            let conn = Connection::new(cfg.connection.join_timeout());
            let ignore = |_ctx: MessageContext, _body: String| async { Ok::<(), HandlerError>(()) };
            let sent = match retry(&policy, || conn.connect(host, port, Arc::new(ignore), timeout)).await {
                Ok(()) => conn.send(&body).await,
                Err(e) => Err(e),
            };
            conn.close().await;
            sent
        });
        match result {
            Ok(()) => info!(addr, token = %envelope.token, "Sent"),
            Err(e) => fail(&e.to_string()),
        }
        return;
    }

    let result = rt.block_on(retry(&policy, || request(addr, &envelope, timeout)));
    match result {
        Ok(reply) => match serde_json::to_string_pretty(&reply) {
            Ok(text) => println!("{text}"),
            Err(e) => fail(&e.to_string()),
        },
        Err(e) => fail(&e.to_string()),
    }
}

pub fn cmd_probe(config: Option<PathBuf>, addr: &str, process: &str, to: Option<&str>) {
    let cfg = load_config(config.as_deref());
    let probe = StatusProbe::new(
        addr,
        cfg.name.clone(),
        to.unwrap_or(process),
        cfg.restart.probe_timeout(),
    );
    let snapshot = match runtime().block_on(probe.snapshot(process)) {
        Ok(snapshot) => snapshot,
        Err(e) => fail(&e.to_string()),
    };
    match serde_json::to_string_pretty(&snapshot) {
        Ok(text) => println!("{text}"),
        Err(e) => fail(&e.to_string()),
    }
}
