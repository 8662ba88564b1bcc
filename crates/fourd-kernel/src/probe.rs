//! One-shot requests and process status probes.

use crate::error::{KernelError, KernelResult};
use crate::restart::{ProcessSnapshot, SnapshotSource};
use async_trait::async_trait;
use fourd_types::{CommandPath, Envelope, RESULT_OK};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Send `request` on a fresh connection and decode the single reply.
pub async fn request(addr: &str, request: &Envelope, timeout: Duration) -> KernelResult<Envelope> {
    let body = request.to_json()?;
    let text = fourd_wire::roundtrip(addr, &body, timeout).await?;
    let reply = Envelope::from_json(&text)?;
    if reply.token != request.token {
        debug!(addr, sent = %request.token, got = %reply.token, "Reply token differs from request");
    }
    Ok(reply)
}

/// Turn a non-success `ResultCode` into an error. A missing code is success.
pub fn check_result(reply: &Envelope) -> KernelResult<()> {
    match reply.result_code() {
        Some(code) if code != RESULT_OK => Err(KernelError::Remote {
            code,
            message: reply.get_str("ErrorMsg").unwrap_or_default().to_string(),
        }),
        _ => Ok(()),
    }
}

/// Queries a daemon's `Daemon/Information/Status` for its process table.
#[derive(Debug, Clone)]
pub struct StatusProbe {
    addr: String,
    from: String,
    to: String,
    timeout: Duration,
}

impl StatusProbe {
    pub fn new(
        addr: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            addr: addr.into(),
            from: from.into(),
            to: to.into(),
            timeout,
        }
    }

    /// The whole reply as a JSON object.
    pub async fn fetch(&self) -> KernelResult<Value> {
        let req = Envelope::request(
            CommandPath::new("Daemon", "Information", "Status"),
            &self.from,
            &self.to,
        )
        .with("Action", "get");
        let reply = request(&self.addr, &req, self.timeout).await?;
        check_result(&reply)?;
        Ok(serde_json::to_value(&reply).map_err(fourd_types::EnvelopeError::from)?)
    }
}

#[async_trait]
impl SnapshotSource for StatusProbe {
    /// A process missing from the table yields an all-unknown snapshot.
    async fn snapshot(&self, process: &str) -> KernelResult<ProcessSnapshot> {
        let status = self.fetch().await?;
        Ok(ProcessSnapshot::from_status(&status, process).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_result() {
        let req = Envelope::request(CommandPath::new("a", "b", "c"), "x", "y");
        assert!(check_result(&req).is_ok());

        let mut ok = req.reply();
        ok.set_result(RESULT_OK, "");
        assert!(check_result(&ok).is_ok());

        let mut failed = req.reply();
        failed.set_result(2001, "camera offline");
        match check_result(&failed) {
            Err(KernelError::Remote { code, message }) => {
                assert_eq!(code, 2001);
                assert_eq!(message, "camera offline");
            }
            other => panic!("expected Remote error, got {other:?}"),
        }
    }
}
