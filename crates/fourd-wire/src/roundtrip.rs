//! One-shot request/response over a fresh TCP connection.

use crate::error::WireError;
use crate::frame;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Connect to `addr`, write `body` as one frame, read one frame back and
/// close. The whole exchange must finish within `timeout`.
pub async fn roundtrip(addr: &str, body: &str, timeout: Duration) -> Result<String, WireError> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| WireError::Connect(format!("{addr}: {e}")))?;
        stream.write_all(&frame::encode(body.as_bytes())?).await?;
        let reply = frame::read_frame(&mut stream).await?;
        let _ = stream.shutdown().await;
        Ok::<_, WireError>(reply)
    };

    let reply = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| WireError::Timeout)??;
    debug!(addr, len = reply.len(), "Round trip complete");
    String::from_utf8(reply).map_err(|e| WireError::Send(format!("reply is not UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_roundtrip_echo() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut peer, _) = server.accept().await.unwrap();
            let body = frame::read_frame(&mut peer).await.unwrap();
            let mut reply = b"re:".to_vec();
            reply.extend_from_slice(&body);
            peer.write_all(&frame::encode(&reply).unwrap()).await.unwrap();
        });

        let reply = roundtrip(&addr, "status", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, "re:status");
    }

    #[tokio::test]
    async fn test_roundtrip_times_out_on_silent_peer() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let _hold = tokio::spawn(async move {
            let (peer, _) = server.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(peer);
        });

        let result = roundtrip(&addr, "status", Duration::from_millis(200)).await;
        assert!(matches!(result, Err(WireError::Timeout)));
    }
}
