//! Per-data-stream bridge: SNI routing, TLS termination or passthrough,
//! and the bidirectional copy to the loopback backend.
//!
//! Every failure here is confined to its own stream. Dropping the stream is
//! the close; the ingress side observes EOF/reset and tears down its end.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::certs::{acceptor_for, CertManager};

use super::sni::{peek_sni, PrefixedStream};

pub const PEEK_TIMEOUT: Duration = Duration::from_secs(5);
pub const BACKEND_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Hostname → loopback port, read-only for the lifetime of a session.
pub type EndpointMap = Arc<HashMap<String, u16>>;

/// Shared routing context handed to every data-stream task.
#[derive(Clone)]
pub struct StreamContext {
    pub endpoints: EndpointMap,
    /// Present when TLS is terminated at HQ; absent in passthrough mode.
    pub cert_manager: Option<Arc<dyn CertManager>>,
}

/// Handle one ingress-opened data stream to completion.
pub async fn handle_stream<S>(ctx: StreamContext, mut stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (hostname, peeked) = match timeout(PEEK_TIMEOUT, peek_sni(&mut stream)).await {
        Ok(Ok(peeked)) => peeked,
        Ok(Err(e)) => {
            info!(error = %e, "closing data stream: SNI peek failed");
            return;
        }
        Err(_) => {
            info!(deadline_secs = PEEK_TIMEOUT.as_secs(), "closing data stream: SNI peek timed out");
            return;
        }
    };

    let Some(&local_port) = ctx.endpoints.get(&hostname) else {
        info!(%hostname, "closing data stream: hostname not in endpoint set");
        return;
    };

    let stream = PrefixedStream::new(peeked, stream);
    let result = match &ctx.cert_manager {
        Some(manager) => terminate(manager.as_ref(), &hostname, local_port, stream).await,
        None => passthrough(&hostname, local_port, stream).await,
    };
    if let Err(e) = result {
        warn!(%hostname, local_port, error = %e, "data stream ended with error");
    }
}

/// Terminate TLS at HQ with a per-stream certificate fetch, then relay
/// plaintext to the loopback backend.
async fn terminate<S>(
    manager: &dyn CertManager,
    hostname: &str,
    local_port: u16,
    stream: PrefixedStream<S>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let chain = manager
        .obtain(hostname)
        .await
        .map_err(|e| anyhow::anyhow!("certificate unavailable: {e}"))?;
    let acceptor = acceptor_for(chain)?;

    let mut tls = timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream))
        .await
        .map_err(|_| anyhow::anyhow!("TLS handshake timed out"))??;

    let mut backend = dial_backend(local_port).await?;
    debug!(%hostname, local_port, "terminating TLS and bridging to backend");

    let (to_backend, from_backend) = copy_bidirectional(&mut tls, &mut backend).await?;
    debug!(%hostname, to_backend, from_backend, "data stream completed");
    Ok(())
}

/// Forward raw bytes, ClientHello included, to the backend. TLS stays
/// opaque to HQ in this mode.
async fn passthrough<S>(
    hostname: &str,
    local_port: u16,
    mut stream: PrefixedStream<S>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut backend = dial_backend(local_port).await?;
    debug!(%hostname, local_port, "passing TLS through to backend");

    let (to_backend, from_backend) = copy_bidirectional(&mut stream, &mut backend).await?;
    debug!(%hostname, to_backend, from_backend, "data stream completed");
    Ok(())
}

async fn dial_backend(local_port: u16) -> anyhow::Result<TcpStream> {
    timeout(
        BACKEND_DIAL_TIMEOUT,
        TcpStream::connect(("127.0.0.1", local_port)),
    )
    .await
    .map_err(|_| anyhow::anyhow!("backend dial timed out after {BACKEND_DIAL_TIMEOUT:?}"))?
    .map_err(|e| anyhow::anyhow!("backend dial failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::sni::tests::client_hello;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn ctx_for(hostname: &str, port: u16) -> StreamContext {
        StreamContext {
            endpoints: Arc::new(HashMap::from([(hostname.to_string(), port)])),
            cert_manager: None,
        }
    }

    #[tokio::test]
    async fn passthrough_prepends_peeked_bytes() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = backend.local_addr().unwrap().port();
        let echo = tokio::spawn(async move {
            let (mut conn, _) = backend.accept().await.unwrap();
            let mut received = Vec::new();
            conn.read_to_end(&mut received).await.unwrap();
            received
        });

        let hello = client_hello(Some("a.example"));
        let (mut ingress, hq_side) = tokio::io::duplex(64 * 1024);
        let handler = tokio::spawn(handle_stream(ctx_for("a.example", port), hq_side));

        ingress.write_all(&hello).await.unwrap();
        ingress.write_all(b"ping").await.unwrap();
        ingress.shutdown().await.unwrap();

        let received = echo.await.unwrap();
        assert_eq!(&received[..hello.len()], &hello[..]);
        assert_eq!(&received[hello.len()..], b"ping");
        handler.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_hostname_closes_without_backend_dial() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = backend.local_addr().unwrap().port();

        let hello = client_hello(Some("unknown.example"));
        let (mut ingress, hq_side) = tokio::io::duplex(64 * 1024);
        let handler = tokio::spawn(handle_stream(ctx_for("a.example", port), hq_side));

        ingress.write_all(&hello).await.unwrap();

        // The handler drops the stream; our read side sees EOF promptly.
        let mut buf = [0u8; 1];
        let n = ingress.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        handler.await.unwrap();

        // No connection may have been attempted against the backend.
        let dialed = timeout(Duration::from_millis(200), backend.accept()).await;
        assert!(dialed.is_err(), "backend must not be dialed for unknown SNI");
    }

    #[tokio::test]
    async fn garbage_instead_of_client_hello_closes_stream() {
        let (mut ingress, hq_side) = tokio::io::duplex(1024);
        let handler = tokio::spawn(handle_stream(ctx_for("a.example", 1), hq_side));

        ingress.write_all(b"plainly not TLS").await.unwrap();
        let mut buf = [0u8; 1];
        let n = ingress.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        handler.await.unwrap();
    }
}
