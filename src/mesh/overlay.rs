//! Overlay library contract.
//!
//! The production overlay (coordinator enrollment, NAT traversal, WireGuard
//! or equivalent data plane, on-disk node state) lives outside this crate;
//! the embedding server injects it through [`Overlay`]. A loopback-backed
//! development implementation is provided for local runs and tests.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Node identity and coordinator parameters handed to the overlay on start.
/// An empty `auth_key` asks the overlay library for interactive enrollment.
#[derive(Debug, Clone)]
pub struct OverlayOptions {
    pub hostname: String,
    /// Persistent node state, owned by the overlay library.
    pub state_dir: PathBuf,
    pub control_url: String,
    pub auth_key: String,
    pub tags: Vec<String>,
}

/// A remote node on the overlay.
#[derive(Debug, Clone, Serialize)]
pub struct MeshPeer {
    pub hostname: String,
    pub overlay_ip: String,
    pub online: bool,
    /// True when the session to this peer does not traverse a relay.
    pub direct_path: bool,
    pub tags: Vec<String>,
    pub last_seen: Option<SystemTime>,
}

/// Byte stream over the overlay.
pub trait OverlayConn: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T> OverlayConn for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedConn = Box<dyn OverlayConn>;

#[async_trait]
pub trait OverlayListener: Send {
    async fn accept(&mut self) -> std::io::Result<BoxedConn>;
}

/// The overlay node surface this core consumes.
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Tell the node to start. Returns as soon as startup is underway;
    /// address assignment may complete later.
    async fn start(&self, opts: OverlayOptions) -> std::io::Result<()>;

    /// Best-effort close. Node state persists on disk between runs.
    async fn close(&self) -> std::io::Result<()>;

    /// Overlay IPv4 address, once the coordinator has assigned one.
    fn ip4(&self) -> Option<Ipv4Addr>;

    fn ip6(&self) -> Option<Ipv6Addr>;

    /// Current peer enumeration.
    fn peers(&self) -> Vec<MeshPeer>;

    async fn dial(&self, network: &str, addr: &str) -> std::io::Result<BoxedConn>;

    async fn listen(&self, network: &str, addr: &str) -> std::io::Result<Box<dyn OverlayListener>>;
}

/// Development overlay backed by 127.0.0.1 sockets: no coordinator, no
/// peers, "overlay" ports are plain loopback ports. Also serves as the test
/// stub; `with_ip_delay` simulates slow coordinator address assignment.
pub struct LoopbackOverlay {
    ip_delay: Duration,
    started: Mutex<Option<Instant>>,
}

impl LoopbackOverlay {
    pub fn new() -> Self {
        Self::with_ip_delay(Duration::ZERO)
    }

    pub fn with_ip_delay(ip_delay: Duration) -> Self {
        Self {
            ip_delay,
            started: Mutex::new(None),
        }
    }
}

impl Default for LoopbackOverlay {
    fn default() -> Self {
        Self::new()
    }
}

fn require_tcp(network: &str) -> std::io::Result<()> {
    if network == "tcp" {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("unsupported overlay network {network:?}"),
        ))
    }
}

/// Accepts `:port` and `host:port` address forms.
fn parse_port(addr: &str) -> std::io::Result<u16> {
    let port = addr.rsplit(':').next().unwrap_or_default();
    port.parse::<u16>().map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("malformed overlay address {addr:?}"),
        )
    })
}

struct LoopbackListener(TcpListener);

#[async_trait]
impl OverlayListener for LoopbackListener {
    async fn accept(&mut self) -> std::io::Result<BoxedConn> {
        let (conn, peer) = self.0.accept().await?;
        debug!(%peer, "loopback overlay accepted connection");
        Ok(Box::new(conn))
    }
}

#[async_trait]
impl Overlay for LoopbackOverlay {
    async fn start(&self, opts: OverlayOptions) -> std::io::Result<()> {
        debug!(hostname = %opts.hostname, "loopback overlay started");
        *self.started.lock().unwrap() = Some(Instant::now());
        Ok(())
    }

    async fn close(&self) -> std::io::Result<()> {
        *self.started.lock().unwrap() = None;
        Ok(())
    }

    fn ip4(&self) -> Option<Ipv4Addr> {
        let started = (*self.started.lock().unwrap())?;
        (started.elapsed() >= self.ip_delay).then_some(Ipv4Addr::LOCALHOST)
    }

    fn ip6(&self) -> Option<Ipv6Addr> {
        None
    }

    fn peers(&self) -> Vec<MeshPeer> {
        Vec::new()
    }

    async fn dial(&self, network: &str, addr: &str) -> std::io::Result<BoxedConn> {
        require_tcp(network)?;
        let port = parse_port(addr)?;
        let conn = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;
        Ok(Box::new(conn))
    }

    async fn listen(&self, network: &str, addr: &str) -> std::io::Result<Box<dyn OverlayListener>> {
        require_tcp(network)?;
        let port = parse_port(addr)?;
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        Ok(Box::new(LoopbackListener(listener)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn opts() -> OverlayOptions {
        OverlayOptions {
            hostname: "hq".into(),
            state_dir: "/tmp/unused".into(),
            control_url: String::new(),
            auth_key: String::new(),
            tags: vec!["hq".into()],
        }
    }

    #[tokio::test]
    async fn loopback_listen_and_dial_round_trip() {
        let overlay = LoopbackOverlay::new();
        overlay.start(opts()).await.unwrap();
        assert_eq!(overlay.ip4(), Some(Ipv4Addr::LOCALHOST));

        // Overlay listeners are addressed by fixed port.
        let port = 41117;
        let mut listener = overlay.listen("tcp", &format!(":{port}")).await.unwrap();

        let echo = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let mut conn = overlay.dial("tcp", &format!(":{port}")).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_non_tcp_networks() {
        let overlay = LoopbackOverlay::new();
        overlay.start(opts()).await.unwrap();
        assert!(overlay.dial("udp", ":80").await.is_err());
        assert!(overlay.listen("unix", "/tmp/sock").await.is_err());
    }

    #[tokio::test]
    async fn ip_assignment_can_be_delayed() {
        let overlay = LoopbackOverlay::with_ip_delay(Duration::from_millis(100));
        overlay.start(opts()).await.unwrap();
        assert_eq!(overlay.ip4(), None);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(overlay.ip4(), Some(Ipv4Addr::LOCALHOST));
    }
}
