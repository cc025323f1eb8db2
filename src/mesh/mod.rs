//! Mesh overlay client: lifecycle, status, and overlay socket primitives.

pub mod overlay;
pub mod proxy;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;

use self::overlay::{BoxedConn, MeshPeer, Overlay, OverlayListener, OverlayOptions};

pub const IP_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const IP_POLL_DEADLINE: Duration = Duration::from_secs(30);

/// The local node's view of the overlay.
#[derive(Debug, Clone, Serialize)]
pub struct MeshStatus {
    pub connected: bool,
    /// Empty until the coordinator assigns an IPv4 address.
    pub overlay_ip: String,
    pub is_hq: bool,
    pub peers: Vec<MeshPeer>,
}

/// Concurrency-safe wrapper over the overlay library. The started node
/// handle sits behind an RwLock; every exported operation snapshots it under
/// a read lock and releases the lock before any I/O.
pub struct MeshClient {
    backend: Arc<dyn Overlay>,
    cfg: MeshConfig,
    node: RwLock<Option<Arc<dyn Overlay>>>,
}

impl MeshClient {
    pub fn new(backend: Arc<dyn Overlay>, cfg: MeshConfig) -> Self {
        Self {
            backend,
            cfg,
            node: RwLock::new(None),
        }
    }

    /// Start the overlay node. Returns once the overlay has been told to
    /// start; a background task watches for IPv4 assignment and logs it.
    /// On error the client stays "not connected".
    pub async fn start(&self) -> std::io::Result<()> {
        let mut tags = Vec::new();
        if self.cfg.is_hq {
            tags.push("hq".to_string());
        }
        if self.cfg.auth_key.is_empty() {
            info!("no mesh auth key configured; overlay may prompt for enrollment");
        }

        let opts = OverlayOptions {
            hostname: self.cfg.hostname.clone(),
            state_dir: self.cfg.state_dir.clone(),
            control_url: self.cfg.control_url.clone(),
            auth_key: self.cfg.auth_key.clone(),
            tags,
        };
        self.backend.start(opts).await?;
        *self.node.write().unwrap() = Some(Arc::clone(&self.backend));
        info!(hostname = %self.cfg.hostname, is_hq = self.cfg.is_hq, "mesh overlay starting");

        let node = Arc::clone(&self.backend);
        let hostname = self.cfg.hostname.clone();
        tokio::spawn(async move {
            let deadline = Instant::now() + IP_POLL_DEADLINE;
            loop {
                if let Some(ip) = node.ip4() {
                    // If the overlay reports several addresses, only the
                    // first is published.
                    info!(%ip, %hostname, "overlay IPv4 assigned");
                    return;
                }
                if Instant::now() >= deadline {
                    warn!(
                        deadline_secs = IP_POLL_DEADLINE.as_secs(),
                        "overlay IPv4 not assigned within deadline"
                    );
                    return;
                }
                tokio::time::sleep(IP_POLL_INTERVAL).await;
            }
        });

        Ok(())
    }

    /// Best-effort close; node state persists on disk between runs.
    pub async fn stop(&self) {
        let node = self.node.write().unwrap().take();
        if let Some(node) = node {
            if let Err(e) = node.close().await {
                warn!(error = %e, "overlay close failed");
            } else {
                debug!("mesh overlay closed");
            }
        }
    }

    fn snapshot(&self) -> Option<Arc<dyn Overlay>> {
        self.node.read().unwrap().clone()
    }

    /// Point-in-time status. Before address assignment this reports
    /// `connected: true` with an empty IP.
    pub fn status(&self) -> MeshStatus {
        match self.snapshot() {
            Some(node) => MeshStatus {
                connected: true,
                overlay_ip: node.ip4().map(|ip| ip.to_string()).unwrap_or_default(),
                is_hq: self.cfg.is_hq,
                peers: node.peers(),
            },
            None => MeshStatus {
                connected: false,
                overlay_ip: String::new(),
                is_hq: self.cfg.is_hq,
                peers: Vec::new(),
            },
        }
    }

    pub async fn dial(&self, network: &str, addr: &str) -> std::io::Result<BoxedConn> {
        let node = self.snapshot().ok_or_else(not_connected)?;
        node.dial(network, addr).await
    }

    pub async fn listen(
        &self,
        network: &str,
        addr: &str,
    ) -> std::io::Result<Box<dyn OverlayListener>> {
        let node = self.snapshot().ok_or_else(not_connected)?;
        node.listen(network, addr).await
    }
}

fn not_connected() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "mesh overlay not started")
}
