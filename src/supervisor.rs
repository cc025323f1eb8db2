//! Supervisor: wires the mesh client, service proxy, and tunnel client,
//! owns their lifecycle, and exposes a composite status snapshot.
//!
//! Startup order is Mesh → Service Proxy → Tunnel; shutdown unwinds in
//! reverse with a hard deadline. Only configuration errors abort startup;
//! a failing subsystem degrades and the rest keep running.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::certs::CertManager;
use crate::config::Config;
use crate::mesh::overlay::{MeshPeer, Overlay};
use crate::mesh::proxy::ServiceProxy;
use crate::mesh::MeshClient;
use crate::secrets::SecretStore;
use crate::tunnel::{TunnelClient, TunnelEvent, TunnelOptions};

/// Hard deadline for joining subsystem tasks at shutdown.
pub const STOP_DEADLINE: Duration = Duration::from_secs(10);

const TOKEN_SECRET_KEY: &str = "tunnel.token";
const AUTH_KEY_SECRET_KEY: &str = "mesh.auth_key";

/// Composite snapshot consumed by higher layers (status API, UI).
#[derive(Debug, Clone, Serialize)]
pub struct EdgeStatus {
    pub tunnel_connected: bool,
    pub tunnel_endpoints: usize,
    pub mesh_connected: bool,
    pub mesh_ip: String,
    pub mesh_is_hq: bool,
    pub mesh_peers: Vec<MeshPeer>,
}

/// External collaborators injected by the embedding server. The binary
/// wires the bundled defaults; tests use in-memory stubs.
#[derive(Default)]
pub struct Collaborators {
    pub overlay: Option<Arc<dyn Overlay>>,
    pub cert_manager: Option<Arc<dyn CertManager>>,
    pub secrets: Option<Arc<dyn SecretStore>>,
}

pub struct Supervisor {
    config: Config,
    collaborators: Collaborators,
    events_tx: broadcast::Sender<TunnelEvent>,
    shutdown_tx: watch::Sender<bool>,
    mesh: Mutex<Option<Arc<MeshClient>>>,
    service_proxy: Mutex<Option<Arc<ServiceProxy>>>,
    tunnel: Mutex<Option<Arc<TunnelClient>>>,
    tunnel_task: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            collaborators,
            events_tx,
            shutdown_tx,
            mesh: Mutex::new(None),
            service_proxy: Mutex::new(None),
            tunnel: Mutex::new(None),
            tunnel_task: Mutex::new(None),
        }
    }

    /// Subscribe to tunnel connected/disconnected transitions. Events are
    /// emitted by the single tunnel task, so their order matches the
    /// connection state changes.
    pub fn subscribe_events(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events_tx.subscribe()
    }

    /// Validate configuration, resolve secrets, and start every enabled
    /// subsystem. Returns an error only for configuration problems; runtime
    /// subsystem failures degrade and are logged.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.config.validate()?;

        let token = self.resolve_tunnel_token()?;
        let auth_key = self.resolve_mesh_auth_key()?;

        if self.config.mesh.enabled {
            let Some(overlay) = self.collaborators.overlay.clone() else {
                anyhow::bail!("mesh is enabled but no overlay library was provided");
            };
            let mut mesh_cfg = self.config.mesh.clone();
            mesh_cfg.auth_key = auth_key;
            let mesh = Arc::new(MeshClient::new(overlay, mesh_cfg));
            match mesh.start().await {
                Ok(()) => {
                    *self.mesh.lock().await = Some(Arc::clone(&mesh));

                    if !self.config.mesh.services.is_empty() {
                        let proxy = Arc::new(ServiceProxy::new(Arc::clone(&mesh)));
                        match proxy.expose(&self.config.mesh.services).await {
                            Ok(()) => *self.service_proxy.lock().await = Some(proxy),
                            Err(e) => error!(error = %e, "service proxy failed to start"),
                        }
                    }
                }
                Err(e) => {
                    // Mesh stays down; the tunnel still gets to run.
                    error!(error = %e, "mesh overlay failed to start");
                }
            }
        }

        if self.config.tunnel.enabled {
            let cert_manager = if self.config.tunnel.acme.enabled {
                let Some(manager) = self.collaborators.cert_manager.clone() else {
                    anyhow::bail!("tunnel.acme is enabled but no certificate manager was provided");
                };
                Some(manager)
            } else {
                None
            };

            let tunnel = Arc::new(TunnelClient::new(
                TunnelOptions {
                    ingress_addr: self.config.tunnel.ingress_addr.clone(),
                    token,
                    endpoints: self.config.tunnel.endpoints.clone(),
                    cert_manager,
                    tcp_keepalive_secs: self.config.tunnel.tcp_keepalive_secs,
                    tcp_nodelay: self.config.tunnel.tcp_nodelay,
                },
                self.events_tx.clone(),
            ));
            let task = tokio::spawn(Arc::clone(&tunnel).run(self.shutdown_tx.subscribe()));
            *self.tunnel.lock().await = Some(tunnel);
            *self.tunnel_task.lock().await = Some(task);
        }

        info!(
            tunnel = self.config.tunnel.enabled,
            mesh = self.config.mesh.enabled,
            "edge core started"
        );
        Ok(())
    }

    /// Stop everything in reverse start order: tunnel, service proxy, mesh.
    /// Tasks still running after the deadline are abandoned with a warning.
    pub async fn stop(&self) {
        info!("edge core stopping");
        let _ = self.shutdown_tx.send(true);

        if let Some(task) = self.tunnel_task.lock().await.take() {
            match timeout(STOP_DEADLINE, task).await {
                Ok(_) => {}
                Err(_) => warn!(
                    deadline_secs = STOP_DEADLINE.as_secs(),
                    "tunnel task did not stop within deadline, abandoning"
                ),
            }
        }
        self.tunnel.lock().await.take();

        if let Some(proxy) = self.service_proxy.lock().await.take() {
            match timeout(STOP_DEADLINE, proxy.stop()).await {
                Ok(()) => {}
                Err(_) => warn!("service proxy did not stop within deadline, abandoning"),
            }
        }

        if let Some(mesh) = self.mesh.lock().await.take() {
            mesh.stop().await;
        }

        info!("edge core stopped");
    }

    /// Point-in-time composite status.
    pub async fn status(&self) -> EdgeStatus {
        let tunnel = self.tunnel.lock().await.clone();
        let mesh = self.mesh.lock().await.clone();

        let (tunnel_connected, tunnel_endpoints) = match tunnel {
            Some(t) => (t.connected(), t.endpoint_count()),
            None => (false, 0),
        };
        let mesh_status = mesh.map(|m| m.status());

        EdgeStatus {
            tunnel_connected,
            tunnel_endpoints,
            mesh_connected: mesh_status.as_ref().map(|s| s.connected).unwrap_or(false),
            mesh_ip: mesh_status
                .as_ref()
                .map(|s| s.overlay_ip.clone())
                .unwrap_or_default(),
            mesh_is_hq: self.config.mesh.is_hq,
            mesh_peers: mesh_status.map(|s| s.peers).unwrap_or_default(),
        }
    }

    /// Use the configured token, persisting it; fall back to a previously
    /// stored one when the config omits it.
    fn resolve_tunnel_token(&self) -> anyhow::Result<String> {
        let configured = self.config.tunnel.token.clone();
        let token = match (&self.collaborators.secrets, configured.is_empty()) {
            (Some(secrets), false) => {
                secrets.set(TOKEN_SECRET_KEY, &configured)?;
                configured
            }
            (Some(secrets), true) => secrets.get(TOKEN_SECRET_KEY)?.unwrap_or_default(),
            (None, _) => configured,
        };
        if self.config.tunnel.enabled && token.is_empty() {
            return Err(crate::config::ConfigError::MissingToken.into());
        }
        Ok(token)
    }

    fn resolve_mesh_auth_key(&self) -> anyhow::Result<String> {
        let configured = self.config.mesh.auth_key.clone();
        match (&self.collaborators.secrets, configured.is_empty()) {
            (Some(secrets), false) => {
                secrets.set(AUTH_KEY_SECRET_KEY, &configured)?;
                Ok(configured)
            }
            (Some(secrets), true) => Ok(secrets.get(AUTH_KEY_SECRET_KEY)?.unwrap_or_default()),
            (None, _) => Ok(configured),
        }
    }
}
