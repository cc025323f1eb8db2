//! Configuration for the edge core.
//!
//! Loaded from a TOML file by the binary (or constructed directly by an
//! embedding server). Validation runs once at startup; a bad config refuses
//! to start rather than limping along.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level configuration: one table per subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
}

/// A public hostname mapped to a loopback service port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub hostname: String,
    pub local_port: u16,
}

/// Reverse-tunnel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Run the tunnel at all.
    pub enabled: bool,
    /// `host:port` of the ingress relay to dial.
    pub ingress_addr: String,
    /// Opaque authentication credential sent in HELLO. May be left empty in
    /// the file when a previously persisted token exists in the secret store.
    pub token: String,
    /// Public hostnames served by this HQ, re-declared on every reconnect.
    pub endpoints: Vec<Endpoint>,
    pub acme: AcmeConfig,
    /// TCP keepalive on the ingress connection (0 disables).
    pub tcp_keepalive_secs: u64,
    pub tcp_nodelay: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ingress_addr: String::new(),
            token: String::new(),
            endpoints: Vec::new(),
            acme: AcmeConfig::default(),
            tcp_keepalive_secs: 60,
            tcp_nodelay: true,
        }
    }
}

/// Certificate-manager settings. When enabled, tunneled TLS sessions are
/// terminated at HQ with per-hostname certificates; otherwise raw bytes are
/// passed through to the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AcmeConfig {
    pub enabled: bool,
    pub email: String,
    pub staging: bool,
    /// Where certificate material lives. Defaults to `<mesh.state_dir>/certs`.
    pub cert_dir: Option<PathBuf>,
}

/// Mesh overlay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub enabled: bool,
    /// Hostname advertised on the overlay.
    pub hostname: String,
    /// Directory for persistent overlay state, owned by the overlay library.
    pub state_dir: PathBuf,
    /// Coordinator service URL.
    pub control_url: String,
    /// Pre-auth key for non-interactive enrollment. Empty means the overlay
    /// library falls back to its own interactive enrollment.
    pub auth_key: String,
    /// Tag this node as the HQ of its network in peer enumeration.
    pub is_hq: bool,
    /// Loopback services exposed to peers on overlay ports.
    pub services: Vec<ServiceMapping>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hostname: String::new(),
            state_dir: PathBuf::from("hq-edge-state"),
            control_url: String::new(),
            auth_key: String::new(),
            is_hq: true,
            services: Vec::new(),
        }
    }
}

/// An overlay-side listener reverse-proxying to a loopback HTTP service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMapping {
    pub name: String,
    pub overlay_port: u16,
    /// Typically `http://127.0.0.1:<n>`.
    pub target_url: String,
}

/// Startup-time configuration errors. The supervisor refuses to start on any
/// of these.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("tunnel is enabled but ingress_addr is empty")]
    MissingIngressAddr,
    #[error("tunnel is enabled but no token is configured or stored")]
    MissingToken,
    #[error("malformed endpoint hostname: {0:?}")]
    BadHostname(String),
    #[error("endpoint local_port must be nonzero for {0:?}")]
    BadLocalPort(String),
    #[error("duplicate endpoint hostname: {0:?}")]
    DuplicateHostname(String),
    #[error("mesh is enabled but hostname is empty")]
    MissingMeshHostname,
    #[error("malformed mesh control_url: {0:?}")]
    BadControlUrl(String),
    #[error("duplicate overlay_port {port} in service mapping {name:?}")]
    DuplicateOverlayPort { name: String, port: u16 },
    #[error("malformed target_url in service mapping {name:?}: {url:?}")]
    BadTargetUrl { name: String, url: String },
}

impl Config {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Validate everything that can be checked without the secret store.
    /// Token presence is checked by the supervisor after secret resolution.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tunnel.enabled {
            if self.tunnel.ingress_addr.is_empty() {
                return Err(ConfigError::MissingIngressAddr);
            }
            let mut seen = HashSet::new();
            for ep in &self.tunnel.endpoints {
                if !valid_hostname(&ep.hostname) {
                    return Err(ConfigError::BadHostname(ep.hostname.clone()));
                }
                if ep.local_port == 0 {
                    return Err(ConfigError::BadLocalPort(ep.hostname.clone()));
                }
                if !seen.insert(ep.hostname.clone()) {
                    return Err(ConfigError::DuplicateHostname(ep.hostname.clone()));
                }
            }
        }

        if self.mesh.enabled {
            if self.mesh.hostname.is_empty() {
                return Err(ConfigError::MissingMeshHostname);
            }
            if !self.mesh.control_url.is_empty()
                && url::Url::parse(&self.mesh.control_url).is_err()
            {
                return Err(ConfigError::BadControlUrl(self.mesh.control_url.clone()));
            }
            let mut ports = HashSet::new();
            for svc in &self.mesh.services {
                if !ports.insert(svc.overlay_port) {
                    return Err(ConfigError::DuplicateOverlayPort {
                        name: svc.name.clone(),
                        port: svc.overlay_port,
                    });
                }
                match url::Url::parse(&svc.target_url) {
                    Ok(u) if u.has_host() => {}
                    _ => {
                        return Err(ConfigError::BadTargetUrl {
                            name: svc.name.clone(),
                            url: svc.target_url.clone(),
                        })
                    }
                }
            }
        }

        Ok(())
    }

    /// Effective certificate directory (`tunnel.acme.cert_dir` or
    /// `<mesh.state_dir>/certs`).
    pub fn cert_dir(&self) -> PathBuf {
        self.tunnel
            .acme
            .cert_dir
            .clone()
            .unwrap_or_else(|| self.mesh.state_dir.join("certs"))
    }
}

/// Endpoint hostnames must parse as the host of a URL and be fully
/// qualified. This rejects embedded whitespace, ports, paths, and IPs.
fn valid_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || !hostname.contains('.') {
        return false;
    }
    match url::Url::parse(&format!("https://{hostname}/")) {
        Ok(u) => u.host_str() == Some(hostname) && u.port().is_none(),
        Err(_) => false,
    }
}
