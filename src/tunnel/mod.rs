//! Outbound reverse tunnel to the ingress relay.
//!
//! The client dials out, multiplexes one control stream plus ingress-opened
//! data streams over a single TCP connection, and bridges each data stream
//! to a loopback service selected by SNI. It reconnects forever with capped
//! exponential backoff until the supervisor asks it to stop.

pub mod client;
pub mod frame;
pub mod sni;
pub mod stream_handler;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch};
use tracing::info;

use crate::certs::CertManager;
use crate::config::Endpoint;

use self::stream_handler::EndpointMap;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const KEEPALIVE_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Hard deadline for joining data-stream tasks at session close.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(10);
pub const BACKOFF_INITIAL: Duration = Duration::from_secs(5);
pub const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Tunnel connectivity transitions, broadcast in the order they happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelEvent {
    Connected,
    Disconnected,
}

/// Details of the live session, available while `Active`.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer_addr: SocketAddr,
    pub established_at: Instant,
}

/// Tunnel lifecycle. Transitions happen atomically under the client's state
/// lock; there is exactly one session at a time.
#[derive(Debug, Clone)]
pub enum TunnelState {
    Disconnected,
    Dialing,
    Authenticating,
    Active(SessionInfo),
    Closing,
    Backoff { delay: Duration },
    Stopped,
}

/// Everything a tunnel needs, fixed for the client's lifetime. The endpoint
/// set is re-declared to the ingress on every reconnect; changing it means
/// building a new client.
pub struct TunnelOptions {
    pub ingress_addr: String,
    pub token: String,
    pub endpoints: Vec<Endpoint>,
    /// When set, TLS is terminated at HQ; otherwise bytes pass through.
    pub cert_manager: Option<Arc<dyn CertManager>>,
    pub tcp_keepalive_secs: u64,
    pub tcp_nodelay: bool,
}

pub struct TunnelClient {
    pub(crate) opts: TunnelOptions,
    pub(crate) endpoint_map: EndpointMap,
    state: Mutex<TunnelState>,
    events: broadcast::Sender<TunnelEvent>,
}

impl TunnelClient {
    pub fn new(opts: TunnelOptions, events: broadcast::Sender<TunnelEvent>) -> Self {
        let endpoint_map: EndpointMap = Arc::new(
            opts.endpoints
                .iter()
                .map(|ep| (ep.hostname.clone(), ep.local_port))
                .collect::<HashMap<_, _>>(),
        );
        Self {
            opts,
            endpoint_map,
            state: Mutex::new(TunnelState::Disconnected),
            events,
        }
    }

    pub fn connected(&self) -> bool {
        matches!(*self.state.lock().unwrap(), TunnelState::Active(_))
    }

    /// Snapshot of the current state; taken under the lock, used after
    /// releasing it.
    pub fn state(&self) -> TunnelState {
        self.state.lock().unwrap().clone()
    }

    pub fn endpoint_count(&self) -> usize {
        self.opts.endpoints.len()
    }

    pub(crate) fn set_state(&self, next: TunnelState) {
        let mut st = self.state.lock().unwrap();
        let was_active = matches!(*st, TunnelState::Active(_));
        let now_active = matches!(next, TunnelState::Active(_));
        *st = next;
        drop(st);
        if now_active && !was_active {
            let _ = self.events.send(TunnelEvent::Connected);
        }
        if was_active && !now_active {
            let _ = self.events.send(TunnelEvent::Disconnected);
        }
    }

    /// Run the tunnel until the supervisor signals shutdown: connect,
    /// dispatch, back off, reconnect.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            ingress = %self.opts.ingress_addr,
            endpoints = self.opts.endpoints.len(),
            terminate_tls = self.opts.cert_manager.is_some(),
            "starting tunnel"
        );

        let mut delay = BACKOFF_INITIAL;
        loop {
            if *shutdown.borrow() {
                break;
            }

            match client::connect_and_run(&self, &mut shutdown).await {
                client::SessionOutcome::Shutdown => break,
                client::SessionOutcome::Disconnected { reached_active } => {
                    if reached_active {
                        delay = BACKOFF_INITIAL;
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }

            self.set_state(TunnelState::Backoff { delay });
            info!(delay_secs = delay.as_secs(), "reconnecting after backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
            delay = next_backoff(delay);
        }

        self.set_state(TunnelState::Stopped);
        info!("tunnel stopped");
    }
}

/// delay_{n+1} = min(2 * delay_n, cap).
pub fn next_backoff(delay: Duration) -> Duration {
    (delay * 2).min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_the_cap() {
        let mut delay = BACKOFF_INITIAL;
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(delay.as_secs());
            delay = next_backoff(delay);
        }
        assert_eq!(seen, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn state_transitions_emit_events_in_order() {
        let (tx, mut rx) = broadcast::channel(8);
        let client = TunnelClient::new(
            TunnelOptions {
                ingress_addr: "ingress.example:7443".into(),
                token: "t".into(),
                endpoints: vec![Endpoint {
                    hostname: "a.example".into(),
                    local_port: 8080,
                }],
                cert_manager: None,
                tcp_keepalive_secs: 0,
                tcp_nodelay: false,
            },
            tx,
        );

        assert!(!client.connected());
        client.set_state(TunnelState::Dialing);
        client.set_state(TunnelState::Authenticating);
        assert!(!client.connected());

        client.set_state(TunnelState::Active(SessionInfo {
            peer_addr: "127.0.0.1:7443".parse().unwrap(),
            established_at: Instant::now(),
        }));
        assert!(client.connected());
        assert_eq!(rx.try_recv().unwrap(), TunnelEvent::Connected);

        client.set_state(TunnelState::Closing);
        assert!(!client.connected());
        assert_eq!(rx.try_recv().unwrap(), TunnelEvent::Disconnected);
        assert!(rx.try_recv().is_err());
    }
}
