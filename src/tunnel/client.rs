//! One tunnel session: dial the ingress, authenticate over the control
//! stream, and run until disconnected.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::frame::{read_frame, write_frame, Frame, FrameKind, Hello, HelloAck};
use super::stream_handler::{self, StreamContext};
use super::{
    SessionInfo, TunnelClient, TunnelState, AUTH_TIMEOUT, DIAL_TIMEOUT, DRAIN_DEADLINE,
    KEEPALIVE_INTERVAL, KEEPALIVE_WRITE_TIMEOUT,
};

/// How a session ended.
pub enum SessionOutcome {
    /// The supervisor asked us to stop; do not reconnect.
    Shutdown,
    /// Connection failed or was lost; the caller decides the backoff.
    Disconnected { reached_active: bool },
}

const DISCONNECTED_EARLY: SessionOutcome = SessionOutcome::Disconnected {
    reached_active: false,
};

/// Dial, authenticate, and dispatch one session. All session-fatal errors
/// are logged here; per-stream errors stay inside their handler tasks.
pub async fn connect_and_run(
    client: &Arc<TunnelClient>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionOutcome {
    let opts = &client.opts;

    client.set_state(TunnelState::Dialing);
    debug!(ingress = %opts.ingress_addr, "dialing ingress");

    let tcp = tokio::select! {
        result = timeout(DIAL_TIMEOUT, TcpStream::connect(&opts.ingress_addr)) => {
            match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!(ingress = %opts.ingress_addr, error = %e, "ingress dial failed");
                    return DISCONNECTED_EARLY;
                }
                Err(_) => {
                    warn!(
                        ingress = %opts.ingress_addr,
                        timeout_secs = DIAL_TIMEOUT.as_secs(),
                        "ingress dial timed out"
                    );
                    return DISCONNECTED_EARLY;
                }
            }
        }
        _ = shutdown.changed() => {
            debug!("shutdown while dialing");
            return SessionOutcome::Shutdown;
        }
    };

    let peer_addr = match tcp.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(error = %e, "ingress connection unusable");
            return DISCONNECTED_EARLY;
        }
    };
    configure_tcp_socket(&tcp, opts.tcp_keepalive_secs, opts.tcp_nodelay);

    client.set_state(TunnelState::Authenticating);

    // The connection must be polled for any stream to make progress, so one
    // driver task owns it: it opens the control stream, hands it back, then
    // forwards ingress-opened data streams until the session dies.
    let conn = yamux::Connection::new(tcp.compat(), yamux::Config::default(), yamux::Mode::Client);
    let (ctrl_tx, ctrl_rx) = oneshot::channel();
    let (inbound_tx, mut inbound_rx) = mpsc::channel(64);
    let mut driver = tokio::spawn(drive_connection(conn, ctrl_tx, inbound_tx));

    let control = tokio::select! {
        result = ctrl_rx => match result {
            Ok(stream) => stream,
            Err(_) => {
                // The driver logged the multiplexer error before exiting.
                return DISCONNECTED_EARLY;
            }
        },
        _ = shutdown.changed() => {
            debug!("shutdown while opening control stream");
            driver.abort();
            return SessionOutcome::Shutdown;
        }
    };
    let (mut ctrl_read, mut ctrl_write) = tokio::io::split(control.compat());

    let hello = Hello {
        token: opts.token.clone(),
        endpoints: opts.endpoints.clone(),
    };
    let payload = match serde_json::to_vec(&hello) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "failed to encode HELLO");
            driver.abort();
            return DISCONNECTED_EARLY;
        }
    };
    if let Err(e) = write_frame(&mut ctrl_write, &Frame::new(FrameKind::Hello, payload)).await {
        warn!(error = %e, "failed to send HELLO");
        driver.abort();
        return DISCONNECTED_EARLY;
    }

    let ack_frame = tokio::select! {
        result = timeout(AUTH_TIMEOUT, read_frame(&mut ctrl_read)) => match result {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                warn!(error = %e, "control stream failed while authenticating");
                driver.abort();
                return DISCONNECTED_EARLY;
            }
            Err(_) => {
                warn!(timeout_secs = AUTH_TIMEOUT.as_secs(), "HELLO_ACK timed out");
                driver.abort();
                return DISCONNECTED_EARLY;
            }
        },
        _ = shutdown.changed() => {
            debug!("shutdown while authenticating");
            driver.abort();
            return SessionOutcome::Shutdown;
        }
    };

    if ack_frame.kind != FrameKind::HelloAck {
        warn!(kind = ?ack_frame.kind, "expected HELLO_ACK, got something else");
        driver.abort();
        return DISCONNECTED_EARLY;
    }
    let ack: HelloAck = match serde_json::from_slice(&ack_frame.payload) {
        Ok(ack) => ack,
        Err(e) => {
            warn!(error = %e, "malformed HELLO_ACK payload");
            driver.abort();
            return DISCONNECTED_EARLY;
        }
    };
    if !ack.ok {
        warn!(
            error = ack.error.as_deref().unwrap_or("unspecified"),
            "ingress rejected HELLO"
        );
        driver.abort();
        return DISCONNECTED_EARLY;
    }

    client.set_state(TunnelState::Active(SessionInfo {
        peer_addr,
        established_at: Instant::now(),
    }));
    info!(peer = %peer_addr, endpoints = opts.endpoints.len(), "tunnel active");

    let ctx = StreamContext {
        endpoints: Arc::clone(&client.endpoint_map),
        cert_manager: opts.cert_manager.clone(),
    };
    let tracker = TaskTracker::new();
    let mut keepalive = tokio::spawn(keepalive_loop(ctrl_write));
    let mut control_reader = tokio::spawn(control_read_loop(ctrl_read));

    let outcome = loop {
        tokio::select! {
            inbound = inbound_rx.recv() => match inbound {
                Some(stream) => {
                    debug!("accepted data stream");
                    let ctx = ctx.clone();
                    tracker.spawn(stream_handler::handle_stream(ctx, stream.compat()));
                }
                None => {
                    info!("multiplexer closed, ending session");
                    break SessionOutcome::Disconnected { reached_active: true };
                }
            },
            _ = &mut keepalive => {
                warn!("keepalive sender exited, ending session");
                break SessionOutcome::Disconnected { reached_active: true };
            }
            _ = &mut control_reader => {
                warn!("control reader exited, ending session");
                break SessionOutcome::Disconnected { reached_active: true };
            }
            _ = shutdown.changed() => {
                info!("shutdown requested, closing session");
                break SessionOutcome::Shutdown;
            }
        }
    };

    client.set_state(TunnelState::Closing);

    // Best-effort teardown: dropping the connection closes the multiplexer
    // and the TCP stream; stream handlers then fail their reads and unwind.
    keepalive.abort();
    control_reader.abort();
    driver.abort();

    tracker.close();
    if timeout(DRAIN_DEADLINE, tracker.wait()).await.is_err() {
        warn!(
            deadline_secs = DRAIN_DEADLINE.as_secs(),
            remaining = tracker.len(),
            "abandoning data-stream tasks past the drain deadline"
        );
    }

    info!("tunnel session closed");
    outcome
}

/// Own the yamux connection: open the control stream, then forward every
/// ingress-opened data stream. HQ never opens data streams.
async fn drive_connection(
    mut conn: yamux::Connection<Compat<TcpStream>>,
    ctrl_tx: oneshot::Sender<yamux::Stream>,
    inbound_tx: mpsc::Sender<yamux::Stream>,
) {
    let control = match std::future::poll_fn(|cx| conn.poll_new_outbound(cx)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "failed to open control stream");
            return;
        }
    };
    if ctrl_tx.send(control).is_err() {
        return;
    }

    loop {
        match std::future::poll_fn(|cx| conn.poll_next_inbound(cx)).await {
            Some(Ok(stream)) => {
                if inbound_tx.send(stream).await.is_err() {
                    return;
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "multiplexer error");
                return;
            }
            None => {
                debug!("multiplexer closed by ingress");
                return;
            }
        }
    }
}

async fn keepalive_loop<W>(mut w: W)
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::time::sleep(KEEPALIVE_INTERVAL).await;
        let frame = Frame::new(FrameKind::Keepalive, &b"{}"[..]);
        match timeout(KEEPALIVE_WRITE_TIMEOUT, write_frame(&mut w, &frame)).await {
            Ok(Ok(())) => debug!("keepalive sent"),
            Ok(Err(e)) => {
                warn!(error = %e, "keepalive write failed");
                return;
            }
            Err(_) => {
                warn!(
                    timeout_secs = KEEPALIVE_WRITE_TIMEOUT.as_secs(),
                    "keepalive write timed out"
                );
                return;
            }
        }
    }
}

/// Inbound KEEPALIVEs are logged and dropped; any other known kind is
/// unexpected but harmless. A decode error is fatal to the session.
async fn control_read_loop<R>(mut r: R)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut r).await {
            Ok(frame) => match frame.kind {
                FrameKind::Keepalive => debug!("keepalive from ingress"),
                kind => warn!(?kind, "unexpected frame kind on control stream"),
            },
            Err(e) => {
                warn!(error = %e, "control stream read failed");
                return;
            }
        }
    }
}

/// Configure TCP keepalive and NODELAY on the established ingress socket.
fn configure_tcp_socket(stream: &TcpStream, keepalive_secs: u64, nodelay: bool) {
    let sock_ref = socket2::SockRef::from(stream);

    if keepalive_secs > 0 {
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(keepalive_secs))
            .with_interval(Duration::from_secs(5));
        #[cfg(not(target_os = "windows"))]
        let keepalive = keepalive.with_retries(3);
        if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
            warn!(error = %e, "failed to set TCP keepalive on ingress socket");
        }
    }

    if nodelay {
        if let Err(e) = sock_ref.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on ingress socket");
        }
    }
}
