//! Service proxy: overlay listeners reverse-proxying loopback HTTP services.
//!
//! One acceptor task per mapping, one HTTP/1 server per accepted connection.
//! Mappings are immutable once exposed; reconfiguration is Stop + Expose.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::http::uri::PathAndQuery;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServiceMapping;

use super::overlay::OverlayListener;
use super::MeshClient;

type HttpClient = Client<HttpConnector, Incoming>;
type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub struct ServiceProxy {
    mesh: Arc<MeshClient>,
    running: Mutex<Option<Running>>,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    acceptors: Vec<(String, JoinHandle<()>)>,
}

impl ServiceProxy {
    pub fn new(mesh: Arc<MeshClient>) -> Self {
        Self {
            mesh,
            running: Mutex::new(None),
        }
    }

    /// Open an overlay listener per mapping and start serving. Fails whole
    /// if any mapping cannot be set up; already-started acceptors are torn
    /// down again on the way out.
    pub async fn expose(&self, mappings: &[ServiceMapping]) -> anyhow::Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            anyhow::bail!("service proxy already exposed; stop it before reconfiguring");
        }

        let mut ports = HashSet::new();
        for mapping in mappings {
            if !ports.insert(mapping.overlay_port) {
                anyhow::bail!(
                    "duplicate overlay_port {} in service mapping {:?}",
                    mapping.overlay_port,
                    mapping.name
                );
            }
        }

        let (shutdown_tx, _) = watch::channel(false);
        let mut acceptors: Vec<(String, JoinHandle<()>)> = Vec::new();

        for mapping in mappings {
            let setup = async {
                let listener = self
                    .mesh
                    .listen("tcp", &format!(":{}", mapping.overlay_port))
                    .await
                    .with_context(|| {
                        format!("listen on overlay port {}", mapping.overlay_port)
                    })?;
                let target: Uri = mapping
                    .target_url
                    .parse()
                    .with_context(|| format!("parse target_url {:?}", mapping.target_url))?;
                anyhow::Ok((listener, target))
            };
            let (listener, target) = match setup.await {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = shutdown_tx.send(true);
                    for (_, handle) in acceptors {
                        let _ = handle.await;
                    }
                    return Err(e.context(format!("expose service {:?}", mapping.name)));
                }
            };

            let client: HttpClient = Client::builder(TokioExecutor::new()).build_http();
            info!(
                service = %mapping.name,
                overlay_port = mapping.overlay_port,
                target = %mapping.target_url,
                "exposing service on overlay"
            );
            let handle = tokio::spawn(acceptor_loop(
                mapping.name.clone(),
                listener,
                client,
                target,
                shutdown_tx.subscribe(),
            ));
            acceptors.push((mapping.name.clone(), handle));
        }

        *running = Some(Running {
            shutdown_tx,
            acceptors,
        });
        Ok(())
    }

    /// Close every listener and server, best-effort and independently per
    /// mapping.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown_tx.send(true);
        for (name, handle) in running.acceptors {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(service = %name, "service acceptor panicked");
                }
            }
        }
        info!("service proxy stopped");
    }
}

async fn acceptor_loop(
    name: String,
    mut listener: Box<dyn OverlayListener>,
    client: HttpClient,
    target: Uri,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            conn = listener.accept() => match conn {
                Ok(conn) => {
                    let name = name.clone();
                    let client = client.clone();
                    let target = target.clone();
                    let conn_shutdown = shutdown.clone();
                    tokio::spawn(serve_connection(name, conn, client, target, conn_shutdown));
                }
                Err(e) => {
                    warn!(service = %name, error = %e, "overlay accept failed");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!(service = %name, "service acceptor exiting");
}

async fn serve_connection(
    name: String,
    conn: super::overlay::BoxedConn,
    client: HttpClient,
    target: Uri,
    mut shutdown: watch::Receiver<bool>,
) {
    let io = TokioIo::new(conn);
    let service = service_fn(move |req| {
        proxy_request(name.clone(), client.clone(), target.clone(), req)
    });
    let serving = http1::Builder::new().serve_connection(io, service);
    tokio::pin!(serving);

    tokio::select! {
        result = serving.as_mut() => {
            if let Err(e) = result {
                debug!(error = %e, "overlay connection ended with error");
            }
        }
        _ = shutdown.changed() => {
            serving.as_mut().graceful_shutdown();
            let _ = serving.as_mut().await;
        }
    }
}

/// Forward one request to the loopback target. Proxy failures answer the
/// mesh caller with 502 rather than dropping the connection.
async fn proxy_request(
    name: String,
    client: HttpClient,
    target: Uri,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, Infallible> {
    let uri = match rewrite_uri(&target, req.uri()) {
        Ok(uri) => uri,
        Err(e) => {
            warn!(service = %name, error = %e, "failed to rewrite request URI");
            return Ok(bad_gateway());
        }
    };

    let (mut parts, body) = req.into_parts();
    parts.uri = uri;
    let outbound = Request::from_parts(parts, body);

    match client.request(outbound).await {
        Ok(resp) => Ok(resp.map(BodyExt::boxed)),
        Err(e) => {
            warn!(service = %name, error = %e, "reverse proxy request failed");
            Ok(bad_gateway())
        }
    }
}

/// Graft the incoming path and query onto the target's scheme/authority.
fn rewrite_uri(target: &Uri, incoming: &Uri) -> Result<Uri, hyper::http::Error> {
    let mut parts = target.clone().into_parts();
    parts.path_and_query = incoming
        .path_and_query()
        .cloned()
        .or_else(|| Some(PathAndQuery::from_static("/")));
    Uri::from_parts(parts).map_err(Into::into)
}

fn bad_gateway() -> Response<ProxyBody> {
    let body = Full::new(Bytes::from_static(b"upstream unavailable"))
        .map_err(|never| match never {})
        .boxed();
    let mut resp = Response::new(body);
    *resp.status_mut() = StatusCode::BAD_GATEWAY;
    resp
}
