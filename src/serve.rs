//! The secure serving loop.
//!
//! Accepts TCP, inspects the ClientHello to pick the cluster's TLS config,
//! completes the handshake, then serves HTTP/1.1 and HTTP/2 (with upgrade
//! support) over the connection. Each request is authenticated against the
//! SNI-selected cluster before entering the dispatch pipeline; handler
//! panics are recovered into a 500 so the process never dies with a
//! request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rustls::pki_types::CertificateDer;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, warn};

use crate::auth::Authenticator;
use crate::dispatch::dispatcher::request_host;
use crate::dispatch::{ConnectionContext, Dispatcher};
use crate::error::{GatewayError, GatewayResult, ProxyBody};
use crate::lifecycle::LifecycleManager;
use crate::tls::SniSelect;

/// Hard deadline for the TLS handshake, ClientHello included.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the serving loop shares across connections.
pub struct GatewayState {
    pub dispatcher: Dispatcher,
    pub authenticator: Authenticator,
    pub sni: SniSelect,
    pub lifecycle: Arc<LifecycleManager>,
}

/// Accept loop. Returns when the lifecycle token fires; connection drain is
/// the caller's job.
pub async fn serve(listener: TcpListener, state: Arc<GatewayState>) -> std::io::Result<()> {
    let shutdown = state.lifecycle.shutdown_token();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let (stream, peer_addr) = match accepted {
            Ok(pair) => pair,
            Err(error) => {
                warn!(%error, "accept failed");
                continue;
            }
        };
        let state = Arc::clone(&state);
        let guard = state.lifecycle.conn_opened();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(error) = handle_connection(stream, peer_addr, state).await {
                debug!(%peer_addr, error = %error, "connection closed with error");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<GatewayState>,
) -> Result<(), String> {
    let local_addr = stream.local_addr().ok();

    // Pause after the ClientHello to choose the per-SNI config; a miss
    // serves the base config rather than failing the handshake.
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
    let start = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor)
        .await
        .map_err(|_| "client hello timed out".to_string())?
        .map_err(|e| format!("client hello: {e}"))?;

    let sni = start.client_hello().server_name().map(str::to_string);
    let config = state.sni.select(sni.as_deref(), local_addr.map(|a| a.ip()));
    let tls_stream = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, start.into_stream(config))
        .await
        .map_err(|_| "tls handshake timed out".to_string())?
        .map_err(|e| format!("tls handshake: {e}"))?;

    let peer_certs: Vec<CertificateDer<'static>> = tls_stream
        .get_ref()
        .1
        .peer_certificates()
        .map(<[CertificateDer<'static>]>::to_vec)
        .unwrap_or_default();
    let context = ConnectionContext {
        sni,
        local_addr,
        peer_addr: Some(peer_addr),
    };

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        let context = context.clone();
        let peer_certs = peer_certs.clone();
        async move { handle_request(state, context, peer_certs, req).await }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection_with_upgrades(TokioIo::new(tls_stream), service);
    connection.await.map_err(|e| e.to_string())
}

async fn handle_request(
    state: Arc<GatewayState>,
    context: ConnectionContext,
    peer_certs: Vec<CertificateDer<'static>>,
    mut req: Request<Incoming>,
) -> GatewayResult<Response<ProxyBody>> {
    req.extensions_mut().insert(context);
    let host = request_host(&req).unwrap_or_default();
    let user = state
        .authenticator
        .authenticate(&host, &peer_certs, req.headers())
        .await;
    debug!(%host, user = %user.username, "request authenticated");
    req.extensions_mut().insert(user);

    match std::panic::AssertUnwindSafe(state.dispatcher.handle(req))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(&panic);
            error!(message, "request handler panicked");
            Ok(GatewayError::Internal {
                message: "request handler panicked".to_string(),
            }
            .into_response())
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}
