//! KubeGate entry point: flags, startup sequencing, graceful shutdown.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use kubegate::auth::Authenticator;
use kubegate::cluster::{ClusterInfo, ClusterOptions, ClusterRegistry};
use kubegate::config::{ConfigSource, FileSource};
use kubegate::dispatch::Dispatcher;
use kubegate::lifecycle::{DrainResult, LifecycleManager, health_router};
use kubegate::serve::{GatewayState, serve};
use kubegate::tls::{ServingKey, SniSelect, build_server_config, parse_ca_roots};

/// Gateway command-line options.
#[derive(Parser, Debug)]
#[command(name = "kubegate", version, about, long_about = None)]
struct Options {
    /// Path to the upstream cluster YAML document (one or more documents).
    #[arg(long, env = "KUBEGATE_UPSTREAM_CLUSTER_FILE")]
    upstream_cluster_file: PathBuf,

    /// Address the secure listener binds to.
    #[arg(long, default_value = "0.0.0.0")]
    bind_address: IpAddr,

    /// Port of the secure listener.
    #[arg(long, default_value_t = 6443)]
    secure_port: u16,

    /// Fallback serving certificate, used for handshakes that match no
    /// cluster. Self-signed when omitted.
    #[arg(long, requires = "tls_private_key_file")]
    tls_cert_file: Option<PathBuf>,

    /// Private key paired with --tls-cert-file.
    #[arg(long, requires = "tls_cert_file")]
    tls_private_key_file: Option<PathBuf>,

    /// Client CA bundle for the fallback serving config.
    #[arg(long)]
    client_ca_file: Option<PathBuf>,

    /// Audiences requested on upstream TokenReviews.
    #[arg(long, value_delimiter = ',')]
    api_audiences: Vec<String>,

    /// How long successful token reviews are cached, e.g. "10m" or "600s".
    #[arg(long, value_parser = parse_duration, default_value = "10m")]
    authentication_token_success_cache_ttl: Duration,

    /// How long failed token reviews are cached.
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    authentication_token_failure_cache_ttl: Duration,

    /// Insecure port serving /healthz and /readyz. Disabled when absent.
    #[arg(long, env = "KUBEGATE_HEALTH_PORT")]
    health_port: Option<u16>,

    /// Emit one structured access-log line per proxied request, subject to
    /// the cluster/policy logMode switches.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    enable_proxy_access_log: bool,

    /// Bound on connection draining during shutdown.
    #[arg(long, value_parser = parse_duration, default_value = "25s")]
    shutdown_drain_timeout: Duration,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| "failed to install rustls crypto provider")?;

    let options = Options::parse();
    let lifecycle = Arc::new(LifecycleManager::new());

    // Fallback serving material: flag-provided or self-signed.
    let fallback = match (&options.tls_cert_file, &options.tls_private_key_file) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = std::fs::read_to_string(cert_path)?;
            let key_pem = std::fs::read_to_string(key_path)?;
            ServingKey::from_pem(&cert_pem, &key_pem)
                .map_err(|e| format!("--tls-cert-file/--tls-private-key-file: {e}"))?
        }
        _ => {
            warn!("no serving certificate flags given, generating a self-signed fallback");
            let hostname = hostname_or_default();
            ServingKey::self_signed(vec![hostname, "localhost".to_string()])
                .map_err(|e| format!("self-signed fallback: {e}"))?
        }
    };
    let fallback = Arc::new(fallback);

    let base_client_ca = match &options.client_ca_file {
        Some(path) => {
            let pem = std::fs::read_to_string(path)?;
            Some(Arc::new(
                parse_ca_roots(&pem).map_err(|e| format!("--client-ca-file: {e}"))?,
            ))
        }
        None => None,
    };
    let base_config = Arc::new(
        build_server_config(
            fallback.certs.clone(),
            fallback.key.clone_key(),
            base_client_ca,
        )
        .map_err(|e| format!("base TLS config: {e}"))?,
    );

    // Load the cluster registry; any invalid document refuses startup.
    let source = FileSource::new(&options.upstream_cluster_file);
    let documents = source.load().await?;
    if documents.is_empty() {
        return Err(format!(
            "no cluster documents in {}",
            options.upstream_cluster_file.display()
        )
        .into());
    }
    let registry = Arc::new(ClusterRegistry::new());
    for document in &documents {
        let cluster = ClusterInfo::new(
            document,
            ClusterOptions {
                fallback_serving: Some(Arc::clone(&fallback)),
                ..Default::default()
            },
        )?;
        registry.add(cluster);
    }
    info!(
        clusters = registry.len(),
        file = %options.upstream_cluster_file.display(),
        "upstream cluster registry loaded"
    );

    // Health endpoints on the insecure port.
    if let Some(port) = options.health_port {
        let addr = SocketAddr::new(options.bind_address, port);
        let listener = TcpListener::bind(addr).await?;
        let router = health_router(Arc::clone(&lifecycle), Arc::clone(&registry));
        let token = lifecycle.shutdown_token();
        info!(%addr, "health endpoints listening");
        tokio::spawn(async move {
            let shutdown = async move { token.cancelled().await };
            if let Err(error) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(%error, "health server failed");
            }
        });
    }

    let state = Arc::new(GatewayState {
        dispatcher: Dispatcher::new(Arc::clone(&registry), options.enable_proxy_access_log),
        authenticator: Authenticator::new(
            Arc::clone(&registry),
            options.api_audiences.clone(),
            options.authentication_token_success_cache_ttl,
            options.authentication_token_failure_cache_ttl,
        ),
        sni: SniSelect::new(Arc::clone(&registry), base_config),
        lifecycle: Arc::clone(&lifecycle),
    });

    let addr = SocketAddr::new(options.bind_address, options.secure_port);
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!(%addr, error = %e, "failed to bind secure listener");
        e
    })?;
    info!(%addr, "secure listener bound");
    lifecycle.mark_ready();

    let server = tokio::spawn(serve(listener, Arc::clone(&state)));

    shutdown_signal().await;
    info!("shutdown signal received");
    lifecycle.begin_shutdown();
    let _ = server.await;

    match lifecycle.drain(options.shutdown_drain_timeout).await {
        DrainResult::Completed => info!("all connections drained"),
        DrainResult::TimedOut { remaining } => {
            warn!(remaining, "drain timed out, closing remaining connections")
        }
    }
    registry.range(|_, cluster| cluster.shutdown());
    lifecycle.mark_stopped();
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn hostname_or_default() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "kubegate.local".to_string())
}

/// Parse durations like `600s`, `10m`, `1h`, `250ms`, or bare seconds.
fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let (number, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => value.split_at(split),
        None => (value, "s"),
    };
    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration {value:?}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(number)),
        "s" => Ok(Duration::from_secs(number)),
        "m" => Ok(Duration::from_secs(number * 60)),
        "h" => Ok(Duration::from_secs(number * 3600)),
        other => Err(format!("unknown duration unit {other:?} in {value:?}")),
    }
}
