//! TLS serving material and SNI-based server config selection.
//!
//! Each cluster publishes a [`TlsBundle`] built from its `secureServing`
//! PEM blocks: a complete `rustls::ServerConfig` (cluster certificate, or
//! the gateway fallback certificate when the cluster ships only a client
//! CA) plus the raw client-CA root store the authenticator verifies
//! identities against. Bundles are swapped atomically on reconfiguration;
//! the handshake path performs a single lock-free load.

use std::sync::Arc;

use rustls::RootCertStore;
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use tracing::debug;

use crate::cluster::ClusterRegistry;

/// A parsed serving certificate chain and its private key.
pub struct ServingKey {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl ServingKey {
    /// Parse PEM cert chain + PEM private key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, String> {
        let certs = parse_certificates(cert_pem)?;
        if certs.is_empty() {
            return Err("certificate PEM contains no certificates".to_string());
        }
        let key = parse_private_key(key_pem)?;
        Ok(Self { certs, key })
    }

    /// Generate a self-signed serving key for the given hostnames. Used as
    /// the gateway fallback when no serving flags are provided.
    pub fn self_signed(hostnames: Vec<String>) -> Result<Self, String> {
        let generated =
            rcgen::generate_simple_self_signed(hostnames).map_err(|e| e.to_string())?;
        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(
            generated.key_pair.serialize_der(),
        ));
        Ok(Self {
            certs: vec![generated.cert.der().clone()],
            key,
        })
    }
}

/// The active TLS state of one cluster.
pub struct TlsBundle {
    /// Complete server config presented for this cluster's SNI. `None` when
    /// neither the cluster nor the gateway has a serving certificate.
    pub server_config: Option<Arc<ServerConfig>>,
    /// Roots for verifying client certificates, exposed to authentication.
    pub client_ca: Option<Arc<RootCertStore>>,
}

/// Build a cluster's [`TlsBundle`] from its `secureServing` block.
///
/// Empty input produces `Ok(None)`: the cluster serves with the gateway
/// base config and accepts no client certificates of its own. A cluster
/// that ships only `clientCAData` borrows the `fallback` serving key so a
/// client-CA verifier can still be installed for its SNI.
pub fn build_bundle(
    secure: &crate::config::SecureServing,
    fallback: Option<&ServingKey>,
) -> Result<Option<TlsBundle>, String> {
    if secure.is_empty() {
        return Ok(None);
    }

    let client_ca = match &secure.client_ca_data {
        Some(pem) => Some(Arc::new(parse_ca_roots(pem)?)),
        None => None,
    };

    let own_key = match (&secure.cert_data, &secure.key_data) {
        (Some(cert), Some(key)) => Some(ServingKey::from_pem(cert, key)?),
        (None, None) => None,
        _ => return Err("certData and keyData must be provided together".to_string()),
    };

    let server_config = match own_key.as_ref().or(fallback) {
        Some(serving) => Some(Arc::new(build_server_config(
            serving.certs.clone(),
            serving.key.clone_key(),
            client_ca.clone(),
        )?)),
        None => None,
    };

    Ok(Some(TlsBundle {
        server_config,
        client_ca,
    }))
}

/// Build a server config from a serving key and an optional client CA.
///
/// Client certificates are requested but never required: token and
/// anonymous authentication remain possible on the same listener. A
/// presented certificate is still verified against the CA.
pub fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_ca: Option<Arc<RootCertStore>>,
) -> Result<ServerConfig, String> {
    let verifier = match client_ca {
        Some(roots) => WebPkiClientVerifier::builder(roots)
            .allow_unauthenticated()
            .build()
            .map_err(|e| e.to_string())?,
        None => WebPkiClientVerifier::no_client_auth(),
    };
    let mut config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| e.to_string())?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

/// Parse a PEM bundle into DER certificates.
pub fn parse_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>, String> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid certificate PEM: {e}"))
}

/// Parse a PEM private key (PKCS#8, PKCS#1, or SEC1).
pub fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>, String> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| format!("invalid private key PEM: {e}"))?
        .ok_or_else(|| "private key PEM contains no key".to_string())
}

/// Parse a PEM CA bundle into a root store.
pub fn parse_ca_roots(pem: &str) -> Result<RootCertStore, String> {
    let mut roots = RootCertStore::empty();
    let mut found = 0usize;
    for cert in rustls_pemfile::certs(&mut pem.as_bytes()) {
        let cert = cert.map_err(|e| format!("invalid CA PEM: {e}"))?;
        roots
            .add(cert)
            .map_err(|e| format!("rejected CA certificate: {e}"))?;
        found += 1;
    }
    if found == 0 {
        return Err("CA PEM contains no certificates".to_string());
    }
    Ok(roots)
}

/// Resolves the server config for each inbound TLS handshake.
///
/// The accept loop inspects the ClientHello, asks [`SniSelect::select`] for
/// a config, and completes the handshake with it. Lookups never fail
/// closed: any miss falls back to the base config so the TLS error surface
/// stays with the client and never touches registry state.
pub struct SniSelect {
    registry: Arc<ClusterRegistry>,
    base: Arc<ServerConfig>,
}

impl SniSelect {
    pub fn new(registry: Arc<ClusterRegistry>, base: Arc<ServerConfig>) -> Self {
        Self { registry, base }
    }

    pub fn base(&self) -> Arc<ServerConfig> {
        self.base.clone()
    }

    /// Pick the config for one handshake. `server_name` comes from the
    /// ClientHello; with no SNI the local connection address stands in, which
    /// serves IP-keyed clusters.
    pub fn select(
        &self,
        server_name: Option<&str>,
        local_addr: Option<std::net::IpAddr>,
    ) -> Arc<ServerConfig> {
        let host = match server_name {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => match local_addr {
                Some(ip) => ip.to_string(),
                None => return self.base.clone(),
            },
        };
        match self.registry.get(&host) {
            Some(cluster) => match cluster.load_tls_config() {
                Some(config) => {
                    debug!(%host, cluster = cluster.name(), "serving cluster TLS config");
                    config
                }
                None => self.base.clone(),
            },
            None => self.base.clone(),
        }
    }
}
