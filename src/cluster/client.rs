//! Pre-built clients for talking to upstream API servers.
//!
//! One [`ClientTemplate`] per cluster carries the connector (upstream TLS
//! verification, optional client certificate, dial timeout) and the bearer
//! credential. Each endpoint wraps the shared template in an
//! [`UpstreamClient`] pinned to that endpoint's scheme and authority, so the
//! dispatcher and the health probe never rebuild connection state per
//! request.

use std::sync::Arc;
use std::time::Duration;

use http::header::{AUTHORIZATION, HOST};
use http::uri::{Authority, PathAndQuery, Scheme, Uri};
use http::{HeaderValue, Method, Request, Response};
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use rustls::RootCertStore;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tracing::warn;

use crate::config::{ClientConfig, ConfigError};
use crate::error::{ProxyBody, empty_body};
use crate::tls;

/// Upstream dial timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection state shared by every endpoint of one cluster.
pub struct ClientTemplate {
    client: Client<HttpsConnector<HttpConnector>, ProxyBody>,
    bearer: Option<HeaderValue>,
}

impl std::fmt::Debug for ClientTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTemplate")
            .field("bearer", &self.bearer.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl ClientTemplate {
    /// Build the template from a cluster's `clientConfig`.
    pub fn build(cluster: &str, config: &ClientConfig) -> Result<Arc<Self>, ConfigError> {
        let credentials = |message: String| ConfigError::InvalidClientCredentials {
            cluster: cluster.to_string(),
            message,
        };

        let builder = rustls::ClientConfig::builder();
        let builder = if config.insecure {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureServerVerifier::new()))
        } else if let Some(ca) = &config.ca_data {
            let roots = tls::parse_ca_roots(ca).map_err(&credentials)?;
            builder.with_root_certificates(roots)
        } else {
            builder.with_root_certificates(native_roots(cluster))
        };

        let tls_config = match (&config.client_cert, &config.client_key) {
            (Some(cert), Some(key)) => {
                let certs = tls::parse_certificates(cert).map_err(&credentials)?;
                let key = tls::parse_private_key(key).map_err(&credentials)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| credentials(e.to_string()))?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(credentials(
                    "clientCert and clientKey must be provided together".to_string(),
                ));
            }
        };

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(Some(DIAL_TIMEOUT));

        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(https);

        let bearer = match &config.bearer_token {
            Some(token) => {
                let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|_| credentials("bearer token is not a valid header value".into()))?;
                value.set_sensitive(true);
                Some(value)
            }
            None => None,
        };

        Ok(Arc::new(Self { client, bearer }))
    }
}

fn native_roots(cluster: &str) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for error in &loaded.errors {
        warn!(cluster, %error, "skipping unloadable native root certificate");
    }
    for cert in loaded.certs {
        let _ = roots.add(cert);
    }
    roots
}

/// A template pinned to one endpoint address.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    template: Arc<ClientTemplate>,
    scheme: Scheme,
    authority: Authority,
    host_header: HeaderValue,
}

impl UpstreamClient {
    pub fn new(
        cluster: &str,
        template: Arc<ClientTemplate>,
        endpoint: &str,
    ) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidEndpoint {
            cluster: cluster.to_string(),
            endpoint: endpoint.to_string(),
            message,
        };
        let uri: Uri = endpoint
            .parse()
            .map_err(|e: http::uri::InvalidUri| invalid(e.to_string()))?;
        let scheme = uri
            .scheme()
            .cloned()
            .ok_or_else(|| invalid("missing scheme".into()))?;
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| invalid("missing host".into()))?;
        let host_header = HeaderValue::from_str(authority.as_str())
            .map_err(|_| invalid("host is not a valid header value".into()))?;
        Ok(Self {
            template,
            scheme,
            authority,
            host_header,
        })
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Send `req` to this endpoint: the URI is re-rooted at the endpoint's
    /// scheme/authority (path and query preserved) and the cluster's bearer
    /// credential replaces whatever `Authorization` the request carried.
    pub async fn send(
        &self,
        mut req: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, hyper_util::client::legacy::Error> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        *req.uri_mut() = Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .expect("rebuilding a parsed URI cannot fail");
        req.headers_mut().insert(HOST, self.host_header.clone());
        if let Some(bearer) = &self.template.bearer {
            req.headers_mut().insert(AUTHORIZATION, bearer.clone());
        }
        self.template.client.request(req).await
    }

    /// Issue a bare GET, used by the health probe.
    pub async fn get(
        &self,
        path: &'static str,
    ) -> Result<Response<Incoming>, hyper_util::client::legacy::Error> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(empty_body())
            .expect("static request construction cannot fail");
        self.send(req).await
    }
}

/// Verifier used when `clientConfig.insecure` is set: accepts any upstream
/// certificate while keeping signature checks available for the handshake.
#[derive(Debug)]
struct InsecureServerVerifier {
    schemes: Vec<rustls::SignatureScheme>,
}

impl InsecureServerVerifier {
    fn new() -> Self {
        let provider = rustls::crypto::CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
        Self {
            schemes: provider
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}
