//! Full-stack TLS tests: SNI-selected serving certificates, client
//! certificate identity, and routing through the secure listener.

mod helpers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;

use kubegate::auth::Authenticator;
use kubegate::cluster::{ClusterInfo, ClusterRegistry};
use kubegate::dispatch::Dispatcher;
use kubegate::lifecycle::LifecycleManager;
use kubegate::serve::{GatewayState, serve};
use kubegate::tls::{ServingKey, SniSelect, build_server_config};

use helpers::{
    MockUpstream, TestPki, basic_cluster_yaml, client_identity, install_provider, make_cluster,
    mark_all_ready, parse_cluster, test_pki,
};

/// Spin up the full secure serving loop over the given clusters. Returns
/// the listener address and the DER of the base (fallback) certificate.
async fn start_gateway(clusters: Vec<Arc<ClusterInfo>>) -> (SocketAddr, Vec<u8>) {
    install_provider();
    let registry = Arc::new(ClusterRegistry::new());
    for cluster in clusters {
        registry.add(cluster);
    }

    let base_key = ServingKey::self_signed(vec!["fallback.invalid".to_string()]).expect("base key");
    let base_der = base_key.certs[0].to_vec();
    let base_config = Arc::new(
        build_server_config(base_key.certs.clone(), base_key.key.clone_key(), None)
            .expect("base config"),
    );

    let lifecycle = Arc::new(LifecycleManager::new());
    lifecycle.mark_ready();
    let state = Arc::new(GatewayState {
        dispatcher: Dispatcher::new(Arc::clone(&registry), false),
        authenticator: Authenticator::new(
            Arc::clone(&registry),
            vec![],
            Duration::from_secs(600),
            Duration::from_secs(10),
        ),
        sni: SniSelect::new(Arc::clone(&registry), base_config),
        lifecycle,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(serve(listener, state));
    (addr, base_der)
}

fn cluster_with_tls(name: &str, endpoint: &str, pki: &TestPki) -> Arc<ClusterInfo> {
    let mut doc = parse_cluster(&basic_cluster_yaml(name, endpoint));
    doc.spec.secure_serving.cert_data = Some(pki.server_cert_pem.clone());
    doc.spec.secure_serving.key_data = Some(pki.server_key_pem.clone());
    let cluster = make_cluster(&doc);
    mark_all_ready(&cluster);
    cluster
}

/// Handshake with the gateway and return the presented leaf certificate.
async fn presented_cert(addr: SocketAddr, server_name: ServerName<'static>) -> Vec<u8> {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TrustAnything::new()))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let tcp = TcpStream::connect(addr).await.expect("connect");
    let tls = connector.connect(server_name, tcp).await.expect("handshake");
    tls.get_ref().1.peer_certificates().expect("peer certs")[0].to_vec()
}

#[tokio::test]
async fn sni_selects_the_cluster_certificate() {
    let upstream = MockUpstream::start().await;
    let pki_a = test_pki("a.example");
    let pki_b = test_pki("b.example");
    let (addr, base_der) = start_gateway(vec![
        cluster_with_tls("a.example", &upstream.endpoint(), &pki_a),
        cluster_with_tls("b.example", &upstream.endpoint(), &pki_b),
    ])
    .await;

    let a = presented_cert(addr, ServerName::try_from("a.example").unwrap()).await;
    assert_eq!(a, pki_a.server_cert_der);

    let b = presented_cert(addr, ServerName::try_from("b.example").unwrap()).await;
    assert_eq!(b, pki_b.server_cert_der);

    // Unknown SNI gets the base certificate.
    let other = presented_cert(addr, ServerName::try_from("other.example").unwrap()).await;
    assert_eq!(other, base_der);

    // No SNI at all (IP server name) falls back to the local address, which
    // matches no cluster here.
    let no_sni = presented_cert(addr, ServerName::from(addr.ip())).await;
    assert_eq!(no_sni, base_der);
}

#[tokio::test]
async fn requests_route_by_sni_through_the_full_stack() {
    let upstream = MockUpstream::start().await;
    let pki = test_pki("a.example");
    let (addr, _) = start_gateway(vec![cluster_with_tls(
        "a.example",
        &upstream.endpoint(),
        &pki,
    )])
    .await;

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .resolve("a.example", addr)
        .build()
        .expect("client");

    let response = client
        .get(format!(
            "https://a.example:{}/api/v1/namespaces/default/pods",
            addr.port()
        ))
        .bearer_auth("caller-token")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let echoed: serde_json::Value = response.json().await.expect("json");
    assert_eq!(echoed["path"], "/api/v1/namespaces/default/pods");

    let seen = upstream.last_request().await;
    assert_eq!(seen.header("authorization"), Some("Bearer upstream-token"));
}

#[tokio::test]
async fn connection_without_matching_cluster_yields_404() {
    let upstream = MockUpstream::start().await;
    let pki = test_pki("a.example");
    let (addr, _) = start_gateway(vec![cluster_with_tls(
        "a.example",
        &upstream.endpoint(),
        &pki,
    )])
    .await;

    // Connecting by bare IP sends no SNI; the Host header names no
    // registered cluster either.
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .expect("client");
    let response = client
        .get(format!("https://{addr}/api/v1/namespaces/default/pods"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let status: serde_json::Value = response.json().await.expect("json");
    assert_eq!(status["kind"], "Status");
    assert_eq!(status["reason"], "NotFound");
}

#[tokio::test]
async fn client_certificate_identity_is_impersonated() {
    let upstream = MockUpstream::start().await;
    let pki = test_pki("a.example");
    let (ca_pem, cert_pem, key_pem) = client_identity("client-ca", "jane-cert", &["ops"]);

    let mut doc = parse_cluster(&basic_cluster_yaml("a.example", &upstream.endpoint()));
    doc.spec.secure_serving.cert_data = Some(pki.server_cert_pem.clone());
    doc.spec.secure_serving.key_data = Some(pki.server_key_pem.clone());
    doc.spec.secure_serving.client_ca_data = Some(ca_pem);
    let cluster = make_cluster(&doc);
    mark_all_ready(&cluster);

    let (addr, _) = start_gateway(vec![cluster]).await;

    let identity =
        reqwest::Identity::from_pem(format!("{cert_pem}{key_pem}").as_bytes()).expect("identity");
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .resolve("a.example", addr)
        .identity(identity)
        .build()
        .expect("client");

    let response = client
        .get(format!(
            "https://a.example:{}/api/v1/namespaces/default/pods",
            addr.port()
        ))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let seen = upstream.last_request().await;
    assert_eq!(seen.header("impersonate-user"), Some("jane-cert"));
    assert!(seen.header_all("impersonate-group").contains(&"ops"));
}

/// Client-side verifier for tests: trusts whatever the gateway presents.
#[derive(Debug)]
struct TrustAnything {
    schemes: Vec<rustls::SignatureScheme>,
}

impl TrustAnything {
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

impl ServerCertVerifier for TrustAnything {
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
