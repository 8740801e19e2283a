//! Shared fixtures: a recording mock upstream API server, generated PKI,
//! and cluster construction shortcuts.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use kubegate::cluster::{ClusterInfo, ClusterOptions};
use kubegate::config::{UpstreamCluster, parse_cluster_documents};

/// Everything one recorded request carried.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

#[derive(Clone)]
struct MockState {
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    readyz_status: Arc<AtomicU16>,
}

/// A mock upstream API server that records everything it sees.
///
/// - `GET /readyz` answers with a configurable status code.
/// - `POST /apis/authentication.k8s.io/v1/tokenreviews` authenticates the
///   literal token `good-token` as `jane`.
/// - `/api/v1/namespaces/slow/...` sleeps before responding.
/// - `/api/v1/namespaces/stream/...` responds with a never-ending chunked
///   body, like a watch.
/// - Everything else echoes method/path/query/headers/body as JSON.
pub struct MockUpstream {
    pub addr: SocketAddr,
    state: MockState,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let state = MockState {
            requests: Arc::new(Mutex::new(Vec::new())),
            readyz_status: Arc::new(AtomicU16::new(200)),
        };
        let router = Router::new()
            .route("/readyz", get(readyz))
            .route(
                "/apis/authentication.k8s.io/v1/tokenreviews",
                post(token_review),
            )
            .fallback(echo)
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock upstream");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Self { addr, state }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_readyz(&self, status: u16) {
        self.state.readyz_status.store(status, Ordering::SeqCst);
    }

    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().await.clone()
    }

    pub async fn request_count(&self) -> usize {
        self.state.requests.lock().await.len()
    }

    pub async fn last_request(&self) -> RecordedRequest {
        self.state
            .requests
            .lock()
            .await
            .last()
            .cloned()
            .expect("mock upstream saw no request")
    }
}

async fn record(state: &MockState, method: &Method, uri: &Uri, headers: &HeaderMap, body: &[u8]) {
    state.requests.lock().await.push(RecordedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        headers: headers
            .iter()
            .map(|(n, v)| {
                (
                    n.as_str().to_string(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect(),
        body: body.to_vec(),
    });
}

async fn readyz(State(state): State<MockState>) -> Response {
    let status =
        StatusCode::from_u16(state.readyz_status.load(Ordering::SeqCst)).unwrap_or(StatusCode::OK);
    if status == StatusCode::OK {
        (StatusCode::OK, "ok").into_response()
    } else {
        (
            status,
            axum::Json(json!({
                "kind": "Status",
                "status": "Failure",
                "reason": "NotThereYet",
                "message": "etcd is still warming up",
            })),
        )
            .into_response()
    }
}

async fn token_review(
    State(state): State<MockState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    record(&state, &method, &uri, &headers, &body).await;
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
    let token = parsed["spec"]["token"].as_str().unwrap_or_default();
    let payload = if token == "good-token" {
        json!({
            "kind": "TokenReview",
            "apiVersion": "authentication.k8s.io/v1",
            "status": {
                "authenticated": true,
                "user": {
                    "username": "jane",
                    "uid": "u-1",
                    "groups": ["ops"],
                }
            }
        })
    } else {
        json!({
            "kind": "TokenReview",
            "apiVersion": "authentication.k8s.io/v1",
            "status": {"authenticated": false, "error": "token rejected"}
        })
    };
    (StatusCode::CREATED, axum::Json(payload)).into_response()
}

async fn echo(
    State(state): State<MockState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    record(&state, &method, &uri, &headers, &body).await;

    if uri.path().starts_with("/api/v1/namespaces/slow/") {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    if uri.path().starts_with("/api/v1/namespaces/stream/") {
        let stream = futures_util::stream::unfold(0u64, |n| async move {
            tokio::time::sleep(Duration::from_millis(25)).await;
            let chunk = Bytes::from(format!("{{\"type\":\"ADDED\",\"seq\":{n}}}\n"));
            Some((Ok::<_, std::convert::Infallible>(chunk), n + 1))
        });
        return Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(Body::from_stream(stream))
            .expect("stream response");
    }

    let payload = json!({
        "method": method.to_string(),
        "path": uri.path(),
        "query": uri.query(),
        "body": String::from_utf8_lossy(&body),
        "headers": headers
            .iter()
            .map(|(n, v)| (n.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect::<std::collections::BTreeMap<_, _>>(),
    });
    (StatusCode::OK, axum::Json(payload)).into_response()
}

/// Generated CA + host certificate, all PEM.
pub struct TestPki {
    pub ca_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
    pub server_cert_der: Vec<u8>,
}

pub fn test_pki(host: &str) -> TestPki {
    let ca_key = KeyPair::generate().expect("ca key");
    let mut ca_params = CertificateParams::new(vec![]).expect("ca params");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "kubegate-test-ca");
    let ca_cert = ca_params.self_signed(&ca_key).expect("ca cert");

    let server_key = KeyPair::generate().expect("server key");
    let mut server_params = CertificateParams::new(vec![host.to_string()]).expect("server params");
    server_params
        .distinguished_name
        .push(DnType::CommonName, host);
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .expect("server cert");

    TestPki {
        ca_pem: ca_cert.pem(),
        server_cert_pem: server_cert.pem(),
        server_key_pem: server_key.serialize_pem(),
        server_cert_der: server_cert.der().to_vec(),
    }
}

/// A client certificate (and key) signed by a fresh CA; returns
/// `(ca_pem, cert_pem, key_pem)`.
pub fn client_identity(ca_cn: &str, user_cn: &str, orgs: &[&str]) -> (String, String, String) {
    let ca_key = KeyPair::generate().expect("ca key");
    let mut ca_params = CertificateParams::new(vec![]).expect("ca params");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.distinguished_name.push(DnType::CommonName, ca_cn);
    let ca_cert = ca_params.self_signed(&ca_key).expect("ca cert");

    let key = KeyPair::generate().expect("client key");
    let mut params = CertificateParams::new(vec![]).expect("client params");
    params.distinguished_name.push(DnType::CommonName, user_cn);
    for org in orgs {
        params
            .distinguished_name
            .push(DnType::OrganizationName, *org);
    }
    let cert = params
        .signed_by(&key, &ca_cert, &ca_key)
        .expect("client cert");

    (ca_cert.pem(), cert.pem(), key.serialize_pem())
}

/// Minimal cluster document: wildcard policy, insecure upstream client.
pub fn basic_cluster_yaml(name: &str, endpoint: &str) -> String {
    format!(
        "apiVersion: proxy.kubegateway.io/v1alpha1\n\
         kind: UpstreamCluster\n\
         metadata:\n  name: {name}\n\
         spec:\n\
         \x20 servers:\n    - endpoint: {endpoint}\n\
         \x20 clientConfig:\n\
         \x20   bearerToken: upstream-token\n\
         \x20   insecure: true\n\
         \x20 flowControl:\n\
         \x20   schemas:\n\
         \x20     - name: wide-open\n\
         \x20       exempt: {{}}\n\
         \x20 dispatchPolicies:\n\
         \x20   - name: default\n\
         \x20     flowControlSchemaName: wide-open\n\
         \x20     rules:\n\
         \x20       - verbs: [\"*\"]\n\
         \x20         apiGroups: [\"*\"]\n\
         \x20         resources: [\"*\"]\n\
         \x20         nonResourceURLs: [\"*\"]\n"
    )
}

pub fn parse_cluster(yaml: &str) -> UpstreamCluster {
    parse_cluster_documents(yaml)
        .expect("parse cluster yaml")
        .remove(0)
}

/// Build a cluster with probes disabled; readiness is driven by the test.
pub fn make_cluster(doc: &UpstreamCluster) -> Arc<ClusterInfo> {
    install_provider();
    ClusterInfo::new(
        doc,
        ClusterOptions {
            spawn_probes: false,
            ..Default::default()
        },
    )
    .expect("build cluster")
}

/// Build a cluster with fast probes enabled.
pub fn make_probing_cluster(doc: &UpstreamCluster, period: Duration) -> Arc<ClusterInfo> {
    install_provider();
    ClusterInfo::new(
        doc,
        ClusterOptions {
            probe_period: period,
            spawn_probes: true,
            ..Default::default()
        },
    )
    .expect("build cluster")
}

pub fn mark_all_ready(cluster: &ClusterInfo) {
    for endpoint in cluster.endpoints() {
        endpoint.update_status(true, "", "");
    }
}

pub fn install_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}
