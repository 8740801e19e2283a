//! One upstream endpoint: reachability state and its health probe.
//!
//! Every endpoint owns a recurring probe task that GETs `/readyz` through
//! the endpoint's pre-built client. The probe publishes transitions with
//! plain atomic stores; the dispatch path only ever reads the latch and
//! never blocks on probe IO. Removing an endpoint cancels its probe task
//! through the endpoint's `CancellationToken`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use http::StatusCode;
use http_body_util::BodyExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::UpstreamClient;

/// Default probe period; each tick is jittered ±10 %.
pub const DEFAULT_PROBE_PERIOD: Duration = Duration::from_secs(5);
/// Hard deadline for one probe request.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Probe responses larger than this are not worth parsing.
const PROBE_BODY_LIMIT: usize = 16 * 1024;

/// Result of the most recent probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeStatus {
    pub reason: String,
    pub message: String,
}

/// Runtime state of a single upstream address.
pub struct EndpointInfo {
    /// Owning cluster, by name only.
    cluster: String,
    /// Endpoint URL as configured, e.g. `https://10.0.0.1:6443`.
    endpoint: String,
    client: ArcSwap<UpstreamClient>,
    ready: AtomicBool,
    status: ArcSwap<ProbeStatus>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for EndpointInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointInfo")
            .field("cluster", &self.cluster)
            .field("endpoint", &self.endpoint)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl EndpointInfo {
    pub fn new(cluster: String, endpoint: String, client: UpstreamClient) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            endpoint,
            client: ArcSwap::from_pointee(client),
            ready: AtomicBool::new(false),
            status: ArcSwap::from_pointee(ProbeStatus::default()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn client(&self) -> Arc<UpstreamClient> {
        self.client.load_full()
    }

    /// Swap in a client rebuilt from new cluster credentials.
    pub fn reset_client(&self, client: UpstreamClient) {
        self.client.store(Arc::new(client));
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn probe_status(&self) -> Arc<ProbeStatus> {
        self.status.load_full()
    }

    /// Publish a probe result. Lock-free; readers observe the latch via a
    /// single atomic load.
    pub fn update_status(&self, ready: bool, reason: &str, message: &str) {
        self.status.store(Arc::new(ProbeStatus {
            reason: reason.to_string(),
            message: message.to_string(),
        }));
        self.ready.store(ready, Ordering::Release);
    }

    /// Token cancelled when this endpoint is removed from its cluster.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel the probe task and mark the endpoint unready.
    pub fn shutdown(&self) {
        self.ready.store(false, Ordering::Release);
        self.cancel.cancel();
    }

    /// Spawn the recurring probe task for this endpoint.
    pub fn spawn_probe(self: &Arc<Self>, period: Duration) {
        let endpoint = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                endpoint.probe_once().await;
                let jittered = jitter(period);
                tokio::select! {
                    _ = endpoint.cancel.cancelled() => {
                        debug!(
                            cluster = %endpoint.cluster,
                            endpoint = %endpoint.endpoint,
                            "health probe stopped"
                        );
                        return;
                    }
                    _ = tokio::time::sleep(jittered) => {}
                }
            }
        });
    }

    /// One probe round trip with failure classification.
    pub async fn probe_once(&self) {
        let client = self.client();
        let outcome = tokio::time::timeout(PROBE_TIMEOUT, client.get("/readyz")).await;

        let (reason, message) = match outcome {
            Err(_) => ("Timeout".to_string(), "health probe deadline exceeded".to_string()),
            Ok(Err(error)) => ("Failure".to_string(), error.to_string()),
            Ok(Ok(response)) => {
                let status = response.status();
                if status == StatusCode::OK {
                    if !self.is_ready() {
                        debug!(
                            cluster = %self.cluster,
                            endpoint = %self.endpoint,
                            "endpoint became ready"
                        );
                    }
                    self.update_status(true, "", "");
                    return;
                }
                match read_status_object(response).await {
                    Some(api_status) => (
                        api_status.reason.unwrap_or_else(|| "NotReady".to_string()),
                        api_status.message.unwrap_or_default(),
                    ),
                    None => (
                        "NotReady".to_string(),
                        format!(
                            "request {}/readyz, got response code {}",
                            self.endpoint,
                            status.as_u16()
                        ),
                    ),
                }
            }
        };

        warn!(
            cluster = %self.cluster,
            endpoint = %self.endpoint,
            reason = %reason,
            message = %message,
            "upstream health check failed"
        );
        self.update_status(false, &reason, &message);
    }
}

fn jitter(period: Duration) -> Duration {
    period.mul_f64(0.9 + rand::random::<f64>() * 0.2)
}

/// Subset of a Kubernetes `Status` object carried by probe failures.
#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    kind: String,
    reason: Option<String>,
    message: Option<String>,
}

async fn read_status_object(response: http::Response<hyper::body::Incoming>) -> Option<ApiStatus> {
    let body = http_body_util::Limited::new(response.into_body(), PROBE_BODY_LIMIT);
    let bytes = body.collect().await.ok()?.to_bytes();
    let status: ApiStatus = serde_json::from_slice(&bytes).ok()?;
    (status.kind == "Status").then_some(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_is_a_latch() {
        let status = ProbeStatus {
            reason: "NotReady".into(),
            message: "request e/readyz, got response code 500".into(),
        };
        assert_ne!(status, ProbeStatus::default());
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let period = Duration::from_secs(5);
        for _ in 0..100 {
            let j = jitter(period);
            assert!(j >= period.mul_f64(0.9) && j <= period.mul_f64(1.1), "{j:?}");
        }
    }

    #[test]
    fn status_object_requires_kind() {
        let parsed: ApiStatus =
            serde_json::from_str(r#"{"kind":"Status","reason":"Unauthorized","message":"no"}"#)
                .expect("parse");
        assert_eq!(parsed.kind, "Status");
        assert_eq!(parsed.reason.as_deref(), Some("Unauthorized"));
    }
}
