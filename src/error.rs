//! Gateway error taxonomy and HTTP rendering.
//!
//! Every failure the dispatch pipeline can produce is a [`GatewayError`]
//! variant. Each variant carries enough context to log and maps to exactly
//! one HTTP status code; bodies are rendered as Kubernetes `Status` objects
//! so kubectl and client-go print something sensible.

use bytes::Bytes;
use http::{Response, StatusCode, header};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use thiserror::Error;

/// Unified response body type for the proxy data path.
///
/// Local error responses are buffered `Full` bodies; proxied responses are
/// streamed. Both are boxed into this type.
pub type ProxyBody = BoxBody<Bytes, GatewayError>;

/// Convenience result alias for the dispatch pipeline.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Build an empty [`ProxyBody`].
pub fn empty_body() -> ProxyBody {
    Full::new(Bytes::new()).map_err(|e| match e {}).boxed()
}

/// Build a buffered [`ProxyBody`] from bytes.
pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|e| match e {}).boxed()
}

/// Failures produced by the dispatch pipeline.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No upstream cluster is registered under the requested hostname.
    #[error("no upstream cluster registered for host {host:?}")]
    UnknownCluster { host: String },

    /// The cluster's dispatch policies matched nothing; default is reject.
    #[error("no dispatch policy matched the request on cluster {cluster:?}")]
    NoPolicyMatch { cluster: String },

    /// The matched policy's flow-control schema refused admission.
    #[error("flow control schema {schema:?} rejected the request on cluster {cluster:?}")]
    AdmissionRejected { cluster: String, schema: String },

    /// Every candidate endpoint is unready.
    #[error("no ready endpoint in cluster {cluster:?}")]
    NoReadyEndpoint { cluster: String },

    /// Dial or IO failure talking to the chosen endpoint.
    #[error("upstream {endpoint} unreachable: {message}")]
    UpstreamUnreachable { endpoint: String, message: String },

    /// A bounded upstream deadline elapsed.
    #[error("upstream {endpoint} timed out")]
    UpstreamTimeout { endpoint: String },

    /// The client went away mid-request. Logged at debug, never rendered.
    #[error("client disconnected")]
    ClientCancelled,

    /// Recovered panic or other unexpected failure.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// HTTP status code this error renders as.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownCluster { .. } => StatusCode::NOT_FOUND,
            Self::NoPolicyMatch { .. } => StatusCode::FORBIDDEN,
            Self::AdmissionRejected { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NoReadyEndpoint { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamUnreachable { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            // Rendered only when the disconnect is detected before the
            // response starts; hyper drops the write either way.
            Self::ClientCancelled => StatusCode::BAD_REQUEST,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable reason, in the style of `metav1.StatusReason`.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UnknownCluster { .. } => "NotFound",
            Self::NoPolicyMatch { .. } => "Forbidden",
            Self::AdmissionRejected { .. } => "TooManyRequests",
            Self::NoReadyEndpoint { .. } => "ServiceUnavailable",
            Self::UpstreamUnreachable { .. } => "BadGateway",
            Self::UpstreamTimeout { .. } => "Timeout",
            Self::ClientCancelled => "ClientCancelled",
            Self::Internal { .. } => "InternalError",
        }
    }

    /// Whether the client should be told to retry shortly.
    pub fn retry_after_secs(&self) -> Option<u32> {
        match self {
            Self::AdmissionRejected { .. } => Some(1),
            _ => None,
        }
    }

    /// Render this error as a Kubernetes `Status` response.
    pub fn into_response(self) -> Response<ProxyBody> {
        let code = self.status_code();
        let status = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": self.to_string(),
            "reason": self.reason(),
            "code": code.as_u16(),
        });
        let body = serde_json::to_vec(&status).unwrap_or_default();

        let mut builder = Response::builder()
            .status(code)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(secs) = self.retry_after_secs() {
            builder = builder.header(header::RETRY_AFTER, secs);
        }
        builder
            .body(full_body(Bytes::from(body)))
            .expect("static response construction cannot fail")
    }
}
