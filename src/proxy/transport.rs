//! The outbound leg of the proxy.
//!
//! Builds the upstream request from the inbound one (credential swap,
//! impersonation, hop-by-hop filtering), streams bodies without buffering,
//! and turns `101 Switching Protocols` responses into a raw bidirectional
//! relay for exec/attach/portforward traffic. The admission permit rides on
//! the response body and releases exactly once, when the stream finishes or
//! is dropped.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode};
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cluster::{EndpointInfo, Permit};
use crate::error::{GatewayError, ProxyBody, empty_body};
use crate::user::{
    IMPERSONATE_EXTRA_PREFIX, IMPERSONATE_GROUP_HEADER, IMPERSONATE_USER_HEADER, UserInfo,
};

/// Headers that never cross the proxy. `connection`, `upgrade`, and
/// `transfer-encoding` stay: they carry the upgrade negotiation and chunked
/// framing the relay depends on.
const STRIPPED_HEADERS: &[&str] = &[
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
];

/// Whether the request negotiates a protocol upgrade (SPDY, WebSocket).
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false)
        && headers.contains_key(header::UPGRADE)
}

/// Forward one admitted request to `endpoint`.
///
/// The permit is attached to whatever keeps the request alive: the response
/// body for regular and watch traffic, the relay task for upgrades.
pub async fn forward<B>(
    endpoint: &Arc<EndpointInfo>,
    req: Request<B>,
    user: &UserInfo,
    permit: Permit,
) -> Result<Response<ProxyBody>, GatewayError>
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (mut parts, body) = req.into_parts();
    let client_upgrade = parts.extensions.remove::<OnUpgrade>();
    let upgrading = client_upgrade.is_some() && is_upgrade_request(&parts.headers);

    let mut outbound = Request::builder()
        .method(parts.method.clone())
        .uri(parts.uri.clone())
        .body(if upgrading {
            // The upgrade handshake carries no body; bytes flow on the raw
            // connection after the 101.
            empty_body()
        } else {
            body.map_err(|e| {
                let message = e.into().to_string();
                debug!(message, "inbound body error");
                GatewayError::ClientCancelled
            })
            .boxed()
        })
        .map_err(|e| GatewayError::Internal {
            message: format!("building upstream request: {e}"),
        })?;

    copy_request_headers(&parts.headers, outbound.headers_mut());
    impersonate(outbound.headers_mut(), user);

    let client = endpoint.client();
    let response = client
        .send(outbound)
        .await
        .map_err(|e| map_client_error(endpoint.endpoint(), e))?;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        let Some(client_upgrade) = client_upgrade else {
            return Err(GatewayError::UpstreamUnreachable {
                endpoint: endpoint.endpoint().to_string(),
                message: "upstream switched protocols on a non-upgrade request".to_string(),
            });
        };
        return Ok(relay_upgrade(endpoint, response, client_upgrade, permit));
    }

    let (resp_parts, resp_body) = response.into_parts();
    let endpoint_url = endpoint.endpoint().to_string();
    let streamed = resp_body.map_err(move |e| GatewayError::UpstreamUnreachable {
        endpoint: endpoint_url.clone(),
        message: format!("response stream: {e}"),
    });
    let body = PermitBody::new(streamed.boxed(), permit).boxed();
    Ok(Response::from_parts(resp_parts, body))
}

/// Complete both upgrade handshakes and pump raw bytes until either side
/// closes. The 101 response returned to hyper triggers the client-side
/// upgrade; the relay task holds the admission permit for the duration.
fn relay_upgrade(
    endpoint: &Arc<EndpointInfo>,
    mut response: Response<hyper::body::Incoming>,
    client_upgrade: OnUpgrade,
    permit: Permit,
) -> Response<ProxyBody> {
    let upstream_upgrade = hyper::upgrade::on(&mut response);
    let endpoint_url = endpoint.endpoint().to_string();

    tokio::spawn(async move {
        let _held = permit;
        let (upstream, client) = tokio::join!(upstream_upgrade, client_upgrade);
        let (upstream, client) = match (upstream, client) {
            (Ok(u), Ok(c)) => (u, c),
            (upstream, client) => {
                warn!(
                    endpoint = endpoint_url,
                    upstream_err = upstream.err().map(|e| e.to_string()),
                    client_err = client.err().map(|e| e.to_string()),
                    "protocol upgrade failed"
                );
                return;
            }
        };
        let mut upstream = TokioIo::new(upstream);
        let mut client = TokioIo::new(client);
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((up, down)) => debug!(
                endpoint = endpoint_url,
                bytes_up = up,
                bytes_down = down,
                "upgraded connection closed"
            ),
            Err(error) => debug!(endpoint = endpoint_url, %error, "upgraded connection aborted"),
        }
    });

    let (parts, _) = response.into_parts();
    Response::from_parts(parts, empty_body())
}

fn copy_request_headers(inbound: &HeaderMap, outbound: &mut HeaderMap) {
    for (name, value) in inbound {
        if should_strip(name) {
            continue;
        }
        outbound.append(name.clone(), value.clone());
    }
}

fn should_strip(name: &HeaderName) -> bool {
    // The caller's own credential never reaches the upstream; the cluster
    // credential is injected by the endpoint client. Inbound impersonation
    // headers are dropped so only the gateway-derived identity survives.
    if name == header::AUTHORIZATION {
        return true;
    }
    // HeaderName is always lower-case; the prefix covers user, group, and
    // extra impersonation headers alike.
    let name = name.as_str();
    STRIPPED_HEADERS.contains(&name) || name.starts_with("impersonate-")
}

/// Stamp the authenticated identity onto the outbound request.
fn impersonate(headers: &mut HeaderMap, user: &UserInfo) {
    if let Ok(value) = HeaderValue::from_str(&user.username) {
        headers.insert(IMPERSONATE_USER_HEADER, value);
    }
    for group in &user.groups {
        if let Ok(value) = HeaderValue::from_str(group) {
            headers.append(IMPERSONATE_GROUP_HEADER, value);
        }
    }
    for (key, values) in &user.extra {
        let Ok(name) = HeaderName::try_from(format!("{IMPERSONATE_EXTRA_PREFIX}{key}")) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
}

fn map_client_error(endpoint: &str, error: hyper_util::client::legacy::Error) -> GatewayError {
    if timed_out(&error) {
        return GatewayError::UpstreamTimeout {
            endpoint: endpoint.to_string(),
        };
    }
    GatewayError::UpstreamUnreachable {
        endpoint: endpoint.to_string(),
        message: flatten_error(&error),
    }
}

fn timed_out(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&dyn std::error::Error> = Some(error);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>()
            && io.kind() == std::io::ErrorKind::TimedOut
        {
            return true;
        }
        current = e.source();
    }
    false
}

fn flatten_error(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut current = error.source();
    while let Some(e) = current {
        message = format!("{message}: {e}");
        current = e.source();
    }
    message
}

/// Response body wrapper that pins the admission permit to the stream.
/// Release happens once: at end-of-stream, on error, or on drop when the
/// client disconnects mid-body.
pub struct PermitBody {
    inner: ProxyBody,
    permit: Option<Permit>,
}

impl PermitBody {
    pub fn new(inner: ProxyBody, permit: Permit) -> Self {
        Self {
            inner,
            permit: Some(permit),
        }
    }
}

impl Body for PermitBody {
    type Data = Bytes;
    type Error = GatewayError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(None) | Poll::Ready(Some(Err(_))) => {
                if let Some(mut permit) = this.permit.take() {
                    permit.release();
                }
            }
            _ => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
