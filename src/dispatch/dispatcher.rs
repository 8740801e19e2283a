//! The end-to-end request pipeline.
//!
//! classify → resolve cluster → match policy → admit → pick endpoint →
//! proxy. Each step that can refuse a request maps to one status code;
//! everything that streams is handed to [`crate::proxy::transport`].

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::header::HOST;
use http::{Request, Response};
use http_body::Body;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterInfo, ClusterRegistry, registry::normalize_host};
use crate::config::{DispatchPolicy, log_enabled};
use crate::error::{GatewayError, GatewayResult, ProxyBody};
use crate::proxy::transport;
use crate::user::UserInfo;

use super::request_info::RequestInfo;

/// Connection-level context the serving layer attaches to every request.
#[derive(Debug, Clone, Default)]
pub struct ConnectionContext {
    /// SNI hostname from the TLS handshake, if the client sent one.
    pub sni: Option<String>,
    /// Local address of the accepted connection, the SNI fallback.
    pub local_addr: Option<std::net::SocketAddr>,
    /// Remote peer, for logging.
    pub peer_addr: Option<std::net::SocketAddr>,
}

/// Routes requests through the registry to upstream endpoints.
pub struct Dispatcher {
    registry: Arc<ClusterRegistry>,
    enable_access_log: bool,
}

impl Dispatcher {
    pub fn new(registry: Arc<ClusterRegistry>, enable_access_log: bool) -> Self {
        Self {
            registry,
            enable_access_log,
        }
    }

    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    /// Run the pipeline, rendering refusals as their status responses.
    /// Only a client disconnect propagates as an error.
    pub async fn handle<B>(&self, req: Request<B>) -> GatewayResult<Response<ProxyBody>>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match self.dispatch(req).await {
            Ok(response) => Ok(response),
            Err(GatewayError::ClientCancelled) => {
                debug!("client disconnected before a response was written");
                Err(GatewayError::ClientCancelled)
            }
            Err(error) => {
                warn!(%error, status = %error.status_code(), "request refused");
                Ok(error.into_response())
            }
        }
    }

    /// The pipeline itself; every refusal is a typed error.
    pub async fn dispatch<B>(&self, mut req: Request<B>) -> GatewayResult<Response<ProxyBody>>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let started = Instant::now();

        let host = request_host(&req).ok_or(GatewayError::UnknownCluster {
            host: String::new(),
        })?;
        let cluster = self
            .registry
            .get(&host)
            .ok_or(GatewayError::UnknownCluster { host: host.clone() })?;

        let info = RequestInfo::parse(req.method(), req.uri());
        let user = req
            .extensions()
            .get::<Arc<UserInfo>>()
            .cloned()
            .unwrap_or_else(|| Arc::new(UserInfo::anonymous()));

        let policy = cluster
            .match_policy(&info, &user)
            .ok_or_else(|| GatewayError::NoPolicyMatch {
                cluster: cluster.name().to_string(),
            })?;

        let permit = cluster
            .admit(&policy)
            .ok_or_else(|| GatewayError::AdmissionRejected {
                cluster: cluster.name().to_string(),
                schema: policy
                    .flow_control_schema_name
                    .clone()
                    .unwrap_or_default(),
            })?;

        let endpoint = cluster
            .pick_endpoint(&policy)
            .ok_or_else(|| GatewayError::NoReadyEndpoint {
                cluster: cluster.name().to_string(),
            })?;

        // Downstream consumers (long-running detection, logging) read the
        // classification from the request context.
        let log_line = self.access_log_context(&cluster, &policy, &info, &user, &endpoint);
        req.extensions_mut().insert(info);

        let response = transport::forward(&endpoint, req, &user, permit).await?;

        if let Some(log) = log_line {
            info!(
                cluster = %log.cluster,
                policy = %log.policy,
                endpoint = %log.endpoint,
                verb = %log.verb,
                path = %log.path,
                user = %log.user,
                status = response.status().as_u16(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "proxied"
            );
        }
        Ok(response)
    }

    fn access_log_context(
        &self,
        cluster: &ClusterInfo,
        policy: &DispatchPolicy,
        info: &RequestInfo,
        user: &UserInfo,
        endpoint: &crate::cluster::EndpointInfo,
    ) -> Option<AccessLog> {
        if !self.enable_access_log || !log_enabled(cluster.log_mode(), policy.log_mode) {
            return None;
        }
        Some(AccessLog {
            cluster: cluster.name().to_string(),
            policy: policy.name.clone(),
            endpoint: endpoint.endpoint().to_string(),
            verb: info.verb.clone(),
            path: info.path.clone(),
            user: user.username.clone(),
        })
    }
}

struct AccessLog {
    cluster: String,
    policy: String,
    endpoint: String,
    verb: String,
    path: String,
    user: String,
}

/// The routing hostname: handshake SNI first, then the `Host` header, then
/// the URI authority. Always canonicalized.
pub(crate) fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(ctx) = req.extensions().get::<ConnectionContext>() {
        if let Some(sni) = &ctx.sni
            && !sni.is_empty()
        {
            return Some(normalize_host(sni));
        }
    }
    if let Some(host) = req.headers().get(HOST).and_then(|v| v.to_str().ok()) {
        return Some(normalize_host(host));
    }
    req.uri().host().map(normalize_host)
}
