//! Caller authentication against the matched SNI cluster.
//!
//! Three authenticators run in order: client certificate (verified during
//! the TLS handshake against the cluster's client CA, identity read from
//! the subject), bearer token (delegated to the cluster's own upstream via
//! a `TokenReview`, with positive and negative caching), then anonymous.
//! The result is attached to the request for the dispatcher to impersonate.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use http::header::AUTHORIZATION;
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::BodyExt;
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::cluster::{ClusterInfo, ClusterRegistry};
use crate::config::DispatchPolicy;
use crate::error::full_body;
use crate::user::UserInfo;

/// Default TTL for cached successful token reviews.
pub const DEFAULT_TOKEN_SUCCESS_TTL: Duration = Duration::from_secs(600);
/// Default TTL for cached failed token reviews.
pub const DEFAULT_TOKEN_FAILURE_TTL: Duration = Duration::from_secs(10);
/// Deadline for one TokenReview round trip.
const TOKEN_REVIEW_TIMEOUT: Duration = Duration::from_secs(10);

const TOKEN_REVIEW_PATH: &str = "/apis/authentication.k8s.io/v1/tokenreviews";

/// Authenticates callers using the cluster their SNI selected.
pub struct Authenticator {
    registry: Arc<ClusterRegistry>,
    api_audiences: Vec<String>,
    success_ttl: Duration,
    failure_ttl: Duration,
    token_cache: DashMap<String, CacheEntry>,
}

struct CacheEntry {
    expires: Instant,
    /// `None` caches a failed review.
    user: Option<Arc<UserInfo>>,
}

impl Authenticator {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        api_audiences: Vec<String>,
        success_ttl: Duration,
        failure_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            api_audiences,
            success_ttl,
            failure_ttl,
            token_cache: DashMap::new(),
        }
    }

    /// Authenticate one request. Never fails: the fallback is anonymous.
    pub async fn authenticate(
        &self,
        host: &str,
        peer_certs: &[CertificateDer<'static>],
        headers: &HeaderMap,
    ) -> Arc<UserInfo> {
        // A peer certificate is only meaningful when the routed cluster
        // configures a client CA; the handshake verified the chain against
        // that CA, so only identity extraction remains.
        if let Some(leaf) = peer_certs.first()
            && self.registry.verify_roots_for(host).is_some()
        {
            match UserInfo::from_client_cert(leaf) {
                Some(user) => return Arc::new(user),
                None => {
                    debug!(%host, "client certificate has no usable subject");
                }
            }
        }

        if let Some(token) = bearer_token(headers)
            && let Some(cluster) = self.registry.get(host)
            && let Some(user) = self.review_token(&cluster, token).await
        {
            return user;
        }

        Arc::new(UserInfo::anonymous())
    }

    /// Delegate a bearer token to the cluster's upstream, consulting the
    /// success/failure caches first.
    async fn review_token(&self, cluster: &Arc<ClusterInfo>, token: &str) -> Option<Arc<UserInfo>> {
        let key = cache_key(cluster.name(), token);
        if let Some(entry) = self.token_cache.get(&key)
            && entry.expires > Instant::now()
        {
            return entry.user.clone();
        }

        let reviewed = self.post_token_review(cluster, token).await;
        let (ttl, user) = match reviewed {
            Some(user) => (self.success_ttl, Some(Arc::new(user))),
            None => (self.failure_ttl, None),
        };
        self.token_cache.insert(
            key,
            CacheEntry {
                expires: Instant::now() + ttl,
                user: user.clone(),
            },
        );
        user
    }

    async fn post_token_review(&self, cluster: &Arc<ClusterInfo>, token: &str) -> Option<UserInfo> {
        // Any ready endpoint will do; an unrestricted policy selects from
        // the full set.
        let endpoint = cluster.pick_endpoint(&DispatchPolicy::default())?;
        let review = TokenReviewRequest {
            api_version: "authentication.k8s.io/v1",
            kind: "TokenReview",
            spec: TokenReviewSpec {
                token,
                audiences: &self.api_audiences,
            },
        };
        let body = serde_json::to_vec(&review).ok()?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(TOKEN_REVIEW_PATH)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(full_body(Bytes::from(body)))
            .expect("static request construction cannot fail");

        let response =
            match tokio::time::timeout(TOKEN_REVIEW_TIMEOUT, endpoint.client().send(request)).await
            {
                Ok(Ok(response)) => response,
                Ok(Err(error)) => {
                    warn!(cluster = cluster.name(), %error, "token review request failed");
                    return None;
                }
                Err(_) => {
                    warn!(cluster = cluster.name(), "token review timed out");
                    return None;
                }
            };

        if response.status() != StatusCode::OK && response.status() != StatusCode::CREATED {
            warn!(
                cluster = cluster.name(),
                status = response.status().as_u16(),
                "token review rejected"
            );
            return None;
        }
        let bytes = response.into_body().collect().await.ok()?.to_bytes();
        let review: TokenReview = serde_json::from_slice(&bytes).ok()?;
        let status = review.status?;
        if !status.authenticated {
            return None;
        }
        let reviewed = status.user?;
        let mut user = UserInfo::authenticated(reviewed.username, reviewed.uid, reviewed.groups);
        user.extra = reviewed.extra;
        Some(user)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

/// Tokens never sit in the cache in the clear.
fn cache_key(cluster: &str, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cluster.as_bytes());
    hasher.update(b"\0");
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenReviewRequest<'a> {
    api_version: &'a str,
    kind: &'a str,
    spec: TokenReviewSpec<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenReviewSpec<'a> {
    token: &'a str,
    #[serde(skip_serializing_if = "audiences_empty")]
    audiences: &'a [String],
}

fn audiences_empty(audiences: &&[String]) -> bool {
    audiences.is_empty()
}

#[derive(Deserialize)]
struct TokenReview {
    status: Option<TokenReviewStatus>,
}

#[derive(Deserialize)]
struct TokenReviewStatus {
    #[serde(default)]
    authenticated: bool,
    user: Option<ReviewedUser>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewedUser {
    #[serde(default)]
    username: String,
    #[serde(default)]
    uid: String,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    extra: BTreeMap<String, Vec<String>>,
}
