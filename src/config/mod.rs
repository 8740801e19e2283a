//! Upstream cluster configuration document.
//!
//! The gateway is driven by `UpstreamCluster` YAML documents
//! (`proxy.kubegateway.io/v1alpha1`). One document describes one upstream
//! cluster: its servers, upstream client credentials, serving TLS material,
//! flow-control schemas, and the ordered dispatch policies.

use serde::{Deserialize, Serialize};

pub mod error;
pub mod loader;
pub mod source;

pub use error::ConfigError;
pub use loader::{load_cluster_documents, parse_cluster_documents, validate_cluster};
pub use source::{ConfigSource, FileSource, ReconcileEvent};

/// Expected `apiVersion` of cluster documents.
pub const API_VERSION: &str = "proxy.kubegateway.io/v1alpha1";
/// Expected `kind` of cluster documents.
pub const KIND: &str = "UpstreamCluster";

/// A single upstream cluster document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpstreamCluster {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: UpstreamClusterSpec,
}

impl UpstreamCluster {
    /// The cluster name doubles as the SNI hostname clients route by.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpstreamClusterSpec {
    /// Upstream API server endpoints.
    #[serde(default)]
    pub servers: Vec<UpstreamClusterServer>,
    /// Credentials and TLS options for talking to the servers.
    #[serde(default)]
    pub client_config: ClientConfig,
    /// Serving key/cert presented for this SNI plus the client CA bundle.
    #[serde(default)]
    pub secure_serving: SecureServing,
    /// Named admission limiters referenced by dispatch policies.
    #[serde(default)]
    pub flow_control: FlowControl,
    /// Ordered dispatch policies; first match wins.
    #[serde(default)]
    pub dispatch_policies: Vec<DispatchPolicy>,
    /// Cluster-level access log switch.
    #[serde(default)]
    pub log_mode: Option<LogMode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpstreamClusterServer {
    /// Endpoint URL, e.g. `https://10.0.0.1:6443`.
    pub endpoint: String,
    /// Disabled servers stay in the document but get no endpoint.
    #[serde(default)]
    pub disabled: bool,
}

/// Credentials the gateway uses toward the upstream servers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientConfig {
    /// Bearer token injected on proxied requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    /// PEM client certificate presented to the upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<String>,
    /// PEM client key paired with `client_cert`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    /// PEM CA bundle used to verify upstream server identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_data: Option<String>,
    /// Client-side rate hints carried from the source document.
    #[serde(default)]
    pub qps: f64,
    #[serde(default)]
    pub burst: u32,
    /// Skip upstream server certificate verification.
    #[serde(default)]
    pub insecure: bool,
}

/// PEM material served for this cluster's SNI hostname.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SecureServing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ca_data: Option<String>,
}

impl SecureServing {
    pub fn is_empty(&self) -> bool {
        self.key_data.is_none() && self.cert_data.is_none() && self.client_ca_data.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FlowControl {
    #[serde(default)]
    pub schemas: Vec<FlowControlSchema>,
}

/// One named limiter. Exactly one of the three strategies must be set;
/// [`FlowControlSchema::strategy`] enforces that at validation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FlowControlSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exempt: Option<ExemptSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests_inflight: Option<MaxRequestsInflightSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_bucket: Option<TokenBucketSchema>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExemptSchema {}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MaxRequestsInflightSchema {
    pub max: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TokenBucketSchema {
    pub qps: f64,
    pub burst: u32,
}

/// Validated view over the three mutually exclusive schema strategies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlowStrategy {
    Exempt,
    MaxRequestsInflight { max: u32 },
    TokenBucket { qps: f64, burst: u32 },
}

impl FlowControlSchema {
    /// Resolve which strategy this schema configures.
    ///
    /// # Errors
    ///
    /// Fails unless exactly one of the three strategy blocks is present.
    pub fn strategy(&self) -> Result<FlowStrategy, ConfigError> {
        let set = [
            self.exempt.is_some(),
            self.max_requests_inflight.is_some(),
            self.token_bucket.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count();
        if set != 1 {
            return Err(ConfigError::AmbiguousFlowSchema {
                name: self.name.clone(),
            });
        }
        if self.exempt.is_some() {
            return Ok(FlowStrategy::Exempt);
        }
        if let Some(m) = self.max_requests_inflight {
            return Ok(FlowStrategy::MaxRequestsInflight { max: m.max });
        }
        let tb = self.token_bucket.expect("one strategy is set");
        Ok(FlowStrategy::TokenBucket {
            qps: tb.qps,
            burst: tb.burst,
        })
    }
}

/// One dispatch policy: an ordered rule list plus what to do on match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DispatchPolicy {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub rules: Vec<DispatchPolicyRule>,
    /// Restrict endpoint selection to these server endpoints; empty = all.
    #[serde(default)]
    pub upstream_subset: Vec<String>,
    /// Named flow-control schema; absent = exempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_control_schema_name: Option<String>,
    /// Per-policy access log switch.
    #[serde(default)]
    pub log_mode: Option<LogMode>,
}

/// One rule: a cross-product over request and identity dimensions.
///
/// `verbs`, `apiGroups`, `resources` (for resource requests) and
/// `nonResourceURLs` (for the rest) are required dimensions: an empty list
/// matches nothing. The remaining dimensions are constraints only when
/// non-empty. `"*"` is the wildcard everywhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DispatchPolicyRule {
    #[serde(default)]
    pub verbs: Vec<String>,
    #[serde(default)]
    pub api_groups: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub resource_names: Vec<String>,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default, rename = "nonResourceURLs")]
    pub non_resource_urls: Vec<String>,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub user_groups: Vec<String>,
    #[serde(default)]
    pub service_accounts: Vec<String>,
}

/// Access-log switch. Unset inherits; the effective value is the AND of the
/// cluster and policy switches, see [`log_enabled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogMode {
    On,
    Off,
}

/// Effective access-log decision for a request: off wins, then on, then off.
pub fn log_enabled(cluster: Option<LogMode>, policy: Option<LogMode>) -> bool {
    if cluster == Some(LogMode::Off) || policy == Some(LogMode::Off) {
        return false;
    }
    cluster == Some(LogMode::On) || policy == Some(LogMode::On)
}
