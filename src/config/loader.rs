//! Cluster file loading and validation.
//!
//! A cluster file is a YAML stream of one or more `UpstreamCluster`
//! documents. Everything is validated before any runtime state is built;
//! a bad document refuses startup rather than serving a partial registry.

use std::collections::HashSet;
use std::path::Path;

use http::Uri;
use serde::Deserialize;

use super::error::ConfigError;
use super::{FlowStrategy, UpstreamCluster};

/// Read and parse every cluster document in `path`.
pub fn load_cluster_documents(path: &Path) -> Result<Vec<UpstreamCluster>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    parse_cluster_documents(&content)
}

/// Parse a YAML stream of cluster documents and validate each one.
pub fn parse_cluster_documents(content: &str) -> Result<Vec<UpstreamCluster>, ConfigError> {
    let mut clusters = Vec::new();
    let mut seen = HashSet::new();
    for (index, doc) in serde_yaml::Deserializer::from_str(content).enumerate() {
        let value = serde_yaml::Value::deserialize(doc)
            .map_err(|source| ConfigError::ParseYaml { source })?;
        if value.is_null() {
            // Blank document in the stream, e.g. a trailing separator.
            continue;
        }
        let cluster: UpstreamCluster =
            serde_yaml::from_value(value).map_err(|source| ConfigError::ParseYaml { source })?;
        if cluster.name().is_empty() {
            return Err(ConfigError::MissingName { index });
        }
        if !cluster.api_version.is_empty() && cluster.api_version != super::API_VERSION
            || !cluster.kind.is_empty() && cluster.kind != super::KIND
        {
            return Err(ConfigError::UnexpectedKind {
                name: cluster.name().to_string(),
                api_version: cluster.api_version.clone(),
                kind: cluster.kind.clone(),
            });
        }
        if !seen.insert(cluster.name().to_ascii_lowercase()) {
            return Err(ConfigError::DuplicateCluster {
                name: cluster.name().to_string(),
            });
        }
        validate_cluster(&cluster)?;
        clusters.push(cluster);
    }
    Ok(clusters)
}

/// Validate one cluster document.
pub fn validate_cluster(cluster: &UpstreamCluster) -> Result<(), ConfigError> {
    let name = cluster.name();
    let spec = &cluster.spec;

    let mut endpoints = HashSet::new();
    for server in &spec.servers {
        validate_endpoint(name, &server.endpoint)?;
        if !endpoints.insert(server.endpoint.as_str()) {
            return Err(ConfigError::DuplicateEndpoint {
                cluster: name.to_string(),
                endpoint: server.endpoint.clone(),
            });
        }
    }

    let mut schemas = HashSet::new();
    for schema in &spec.flow_control.schemas {
        if !schemas.insert(schema.name.as_str()) {
            return Err(ConfigError::DuplicateFlowSchema {
                cluster: name.to_string(),
                name: schema.name.clone(),
            });
        }
        match schema.strategy()? {
            FlowStrategy::Exempt => {}
            FlowStrategy::MaxRequestsInflight { max } => {
                if max == 0 {
                    return Err(ConfigError::InvalidFlowSchema {
                        cluster: name.to_string(),
                        name: schema.name.clone(),
                        message: "max must be greater than zero".to_string(),
                    });
                }
            }
            FlowStrategy::TokenBucket { qps, burst } => {
                if qps <= 0.0 || !qps.is_finite() {
                    return Err(ConfigError::InvalidFlowSchema {
                        cluster: name.to_string(),
                        name: schema.name.clone(),
                        message: format!("qps must be a positive number, got {qps}"),
                    });
                }
                if burst == 0 {
                    return Err(ConfigError::InvalidFlowSchema {
                        cluster: name.to_string(),
                        name: schema.name.clone(),
                        message: "burst must be greater than zero".to_string(),
                    });
                }
            }
        }
    }

    for (i, policy) in spec.dispatch_policies.iter().enumerate() {
        let policy_name = if policy.name.is_empty() {
            format!("#{i}")
        } else {
            policy.name.clone()
        };
        if policy.rules.is_empty() {
            return Err(ConfigError::EmptyPolicy {
                cluster: name.to_string(),
                policy: policy_name,
            });
        }
        if let Some(schema) = &policy.flow_control_schema_name
            && !schemas.contains(schema.as_str())
        {
            return Err(ConfigError::UnknownFlowSchema {
                cluster: name.to_string(),
                policy: policy_name,
                schema: schema.clone(),
            });
        }
        for subset in &policy.upstream_subset {
            if !endpoints.contains(subset.as_str()) {
                return Err(ConfigError::UnknownSubsetServer {
                    cluster: name.to_string(),
                    policy: policy_name,
                    endpoint: subset.clone(),
                });
            }
        }
    }

    Ok(())
}

fn validate_endpoint(cluster: &str, endpoint: &str) -> Result<(), ConfigError> {
    let invalid = |message: String| ConfigError::InvalidEndpoint {
        cluster: cluster.to_string(),
        endpoint: endpoint.to_string(),
        message,
    };
    let uri: Uri = endpoint
        .parse()
        .map_err(|e: http::uri::InvalidUri| invalid(e.to_string()))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        other => return Err(invalid(format!("unsupported scheme {other:?}"))),
    }
    if uri.authority().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    if uri.path() != "/" && !uri.path().is_empty() {
        return Err(invalid("endpoint must not carry a path".to_string()));
    }
    Ok(())
}
