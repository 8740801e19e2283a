//! Configuration loading and validation failures.
//!
//! All of these are fatal at startup: the gateway refuses to run with an
//! invalid cluster document.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read cluster file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse cluster document: {source}")]
    ParseYaml {
        #[source]
        source: serde_yaml::Error,
    },

    #[error("cluster document {index} has no metadata.name")]
    MissingName { index: usize },

    #[error("unexpected apiVersion/kind {api_version:?}/{kind:?} in cluster {name:?}")]
    UnexpectedKind {
        name: String,
        api_version: String,
        kind: String,
    },

    #[error("duplicate cluster name {name:?}")]
    DuplicateCluster { name: String },

    #[error("cluster {cluster:?}: invalid server endpoint {endpoint:?}: {message}")]
    InvalidEndpoint {
        cluster: String,
        endpoint: String,
        message: String,
    },

    #[error("cluster {cluster:?}: duplicate server endpoint {endpoint:?}")]
    DuplicateEndpoint { cluster: String, endpoint: String },

    #[error("flow control schema {name:?} must set exactly one of exempt, maxRequestsInflight, tokenBucket")]
    AmbiguousFlowSchema { name: String },

    #[error("cluster {cluster:?}: duplicate flow control schema {name:?}")]
    DuplicateFlowSchema { cluster: String, name: String },

    #[error("cluster {cluster:?}: flow control schema {name:?} has invalid parameters: {message}")]
    InvalidFlowSchema {
        cluster: String,
        name: String,
        message: String,
    },

    #[error(
        "cluster {cluster:?}: dispatch policy {policy:?} references unknown flow schema {schema:?}"
    )]
    UnknownFlowSchema {
        cluster: String,
        policy: String,
        schema: String,
    },

    #[error(
        "cluster {cluster:?}: dispatch policy {policy:?} upstream subset references unknown server {endpoint:?}"
    )]
    UnknownSubsetServer {
        cluster: String,
        policy: String,
        endpoint: String,
    },

    #[error("cluster {cluster:?}: dispatch policy {policy:?} has no rules")]
    EmptyPolicy { cluster: String, policy: String },

    #[error("cluster {cluster:?}: invalid TLS material: {message}")]
    InvalidTlsMaterial { cluster: String, message: String },

    #[error("cluster {cluster:?}: invalid client credentials: {message}")]
    InvalidClientCredentials { cluster: String, message: String },
}
