//! The SNI-hostname → cluster registry.
//!
//! Looked up on every TLS handshake and every dispatched request; reads are
//! a single sharded-map access. Keys are canonicalized: lower-cased, any
//! `:port` suffix stripped.

use std::sync::Arc;

use dashmap::DashMap;
use rustls::RootCertStore;
use tracing::info;

use super::ClusterInfo;

#[derive(Debug, Default)]
pub struct ClusterRegistry {
    clusters: DashMap<String, Arc<ClusterInfo>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a cluster under its canonical name.
    pub fn add(&self, cluster: Arc<ClusterInfo>) {
        let key = normalize_host(cluster.name());
        info!(cluster = cluster.name(), key = %key, "registering upstream cluster");
        if let Some(previous) = self.clusters.insert(key, cluster) {
            previous.shutdown();
        }
    }

    /// Remove a cluster and stop its probes.
    pub fn remove(&self, name: &str) -> Option<Arc<ClusterInfo>> {
        let (_, cluster) = self.clusters.remove(&normalize_host(name))?;
        cluster.shutdown();
        Some(cluster)
    }

    /// Case-insensitive, port-agnostic lookup.
    pub fn get(&self, host: &str) -> Option<Arc<ClusterInfo>> {
        self.clusters.get(&normalize_host(host)).map(|e| e.value().clone())
    }

    /// Client CA roots for the cluster serving `host`, for the
    /// authenticator's certificate verification.
    pub fn verify_roots_for(&self, host: &str) -> Option<Arc<RootCertStore>> {
        self.get(host)?.load_client_ca()
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Visit every registered cluster.
    pub fn range(&self, mut f: impl FnMut(&str, &Arc<ClusterInfo>)) {
        for entry in self.clusters.iter() {
            f(entry.key(), entry.value());
        }
    }
}

/// Canonical registry key: lower-case hostname without any port suffix.
/// Handles bracketed IPv6 literals (`[::1]:6443`).
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let stripped = if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal, optionally with a port.
        match rest.split_once(']') {
            Some((addr, _)) => addr,
            None => host,
        }
    } else if host.matches(':').count() > 1 {
        // Unbracketed IPv6 literal has no port to strip.
        host
    } else {
        host.split(':').next().unwrap_or(host)
    };
    stripped.to_ascii_lowercase()
}
