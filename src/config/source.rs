//! Pluggable origin for cluster documents.
//!
//! The registry is reconciled from whatever a [`ConfigSource`] emits. The
//! shipped implementation is [`FileSource`], which reads a local YAML file
//! once at startup. A watching source (file notify, shared informer) plugs
//! in behind the same trait by returning a receiver from [`ConfigSource::watch`].

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::ConfigError;
use super::{UpstreamCluster, loader};

/// One reconciliation step against the cluster registry.
#[derive(Debug, Clone)]
pub enum ReconcileEvent {
    /// Create or reconfigure the named cluster.
    Upsert(Box<UpstreamCluster>),
    /// Remove the named cluster.
    Delete(String),
}

/// Where cluster documents come from.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Load the complete current document set.
    async fn load(&self) -> Result<Vec<UpstreamCluster>, ConfigError>;

    /// Subscribe to subsequent changes. Sources without change detection
    /// (the static file source) return `None`.
    fn watch(&self) -> Option<mpsc::Receiver<ReconcileEvent>> {
        None
    }
}

/// Static file source: loads the cluster file once, never emits changes.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl ConfigSource for FileSource {
    async fn load(&self) -> Result<Vec<UpstreamCluster>, ConfigError> {
        let path = self.path.clone();
        // File IO is tiny here but keep it off the runtime workers anyway.
        tokio::task::spawn_blocking(move || loader::load_cluster_documents(&path))
            .await
            .map_err(|e| ConfigError::ReadFile {
                path: self.path.clone(),
                source: std::io::Error::other(e),
            })?
    }
}
