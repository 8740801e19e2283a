//! Per-cluster runtime state and reconfiguration.
//!
//! A [`ClusterInfo`] aggregates everything the dispatch path needs for one
//! upstream cluster: the endpoint set with health state, the upstream client
//! template, the active TLS bundle, the flow-control limiters, and the
//! ordered dispatch policies. [`ClusterInfo::reconfigure`] is an idempotent
//! whole-object reconciler: every fallible step is staged up front, so a bad
//! document leaves the previous good state untouched.

use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use rustls::RootCertStore;
use rustls::ServerConfig;
use tracing::{debug, info};

pub mod client;
pub mod endpoint;
pub mod flow;
pub mod registry;

pub use client::{ClientTemplate, UpstreamClient};
pub use endpoint::{DEFAULT_PROBE_PERIOD, EndpointInfo, ProbeStatus};
pub use flow::{FlowControlMap, FlowLimiter, Permit};
pub use registry::ClusterRegistry;

use crate::config::{ConfigError, DispatchPolicy, LogMode, UpstreamCluster, UpstreamClusterSpec};
use crate::dispatch::matcher;
use crate::dispatch::request_info::RequestInfo;
use crate::tls::{ServingKey, TlsBundle, build_bundle};
use crate::user::UserInfo;

/// Construction knobs, mostly for tests.
#[derive(Clone)]
pub struct ClusterOptions {
    /// Base period of the endpoint health probes.
    pub probe_period: Duration,
    /// Spawn probe tasks for new endpoints. Tests drive readiness directly.
    pub spawn_probes: bool,
    /// Gateway serving key lent to clusters that configure only a client CA.
    pub fallback_serving: Option<Arc<ServingKey>>,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            probe_period: DEFAULT_PROBE_PERIOD,
            spawn_probes: true,
            fallback_serving: None,
        }
    }
}

/// Runtime state for one upstream cluster.
pub struct ClusterInfo {
    name: String,
    options: ClusterOptions,
    /// Active TLS bundle, swapped whole on reconfiguration.
    tls: ArcSwapOption<TlsBundle>,
    /// Endpoints in configured order; order is the round-robin tie-break.
    endpoints: RwLock<Vec<Arc<EndpointInfo>>>,
    flow: FlowControlMap,
    policies: RwLock<Vec<Arc<DispatchPolicy>>>,
    log_mode: ArcSwap<Option<LogMode>>,
    cursor: AtomicUsize,
    /// Serializes writers; readers never take it.
    reconfigure_lock: Mutex<()>,
}

impl std::fmt::Debug for ClusterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterInfo")
            .field("name", &self.name)
            .field("endpoints", &self.all_endpoints())
            .finish_non_exhaustive()
    }
}

impl ClusterInfo {
    /// Build the cluster from its document and apply the initial config.
    pub fn new(config: &UpstreamCluster, options: ClusterOptions) -> Result<Arc<Self>, ConfigError> {
        let info = Arc::new(Self {
            name: config.name().to_string(),
            options,
            tls: ArcSwapOption::empty(),
            endpoints: RwLock::new(Vec::new()),
            flow: FlowControlMap::new(),
            policies: RwLock::new(Vec::new()),
            log_mode: ArcSwap::from_pointee(None),
            cursor: AtomicUsize::new(0),
            reconfigure_lock: Mutex::new(()),
        });
        info.reconfigure(&config.spec)?;
        Ok(info)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply a (new) spec. Safe to call repeatedly with the same document.
    ///
    /// Every fallible stage (client template, per-endpoint clients, TLS
    /// bundle) runs before any state mutates; an error therefore leaves the
    /// previously good configuration fully intact.
    pub fn reconfigure(&self, spec: &UpstreamClusterSpec) -> Result<(), ConfigError> {
        let _guard = self.reconfigure_lock.lock();

        // Stage everything that can fail.
        let template = ClientTemplate::build(&self.name, &spec.client_config)?;
        let desired: Vec<&str> = spec
            .servers
            .iter()
            .filter(|s| !s.disabled)
            .map(|s| s.endpoint.as_str())
            .collect();
        let mut staged_clients = Vec::with_capacity(desired.len());
        for endpoint in &desired {
            staged_clients.push(UpstreamClient::new(&self.name, template.clone(), endpoint)?);
        }
        let bundle = build_bundle(&spec.secure_serving, self.options.fallback_serving.as_deref())
            .map_err(|message| ConfigError::InvalidTlsMaterial {
                cluster: self.name.clone(),
                message,
            })?;

        // From here on nothing fails; publish stage by stage.
        self.sync_endpoints(&desired, staged_clients);
        self.tls.store(bundle.map(Arc::new));
        self.flow.sync(&self.name, &spec.flow_control);
        *self.policies.write().expect("policy lock poisoned") = spec
            .dispatch_policies
            .iter()
            .cloned()
            .map(Arc::new)
            .collect();
        self.log_mode.store(Arc::new(spec.log_mode));

        info!(
            cluster = %self.name,
            endpoints = desired.len(),
            policies = spec.dispatch_policies.len(),
            flow_schemas = spec.flow_control.schemas.len(),
            "cluster configuration applied"
        );
        Ok(())
    }

    /// Reconcile the endpoint set to `desired` (configured order).
    ///
    /// New endpoints start (probe included) before removed ones tear down,
    /// so the ready set never collapses while the config overlap is
    /// non-empty. Surviving endpoints keep their identity and get a client
    /// rebuilt from the new template.
    fn sync_endpoints(&self, desired: &[&str], staged_clients: Vec<UpstreamClient>) {
        let mut endpoints = self.endpoints.write().expect("endpoint lock poisoned");

        let mut next = Vec::with_capacity(desired.len());
        for (url, client) in desired.iter().zip(staged_clients) {
            match endpoints.iter().find(|e| e.endpoint() == *url) {
                Some(existing) => {
                    existing.reset_client(client);
                    next.push(Arc::clone(existing));
                }
                None => {
                    debug!(cluster = %self.name, endpoint = *url, "adding endpoint");
                    let info =
                        EndpointInfo::new(self.name.clone(), (*url).to_string(), client);
                    if self.options.spawn_probes {
                        info.spawn_probe(self.options.probe_period);
                    }
                    next.push(info);
                }
            }
        }

        for removed in endpoints
            .iter()
            .filter(|e| !desired.contains(&e.endpoint()))
        {
            debug!(
                cluster = %self.name,
                endpoint = removed.endpoint(),
                "removing endpoint"
            );
            removed.shutdown();
        }

        *endpoints = next;
    }

    /// The active server config for this cluster's SNI, if any.
    pub fn load_tls_config(&self) -> Option<Arc<ServerConfig>> {
        self.tls.load().as_ref().and_then(|b| b.server_config.clone())
    }

    /// The client CA roots used to verify caller certificates, if any.
    pub fn load_client_ca(&self) -> Option<Arc<RootCertStore>> {
        self.tls.load().as_ref().and_then(|b| b.client_ca.clone())
    }

    pub fn log_mode(&self) -> Option<LogMode> {
        **self.log_mode.load()
    }

    /// All live endpoint URLs, configured order.
    pub fn all_endpoints(&self) -> Vec<String> {
        self.endpoints
            .read()
            .expect("endpoint lock poisoned")
            .iter()
            .map(|e| e.endpoint().to_string())
            .collect()
    }

    /// Endpoint URLs currently passing their health probe.
    pub fn ready_endpoints(&self) -> Vec<String> {
        self.endpoints
            .read()
            .expect("endpoint lock poisoned")
            .iter()
            .filter(|e| e.is_ready())
            .map(|e| e.endpoint().to_string())
            .collect()
    }

    pub fn endpoints(&self) -> Vec<Arc<EndpointInfo>> {
        self.endpoints
            .read()
            .expect("endpoint lock poisoned")
            .clone()
    }

    /// First policy whose rule list matches the classified request.
    pub fn match_policy(
        &self,
        info: &RequestInfo,
        user: &UserInfo,
    ) -> Option<Arc<DispatchPolicy>> {
        let policies = self.policies.read().expect("policy lock poisoned");
        matcher::match_policy(&policies, info, user)
    }

    /// Admit the request through the policy's flow schema.
    pub fn admit(&self, policy: &DispatchPolicy) -> Option<Permit> {
        self.flow.admit(policy.flow_control_schema_name.as_deref())
    }

    pub fn flow_control(&self) -> &FlowControlMap {
        &self.flow
    }

    /// Round-robin over the ready endpoints within the policy's subset
    /// (empty subset means every endpoint), tie-broken by configured order.
    pub fn pick_endpoint(&self, policy: &DispatchPolicy) -> Option<Arc<EndpointInfo>> {
        let endpoints = self.endpoints.read().expect("endpoint lock poisoned");
        let candidates: Vec<&Arc<EndpointInfo>> = endpoints
            .iter()
            .filter(|e| {
                policy.upstream_subset.is_empty()
                    || policy.upstream_subset.iter().any(|s| s == e.endpoint())
            })
            .filter(|e| e.is_ready())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(Arc::clone(candidates[slot]))
    }

    /// Cancel every probe. Called when the cluster leaves the registry.
    pub fn shutdown(&self) {
        for endpoint in self.endpoints.read().expect("endpoint lock poisoned").iter() {
            endpoint.shutdown();
        }
    }
}
