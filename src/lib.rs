//! KubeGate: a multi-tenant TLS-terminating gateway for Kubernetes API
//! servers.
//!
//! Clients speak normal Kubernetes HTTPS to the gateway; the SNI hostname
//! of the TLS handshake selects an upstream cluster from the registry. The
//! gateway terminates TLS with that cluster's serving material,
//! authenticates the caller (client certificate against the cluster CA,
//! bearer token via upstream `TokenReview`, or anonymous), classifies the
//! request, picks the first matching dispatch policy, admits it through the
//! policy's flow-control schema, round-robins over the cluster's ready
//! endpoints, and streams the exchange with the cluster's own credentials,
//! impersonating the caller. Watches and exec/attach/portforward upgrades
//! are proxied full-duplex for their whole lifetime.
//!
//! # Crate layout
//!
//! - [`config`]: the `UpstreamCluster` document. Schema, loading,
//!   validation, and the pluggable [`config::ConfigSource`].
//! - [`cluster`]: per-cluster runtime state. Endpoints and health probes,
//!   upstream clients, flow-control limiters, the SNI registry.
//! - [`dispatch`]: request classification, policy matching, and the
//!   dispatch pipeline.
//! - [`proxy`]: the streaming relay and protocol-upgrade handling.
//! - [`tls`]: serving material, per-cluster TLS bundles, SNI selection.
//! - [`auth`] and [`user`]: caller authentication and identity.
//! - [`serve`]: the TLS accept loop and per-connection service.
//! - [`lifecycle`]: readiness, drain, and shutdown plumbing.

pub mod auth;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod proxy;
pub mod serve;
pub mod tls;
pub mod user;
