//! Multi-cluster traffic exposure controller.
//!
//! Given an ingress-like object (a Kubernetes [`Ingress`] or an OpenShift-style [`Route`]) that is
//! spread across multiple logical clusters, the controller
//!
//! - assigns a globally unique generated host below a managed domain,
//! - provisions a TLS certificate for that host,
//! - publishes a weighted [`DnsRecord`] pointing at all live backends, and
//! - optionally lets a verified custom domain replace the generated host.
//!
//! The entry point is [`controller::TrafficController`], which is driven by the bounded-retry
//! [`workqueue::Controller`]. Everything that talks to the outside world (the API server, the DNS
//! provider, the certificate issuer and DNS resolution) sits behind the narrow traits in [`store`],
//! [`dns::provider`], [`tls`], [`net`] and [`domain::oracle`].
//!
//! ## Crate Features
//!
//! - `test-utils` exposes the in-memory collaborators in [`testing`].
//!
//! [`Ingress`]: k8s_openapi::api::networking::v1::Ingress
//! [`Route`]: traffic::route::Route
//! [`DnsRecord`]: dns::DnsRecord

pub mod cli;
pub mod client;
pub mod controller;
pub mod dns;
pub mod domain;
pub mod logging;
pub mod metrics;
pub mod net;
pub mod reconciler;
pub mod store;
pub mod tls;
pub mod traffic;
pub mod validation;
pub mod workqueue;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// External re-exports
pub use k8s_openapi;
pub use kube;
