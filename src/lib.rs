//! signer-ca - an automated certificate authority for Kubernetes
//!
//! Watches `certificates.k8s.io/v1` CertificateSigningRequests, and for every
//! request that names this signer and has been approved by some other actor,
//! signs the embedded PKCS#10 request with a long-lived CA key pair and writes
//! the certificate back into the request's status.
//!
//! # Modules
//!
//! - [`controller`] - Admission gate and the sign-and-persist coordinator
//! - [`csr`] - Helpers over the CertificateSigningRequest resource
//! - [`pki`] - CA loading and certificate issuance
//! - [`optimistic`] - resourceVersion-guarded writes shared by all mutators
//! - [`events`] - Kubernetes Event publishing
//! - [`leader_election`] - Lease-based leader election for HA deployments
//! - [`config`] - Operator-facing configuration
//! - [`health`] - `/healthz` and `/readyz` endpoints
//! - [`telemetry`] / [`metrics`] - Logging, tracing and metrics
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod csr;
pub mod error;
pub mod events;
pub mod health;
pub mod leader_election;
pub mod metrics;
pub mod optimistic;
pub mod pki;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager name used for every write this controller makes
pub const FIELD_MANAGER: &str = "signer-ca";

/// Reporting component name attached to emitted Kubernetes Events
pub const CONTROLLER_NAME: &str = "signer-ca-controller";
