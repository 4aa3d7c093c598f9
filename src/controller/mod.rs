//! CertificateSigningRequest controller
//!
//! The admission gate decides whether a request is ours to sign; the signing half drives
//! the parse, sign and persist sequence and adapts it to the kube-runtime
//! controller.

mod gate;
mod signing;

pub use gate::{classify, IgnoreReason, Outcome};
pub use signing::{
    error_policy, handle_request, reconcile, Context, ContextBuilder, KubeClient, KubeClientImpl,
    Reconciled, DEFAULT_PERSIST_TIMEOUT, DEFAULT_SIGN_TIMEOUT,
};
