//! Admission gate
//!
//! Decides whether a CertificateSigningRequest is this controller's to sign.
//! Checks run in a fixed order and the first match wins, so structural
//! reasons (deleted, foreign signer, already done) are reported before the
//! approval state is ever looked at.

use std::fmt;

use k8s_openapi::api::certificates::v1::CertificateSigningRequest;

use crate::csr;

/// Why a request was left alone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IgnoreReason {
    /// The request is being deleted
    Deleted,
    /// The request names no signer
    NoSignerName,
    /// The request names a different signer
    SignerMismatch,
    /// A certificate has already been issued
    AlreadySigned,
    /// No `Approved` condition, or a `Denied` one
    NotApproved,
}

impl IgnoreReason {
    /// Stable label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deleted => "deleted",
            Self::NoSignerName => "no signer name",
            Self::SignerMismatch => "signer mismatch",
            Self::AlreadySigned => "already signed",
            Self::NotApproved => "not approved",
        }
    }
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Leave the request untouched
    Ignore(IgnoreReason),
    /// Parse, sign and persist
    Proceed,
}

/// Classify `request` against the configured `signer_name`
///
/// Pure: reads the request and nothing else.
pub fn classify(request: &CertificateSigningRequest, signer_name: &str) -> Outcome {
    if csr::is_deleted(request) {
        return Outcome::Ignore(IgnoreReason::Deleted);
    }
    let Some(requested) = csr::signer_name(request) else {
        return Outcome::Ignore(IgnoreReason::NoSignerName);
    };
    if requested != signer_name {
        return Outcome::Ignore(IgnoreReason::SignerMismatch);
    }
    if csr::has_certificate(request) {
        return Outcome::Ignore(IgnoreReason::AlreadySigned);
    }
    if !csr::is_approved(request) {
        return Outcome::Ignore(IgnoreReason::NotApproved);
    }
    Outcome::Proceed
}
