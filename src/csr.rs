//! Helpers over the `certificates.k8s.io/v1` CertificateSigningRequest resource
//!
//! Everything here is read-only: these functions inspect a CSR and never
//! mutate it.

use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use thiserror::Error;
use x509_parser::prelude::*;

/// Condition type set by an approver when a request is approved
pub const CONDITION_APPROVED: &str = "Approved";

/// Condition type set by an approver when a request is denied
pub const CONDITION_DENIED: &str = "Denied";

const STATUS_TRUE: &str = "True";

/// PEM block tag for a PKCS#10 certificate request
pub const PEM_TAG_CERTIFICATE_REQUEST: &str = "CERTIFICATE REQUEST";

/// The requested signer name, or `None` when unset or empty
pub fn signer_name(csr: &CertificateSigningRequest) -> Option<&str> {
    let name = csr.spec.signer_name.as_str();
    (!name.is_empty()).then_some(name)
}

/// True when the CSR has a deletion timestamp
pub fn is_deleted(csr: &CertificateSigningRequest) -> bool {
    csr.metadata.deletion_timestamp.is_some()
}

/// True when a non-empty certificate has already been written to status
pub fn has_certificate(csr: &CertificateSigningRequest) -> bool {
    csr.status
        .as_ref()
        .and_then(|s| s.certificate.as_ref())
        .map(|c| !c.0.is_empty())
        .unwrap_or(false)
}

fn conditions(csr: &CertificateSigningRequest) -> &[CertificateSigningRequestCondition] {
    csr.status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default()
}

/// True when any `Denied` condition is present, whatever its status
pub fn is_denied(csr: &CertificateSigningRequest) -> bool {
    conditions(csr).iter().any(|c| c.type_ == CONDITION_DENIED)
}

/// True when an `Approved=True` condition is present and no `Denied` one is
///
/// Both condition types are always checked: a request carrying neither is
/// not approved, and a request carrying both is not approved.
pub fn is_approved(csr: &CertificateSigningRequest) -> bool {
    let approved = conditions(csr)
        .iter()
        .any(|c| c.type_ == CONDITION_APPROVED && c.status == STATUS_TRUE);
    approved && !is_denied(csr)
}

/// Requested key usages, passed through to the signer unchanged
pub fn usages(csr: &CertificateSigningRequest) -> &[String] {
    csr.spec.usages.as_deref().unwrap_or_default()
}

/// Reasons a CSR's `spec.request` cannot be used
///
/// These are data defects on the requester's side. They are reported as
/// events on the CSR and never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CsrParseError {
    /// The request bytes are not PEM
    #[error("request is not PEM encoded: {0}")]
    Pem(String),

    /// The PEM block is something other than a certificate request
    #[error("expected PEM block '{PEM_TAG_CERTIFICATE_REQUEST}', found '{0}'")]
    WrongBlock(String),

    /// The DER payload is not a PKCS#10 structure
    #[error("invalid PKCS#10 certificate request: {0}")]
    Der(String),

    /// The request's self-signature does not verify
    #[error("certificate request signature is invalid: {0}")]
    Signature(String),

    /// The request is well-formed but carries content the signer cannot
    /// issue from, such as an unrecognised requested extension
    #[error("certificate request is not supported: {0}")]
    Unsupported(String),
}

/// A certificate request that decoded and verified successfully
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCsr {
    pem: String,
    der: Vec<u8>,
    common_name: String,
}

impl ParsedCsr {
    /// Decode and verify a PEM-encoded PKCS#10 request
    ///
    /// A request that parses here is guaranteed to be readable by
    /// [`crate::pki::CertificateAuthority::sign_csr`].
    pub fn parse(request: &[u8]) -> Result<Self, CsrParseError> {
        let block = ::pem::parse(request).map_err(|e| CsrParseError::Pem(e.to_string()))?;
        if block.tag() != PEM_TAG_CERTIFICATE_REQUEST {
            return Err(CsrParseError::WrongBlock(block.tag().to_string()));
        }
        let der = block.contents().to_vec();

        let common_name = {
            let (_, req) = X509CertificationRequest::from_der(&der)
                .map_err(|e| CsrParseError::Der(e.to_string()))?;
            req.verify_signature()
                .map_err(|e| CsrParseError::Signature(e.to_string()))?;
            let common_name = req
                .certification_request_info
                .subject
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .unwrap_or("")
                .to_string();
            common_name
        };

        let pem = ::pem::encode(&block);
        // The signer rebuilds the request with rcgen; anything it refuses is
        // a property of the request and must fail here, not at signing time.
        rcgen::CertificateSigningRequestParams::from_pem(&pem)
            .map_err(|e| CsrParseError::Unsupported(e.to_string()))?;

        Ok(Self {
            pem,
            der,
            common_name,
        })
    }

    /// The request re-encoded as PEM
    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// The raw DER bytes of the request
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Subject common name, empty if the request has none
    pub fn common_name(&self) -> &str {
        &self.common_name
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use k8s_openapi::ByteString;

    const SIGNER: &str = "example.com/foo";

    #[test]
    fn empty_signer_name_is_absent() {
        let csr = pending("a", "");
        assert_eq!(signer_name(&csr), None);
        assert_eq!(signer_name(&pending("a", SIGNER)), Some(SIGNER));
    }

    #[test]
    fn approval_requires_approved_condition() {
        assert!(!is_approved(&pending("a", SIGNER)));
        assert!(is_approved(&approved("a", SIGNER)));
    }

    /// Story: an approver that both approves and denies has not approved
    #[test]
    fn story_denied_wins_over_approved() {
        let csr = with_conditions(
            pending("a", SIGNER),
            &[CONDITION_APPROVED, CONDITION_DENIED],
        );
        assert!(is_denied(&csr));
        assert!(!is_approved(&csr));
    }

    #[test]
    fn approved_with_non_true_status_is_not_approved() {
        let mut csr = approved("a", SIGNER);
        if let Some(conds) = csr.status.as_mut().and_then(|s| s.conditions.as_mut()) {
            conds[0].status = "False".to_string();
        }
        assert!(!is_approved(&csr));
    }

    #[test]
    fn unrelated_conditions_do_not_approve() {
        let csr = with_conditions(pending("a", SIGNER), &["Failed"]);
        assert!(!is_approved(&csr));
        assert!(!is_denied(&csr));
    }

    #[test]
    fn empty_certificate_does_not_count_as_signed() {
        let mut csr = approved("a", SIGNER);
        assert!(!has_certificate(&csr));
        csr.status.as_mut().unwrap().certificate = Some(ByteString(Vec::new()));
        assert!(!has_certificate(&csr));
        assert!(has_certificate(&signed(csr)));
    }

    #[test]
    fn deletion_timestamp_is_detected() {
        assert!(!is_deleted(&pending("a", SIGNER)));
        assert!(is_deleted(&deleting(pending("a", SIGNER))));
    }

    #[test]
    fn usages_default_to_empty() {
        let mut csr = pending("a", SIGNER);
        assert_eq!(usages(&csr).len(), 2);
        csr.spec.usages = None;
        assert!(usages(&csr).is_empty());
    }

    #[test]
    fn well_formed_request_parses() {
        let pem = csr_pem("workload-a");
        let parsed = ParsedCsr::parse(pem.as_bytes()).expect("request should parse");
        assert_eq!(parsed.common_name(), "workload-a");
        assert!(parsed.pem().contains("BEGIN CERTIFICATE REQUEST"));
        assert!(!parsed.der().is_empty());
    }

    #[test]
    fn garbage_is_rejected_as_pem_error() {
        let err = ParsedCsr::parse(b"not a csr").unwrap_err();
        assert!(matches!(err, CsrParseError::Pem(_)));
    }

    #[test]
    fn certificate_block_is_rejected() {
        let pem = ::pem::encode(&::pem::Pem::new("CERTIFICATE", vec![1, 2, 3]));
        let err = ParsedCsr::parse(pem.as_bytes()).unwrap_err();
        assert_eq!(err, CsrParseError::WrongBlock("CERTIFICATE".to_string()));
    }

    #[test]
    fn truncated_der_is_rejected() {
        let pem = ::pem::encode(&::pem::Pem::new(PEM_TAG_CERTIFICATE_REQUEST, vec![0x30, 0x03]));
        let err = ParsedCsr::parse(pem.as_bytes()).unwrap_err();
        assert!(matches!(err, CsrParseError::Der(_)));
    }

    /// Story: openssl-style requests carrying a subjectKeyIdentifier are
    /// well-formed PKCS#10, but cannot be issued from, so they are refused
    /// at parse time rather than at signing time
    #[test]
    fn story_request_with_unissuable_extension_is_unsupported() {
        let pem = csr_pem_with_subject_key_id("workload-a");
        let block = ::pem::parse(pem.as_bytes()).unwrap();
        let (_, req) = X509CertificationRequest::from_der(block.contents()).unwrap();
        req.verify_signature().expect("self-signature is valid");

        let err = ParsedCsr::parse(pem.as_bytes()).unwrap_err();
        assert!(matches!(err, CsrParseError::Unsupported(_)));
        assert!(err.to_string().contains("not supported"));
    }

    /// Story: a request whose body was tampered with after signing is refused
    #[test]
    fn story_tampered_request_fails_signature_check() {
        let pem = csr_pem("workload-a");
        let block = ::pem::parse(pem.as_bytes()).unwrap();
        let mut der = block.contents().to_vec();
        // Flip a byte inside the subject, well before the signature
        let idx = der
            .windows(b"workload-a".len())
            .position(|w| w == b"workload-a")
            .expect("CN should be present in DER");
        der[idx] ^= 0x01;
        let tampered = ::pem::encode(&::pem::Pem::new(PEM_TAG_CERTIFICATE_REQUEST, der));

        let err = ParsedCsr::parse(tampered.as_bytes()).unwrap_err();
        assert!(matches!(err, CsrParseError::Signature(_)));
    }
}
