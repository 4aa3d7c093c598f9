//! PKI operations for signing CertificateSigningRequests
//!
//! This module owns the long-lived CA key pair and turns verified PKCS#10
//! requests into signed leaf certificates.
//!
//! # Security Model
//!
//! - The CA certificate and key are loaded once at startup and never change
//! - Requesters generate their own key pairs; only the public key arrives here
//! - Subject and SANs are taken from the request; everything that grants
//!   authority (basic constraints, key usages, validity) is set by the CA
//! - Issued certificates are never CAs, whatever the request asks for
//!
//! # Validity
//!
//! `not_before` is backdated by [`CLOCK_SKEW_ALLOWANCE_SECS`] so that clients
//! with slightly slow clocks accept fresh certificates. `not_after` is
//! capped at the CA's own expiry.

mod usages;

use std::path::Path;
use std::time::Duration;

use rand::Rng;
use rcgen::{
    CertificateParams, CertificateSigningRequestParams, DistinguishedName, DnType, DnValue,
    IsCa, Issuer, KeyPair, SerialNumber,
};
use thiserror::Error;
use x509_parser::prelude::*;

#[cfg(test)]
use mockall::automock;

use crate::csr::ParsedCsr;

pub use usages::{resolve as resolve_usages, ResolvedUsages};

/// Backdate applied to `not_before` of issued certificates
pub const CLOCK_SKEW_ALLOWANCE_SECS: i64 = 5 * 60;

/// Rotation threshold as a fraction of TTL (80%)
///
/// Past this point the CA still signs, but startup logs a warning.
pub const ROTATION_THRESHOLD: f64 = 0.80;

/// Compute the validity window for a new leaf certificate
///
/// Returns (not_before, not_after). `not_after` never exceeds `ca_not_after`.
fn compute_validity(
    duration: Duration,
    ca_not_after: ::time::OffsetDateTime,
) -> Result<(::time::OffsetDateTime, ::time::OffsetDateTime)> {
    let now = ::time::OffsetDateTime::now_utc();
    let not_before = now - ::time::Duration::seconds(CLOCK_SKEW_ALLOWANCE_SECS);
    let requested = offset_by(now, duration)?;
    Ok((not_before, requested.min(ca_not_after)))
}

/// `start + duration`, or an error when the result is not a representable date
fn offset_by(start: ::time::OffsetDateTime, duration: Duration) -> Result<::time::OffsetDateTime> {
    i64::try_from(duration.as_secs())
        .ok()
        .and_then(|secs| start.checked_add(::time::Duration::seconds(secs)))
        .ok_or_else(|| {
            PkiError::InvalidValidity(format!(
                "{}s from {} is out of range",
                duration.as_secs(),
                start
            ))
        })
}

fn unix_now() -> i64 {
    ::time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Information about a certificate's validity
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
}

impl CertificateInfo {
    /// Parse certificate info from PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
        })
    }

    /// Total lifetime of the certificate in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }

    /// Seconds remaining until certificate expires
    pub fn remaining_secs(&self) -> i64 {
        self.not_after - unix_now()
    }

    /// Check if certificate has expired
    pub fn is_expired(&self) -> bool {
        self.remaining_secs() <= 0
    }

    /// Check if certificate is past 80% of its lifetime
    pub fn needs_rotation(&self) -> bool {
        let lifetime = self.lifetime_secs() as f64;
        let age = (unix_now() - self.not_before) as f64;
        lifetime <= 0.0 || age / lifetime >= ROTATION_THRESHOLD
    }

    fn not_after_time(&self) -> Result<::time::OffsetDateTime> {
        ::time::OffsetDateTime::from_unix_timestamp(self.not_after)
            .map_err(|e| PkiError::ParseError(format!("CA expiry out of range: {}", e)))
    }
}

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// The CA certificate has expired and cannot issue
    #[error("CA certificate expired")]
    CaExpired,

    /// The CA key does not belong to the CA certificate
    #[error("CA key does not match CA certificate: {0}")]
    KeyMismatch(String),

    /// Invalid CSR
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// A requested usage is outside the supported vocabulary
    #[error("unsupported key usage '{0}'")]
    UnsupportedUsage(String),

    /// A validity period that does not produce a representable expiry
    #[error("invalid validity period: {0}")]
    InvalidValidity(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Check that `cert_der` carries a valid signature from the CA in `ca_cert_pem`
pub fn is_issued_by(cert_der: &[u8], ca_cert_pem: &str) -> Result<bool> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

    let ca_cert_der = parse_pem(ca_cert_pem)?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

    Ok(cert.verify_signature(Some(ca_cert.public_key())).is_ok())
}

/// The external signer seam called by the sign-and-persist coordinator
///
/// Implementations are synchronous and may be CPU-bound; the coordinator
/// runs them on a blocking thread under a timeout.
#[cfg_attr(test, automock)]
pub trait CsrSigner: Send + Sync {
    /// Sign a verified request with the given Kubernetes usage strings
    ///
    /// Returns the PEM-encoded certificate.
    fn sign(&self, csr: &ParsedCsr, usages: &[String]) -> Result<Vec<u8>>;
}

/// Certificate Authority backed by a CA certificate and private key
#[derive(Clone)]
pub struct CertificateAuthority {
    /// CA key pair serialized as PEM (we need to deserialize each time since KeyPair isn't Clone)
    ca_key_pem: String,
    /// PEM-encoded CA certificate
    ca_cert_pem: String,
    /// Parsed validity of the CA certificate
    info: CertificateInfo,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("common_name", &self.info.common_name)
            .field("not_after", &self.info.not_after)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Generate a new self-signed CA valid for `validity`
    ///
    /// Returns the CA; persist it with [`Self::ca_cert_pem`] and
    /// [`Self::ca_key_pem`].
    pub fn generate(common_name: &str, validity: Duration) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
            rcgen::KeyUsagePurpose::DigitalSignature,
        ];

        let now = ::time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = offset_by(now, validity)?;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Self::from_pem(&cert.pem(), &key_pair.serialize_pem())
    }

    /// Load CA from PEM strings
    ///
    /// Fails if either input does not parse, or if the key cannot produce
    /// signatures that verify against the certificate.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let info = CertificateInfo::from_pem(cert_pem)?;
        let ca = Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
            info,
        };
        ca.check_key_matches()?;
        Ok(ca)
    }

    /// Load CA from certificate and key files
    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Get the CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Get the CA private key in PEM format
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Get certificate info (validity period, etc.)
    pub fn cert_info(&self) -> &CertificateInfo {
        &self.info
    }

    /// Load the key pair from stored PEM
    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Sign a throwaway leaf and verify it against the CA certificate
    fn check_key_matches(&self) -> Result<()> {
        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let probe_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate probe key: {}", e))
        })?;
        let probe = CertificateParams::default()
            .signed_by(&probe_key, &issuer)
            .map_err(|e| PkiError::KeyMismatch(e.to_string()))?;

        if is_issued_by(probe.der(), &self.ca_cert_pem)? {
            Ok(())
        } else {
            Err(PkiError::KeyMismatch(
                "probe signature does not verify against CA certificate".to_string(),
            ))
        }
    }

    /// Sign a verified CSR and return the certificate in PEM format
    ///
    /// Subject and subject alternative names come from the request. Basic
    /// constraints, key usages, serial number and validity are always set
    /// here, overriding anything the request carried.
    pub fn sign_csr(
        &self,
        csr: &ParsedCsr,
        usages: &[String],
        duration: Duration,
    ) -> Result<String> {
        if self.info.is_expired() {
            return Err(PkiError::CaExpired);
        }

        let resolved = resolve_usages(usages)?;

        let mut csr_params = CertificateSigningRequestParams::from_pem(csr.pem())
            .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {}", e)))?;

        csr_params.params.is_ca = IsCa::ExplicitNoCa;
        csr_params.params.key_usages = resolved.key_usages;
        csr_params.params.extended_key_usages = resolved.extended_key_usages;
        csr_params.params.custom_extensions.clear();
        csr_params.params.use_authority_key_identifier_extension = true;
        csr_params.params.serial_number = Some(random_serial());

        let (not_before, not_after) = compute_validity(duration, self.info.not_after_time()?)?;
        csr_params.params.not_before = not_before;
        csr_params.params.not_after = not_after;

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let signed_cert = csr_params.signed_by(&issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
        })?;

        Ok(signed_cert.pem())
    }
}

/// Positive 128-bit random serial (RFC 5280 §4.1.2.2 allows up to 20 octets)
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    bytes[0] &= 0x7f;
    // A leading zero octet would be stripped by DER encoding
    bytes[0] |= 0x01;
    SerialNumber::from(bytes.to_vec())
}

/// [`CsrSigner`] that issues certificates of a fixed duration from a CA
pub struct CaSigner {
    ca: CertificateAuthority,
    duration: Duration,
}

impl CaSigner {
    /// Bind a CA to the certificate duration configured at startup
    pub fn new(ca: CertificateAuthority, duration: Duration) -> Self {
        Self { ca, duration }
    }

    /// The CA this signer issues from
    pub fn ca(&self) -> &CertificateAuthority {
        &self.ca
    }
}

impl CsrSigner for CaSigner {
    fn sign(&self, csr: &ParsedCsr, usages: &[String]) -> Result<Vec<u8>> {
        self.ca
            .sign_csr(csr, usages, self.duration)
            .map(String::into_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::fixtures::csr_pem;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn test_ca() -> CertificateAuthority {
        CertificateAuthority::generate("signer-ca test CA", 365 * DAY)
            .expect("CA creation should succeed")
    }

    fn parsed(cn: &str) -> ParsedCsr {
        ParsedCsr::parse(csr_pem(cn).as_bytes()).expect("fixture CSR should parse")
    }

    fn usages(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn der_of(pem: &str) -> Vec<u8> {
        parse_pem(pem).expect("PEM should parse")
    }

    #[test]
    fn ca_can_be_generated() {
        let ca = test_ca();
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));
        assert_eq!(ca.cert_info().common_name, "signer-ca test CA");
        assert!(!ca.cert_info().is_expired());
        assert!(!ca.cert_info().needs_rotation());
    }

    #[test]
    fn ca_can_be_saved_and_loaded() {
        let ca = test_ca();
        let loaded = CertificateAuthority::from_pem(ca.ca_cert_pem(), ca.ca_key_pem())
            .expect("CA should load from its own PEM");
        assert_eq!(loaded.ca_cert_pem(), ca.ca_cert_pem());
    }

    #[test]
    fn ca_loads_from_files() {
        let ca = test_ca();
        let dir = std::env::temp_dir().join(format!("signer-ca-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert_path = dir.join("ca.pem");
        let key_path = dir.join("ca-key.pem");
        std::fs::write(&cert_path, ca.ca_cert_pem()).unwrap();
        std::fs::write(&key_path, ca.ca_key_pem()).unwrap();

        let loaded = CertificateAuthority::from_files(&cert_path, &key_path)
            .expect("CA should load from files");
        assert_eq!(loaded.cert_info().common_name, "signer-ca test CA");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_files_surface_io_error() {
        let err = CertificateAuthority::from_files(
            Path::new("/nonexistent/ca.pem"),
            Path::new("/nonexistent/ca-key.pem"),
        )
        .unwrap_err();
        assert!(matches!(err, PkiError::Io(_)));
    }

    /// Story: an operator mounts the wrong key next to the CA certificate
    #[test]
    fn story_mismatched_key_is_rejected_at_startup() {
        let ca = test_ca();
        let other = test_ca();
        let err = CertificateAuthority::from_pem(ca.ca_cert_pem(), other.ca_key_pem())
            .expect_err("mismatched key must be rejected");
        assert!(matches!(err, PkiError::KeyMismatch(_)));
    }

    #[test]
    fn corrupted_ca_is_rejected() {
        let ca = test_ca();
        assert!(CertificateAuthority::from_pem("garbage", ca.ca_key_pem()).is_err());
        assert!(CertificateAuthority::from_pem(ca.ca_cert_pem(), "garbage").is_err());
    }

    /// Story: a signed certificate is a non-CA leaf, chained to our CA, with
    /// the requester's identity and exactly the usages that were asked for
    #[test]
    fn story_signed_certificate_shape() {
        let ca = test_ca();
        let pem = ca
            .sign_csr(
                &parsed("workload-a"),
                &usages(&["digital signature", "key encipherment", "client auth"]),
                DAY,
            )
            .expect("signing should succeed");
        let der = der_of(&pem);

        assert!(is_issued_by(&der, ca.ca_cert_pem()).unwrap());

        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok());
        assert_eq!(cn, Some("workload-a"));

        let bc = cert.basic_constraints().unwrap().expect("basic constraints");
        assert!(!bc.value.ca);

        let ku = cert.key_usage().unwrap().expect("key usage");
        assert!(ku.value.digital_signature());
        assert!(ku.value.key_encipherment());
        assert!(!ku.value.key_cert_sign());

        let eku = cert.extended_key_usage().unwrap().expect("extended key usage");
        assert!(eku.value.client_auth);
        assert!(!eku.value.server_auth);

        let san = cert
            .subject_alternative_name()
            .unwrap()
            .expect("SANs from request");
        assert!(san
            .value
            .general_names
            .iter()
            .any(|n| matches!(n, GeneralName::DNSName("workload-a.example.com"))));
    }

    #[test]
    fn validity_is_backdated_and_bounded_by_duration() {
        let ca = test_ca();
        let pem = ca
            .sign_csr(&parsed("a"), &usages(&["client auth"]), Duration::from_secs(3600))
            .unwrap();
        let info = CertificateInfo::from_pem(&pem).unwrap();

        let now = unix_now();
        assert!(info.not_before <= now - CLOCK_SKEW_ALLOWANCE_SECS + 5);
        assert!(info.not_after <= now + 3600 + 5);
        assert!(info.not_after >= now + 3600 - 5);
    }

    /// Story: a leaf never outlives the CA that issued it
    #[test]
    fn story_validity_is_capped_at_ca_expiry() {
        let ca = CertificateAuthority::generate("short-lived CA", DAY).unwrap();
        let pem = ca
            .sign_csr(&parsed("a"), &usages(&["client auth"]), 30 * DAY)
            .unwrap();
        let info = CertificateInfo::from_pem(&pem).unwrap();
        assert!(info.not_after <= ca.cert_info().not_after);
    }

    #[rstest::rstest]
    #[case::hundred_billion_hours(Duration::from_secs(100_000_000_000 * 3600))]
    #[case::u64_max_seconds(Duration::from_secs(u64::MAX))]
    fn unrepresentable_duration_is_an_error_not_a_panic(#[case] duration: Duration) {
        let ca = test_ca();
        let err = ca
            .sign_csr(&parsed("a"), &usages(&["client auth"]), duration)
            .unwrap_err();
        assert!(matches!(err, PkiError::InvalidValidity(_)));

        let err = compute_validity(duration, ::time::OffsetDateTime::now_utc()).unwrap_err();
        assert!(matches!(err, PkiError::InvalidValidity(_)));
    }

    #[rstest::rstest]
    #[case::hundred_billion_hours(Duration::from_secs(100_000_000_000 * 3600))]
    #[case::u64_max_seconds(Duration::from_secs(u64::MAX))]
    fn unrepresentable_ca_validity_is_rejected(#[case] validity: Duration) {
        let err = CertificateAuthority::generate("too long", validity).unwrap_err();
        assert!(matches!(err, PkiError::InvalidValidity(_)));
    }

    #[test]
    fn serial_numbers_are_unique() {
        let ca = test_ca();
        let a = der_of(&ca.sign_csr(&parsed("a"), &[], DAY).unwrap());
        let b = der_of(&ca.sign_csr(&parsed("a"), &[], DAY).unwrap());
        let (_, a) = X509Certificate::from_der(&a).unwrap();
        let (_, b) = X509Certificate::from_der(&b).unwrap();
        assert_ne!(a.raw_serial(), b.raw_serial());
    }

    #[test]
    fn unknown_usage_fails_signing() {
        let ca = test_ca();
        let err = ca
            .sign_csr(&parsed("a"), &usages(&["client auth", "bogus"]), DAY)
            .unwrap_err();
        assert!(matches!(err, PkiError::UnsupportedUsage(_)));
    }

    #[test]
    fn certificate_from_other_ca_is_not_issued_by_us() {
        let ca = test_ca();
        let other = test_ca();
        let pem = other.sign_csr(&parsed("a"), &[], DAY).unwrap();
        assert!(!is_issued_by(&der_of(&pem), ca.ca_cert_pem()).unwrap());
    }

    #[test]
    fn ca_signer_uses_configured_duration() {
        let signer = CaSigner::new(test_ca(), 2 * DAY);
        let bytes = signer
            .sign(&parsed("a"), &usages(&["server auth"]))
            .expect("signing should succeed");
        let pem = std::str::from_utf8(&bytes).unwrap();
        let info = CertificateInfo::from_pem(pem).unwrap();
        // Two days plus the backdate
        assert!((info.lifetime_secs() - (2 * 86400 + CLOCK_SKEW_ALLOWANCE_SECS)).abs() <= 5);
        assert!(is_issued_by(&der_of(pem), signer.ca().ca_cert_pem()).unwrap());
    }

    #[test]
    fn rotation_threshold_for_fresh_and_stale_info() {
        let now = unix_now();
        let fresh = CertificateInfo {
            not_before: now,
            not_after: now + 1000,
            common_name: "ca".into(),
        };
        assert!(!fresh.needs_rotation());

        let stale = CertificateInfo {
            not_before: now - 900,
            not_after: now + 100,
            common_name: "ca".into(),
        };
        assert!(stale.needs_rotation());
        assert!(!stale.is_expired());
    }
}
